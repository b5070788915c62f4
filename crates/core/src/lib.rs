//! Core utilities shared by every crate of the ray-traced renderer.
//!
//! This crate provides:
//! - Error types and result aliases
//! - Logging initialization
//! - Frame timing
//! - Render configuration (`RenderConfig`)

pub mod config;
mod error;
mod logging;
mod timer;

pub use config::{RenderArgs, RenderConfig};
pub use error::{Error, Result};
pub use logging::init_logging;
pub use timer::Timer;
