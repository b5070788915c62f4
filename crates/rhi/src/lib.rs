//! Vulkan abstraction layer for the ray tracing renderer.
//!
//! This crate wraps `ash` and `gpu-allocator`. It handles:
//! - Instance, physical device selection and device creation with explicit
//!   queue allocation
//! - Buffers, storage images and the generation-checked resource arena
//! - Command recording, descriptors, shaders and pipelines
//! - Bottom and top level acceleration structures and the shader binding table
//! - The resource-state barrier table
//! - Swapchain and synchronization primitives

mod error;

pub mod accel;
pub mod arena;
pub mod barrier;
pub mod buffer;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod image;
pub mod instance;
pub mod physical_device;
pub mod pipeline;
pub mod queue;
pub mod sbt;
pub mod shader;
pub mod swapchain;
pub mod sync;

pub use error::{RhiError, RhiResult};

pub use ash::vk;
