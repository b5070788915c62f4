//! Frame execution for the ReSTIR ray tracer.
//!
//! This crate drives the per-frame GPU work:
//! - Scene upload and acceleration structure builds ([`scene_gpu`])
//! - Pipelines, descriptor sets and pre-recorded command buffers
//!   ([`pipelines`], [`targets`])
//! - The frame state machine with three frames in flight and scheduled
//!   capture ([`orchestrator`], [`capture`])
//! - Host models of the reservoir and accumulation passes ([`reservoir`],
//!   [`accumulate`]) that define what the shaders compute

pub mod accumulate;
pub mod backend;
pub mod bindings;
pub mod capture;
pub mod error;
pub mod frame;
pub mod orchestrator;
pub mod pipelines;
pub mod reservoir;
pub mod scene_gpu;
pub mod sink;
pub mod targets;
pub mod ubo;

pub use backend::VulkanBackend;
pub use capture::{CapturePhase, CaptureSchedule};
pub use error::{RendererError, RendererResult};
pub use orchestrator::{FrameBackend, FrameOutcome, FrameSettings, FrameState, Orchestrator};
pub use sink::{DiskSink, SnapshotSink};

/// Frames that may be in flight at once.
pub const SLOT_COUNT: usize = 3;

const _: () = assert!(SLOT_COUNT == restir_rhi::sync::FRAMES_IN_FLIGHT);
