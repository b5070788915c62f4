//! Scene-side state fed to the renderer every frame.
//!
//! - Camera and first-person controller
//! - TLAS instance planning (custom indices for meshes and light pads)

pub mod camera;
pub mod instances;

pub use camera::{Camera, CameraInput, FpsController};
pub use instances::{InstancePlan, InstanceSource, plan_instances, plan_scene};
