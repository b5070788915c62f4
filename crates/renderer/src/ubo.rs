//! Uniform buffer layouts shared with the GLSL passes.
//!
//! Every struct is `#[repr(C)]`, `Pod` and padded to a multiple of 16 bytes
//! so the std140 view in the shaders lines up field for field.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};

/// Camera and sampling state (binding 2).
///
/// # Memory Layout
///
/// - Offset 0: inverse view matrix (64 bytes)
/// - Offset 64: inverse projection matrix (64 bytes)
/// - Offset 128: frame index (4 bytes)
/// - Offset 132: samples per pixel (4 bytes)
/// - Offset 136: padding (8 bytes)
/// - Total size: 144 bytes
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct FrameUniform {
    pub view_inverse: Mat4,
    pub proj_inverse: Mat4,
    /// Seeds the per-pixel random sequence.
    pub frame_index: u32,
    pub samples: u32,
    pub _padding: [u32; 2],
}

impl FrameUniform {
    pub const SIZE: usize = std::mem::size_of::<Self>();

    pub fn new(view_inverse: Mat4, proj_inverse: Mat4, frame_index: u32, samples: u32) -> Self {
        Self {
            view_inverse,
            proj_inverse,
            frame_index,
            samples,
            _padding: [0; 2],
        }
    }
}

/// Scene sizing (binding 8). Light pads follow the meshes in the per-mesh
/// arrays, so `mesh_count` here excludes them.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SceneSizes {
    pub mesh_count: u32,
    pub light_count: u32,
    /// Spatial reuse neighbour count.
    pub reservoir_merge: u32,
    pub _padding: u32,
}

impl SceneSizes {
    pub const SIZE: usize = std::mem::size_of::<Self>();

    pub fn new(mesh_count: u32, light_count: u32, reservoir_merge: u32) -> Self {
        Self {
            mesh_count,
            light_count,
            reservoir_merge,
            _padding: 0,
        }
    }
}

/// Temporal reprojection state (binding 14).
///
/// # Memory Layout
///
/// - Offset 0: previous frame's projection * view (64 bytes)
/// - Offset 64: camera position, w unused (16 bytes)
/// - Offset 80: previous camera position, w unused (16 bytes)
/// - Offset 96: frame counter (4 bytes) + padding (12 bytes)
/// - Total size: 112 bytes
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct MotionUniform {
    pub prev_view_proj: Mat4,
    pub camera_position: Vec4,
    pub prev_camera_position: Vec4,
    /// Zero right after a rebuild, which disables temporal reuse.
    pub frame_counter: u32,
    pub _padding: [u32; 3],
}

impl MotionUniform {
    pub const SIZE: usize = std::mem::size_of::<Self>();

    pub fn new(
        prev_view_proj: Mat4,
        camera_position: Vec3,
        prev_camera_position: Vec3,
        frame_counter: u32,
    ) -> Self {
        Self {
            prev_view_proj,
            camera_position: camera_position.extend(1.0),
            prev_camera_position: prev_camera_position.extend(1.0),
            frame_counter,
            _padding: [0; 3],
        }
    }
}

/// Accumulation pass control (binding 16).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct AccumUniform {
    /// Divisor applied when finalizing.
    pub frames: u32,
    /// Non-zero: overwrite the accumulator instead of adding to it.
    pub reset: u32,
    /// Non-zero: write `sum / frames` back into the render target.
    pub finalize: u32,
    pub _padding: u32,
}

impl AccumUniform {
    pub const SIZE: usize = std::mem::size_of::<Self>();

    pub fn new(frames: u32, reset: bool, finalize: bool) -> Self {
        Self {
            frames,
            reset: reset as u32,
            finalize: finalize as u32,
            _padding: 0,
        }
    }

    #[inline]
    pub fn resets(&self) -> bool {
        self.reset != 0
    }

    #[inline]
    pub fn finalizes(&self) -> bool {
        self.finalize != 0
    }
}

/// Everything written into one slot's uniform buffers before its submit.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FrameUniforms {
    pub frame: FrameUniform,
    pub sizes: SceneSizes,
    pub motion: MotionUniform,
    pub accum: AccumUniform,
}
