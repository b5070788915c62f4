//! RHI-specific error types.

use thiserror::Error;

/// RHI-specific error type.
#[derive(Error, Debug)]
pub enum RhiError {
    /// Vulkan API error
    #[error("Vulkan error: {0}")]
    VulkanError(#[from] ash::vk::Result),

    /// Failed to load Vulkan
    #[error("Failed to load Vulkan: {0}")]
    LoadingError(#[from] ash::LoadingError),

    /// GPU allocation failure, including out of device memory
    #[error("Allocator error: {0}")]
    AllocatorError(#[from] gpu_allocator::AllocationError),

    /// No physical device supports ray tracing and presentation
    #[error("No suitable GPU found")]
    NoSuitableGpu,

    /// Shader module loading error
    #[error("Shader error: {0}")]
    ShaderError(String),

    /// Surface creation error
    #[error("Surface error: {0}")]
    SurfaceError(String),

    /// Swapchain error
    #[error("Swapchain error: {0}")]
    SwapchainError(String),

    /// Invalid handle or poisoned shared state
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    /// Pipeline creation error
    #[error("Pipeline error: {0}")]
    PipelineError(String),

    /// Bottom- or top-level acceleration structure build failure
    #[error("Acceleration structure build failed: {0}")]
    AccelerationBuildError(String),

    /// Shader group handles could not be retrieved or laid out
    #[error("Shader binding table error: {0}")]
    ShaderBindingTableError(String),

    /// A layout transition has no entry in the barrier table
    #[error("Barrier error: {0}")]
    BarrierError(String),

    /// An arena handle refers to a removed or reused slot
    #[error("Stale handle: slot {index} generation {generation}")]
    StaleHandle { index: u32, generation: u32 },

    /// Readback of a captured frame failed
    #[error("Capture error: {0}")]
    CaptureError(String),
}

/// Result type alias for RHI operations.
pub type RhiResult<T> = std::result::Result<T, RhiError>;

impl<T> From<std::sync::PoisonError<T>> for RhiError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        RhiError::InvalidHandle(format!("lock poisoned: {err}"))
    }
}
