//! Renderer error type.

use thiserror::Error;

use restir_resources::ResourceError;
use restir_rhi::RhiError;

/// Errors surfaced by the frame loop. None of them is recoverable: surface
/// staleness is handled inside the orchestrator and never reaches here.
#[derive(Error, Debug)]
pub enum RendererError {
    /// GPU object creation, submission or synchronization failed
    #[error(transparent)]
    Rhi(#[from] RhiError),

    /// Window or surface setup failed
    #[error(transparent)]
    Platform(#[from] restir_core::Error),

    /// Scene inputs or snapshot writing failed
    #[error(transparent)]
    Resource(#[from] ResourceError),

    /// The scene cannot be traced (no geometry, too many instances)
    #[error("Scene error: {0}")]
    Scene(String),

    /// A frame referenced a slot, image or recording that does not exist
    #[error("Frame error: {0}")]
    Frame(String),
}

pub type RendererResult<T> = std::result::Result<T, RendererError>;
