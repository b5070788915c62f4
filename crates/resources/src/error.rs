//! Error types for scene inputs and snapshots.

use std::path::PathBuf;
use thiserror::Error;

/// Error type for resource operations.
#[derive(Error, Debug)]
pub enum ResourceError {
    /// The light list is not valid JSON or misses a field.
    #[error("Failed to parse light list: {0}")]
    LightList(#[from] serde_json::Error),

    /// A light has a degenerate extent.
    #[error("Light {index} is invalid: {message}")]
    InvalidLight { index: usize, message: String },

    /// A mesh record breaks a geometry invariant.
    #[error("Mesh {index} is invalid: {message}")]
    InvalidMesh { index: usize, message: String },

    /// Texture dimensions and pixel data disagree.
    #[error("Texture is invalid: {0}")]
    InvalidTexture(String),

    /// A snapshot request does not describe its pixel data.
    #[error("Snapshot rejected: {0}")]
    Snapshot(String),

    #[error("IO error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

/// Result type alias for resource operations.
pub type ResourceResult<T> = Result<T, ResourceError>;
