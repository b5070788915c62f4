//! Scene inputs and the snapshot writer.
//!
//! This crate holds the host-side records the renderer consumes:
//! - Mesh geometry records with their material and diffuse textures
//! - Light descriptors and the light geometry pads derived from them
//! - A procedural demo scene
//! - The screenshot writer used for scheduled captures

mod error;

pub mod light;
pub mod material;
pub mod mesh;
pub mod snapshot;
pub mod texture;
pub mod vertex;

pub use error::{ResourceError, ResourceResult};
pub use light::{LightDescriptor, LightPad, LightProps};
pub use material::Material;
pub use mesh::{MeshRecord, Scene};
pub use snapshot::{SaveWorker, SnapshotRequest};
pub use texture::TextureRecord;
pub use vertex::Vertex;
