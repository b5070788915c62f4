//! Light descriptors and the quad geometry derived from them.
//!
//! A light list is a JSON document of the form
//!
//! ```json
//! {"Lights": [{"pos": [0, 4, 0], "color": [1, 1, 1], "intensity": 10,
//!              "dims": [1, 1], "rotate": [0, 0, 0]}]}
//! ```
//!
//! with `rotate` given in degrees.

use std::path::Path;

use bytemuck::{Pod, Zeroable};
use glam::{EulerRot, Mat4, Quat, Vec2, Vec3};
use serde::Deserialize;
use tracing::debug;

use crate::error::{ResourceError, ResourceResult};
use crate::material::Material;
use crate::vertex::Vertex;

/// One rectangular area light.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
pub struct LightDescriptor {
    #[serde(rename = "pos")]
    pub position: Vec3,
    pub color: Vec3,
    pub intensity: f32,
    pub dims: Vec2,
    /// Euler angles in degrees.
    #[serde(rename = "rotate", default)]
    pub rotation: Vec3,
}

#[derive(Deserialize)]
struct LightList {
    #[serde(rename = "Lights")]
    lights: Vec<LightDescriptor>,
}

/// Parses a `{"Lights": [...]}` document.
pub fn parse_lights(json: &str) -> ResourceResult<Vec<LightDescriptor>> {
    let list: LightList = serde_json::from_str(json)?;
    for (index, light) in list.lights.iter().enumerate() {
        if light.dims.x <= 0.0 || light.dims.y <= 0.0 {
            return Err(ResourceError::InvalidLight {
                index,
                message: format!("dims must be positive, got {}", light.dims),
            });
        }
    }
    Ok(list.lights)
}

pub fn load_lights(path: &Path) -> ResourceResult<Vec<LightDescriptor>> {
    let json = std::fs::read_to_string(path).map_err(|source| ResourceError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let lights = parse_lights(&json)?;
    debug!("Loaded {} light(s) from {:?}", lights.len(), path);
    Ok(lights)
}

/// Light record in the light storage buffer (binding 7), std430.
///
/// The quad is `a + s * ab + t * ac` for `s, t` in `[0, 1]`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct LightProps {
    pub color: Vec3,
    pub intensity: f32,
    pub normal: Vec3,
    pub _pad0: f32,
    pub a: Vec3,
    pub _pad1: f32,
    pub ab: Vec3,
    pub _pad2: f32,
    pub ac: Vec3,
    pub _pad3: f32,
}

impl LightProps {
    /// Area of the quad, used as the inverse sampling pdf.
    pub fn area(&self) -> f32 {
        self.ab.cross(self.ac).length()
    }
}

/// Quad geometry for one light: its own BLAS input plus the sampling record.
#[derive(Clone, Debug, PartialEq)]
pub struct LightPad {
    pub vertices: [Vertex; 4],
    /// Both windings of both triangles, so the pad is hit from either side.
    pub indices: [u32; 12],
    pub props: LightProps,
}

const PAD_INDICES: [u32; 12] = [0, 1, 2, 1, 2, 3, 0, 2, 1, 1, 3, 2];

impl LightPad {
    pub fn from_descriptor(light: &LightDescriptor) -> Self {
        let half = light.dims * 0.5;
        let corners = [
            Vec3::new(half.x, 0.0, half.y),
            Vec3::new(-half.x, 0.0, half.y),
            Vec3::new(half.x, 0.0, -half.y),
            Vec3::new(-half.x, 0.0, -half.y),
        ];
        let radians = Vec3::new(
            light.rotation.x.to_radians(),
            light.rotation.y.to_radians(),
            light.rotation.z.to_radians(),
        );
        let rotation = Quat::from_euler(EulerRot::ZYX, radians.z, radians.y, radians.x);
        let transform = Mat4::from_rotation_translation(rotation, light.position);

        let positions = corners.map(|c| transform.transform_point3(c));
        let normal = (positions[1] - positions[0])
            .cross(positions[2] - positions[0])
            .normalize_or_zero();

        let tex = [
            Vec2::new(0.0, 0.0),
            Vec2::new(1.0, 0.0),
            Vec2::new(0.0, 1.0),
            Vec2::new(1.0, 1.0),
        ];
        let mut vertices = [Vertex::default(); 4];
        for (i, vertex) in vertices.iter_mut().enumerate() {
            *vertex = Vertex::new(positions[i], normal, tex[i]);
        }

        Self {
            vertices,
            indices: PAD_INDICES,
            props: LightProps {
                color: light.color,
                intensity: light.intensity,
                normal,
                a: positions[0],
                ab: positions[1] - positions[0],
                ac: positions[2] - positions[0],
                ..LightProps::default()
            },
        }
    }

    /// Material written for the pad's mesh slot.
    pub fn material(&self) -> Material {
        Material::emissive(self.props.color, self.props.intensity)
    }
}
