//! Mesh geometry records and the scene handed to the renderer.

use glam::{Vec2, Vec3};

use crate::error::{ResourceError, ResourceResult};
use crate::light::{LightDescriptor, LightPad};
use crate::material::Material;
use crate::texture::TextureRecord;
use crate::vertex::Vertex;

/// One mesh as produced by the scene loader. Immutable after load.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MeshRecord {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub material: Material,
    /// Diffuse maps. The renderer samples the first one.
    pub diffuse: Vec<TextureRecord>,
}

impl MeshRecord {
    #[inline]
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Attaches a diffuse map and keeps the material's map count in step.
    pub fn with_diffuse(mut self, texture: TextureRecord) -> Self {
        self.diffuse.push(texture);
        self.material.diffuse_map_count = self.diffuse.len() as i32;
        self
    }

    #[inline]
    pub fn is_textured(&self) -> bool {
        !self.diffuse.is_empty()
    }

    /// Checks the invariants the BLAS builder relies on.
    pub fn validate(&self, index: usize) -> ResourceResult<()> {
        let fail = |message: String| ResourceError::InvalidMesh { index, message };
        if self.indices.is_empty() {
            return Err(fail("mesh has no indices".to_string()));
        }
        if self.indices.len() % 3 != 0 {
            return Err(fail(format!(
                "index count {} is not a multiple of 3",
                self.indices.len()
            )));
        }
        if let Some(&bad) = self
            .indices
            .iter()
            .find(|&&i| i as usize >= self.vertices.len())
        {
            return Err(fail(format!(
                "index {bad} out of range for {} vertices",
                self.vertices.len()
            )));
        }
        if self.material.diffuse_map_count != self.diffuse.len() as i32 {
            return Err(fail(format!(
                "material lists {} diffuse maps, mesh has {}",
                self.material.diffuse_map_count,
                self.diffuse.len()
            )));
        }
        Ok(())
    }

    /// Axis-aligned quad facing `normal`, spanned by `u` and `v` around `center`.
    pub fn quad(center: Vec3, u: Vec3, v: Vec3, material: Material) -> Self {
        let normal = u.cross(v).normalize_or_zero();
        let corners = [
            (center - u - v, Vec2::new(0.0, 0.0)),
            (center + u - v, Vec2::new(1.0, 0.0)),
            (center + u + v, Vec2::new(1.0, 1.0)),
            (center - u + v, Vec2::new(0.0, 1.0)),
        ];
        Self {
            vertices: corners
                .iter()
                .map(|&(p, t)| Vertex::new(p, normal, t))
                .collect(),
            indices: vec![0, 1, 2, 0, 2, 3],
            material,
            diffuse: Vec::new(),
        }
    }

    /// Box with outward-facing, unshared faces.
    pub fn cuboid(center: Vec3, half: Vec3, material: Material) -> Self {
        let faces = [
            (Vec3::X, Vec3::Z, Vec3::Y),
            (Vec3::NEG_X, Vec3::Y, Vec3::Z),
            (Vec3::Y, Vec3::X, Vec3::Z),
            (Vec3::NEG_Y, Vec3::Z, Vec3::X),
            (Vec3::Z, Vec3::Y, Vec3::X),
            (Vec3::NEG_Z, Vec3::X, Vec3::Y),
        ];
        let mut mesh = MeshRecord {
            material,
            ..Default::default()
        };
        for (dir, a, b) in faces {
            // u x v must point along dir
            let (u, v) = if a.cross(b).dot(dir) > 0.0 { (a, b) } else { (b, a) };
            let face = Self::quad(center + dir * half, u * half, v * half, material);
            let base = mesh.vertices.len() as u32;
            mesh.vertices.extend(face.vertices);
            mesh.indices.extend(face.indices.iter().map(|i| base + i));
        }
        mesh
    }
}

/// Meshes plus light descriptors.
#[derive(Clone, Debug, Default)]
pub struct Scene {
    pub meshes: Vec<MeshRecord>,
    pub lights: Vec<LightDescriptor>,
}

impl Scene {
    pub fn validate(&self) -> ResourceResult<()> {
        for (index, mesh) in self.meshes.iter().enumerate() {
            mesh.validate(index)?;
        }
        Ok(())
    }

    pub fn light_pads(&self) -> Vec<LightPad> {
        self.lights.iter().map(LightPad::from_descriptor).collect()
    }

    /// Checkered floor and a box under one ceiling light.
    pub fn demo() -> Self {
        let floor = MeshRecord::quad(
            Vec3::ZERO,
            Vec3::new(0.0, 0.0, 5.0),
            Vec3::new(5.0, 0.0, 0.0),
            Material::diffuse(Vec3::ONE),
        )
        .with_diffuse(TextureRecord::checker(
            64,
            8,
            [230, 230, 230, 255],
            [90, 90, 90, 255],
        ));
        let block = MeshRecord::cuboid(
            Vec3::new(0.0, 1.0, 0.0),
            Vec3::new(0.75, 1.0, 0.75),
            Material::diffuse(Vec3::new(0.8, 0.3, 0.2)),
        );
        Self {
            meshes: vec![floor, block],
            lights: vec![Self::default_light()],
        }
    }

    pub fn default_light() -> LightDescriptor {
        LightDescriptor {
            position: Vec3::new(0.0, 4.0, 0.0),
            color: Vec3::ONE,
            intensity: 15.0,
            dims: Vec2::new(1.5, 1.5),
            rotation: Vec3::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quad_faces_up() {
        let q = MeshRecord::quad(Vec3::ZERO, Vec3::Z, Vec3::X, Material::default());
        assert_eq!(q.vertices.len(), 4);
        assert_eq!(q.triangle_count(), 2);
        assert_eq!(q.vertices[0].normal, Vec3::Y);
    }

    #[test]
    fn test_cuboid_normals_point_outward() {
        let center = Vec3::new(0.0, 1.0, 0.0);
        let mesh = MeshRecord::cuboid(center, Vec3::ONE, Material::default());
        assert_eq!(mesh.vertices.len(), 24);
        assert_eq!(mesh.triangle_count(), 12);
        for v in &mesh.vertices {
            assert!((v.position - center).dot(v.normal) > 0.0);
        }
        mesh.validate(0).unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_indices() {
        let mut mesh = MeshRecord::quad(Vec3::ZERO, Vec3::Z, Vec3::X, Material::default());
        mesh.indices.push(0);
        assert!(matches!(
            mesh.validate(3),
            Err(ResourceError::InvalidMesh { index: 3, .. })
        ));

        mesh.indices.truncate(6);
        mesh.indices[5] = 9;
        assert!(mesh.validate(0).is_err());

        assert!(MeshRecord::default().validate(0).is_err());
    }

    #[test]
    fn test_demo_scene() {
        let scene = Scene::demo();
        scene.validate().unwrap();
        assert_eq!(scene.meshes.len(), 2);
        assert_eq!(scene.light_pads().len(), 1);
        assert!(scene.meshes[0].is_textured());
        assert!(!scene.meshes[1].is_textured());
    }

    #[test]
    fn test_with_diffuse_tracks_map_count() {
        let tex = TextureRecord::checker(2, 1, [255; 4], [0; 4]);
        let mesh = MeshRecord::quad(Vec3::ZERO, Vec3::Z, Vec3::X, Material::default())
            .with_diffuse(tex.clone());
        assert_eq!(mesh.material.diffuse_map_count, 1);
        mesh.validate(0).unwrap();

        let mut stale = mesh.clone();
        stale.diffuse.push(tex);
        assert!(matches!(
            stale.validate(1),
            Err(ResourceError::InvalidMesh { index: 1, .. })
        ));
    }
}
