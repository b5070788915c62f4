//! Material records uploaded to the per-mesh material buffers (binding 6).

use bytemuck::{Pod, Zeroable};
use glam::Vec3;

/// Shading model ids understood by the closest-hit shader.
pub mod shading {
    pub const DIFFUSE: i32 = 0;
    pub const EMISSIVE: i32 = 1;
}

/// GPU material record, std430.
///
/// Each `vec3` is followed by a scalar that fills its 16-byte slot.
///
/// | Offset | Size | Field |
/// |--------|------|-------|
/// | 0      | 12   | ambient |
/// | 12     | 4    | shininess |
/// | 16     | 12   | diffuse |
/// | 28     | 4    | ior |
/// | 32     | 12   | specular |
/// | 44     | 4    | dissolve |
/// | 48     | 12   | emissive |
/// | 60     | 4    | shading_model |
/// | 64     | 12   | transparent |
/// | 76     | 4    | diffuse_map_count |
///
/// Total size: 80 bytes
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Material {
    pub ambient: Vec3,
    pub shininess: f32,
    pub diffuse: Vec3,
    pub ior: f32,
    pub specular: Vec3,
    pub dissolve: f32,
    pub emissive: Vec3,
    pub shading_model: i32,
    pub transparent: Vec3,
    pub diffuse_map_count: i32,
}

impl Default for Material {
    fn default() -> Self {
        Self::diffuse(Vec3::splat(0.8))
    }
}

impl Material {
    /// Opaque lambertian material.
    pub fn diffuse(color: Vec3) -> Self {
        Self {
            ambient: Vec3::ZERO,
            shininess: 0.0,
            diffuse: color,
            ior: 1.0,
            specular: Vec3::ZERO,
            dissolve: 1.0,
            emissive: Vec3::ZERO,
            shading_model: shading::DIFFUSE,
            transparent: Vec3::ZERO,
            diffuse_map_count: 0,
        }
    }

    /// Material assigned to light pads.
    pub fn emissive(color: Vec3, intensity: f32) -> Self {
        Self {
            emissive: color * intensity,
            shading_model: shading::EMISSIVE,
            ..Self::diffuse(Vec3::ZERO)
        }
    }

    #[inline]
    pub fn is_emissive(&self) -> bool {
        self.shading_model == shading::EMISSIVE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{offset_of, size_of};

    #[test]
    fn test_material_std430_layout() {
        assert_eq!(size_of::<Material>(), 80);
        assert_eq!(offset_of!(Material, diffuse), 16);
        assert_eq!(offset_of!(Material, specular), 32);
        assert_eq!(offset_of!(Material, emissive), 48);
        assert_eq!(offset_of!(Material, shading_model), 60);
        assert_eq!(offset_of!(Material, transparent), 64);
        assert_eq!(offset_of!(Material, diffuse_map_count), 76);
    }

    #[test]
    fn test_emissive_scales_color() {
        let m = Material::emissive(Vec3::new(1.0, 0.5, 0.25), 4.0);
        assert!(m.is_emissive());
        assert_eq!(m.emissive, Vec3::new(4.0, 2.0, 1.0));
        assert_eq!(m.diffuse, Vec3::ZERO);
    }

    #[test]
    fn test_bytes_match_size() {
        let m = Material::default();
        assert_eq!(bytemuck::bytes_of(&m).len(), size_of::<Material>());
    }
}
