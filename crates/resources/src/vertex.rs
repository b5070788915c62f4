//! Mesh vertex layout shared with the closest-hit shader.

use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3};

/// Vertex as read from the per-mesh storage buffers (binding 4).
///
/// The BLAS reads `position` as `R32G32B32_SFLOAT` with a stride of
/// `size_of::<Vertex>()`.
///
/// # Memory Layout (scalar)
///
/// | Offset | Size | Field |
/// |--------|------|-------|
/// | 0      | 12   | position |
/// | 12     | 12   | normal |
/// | 24     | 8    | tex_coord |
/// | 32     | 12   | tangent |
/// | 44     | 12   | bitangent |
///
/// Total size: 56 bytes
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: Vec3,
    pub normal: Vec3,
    pub tex_coord: Vec2,
    pub tangent: Vec3,
    pub bitangent: Vec3,
}

impl Vertex {
    /// Vertex with an orthonormal tangent frame derived from `normal`.
    pub fn new(position: Vec3, normal: Vec3, tex_coord: Vec2) -> Self {
        let normal = normal.normalize_or_zero();
        let (tangent, bitangent) = if normal == Vec3::ZERO {
            (Vec3::ZERO, Vec3::ZERO)
        } else {
            normal.any_orthonormal_pair()
        };
        Self {
            position,
            normal,
            tex_coord,
            tangent,
            bitangent,
        }
    }

    #[inline]
    pub const fn stride() -> u64 {
        std::mem::size_of::<Self>() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{offset_of, size_of};

    #[test]
    fn test_vertex_layout() {
        assert_eq!(size_of::<Vertex>(), 56);
        assert_eq!(Vertex::stride(), 56);
        assert_eq!(offset_of!(Vertex, position), 0);
        assert_eq!(offset_of!(Vertex, normal), 12);
        assert_eq!(offset_of!(Vertex, tex_coord), 24);
        assert_eq!(offset_of!(Vertex, tangent), 32);
        assert_eq!(offset_of!(Vertex, bitangent), 44);
    }

    #[test]
    fn test_tangent_frame_is_orthonormal() {
        let v = Vertex::new(Vec3::ZERO, Vec3::new(0.0, 2.0, 0.0), Vec2::ZERO);
        assert!((v.normal.length() - 1.0).abs() < 1e-6);
        assert!(v.normal.dot(v.tangent).abs() < 1e-6);
        assert!(v.normal.dot(v.bitangent).abs() < 1e-6);
        assert!(v.tangent.dot(v.bitangent).abs() < 1e-6);
    }

    #[test]
    fn test_zero_normal_stays_finite() {
        let v = Vertex::new(Vec3::ONE, Vec3::ZERO, Vec2::ZERO);
        assert_eq!(v.normal, Vec3::ZERO);
        assert_eq!(v.tangent, Vec3::ZERO);
    }
}
