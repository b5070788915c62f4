//! Descriptor layout shared by the ray tracing and compute pipelines.
//!
//! | Binding | Contents |
//! |---------|----------|
//! | 0 | top-level acceleration structure |
//! | 1 | render target (storage image) |
//! | 2 | [`FrameUniform`](crate::ubo::FrameUniform) |
//! | 3 | diffuse textures, one slot per geometry, partially bound |
//! | 4, 5, 6 | vertex, index, material buffers, one per mesh then one per light pad |
//! | 7 | light properties |
//! | 8 | [`SceneSizes`](crate::ubo::SceneSizes) |
//! | 9 to 13 | reservoir images: present, past, vpos, vnorm, vmat |
//! | 14 | [`MotionUniform`](crate::ubo::MotionUniform) |
//! | 15 | accumulator (storage image) |
//! | 16 | [`AccumUniform`](crate::ubo::AccumUniform) |
//! | 17 to 19 | history geometry: vpos, vnorm, vmat as of the last spatial pass |
//!
//! The generate pass writes the current group (present, vpos, vnorm, vmat)
//! and only reads the history group (past plus bindings 17 to 19). Spatial
//! reuse reads the current group and writes the history group, so no image
//! is both read at a reprojected texel and stored in the same dispatch.
//!
//! Shader binaries are compiled against exactly this table.

use ash::vk;

use restir_rhi::descriptor::DescriptorBindingBuilder as B;

pub const TLAS: u32 = 0;
pub const OUTPUT_IMAGE: u32 = 1;
pub const CAMERA: u32 = 2;
pub const TEXTURES: u32 = 3;
pub const VERTICES: u32 = 4;
pub const INDICES: u32 = 5;
pub const MATERIALS: u32 = 6;
pub const LIGHTS: u32 = 7;
pub const SIZES: u32 = 8;
pub const RESERVOIR_PRESENT: u32 = 9;
pub const RESERVOIR_PAST: u32 = 10;
pub const RESERVOIR_VPOS: u32 = 11;
pub const RESERVOIR_VNORM: u32 = 12;
pub const RESERVOIR_VMAT: u32 = 13;
pub const MOTION: u32 = 14;
pub const ACCUMULATOR: u32 = 15;
pub const ACCUM_INFO: u32 = 16;
pub const HISTORY_VPOS: u32 = 17;
pub const HISTORY_VNORM: u32 = 18;
pub const HISTORY_VMAT: u32 = 19;

/// Written by the generate pass, read by spatial reuse.
pub const CURRENT_RESERVOIRS: [u32; 4] = [
    RESERVOIR_PRESENT,
    RESERVOIR_VPOS,
    RESERVOIR_VNORM,
    RESERVOIR_VMAT,
];

/// Written by spatial reuse, read by the next generate pass.
pub const HISTORY_RESERVOIRS: [u32; 4] = [RESERVOIR_PAST, HISTORY_VPOS, HISTORY_VNORM, HISTORY_VMAT];

/// Reservoir image bindings in image order: the current group, then the
/// history group.
pub const RESERVOIRS: [u32; 8] = [
    RESERVOIR_PRESENT,
    RESERVOIR_VPOS,
    RESERVOIR_VNORM,
    RESERVOIR_VMAT,
    RESERVOIR_PAST,
    HISTORY_VPOS,
    HISTORY_VNORM,
    HISTORY_VMAT,
];

/// Every stage that reads the shared set.
pub fn all_stages() -> vk::ShaderStageFlags {
    vk::ShaderStageFlags::RAYGEN_KHR
        | vk::ShaderStageFlags::CLOSEST_HIT_KHR
        | vk::ShaderStageFlags::MISS_KHR
        | vk::ShaderStageFlags::COMPUTE
}

/// Layout bindings for `geometry_count` per-geometry entries (meshes plus
/// light pads). The texture array has one slot per geometry so the closest
/// hit shader can index it by geometry. Arrays never have zero length.
pub fn layout_bindings(geometry_count: u32) -> Vec<vk::DescriptorSetLayoutBinding<'static>> {
    let stages = all_stages();
    let geometry_count = geometry_count.max(1);
    let mut bindings = vec![
        B::acceleration_structure(TLAS, stages),
        B::storage_image(OUTPUT_IMAGE, stages),
        B::uniform_buffer(CAMERA, stages),
        B::combined_image_sampler_array(TEXTURES, geometry_count, stages),
        B::storage_buffer_array(VERTICES, geometry_count, stages),
        B::storage_buffer_array(INDICES, geometry_count, stages),
        B::storage_buffer_array(MATERIALS, geometry_count, stages),
        B::storage_buffer(LIGHTS, stages),
        B::uniform_buffer(SIZES, stages),
    ];
    bindings.extend(
        (RESERVOIR_PRESENT..=RESERVOIR_VMAT).map(|b| B::storage_image(b, stages)),
    );
    bindings.push(B::uniform_buffer(MOTION, stages));
    bindings.push(B::storage_image(ACCUMULATOR, stages));
    bindings.push(B::uniform_buffer(ACCUM_INFO, stages));
    bindings.extend(
        [HISTORY_VPOS, HISTORY_VNORM, HISTORY_VMAT].map(|b| B::storage_image(b, stages)),
    );
    bindings
}

/// Per-binding flags matching [`layout_bindings`]: only the texture array
/// may be left partially written.
pub fn binding_flags(bindings: &[vk::DescriptorSetLayoutBinding]) -> Vec<vk::DescriptorBindingFlags> {
    bindings
        .iter()
        .map(|b| {
            if b.binding == TEXTURES {
                vk::DescriptorBindingFlags::PARTIALLY_BOUND
            } else {
                vk::DescriptorBindingFlags::empty()
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use restir_rhi::descriptor::pool_sizes_for;

    #[test]
    fn test_bindings_are_contiguous() {
        let bindings = layout_bindings(3);
        assert_eq!(bindings.len(), 20);
        for (i, b) in bindings.iter().enumerate() {
            assert_eq!(b.binding, i as u32);
            assert!(b.stage_flags.contains(vk::ShaderStageFlags::COMPUTE));
        }
    }

    #[test]
    fn test_per_mesh_arrays_use_geometry_count() {
        let bindings = layout_bindings(3);
        for binding in [TEXTURES, VERTICES, INDICES, MATERIALS] {
            assert_eq!(bindings[binding as usize].descriptor_count, 3);
        }
        assert_eq!(
            bindings[TEXTURES as usize].descriptor_type,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        );
        assert_eq!(layout_bindings(0)[TEXTURES as usize].descriptor_count, 1);
    }

    #[test]
    fn test_reservoir_groups_split_the_images() {
        let mut grouped: Vec<u32> = CURRENT_RESERVOIRS
            .iter()
            .chain(&HISTORY_RESERVOIRS)
            .copied()
            .collect();
        assert_eq!(grouped, RESERVOIRS);
        grouped.sort_unstable();
        grouped.dedup();
        assert_eq!(grouped.len(), RESERVOIRS.len());
    }

    #[test]
    fn test_reservoir_and_accumulator_are_storage_images() {
        let bindings = layout_bindings(1);
        for binding in RESERVOIRS.iter().chain([&OUTPUT_IMAGE, &ACCUMULATOR]) {
            assert_eq!(
                bindings[*binding as usize].descriptor_type,
                vk::DescriptorType::STORAGE_IMAGE
            );
        }
    }

    #[test]
    fn test_only_textures_are_partially_bound() {
        let bindings = layout_bindings(2);
        let flags = binding_flags(&bindings);
        assert_eq!(flags.len(), bindings.len());
        for (b, f) in bindings.iter().zip(&flags) {
            assert_eq!(f.is_empty(), b.binding != TEXTURES);
        }
    }

    #[test]
    fn test_pool_sizes_for_three_slots() {
        let bindings = layout_bindings(3);
        let sizes = pool_sizes_for(&bindings, 3);
        let count = |ty| {
            sizes
                .iter()
                .find(|s| s.ty == ty)
                .map(|s| s.descriptor_count)
                .unwrap_or(0)
        };
        assert_eq!(count(vk::DescriptorType::STORAGE_IMAGE), 10 * 3);
        assert_eq!(count(vk::DescriptorType::COMBINED_IMAGE_SAMPLER), 3 * 3);
        assert_eq!(count(vk::DescriptorType::UNIFORM_BUFFER), 4 * 3);
        assert_eq!(count(vk::DescriptorType::STORAGE_BUFFER), (3 * 3 + 1) * 3);
        assert_eq!(count(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR), 3);
    }
}
