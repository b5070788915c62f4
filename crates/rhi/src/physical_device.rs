//! Physical device (GPU) selection.
//!
//! A device qualifies when it exposes:
//! 1. graphics and present queue families
//! 2. every extension in [`REQUIRED_DEVICE_EXTENSIONS`]
//! 3. the ray tracing pipeline, acceleration structure, buffer device
//!    address and descriptor indexing features
//!
//! Among qualifying devices discrete GPUs win, then larger VRAM.

use std::ffi::CStr;

use ash::vk;
use tracing::{debug, info, warn};

use crate::error::{RhiError, RhiResult};

/// Device extensions the ray tracing path cannot run without.
pub const REQUIRED_DEVICE_EXTENSIONS: [&CStr; 9] = [
    ash::khr::swapchain::NAME,
    ash::khr::ray_tracing_pipeline::NAME,
    ash::khr::acceleration_structure::NAME,
    ash::khr::buffer_device_address::NAME,
    ash::khr::deferred_host_operations::NAME,
    ash::khr::pipeline_library::NAME,
    ash::khr::spirv_1_4::NAME,
    ash::khr::shader_float_controls::NAME,
    ash::ext::descriptor_indexing::NAME,
];

/// Queue family indices for different queue types.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics_family: Option<u32>,
    pub present_family: Option<u32>,
    pub compute_family: Option<u32>,
    pub transfer_family: Option<u32>,
}

impl QueueFamilyIndices {
    /// Graphics and present are mandatory, compute and transfer fall back to
    /// the graphics family.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.graphics_family.is_some() && self.present_family.is_some()
    }

    /// Returns the distinct family indices, graphics first.
    pub fn unique_families(&self) -> Vec<u32> {
        let mut families = Vec::with_capacity(4);
        for family in [
            self.graphics_family,
            self.present_family,
            self.compute_family,
            self.transfer_family,
        ]
        .into_iter()
        .flatten()
        {
            if !families.contains(&family) {
                families.push(family);
            }
        }
        families
    }
}

/// Ray tracing limits consumed by the SBT builder and the BLAS/TLAS builders.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RayTracingProperties {
    /// Size in bytes of one opaque shader group handle.
    pub shader_group_handle_size: u32,
    /// Required alignment of a handle inside a binding table.
    pub shader_group_handle_alignment: u32,
    /// Required alignment of a binding table region base address.
    pub shader_group_base_alignment: u32,
    pub max_ray_recursion_depth: u32,
    /// Required alignment of a build scratch buffer device address.
    pub scratch_offset_alignment: u32,
    /// `accelerationStructureHostCommands`: structures can be built on the CPU.
    pub host_acceleration_structure_build: bool,
}

impl Default for RayTracingProperties {
    fn default() -> Self {
        Self {
            shader_group_handle_size: 32,
            shader_group_handle_alignment: 32,
            shader_group_base_alignment: 64,
            max_ray_recursion_depth: 1,
            scratch_offset_alignment: 128,
            host_acceleration_structure_build: false,
        }
    }
}

/// Information about a selected physical device.
#[derive(Clone)]
pub struct PhysicalDeviceInfo {
    pub device: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub features: vk::PhysicalDeviceFeatures,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub queue_families: QueueFamilyIndices,
    /// Queue count of every family, indexed by family index.
    pub queue_counts: Vec<u32>,
    pub ray_tracing: RayTracingProperties,
}

impl PhysicalDeviceInfo {
    /// Returns the device name as a string.
    pub fn device_name(&self) -> &str {
        self.properties
            .device_name_as_c_str()
            .ok()
            .and_then(|name| name.to_str().ok())
            .unwrap_or("Unknown Device")
    }

    pub fn device_type_name(&self) -> &'static str {
        device_type_name(self.properties.device_type)
    }

    /// Returns the total device local memory in bytes.
    pub fn device_local_memory(&self) -> u64 {
        self.memory_properties
            .memory_heaps
            .iter()
            .take(self.memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size)
            .sum()
    }
}

impl std::fmt::Debug for PhysicalDeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalDeviceInfo")
            .field("name", &self.device_name())
            .field("type", &self.device_type_name())
            .field("queue_families", &self.queue_families)
            .field("ray_tracing", &self.ray_tracing)
            .finish()
    }
}

fn device_type_name(ty: vk::PhysicalDeviceType) -> &'static str {
    match ty {
        vk::PhysicalDeviceType::DISCRETE_GPU => "Discrete GPU",
        vk::PhysicalDeviceType::INTEGRATED_GPU => "Integrated GPU",
        vk::PhysicalDeviceType::VIRTUAL_GPU => "Virtual GPU",
        vk::PhysicalDeviceType::CPU => "CPU",
        _ => "Other",
    }
}

/// Selects the most suitable ray tracing capable GPU.
///
/// # Errors
///
/// Returns [`RhiError::NoSuitableGpu`] if no device qualifies.
pub fn select_physical_device(
    instance: &ash::Instance,
    surface: vk::SurfaceKHR,
    surface_loader: &ash::khr::surface::Instance,
) -> RhiResult<PhysicalDeviceInfo> {
    let devices = unsafe { instance.enumerate_physical_devices()? };
    if devices.is_empty() {
        warn!("No Vulkan-capable GPUs found");
        return Err(RhiError::NoSuitableGpu);
    }

    let mut best: Option<(PhysicalDeviceInfo, u64)> = None;
    for device in devices {
        let Some(info) = inspect_device(instance, device, surface, surface_loader)? else {
            continue;
        };
        let score = rate_device(info.properties.device_type, info.device_local_memory());
        debug!("GPU '{}' qualifies with score {}", info.device_name(), score);
        if best.as_ref().is_none_or(|(_, s)| score > *s) {
            best = Some((info, score));
        }
    }

    let (info, _) = best.ok_or(RhiError::NoSuitableGpu)?;
    info!(
        "Selected GPU: '{}' ({}), handle size {}, host AS builds: {}",
        info.device_name(),
        info.device_type_name(),
        info.ray_tracing.shader_group_handle_size,
        info.ray_tracing.host_acceleration_structure_build
    );
    Ok(info)
}

fn inspect_device(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    surface_loader: &ash::khr::surface::Instance,
) -> RhiResult<Option<PhysicalDeviceInfo>> {
    let properties = unsafe { instance.get_physical_device_properties(device) };
    let name = properties
        .device_name_as_c_str()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let available = unsafe { instance.enumerate_device_extension_properties(device)? };
    let available: Vec<&CStr> = available
        .iter()
        .filter_map(|ext| ext.extension_name_as_c_str().ok())
        .collect();
    let missing = missing_extensions(&available);
    if !missing.is_empty() {
        debug!("GPU '{}' skipped: missing extensions {:?}", name, missing);
        return Ok(None);
    }

    let mut rt_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default();
    let mut as_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
    let mut features12 = vk::PhysicalDeviceVulkan12Features::default();
    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .push_next(&mut rt_features)
        .push_next(&mut as_features)
        .push_next(&mut features12);
    unsafe { instance.get_physical_device_features2(device, &mut features2) };
    let features = features2.features;

    if rt_features.ray_tracing_pipeline == vk::FALSE
        || as_features.acceleration_structure == vk::FALSE
        || features12.buffer_device_address == vk::FALSE
        || features12.runtime_descriptor_array == vk::FALSE
        || features.sampler_anisotropy == vk::FALSE
    {
        debug!("GPU '{}' skipped: ray tracing features incomplete", name);
        return Ok(None);
    }
    let host_build = as_features.acceleration_structure_host_commands == vk::TRUE;

    let mut rt_props = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
    let mut as_props = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
    let mut props2 = vk::PhysicalDeviceProperties2::default()
        .push_next(&mut rt_props)
        .push_next(&mut as_props);
    unsafe { instance.get_physical_device_properties2(device, &mut props2) };

    let family_props = unsafe { instance.get_physical_device_queue_family_properties(device) };
    let mut present = Vec::with_capacity(family_props.len());
    for index in 0..family_props.len() as u32 {
        let supported = unsafe {
            surface_loader.get_physical_device_surface_support(device, index, surface)?
        };
        present.push(supported);
    }
    let queue_families = pick_queue_families(&family_props, &present);
    if !queue_families.is_complete() {
        debug!("GPU '{}' skipped: no graphics/present queue", name);
        return Ok(None);
    }

    Ok(Some(PhysicalDeviceInfo {
        device,
        properties,
        features,
        memory_properties: unsafe { instance.get_physical_device_memory_properties(device) },
        queue_families,
        queue_counts: family_props.iter().map(|f| f.queue_count).collect(),
        ray_tracing: RayTracingProperties {
            shader_group_handle_size: rt_props.shader_group_handle_size,
            shader_group_handle_alignment: rt_props.shader_group_handle_alignment,
            shader_group_base_alignment: rt_props.shader_group_base_alignment,
            max_ray_recursion_depth: rt_props.max_ray_recursion_depth,
            scratch_offset_alignment: as_props.min_acceleration_structure_scratch_offset_alignment,
            host_acceleration_structure_build: host_build,
        },
    }))
}

/// Returns the required extensions absent from `available`.
pub fn missing_extensions(available: &[&CStr]) -> Vec<&'static CStr> {
    REQUIRED_DEVICE_EXTENSIONS
        .iter()
        .copied()
        .filter(|required| !available.contains(required))
        .collect()
}

/// Chooses queue families from per-family flags and present support.
///
/// Dedicated compute (no graphics) and dedicated transfer (no graphics or
/// compute) families are preferred, otherwise both fall back to graphics.
pub fn pick_queue_families(
    families: &[vk::QueueFamilyProperties],
    present_support: &[bool],
) -> QueueFamilyIndices {
    let mut indices = QueueFamilyIndices::default();
    let mut dedicated_compute = None;
    let mut dedicated_transfer = None;

    for (i, family) in families.iter().enumerate() {
        if family.queue_count == 0 {
            continue;
        }
        let i = i as u32;
        let flags = family.queue_flags;
        let graphics = flags.contains(vk::QueueFlags::GRAPHICS);
        let compute = flags.contains(vk::QueueFlags::COMPUTE);

        if graphics && indices.graphics_family.is_none() {
            indices.graphics_family = Some(i);
        }
        if compute && !graphics && dedicated_compute.is_none() {
            dedicated_compute = Some(i);
        }
        if flags.contains(vk::QueueFlags::TRANSFER)
            && !graphics
            && !compute
            && dedicated_transfer.is_none()
        {
            dedicated_transfer = Some(i);
        }
        if indices.present_family.is_none() && present_support.get(i as usize) == Some(&true) {
            indices.present_family = Some(i);
        }
    }

    indices.compute_family = dedicated_compute.or(indices.graphics_family);
    indices.transfer_family = dedicated_transfer.or(indices.graphics_family);
    indices
}

/// Discrete GPUs first, then more device-local memory.
fn rate_device(ty: vk::PhysicalDeviceType, local_memory: u64) -> u64 {
    let type_score: u64 = match ty {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1_000_000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100_000,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 10_000,
        _ => 0,
    };
    type_score + (local_memory / (1024 * 1024)).min(99_999)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags, count: u32) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: count,
            ..Default::default()
        }
    }

    #[test]
    fn test_queue_family_indices_complete() {
        let mut indices = QueueFamilyIndices::default();
        assert!(!indices.is_complete());
        indices.graphics_family = Some(0);
        assert!(!indices.is_complete());
        indices.present_family = Some(0);
        assert!(indices.is_complete());
    }

    #[test]
    fn test_unique_families_with_duplicates() {
        let indices = QueueFamilyIndices {
            graphics_family: Some(0),
            present_family: Some(0),
            compute_family: Some(2),
            transfer_family: Some(0),
        };
        assert_eq!(indices.unique_families(), vec![0, 2]);
    }

    #[test]
    fn test_pick_prefers_dedicated_families() {
        let families = [
            family(
                vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
                16,
            ),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, 8),
            family(vk::QueueFlags::TRANSFER, 2),
        ];
        let indices = pick_queue_families(&families, &[true, false, false]);
        assert_eq!(indices.graphics_family, Some(0));
        assert_eq!(indices.present_family, Some(0));
        assert_eq!(indices.compute_family, Some(1));
        assert_eq!(indices.transfer_family, Some(2));
    }

    #[test]
    fn test_pick_falls_back_to_graphics() {
        let families = [family(
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            1,
        )];
        let indices = pick_queue_families(&families, &[true]);
        assert_eq!(indices.compute_family, Some(0));
        assert_eq!(indices.transfer_family, Some(0));
    }

    #[test]
    fn test_pick_skips_empty_families() {
        let families = [
            family(vk::QueueFlags::GRAPHICS, 0),
            family(vk::QueueFlags::GRAPHICS, 1),
        ];
        let indices = pick_queue_families(&families, &[true, true]);
        assert_eq!(indices.graphics_family, Some(1));
        assert_eq!(indices.present_family, Some(1));
    }

    #[test]
    fn test_missing_extensions_reports_absent_ones() {
        let available = [ash::khr::swapchain::NAME, ash::khr::spirv_1_4::NAME];
        let missing = missing_extensions(&available);
        assert_eq!(missing.len(), REQUIRED_DEVICE_EXTENSIONS.len() - 2);
        assert!(missing.contains(&ash::khr::ray_tracing_pipeline::NAME));
        assert!(!missing.contains(&ash::khr::swapchain::NAME));

        assert!(missing_extensions(&REQUIRED_DEVICE_EXTENSIONS).is_empty());
    }

    #[test]
    fn test_discrete_outranks_integrated() {
        let discrete = rate_device(vk::PhysicalDeviceType::DISCRETE_GPU, 0);
        let integrated = rate_device(vk::PhysicalDeviceType::INTEGRATED_GPU, 64 << 30);
        assert!(discrete > integrated);
    }
}
