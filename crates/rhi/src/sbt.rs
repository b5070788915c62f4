//! Shader binding table.
//!
//! The ray tracing pipeline's groups are ordered raygen, miss, hit. Each
//! program class gets its own buffer holding its handles back to back, and
//! the three resulting regions are passed straight to `vkCmdTraceRaysKHR`.

use std::sync::Arc;

use ash::vk;
use tracing::info;

use crate::accel::align_up;
use crate::buffer::{Buffer, BufferUsage};
use crate::device::Device;
use crate::error::{RhiError, RhiResult};
use crate::physical_device::RayTracingProperties;

/// Group counts per program class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShaderGroupCounts {
    pub raygen: u32,
    pub miss: u32,
    pub hit: u32,
}

impl ShaderGroupCounts {
    /// One entry point, primary and shadow miss, one closest-hit program.
    pub const RESTIR: Self = Self {
        raygen: 1,
        miss: 2,
        hit: 1,
    };

    #[inline]
    pub fn total(&self) -> u32 {
        self.raygen + self.miss + self.hit
    }
}

/// Placement of one program class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SbtRegion {
    /// Index of the region's first group in the pipeline.
    pub first_group: u32,
    pub count: u32,
    pub stride: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

/// Host-side layout of the three regions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SbtLayout {
    pub handle_size: u32,
    pub base_alignment: u32,
    pub raygen: SbtRegion,
    pub miss: SbtRegion,
    pub hit: SbtRegion,
}

impl SbtLayout {
    /// Lays out `counts` for a device. Each region's stride is the handle
    /// size, so the handle size must already satisfy the handle alignment.
    ///
    /// # Arguments
    ///
    /// * `props` - Ray tracing limits of the physical device
    /// * `counts` - Number of groups per program class
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::ShaderBindingTableError`] when the handle size is
    /// zero or misaligned, or when there is not exactly one raygen group.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use std::sync::Arc;
    /// use restir_rhi::device::Device;
    /// use restir_rhi::sbt::{SbtLayout, ShaderGroupCounts};
    ///
    /// # fn example(device: Arc<Device>) -> Result<(), restir_rhi::RhiError> {
    /// let layout = SbtLayout::new(device.ray_tracing_properties(), ShaderGroupCounts::RESTIR)?;
    /// assert_eq!(layout.group_count(), 4);
    /// # Ok(())
    /// # }
    /// ```
    pub fn new(props: &RayTracingProperties, counts: ShaderGroupCounts) -> RhiResult<Self> {
        let handle_size = props.shader_group_handle_size;
        let alignment = props.shader_group_handle_alignment.max(1);
        if handle_size == 0 {
            return Err(RhiError::ShaderBindingTableError(
                "device reports a zero shader group handle size".to_string(),
            ));
        }
        if handle_size % alignment != 0 {
            return Err(RhiError::ShaderBindingTableError(format!(
                "handle size {handle_size} is not a multiple of handle alignment {alignment}"
            )));
        }
        if counts.raygen != 1 {
            return Err(RhiError::ShaderBindingTableError(format!(
                "exactly one raygen group expected, got {}",
                counts.raygen
            )));
        }

        let stride = vk::DeviceSize::from(handle_size);
        let region = |first_group: u32, count: u32| SbtRegion {
            first_group,
            count,
            stride,
            size: stride * vk::DeviceSize::from(count),
        };

        Ok(Self {
            handle_size,
            base_alignment: props.shader_group_base_alignment.max(1),
            raygen: region(0, counts.raygen),
            miss: region(counts.raygen, counts.miss),
            hit: region(counts.raygen + counts.miss, counts.hit),
        })
    }

    #[inline]
    pub fn group_count(&self) -> u32 {
        self.raygen.count + self.miss.count + self.hit.count
    }

    /// Bytes returned by `vkGetRayTracingShaderGroupHandlesKHR` for every
    /// group, packed at `handle_size`.
    #[inline]
    pub fn handle_storage_size(&self) -> usize {
        self.handle_size as usize * self.group_count() as usize
    }

    /// Extracts one region's handles from the packed handle storage.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::ShaderBindingTableError`] when `handles` is
    /// shorter than [`SbtLayout::handle_storage_size`].
    pub fn region_bytes<'a>(&self, handles: &'a [u8], region: &SbtRegion) -> RhiResult<&'a [u8]> {
        if handles.len() < self.handle_storage_size() {
            return Err(RhiError::ShaderBindingTableError(format!(
                "handle storage is {} bytes, expected {}",
                handles.len(),
                self.handle_storage_size()
            )));
        }
        let start = region.first_group as usize * self.handle_size as usize;
        Ok(&handles[start..start + region.size as usize])
    }
}

/// GPU-resident binding table: one buffer per region.
pub struct ShaderBindingTable {
    layout: SbtLayout,
    raygen: vk::StridedDeviceAddressRegionKHR,
    miss: vk::StridedDeviceAddressRegionKHR,
    hit: vk::StridedDeviceAddressRegionKHR,
    _buffers: [Buffer; 3],
}

impl ShaderBindingTable {
    /// Retrieves the group handles of `pipeline` and uploads them.
    ///
    /// # Arguments
    ///
    /// * `device` - Device that created `pipeline`
    /// * `pipeline` - Ray tracing pipeline whose groups match `layout`
    /// * `layout` - Region layout built for the same device
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::ShaderBindingTableError`] if the handles cannot be
    /// retrieved, and propagates buffer allocation failures.
    pub fn new(device: Arc<Device>, pipeline: vk::Pipeline, layout: SbtLayout) -> RhiResult<Self> {
        let handles = unsafe {
            device
                .ray_tracing_pipeline_loader()
                .get_ray_tracing_shader_group_handles(
                    pipeline,
                    0,
                    layout.group_count(),
                    layout.handle_storage_size(),
                )
        }
        .map_err(|e| {
            RhiError::ShaderBindingTableError(format!("group handle retrieval failed: {e}"))
        })?;

        let (raygen_buffer, raygen) = upload_region(&device, &layout, &handles, &layout.raygen)?;
        let (miss_buffer, miss) = upload_region(&device, &layout, &handles, &layout.miss)?;
        let (hit_buffer, hit) = upload_region(&device, &layout, &handles, &layout.hit)?;

        info!(
            "Shader binding table: {} groups, handle size {}",
            layout.group_count(),
            layout.handle_size
        );
        Ok(Self {
            layout,
            raygen,
            miss,
            hit,
            _buffers: [raygen_buffer, miss_buffer, hit_buffer],
        })
    }

    #[inline]
    pub fn layout(&self) -> &SbtLayout {
        &self.layout
    }

    #[inline]
    pub fn raygen_region(&self) -> &vk::StridedDeviceAddressRegionKHR {
        &self.raygen
    }

    #[inline]
    pub fn miss_region(&self) -> &vk::StridedDeviceAddressRegionKHR {
        &self.miss
    }

    #[inline]
    pub fn hit_region(&self) -> &vk::StridedDeviceAddressRegionKHR {
        &self.hit
    }
}

fn upload_region(
    device: &Arc<Device>,
    layout: &SbtLayout,
    handles: &[u8],
    region: &SbtRegion,
) -> RhiResult<(Buffer, vk::StridedDeviceAddressRegionKHR)> {
    let bytes = layout.region_bytes(handles, region)?;
    let base_alignment = vk::DeviceSize::from(layout.base_alignment).next_power_of_two();

    // Padded so the region start can be moved up to the base alignment.
    let buffer = Buffer::new(
        device.clone(),
        BufferUsage::ShaderBindingTable,
        region.size + base_alignment,
    )?;
    let address = align_up(buffer.device_address(), base_alignment);
    buffer.write_data(address - buffer.device_address(), bytes)?;

    let strided = vk::StridedDeviceAddressRegionKHR {
        device_address: address,
        stride: region.stride,
        size: region.size,
    };
    Ok((buffer, strided))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(handle_size: u32, alignment: u32) -> RayTracingProperties {
        RayTracingProperties {
            shader_group_handle_size: handle_size,
            shader_group_handle_alignment: alignment,
            ..Default::default()
        }
    }

    #[test]
    fn test_region_sizes_are_stride_times_count() {
        let layout = SbtLayout::new(&props(32, 32), ShaderGroupCounts::RESTIR).unwrap();
        for region in [layout.raygen, layout.miss, layout.hit] {
            assert_eq!(region.stride, 32);
            assert_eq!(region.size, region.stride * u64::from(region.count));
        }
        assert_eq!(layout.raygen.count, 1);
        assert_eq!(layout.miss.count, 2);
        assert_eq!(layout.hit.count, 1);
    }

    #[test]
    fn test_regions_follow_group_order() {
        let layout = SbtLayout::new(&props(32, 16), ShaderGroupCounts::RESTIR).unwrap();
        assert_eq!(layout.raygen.first_group, 0);
        assert_eq!(layout.miss.first_group, 1);
        assert_eq!(layout.hit.first_group, 3);
        assert_eq!(layout.handle_storage_size(), 4 * 32);
    }

    #[test]
    fn test_region_bytes_slices_packed_handles() {
        let layout = SbtLayout::new(&props(16, 16), ShaderGroupCounts::RESTIR).unwrap();
        let handles: Vec<u8> = (0..4u8).flat_map(|g| [g; 16]).collect();

        assert_eq!(layout.region_bytes(&handles, &layout.raygen).unwrap(), &[0u8; 16]);
        let miss = layout.region_bytes(&handles, &layout.miss).unwrap();
        assert_eq!(miss.len(), 32);
        assert!(miss[..16].iter().all(|&b| b == 1));
        assert!(miss[16..].iter().all(|&b| b == 2));
        assert_eq!(layout.region_bytes(&handles, &layout.hit).unwrap(), &[3u8; 16]);
    }

    #[test]
    fn test_short_handle_storage_is_an_error() {
        let layout = SbtLayout::new(&props(32, 32), ShaderGroupCounts::RESTIR).unwrap();
        assert!(layout.region_bytes(&[0; 64], &layout.hit).is_err());
    }

    #[test]
    fn test_misaligned_handle_size_is_rejected() {
        assert!(matches!(
            SbtLayout::new(&props(24, 16), ShaderGroupCounts::RESTIR),
            Err(RhiError::ShaderBindingTableError(_))
        ));
    }

    #[test]
    fn test_single_raygen_required() {
        let counts = ShaderGroupCounts {
            raygen: 2,
            miss: 2,
            hit: 1,
        };
        assert!(SbtLayout::new(&props(32, 32), counts).is_err());
    }
}
