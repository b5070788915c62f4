//! Storage images and sampled textures.
//!
//! Every per-pixel buffer of the frame (the render target, the reservoir
//! and history images, the accumulator) is a [`StorageImage`]: a 2D,
//! single-mip, optimally tiled image in GPU-only memory with one view.
//! They are all surface-dependent and are recreated together on resize.
//!
//! Diffuse maps are [`SampledTexture`]s: uploaded once through a staging
//! buffer and left in `SHADER_READ_ONLY_OPTIMAL` for the scene's lifetime.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use tracing::{debug, error};

use crate::barrier::{BarrierTable, ResourceState};
use crate::buffer::{Buffer, BufferUsage};
use crate::command::CommandPool;
use crate::device::Device;
use crate::error::{RhiError, RhiResult};

/// Format of reservoir and accumulator images.
pub const FLOAT_IMAGE_FORMAT: vk::Format = vk::Format::R32G32B32A32_SFLOAT;

/// Format of uploaded diffuse maps.
pub const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

/// Subresource range covering the single color mip/layer of a storage image.
pub const COLOR_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

/// Subresource layers matching [`COLOR_RANGE`], for copies.
pub const COLOR_LAYERS: vk::ImageSubresourceLayers = vk::ImageSubresourceLayers {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    mip_level: 0,
    base_array_layer: 0,
    layer_count: 1,
};

/// Image written by ray tracing or compute shaders.
///
/// Destroyed view first, then image, then memory.
pub struct StorageImage {
    device: Arc<Device>,
    image: vk::Image,
    view: vk::ImageView,
    allocation: Option<Allocation>,
    format: vk::Format,
    extent: vk::Extent2D,
    label: &'static str,
}

impl StorageImage {
    /// Creates the image in `UNDEFINED` layout. `extra_usage` is added to
    /// `STORAGE | TRANSFER_DST` (clears).
    pub fn new(
        device: Arc<Device>,
        label: &'static str,
        extent: vk::Extent2D,
        format: vk::Format,
        extra_usage: vk::ImageUsageFlags,
    ) -> RhiResult<Self> {
        let usage = vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_DST | extra_usage;
        let (image, allocation) = create_image(&device, label, extent, format, usage)?;
        let mut this = Self {
            device,
            image,
            view: vk::ImageView::null(),
            allocation: Some(allocation),
            format,
            extent,
            label,
        };
        this.view = create_view(&this.device, image, format)?;

        debug!(
            "Created {} image: {}x{} ({:?})",
            label, extent.width, extent.height, format
        );
        Ok(this)
    }

    #[inline]
    pub fn image(&self) -> vk::Image {
        self.image
    }

    #[inline]
    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    #[inline]
    pub fn format(&self) -> vk::Format {
        self.format
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    #[inline]
    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Descriptor info for a storage image binding in `GENERAL` layout.
    pub fn descriptor_info(&self) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo::default()
            .image_view(self.view)
            .image_layout(vk::ImageLayout::GENERAL)
    }
}

impl Drop for StorageImage {
    fn drop(&mut self) {
        destroy_image(&self.device, self.image, self.view, self.allocation.take(), self.label);
    }
}

/// Read-only RGBA8 texture with its own sampler.
pub struct SampledTexture {
    device: Arc<Device>,
    image: vk::Image,
    view: vk::ImageView,
    sampler: vk::Sampler,
    allocation: Option<Allocation>,
    extent: vk::Extent2D,
    label: String,
}

impl SampledTexture {
    /// Creates the texture and uploads `pixels` through a staging buffer.
    ///
    /// # Arguments
    ///
    /// * `device` - The logical device
    /// * `pool` - Pool the one-shot upload is recorded from
    /// * `queue` - Queue of `pool`'s family
    /// * `barriers` - Table holding the upload transitions
    /// * `label` - Name used in logs and allocation reports
    /// * `extent` - Texture size in texels
    /// * `pixels` - Tightly packed RGBA8 rows, top to bottom
    ///
    /// # Errors
    ///
    /// Returns an error if `pixels` does not match `extent`, or if
    /// allocation, the upload submit or sampler creation fails.
    pub fn upload(
        device: Arc<Device>,
        pool: &CommandPool,
        queue: vk::Queue,
        barriers: &BarrierTable,
        label: &str,
        extent: vk::Extent2D,
        pixels: &[u8],
    ) -> RhiResult<Self> {
        let expected = texture_size(extent);
        if pixels.len() as vk::DeviceSize != expected {
            return Err(RhiError::InvalidHandle(format!(
                "{label} texture needs {expected} bytes, got {}",
                pixels.len()
            )));
        }
        let staging = Buffer::new_with_data(device.clone(), BufferUsage::Staging, pixels)?;

        let usage = vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST;
        let (image, allocation) = create_image(&device, label, extent, TEXTURE_FORMAT, usage)?;
        let mut this = Self {
            device,
            image,
            view: vk::ImageView::null(),
            sampler: vk::Sampler::null(),
            allocation: Some(allocation),
            extent,
            label: label.to_string(),
        };
        this.view = create_view(&this.device, image, TEXTURE_FORMAT)?;

        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .max_lod(0.0);
        this.sampler = unsafe { this.device.handle().create_sampler(&sampler_info, None)? };

        let region = upload_copy(extent);
        pool.submit_one_shot(queue, |cmd| {
            barriers.transition_images(
                cmd,
                ResourceState::Undefined,
                ResourceState::TransferDst,
                &[image],
            )?;
            cmd.copy_buffer_to_image(
                staging.handle(),
                image,
                ResourceState::TransferDst.layout(),
                &region,
            );
            barriers.transition_images(
                cmd,
                ResourceState::TransferDst,
                ResourceState::ShaderSampled,
                &[image],
            )
        })?;

        debug!(
            "Uploaded {} texture: {}x{}",
            this.label, extent.width, extent.height
        );
        Ok(this)
    }

    #[inline]
    pub fn image(&self) -> vk::Image {
        self.image
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Combined image sampler info in `SHADER_READ_ONLY_OPTIMAL`.
    pub fn descriptor_info(&self) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo::default()
            .sampler(self.sampler)
            .image_view(self.view)
            .image_layout(ResourceState::ShaderSampled.layout())
    }
}

impl Drop for SampledTexture {
    fn drop(&mut self) {
        if self.sampler != vk::Sampler::null() {
            unsafe { self.device.handle().destroy_sampler(self.sampler, None) };
        }
        destroy_image(&self.device, self.image, self.view, self.allocation.take(), &self.label);
    }
}

/// Bytes of a tightly packed RGBA8 texture.
pub fn texture_size(extent: vk::Extent2D) -> vk::DeviceSize {
    vk::DeviceSize::from(extent.width) * vk::DeviceSize::from(extent.height) * 4
}

/// Whole-image copy from a tightly packed staging buffer.
pub fn upload_copy(extent: vk::Extent2D) -> vk::BufferImageCopy {
    vk::BufferImageCopy::default()
        .buffer_offset(0)
        .buffer_row_length(0)
        .buffer_image_height(0)
        .image_subresource(COLOR_LAYERS)
        .image_extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        })
}

/// Creates a 2D optimally tiled image in `UNDEFINED` layout and binds
/// GPU-only memory to it. Nothing leaks on failure.
fn create_image(
    device: &Arc<Device>,
    label: &str,
    extent: vk::Extent2D,
    format: vk::Format,
    usage: vk::ImageUsageFlags,
) -> RhiResult<(vk::Image, Allocation)> {
    if extent.width == 0 || extent.height == 0 {
        return Err(RhiError::InvalidHandle(format!(
            "{label} image dimensions must be greater than 0"
        )));
    }

    let image_info = vk::ImageCreateInfo::default()
        .image_type(vk::ImageType::TYPE_2D)
        .format(format)
        .extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);
    let image = unsafe { device.handle().create_image(&image_info, None)? };
    let requirements = unsafe { device.handle().get_image_memory_requirements(image) };

    let allocation = device.allocator().and_then(|mut allocator| {
        allocator
            .allocate(&AllocationCreateDesc {
                name: label,
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(RhiError::from)
    });
    let allocation = match allocation {
        Ok(allocation) => allocation,
        Err(e) => {
            unsafe { device.handle().destroy_image(image, None) };
            return Err(e);
        }
    };

    let bound = unsafe {
        device
            .handle()
            .bind_image_memory(image, allocation.memory(), allocation.offset())
    };
    if let Err(e) = bound {
        destroy_image(device, image, vk::ImageView::null(), Some(allocation), label);
        return Err(e.into());
    }
    Ok((image, allocation))
}

fn create_view(device: &Device, image: vk::Image, format: vk::Format) -> RhiResult<vk::ImageView> {
    let view_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .subresource_range(COLOR_RANGE);
    Ok(unsafe { device.handle().create_image_view(&view_info, None)? })
}

/// View first, then image, then memory.
fn destroy_image(
    device: &Device,
    image: vk::Image,
    view: vk::ImageView,
    allocation: Option<Allocation>,
    label: &str,
) {
    unsafe {
        if view != vk::ImageView::null() {
            device.handle().destroy_image_view(view, None);
        }
        device.handle().destroy_image(image, None);
    }
    if let Some(allocation) = allocation {
        match device.allocator() {
            Ok(mut allocator) => {
                if let Err(e) = allocator.free(allocation) {
                    error!("Failed to free {} image allocation: {:?}", label, e);
                }
            }
            Err(e) => error!("Leaking {} image allocation: {}", label, e),
        }
    }
    debug!("Destroyed {} image", label);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_format_has_four_channels() {
        assert_eq!(FLOAT_IMAGE_FORMAT, vk::Format::R32G32B32A32_SFLOAT);
    }

    #[test]
    fn test_color_range_covers_one_level() {
        assert_eq!(COLOR_RANGE.level_count, 1);
        assert_eq!(COLOR_RANGE.layer_count, 1);
        assert_eq!(COLOR_LAYERS.layer_count, COLOR_RANGE.layer_count);
    }

    #[test]
    fn test_texture_upload_copy_is_tightly_packed() {
        let extent = vk::Extent2D {
            width: 64,
            height: 32,
        };
        assert_eq!(texture_size(extent), 64 * 32 * 4);
        let copy = upload_copy(extent);
        assert_eq!(copy.buffer_row_length, 0);
        assert_eq!(copy.buffer_image_height, 0);
        assert_eq!(copy.image_extent.width, 64);
        assert_eq!(copy.image_extent.height, 32);
        assert_eq!(copy.image_subresource.layer_count, 1);
    }
}
