//! Vulkan logical device and queue management.
//!
//! The [`Device`] owns:
//! - the logical device with the ray tracing extension set enabled
//! - graphics, present and compute queues picked through a [`QueueAllocator`]
//! - the acceleration structure and ray tracing pipeline extension loaders
//! - the gpu-allocator memory allocator
//!
//! # Example
//!
//! ```no_run
//! use restir_rhi::instance::Instance;
//! use restir_rhi::physical_device::select_physical_device;
//! use restir_rhi::device::Device;
//! use ash::vk;
//!
//! let instance = Instance::new(false, &[]).expect("instance");
//! let surface: vk::SurfaceKHR = vk::SurfaceKHR::null(); // placeholder
//! let surface_loader = ash::khr::surface::Instance::new(instance.entry(), instance.handle());
//! let info = select_physical_device(instance.handle(), surface, &surface_loader).expect("gpu");
//! let device = Device::new(&instance, &info).expect("device");
//! let handle_size = device.ray_tracing_properties().shader_group_handle_size;
//! ```

use std::mem::ManuallyDrop;
use std::sync::{Arc, Mutex, MutexGuard};

use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use tracing::{debug, error, info};

use crate::error::RhiResult;
use crate::instance::Instance;
use crate::physical_device::{
    PhysicalDeviceInfo, QueueFamilyIndices, REQUIRED_DEVICE_EXTENSIONS, RayTracingProperties,
};
use crate::queue::{QueueAllocator, QueueRole, QueueSlot};

/// A retrieved queue and where it came from.
#[derive(Clone, Copy, Debug)]
pub struct Queue {
    pub handle: vk::Queue,
    pub slot: QueueSlot,
}

/// Vulkan logical device wrapper, shared through `Arc`.
///
/// The allocator is behind a `Mutex` so buffers can be created from the
/// snapshot worker thread as well as the control thread.
pub struct Device {
    device: ash::Device,
    physical_device: vk::PhysicalDevice,
    allocator: ManuallyDrop<Mutex<Allocator>>,
    graphics_queue: Queue,
    present_queue: Queue,
    compute_queue: Queue,
    queue_families: QueueFamilyIndices,
    ray_tracing: RayTracingProperties,
    acceleration_structure: ash::khr::acceleration_structure::Device,
    ray_tracing_pipeline: ash::khr::ray_tracing_pipeline::Device,
}

impl Device {
    /// Creates the logical device with every ray tracing feature the
    /// renderer relies on:
    /// - ray tracing pipeline and acceleration structures (host commands when
    ///   the device offers them)
    /// - buffer device address
    /// - runtime descriptor arrays with non-uniform indexing, scalar block
    ///   layout
    /// - storage images without a format qualifier
    /// - sampler anisotropy and 64-bit integers in shaders
    ///
    /// # Arguments
    ///
    /// * `instance` - The Vulkan instance the physical device came from
    /// * `info` - Result of device selection: queue families, ray tracing
    ///   properties and whether host acceleration structure commands exist
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Device creation fails (a missing extension or feature)
    /// - The queue allocator has no queue left for a role
    /// - The memory allocator cannot be created
    ///
    /// # Example
    ///
    /// ```no_run
    /// use restir_rhi::device::Device;
    /// use restir_rhi::instance::Instance;
    /// use restir_rhi::physical_device::PhysicalDeviceInfo;
    ///
    /// # fn example(instance: &Instance, info: &PhysicalDeviceInfo) -> Result<(), restir_rhi::RhiError> {
    /// let device = Device::new(instance, info)?;
    /// let graphics = device.graphics_queue();
    /// # Ok(())
    /// # }
    /// ```
    pub fn new(instance: &Instance, info: &PhysicalDeviceInfo) -> RhiResult<Arc<Self>> {
        let mut queues = QueueAllocator::new(info.queue_families, info.queue_counts.clone());
        let graphics_slot = queues.next(QueueRole::Graphics)?;
        let present_slot = queues.next(QueueRole::Present)?;
        let compute_slot = queues.next(QueueRole::Compute)?;

        let max_queues = info.queue_counts.iter().copied().max().unwrap_or(1) as usize;
        let priorities = vec![1.0f32; max_queues.max(1)];
        let queue_infos = queues.create_infos(&priorities);
        debug!("Requesting queues {:?}", queues.required_queues());

        let mut features12 = vk::PhysicalDeviceVulkan12Features::default()
            .buffer_device_address(true)
            .descriptor_indexing(true)
            .runtime_descriptor_array(true)
            .descriptor_binding_partially_bound(true)
            .shader_sampled_image_array_non_uniform_indexing(true)
            .shader_storage_buffer_array_non_uniform_indexing(true)
            .scalar_block_layout(true);
        let mut as_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
            .acceleration_structure(true)
            .acceleration_structure_host_commands(
                info.ray_tracing.host_acceleration_structure_build,
            );
        let mut rt_features =
            vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default().ray_tracing_pipeline(true);
        let features = vk::PhysicalDeviceFeatures::default()
            .sampler_anisotropy(true)
            // the render target takes the swapchain's BGRA format
            .shader_storage_image_read_without_format(true)
            .shader_storage_image_write_without_format(true)
            .shader_int64(info.features.shader_int64 == vk::TRUE);

        let extension_names: Vec<*const std::ffi::c_char> = REQUIRED_DEVICE_EXTENSIONS
            .iter()
            .map(|ext| ext.as_ptr())
            .collect();

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_names)
            .enabled_features(&features)
            .push_next(&mut features12)
            .push_next(&mut as_features)
            .push_next(&mut rt_features);

        let device = unsafe {
            instance
                .handle()
                .create_device(info.device, &create_info, None)?
        };
        info!(
            "Logical device created with {} extensions",
            REQUIRED_DEVICE_EXTENSIONS.len()
        );

        let get = |slot: QueueSlot| Queue {
            handle: unsafe { device.get_device_queue(slot.family, slot.index) },
            slot,
        };
        let graphics_queue = get(graphics_slot);
        let present_queue = get(present_slot);
        let compute_queue = get(compute_slot);
        debug!(
            "Queues: graphics {:?}, present {:?}, compute {:?}",
            graphics_slot, present_slot, compute_slot
        );

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.handle().clone(),
            device: device.clone(),
            physical_device: info.device,
            debug_settings: Default::default(),
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        });
        let allocator = match allocator {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(e.into());
            }
        };

        let acceleration_structure =
            ash::khr::acceleration_structure::Device::new(instance.handle(), &device);
        let ray_tracing_pipeline =
            ash::khr::ray_tracing_pipeline::Device::new(instance.handle(), &device);

        Ok(Arc::new(Self {
            device,
            physical_device: info.device,
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            graphics_queue,
            present_queue,
            compute_queue,
            queue_families: info.queue_families,
            ray_tracing: info.ray_tracing,
            acceleration_structure,
            ray_tracing_pipeline,
        }))
    }

    /// Returns the Vulkan logical device handle.
    #[inline]
    pub fn handle(&self) -> &ash::Device {
        &self.device
    }

    #[inline]
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    #[inline]
    pub fn graphics_queue(&self) -> Queue {
        self.graphics_queue
    }

    #[inline]
    pub fn present_queue(&self) -> Queue {
        self.present_queue
    }

    /// May alias the graphics queue on single-queue devices.
    #[inline]
    pub fn compute_queue(&self) -> Queue {
        self.compute_queue
    }

    #[inline]
    pub fn queue_families(&self) -> &QueueFamilyIndices {
        &self.queue_families
    }

    #[inline]
    pub fn ray_tracing_properties(&self) -> &RayTracingProperties {
        &self.ray_tracing
    }

    /// `VK_KHR_acceleration_structure` entry points.
    #[inline]
    pub fn acceleration_structure_loader(&self) -> &ash::khr::acceleration_structure::Device {
        &self.acceleration_structure
    }

    /// `VK_KHR_ray_tracing_pipeline` entry points.
    #[inline]
    pub fn ray_tracing_pipeline_loader(&self) -> &ash::khr::ray_tracing_pipeline::Device {
        &self.ray_tracing_pipeline
    }

    /// Locks the memory allocator.
    ///
    /// # Errors
    ///
    /// Returns an error if another thread panicked while holding the lock.
    pub fn allocator(&self) -> RhiResult<MutexGuard<'_, Allocator>> {
        Ok(self.allocator.lock()?)
    }

    /// Blocks until every queue is idle.
    ///
    /// # Errors
    ///
    /// Returns an error if the device is lost.
    pub fn wait_idle(&self) -> RhiResult<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }

    /// Submits command buffers to the graphics queue.
    ///
    /// # Safety
    ///
    /// The command buffers must be fully recorded, and `fence` (if not null)
    /// must be unsignaled and not in use by another submission.
    pub unsafe fn submit_graphics(
        &self,
        submit_infos: &[vk::SubmitInfo],
        fence: vk::Fence,
    ) -> RhiResult<()> {
        unsafe {
            self.device
                .queue_submit(self.graphics_queue.handle, submit_infos, fence)?;
        }
        Ok(())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                error!("Failed to wait for device idle during drop: {:?}", e);
            }
            // The allocator frees its memory blocks through the device.
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
        }
        debug!("Logical device destroyed");
    }
}

// Safety: ash::Device and the extension loaders are plain function tables,
// queues and the physical device are handles, and the allocator is behind a
// Mutex.
unsafe impl Send for Device {}
unsafe impl Sync for Device {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ray_tracing_extensions_requested() {
        assert!(REQUIRED_DEVICE_EXTENSIONS.contains(&ash::khr::acceleration_structure::NAME));
        assert!(REQUIRED_DEVICE_EXTENSIONS.contains(&ash::khr::ray_tracing_pipeline::NAME));
        assert!(REQUIRED_DEVICE_EXTENSIONS.contains(&ash::khr::deferred_host_operations::NAME));
    }

    #[test]
    fn test_device_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Device>();
    }
}
