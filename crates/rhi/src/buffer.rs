//! GPU buffer management.
//!
//! Every buffer the ray tracing path touches is one of the [`BufferUsage`]
//! kinds below. The usage fixes the Vulkan usage flags and the memory
//! location, and decides whether the buffer exposes a device address.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use restir_rhi::device::Device;
//! use restir_rhi::buffer::{Buffer, BufferUsage};
//!
//! # fn example(device: Arc<Device>) -> Result<(), restir_rhi::RhiError> {
//! let positions: [f32; 9] = [0.0, 0.5, 0.0, -0.5, -0.5, 0.0, 0.5, -0.5, 0.0];
//! let vertices = Buffer::new_with_data(
//!     device,
//!     BufferUsage::GeometryInput,
//!     bytemuck::cast_slice(&positions),
//! )?;
//! let address = vertices.device_address();
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use tracing::{debug, error};

use crate::device::Device;
use crate::error::{RhiError, RhiResult};

/// Buffer usage type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferUsage {
    /// Vertex or index data read by BLAS builds and by hit shaders.
    GeometryInput,
    /// Shader storage (materials, light props), host written once.
    Storage,
    /// Per-frame uniforms, host written every frame.
    Uniform,
    /// Packed `VkAccelerationStructureInstanceKHR` records for a TLAS build.
    InstanceInput,
    /// Backing memory of an acceleration structure.
    AccelerationStructure,
    /// Acceleration structure build scratch space.
    Scratch,
    /// One shader binding table region.
    ShaderBindingTable,
    /// Host-written upload source.
    Staging,
    /// Host-read copy destination (captured frames).
    Readback,
}

impl BufferUsage {
    /// Converts to Vulkan buffer usage flags.
    pub fn to_vk_usage(self) -> vk::BufferUsageFlags {
        use vk::BufferUsageFlags as F;
        match self {
            BufferUsage::GeometryInput => {
                F::STORAGE_BUFFER
                    | F::SHADER_DEVICE_ADDRESS
                    | F::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
            }
            BufferUsage::Storage => F::STORAGE_BUFFER | F::TRANSFER_DST,
            BufferUsage::Uniform => F::UNIFORM_BUFFER,
            BufferUsage::InstanceInput => {
                F::SHADER_DEVICE_ADDRESS | F::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
            }
            BufferUsage::AccelerationStructure => {
                F::ACCELERATION_STRUCTURE_STORAGE_KHR | F::SHADER_DEVICE_ADDRESS
            }
            BufferUsage::Scratch => F::STORAGE_BUFFER | F::SHADER_DEVICE_ADDRESS,
            BufferUsage::ShaderBindingTable => {
                F::SHADER_BINDING_TABLE_KHR | F::SHADER_DEVICE_ADDRESS | F::TRANSFER_SRC
            }
            BufferUsage::Staging => F::TRANSFER_SRC,
            BufferUsage::Readback => F::TRANSFER_DST,
        }
    }

    /// Returns the default memory location for this buffer type.
    pub fn memory_location(self) -> MemoryLocation {
        match self {
            BufferUsage::AccelerationStructure | BufferUsage::Scratch => MemoryLocation::GpuOnly,
            BufferUsage::Readback => MemoryLocation::GpuToCpu,
            BufferUsage::GeometryInput
            | BufferUsage::Storage
            | BufferUsage::Uniform
            | BufferUsage::InstanceInput
            | BufferUsage::ShaderBindingTable
            | BufferUsage::Staging => MemoryLocation::CpuToGpu,
        }
    }

    /// Whether buffers of this kind are referenced by device address.
    #[inline]
    pub fn has_device_address(self) -> bool {
        self.to_vk_usage()
            .contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
    }

    /// Returns a human-readable name for the buffer type.
    pub fn name(self) -> &'static str {
        match self {
            BufferUsage::GeometryInput => "geometry",
            BufferUsage::Storage => "storage",
            BufferUsage::Uniform => "uniform",
            BufferUsage::InstanceInput => "instances",
            BufferUsage::AccelerationStructure => "acceleration structure",
            BufferUsage::Scratch => "scratch",
            BufferUsage::ShaderBindingTable => "shader binding table",
            BufferUsage::Staging => "staging",
            BufferUsage::Readback => "readback",
        }
    }
}

/// GPU buffer with gpu-allocator managed memory.
///
/// The buffer owns its allocation and frees it on drop. Buffers whose usage
/// has a device address cache it at creation.
///
/// # Thread Safety
///
/// Writes through [`Buffer::write_data`] are not synchronized. Callers make
/// sure the GPU is not reading the range being written.
pub struct Buffer {
    device: Arc<Device>,
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    size: vk::DeviceSize,
    usage: BufferUsage,
    address: vk::DeviceAddress,
}

impl Buffer {
    /// Creates a buffer in the usage's default memory location.
    ///
    /// # Arguments
    ///
    /// * `device` - The logical device
    /// * `usage` - Decides the Vulkan usage flags and memory location
    /// * `size` - Buffer size in bytes
    ///
    /// # Errors
    ///
    /// Returns an error if `size` is zero, or if buffer creation, memory
    /// allocation or binding fails.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use std::sync::Arc;
    /// use restir_rhi::device::Device;
    /// use restir_rhi::buffer::{Buffer, BufferUsage};
    ///
    /// # fn example(device: Arc<Device>) -> Result<(), restir_rhi::RhiError> {
    /// let readback = Buffer::new(device, BufferUsage::Readback, 1280 * 720 * 4)?;
    /// let pixels = readback.read_data()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn new(device: Arc<Device>, usage: BufferUsage, size: vk::DeviceSize) -> RhiResult<Self> {
        Self::new_in(device, usage, size, usage.memory_location())
    }

    /// Creates a buffer in an explicit memory location. Host acceleration
    /// structure builds need their structure storage host-visible.
    ///
    /// # Arguments
    ///
    /// * `device` - The logical device
    /// * `usage` - Decides the Vulkan usage flags
    /// * `size` - Buffer size in bytes
    /// * `location` - Overrides [`BufferUsage::memory_location`]
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `size` is zero
    /// - Buffer creation fails
    /// - The allocator cannot satisfy the request or its lock is poisoned
    /// - Binding the memory fails
    pub fn new_in(
        device: Arc<Device>,
        usage: BufferUsage,
        size: vk::DeviceSize,
        location: MemoryLocation,
    ) -> RhiResult<Self> {
        if size == 0 {
            return Err(RhiError::InvalidHandle(format!(
                "{} buffer size must be greater than 0",
                usage.name()
            )));
        }

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage.to_vk_usage())
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { device.handle().create_buffer(&buffer_info, None)? };
        let requirements = unsafe { device.handle().get_buffer_memory_requirements(buffer) };

        let allocation = device.allocator().and_then(|mut allocator| {
            allocator
                .allocate(&AllocationCreateDesc {
                    name: usage.name(),
                    requirements,
                    location,
                    linear: true,
                    allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                })
                .map_err(RhiError::from)
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.handle().destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let mut this = Self {
            device,
            buffer,
            allocation: Some(allocation),
            size,
            usage,
            address: 0,
        };
        if let Some(allocation) = &this.allocation {
            unsafe {
                this.device.handle().bind_buffer_memory(
                    buffer,
                    allocation.memory(),
                    allocation.offset(),
                )?;
            }
        }
        if usage.has_device_address() {
            let info = vk::BufferDeviceAddressInfo::default().buffer(buffer);
            this.address = unsafe { this.device.handle().get_buffer_device_address(&info) };
        }

        debug!("Created {} buffer: {} bytes", usage.name(), size);
        Ok(this)
    }

    /// Creates a host-visible buffer and fills it with `data`.
    ///
    /// # Arguments
    ///
    /// * `device` - The logical device
    /// * `usage` - Must map to a CPU-visible location
    /// * `data` - Initial contents; its length is the buffer size
    ///
    /// # Errors
    ///
    /// Returns an error if creation fails or the buffer is not mapped.
    pub fn new_with_data(device: Arc<Device>, usage: BufferUsage, data: &[u8]) -> RhiResult<Self> {
        let buffer = Self::new(device, usage, data.len() as vk::DeviceSize)?;
        buffer.write_data(0, data)?;
        Ok(buffer)
    }

    /// Writes data to a host-visible buffer at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write would run past the end of the buffer
    /// or the buffer is not mapped.
    pub fn write_data(&self, offset: vk::DeviceSize, data: &[u8]) -> RhiResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let end = offset + data.len() as vk::DeviceSize;
        if end > self.size {
            return Err(RhiError::InvalidHandle(format!(
                "Write exceeds {} buffer: offset {} + data {} > buffer {}",
                self.usage.name(),
                offset,
                data.len(),
                self.size
            )));
        }

        let mapped = self.mapped_ptr()?;
        unsafe {
            let dst = mapped.add(offset as usize);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        }
        Ok(())
    }

    /// Returns the mapped contents of a host-visible buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer lives in GPU-only memory.
    pub fn read_data(&self) -> RhiResult<&[u8]> {
        self.allocation
            .as_ref()
            .and_then(|a| a.mapped_slice())
            .map(|slice| &slice[..self.size as usize])
            .ok_or_else(|| {
                RhiError::InvalidHandle(format!("{} buffer is not mapped", self.usage.name()))
            })
    }

    /// Host pointer to the start of a mapped buffer.
    pub fn mapped_ptr(&self) -> RhiResult<*mut u8> {
        self.allocation
            .as_ref()
            .and_then(|a| a.mapped_ptr())
            .map(|p| p.as_ptr().cast::<u8>())
            .ok_or_else(|| {
                RhiError::InvalidHandle(format!("{} buffer is not mapped", self.usage.name()))
            })
    }

    /// Returns the Vulkan buffer handle.
    #[inline]
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    #[inline]
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    #[inline]
    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    /// Device address, or 0 for usages without `SHADER_DEVICE_ADDRESS`.
    #[inline]
    pub fn device_address(&self) -> vk::DeviceAddress {
        self.address
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            match self.device.allocator() {
                Ok(mut allocator) => {
                    if let Err(e) = allocator.free(allocation) {
                        error!("Failed to free {} allocation: {:?}", self.usage.name(), e);
                    }
                }
                Err(e) => error!("Leaking {} allocation: {}", self.usage.name(), e),
            }
        }
        unsafe {
            self.device.handle().destroy_buffer(self.buffer, None);
        }
        debug!("Destroyed {} buffer", self.usage.name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_input_is_build_input_and_addressable() {
        let usage = BufferUsage::GeometryInput.to_vk_usage();
        assert!(usage.contains(vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR));
        assert!(usage.contains(vk::BufferUsageFlags::STORAGE_BUFFER));
        assert!(BufferUsage::GeometryInput.has_device_address());
    }

    #[test]
    fn test_addressable_usages() {
        for usage in [
            BufferUsage::InstanceInput,
            BufferUsage::AccelerationStructure,
            BufferUsage::Scratch,
            BufferUsage::ShaderBindingTable,
        ] {
            assert!(usage.has_device_address(), "{}", usage.name());
        }
        for usage in [BufferUsage::Uniform, BufferUsage::Staging, BufferUsage::Readback] {
            assert!(!usage.has_device_address(), "{}", usage.name());
        }
    }

    #[test]
    fn test_memory_locations() {
        assert_eq!(
            BufferUsage::AccelerationStructure.memory_location(),
            MemoryLocation::GpuOnly
        );
        assert_eq!(BufferUsage::Scratch.memory_location(), MemoryLocation::GpuOnly);
        assert_eq!(
            BufferUsage::ShaderBindingTable.memory_location(),
            MemoryLocation::CpuToGpu
        );
        assert_eq!(BufferUsage::Uniform.memory_location(), MemoryLocation::CpuToGpu);
        assert_eq!(BufferUsage::Readback.memory_location(), MemoryLocation::GpuToCpu);
    }

    #[test]
    fn test_sbt_usage_flags() {
        assert!(
            BufferUsage::ShaderBindingTable
                .to_vk_usage()
                .contains(vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR)
        );
    }
}
