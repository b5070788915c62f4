//! Bottom- and top-level acceleration structure builders.
//!
//! Both levels follow the same sequence:
//! 1. query build sizes for the geometry
//! 2. allocate the structure's backing buffer and create the handle
//! 3. allocate scratch memory
//! 4. build, on the host when the device supports host commands, otherwise
//!    through a one-shot command buffer that is waited on
//! 5. release the scratch memory and query the structure's device address
//!
//! Built structures live in an [`AccelerationStructureStore`], which
//! destroys them in reverse creation order (the TLAS before the BLASes it
//! references), each one handle first and memory last.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::MemoryLocation;
use tracing::{debug, info};

use crate::arena::{Handle, ResourceArena};
use crate::buffer::{Buffer, BufferUsage};
use crate::command::CommandPool;
use crate::device::Device;
use crate::error::{RhiError, RhiResult};

/// Row-major 3x4 identity transform.
pub const IDENTITY_TRANSFORM: [f32; 12] = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0,
];

/// Mask that makes an instance visible to every ray.
pub const VISIBLE_TO_ALL: u8 = 0xFF;

/// Largest custom index a 24-bit instance field can carry.
pub const MAX_CUSTOM_INDEX: u32 = (1 << 24) - 1;

/// Number of triangles described by `index_count` indices.
///
/// # Errors
///
/// Returns [`RhiError::AccelerationBuildError`] for empty meshes and index
/// counts that are not a multiple of 3.
pub fn primitive_count(index_count: u32) -> RhiResult<u32> {
    if index_count == 0 {
        return Err(RhiError::AccelerationBuildError(
            "mesh has no triangles".to_string(),
        ));
    }
    if index_count % 3 != 0 {
        return Err(RhiError::AccelerationBuildError(format!(
            "index count {index_count} is not a multiple of 3"
        )));
    }
    Ok(index_count / 3)
}

/// Rounds `value` up to a power-of-two `alignment`.
#[inline]
pub fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Indexed triangle mesh in host-visible geometry buffers.
///
/// Positions are the first three floats of each vertex.
pub struct TriangleGeometry<'a> {
    pub vertices: &'a Buffer,
    pub vertex_count: u32,
    pub vertex_stride: vk::DeviceSize,
    pub indices: &'a Buffer,
    pub index_count: u32,
}

/// Structure level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccelerationLevel {
    Bottom,
    Top,
}

impl AccelerationLevel {
    fn to_vk(self) -> vk::AccelerationStructureTypeKHR {
        match self {
            AccelerationLevel::Bottom => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            AccelerationLevel::Top => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
        }
    }
}

/// A built acceleration structure and its backing memory.
pub struct AccelerationStructure {
    device: Arc<Device>,
    handle: vk::AccelerationStructureKHR,
    address: vk::DeviceAddress,
    level: AccelerationLevel,
    primitive_count: u32,
    // dropped after the handle is destroyed
    buffer: Buffer,
}

impl AccelerationStructure {
    #[inline]
    pub fn handle(&self) -> vk::AccelerationStructureKHR {
        self.handle
    }

    /// Address used as an instance's structure reference.
    #[inline]
    pub fn device_address(&self) -> vk::DeviceAddress {
        self.address
    }

    #[inline]
    pub fn level(&self) -> AccelerationLevel {
        self.level
    }

    /// Triangles for a BLAS, instances for a TLAS.
    #[inline]
    pub fn primitive_count(&self) -> u32 {
        self.primitive_count
    }

    #[inline]
    pub fn size(&self) -> vk::DeviceSize {
        self.buffer.size()
    }
}

impl Drop for AccelerationStructure {
    fn drop(&mut self) {
        unsafe {
            self.device
                .acceleration_structure_loader()
                .destroy_acceleration_structure(self.handle, None);
        }
        debug!(
            "Destroyed {:?}-level acceleration structure ({} primitives)",
            self.level, self.primitive_count
        );
    }
}

/// One TLAS instance before packing.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct InstanceDesc {
    /// Row-major 3x4 object-to-world transform.
    pub transform: [f32; 12],
    /// `gl_InstanceCustomIndexEXT`, 24 bits.
    pub custom_index: u32,
    pub mask: u8,
    pub flags: vk::GeometryInstanceFlagsKHR,
    /// Referenced BLAS, as a device address.
    pub blas_address: vk::DeviceAddress,
    /// Referenced BLAS, as a handle (host builds reference handles).
    pub blas_handle: vk::AccelerationStructureKHR,
}

impl InstanceDesc {
    /// Identity-transformed, fully visible, double-sided instance.
    pub fn new(custom_index: u32, blas: &AccelerationStructure) -> Self {
        Self {
            transform: IDENTITY_TRANSFORM,
            custom_index,
            mask: VISIBLE_TO_ALL,
            flags: vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE,
            blas_address: blas.device_address(),
            blas_handle: blas.handle(),
        }
    }

    /// Packs into the Vulkan instance record. Host builds reference the
    /// BLAS handle, device builds its address.
    pub fn to_vk(&self, host_build: bool) -> vk::AccelerationStructureInstanceKHR {
        let reference = if host_build {
            vk::AccelerationStructureReferenceKHR {
                host_handle: self.blas_handle,
            }
        } else {
            vk::AccelerationStructureReferenceKHR {
                device_handle: self.blas_address,
            }
        };
        vk::AccelerationStructureInstanceKHR {
            transform: vk::TransformMatrixKHR {
                matrix: self.transform,
            },
            instance_custom_index_and_mask: vk::Packed24_8::new(self.custom_index, self.mask),
            instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
                0,
                self.flags.as_raw() as u8,
            ),
            acceleration_structure_reference: reference,
        }
    }
}

/// Checks that custom indices are exactly `0..instances.len()` in some
/// order and fit in 24 bits.
///
/// # Errors
///
/// Returns [`RhiError::AccelerationBuildError`] naming the first index that
/// is too wide, repeated, or outside the instance range.
pub fn validate_custom_indices(instances: &[InstanceDesc]) -> RhiResult<()> {
    let mut seen = vec![false; instances.len()];
    for instance in instances {
        let index = instance.custom_index;
        if index > MAX_CUSTOM_INDEX {
            return Err(RhiError::AccelerationBuildError(format!(
                "custom index {index} exceeds 24 bits"
            )));
        }
        match seen.get_mut(index as usize) {
            Some(slot) if !*slot => *slot = true,
            Some(_) => {
                return Err(RhiError::AccelerationBuildError(format!(
                    "custom index {index} used twice"
                )));
            }
            None => {
                return Err(RhiError::AccelerationBuildError(format!(
                    "custom index {index} outside 0..{}",
                    instances.len()
                )));
            }
        }
    }
    Ok(())
}

/// Builds acceleration structures on one queue.
pub struct AccelerationStructureBuilder {
    device: Arc<Device>,
    pool: CommandPool,
    queue: vk::Queue,
    host_build: bool,
}

impl AccelerationStructureBuilder {
    /// Uses the graphics queue. Host builds are chosen when the device
    /// advertises `accelerationStructureHostCommands`.
    ///
    /// # Arguments
    ///
    /// * `device` - Device with the acceleration structure extension enabled
    ///
    /// # Errors
    ///
    /// Returns an error if the command pool for device builds cannot be
    /// created.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use std::sync::Arc;
    /// use restir_rhi::accel::{AccelerationStructureBuilder, TriangleGeometry};
    /// use restir_rhi::buffer::Buffer;
    /// use restir_rhi::device::Device;
    ///
    /// # fn example(device: Arc<Device>, vertices: &Buffer, indices: &Buffer)
    /// #     -> Result<(), restir_rhi::RhiError> {
    /// let builder = AccelerationStructureBuilder::new(device)?;
    /// let blas = builder.build_blas(&TriangleGeometry {
    ///     vertices,
    ///     vertex_count: 3,
    ///     vertex_stride: 12,
    ///     indices,
    ///     index_count: 3,
    /// })?;
    /// assert_eq!(blas.primitive_count(), 1);
    /// # Ok(())
    /// # }
    /// ```
    pub fn new(device: Arc<Device>) -> RhiResult<Self> {
        let queue = device.graphics_queue();
        let pool = CommandPool::new(device.clone(), queue.slot.family)?;
        let host_build = device
            .ray_tracing_properties()
            .host_acceleration_structure_build;
        info!(
            "Acceleration structures build on the {}",
            if host_build { "host" } else { "device" }
        );
        Ok(Self {
            device,
            pool,
            queue: queue.handle,
            host_build,
        })
    }

    #[inline]
    pub fn host_build(&self) -> bool {
        self.host_build
    }

    /// Builds a BLAS over one mesh's triangles.
    ///
    /// # Arguments
    ///
    /// * `geometry` - Vertex and index buffers of the mesh, positions first
    ///   in each vertex
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::AccelerationBuildError`] when the index count does
    /// not describe whole triangles, or when allocation or the build fails.
    pub fn build_blas(&self, geometry: &TriangleGeometry<'_>) -> RhiResult<AccelerationStructure> {
        let primitives = primitive_count(geometry.index_count)?;
        if geometry.vertex_count == 0 {
            return Err(RhiError::AccelerationBuildError(
                "mesh has no vertices".to_string(),
            ));
        }

        let (vertex_data, index_data) = if self.host_build {
            (
                vk::DeviceOrHostAddressConstKHR {
                    host_address: geometry.vertices.mapped_ptr()?.cast_const().cast(),
                },
                vk::DeviceOrHostAddressConstKHR {
                    host_address: geometry.indices.mapped_ptr()?.cast_const().cast(),
                },
            )
        } else {
            (
                vk::DeviceOrHostAddressConstKHR {
                    device_address: geometry.vertices.device_address(),
                },
                vk::DeviceOrHostAddressConstKHR {
                    device_address: geometry.indices.device_address(),
                },
            )
        };

        let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
            .vertex_format(vk::Format::R32G32B32_SFLOAT)
            .vertex_data(vertex_data)
            .vertex_stride(geometry.vertex_stride)
            .max_vertex(geometry.vertex_count - 1)
            .index_type(vk::IndexType::UINT32)
            .index_data(index_data);
        let geometry = vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
            .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
            .flags(vk::GeometryFlagsKHR::OPAQUE);

        self.build(AccelerationLevel::Bottom, &geometry, primitives)
    }

    /// Builds the TLAS over `instances`. The packed instance buffer only
    /// lives for the duration of the build.
    ///
    /// # Arguments
    ///
    /// * `instances` - One entry per geometry, custom indices `0..len`
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::AccelerationBuildError`] for an empty instance
    /// list or invalid custom indices, and propagates allocation and build
    /// failures.
    pub fn build_tlas(&self, instances: &[InstanceDesc]) -> RhiResult<AccelerationStructure> {
        if instances.is_empty() {
            return Err(RhiError::AccelerationBuildError(
                "scene has no instances".to_string(),
            ));
        }
        validate_custom_indices(instances)?;

        let packed: Vec<vk::AccelerationStructureInstanceKHR> =
            instances.iter().map(|i| i.to_vk(self.host_build)).collect();
        let bytes = unsafe {
            std::slice::from_raw_parts(
                packed.as_ptr().cast::<u8>(),
                std::mem::size_of_val(packed.as_slice()),
            )
        };
        let instance_buffer =
            Buffer::new_with_data(self.device.clone(), BufferUsage::InstanceInput, bytes)?;

        let data = if self.host_build {
            vk::DeviceOrHostAddressConstKHR {
                host_address: instance_buffer.mapped_ptr()?.cast_const().cast(),
            }
        } else {
            vk::DeviceOrHostAddressConstKHR {
                device_address: instance_buffer.device_address(),
            }
        };
        let instances_data = vk::AccelerationStructureGeometryInstancesDataKHR::default()
            .array_of_pointers(false)
            .data(data);
        let geometry = vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::INSTANCES)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                instances: instances_data,
            });

        let tlas = self.build(AccelerationLevel::Top, &geometry, instances.len() as u32)?;
        drop(instance_buffer);
        Ok(tlas)
    }

    fn build(
        &self,
        level: AccelerationLevel,
        geometry: &vk::AccelerationStructureGeometryKHR,
        primitive_count: u32,
    ) -> RhiResult<AccelerationStructure> {
        let loader = self.device.acceleration_structure_loader();
        let build_type = if self.host_build {
            vk::AccelerationStructureBuildTypeKHR::HOST
        } else {
            vk::AccelerationStructureBuildTypeKHR::DEVICE
        };

        let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(level.to_vk())
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(std::slice::from_ref(geometry));

        let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            loader.get_acceleration_structure_build_sizes(
                build_type,
                &build_info,
                &[primitive_count],
                &mut sizes,
            );
        }
        debug!(
            "{:?}-level build sizes: structure {} bytes, scratch {} bytes",
            level, sizes.acceleration_structure_size, sizes.build_scratch_size
        );

        let location = if self.host_build {
            MemoryLocation::CpuToGpu
        } else {
            MemoryLocation::GpuOnly
        };
        let buffer = Buffer::new_in(
            self.device.clone(),
            BufferUsage::AccelerationStructure,
            sizes.acceleration_structure_size,
            location,
        )?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(buffer.handle())
            .size(sizes.acceleration_structure_size)
            .ty(level.to_vk());
        let handle = unsafe { loader.create_acceleration_structure(&create_info, None)? };

        // From here the structure owns the handle and destroys it on error.
        let mut structure = AccelerationStructure {
            device: self.device.clone(),
            handle,
            address: 0,
            level,
            primitive_count,
            buffer,
        };
        build_info = build_info.dst_acceleration_structure(handle);
        let range = vk::AccelerationStructureBuildRangeInfoKHR::default()
            .primitive_count(primitive_count);

        if self.host_build {
            let mut scratch = vec![0u8; sizes.build_scratch_size.max(1) as usize];
            build_info = build_info.scratch_data(vk::DeviceOrHostAddressKHR {
                host_address: scratch.as_mut_ptr().cast(),
            });
            unsafe {
                loader
                    .build_acceleration_structures(
                        vk::DeferredOperationKHR::null(),
                        std::slice::from_ref(&build_info),
                        &[std::slice::from_ref(&range)],
                    )
                    .map_err(|e| {
                        RhiError::AccelerationBuildError(format!("host build failed: {e}"))
                    })?;
            }
            drop(scratch);
        } else {
            let alignment = u64::from(self.device.ray_tracing_properties().scratch_offset_alignment)
                .max(1)
                .next_power_of_two();
            let scratch = Buffer::new(
                self.device.clone(),
                BufferUsage::Scratch,
                sizes.build_scratch_size.max(1) + alignment,
            )?;
            build_info = build_info.scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: align_up(scratch.device_address(), alignment),
            });
            self.pool
                .submit_one_shot(self.queue, |cmd| {
                    cmd.build_acceleration_structure(&build_info, &range);
                    Ok(())
                })
                .map_err(|e| RhiError::AccelerationBuildError(format!("device build failed: {e}")))?;
            drop(scratch);
        }

        let address_info =
            vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(handle);
        structure.address = unsafe { loader.get_acceleration_structure_device_address(&address_info) };

        debug!(
            "Built {:?}-level acceleration structure: {} primitives, {} bytes",
            level,
            primitive_count,
            structure.size()
        );
        Ok(structure)
    }
}

/// Owner of every acceleration structure of a scene.
pub struct AccelerationStructureStore {
    arena: ResourceArena<AccelerationStructure>,
    creation_order: Vec<Handle<AccelerationStructure>>,
}

impl AccelerationStructureStore {
    pub fn new() -> Self {
        Self {
            arena: ResourceArena::new(),
            creation_order: Vec::new(),
        }
    }

    pub fn insert(&mut self, structure: AccelerationStructure) -> Handle<AccelerationStructure> {
        let handle = self.arena.insert(structure);
        self.creation_order.push(handle);
        handle
    }

    pub fn get(&self, handle: Handle<AccelerationStructure>) -> RhiResult<&AccelerationStructure> {
        self.arena.get(handle)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.arena.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    /// Destroys every structure, newest first. Safe to call twice.
    pub fn destroy_all(&mut self) {
        while let Some(handle) = self.creation_order.pop() {
            // already removed handles are skipped
            if let Ok(structure) = self.arena.remove(handle) {
                drop(structure);
            }
        }
    }
}

impl Default for AccelerationStructureStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AccelerationStructureStore {
    fn drop(&mut self) {
        self.destroy_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(custom_index: u32) -> InstanceDesc {
        InstanceDesc {
            transform: IDENTITY_TRANSFORM,
            custom_index,
            mask: VISIBLE_TO_ALL,
            flags: vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE,
            blas_address: 0x1000 + u64::from(custom_index) * 0x100,
            blas_handle: vk::AccelerationStructureKHR::null(),
        }
    }

    #[test]
    fn test_primitive_count_is_a_third_of_indices() {
        for triangles in [1u32, 2, 12, 1000] {
            assert_eq!(primitive_count(triangles * 3).unwrap() * 3, triangles * 3);
        }
    }

    #[test]
    fn test_empty_mesh_fails_to_build() {
        assert!(matches!(
            primitive_count(0),
            Err(RhiError::AccelerationBuildError(_))
        ));
        assert!(primitive_count(4).is_err());
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 128), 0);
        assert_eq!(align_up(1, 128), 128);
        assert_eq!(align_up(256, 128), 256);
        assert_eq!(align_up(257, 256), 512);
    }

    #[test]
    fn test_instance_packing() {
        let packed = desc(7).to_vk(false);
        assert_eq!(packed.instance_custom_index_and_mask.low_24(), 7);
        assert_eq!(packed.instance_custom_index_and_mask.high_8(), 0xFF);
        assert_eq!(
            packed
                .instance_shader_binding_table_record_offset_and_flags
                .high_8(),
            vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw() as u8
        );
        assert_eq!(
            packed
                .instance_shader_binding_table_record_offset_and_flags
                .low_24(),
            0
        );
        assert_eq!(packed.transform.matrix, IDENTITY_TRANSFORM);
        assert_eq!(unsafe { packed.acceleration_structure_reference.device_handle }, 0x1700);
    }

    #[test]
    fn test_instance_record_is_64_bytes() {
        assert_eq!(std::mem::size_of::<vk::AccelerationStructureInstanceKHR>(), 64);
    }

    #[test]
    fn test_custom_indices_must_be_contiguous_and_unique() {
        let ok: Vec<_> = [2, 0, 1].into_iter().map(desc).collect();
        assert!(validate_custom_indices(&ok).is_ok());

        let duplicate: Vec<_> = [0, 1, 1].into_iter().map(desc).collect();
        assert!(validate_custom_indices(&duplicate).is_err());

        let gap: Vec<_> = [0, 1, 3].into_iter().map(desc).collect();
        assert!(validate_custom_indices(&gap).is_err());
    }
}
