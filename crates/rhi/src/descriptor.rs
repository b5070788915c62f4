//! Descriptor set management for shader resource binding.
//!
//! - [`DescriptorSetLayout`] defines the layout of shader bindings, optionally
//!   with per-binding flags for partially bound arrays
//! - [`DescriptorPool`] manages allocation of descriptor sets
//! - [`DescriptorWrites`] collects buffer, image and acceleration structure
//!   writes and applies them in one `vkUpdateDescriptorSets` call
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ash::vk;
//! use restir_rhi::device::Device;
//! use restir_rhi::descriptor::{DescriptorBindingBuilder, DescriptorPool, DescriptorSetLayout};
//!
//! # fn example(device: Arc<Device>) -> Result<(), restir_rhi::RhiError> {
//! let bindings = [
//!     DescriptorBindingBuilder::acceleration_structure(0, vk::ShaderStageFlags::RAYGEN_KHR),
//!     DescriptorBindingBuilder::storage_image(1, vk::ShaderStageFlags::RAYGEN_KHR),
//! ];
//! let layout = DescriptorSetLayout::new(device.clone(), &bindings)?;
//! let pool = DescriptorPool::for_layout(device, &bindings, 3)?;
//! let sets = pool.allocate(&[layout.handle(); 3])?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::device::Device;
use crate::error::RhiResult;

/// Descriptor set layout wrapper.
pub struct DescriptorSetLayout {
    device: Arc<Device>,
    layout: vk::DescriptorSetLayout,
}

impl DescriptorSetLayout {
    /// Creates a layout where every binding must be written before use.
    ///
    /// # Errors
    ///
    /// Returns an error if layout creation fails.
    pub fn new(
        device: Arc<Device>,
        bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> RhiResult<Self> {
        Self::with_flags(device, bindings, &[])
    }

    /// Creates a layout with per-binding flags.
    ///
    /// `flags` is either empty or has one entry per binding, in the same
    /// order.
    ///
    /// # Arguments
    ///
    /// * `device` - The logical device
    /// * `bindings` - Layout bindings, one per binding number
    /// * `flags` - Per-binding flags such as `PARTIALLY_BOUND`
    ///
    /// # Errors
    ///
    /// Returns an error if layout creation fails, which includes a device
    /// without the descriptor indexing feature a flag needs.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use std::sync::Arc;
    /// use ash::vk;
    /// use restir_rhi::device::Device;
    /// use restir_rhi::descriptor::{DescriptorBindingBuilder, DescriptorSetLayout};
    ///
    /// # fn example(device: Arc<Device>) -> Result<(), restir_rhi::RhiError> {
    /// let stages = vk::ShaderStageFlags::CLOSEST_HIT_KHR;
    /// let bindings = [
    ///     DescriptorBindingBuilder::uniform_buffer(0, stages),
    ///     DescriptorBindingBuilder::combined_image_sampler_array(1, 16, stages),
    /// ];
    /// let flags = [
    ///     vk::DescriptorBindingFlags::empty(),
    ///     vk::DescriptorBindingFlags::PARTIALLY_BOUND,
    /// ];
    /// let layout = DescriptorSetLayout::with_flags(device, &bindings, &flags)?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn with_flags(
        device: Arc<Device>,
        bindings: &[vk::DescriptorSetLayoutBinding],
        flags: &[vk::DescriptorBindingFlags],
    ) -> RhiResult<Self> {
        let mut flags_info =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(flags);
        let mut create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(bindings);
        if !flags.is_empty() {
            debug_assert_eq!(flags.len(), bindings.len());
            create_info = create_info.push_next(&mut flags_info);
        }

        let layout = unsafe {
            device
                .handle()
                .create_descriptor_set_layout(&create_info, None)?
        };

        debug!(
            "Created descriptor set layout with {} binding(s)",
            bindings.len()
        );

        Ok(Self { device, layout })
    }

    #[inline]
    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device
                .handle()
                .destroy_descriptor_set_layout(self.layout, None);
        }
        debug!("Destroyed descriptor set layout");
    }
}

/// Pool sizes needed to allocate `sets` copies of a layout.
pub fn pool_sizes_for(
    bindings: &[vk::DescriptorSetLayoutBinding],
    sets: u32,
) -> Vec<vk::DescriptorPoolSize> {
    let mut totals: BTreeMap<i32, u32> = BTreeMap::new();
    for binding in bindings {
        *totals.entry(binding.descriptor_type.as_raw()).or_default() +=
            binding.descriptor_count * sets;
    }
    totals
        .into_iter()
        .filter(|&(_, count)| count > 0)
        .map(|(ty, count)| {
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::from_raw(ty))
                .descriptor_count(count)
        })
        .collect()
}

/// Descriptor pool for allocating descriptor sets.
///
/// Pool operations are not thread-safe; the renderer only touches its pool
/// from the control thread.
pub struct DescriptorPool {
    device: Arc<Device>,
    pool: vk::DescriptorPool,
    max_sets: u32,
}

impl DescriptorPool {
    /// Creates a pool whose sets can be freed individually.
    ///
    /// # Arguments
    ///
    /// * `device` - The logical device
    /// * `max_sets` - Maximum number of sets allocated at once
    /// * `pool_sizes` - Descriptor counts per type across all sets
    ///
    /// # Errors
    ///
    /// Returns an error if pool creation fails.
    pub fn new(
        device: Arc<Device>,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> RhiResult<Self> {
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes)
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET);

        let pool = unsafe { device.handle().create_descriptor_pool(&create_info, None)? };

        debug!(
            "Created descriptor pool: max_sets={}, pool_sizes={}",
            max_sets,
            pool_sizes.len()
        );

        Ok(Self {
            device,
            pool,
            max_sets,
        })
    }

    /// Creates a pool sized for exactly `sets` sets of one layout.
    ///
    /// # Errors
    ///
    /// Returns an error if pool creation fails.
    pub fn for_layout(
        device: Arc<Device>,
        bindings: &[vk::DescriptorSetLayoutBinding],
        sets: u32,
    ) -> RhiResult<Self> {
        Self::new(device, sets, &pool_sizes_for(bindings, sets))
    }

    /// Allocates one set per entry of `layouts`.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool has run out of sets or descriptors.
    pub fn allocate(
        &self,
        layouts: &[vk::DescriptorSetLayout],
    ) -> RhiResult<Vec<vk::DescriptorSet>> {
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(layouts);

        let sets = unsafe { self.device.handle().allocate_descriptor_sets(&alloc_info)? };

        debug!("Allocated {} descriptor set(s)", sets.len());

        Ok(sets)
    }

    #[inline]
    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }

    #[inline]
    pub fn max_sets(&self) -> u32 {
        self.max_sets
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        unsafe {
            self.device
                .handle()
                .destroy_descriptor_pool(self.pool, None);
        }
        debug!("Destroyed descriptor pool");
    }
}

enum WriteKind {
    Buffers(Vec<vk::DescriptorBufferInfo>),
    Images(Vec<vk::DescriptorImageInfo>),
    AccelerationStructure(vk::AccelerationStructureKHR),
}

struct PendingWrite {
    set: vk::DescriptorSet,
    binding: u32,
    element: u32,
    ty: vk::DescriptorType,
    kind: WriteKind,
}

/// Batch of descriptor writes.
///
/// The info arrays are owned by the batch so the `vk::WriteDescriptorSet`
/// pointers stay valid until [`DescriptorWrites::apply`] returns.
#[derive(Default)]
pub struct DescriptorWrites {
    writes: Vec<PendingWrite>,
}

impl DescriptorWrites {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffers(
        &mut self,
        set: vk::DescriptorSet,
        binding: u32,
        ty: vk::DescriptorType,
        infos: Vec<vk::DescriptorBufferInfo>,
    ) -> &mut Self {
        if !infos.is_empty() {
            self.writes.push(PendingWrite {
                set,
                binding,
                element: 0,
                ty,
                kind: WriteKind::Buffers(infos),
            });
        }
        self
    }

    pub fn images(
        &mut self,
        set: vk::DescriptorSet,
        binding: u32,
        ty: vk::DescriptorType,
        infos: Vec<vk::DescriptorImageInfo>,
    ) -> &mut Self {
        if !infos.is_empty() {
            self.writes.push(PendingWrite {
                set,
                binding,
                element: 0,
                ty,
                kind: WriteKind::Images(infos),
            });
        }
        self
    }

    /// Writes one image into array element `element` of a (partially
    /// bound) array binding.
    pub fn image_at(
        &mut self,
        set: vk::DescriptorSet,
        binding: u32,
        element: u32,
        ty: vk::DescriptorType,
        info: vk::DescriptorImageInfo,
    ) -> &mut Self {
        self.writes.push(PendingWrite {
            set,
            binding,
            element,
            ty,
            kind: WriteKind::Images(vec![info]),
        });
        self
    }

    pub fn acceleration_structure(
        &mut self,
        set: vk::DescriptorSet,
        binding: u32,
        tlas: vk::AccelerationStructureKHR,
    ) -> &mut Self {
        self.writes.push(PendingWrite {
            set,
            binding,
            element: 0,
            ty: vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
            kind: WriteKind::AccelerationStructure(tlas),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Descriptors queued for `binding` across every set.
    pub fn descriptor_count(&self, binding: u32) -> usize {
        self.writes
            .iter()
            .filter(|w| w.binding == binding)
            .map(|w| match &w.kind {
                WriteKind::Buffers(infos) => infos.len(),
                WriteKind::Images(infos) => infos.len(),
                WriteKind::AccelerationStructure(_) => 1,
            })
            .sum()
    }

    /// Array elements queued for `binding` in `set`, in write order.
    pub fn array_elements(&self, set: vk::DescriptorSet, binding: u32) -> Vec<u32> {
        self.writes
            .iter()
            .filter(|w| w.set == set && w.binding == binding)
            .map(|w| w.element)
            .collect()
    }

    /// Applies every collected write.
    pub fn apply(&self, device: &Device) {
        if self.writes.is_empty() {
            return;
        }

        let tlas_handles: Vec<[vk::AccelerationStructureKHR; 1]> = self
            .writes
            .iter()
            .map(|w| match w.kind {
                WriteKind::AccelerationStructure(handle) => [handle],
                _ => [vk::AccelerationStructureKHR::null()],
            })
            .collect();
        let mut as_infos: Vec<vk::WriteDescriptorSetAccelerationStructureKHR<'_>> = tlas_handles
            .iter()
            .map(|handles| {
                vk::WriteDescriptorSetAccelerationStructureKHR::default()
                    .acceleration_structures(handles)
            })
            .collect();

        let mut vk_writes = Vec::with_capacity(self.writes.len());
        for (write, as_info) in self.writes.iter().zip(as_infos.iter_mut()) {
            let base = vk::WriteDescriptorSet::default()
                .dst_set(write.set)
                .dst_binding(write.binding)
                .dst_array_element(write.element)
                .descriptor_type(write.ty);
            let vk_write = match &write.kind {
                WriteKind::Buffers(infos) => base.buffer_info(infos),
                WriteKind::Images(infos) => base.image_info(infos),
                WriteKind::AccelerationStructure(_) => {
                    let mut w = base.push_next(as_info);
                    w.descriptor_count = 1;
                    w
                }
            };
            vk_writes.push(vk_write);
        }

        unsafe {
            device.handle().update_descriptor_sets(&vk_writes, &[]);
        }

        debug!("Applied {} descriptor write(s)", vk_writes.len());
    }
}

#[inline]
pub fn buffer_info(
    buffer: vk::Buffer,
    offset: vk::DeviceSize,
    range: vk::DeviceSize,
) -> vk::DescriptorBufferInfo {
    vk::DescriptorBufferInfo::default()
        .buffer(buffer)
        .offset(offset)
        .range(range)
}

#[inline]
pub fn image_info(
    sampler: vk::Sampler,
    image_view: vk::ImageView,
    image_layout: vk::ImageLayout,
) -> vk::DescriptorImageInfo {
    vk::DescriptorImageInfo::default()
        .sampler(sampler)
        .image_view(image_view)
        .image_layout(image_layout)
}

/// Shorthand constructors for layout bindings.
pub struct DescriptorBindingBuilder;

impl DescriptorBindingBuilder {
    #[inline]
    pub fn binding(
        binding: u32,
        ty: vk::DescriptorType,
        count: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> vk::DescriptorSetLayoutBinding<'static> {
        vk::DescriptorSetLayoutBinding::default()
            .binding(binding)
            .descriptor_type(ty)
            .descriptor_count(count)
            .stage_flags(stage_flags)
    }

    #[inline]
    pub fn uniform_buffer(
        binding: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> vk::DescriptorSetLayoutBinding<'static> {
        Self::binding(binding, vk::DescriptorType::UNIFORM_BUFFER, 1, stage_flags)
    }

    #[inline]
    pub fn storage_buffer(
        binding: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> vk::DescriptorSetLayoutBinding<'static> {
        Self::binding(binding, vk::DescriptorType::STORAGE_BUFFER, 1, stage_flags)
    }

    /// One storage buffer per element, indexed in shaders by custom index.
    #[inline]
    pub fn storage_buffer_array(
        binding: u32,
        count: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> vk::DescriptorSetLayoutBinding<'static> {
        Self::binding(binding, vk::DescriptorType::STORAGE_BUFFER, count, stage_flags)
    }

    #[inline]
    pub fn combined_image_sampler_array(
        binding: u32,
        count: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> vk::DescriptorSetLayoutBinding<'static> {
        Self::binding(
            binding,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            count,
            stage_flags,
        )
    }

    #[inline]
    pub fn storage_image(
        binding: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> vk::DescriptorSetLayoutBinding<'static> {
        Self::binding(binding, vk::DescriptorType::STORAGE_IMAGE, 1, stage_flags)
    }

    #[inline]
    pub fn acceleration_structure(
        binding: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> vk::DescriptorSetLayoutBinding<'static> {
        Self::binding(
            binding,
            vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
            1,
            stage_flags,
        )
    }
}
