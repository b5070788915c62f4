//! Surface-dependent resources and the pre-recorded frame command buffers.
//!
//! Everything here is sized to the swapchain and is thrown away on resize:
//! the render target, the reservoir images, the accumulator, the capture
//! readback buffer, the descriptor sets and one command buffer per
//! `(phase, slot, image)`.

use std::sync::Arc;

use ash::vk;
use tracing::{debug, info};

use restir_rhi::barrier::{BarrierTable, ResourceState as R};
use restir_rhi::buffer::{Buffer, BufferUsage};
use restir_rhi::command::{CommandBuffer, CommandPool};
use restir_rhi::descriptor::{DescriptorPool, DescriptorWrites};
use restir_rhi::device::Device;
use restir_rhi::image::{COLOR_LAYERS, COLOR_RANGE, FLOAT_IMAGE_FORMAT, StorageImage};

use crate::SLOT_COUNT;
use crate::bindings;
use crate::capture::CapturePhase;
use crate::error::{RendererError, RendererResult};
use crate::pipelines::{Pipelines, group_count};
use crate::scene_gpu::GpuScene;

/// Labels in [`bindings::RESERVOIRS`] order.
const RESERVOIR_LABELS: [&str; 8] = [
    "reservoir present",
    "reservoir position",
    "reservoir normal",
    "reservoir material",
    "reservoir past",
    "history position",
    "history normal",
    "history material",
];
const CURRENT_COUNT: usize = bindings::CURRENT_RESERVOIRS.len();

/// States of the two reservoir groups while one pass runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReservoirStates {
    pub current: R,
    pub history: R,
}

/// Generate writes the current group and samples history at the
/// reprojected pixel.
pub const GENERATE_STATES: ReservoirStates = ReservoirStates {
    current: R::RayTraceWrite,
    history: R::RayTraceRead,
};

/// Spatial reuse reads the current group and writes the history group.
pub const SPATIAL_STATES: ReservoirStates = ReservoirStates {
    current: R::ComputeRead,
    history: R::ComputeWrite,
};

/// Bytes per texel of the render target and the readback buffer.
pub const READBACK_TEXEL_SIZE: u64 = 4;

/// Sizes and indexing of the surface-dependent resources.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TargetLayout {
    pub width: u32,
    pub height: u32,
    pub image_count: usize,
}

impl TargetLayout {
    pub fn new(extent: vk::Extent2D, image_count: usize) -> Self {
        Self {
            width: extent.width,
            height: extent.height,
            image_count,
        }
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.width,
            height: self.height,
        }
    }

    /// Number of pre-recorded command buffers.
    #[inline]
    pub fn recording_count(&self) -> usize {
        CapturePhase::ALL.len() * SLOT_COUNT * self.image_count
    }

    /// Flat index of the recording for `(phase, slot, image)`.
    pub fn recording_index(&self, phase: CapturePhase, slot: usize, image: usize) -> Option<usize> {
        (slot < SLOT_COUNT && image < self.image_count)
            .then(|| (phase.index() * SLOT_COUNT + slot) * self.image_count + image)
    }

    /// Inverse of [`TargetLayout::recording_index`].
    pub fn recording_key(&self, index: usize) -> Option<(CapturePhase, usize, usize)> {
        if index >= self.recording_count() {
            return None;
        }
        let image = index % self.image_count;
        let rest = index / self.image_count;
        let slot = rest % SLOT_COUNT;
        let phase = CapturePhase::ALL[rest / SLOT_COUNT];
        Some((phase, slot, image))
    }

    #[inline]
    pub fn readback_size(&self) -> vk::DeviceSize {
        u64::from(self.width) * u64::from(self.height) * READBACK_TEXEL_SIZE
    }

    #[inline]
    pub fn row_pitch(&self) -> usize {
        self.width as usize * READBACK_TEXEL_SIZE as usize
    }

    /// Compute workgroups covering every pixel.
    #[inline]
    pub fn group_counts(&self) -> (u32, u32) {
        (group_count(self.width), group_count(self.height))
    }

    fn extent_3d(&self) -> vk::Extent3D {
        vk::Extent3D {
            width: self.width,
            height: self.height,
            depth: 1,
        }
    }

    pub fn image_copy(&self) -> vk::ImageCopy {
        vk::ImageCopy::default()
            .src_subresource(COLOR_LAYERS)
            .dst_subresource(COLOR_LAYERS)
            .extent(self.extent_3d())
    }

    /// Tightly packed copy of the whole image.
    pub fn readback_copy(&self) -> vk::BufferImageCopy {
        vk::BufferImageCopy::default()
            .buffer_offset(0)
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(COLOR_LAYERS)
            .image_extent(self.extent_3d())
    }
}

/// Descriptor infos of one slot's uniform buffers.
#[derive(Clone, Copy, Debug)]
pub struct SlotUniformInfos {
    pub frame: vk::DescriptorBufferInfo,
    pub sizes: vk::DescriptorBufferInfo,
    pub motion: vk::DescriptorBufferInfo,
    pub accum: vk::DescriptorBufferInfo,
}

/// Inputs shared by every recording.
pub struct TargetInputs<'a> {
    pub pipelines: &'a Pipelines,
    pub scene: &'a GpuScene,
    pub barriers: &'a BarrierTable,
    /// One entry per slot.
    pub uniforms: &'a [SlotUniformInfos],
    pub swapchain_images: &'a [vk::Image],
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub queue: vk::Queue,
    pub queue_family: u32,
}

/// Surface-dependent images, descriptor sets and recordings.
pub struct FrameTargets {
    // the pool frees the recordings
    recordings: Vec<CommandBuffer>,
    command_pool: CommandPool,
    sets: Vec<vk::DescriptorSet>,
    descriptor_pool: DescriptorPool,
    readback: Buffer,
    accumulator: StorageImage,
    reservoirs: Vec<StorageImage>,
    render_target: StorageImage,
    layout: TargetLayout,
}

impl FrameTargets {
    /// Creates and clears the images, writes one descriptor set per slot
    /// and records every `(phase, slot, image)` command buffer.
    pub fn new(device: Arc<Device>, inputs: &TargetInputs<'_>) -> RendererResult<Self> {
        if inputs.uniforms.len() != SLOT_COUNT {
            return Err(RendererError::Frame(format!(
                "{} uniform sets for {} slots",
                inputs.uniforms.len(),
                SLOT_COUNT
            )));
        }
        let layout = TargetLayout::new(inputs.extent, inputs.swapchain_images.len());

        let render_target = StorageImage::new(
            device.clone(),
            "render target",
            inputs.extent,
            inputs.format,
            vk::ImageUsageFlags::TRANSFER_SRC,
        )?;
        let reservoirs = RESERVOIR_LABELS
            .iter()
            .map(|&label| {
                StorageImage::new(
                    device.clone(),
                    label,
                    inputs.extent,
                    FLOAT_IMAGE_FORMAT,
                    vk::ImageUsageFlags::empty(),
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        let accumulator = StorageImage::new(
            device.clone(),
            "accumulator",
            inputs.extent,
            FLOAT_IMAGE_FORMAT,
            vk::ImageUsageFlags::empty(),
        )?;
        let readback = Buffer::new(device.clone(), BufferUsage::Readback, layout.readback_size())?;

        let command_pool = CommandPool::new(device.clone(), inputs.queue_family)?;

        let layout_bindings = bindings::layout_bindings(inputs.scene.geometry_count());
        let descriptor_pool =
            DescriptorPool::for_layout(device.clone(), &layout_bindings, SLOT_COUNT as u32)?;
        let set_layouts = [inputs.pipelines.set_layout().handle(); SLOT_COUNT];
        let sets = descriptor_pool.allocate(&set_layouts)?;

        let mut targets = Self {
            recordings: Vec::new(),
            command_pool,
            sets,
            descriptor_pool,
            readback,
            accumulator,
            reservoirs,
            render_target,
            layout,
        };
        targets.write_descriptors(&device, inputs)?;
        targets.clear(inputs)?;
        targets.record(inputs)?;

        info!(
            "Frame targets ready: {}x{}, {} recordings",
            layout.width,
            layout.height,
            targets.recordings.len()
        );
        Ok(targets)
    }

    #[inline]
    pub fn layout(&self) -> &TargetLayout {
        &self.layout
    }

    #[inline]
    pub fn descriptor_pool(&self) -> &DescriptorPool {
        &self.descriptor_pool
    }

    /// The recording to submit for `(phase, slot, image)`.
    pub fn recording(
        &self,
        phase: CapturePhase,
        slot: usize,
        image: usize,
    ) -> RendererResult<vk::CommandBuffer> {
        self.layout
            .recording_index(phase, slot, image)
            .and_then(|i| self.recordings.get(i))
            .map(CommandBuffer::handle)
            .ok_or_else(|| {
                RendererError::Frame(format!(
                    "no recording for {:?}, slot {}, image {}",
                    phase, slot, image
                ))
            })
    }

    /// Mapped capture readback, one BGRA or RGBA texel per pixel.
    pub fn readback(&self) -> RendererResult<&[u8]> {
        Ok(self.readback.read_data()?)
    }

    fn write_descriptors(&self, device: &Device, inputs: &TargetInputs<'_>) -> RendererResult<()> {
        use vk::DescriptorType as T;

        let tlas = inputs.scene.tlas()?;
        let vertices = inputs.scene.vertex_infos();
        let indices = inputs.scene.index_infos();
        let materials = inputs.scene.material_infos();
        let lights = inputs.scene.light_info();
        let textures = inputs.scene.texture_infos();

        let mut writes = DescriptorWrites::new();
        for (&set, uniforms) in self.sets.iter().zip(inputs.uniforms) {
            writes
                .acceleration_structure(set, bindings::TLAS, tlas)
                .images(
                    set,
                    bindings::OUTPUT_IMAGE,
                    T::STORAGE_IMAGE,
                    vec![self.render_target.descriptor_info()],
                )
                .buffers(set, bindings::CAMERA, T::UNIFORM_BUFFER, vec![uniforms.frame])
                .buffers(set, bindings::VERTICES, T::STORAGE_BUFFER, vertices.clone())
                .buffers(set, bindings::INDICES, T::STORAGE_BUFFER, indices.clone())
                .buffers(set, bindings::MATERIALS, T::STORAGE_BUFFER, materials.clone())
                .buffers(set, bindings::LIGHTS, T::STORAGE_BUFFER, vec![lights])
                .buffers(set, bindings::SIZES, T::UNIFORM_BUFFER, vec![uniforms.sizes])
                .buffers(set, bindings::MOTION, T::UNIFORM_BUFFER, vec![uniforms.motion])
                .images(
                    set,
                    bindings::ACCUMULATOR,
                    T::STORAGE_IMAGE,
                    vec![self.accumulator.descriptor_info()],
                )
                .buffers(set, bindings::ACCUM_INFO, T::UNIFORM_BUFFER, vec![uniforms.accum]);
            for (&binding, image) in bindings::RESERVOIRS.iter().zip(&self.reservoirs) {
                writes.images(set, binding, T::STORAGE_IMAGE, vec![image.descriptor_info()]);
            }
            queue_texture_writes(&mut writes, set, &textures);
        }
        writes.apply(device);
        debug!("Wrote {} descriptor updates", writes.len());
        Ok(())
    }

    /// Clears every image and leaves it in the state the first recording
    /// expects.
    fn clear(&self, inputs: &TargetInputs<'_>) -> RendererResult<()> {
        let barriers = inputs.barriers;
        let all: Vec<vk::Image> = self
            .reservoirs
            .iter()
            .chain([&self.accumulator, &self.render_target])
            .map(StorageImage::image)
            .collect();
        let (current, history) = self.reservoir_groups();
        let zero = vk::ClearColorValue {
            float32: [0.0; 4],
        };

        self.command_pool.submit_one_shot(inputs.queue, |cmd| {
            barriers.transition_images(cmd, R::Undefined, R::TransferDst, &all)?;
            for &image in &all {
                cmd.clear_color_image(image, R::TransferDst.layout(), &zero, &COLOR_RANGE);
            }
            barriers.transition_images(cmd, R::TransferDst, SPATIAL_STATES.current, &current)?;
            barriers.transition_images(cmd, R::TransferDst, SPATIAL_STATES.history, &history)?;
            barriers.transition_images(
                cmd,
                R::TransferDst,
                R::ComputeReadWrite,
                &[self.accumulator.image()],
            )?;
            barriers.transition_images(
                cmd,
                R::TransferDst,
                R::RayTraceWrite,
                &[self.render_target.image()],
            )
        })?;
        debug!("Cleared {} surface images", all.len());
        Ok(())
    }

    /// Current and history reservoir images.
    fn reservoir_groups(&self) -> (Vec<vk::Image>, Vec<vk::Image>) {
        let (current, history) = self.reservoirs.split_at(CURRENT_COUNT);
        (
            current.iter().map(StorageImage::image).collect(),
            history.iter().map(StorageImage::image).collect(),
        )
    }

    fn record(&mut self, inputs: &TargetInputs<'_>) -> RendererResult<()> {
        let recordings = self
            .command_pool
            .allocate(self.layout.recording_count() as u32)?;
        for (index, cmd) in recordings.iter().enumerate() {
            let (phase, slot, image) = self.layout.recording_key(index).ok_or_else(|| {
                RendererError::Frame(format!("recording {} out of range", index))
            })?;
            self.record_frame(cmd, inputs, phase, slot, image)?;
        }
        self.recordings = recordings;
        Ok(())
    }

    /// Generate, spatial reuse, optional accumulation, copy-out.
    fn record_frame(
        &self,
        cmd: &CommandBuffer,
        inputs: &TargetInputs<'_>,
        phase: CapturePhase,
        slot: usize,
        image: usize,
    ) -> RendererResult<()> {
        let barriers = inputs.barriers;
        let pipelines = inputs.pipelines;
        let layout = pipelines.layout().handle();
        let set = self.sets[slot];
        let swapchain_image = inputs.swapchain_images[image];
        let rt = self.render_target.image();
        let accumulator = [self.accumulator.image()];
        let (current, history) = self.reservoir_groups();
        let (groups_x, groups_y) = self.layout.group_counts();

        cmd.begin_reusable()?;

        // generate
        let ray_tracing = pipelines.ray_tracing();
        cmd.bind_pipeline(ray_tracing.bind_point(), ray_tracing.handle());
        cmd.bind_descriptor_set(ray_tracing.bind_point(), layout, set);
        barriers.transition_images(cmd, SPATIAL_STATES.current, GENERATE_STATES.current, &current)?;
        barriers.transition_images(cmd, SPATIAL_STATES.history, GENERATE_STATES.history, &history)?;
        let sbt = pipelines.sbt();
        cmd.trace_rays(
            sbt.raygen_region(),
            sbt.miss_region(),
            sbt.hit_region(),
            self.layout.width,
            self.layout.height,
        );

        // spatial reuse
        barriers.transition_images(cmd, GENERATE_STATES.current, SPATIAL_STATES.current, &current)?;
        barriers.transition_images(cmd, GENERATE_STATES.history, SPATIAL_STATES.history, &history)?;
        let spatial = pipelines.spatial();
        cmd.bind_pipeline(spatial.bind_point(), spatial.handle());
        cmd.bind_descriptor_set(spatial.bind_point(), layout, set);
        cmd.dispatch(groups_x, groups_y, 1);

        // accumulation leaves the render target ready for copy-out
        match phase {
            CapturePhase::Steady => {
                barriers.transition_images(cmd, R::RayTraceWrite, R::TransferSrc, &[rt])?;
            }
            CapturePhase::Accumulating | CapturePhase::Finalizing => {
                let rt_state = if phase == CapturePhase::Finalizing {
                    R::ComputeReadWrite
                } else {
                    R::ComputeRead
                };
                barriers.transition_images(cmd, R::RayTraceWrite, rt_state, &[rt])?;
                barriers.transition_images(
                    cmd,
                    R::ComputeReadWrite,
                    R::ComputeReadWrite,
                    &accumulator,
                )?;
                let accumulate = pipelines.accumulate();
                cmd.bind_pipeline(accumulate.bind_point(), accumulate.handle());
                cmd.bind_descriptor_set(accumulate.bind_point(), layout, set);
                cmd.dispatch(groups_x, groups_y, 1);
                barriers.transition_images(cmd, rt_state, R::TransferSrc, &[rt])?;
            }
        }

        // present
        barriers.transition_images(cmd, R::Undefined, R::TransferDst, &[swapchain_image])?;
        cmd.copy_image(
            rt,
            R::TransferSrc.layout(),
            swapchain_image,
            R::TransferDst.layout(),
            &self.layout.image_copy(),
        );
        barriers.transition_images(cmd, R::TransferDst, R::PresentSrc, &[swapchain_image])?;

        if phase == CapturePhase::Finalizing {
            cmd.copy_image_to_buffer(
                rt,
                R::TransferSrc.layout(),
                self.readback.handle(),
                &self.layout.readback_copy(),
            );
            barriers.transition_memory(cmd, R::TransferDst, R::HostRead)?;
        }

        barriers.transition_images(cmd, R::TransferSrc, R::RayTraceWrite, &[rt])?;
        cmd.end()?;
        Ok(())
    }
}

/// Binds each texture at its geometry's element of the texture array.
/// Elements without a texture stay unwritten.
pub fn queue_texture_writes(
    writes: &mut DescriptorWrites,
    set: vk::DescriptorSet,
    textures: &[(u32, vk::DescriptorImageInfo)],
) {
    for &(element, info) in textures {
        writes.image_at(
            set,
            bindings::TEXTURES,
            element,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            info,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use restir_resources::Scene;

    use crate::scene_gpu::texture_slots;

    fn layout(images: usize) -> TargetLayout {
        TargetLayout::new(
            vk::Extent2D {
                width: 100,
                height: 50,
            },
            images,
        )
    }

    #[test]
    fn test_recording_index_is_dense_and_invertible() {
        let layout = layout(3);
        assert_eq!(layout.recording_count(), 27);
        let mut seen = vec![false; layout.recording_count()];
        for phase in CapturePhase::ALL {
            for slot in 0..SLOT_COUNT {
                for image in 0..3 {
                    let index = layout.recording_index(phase, slot, image).unwrap();
                    assert!(!seen[index]);
                    seen[index] = true;
                    assert_eq!(layout.recording_key(index), Some((phase, slot, image)));
                }
            }
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn test_recording_index_rejects_out_of_range() {
        let layout = layout(2);
        assert_eq!(layout.recording_index(CapturePhase::Steady, SLOT_COUNT, 0), None);
        assert_eq!(layout.recording_index(CapturePhase::Steady, 0, 2), None);
        assert_eq!(layout.recording_key(layout.recording_count()), None);
    }

    #[test]
    fn test_readback_is_tightly_packed() {
        let layout = layout(3);
        assert_eq!(layout.readback_size(), 100 * 50 * 4);
        assert_eq!(layout.row_pitch(), 400);
        let copy = layout.readback_copy();
        assert_eq!(copy.buffer_row_length, 0);
        assert_eq!(copy.image_extent.width, 100);
        assert_eq!(copy.image_extent.depth, 1);
    }

    #[test]
    fn test_group_counts_cover_odd_extent() {
        assert_eq!(layout(3).group_counts(), (7, 4));
    }

    #[test]
    fn test_textured_mesh_fills_texture_array() {
        use ash::vk::Handle;
        let scene = Scene::demo();
        let geometry_count = (scene.meshes.len() + scene.lights.len()) as u32;
        let textures: Vec<(u32, vk::DescriptorImageInfo)> = texture_slots(&scene)
            .into_iter()
            .map(|(slot, _)| (slot, vk::DescriptorImageInfo::default()))
            .collect();
        assert!(!textures.is_empty());

        let set = vk::DescriptorSet::from_raw(1);
        let mut writes = DescriptorWrites::new();
        queue_texture_writes(&mut writes, set, &textures);
        assert!(writes.descriptor_count(bindings::TEXTURES) > 0);
        assert_eq!(writes.array_elements(set, bindings::TEXTURES), vec![0]);

        let layout = bindings::layout_bindings(geometry_count);
        let array = &layout[bindings::TEXTURES as usize];
        assert!(textures.iter().all(|(slot, _)| *slot < array.descriptor_count));
    }

    #[test]
    fn test_generate_only_reads_history() {
        let table = BarrierTable::standard().unwrap();
        let into_generate = table
            .lookup(SPATIAL_STATES.history, GENERATE_STATES.history)
            .unwrap();
        assert_eq!(into_generate.dst_access, vk::AccessFlags::SHADER_READ);
        assert_eq!(into_generate.src_access, vk::AccessFlags::SHADER_WRITE);
        assert_eq!(
            into_generate.dst_stage,
            vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR
        );

        let current = table
            .lookup(SPATIAL_STATES.current, GENERATE_STATES.current)
            .unwrap();
        assert_eq!(current.dst_access, vk::AccessFlags::SHADER_WRITE);

        // spatial reuse sees what generate stored before writing history
        let into_spatial = table
            .lookup(GENERATE_STATES.current, SPATIAL_STATES.current)
            .unwrap();
        assert_eq!(into_spatial.dst_access, vk::AccessFlags::SHADER_READ);
        let history_write = table
            .lookup(GENERATE_STATES.history, SPATIAL_STATES.history)
            .unwrap();
        assert_eq!(history_write.src_access, vk::AccessFlags::SHADER_READ);
        assert_eq!(history_write.dst_access, vk::AccessFlags::SHADER_WRITE);
    }

    #[test]
    fn test_reservoir_labels_follow_groups() {
        assert_eq!(RESERVOIR_LABELS.len(), bindings::RESERVOIRS.len());
        assert_eq!(bindings::RESERVOIRS[..CURRENT_COUNT], bindings::CURRENT_RESERVOIRS);
        assert_eq!(bindings::RESERVOIRS[CURRENT_COUNT..], bindings::HISTORY_RESERVOIRS);
        assert!(RESERVOIR_LABELS[CURRENT_COUNT..].iter().all(|l| !l.contains("present")));
    }

    #[test]
    fn test_frame_transitions_are_in_the_standard_table() {
        let table = BarrierTable::standard().unwrap();
        let used = [
            (R::ComputeRead, R::RayTraceWrite),
            (R::ComputeWrite, R::RayTraceRead),
            (R::RayTraceWrite, R::ComputeRead),
            (R::RayTraceRead, R::ComputeWrite),
            (R::RayTraceWrite, R::TransferSrc),
            (R::RayTraceWrite, R::ComputeReadWrite),
            (R::ComputeReadWrite, R::ComputeReadWrite),
            (R::ComputeRead, R::TransferSrc),
            (R::ComputeReadWrite, R::TransferSrc),
            (R::Undefined, R::TransferDst),
            (R::TransferDst, R::PresentSrc),
            (R::TransferDst, R::HostRead),
            (R::TransferSrc, R::RayTraceWrite),
            (R::TransferDst, R::ComputeRead),
            (R::TransferDst, R::ComputeWrite),
            (R::TransferDst, R::ComputeReadWrite),
            (R::TransferDst, R::RayTraceWrite),
            // texture upload in the scene
            (R::TransferDst, R::ShaderSampled),
        ];
        for (from, to) in used {
            assert!(table.lookup(from, to).is_ok(), "{:?} -> {:?}", from, to);
        }
        assert_eq!(table.len(), used.len());
    }
}
