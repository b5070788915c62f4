//! Vulkan implementation of [`FrameBackend`].

use std::mem::ManuallyDrop;
use std::sync::Arc;

use ash::vk;
use tracing::{debug, error, info};

use restir_core::RenderConfig;
use restir_platform::{Surface, Window};
use restir_resources::Scene;
use restir_rhi::RhiError;
use restir_rhi::barrier::BarrierTable;
use restir_rhi::buffer::{Buffer, BufferUsage};
use restir_rhi::descriptor::buffer_info;
use restir_rhi::device::Device;
use restir_rhi::instance::Instance;
use restir_rhi::physical_device::select_physical_device;
use restir_rhi::swapchain::{Acquired, Swapchain, SwapchainSupportDetails};
use restir_rhi::sync::FrameSync;

use crate::SLOT_COUNT;
use crate::capture::CapturePhase;
use crate::error::{RendererError, RendererResult};
use crate::orchestrator::{CapturedImage, FrameBackend};
use crate::pipelines::{Pipelines, ShaderNames};
use crate::scene_gpu::GpuScene;
use crate::targets::{FrameTargets, SlotUniformInfos, TargetInputs};
use crate::ubo::{AccumUniform, FrameUniform, FrameUniforms, MotionUniform, SceneSizes};

/// Host-visible uniform buffers of one slot.
struct SlotUniforms {
    frame: Buffer,
    sizes: Buffer,
    motion: Buffer,
    accum: Buffer,
}

impl SlotUniforms {
    fn new(device: &Arc<Device>) -> RendererResult<Self> {
        let uniform = |size: usize| Buffer::new(device.clone(), BufferUsage::Uniform, size as u64);
        Ok(Self {
            frame: uniform(FrameUniform::SIZE)?,
            sizes: uniform(SceneSizes::SIZE)?,
            motion: uniform(MotionUniform::SIZE)?,
            accum: uniform(AccumUniform::SIZE)?,
        })
    }

    fn write(&self, uniforms: &FrameUniforms) -> RendererResult<()> {
        self.frame.write_data(0, bytemuck::bytes_of(&uniforms.frame))?;
        self.sizes.write_data(0, bytemuck::bytes_of(&uniforms.sizes))?;
        self.motion.write_data(0, bytemuck::bytes_of(&uniforms.motion))?;
        self.accum.write_data(0, bytemuck::bytes_of(&uniforms.accum))?;
        Ok(())
    }

    fn infos(&self) -> SlotUniformInfos {
        let whole = |b: &Buffer| buffer_info(b.handle(), 0, vk::WHOLE_SIZE);
        SlotUniformInfos {
            frame: whole(&self.frame),
            sizes: whole(&self.sizes),
            motion: whole(&self.motion),
            accum: whole(&self.accum),
        }
    }
}

/// Swaps the red and blue channel of every RGBA8 texel in place.
pub fn rgba_to_bgra(pixels: &mut [u8]) {
    for texel in pixels.chunks_exact_mut(4) {
        texel.swap(0, 2);
    }
}

fn is_rgba8(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::R8G8B8A8_UNORM | vk::Format::R8G8B8A8_SRGB | vk::Format::R8G8B8A8_SNORM
    )
}

/// Owns every Vulkan object of the renderer.
///
/// ManuallyDrop is used to ensure correct destruction order.
pub struct VulkanBackend {
    /// Rebuilt on every resize; `None` only while rebuilding.
    targets: Option<FrameTargets>,
    pipelines: ManuallyDrop<Pipelines>,
    scene: ManuallyDrop<GpuScene>,
    uniforms: ManuallyDrop<Vec<SlotUniforms>>,
    slots: ManuallyDrop<Vec<FrameSync>>,
    swapchain: ManuallyDrop<Swapchain>,
    barriers: BarrierTable,
    device: ManuallyDrop<Arc<Device>>,
    surface: ManuallyDrop<Surface>,
    instance: ManuallyDrop<Instance>,
}

impl VulkanBackend {
    /// Creates the device for `window`, uploads `scene`, builds the
    /// pipelines and records the first set of frame command buffers.
    pub fn new(window: &Window, config: &RenderConfig, scene: &Scene) -> RendererResult<Self> {
        let instance = Instance::new(config.validation, window.required_extensions()?)?;
        let surface = window.create_surface(instance.entry(), instance.handle())?;
        let info = select_physical_device(instance.handle(), surface.handle(), surface.loader())?;
        let device = Device::new(&instance, &info)?;

        let (width, height) = window.size();
        let swapchain = Swapchain::new(&instance, device.clone(), surface.handle(), width, height)?;
        let slots = FrameSync::create_slots(&device)?;
        let uniforms = (0..SLOT_COUNT)
            .map(|_| SlotUniforms::new(&device))
            .collect::<RendererResult<Vec<_>>>()?;

        let barriers = BarrierTable::standard()?;
        let scene = GpuScene::upload(device.clone(), scene, &barriers)?;
        let pipelines = Pipelines::new(
            device.clone(),
            &config.shader_dir,
            &ShaderNames::for_method(&config.method),
            scene.geometry_count(),
        )?;

        let mut backend = Self {
            targets: None,
            pipelines: ManuallyDrop::new(pipelines),
            scene: ManuallyDrop::new(scene),
            uniforms: ManuallyDrop::new(uniforms),
            slots: ManuallyDrop::new(slots),
            swapchain: ManuallyDrop::new(swapchain),
            barriers,
            device: ManuallyDrop::new(device),
            surface: ManuallyDrop::new(surface),
            instance: ManuallyDrop::new(instance),
        };
        backend.targets = Some(backend.create_targets()?);

        info!("Vulkan backend ready");
        Ok(backend)
    }

    #[inline]
    pub fn mesh_count(&self) -> u32 {
        self.scene.mesh_count()
    }

    #[inline]
    pub fn light_count(&self) -> u32 {
        self.scene.light_count()
    }

    fn create_targets(&self) -> RendererResult<FrameTargets> {
        let uniforms: Vec<SlotUniformInfos> = self.uniforms.iter().map(SlotUniforms::infos).collect();
        let queue = self.device.graphics_queue();
        FrameTargets::new(
            Arc::clone(&self.device),
            &TargetInputs {
                pipelines: &self.pipelines,
                scene: &self.scene,
                barriers: &self.barriers,
                uniforms: &uniforms,
                swapchain_images: self.swapchain.images(),
                format: self.swapchain.format(),
                extent: self.swapchain.extent(),
                queue: queue.handle,
                queue_family: queue.slot.family,
            },
        )
    }

    fn targets(&self) -> RendererResult<&FrameTargets> {
        self.targets
            .as_ref()
            .ok_or_else(|| RendererError::Frame("surface resources are being rebuilt".to_string()))
    }

    fn sync(&self, slot: usize) -> RendererResult<&FrameSync> {
        self.slots
            .get(slot)
            .ok_or_else(|| RendererError::Frame(format!("slot {} out of range", slot)))
    }

    /// Current surface extent; zero while the window is minimised.
    fn surface_extent(&self) -> RendererResult<vk::Extent2D> {
        let support = SwapchainSupportDetails::query(
            self.device.physical_device(),
            self.surface.handle(),
            self.surface.loader(),
        )?;
        Ok(support.capabilities.current_extent)
    }
}

impl FrameBackend for VulkanBackend {
    fn image_count(&self) -> usize {
        self.swapchain.image_count()
    }

    fn extent(&self) -> (u32, u32) {
        let extent = self.swapchain.extent();
        (extent.width, extent.height)
    }

    fn wait_slot(&mut self, slot: usize) -> RendererResult<()> {
        Ok(self.sync(slot)?.fence().wait()?)
    }

    fn slot_retired(&mut self, slot: usize) -> RendererResult<bool> {
        Ok(self.sync(slot)?.fence().is_signaled()?)
    }

    fn write_uniforms(&mut self, slot: usize, uniforms: &FrameUniforms) -> RendererResult<()> {
        self.uniforms
            .get(slot)
            .ok_or_else(|| RendererError::Frame(format!("slot {} out of range", slot)))?
            .write(uniforms)
    }

    fn acquire(&mut self, slot: usize) -> RendererResult<Option<u32>> {
        let semaphore = self.sync(slot)?.image_available();
        match self.swapchain.acquire(semaphore)? {
            Acquired::Image(index) => Ok(Some(index)),
            Acquired::Stale => Ok(None),
        }
    }

    fn submit(&mut self, slot: usize, image: u32, phase: CapturePhase) -> RendererResult<()> {
        let sync = self.sync(slot)?;
        let command_buffers = [self.targets()?.recording(phase, slot, image as usize)?];
        let wait_semaphores = [sync.image_available()];
        let wait_stages = [vk::PipelineStageFlags::ALL_COMMANDS];
        let signal_semaphores = [sync.render_finished()];
        let submit = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        sync.fence().reset()?;
        unsafe {
            self.device
                .handle()
                .queue_submit(
                    self.device.graphics_queue().handle,
                    &[submit],
                    sync.fence().handle(),
                )
                .map_err(RhiError::from)?;
        }
        Ok(())
    }

    fn present(&mut self, slot: usize, image: u32) -> RendererResult<bool> {
        let semaphore = self.sync(slot)?.render_finished();
        Ok(self
            .swapchain
            .present(self.device.present_queue().handle, image, semaphore)?)
    }

    fn wait_idle(&mut self) -> RendererResult<()> {
        Ok(self.device.wait_idle()?)
    }

    fn rebuild(&mut self, requested: Option<(u32, u32)>) -> RendererResult<bool> {
        let current = self.surface_extent()?;
        if current.width == 0 || current.height == 0 {
            debug!("Surface has no area, rebuild postponed");
            return Ok(false);
        }
        let (width, height) = requested.unwrap_or((current.width, current.height));

        self.targets = None;
        self.swapchain
            .recreate(&self.instance, self.surface.handle(), width, height)?;
        self.targets = Some(self.create_targets()?);
        Ok(true)
    }

    fn read_capture(&mut self) -> RendererResult<CapturedImage> {
        let targets = self.targets()?;
        let layout = *targets.layout();
        let mut pixels = targets.readback()?.to_vec();
        if is_rgba8(self.swapchain.format()) {
            rgba_to_bgra(&mut pixels);
        }
        Ok(CapturedImage {
            pixels,
            row_pitch: layout.row_pitch(),
            width: layout.width,
            height: layout.height,
        })
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            error!("Failed to wait for device idle during backend drop: {:?}", e);
        }

        self.targets = None;
        unsafe {
            ManuallyDrop::drop(&mut self.pipelines);
            ManuallyDrop::drop(&mut self.scene);
            ManuallyDrop::drop(&mut self.uniforms);
            ManuallyDrop::drop(&mut self.slots);
            ManuallyDrop::drop(&mut self.swapchain);
            ManuallyDrop::drop(&mut self.device);
            ManuallyDrop::drop(&mut self.surface);
            ManuallyDrop::drop(&mut self.instance);
        }

        info!("Vulkan backend destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgba_to_bgra_swaps_red_and_blue() {
        let mut pixels = vec![1, 2, 3, 4, 5, 6, 7, 8];
        rgba_to_bgra(&mut pixels);
        assert_eq!(pixels, vec![3, 2, 1, 4, 7, 6, 5, 8]);
    }

    #[test]
    fn test_only_rgba_formats_are_swapped() {
        assert!(is_rgba8(vk::Format::R8G8B8A8_UNORM));
        assert!(!is_rgba8(vk::Format::B8G8R8A8_UNORM));
    }
}
