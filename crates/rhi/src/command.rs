//! Command pool and command buffer management.
//!
//! - [`CommandPool`] allocates command buffers for one queue family and runs
//!   one-shot submissions (acceleration structure builds, layout setup)
//! - [`CommandBuffer`] records the per-frame ray tracing, compute and copy
//!   commands
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use restir_rhi::device::Device;
//! use restir_rhi::command::CommandPool;
//!
//! # fn example(device: Arc<Device>) -> Result<(), restir_rhi::RhiError> {
//! let queue = device.graphics_queue();
//! let pool = CommandPool::new(device.clone(), queue.slot.family)?;
//! pool.submit_one_shot(queue.handle, |cmd| {
//!     // record setup commands
//!     let _ = cmd;
//!     Ok(())
//! })?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::device::Device;
use crate::error::RhiResult;
use crate::sync::Fence;

/// Command pool for one queue family.
///
/// # Thread Safety
///
/// Command pools are externally synchronized. The renderer records from
/// the control thread only.
pub struct CommandPool {
    device: Arc<Device>,
    pool: vk::CommandPool,
    queue_family_index: u32,
}

impl CommandPool {
    /// Creates a pool whose buffers can be reset individually.
    ///
    /// # Arguments
    ///
    /// * `device` - The logical device
    /// * `queue_family_index` - Family of every queue the buffers go to
    ///
    /// # Errors
    ///
    /// Returns an error if command pool creation fails.
    pub fn new(device: Arc<Device>, queue_family_index: u32) -> RhiResult<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family_index)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let pool = unsafe { device.handle().create_command_pool(&create_info, None)? };
        debug!("Command pool created for queue family {}", queue_family_index);

        Ok(Self {
            device,
            pool,
            queue_family_index,
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    #[inline]
    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    /// Allocates `count` primary command buffers.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool is out of memory.
    pub fn allocate(&self, count: u32) -> RhiResult<Vec<CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        let buffers = unsafe { self.device.handle().allocate_command_buffers(&alloc_info)? };
        Ok(buffers
            .into_iter()
            .map(|buffer| CommandBuffer::from_handle(self.device.clone(), buffer))
            .collect())
    }

    /// Returns command buffers to the pool.
    pub fn free(&self, buffers: &[CommandBuffer]) {
        if buffers.is_empty() {
            return;
        }
        let handles: Vec<vk::CommandBuffer> = buffers.iter().map(CommandBuffer::handle).collect();
        unsafe {
            self.device
                .handle()
                .free_command_buffers(self.pool, &handles);
        }
    }

    /// Records `record` into a fresh command buffer, submits it to `queue`
    /// and blocks until it has executed. The buffer is freed on every path.
    ///
    /// # Arguments
    ///
    /// * `queue` - A queue of this pool's family
    /// * `record` - Records the commands; an error aborts the submit
    ///
    /// # Errors
    ///
    /// Returns the error of `record`, or an error if allocation, recording,
    /// submission or the fence wait fails.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use restir_rhi::command::CommandPool;
    /// use restir_rhi::vk;
    ///
    /// # fn example(pool: &CommandPool, queue: vk::Queue, image: vk::Image) -> Result<(), restir_rhi::RhiError> {
    /// let black = vk::ClearColorValue { float32: [0.0; 4] };
    /// pool.submit_one_shot(queue, |cmd| {
    ///     cmd.clear_color_image(
    ///         image,
    ///         vk::ImageLayout::TRANSFER_DST_OPTIMAL,
    ///         &black,
    ///         &restir_rhi::image::COLOR_RANGE,
    ///     );
    ///     Ok(())
    /// })?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn submit_one_shot<F>(&self, queue: vk::Queue, record: F) -> RhiResult<()>
    where
        F: FnOnce(&CommandBuffer) -> RhiResult<()>,
    {
        let mut buffers = self.allocate(1)?;
        let result = (|| {
            let cmd = &buffers[0];
            cmd.begin()?;
            record(cmd)?;
            cmd.end()?;

            let fence = Fence::new(self.device.clone(), false)?;
            let handles = [cmd.handle()];
            let submit = vk::SubmitInfo::default().command_buffers(&handles);
            unsafe {
                self.device
                    .handle()
                    .queue_submit(queue, &[submit], fence.handle())?;
            }
            fence.wait()
        })();
        self.free(&buffers);
        buffers.clear();
        result
    }

    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_command_pool(self.pool, None);
        }
        debug!(
            "Command pool destroyed for queue family {}",
            self.queue_family_index
        );
    }
}

/// Primary command buffer.
///
/// Does not own the handle; it is released with its pool.
pub struct CommandBuffer {
    device: Arc<Device>,
    buffer: vk::CommandBuffer,
}

impl CommandBuffer {
    #[inline]
    pub fn from_handle(device: Arc<Device>, buffer: vk::CommandBuffer) -> Self {
        Self { device, buffer }
    }

    #[inline]
    pub fn handle(&self) -> vk::CommandBuffer {
        self.buffer
    }

    // =========================================================================
    // Recording Control
    // =========================================================================

    /// Begins a one-time-submit recording.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer cannot enter the recording state.
    pub fn begin(&self) -> RhiResult<()> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device
                .handle()
                .begin_command_buffer(self.buffer, &begin_info)?;
        }
        Ok(())
    }

    /// Begins a recording that is resubmitted every frame it is selected.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer cannot enter the recording state.
    pub fn begin_reusable(&self) -> RhiResult<()> {
        let begin_info = vk::CommandBufferBeginInfo::default();
        unsafe {
            self.device
                .handle()
                .begin_command_buffer(self.buffer, &begin_info)?;
        }
        Ok(())
    }

    pub fn end(&self) -> RhiResult<()> {
        unsafe {
            self.device.handle().end_command_buffer(self.buffer)?;
        }
        Ok(())
    }

    // =========================================================================
    // Binding
    // =========================================================================

    pub fn bind_pipeline(&self, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        unsafe {
            self.device
                .handle()
                .cmd_bind_pipeline(self.buffer, bind_point, pipeline);
        }
    }

    pub fn bind_descriptor_set(
        &self,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
    ) {
        unsafe {
            self.device.handle().cmd_bind_descriptor_sets(
                self.buffer,
                bind_point,
                layout,
                0,
                &[set],
                &[],
            );
        }
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Launches one ray generation invocation per pixel.
    ///
    /// # Arguments
    ///
    /// * `raygen` - Ray generation region of the shader binding table
    /// * `miss` - Miss region
    /// * `hit` - Hit group region
    /// * `width` - Launch width, normally the render target width
    /// * `height` - Launch height
    pub fn trace_rays(
        &self,
        raygen: &vk::StridedDeviceAddressRegionKHR,
        miss: &vk::StridedDeviceAddressRegionKHR,
        hit: &vk::StridedDeviceAddressRegionKHR,
        width: u32,
        height: u32,
    ) {
        let callable = vk::StridedDeviceAddressRegionKHR::default();
        unsafe {
            self.device.ray_tracing_pipeline_loader().cmd_trace_rays(
                self.buffer,
                raygen,
                miss,
                hit,
                &callable,
                width,
                height,
                1,
            );
        }
    }

    pub fn dispatch(&self, group_count_x: u32, group_count_y: u32, group_count_z: u32) {
        unsafe {
            self.device.handle().cmd_dispatch(
                self.buffer,
                group_count_x,
                group_count_y,
                group_count_z,
            );
        }
    }

    /// Records a device-side acceleration structure build.
    pub fn build_acceleration_structure(
        &self,
        info: &vk::AccelerationStructureBuildGeometryInfoKHR,
        range: &vk::AccelerationStructureBuildRangeInfoKHR,
    ) {
        unsafe {
            self.device
                .acceleration_structure_loader()
                .cmd_build_acceleration_structures(
                    self.buffer,
                    std::slice::from_ref(info),
                    &[std::slice::from_ref(range)],
                );
        }
    }

    // =========================================================================
    // Synchronization
    // =========================================================================

    /// Inserts a pipeline barrier with image and global memory barriers.
    ///
    /// # Arguments
    ///
    /// * `src_stage` - Stages that must finish first
    /// * `dst_stage` - Stages that wait
    /// * `memory_barriers` - Global memory barriers
    /// * `image_barriers` - Image barriers, usually with layout changes
    pub fn pipeline_barrier(
        &self,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        memory_barriers: &[vk::MemoryBarrier],
        image_barriers: &[vk::ImageMemoryBarrier],
    ) {
        unsafe {
            self.device.handle().cmd_pipeline_barrier(
                self.buffer,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                memory_barriers,
                &[],
                image_barriers,
            );
        }
    }

    // =========================================================================
    // Copy and Clear
    // =========================================================================

    pub fn copy_image(
        &self,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        region: &vk::ImageCopy,
    ) {
        unsafe {
            self.device.handle().cmd_copy_image(
                self.buffer,
                src,
                src_layout,
                dst,
                dst_layout,
                std::slice::from_ref(region),
            );
        }
    }

    pub fn copy_image_to_buffer(
        &self,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Buffer,
        region: &vk::BufferImageCopy,
    ) {
        unsafe {
            self.device.handle().cmd_copy_image_to_buffer(
                self.buffer,
                src,
                src_layout,
                dst,
                std::slice::from_ref(region),
            );
        }
    }

    /// Copies staged texels into `dst`, which must be in `dst_layout`.
    pub fn copy_buffer_to_image(
        &self,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        region: &vk::BufferImageCopy,
    ) {
        unsafe {
            self.device.handle().cmd_copy_buffer_to_image(
                self.buffer,
                src,
                dst,
                dst_layout,
                std::slice::from_ref(region),
            );
        }
    }

    pub fn clear_color_image(
        &self,
        image: vk::Image,
        layout: vk::ImageLayout,
        color: &vk::ClearColorValue,
        range: &vk::ImageSubresourceRange,
    ) {
        unsafe {
            self.device.handle().cmd_clear_color_image(
                self.buffer,
                image,
                layout,
                color,
                std::slice::from_ref(range),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_types_are_send() {
        fn assert_send<T: Send>() {}
        assert_send::<CommandBuffer>();
        assert_send::<CommandPool>();
    }
}
