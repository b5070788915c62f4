//! Ray tracing and compute pipeline management.
//!
//! # Overview
//!
//! - [`PipelineLayout`] wraps VkPipelineLayout for descriptor set and push constant configuration
//! - [`Pipeline`] wraps VkPipeline together with its [`PipelineKind`]
//! - [`build_ray_tracing_pipeline`] and [`build_compute_pipeline`] create the two kinds
//!   from explicit creation-info structs
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use restir_rhi::device::Device;
//! use restir_rhi::pipeline::{build_ray_tracing_pipeline, PipelineLayout, RayTracingPipelineInfo};
//! use restir_rhi::shader::{Shader, ShaderStage};
//!
//! # fn example(device: Arc<Device>, layout: &PipelineLayout) -> Result<(), restir_rhi::RhiError> {
//! let dir = Path::new("shaders/spirv");
//! let raygen = Shader::load(device.clone(), dir, "raygen", ShaderStage::RayGen)?;
//! let miss = Shader::load(device.clone(), dir, "miss", ShaderStage::Miss)?;
//! let shadow = Shader::load(device.clone(), dir, "shadow", ShaderStage::Miss)?;
//! let hit = Shader::load(device.clone(), dir, "restir", ShaderStage::ClosestHit)?;
//!
//! let pipeline = build_ray_tracing_pipeline(
//!     device,
//!     &RayTracingPipelineInfo {
//!         layout,
//!         raygen: &raygen,
//!         miss: &miss,
//!         shadow_miss: &shadow,
//!         closest_hit: &hit,
//!         max_recursion_depth: 1,
//!     },
//! )?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::{debug, info};

use crate::device::Device;
use crate::error::{RhiError, RhiResult};
use crate::sbt::ShaderGroupCounts;
use crate::shader::{Shader, ShaderStage};

/// Vulkan pipeline layout wrapper.
///
/// A pipeline layout describes the descriptor set layouts and push constant
/// ranges a pipeline can access. It is immutable after creation.
pub struct PipelineLayout {
    device: Arc<Device>,
    layout: vk::PipelineLayout,
}

impl PipelineLayout {
    /// Creates a new pipeline layout.
    ///
    /// # Errors
    ///
    /// Returns an error if pipeline layout creation fails.
    pub fn new(
        device: Arc<Device>,
        descriptor_set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> RhiResult<Self> {
        let create_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(descriptor_set_layouts)
            .push_constant_ranges(push_constant_ranges);

        let layout = unsafe { device.handle().create_pipeline_layout(&create_info, None)? };

        debug!(
            "Created pipeline layout with {} descriptor set layout(s) and {} push constant range(s)",
            descriptor_set_layouts.len(),
            push_constant_ranges.len()
        );

        Ok(Self { device, layout })
    }

    #[inline]
    pub fn handle(&self) -> vk::PipelineLayout {
        self.layout
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        unsafe {
            self.device
                .handle()
                .destroy_pipeline_layout(self.layout, None);
        }
        debug!("Pipeline layout destroyed");
    }
}

/// What a [`Pipeline`] was built as.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineKind {
    /// Ray tracing pipeline with `group_count` shader groups.
    RayTracing { group_count: u32 },
    Compute,
}

impl PipelineKind {
    pub fn bind_point(self) -> vk::PipelineBindPoint {
        match self {
            PipelineKind::RayTracing { .. } => vk::PipelineBindPoint::RAY_TRACING_KHR,
            PipelineKind::Compute => vk::PipelineBindPoint::COMPUTE,
        }
    }

    /// Number of shader groups whose handles can be queried.
    pub fn group_count(self) -> u32 {
        match self {
            PipelineKind::RayTracing { group_count } => group_count,
            PipelineKind::Compute => 0,
        }
    }
}

/// Vulkan pipeline wrapper.
pub struct Pipeline {
    device: Arc<Device>,
    pipeline: vk::Pipeline,
    kind: PipelineKind,
}

impl Pipeline {
    #[inline]
    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    #[inline]
    pub fn kind(&self) -> PipelineKind {
        self.kind
    }

    #[inline]
    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        self.kind.bind_point()
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_pipeline(self.pipeline, None);
        }
        debug!("{:?} pipeline destroyed", self.kind);
    }
}

/// Inputs for [`build_ray_tracing_pipeline`].
pub struct RayTracingPipelineInfo<'a> {
    pub layout: &'a PipelineLayout,
    pub raygen: &'a Shader,
    pub miss: &'a Shader,
    pub shadow_miss: &'a Shader,
    pub closest_hit: &'a Shader,
    pub max_recursion_depth: u32,
}

impl RayTracingPipelineInfo<'_> {
    fn check_stages(&self) -> RhiResult<()> {
        let expected = [
            (self.raygen, ShaderStage::RayGen, "raygen"),
            (self.miss, ShaderStage::Miss, "miss"),
            (self.shadow_miss, ShaderStage::Miss, "shadow miss"),
            (self.closest_hit, ShaderStage::ClosestHit, "closest hit"),
        ];
        for (shader, stage, what) in expected {
            if shader.stage() != stage {
                return Err(RhiError::PipelineError(format!(
                    "{what} slot holds a {} module",
                    shader.stage()
                )));
            }
        }
        Ok(())
    }
}

/// Shader groups in stage order: raygen, miss, shadow miss, closest-hit.
///
/// Group `i` references stage `i`; the first three are general groups and the
/// last is a triangles hit group.
pub fn shader_groups() -> [vk::RayTracingShaderGroupCreateInfoKHR<'static>; 4] {
    let general = |stage: u32| {
        vk::RayTracingShaderGroupCreateInfoKHR::default()
            .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
            .general_shader(stage)
            .closest_hit_shader(vk::SHADER_UNUSED_KHR)
            .any_hit_shader(vk::SHADER_UNUSED_KHR)
            .intersection_shader(vk::SHADER_UNUSED_KHR)
    };
    [
        general(0),
        general(1),
        general(2),
        vk::RayTracingShaderGroupCreateInfoKHR::default()
            .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
            .general_shader(vk::SHADER_UNUSED_KHR)
            .closest_hit_shader(3)
            .any_hit_shader(vk::SHADER_UNUSED_KHR)
            .intersection_shader(vk::SHADER_UNUSED_KHR),
    ]
}

/// Builds the four-group ray tracing pipeline.
///
/// # Errors
///
/// Fails with `PipelineError` when a module has the wrong stage, the requested
/// recursion depth exceeds the device limit, or pipeline creation fails.
pub fn build_ray_tracing_pipeline(
    device: Arc<Device>,
    info: &RayTracingPipelineInfo<'_>,
) -> RhiResult<Pipeline> {
    info.check_stages()?;

    let limit = device.ray_tracing_properties().max_ray_recursion_depth;
    if info.max_recursion_depth == 0 || info.max_recursion_depth > limit {
        return Err(RhiError::PipelineError(format!(
            "recursion depth {} outside 1..={limit}",
            info.max_recursion_depth
        )));
    }

    let stages = [
        info.raygen.stage_create_info(),
        info.miss.stage_create_info(),
        info.shadow_miss.stage_create_info(),
        info.closest_hit.stage_create_info(),
    ];
    let groups = shader_groups();
    debug_assert_eq!(groups.len() as u32, ShaderGroupCounts::RESTIR.total());

    let create_info = vk::RayTracingPipelineCreateInfoKHR::default()
        .stages(&stages)
        .groups(&groups)
        .max_pipeline_ray_recursion_depth(info.max_recursion_depth)
        .layout(info.layout.handle());

    let pipelines = unsafe {
        device
            .ray_tracing_pipeline_loader()
            .create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                &[create_info],
                None,
            )
            .map_err(|(_, result)| {
                RhiError::PipelineError(format!("ray tracing pipeline creation failed: {result}"))
            })?
    };
    let pipeline = pipelines.into_iter().next().ok_or_else(|| {
        RhiError::PipelineError("driver returned no ray tracing pipeline".to_string())
    })?;

    info!("Ray tracing pipeline created with {} groups", groups.len());

    Ok(Pipeline {
        device,
        pipeline,
        kind: PipelineKind::RayTracing {
            group_count: groups.len() as u32,
        },
    })
}

/// Inputs for [`build_compute_pipeline`].
pub struct ComputePipelineInfo<'a> {
    pub layout: &'a PipelineLayout,
    pub shader: &'a Shader,
}

/// Builds a compute pipeline from a single compute module.
pub fn build_compute_pipeline(
    device: Arc<Device>,
    info: &ComputePipelineInfo<'_>,
) -> RhiResult<Pipeline> {
    if info.shader.stage() != ShaderStage::Compute {
        return Err(RhiError::PipelineError(format!(
            "compute pipeline needs a comp module, got {}",
            info.shader.stage()
        )));
    }

    let create_info = vk::ComputePipelineCreateInfo::default()
        .stage(info.shader.stage_create_info())
        .layout(info.layout.handle());

    let pipelines = unsafe {
        device
            .handle()
            .create_compute_pipelines(vk::PipelineCache::null(), &[create_info], None)
            .map_err(|(_, result)| {
                RhiError::PipelineError(format!("compute pipeline creation failed: {result}"))
            })?
    };
    let pipeline = pipelines.into_iter().next().ok_or_else(|| {
        RhiError::PipelineError("driver returned no compute pipeline".to_string())
    })?;

    info!("Compute pipeline created");

    Ok(Pipeline {
        device,
        pipeline,
        kind: PipelineKind::Compute,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_bind_points() {
        assert_eq!(
            PipelineKind::RayTracing { group_count: 4 }.bind_point(),
            vk::PipelineBindPoint::RAY_TRACING_KHR
        );
        assert_eq!(
            PipelineKind::Compute.bind_point(),
            vk::PipelineBindPoint::COMPUTE
        );
    }

    #[test]
    fn test_kind_group_count() {
        assert_eq!(PipelineKind::RayTracing { group_count: 4 }.group_count(), 4);
        assert_eq!(PipelineKind::Compute.group_count(), 0);
    }

    #[test]
    fn test_shader_groups_match_sbt_counts() {
        let groups = shader_groups();
        assert_eq!(groups.len() as u32, ShaderGroupCounts::RESTIR.total());

        for (i, group) in groups.iter().take(3).enumerate() {
            assert_eq!(group.ty, vk::RayTracingShaderGroupTypeKHR::GENERAL);
            assert_eq!(group.general_shader, i as u32);
            assert_eq!(group.closest_hit_shader, vk::SHADER_UNUSED_KHR);
        }

        let hit = &groups[3];
        assert_eq!(hit.ty, vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP);
        assert_eq!(hit.general_shader, vk::SHADER_UNUSED_KHR);
        assert_eq!(hit.closest_hit_shader, 3);
    }
}
