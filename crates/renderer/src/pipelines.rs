//! Pipelines of the three passes and the shader binding table.

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use restir_rhi::descriptor::DescriptorSetLayout;
use restir_rhi::device::Device;
use restir_rhi::physical_device::RayTracingProperties;
use restir_rhi::pipeline::{
    ComputePipelineInfo, Pipeline, PipelineLayout, RayTracingPipelineInfo,
    build_compute_pipeline, build_ray_tracing_pipeline,
};
use restir_rhi::sbt::{SbtLayout, ShaderBindingTable, ShaderGroupCounts};
use restir_rhi::shader::{Shader, ShaderStage};

use crate::bindings;
use crate::error::RendererResult;

/// Primary rays plus one level of shadow rays.
pub const MAX_RECURSION_DEPTH: u32 = 2;

/// Workgroup edge of `spatial.comp` and `accumulate.comp`.
pub const WORKGROUP_SIZE: u32 = 16;

/// Workgroups needed to cover `extent` pixels along one axis.
#[inline]
pub fn group_count(extent: u32) -> u32 {
    extent.div_ceil(WORKGROUP_SIZE)
}

/// Shader module names under the SPIR-V directory.
pub struct ShaderNames<'a> {
    pub raygen: &'a str,
    pub miss: &'a str,
    pub shadow_miss: &'a str,
    /// Chosen by the configured method.
    pub closest_hit: &'a str,
    pub spatial: &'a str,
    pub accumulate: &'a str,
}

impl<'a> ShaderNames<'a> {
    pub fn for_method(method: &'a str) -> Self {
        Self {
            raygen: "raygen",
            miss: "miss",
            shadow_miss: "shadow",
            closest_hit: method,
            spatial: "spatial",
            accumulate: "accumulate",
        }
    }
}

/// Everything pipeline-shaped; independent of the surface.
pub struct Pipelines {
    // drop order: pipelines and table before the layouts they were built with
    sbt: ShaderBindingTable,
    ray_tracing: Pipeline,
    spatial: Pipeline,
    accumulate: Pipeline,
    layout: PipelineLayout,
    set_layout: DescriptorSetLayout,
}

impl Pipelines {
    /// Creates the shared set layout, the ray tracing pipeline with its
    /// binding table, and the two compute pipelines.
    pub fn new(
        device: Arc<Device>,
        shader_dir: &Path,
        names: &ShaderNames<'_>,
        geometry_count: u32,
    ) -> RendererResult<Self> {
        let layout_bindings = bindings::layout_bindings(geometry_count);
        let flags = bindings::binding_flags(&layout_bindings);
        let set_layout = DescriptorSetLayout::with_flags(device.clone(), &layout_bindings, &flags)?;
        let layout = PipelineLayout::new(device.clone(), &[set_layout.handle()], &[])?;

        let load = |name: &str, stage| Shader::load(device.clone(), shader_dir, name, stage);
        let raygen = load(names.raygen, ShaderStage::RayGen)?;
        let miss = load(names.miss, ShaderStage::Miss)?;
        let shadow_miss = load(names.shadow_miss, ShaderStage::Miss)?;
        let closest_hit = load(names.closest_hit, ShaderStage::ClosestHit)?;
        let spatial_shader = load(names.spatial, ShaderStage::Compute)?;
        let accumulate_shader = load(names.accumulate, ShaderStage::Compute)?;

        let depth = MAX_RECURSION_DEPTH.min(device.ray_tracing_properties().max_ray_recursion_depth);
        let ray_tracing = build_ray_tracing_pipeline(
            device.clone(),
            &RayTracingPipelineInfo {
                layout: &layout,
                raygen: &raygen,
                miss: &miss,
                shadow_miss: &shadow_miss,
                closest_hit: &closest_hit,
                max_recursion_depth: depth,
            },
        )?;
        let spatial = build_compute_pipeline(
            device.clone(),
            &ComputePipelineInfo {
                layout: &layout,
                shader: &spatial_shader,
            },
        )?;
        let accumulate = build_compute_pipeline(
            device.clone(),
            &ComputePipelineInfo {
                layout: &layout,
                shader: &accumulate_shader,
            },
        )?;

        let sbt_layout = sbt_layout(device.ray_tracing_properties())?;
        let sbt = ShaderBindingTable::new(device, ray_tracing.handle(), sbt_layout)?;

        info!("Pipelines ready, closest hit '{}'", names.closest_hit);
        Ok(Self {
            sbt,
            ray_tracing,
            spatial,
            accumulate,
            layout,
            set_layout,
        })
    }

    #[inline]
    pub fn set_layout(&self) -> &DescriptorSetLayout {
        &self.set_layout
    }

    #[inline]
    pub fn layout(&self) -> &PipelineLayout {
        &self.layout
    }

    #[inline]
    pub fn ray_tracing(&self) -> &Pipeline {
        &self.ray_tracing
    }

    #[inline]
    pub fn spatial(&self) -> &Pipeline {
        &self.spatial
    }

    #[inline]
    pub fn accumulate(&self) -> &Pipeline {
        &self.accumulate
    }

    #[inline]
    pub fn sbt(&self) -> &ShaderBindingTable {
        &self.sbt
    }
}

fn sbt_layout(props: &RayTracingProperties) -> RendererResult<SbtLayout> {
    Ok(SbtLayout::new(props, ShaderGroupCounts::RESTIR)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_count_covers_extent() {
        assert_eq!(group_count(1), 1);
        assert_eq!(group_count(16), 1);
        assert_eq!(group_count(17), 2);
        assert_eq!(group_count(1920), 120);
    }

    #[test]
    fn test_method_selects_closest_hit() {
        let names = ShaderNames::for_method("restir/spatial");
        assert_eq!(names.closest_hit, "restir/spatial");
        assert_eq!(names.shadow_miss, "shadow");
    }
}
