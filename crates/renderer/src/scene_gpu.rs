//! Scene buffers and acceleration structures.
//!
//! Built once at start-up and read-only afterwards. Light pads are uploaded
//! after the meshes so one custom index addresses the vertex, index and
//! material arrays for both. A textured mesh's first diffuse map sits at the
//! same index of the texture array.

use std::sync::Arc;

use ash::vk;
use tracing::{debug, info};

use restir_resources::{LightPad, LightProps, Material, Scene, TextureRecord, Vertex};
use restir_rhi::accel::{
    AccelerationStructure, AccelerationStructureBuilder, AccelerationStructureStore,
    InstanceDesc, TriangleGeometry,
};
use restir_rhi::arena::Handle;
use restir_rhi::barrier::BarrierTable;
use restir_rhi::buffer::{Buffer, BufferUsage};
use restir_rhi::command::CommandPool;
use restir_rhi::descriptor::buffer_info;
use restir_rhi::device::Device;
use restir_rhi::image::SampledTexture;
use restir_scene::{InstanceSource, plan_scene};

use crate::error::{RendererError, RendererResult};

/// One traceable mesh: geometry, material and its BLAS.
struct GpuGeometry {
    vertices: Buffer,
    indices: Buffer,
    material: Buffer,
    blas: Handle<AccelerationStructure>,
}

/// Device-resident scene.
pub struct GpuScene {
    // structures reference geometry buffers, so they go first
    structures: AccelerationStructureStore,
    geometry: Vec<GpuGeometry>,
    /// `(geometry index, first diffuse map)` of every textured mesh.
    textures: Vec<(u32, SampledTexture)>,
    lights: Buffer,
    tlas: Handle<AccelerationStructure>,
    mesh_count: u32,
    light_count: u32,
}

impl GpuScene {
    /// Uploads every mesh and light pad, builds one BLAS each, then the TLAS.
    /// Diffuse maps go through `barriers` into `SHADER_READ_ONLY_OPTIMAL`.
    pub fn upload(
        device: Arc<Device>,
        scene: &Scene,
        barriers: &BarrierTable,
    ) -> RendererResult<Self> {
        scene.validate()?;
        let pads = scene.light_pads();
        if scene.meshes.is_empty() && pads.is_empty() {
            return Err(RendererError::Scene("nothing to trace".to_string()));
        }

        let builder = AccelerationStructureBuilder::new(device.clone())?;
        let mut structures = AccelerationStructureStore::new();
        let mut geometry = Vec::with_capacity(scene.meshes.len() + pads.len());

        let sources = scene
            .meshes
            .iter()
            .map(|m| (m.vertices.as_slice(), m.indices.as_slice(), m.material))
            .chain(
                pads.iter()
                    .map(|p| (p.vertices.as_slice(), p.indices.as_slice(), p.material())),
            );
        for (vertices, indices, material) in sources {
            geometry.push(upload_geometry(
                &device,
                &builder,
                &mut structures,
                vertices,
                indices,
                &material,
            )?);
        }

        let instances = plan_scene(scene)
            .into_iter()
            .map(|plan| {
                let slot = match plan.source {
                    InstanceSource::Mesh(i) => i,
                    InstanceSource::Light(i) => scene.meshes.len() + i,
                };
                let blas = structures.get(geometry[slot].blas)?;
                Ok(InstanceDesc::new(plan.custom_index, blas))
            })
            .collect::<RendererResult<Vec<_>>>()?;
        let tlas = builder.build_tlas(&instances)?;
        info!(
            "TLAS built over {} instances ({} meshes, {} lights)",
            instances.len(),
            scene.meshes.len(),
            pads.len()
        );
        let tlas = structures.insert(tlas);

        let lights = upload_lights(&device, &pads)?;
        let textures = upload_textures(&device, scene, barriers)?;

        Ok(Self {
            structures,
            geometry,
            textures,
            lights,
            tlas,
            mesh_count: scene.meshes.len() as u32,
            light_count: pads.len() as u32,
        })
    }

    #[inline]
    pub fn mesh_count(&self) -> u32 {
        self.mesh_count
    }

    #[inline]
    pub fn light_count(&self) -> u32 {
        self.light_count
    }

    /// Entries of the per-mesh descriptor arrays.
    #[inline]
    pub fn geometry_count(&self) -> u32 {
        self.geometry.len() as u32
    }

    pub fn tlas(&self) -> RendererResult<vk::AccelerationStructureKHR> {
        Ok(self.structures.get(self.tlas)?.handle())
    }

    pub fn vertex_infos(&self) -> Vec<vk::DescriptorBufferInfo> {
        self.geometry.iter().map(|g| whole(&g.vertices)).collect()
    }

    pub fn index_infos(&self) -> Vec<vk::DescriptorBufferInfo> {
        self.geometry.iter().map(|g| whole(&g.indices)).collect()
    }

    pub fn material_infos(&self) -> Vec<vk::DescriptorBufferInfo> {
        self.geometry.iter().map(|g| whole(&g.material)).collect()
    }

    pub fn light_info(&self) -> vk::DescriptorBufferInfo {
        whole(&self.lights)
    }

    /// Texture array entries as `(array element, sampler info)`.
    pub fn texture_infos(&self) -> Vec<(u32, vk::DescriptorImageInfo)> {
        self.textures
            .iter()
            .map(|(slot, texture)| (*slot, texture.descriptor_info()))
            .collect()
    }
}

/// Texture array element and diffuse map of every textured mesh. Only the
/// first map of a mesh is sampled.
pub fn texture_slots(scene: &Scene) -> Vec<(u32, &TextureRecord)> {
    scene
        .meshes
        .iter()
        .enumerate()
        .filter_map(|(i, mesh)| mesh.diffuse.first().map(|tex| (i as u32, tex)))
        .collect()
}

fn upload_textures(
    device: &Arc<Device>,
    scene: &Scene,
    barriers: &BarrierTable,
) -> RendererResult<Vec<(u32, SampledTexture)>> {
    let slots = texture_slots(scene);
    if slots.is_empty() {
        return Ok(Vec::new());
    }
    let queue = device.graphics_queue();
    let pool = CommandPool::new(device.clone(), queue.slot.family)?;
    let textures = slots
        .into_iter()
        .map(|(slot, record)| {
            let extent = vk::Extent2D {
                width: record.width(),
                height: record.height(),
            };
            let label = format!("mesh {slot} diffuse");
            let texture = SampledTexture::upload(
                device.clone(),
                &pool,
                queue.handle,
                barriers,
                &label,
                extent,
                record.pixels(),
            )?;
            Ok((slot, texture))
        })
        .collect::<RendererResult<Vec<_>>>()?;
    info!("Uploaded {} diffuse textures", textures.len());
    Ok(textures)
}

fn whole(buffer: &Buffer) -> vk::DescriptorBufferInfo {
    buffer_info(buffer.handle(), 0, vk::WHOLE_SIZE)
}

fn upload_geometry(
    device: &Arc<Device>,
    builder: &AccelerationStructureBuilder,
    structures: &mut AccelerationStructureStore,
    vertices: &[Vertex],
    indices: &[u32],
    material: &Material,
) -> RendererResult<GpuGeometry> {
    let vertex_buffer = Buffer::new_with_data(
        device.clone(),
        BufferUsage::GeometryInput,
        bytemuck::cast_slice(vertices),
    )?;
    let index_buffer = Buffer::new_with_data(
        device.clone(),
        BufferUsage::GeometryInput,
        bytemuck::cast_slice(indices),
    )?;
    let material_buffer = Buffer::new_with_data(
        device.clone(),
        BufferUsage::Storage,
        bytemuck::bytes_of(material),
    )?;

    let blas = builder.build_blas(&TriangleGeometry {
        vertices: &vertex_buffer,
        vertex_count: vertices.len() as u32,
        vertex_stride: Vertex::stride(),
        indices: &index_buffer,
        index_count: indices.len() as u32,
    })?;
    debug!(
        "BLAS over {} triangles, {} bytes",
        blas.primitive_count(),
        blas.size()
    );

    Ok(GpuGeometry {
        vertices: vertex_buffer,
        indices: index_buffer,
        material: material_buffer,
        blas: structures.insert(blas),
    })
}

/// Light properties, padded to one element when the scene has no lights.
fn upload_lights(device: &Arc<Device>, pads: &[LightPad]) -> RendererResult<Buffer> {
    let mut props: Vec<LightProps> = pads.iter().map(|p| p.props).collect();
    if props.is_empty() {
        props.push(bytemuck::Zeroable::zeroed());
    }
    Ok(Buffer::new_with_data(
        device.clone(),
        BufferUsage::Storage,
        bytemuck::cast_slice(&props),
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;
    use restir_resources::MeshRecord;

    #[test]
    fn test_texture_slots_follow_mesh_index() {
        let mut scene = Scene::demo();
        let checker = TextureRecord::checker(4, 2, [255; 4], [0; 4]);
        scene.meshes.push(
            MeshRecord::quad(Vec3::Y, Vec3::Z, Vec3::X, Material::default())
                .with_diffuse(checker.clone())
                .with_diffuse(TextureRecord::checker(2, 1, [9; 4], [0; 4])),
        );
        scene.validate().unwrap();

        let slots = texture_slots(&scene);
        let indices: Vec<u32> = slots.iter().map(|(slot, _)| *slot).collect();
        // floor and the new quad are textured, the block is not
        assert_eq!(indices, vec![0, 2]);
        // only the first map of a mesh is used
        assert_eq!(slots[1].1, &checker);
    }

    #[test]
    fn test_untextured_scene_has_no_slots() {
        let mut scene = Scene::demo();
        for mesh in &mut scene.meshes {
            mesh.diffuse.clear();
            mesh.material.diffuse_map_count = 0;
        }
        assert!(texture_slots(&scene).is_empty());
    }
}
