//! TLAS instance planning.
//!
//! Every mesh and every light pad becomes one instance. Meshes take custom
//! indices `0..mesh_count`, lights follow at `mesh_count + light_index`, so
//! the custom index doubles as the index into the per-mesh descriptor arrays
//! (light pads are uploaded as trailing mesh entries).

use restir_resources::Scene;

/// What an instance draws.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstanceSource {
    Mesh(usize),
    Light(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstancePlan {
    pub custom_index: u32,
    pub source: InstanceSource,
}

/// Lays out one instance per mesh followed by one per light.
pub fn plan_instances(mesh_count: usize, light_count: usize) -> Vec<InstancePlan> {
    let meshes = (0..mesh_count).map(|i| InstancePlan {
        custom_index: i as u32,
        source: InstanceSource::Mesh(i),
    });
    let lights = (0..light_count).map(|i| InstancePlan {
        custom_index: (mesh_count + i) as u32,
        source: InstanceSource::Light(i),
    });
    meshes.chain(lights).collect()
}

pub fn plan_scene(scene: &Scene) -> Vec<InstancePlan> {
    plan_instances(scene.meshes.len(), scene.lights.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_custom_indices_are_contiguous_and_unique() {
        for (meshes, lights) in [(0, 0), (1, 0), (0, 2), (2, 1), (7, 3)] {
            let plan = plan_instances(meshes, lights);
            assert_eq!(plan.len(), meshes + lights);

            let indices: HashSet<u32> = plan.iter().map(|p| p.custom_index).collect();
            assert_eq!(indices.len(), plan.len());
            assert!(indices.iter().all(|&i| (i as usize) < meshes + lights));
        }
    }

    #[test]
    fn test_lights_follow_meshes() {
        let plan = plan_instances(2, 1);
        assert_eq!(plan[0].source, InstanceSource::Mesh(0));
        assert_eq!(plan[1].source, InstanceSource::Mesh(1));
        assert_eq!(
            plan[2],
            InstancePlan {
                custom_index: 2,
                source: InstanceSource::Light(0)
            }
        );
    }

    #[test]
    fn test_plan_demo_scene() {
        let scene = Scene::demo();
        let plan = plan_scene(&scene);
        assert_eq!(plan.len(), scene.meshes.len() + scene.lights.len());
    }
}
