//! Integration tests for light lists and scene records.

use std::io::Write;

use glam::Vec3;
use restir_resources::light::load_lights;
use restir_resources::{LightPad, ResourceError, Scene};

#[test]
fn test_load_lights_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{"Lights": [
            {{"pos": [0, 3, 0], "color": [1, 1, 1], "intensity": 5, "dims": [1, 1], "rotate": [0, 0, 0]}},
            {{"pos": [2, 3, 0], "color": [1, 0, 0], "intensity": 2, "dims": [0.5, 2], "rotate": [0, 45, 0]}}
        ]}}"#
    )
    .unwrap();

    let lights = load_lights(file.path()).unwrap();
    assert_eq!(lights.len(), 2);
    assert_eq!(lights[1].color, Vec3::X);

    let scene = Scene {
        meshes: Scene::demo().meshes,
        lights,
    };
    scene.validate().unwrap();

    let pads = scene.light_pads();
    assert_eq!(pads.len(), 2);
    for pad in &pads {
        // each pad is its own BLAS input
        assert_eq!(pad.indices.len() % 3, 0);
        assert_eq!(pad.vertices.len(), 4);
    }
}

#[test]
fn test_missing_light_file() {
    let dir = tempfile::tempdir().unwrap();
    let err = load_lights(&dir.path().join("absent.json")).unwrap_err();
    assert!(matches!(err, ResourceError::Io { .. }));
}

#[test]
fn test_pad_area_matches_dims() {
    let mut light = Scene::default_light();
    light.dims = glam::Vec2::new(3.0, 0.5);
    light.rotation = Vec3::new(30.0, 60.0, 10.0);
    let pad = LightPad::from_descriptor(&light);
    assert!((pad.props.area() - 1.5).abs() < 1e-4);
}
