//! Frame loop scenarios driven through an in-memory backend.

use std::collections::VecDeque;

use ash::vk;
use glam::Vec4;

use restir_core::RenderConfig;
use restir_platform::ResizeEvents;
use restir_renderer::accumulate::Accumulator;
use restir_renderer::capture::CapturePhase;
use restir_renderer::error::RendererResult;
use restir_renderer::orchestrator::{
    CapturedImage, FrameBackend, FrameOutcome, FrameSettings, FrameState, Orchestrator,
};
use restir_renderer::sink::SnapshotSink;
use restir_renderer::targets::TargetLayout;
use restir_renderer::ubo::FrameUniforms;
use restir_renderer::SLOT_COUNT;
use restir_resources::{Scene, SnapshotRequest};
use restir_scene::Camera;

const TEXELS: usize = 4;

/// Renders a flat color per frame: every texel is `frame_index + 1`.
struct MemoryBackend {
    extent: (u32, u32),
    image_count: usize,
    uniforms: [FrameUniforms; SLOT_COUNT],
    render_target: Vec<Vec4>,
    accumulator: Accumulator,
    readback: Vec<Vec4>,
    renders: Vec<f32>,
    submissions: Vec<(usize, u32, CapturePhase)>,
    waits: Vec<usize>,
    rebuilds: Vec<(u32, u32)>,
    layouts: Vec<TargetLayout>,
    descriptor_generation: u32,
    acquire_order: VecDeque<u32>,
    stale_acquires: u32,
    stale_presents: u32,
    zero_area_rebuilds: u32,
    retire_immediately: bool,
}

impl MemoryBackend {
    fn new() -> Self {
        Self {
            extent: (64, 32),
            image_count: 3,
            uniforms: [FrameUniforms::default(); SLOT_COUNT],
            render_target: vec![Vec4::ZERO; TEXELS],
            accumulator: Accumulator::new(TEXELS),
            readback: vec![Vec4::ZERO; TEXELS],
            renders: Vec::new(),
            submissions: Vec::new(),
            waits: Vec::new(),
            rebuilds: Vec::new(),
            layouts: vec![layout_for((64, 32), 3)],
            descriptor_generation: 1,
            acquire_order: VecDeque::new(),
            stale_acquires: 0,
            stale_presents: 0,
            zero_area_rebuilds: 0,
            retire_immediately: true,
        }
    }

    fn phases(&self) -> Vec<CapturePhase> {
        self.submissions.iter().map(|s| s.2).collect()
    }
}

fn layout_for((width, height): (u32, u32), image_count: usize) -> TargetLayout {
    TargetLayout::new(vk::Extent2D { width, height }, image_count)
}

impl FrameBackend for MemoryBackend {
    fn image_count(&self) -> usize {
        self.image_count
    }

    fn extent(&self) -> (u32, u32) {
        self.extent
    }

    fn wait_slot(&mut self, slot: usize) -> RendererResult<()> {
        self.waits.push(slot);
        Ok(())
    }

    fn slot_retired(&mut self, _slot: usize) -> RendererResult<bool> {
        Ok(self.retire_immediately)
    }

    fn write_uniforms(&mut self, slot: usize, uniforms: &FrameUniforms) -> RendererResult<()> {
        self.uniforms[slot] = *uniforms;
        Ok(())
    }

    fn acquire(&mut self, _slot: usize) -> RendererResult<Option<u32>> {
        if self.stale_acquires > 0 {
            self.stale_acquires -= 1;
            return Ok(None);
        }
        let next = self.submissions.len() as u32 % self.image_count as u32;
        Ok(Some(self.acquire_order.pop_front().unwrap_or(next)))
    }

    fn submit(&mut self, slot: usize, image: u32, phase: CapturePhase) -> RendererResult<()> {
        let uniforms = self.uniforms[slot];
        let value = (uniforms.frame.frame_index + 1) as f32;
        self.renders.push(value);
        self.render_target.fill(Vec4::splat(value));
        if phase.accumulates() {
            self.accumulator.apply(&mut self.render_target, &uniforms.accum);
        }
        if phase == CapturePhase::Finalizing {
            self.readback.clone_from(&self.render_target);
        }
        self.submissions.push((slot, image, phase));
        Ok(())
    }

    fn present(&mut self, _slot: usize, _image: u32) -> RendererResult<bool> {
        if self.stale_presents > 0 {
            self.stale_presents -= 1;
            return Ok(true);
        }
        Ok(false)
    }

    fn wait_idle(&mut self) -> RendererResult<()> {
        Ok(())
    }

    fn rebuild(&mut self, requested: Option<(u32, u32)>) -> RendererResult<bool> {
        if self.zero_area_rebuilds > 0 {
            self.zero_area_rebuilds -= 1;
            return Ok(false);
        }
        if let Some(extent) = requested {
            self.extent = extent;
        }
        self.accumulator.clear();
        self.descriptor_generation += 1;
        self.rebuilds.push(self.extent);
        self.layouts.push(layout_for(self.extent, self.image_count));
        Ok(true)
    }

    fn read_capture(&mut self) -> RendererResult<CapturedImage> {
        // one BGRA texel per readback value, scaled by ten
        let pixels = self
            .readback
            .iter()
            .flat_map(|t| {
                let v = (t.x * 10.0).round() as u8;
                [v, v, v, 255]
            })
            .collect();
        Ok(CapturedImage {
            pixels,
            row_pitch: TEXELS * 4,
            width: TEXELS as u32,
            height: 1,
        })
    }
}

#[derive(Default)]
struct RecordingSink {
    requests: Vec<SnapshotRequest>,
    finished: bool,
}

impl SnapshotSink for RecordingSink {
    fn save(&mut self, request: SnapshotRequest) -> RendererResult<()> {
        self.requests.push(request);
        Ok(())
    }

    fn finish(&mut self) -> RendererResult<()> {
        self.finished = true;
        Ok(())
    }
}

fn capture_config(frames: u32, tolerance: u32, offline: bool) -> RenderConfig {
    RenderConfig {
        capture: true,
        frames,
        tolerance,
        offline,
        ..RenderConfig::default()
    }
}

fn orchestrator(
    backend: MemoryBackend,
    config: &RenderConfig,
) -> (
    Orchestrator<MemoryBackend, RecordingSink>,
    restir_platform::ResizeSender,
) {
    let scene = Scene::demo();
    let settings = FrameSettings::from_config(
        config,
        scene.meshes.len() as u32,
        scene.lights.len() as u32,
    );
    let (tx, rx) = ResizeEvents::channel();
    (
        Orchestrator::new(backend, RecordingSink::default(), settings, rx),
        tx,
    )
}

fn run(
    orch: &mut Orchestrator<MemoryBackend, RecordingSink>,
    camera: &mut Camera,
    frames: usize,
) -> Vec<FrameOutcome> {
    (0..frames).map(|_| orch.run_frame(camera).unwrap()).collect()
}

#[test]
fn test_two_meshes_one_light_six_frame_capture() {
    let scene = Scene::demo();
    assert_eq!(scene.meshes.len(), 2);
    assert_eq!(scene.lights.len(), 1);

    let (mut orch, _tx) = orchestrator(MemoryBackend::new(), &capture_config(6, 0, false));
    let mut camera = Camera::new();

    let outcomes = run(&mut orch, &mut camera, 6);
    assert!(outcomes.iter().all(|o| *o == FrameOutcome::Presented));

    let backend = orch.backend();
    let expected: f32 = backend.renders.iter().sum();
    assert_eq!(backend.renders, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    for texel in backend.accumulator.sum() {
        assert!((texel.x - expected).abs() < 1e-5);
    }
    // the finalizing frame wrote the average back
    assert!((backend.readback[0].x - expected / 6.0).abs() < 1e-5);

    use CapturePhase::*;
    assert_eq!(
        backend.phases(),
        vec![Accumulating, Accumulating, Accumulating, Accumulating, Accumulating, Finalizing]
    );

    let sink = orch.sink();
    assert_eq!(sink.requests.len(), 1);
    assert_eq!(sink.requests[0].frame, (6 - SLOT_COUNT) as u64);
    assert_eq!(sink.requests[0].file_name(), "screenshot_restir_0-3_1.ppm");
    assert_eq!(sink.requests[0].pixels[0], 35);

    // later frames never save again
    run(&mut orch, &mut camera, 6);
    assert_eq!(orch.sink().requests.len(), 1);
    assert!(orch.backend().phases()[6..].iter().all(|p| *p == Steady));
}

#[test]
fn test_counter_and_slots_cycle_round_robin() {
    let (mut orch, _tx) = orchestrator(MemoryBackend::new(), &RenderConfig::default());
    let mut camera = Camera::new();

    let mut last = orch.counter();
    for _ in 0..7 {
        orch.run_frame(&mut camera).unwrap();
        assert!(orch.counter() > last);
        last = orch.counter();
    }
    let slots: Vec<usize> = orch.backend().submissions.iter().map(|s| s.0).collect();
    assert_eq!(slots, vec![0, 1, 2, 0, 1, 2, 0]);
    assert_eq!(orch.state(), FrameState::Idle);
}

#[test]
fn test_capture_waits_for_slot_fence_when_not_retired() {
    let mut backend = MemoryBackend::new();
    backend.retire_immediately = false;
    let (mut orch, _tx) = orchestrator(backend, &capture_config(1, 0, false));
    let mut camera = Camera::new();

    run(&mut orch, &mut camera, 3);
    assert_eq!(orch.captures_delivered(), 0);
    assert_eq!(orch.pending_capture().map(|p| p.slot), Some(0));

    // slot 0 comes round again and its fence wait retires the capture
    orch.run_frame(&mut camera).unwrap();
    assert_eq!(orch.captures_delivered(), 1);
    assert_eq!(orch.sink().requests[0].frame, 0);
}

#[test]
fn test_shutdown_flushes_pending_capture() {
    let mut backend = MemoryBackend::new();
    backend.retire_immediately = false;
    let (mut orch, _tx) = orchestrator(backend, &capture_config(2, 1, false));
    let mut camera = Camera::new();

    run(&mut orch, &mut camera, 3);
    assert!(orch.pending_capture().is_some());

    orch.shutdown().unwrap();
    assert_eq!(orch.captures_delivered(), 1);
    assert!(orch.pending_capture().is_none());
    assert!(orch.sink().finished);
}

#[test]
fn test_offline_capture_requests_exit() {
    let (mut orch, _tx) = orchestrator(MemoryBackend::new(), &capture_config(2, 0, true));
    let mut camera = Camera::new();

    let outcomes = run(&mut orch, &mut camera, 2);
    assert_eq!(outcomes, vec![FrameOutcome::Presented, FrameOutcome::Exit]);
    assert!(orch.exit_requested());
}

#[test]
fn test_stale_acquire_rebuilds_and_skips() {
    let mut backend = MemoryBackend::new();
    backend.stale_acquires = 1;
    let (mut orch, _tx) = orchestrator(backend, &RenderConfig::default());
    let mut camera = Camera::new();

    assert_eq!(orch.run_frame(&mut camera).unwrap(), FrameOutcome::Skipped);
    assert_eq!(orch.counter(), 0);
    assert!(orch.backend().submissions.is_empty());
    assert_eq!(orch.backend().rebuilds.len(), 1);
    assert_eq!(orch.state(), FrameState::Idle);

    assert_eq!(orch.run_frame(&mut camera).unwrap(), FrameOutcome::Presented);
    assert_eq!(orch.counter(), 1);
}

#[test]
fn test_zero_area_surface_stays_rebuilding() {
    let mut backend = MemoryBackend::new();
    backend.stale_acquires = 1;
    backend.zero_area_rebuilds = 2;
    let (mut orch, _tx) = orchestrator(backend, &RenderConfig::default());
    let mut camera = Camera::new();

    assert_eq!(orch.run_frame(&mut camera).unwrap(), FrameOutcome::Skipped);
    assert_eq!(orch.state(), FrameState::Rebuilding);
    assert_eq!(orch.run_frame(&mut camera).unwrap(), FrameOutcome::Skipped);
    assert_eq!(orch.state(), FrameState::Rebuilding);
    assert_eq!(orch.run_frame(&mut camera).unwrap(), FrameOutcome::Presented);
    assert_eq!(orch.backend().rebuilds.len(), 1);
}

#[test]
fn test_resize_event_rebuilds_before_next_frame() {
    let (mut orch, tx) = orchestrator(MemoryBackend::new(), &RenderConfig::default());
    let mut camera = Camera::new();
    orch.run_frame(&mut camera).unwrap();

    assert!(tx.notify(0, 0));
    assert!(tx.notify(300, 200));
    assert!(tx.notify(800, 600));
    orch.run_frame(&mut camera).unwrap();

    assert_eq!(orch.backend().rebuilds, vec![(800, 600)]);
    assert!((camera.aspect - 800.0 / 600.0).abs() < 1e-6);

    // same size again is not a resize
    assert!(tx.notify(800, 600));
    orch.run_frame(&mut camera).unwrap();
    assert_eq!(orch.backend().rebuilds.len(), 1);
}

#[test]
fn test_resize_round_trip_keeps_dimensions() {
    let mut backend = MemoryBackend::new();
    backend.stale_presents = 2;
    let (mut orch, _tx) = orchestrator(backend, &RenderConfig::default());
    let mut camera = Camera::new();

    run(&mut orch, &mut camera, 2);
    let backend = orch.backend();
    assert_eq!(backend.rebuilds, vec![(64, 32), (64, 32)]);
    assert_eq!(backend.descriptor_generation, 3);
    assert_eq!(backend.extent, (64, 32));

    let first = backend.layouts[0];
    assert_eq!(backend.layouts.len(), 3);
    for layout in &backend.layouts[1..] {
        assert_eq!(*layout, first);
        assert_eq!(layout.extent(), vk::Extent2D { width: 64, height: 32 });
        assert_eq!(layout.recording_count(), first.recording_count());
        assert_eq!(layout.readback_size(), first.readback_size());
        assert_eq!(layout.row_pitch(), first.row_pitch());
        assert_eq!(layout.group_counts(), first.group_counts());
    }
    assert_eq!(first.readback_size(), 64 * 32 * 4);
    assert_eq!(first.recording_count(), CapturePhase::ALL.len() * SLOT_COUNT * 3);
}

#[test]
fn test_resize_during_accumulation_restarts_window() {
    let (mut orch, tx) = orchestrator(MemoryBackend::new(), &capture_config(6, 0, false));
    let mut camera = Camera::new();

    run(&mut orch, &mut camera, 3);
    assert!(tx.notify(128, 64));
    run(&mut orch, &mut camera, 6);

    let backend = orch.backend();
    assert_eq!(backend.rebuilds, vec![(128, 64)]);
    assert_eq!(backend.renders, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);

    use CapturePhase::*;
    assert_eq!(
        backend.phases(),
        vec![
            Accumulating, Accumulating, Accumulating,
            Accumulating, Accumulating, Accumulating, Accumulating, Accumulating, Finalizing,
        ]
    );
    // average of the six renders taken after the rebuild, not 21 / 6
    let expected = (4.0 + 5.0 + 6.0 + 7.0 + 8.0 + 9.0) / 6.0;
    assert!((backend.readback[0].x - expected).abs() < 1e-5);

    let sink = orch.sink();
    assert_eq!(sink.requests.len(), 1);
    assert_eq!(sink.requests[0].frame, (9 - SLOT_COUNT) as u64);
    assert_eq!(sink.requests[0].tolerance, 0);
    assert_eq!(sink.requests[0].pixels[0], 65);
}

#[test]
fn test_image_reuse_waits_for_owning_slot() {
    let mut backend = MemoryBackend::new();
    // image 0 again on the second frame, which runs on slot 1
    backend.acquire_order = VecDeque::from(vec![0, 0]);
    let (mut orch, _tx) = orchestrator(backend, &RenderConfig::default());
    let mut camera = Camera::new();

    run(&mut orch, &mut camera, 2);
    // frame 0 waits on slot 0; frame 1 waits on slot 1, then on slot 0
    assert_eq!(orch.backend().waits, vec![0, 1, 0]);
}

#[test]
fn test_motion_uniform_tracks_previous_camera() {
    let (mut orch, _tx) = orchestrator(MemoryBackend::new(), &RenderConfig::default());
    let mut camera = Camera::new();

    orch.run_frame(&mut camera).unwrap();
    let first = orch.backend().uniforms[0].motion;
    assert_eq!(first.frame_counter, 0);
    assert_eq!(first.prev_view_proj, camera.view_projection_matrix());

    let before = camera.view_projection_matrix();
    camera.position.x += 1.0;
    orch.run_frame(&mut camera).unwrap();
    let second = orch.backend().uniforms[1].motion;
    assert_eq!(second.frame_counter, 1);
    assert_eq!(second.prev_view_proj, before);
    assert_eq!(second.camera_position.x, camera.position.x);
    assert_eq!(second.prev_camera_position.x, camera.position.x - 1.0);
}

#[test]
fn test_scene_sizes_reach_uniforms() {
    let config = RenderConfig {
        reservoir_merge: 8,
        samples: 4,
        ..RenderConfig::default()
    };
    let (mut orch, _tx) = orchestrator(MemoryBackend::new(), &config);
    let mut camera = Camera::new();
    orch.run_frame(&mut camera).unwrap();

    let uniforms = orch.backend().uniforms[0];
    assert_eq!(uniforms.sizes.mesh_count, 2);
    assert_eq!(uniforms.sizes.light_count, 1);
    assert_eq!(uniforms.sizes.reservoir_merge, 8);
    assert_eq!(uniforms.frame.samples, 4);
}
