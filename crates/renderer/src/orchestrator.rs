//! Frame orchestrator.
//!
//! One call to [`Orchestrator::run_frame`] walks the frame state machine:
//!
//! ```text
//! Idle ──► Acquiring ──► Submitting ──► Presenting ──► Idle
//!   ▲          │ stale                       │ stale / resized
//!   │          ▼                             ▼
//!   └──────────────────── Rebuilding ◄───────┘
//! ```
//!
//! - **Idle**: wait on the slot's fence, hand a finished capture to the sink
//!   when it was this slot's, write the slot's uniforms.
//! - **Acquiring**: take the next presentable image, then wait for whichever
//!   slot last rendered into that image.
//! - **Submitting**: submit the pre-recorded set of the current capture phase.
//! - **Presenting**: present, advance the frame counter, schedule or poll a
//!   capture.
//! - **Rebuilding**: wait for the GPU to go idle, flush a pending capture,
//!   recreate every surface-dependent resource.
//!
//! The GPU side sits behind [`FrameBackend`], so the same state machine
//! drives the Vulkan renderer and the in-memory backend of the tests.

use glam::{Mat4, Vec3};
use tracing::{debug, info};

use restir_core::RenderConfig;
use restir_platform::ResizeEvents;
use restir_resources::SnapshotRequest;
use restir_scene::Camera;

use crate::SLOT_COUNT;
use crate::capture::{CapturePhase, CaptureSchedule, PendingCapture};
use crate::error::RendererResult;
use crate::frame::{FrameCounter, ImagesInFlight};
use crate::sink::SnapshotSink;
use crate::ubo::{FrameUniform, FrameUniforms, MotionUniform, SceneSizes};

/// Pixels read back from the capture buffer. Rows are BGRA8.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapturedImage {
    pub pixels: Vec<u8>,
    pub row_pitch: usize,
    pub width: u32,
    pub height: u32,
}

/// GPU side of the frame loop.
///
/// Slots are frame-in-flight indices in `0..SLOT_COUNT`; images are
/// presentable image indices in `0..image_count()`.
pub trait FrameBackend {
    fn image_count(&self) -> usize;

    /// Current render extent.
    fn extent(&self) -> (u32, u32);

    /// Blocks until the last submission of `slot` has finished.
    fn wait_slot(&mut self, slot: usize) -> RendererResult<()>;

    /// Non-blocking check of `slot`'s fence.
    fn slot_retired(&mut self, slot: usize) -> RendererResult<bool>;

    fn write_uniforms(&mut self, slot: usize, uniforms: &FrameUniforms) -> RendererResult<()>;

    /// Acquires a presentable image. `None` means the surface is stale.
    fn acquire(&mut self, slot: usize) -> RendererResult<Option<u32>>;

    /// Resets the slot's fence and submits the recorded set for
    /// `(phase, slot, image)`.
    fn submit(&mut self, slot: usize, image: u32, phase: CapturePhase) -> RendererResult<()>;

    /// Presents `image`. `true` means the surface is stale.
    fn present(&mut self, slot: usize, image: u32) -> RendererResult<bool>;

    fn wait_idle(&mut self) -> RendererResult<()>;

    /// Recreates surface-dependent resources, sized to `requested` when
    /// given. Returns `false` while the surface has no area.
    fn rebuild(&mut self, requested: Option<(u32, u32)>) -> RendererResult<bool>;

    /// Reads the capture buffer written by the last finalizing frame.
    fn read_capture(&mut self) -> RendererResult<CapturedImage>;
}

/// Where the state machine currently is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    Acquiring,
    Submitting,
    Presenting,
    Rebuilding,
}

/// What a call to [`Orchestrator::run_frame`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    /// A frame was submitted and presented.
    Presented,
    /// The surface was stale or had no area; nothing was submitted.
    Skipped,
    /// An offline capture was written; the loop should stop.
    Exit,
}

/// Fixed per-run parameters of the frame loop.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameSettings {
    pub samples: u32,
    pub method: String,
    pub sizes: SceneSizes,
    pub schedule: CaptureSchedule,
    pub offline: bool,
}

impl FrameSettings {
    pub fn from_config(config: &RenderConfig, mesh_count: u32, light_count: u32) -> Self {
        Self {
            samples: config.samples,
            method: config.method.clone(),
            sizes: SceneSizes::new(mesh_count, light_count, config.reservoir_merge),
            schedule: CaptureSchedule::from_config(config),
            offline: config.offline,
        }
    }
}

/// Previous camera state for temporal reprojection.
#[derive(Clone, Copy, Debug, Default)]
struct MotionHistory {
    previous: Option<(Mat4, Vec3)>,
    frames: u32,
}

impl MotionHistory {
    fn next(&mut self, camera: &Camera) -> MotionUniform {
        let view_proj = camera.view_projection_matrix();
        let (prev_view_proj, prev_position) = self.previous.unwrap_or((view_proj, camera.position));
        let uniform = MotionUniform::new(prev_view_proj, camera.position, prev_position, self.frames);
        self.previous = Some((view_proj, camera.position));
        self.frames = self.frames.saturating_add(1);
        uniform
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Drives one [`FrameBackend`] through the frame state machine.
pub struct Orchestrator<B: FrameBackend, S: SnapshotSink> {
    backend: B,
    sink: S,
    settings: FrameSettings,
    resize_events: ResizeEvents,
    state: FrameState,
    counter: FrameCounter,
    images: ImagesInFlight,
    motion: MotionHistory,
    pending: Option<PendingCapture>,
    requested_extent: Option<(u32, u32)>,
    captures_delivered: u32,
    exit_requested: bool,
}

impl<B: FrameBackend, S: SnapshotSink> Orchestrator<B, S> {
    pub fn new(backend: B, sink: S, settings: FrameSettings, resize_events: ResizeEvents) -> Self {
        let images = ImagesInFlight::new(backend.image_count());
        info!(
            "Frame loop: {} slots, {} images, capture {:?}",
            SLOT_COUNT,
            images.len(),
            settings.schedule.capture_frame()
        );
        Self {
            backend,
            sink,
            settings,
            resize_events,
            state: FrameState::Idle,
            counter: FrameCounter::new(),
            images,
            motion: MotionHistory::default(),
            pending: None,
            requested_extent: None,
            captures_delivered: 0,
            exit_requested: false,
        }
    }

    #[inline]
    pub fn state(&self) -> FrameState {
        self.state
    }

    #[inline]
    pub fn counter(&self) -> u64 {
        self.counter.value()
    }

    #[inline]
    pub fn pending_capture(&self) -> Option<PendingCapture> {
        self.pending
    }

    #[inline]
    pub fn captures_delivered(&self) -> u32 {
        self.captures_delivered
    }

    #[inline]
    pub fn exit_requested(&self) -> bool {
        self.exit_requested
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Runs one iteration of the frame loop.
    pub fn run_frame(&mut self, camera: &mut Camera) -> RendererResult<FrameOutcome> {
        if let Some(size) = self.resize_events.latest() {
            if size != self.backend.extent() {
                debug!("Resize to {}x{} requested", size.0, size.1);
                self.requested_extent = Some(size);
                self.state = FrameState::Rebuilding;
            }
        }

        if self.state == FrameState::Rebuilding && !self.rebuild(camera)? {
            return Ok(FrameOutcome::Skipped);
        }

        let slot = self.counter.slot();
        let counter = self.counter.value();

        // Idle
        self.backend.wait_slot(slot)?;
        if self.pending.is_some_and(|p| p.slot == slot) {
            self.deliver_capture()?;
        }
        let uniforms = self.uniforms(camera, counter);
        self.backend.write_uniforms(slot, &uniforms)?;

        self.state = FrameState::Acquiring;
        let Some(image) = self.backend.acquire(slot)? else {
            debug!("Surface stale on acquire, frame {} skipped", counter);
            self.state = FrameState::Rebuilding;
            self.rebuild(camera)?;
            return Ok(self.outcome(FrameOutcome::Skipped));
        };
        if let Some(owner) = self.images.blocking_slot(image, slot) {
            self.backend.wait_slot(owner)?;
        }

        self.state = FrameState::Submitting;
        let phase = self.settings.schedule.phase(counter);
        self.backend.submit(slot, image, phase)?;
        self.images.claim(image, slot);

        self.state = FrameState::Presenting;
        let stale = self.backend.present(slot, image)?;
        let next = self.counter.advance();
        if self.settings.schedule.capture_frame() == Some(next) {
            let tag = self.settings.schedule.capture_tag().unwrap_or(0);
            debug!("Capture scheduled on slot {} tagged {}", slot, tag);
            self.pending = Some(PendingCapture { slot, tag });
        }
        if let Some(pending) = self.pending {
            if self.backend.slot_retired(pending.slot)? {
                self.deliver_capture()?;
            }
        }

        if stale {
            debug!("Surface stale on present");
            self.state = FrameState::Rebuilding;
            self.rebuild(camera)?;
        } else {
            self.state = FrameState::Idle;
        }
        Ok(self.outcome(FrameOutcome::Presented))
    }

    /// Waits for the GPU, writes any capture still pending and joins the
    /// snapshot writers.
    pub fn shutdown(&mut self) -> RendererResult<()> {
        self.backend.wait_idle()?;
        if self.pending.is_some() {
            self.deliver_capture()?;
        }
        self.sink.finish()?;
        info!("Frame loop stopped after {} frames", self.counter.value());
        Ok(())
    }

    fn outcome(&self, outcome: FrameOutcome) -> FrameOutcome {
        if self.exit_requested {
            FrameOutcome::Exit
        } else {
            outcome
        }
    }

    fn uniforms(&mut self, camera: &Camera, counter: u64) -> FrameUniforms {
        FrameUniforms {
            // wraps after 2^32 frames; only seeds the random sequence
            frame: FrameUniform::new(
                camera.view_inverse(),
                camera.projection_inverse(),
                counter as u32,
                self.settings.samples,
            ),
            sizes: self.settings.sizes,
            motion: self.motion.next(camera),
            accum: self.settings.schedule.accum_uniform(counter),
        }
    }

    /// Returns `false` when the surface has no area yet; the state stays
    /// `Rebuilding` and the next iteration retries.
    fn rebuild(&mut self, camera: &mut Camera) -> RendererResult<bool> {
        self.backend.wait_idle()?;
        if self.pending.is_some() {
            self.deliver_capture()?;
        }
        if !self.backend.rebuild(self.requested_extent)? {
            return Ok(false);
        }
        self.requested_extent = None;
        let counter = self.counter.value();
        if self.settings.schedule.restart(counter) {
            info!("Accumulation restarted at frame {} after the rebuild", counter);
        }
        self.images.reset(self.backend.image_count());
        self.motion.reset();
        let (width, height) = self.backend.extent();
        camera.set_extent(width, height);
        info!("Surface resources rebuilt at {}x{}", width, height);
        self.state = FrameState::Idle;
        Ok(true)
    }

    fn deliver_capture(&mut self) -> RendererResult<()> {
        let Some(pending) = self.pending.take() else {
            return Ok(());
        };
        let image = self.backend.read_capture()?;
        let request = SnapshotRequest {
            pixels: image.pixels,
            row_pitch: image.row_pitch,
            width: image.width,
            height: image.height,
            method: self.settings.method.clone(),
            samples: self.settings.samples,
            tolerance: self.settings.schedule.tolerance(),
            frame: pending.tag,
        };
        info!("Capture of frame {} handed to the writer", pending.tag);
        self.sink.save(request)?;
        self.captures_delivered += 1;
        if self.settings.offline {
            self.exit_requested = true;
        }
        Ok(())
    }
}
