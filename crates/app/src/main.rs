//! ReSTIR ray tracer - main entry point.
//!
//! Opens a window, uploads the demo scene (optionally with lights from a
//! JSON file) and runs the frame loop until the window closes or an offline
//! capture has been written.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use winit::application::ApplicationHandler;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::PhysicalKey;
use winit::window::WindowId;

use restir_core::{RenderArgs, RenderConfig, Timer};
use restir_platform::{InputState, KeyCode, ResizeEvents, Window};
use restir_renderer::{
    DiskSink, FrameOutcome, FrameSettings, Orchestrator, VulkanBackend,
};
use restir_resources::Scene;
use restir_resources::light::load_lights;
use restir_scene::{Camera, CameraInput, FpsController};

type FrameLoop = Orchestrator<VulkanBackend, DiskSink>;

struct App {
    config: RenderConfig,
    scene: Scene,
    window: Option<Window>,
    frame_loop: Option<FrameLoop>,
    camera: Camera,
    controller: FpsController,
    input: InputState,
    timer: Timer,
    failed: bool,
}

impl App {
    fn new(config: RenderConfig, scene: Scene) -> Self {
        let mut camera = Camera::new();
        camera.set_extent(config.width, config.height);
        Self {
            config,
            scene,
            window: None,
            frame_loop: None,
            camera,
            controller: FpsController::default(),
            input: InputState::new(),
            timer: Timer::new(),
            failed: false,
        }
    }

    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let (resize_tx, resize_events) = ResizeEvents::channel();
        let window = Window::new(
            event_loop,
            self.config.width,
            self.config.height,
            "ReSTIR",
            resize_tx,
        )
        .context("failed to create window")?;

        let backend = VulkanBackend::new(&window, &self.config, &self.scene)
            .context("failed to initialise the Vulkan backend")?;
        let settings =
            FrameSettings::from_config(&self.config, backend.mesh_count(), backend.light_count());
        let sink = DiskSink::new(".", self.config.offline);

        let (width, height) = window.size();
        self.camera.set_extent(width, height);
        self.frame_loop = Some(Orchestrator::new(backend, sink, settings, resize_events));
        self.window = Some(window);
        Ok(())
    }

    fn camera_input(&self) -> CameraInput {
        let input = &self.input;
        CameraInput {
            forward: input.axis(KeyCode::KeyW, KeyCode::KeyS),
            right: input.axis(KeyCode::KeyD, KeyCode::KeyA),
            up: input.axis(KeyCode::Space, KeyCode::ShiftLeft),
            yaw: input.axis(KeyCode::ArrowRight, KeyCode::ArrowLeft),
            pitch: input.axis(KeyCode::ArrowUp, KeyCode::ArrowDown),
        }
    }

    fn redraw(&mut self, event_loop: &ActiveEventLoop) {
        let (dt, fps) = self.timer.tick();
        if let Some(fps) = fps {
            info!("{:.1} fps", fps);
        }
        // offline captures render a fixed view
        if !self.config.offline {
            let input = self.camera_input();
            self.controller.update(&mut self.camera, &input, dt);
        }
        if self.input.is_key_just_pressed(KeyCode::Escape) {
            event_loop.exit();
        }
        self.input.end_frame();

        let Some(frame_loop) = self.frame_loop.as_mut() else {
            return;
        };
        match frame_loop.run_frame(&mut self.camera) {
            Ok(FrameOutcome::Exit) => {
                info!("Offline capture written, exiting");
                event_loop.exit();
            }
            Ok(FrameOutcome::Presented | FrameOutcome::Skipped) => {}
            Err(e) => {
                error!("Frame failed: {}", e);
                self.failed = true;
                event_loop.exit();
            }
        }
    }

    fn shutdown(&mut self) {
        if let Some(mut frame_loop) = self.frame_loop.take() {
            if let Err(e) = frame_loop.shutdown() {
                error!("Shutdown failed: {}", e);
                self.failed = true;
            }
        }
        self.window = None;
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        if let Err(e) = self.init(event_loop) {
            error!("Initialization failed: {:#}", e);
            self.failed = true;
            event_loop.exit();
            return;
        }
        info!("Initialization complete, entering main loop");
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested, shutting down");
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                if let Some(window) = self.window.as_mut() {
                    window.on_resized(size.width, size.height);
                }
            }
            WindowEvent::Focused(false) => self.input.release_all(),
            WindowEvent::RedrawRequested => self.redraw(event_loop),
            WindowEvent::KeyboardInput { event, .. } => {
                if let PhysicalKey::Code(key) = event.physical_key {
                    if event.state.is_pressed() {
                        self.input.on_key_pressed(key);
                    } else {
                        self.input.on_key_released(key);
                    }
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = self.window.as_ref() {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        self.shutdown();
    }
}

fn load_scene(config: &RenderConfig) -> Result<Scene> {
    let mut scene = Scene::demo();
    if let Some(path) = &config.lights {
        scene.lights = load_lights(path)
            .with_context(|| format!("failed to load lights from {}", path.display()))?;
        info!("Loaded {} lights from {}", scene.lights.len(), path.display());
    }
    Ok(scene)
}

fn main() -> Result<()> {
    restir_core::init_logging();

    let args = RenderArgs::parse();
    let config = RenderConfig::from_cli(&args).context("invalid configuration")?;
    info!(
        "Starting ReSTIR renderer: method '{}', {} samples, M = {}",
        config.method, config.samples, config.reservoir_merge
    );
    let scene = load_scene(&config)?;

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = App::new(config, scene);
    event_loop.run_app(&mut app)?;

    if app.failed {
        anyhow::bail!("renderer stopped after an error");
    }
    Ok(())
}
