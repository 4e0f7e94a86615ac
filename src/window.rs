//! Interactive runner: one window, one engine, an orbit camera.
//!
//! Drag with the left button to orbit, scroll to zoom. Space pauses the
//! simulation, `B` switches blend mode, Escape quits.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};
use winit::{
    application::ApplicationHandler,
    event::{ElementState, KeyEvent, MouseButton, MouseScrollDelta, WindowEvent},
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    keyboard::{Key, NamedKey},
    window::{Window, WindowId},
};

use crate::capability::Tier;
use crate::component::{EngineEvent, GpuComponent, Lifecycle};
use crate::config::{BlendMode, ConfigPatch, Settings};
use crate::context::SurfaceTarget;
use crate::error::{EngineError, Result};
use crate::gpu::Camera;
use crate::time::Time;

const TITLE_INTERVAL: Duration = Duration::from_secs(1);

struct App {
    engine: GpuComponent,
    camera: Camera,
    clock: Time,
    force_tier: Option<Tier>,
    window: Option<Arc<Window>>,
    mouse_pressed: bool,
    last_mouse_pos: Option<(f64, f64)>,
    last_title: Instant,
    failure: Option<EngineError>,
}

impl App {
    fn new(settings: &Settings) -> Result<Self> {
        let engine = GpuComponent::from_settings(settings)?;
        Ok(Self {
            engine,
            camera: Camera::framing(settings.simulation.bounds),
            clock: Time::new(),
            force_tier: settings.engine.force_tier,
            window: None,
            mouse_pressed: false,
            last_mouse_pos: None,
            last_title: Instant::now(),
            failure: None,
        })
    }

    fn open(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let attrs = Window::default_attributes()
            .with_title("tpe")
            .with_inner_size(winit::dpi::LogicalSize::new(1280, 720));
        let window = Arc::new(event_loop.create_window(attrs)?);

        let surface = SurfaceTarget::Window(window.clone());
        let report = match self.force_tier {
            Some(tier) => self.engine.init_at(surface, tier)?,
            None => self.engine.init(surface)?,
        };
        if report.tier == Tier::Software {
            warn!(target: "tpe::engine", "software tier keeps frames off-screen, the window stays blank");
        }
        for event in self.engine.drain_events() {
            if let EngineEvent::SetupFailed { tier, error } = event {
                warn!(target: "tpe::engine", %tier, %error, "tier skipped");
            }
        }

        self.window = Some(window);
        Ok(())
    }

    fn frame(&mut self) {
        let Some(window) = self.window.clone() else {
            return;
        };
        let dt = self.clock.tick();
        self.engine.update(dt);

        let size = window.inner_size();
        let (view_proj, view) = self.camera.matrices(size.width, size.height);
        self.engine.render(view_proj, view);

        if self.last_title.elapsed() >= TITLE_INTERVAL {
            let stats = self.engine.stats();
            let tier = stats.backend_tier.map_or("none", Tier::name);
            window.set_title(&format!(
                "tpe | {tier} | {} particles | {:.0} fps",
                stats.particles_rendered, stats.fps
            ));
            self.last_title = Instant::now();
        }
        window.request_redraw();
    }

    fn key(&mut self, event_loop: &ActiveEventLoop, key: &Key) {
        match key {
            Key::Named(NamedKey::Escape) => event_loop.exit(),
            Key::Named(NamedKey::Space) => match self.engine.lifecycle() {
                Lifecycle::Running => self.engine.stop(),
                Lifecycle::Stopped => self.engine.start(),
                _ => {}
            },
            Key::Character(c) if c.eq_ignore_ascii_case("b") => {
                let next = match self.engine.config().blend_mode {
                    BlendMode::Additive => BlendMode::Alpha,
                    BlendMode::Alpha => BlendMode::Additive,
                };
                info!(target: "tpe::engine", mode = next.name(), "blend mode");
                self.engine.set_config(ConfigPatch::default().blend_mode(next));
            }
            _ => {}
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        if let Err(err) = self.open(event_loop) {
            error!(target: "tpe::engine", %err, "could not start");
            self.failure = Some(err);
            event_loop.exit();
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => event_loop.exit(),
            WindowEvent::Resized(size) => self.engine.resize(size.width, size.height),
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        logical_key,
                        state: ElementState::Pressed,
                        repeat: false,
                        ..
                    },
                ..
            } => self.key(event_loop, &logical_key),
            WindowEvent::MouseInput { state, button, .. } => {
                if button == MouseButton::Left {
                    self.mouse_pressed = state == ElementState::Pressed;
                    if !self.mouse_pressed {
                        self.last_mouse_pos = None;
                    }
                }
            }
            WindowEvent::CursorMoved { position, .. } => {
                if self.mouse_pressed {
                    if let Some((last_x, last_y)) = self.last_mouse_pos {
                        self.camera
                            .orbit((position.x - last_x) as f32, (position.y - last_y) as f32);
                    }
                    self.last_mouse_pos = Some((position.x, position.y));
                }
            }
            WindowEvent::MouseWheel { delta, .. } => {
                let scroll = match delta {
                    MouseScrollDelta::LineDelta(_, y) => y,
                    MouseScrollDelta::PixelDelta(pos) => pos.y as f32 * 0.1,
                };
                self.camera.zoom(scroll);
            }
            WindowEvent::RedrawRequested => self.frame(),
            _ => {}
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        self.engine.destroy();
    }
}

/// Open a window and run until it is closed.
pub fn run_windowed(settings: &Settings) -> Result<()> {
    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = App::new(settings)?;
    event_loop.run_app(&mut app)?;
    match app.failure.take() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
