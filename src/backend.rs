//! One trait object per engine, chosen once at initialization.
//!
//! Every per-frame operation goes through [`Backend`]; nothing else in the
//! crate branches on the tier after setup.

use glam::{Mat4, Vec2};
use tracing::debug;

use crate::buffer::ParticleBuffer;
use crate::capability::Tier;
use crate::config::SimulationConfig;
use crate::context::SoftwareContext;
use crate::error::{CapacityError, EngineError, FrameError};
use crate::particle::Particle;
use crate::raster::{clear_color, Framebuffer, SoftwareRasterizer};
use crate::simulation::{self, SimParams};

/// Everything a backend needs to draw one frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameInput<'a> {
    pub view_proj: Mat4,
    pub view: Mat4,
    /// Seconds since the engine started.
    pub time: f32,
    pub config: &'a SimulationConfig,
}

pub trait Backend {
    fn tier(&self) -> Tier;

    /// Fixed particle capacity.
    fn capacity(&self) -> usize;

    /// Overwrite the first `particles.len()` slots.
    fn upload(&mut self, particles: &[Particle]) -> Result<(), CapacityError>;

    /// Blocking read of every slot.
    fn read_particles(&self) -> Result<Vec<Particle>, EngineError>;

    /// Replace the spawner table with packed `[x, y, z, rate]` rows.
    fn sync_spawners(&mut self, packed: &[[f32; 4]]);

    /// Advance the simulation one step.
    fn update(&mut self, params: &SimParams);

    /// Draw and present. Returns the particle count reported as rendered.
    fn render(&mut self, frame: &FrameInput<'_>) -> Result<usize, FrameError>;

    fn resize(&mut self, width: u32, height: u32);

    /// Blocking copy of the last frame.
    fn snapshot(&self) -> Result<Framebuffer, EngineError>;

    /// Release everything the backend holds. Safe to call twice.
    fn destroy(&mut self);
}

/// CPU simulation into a CPU framebuffer.
pub struct SoftwareBackend {
    particles: ParticleBuffer,
    spawners: Vec<[f32; 4]>,
    framebuffer: Framebuffer,
    rasterizer: SoftwareRasterizer,
    background: glam::Vec4,
    preserve: bool,
}

impl SoftwareBackend {
    pub fn new(ctx: &SoftwareContext, capacity: usize) -> Self {
        debug!(target: "tpe::render", width = ctx.width, height = ctx.height, capacity, "software backend created");
        Self {
            particles: ParticleBuffer::host(capacity),
            spawners: Vec::new(),
            framebuffer: Framebuffer::new(ctx.width, ctx.height),
            rasterizer: SoftwareRasterizer,
            background: clear_color(ctx.attributes.alpha),
            preserve: ctx.attributes.preserve_drawing_buffer,
        }
    }

    pub fn framebuffer(&self) -> &Framebuffer {
        &self.framebuffer
    }

    pub fn resolution(&self) -> Vec2 {
        Vec2::new(self.framebuffer.width() as f32, self.framebuffer.height() as f32)
    }
}

impl Backend for SoftwareBackend {
    fn tier(&self) -> Tier {
        Tier::Software
    }

    fn capacity(&self) -> usize {
        self.particles.capacity()
    }

    fn upload(&mut self, particles: &[Particle]) -> Result<(), CapacityError> {
        self.particles.upload(particles)
    }

    fn read_particles(&self) -> Result<Vec<Particle>, EngineError> {
        self.particles.readback()
    }

    fn sync_spawners(&mut self, packed: &[[f32; 4]]) {
        self.spawners = packed.to_vec();
    }

    fn update(&mut self, params: &SimParams) {
        if let Some(particles) = self.particles.host_particles_mut() {
            simulation::step(particles, params, &self.spawners);
        }
    }

    fn render(&mut self, frame: &FrameInput<'_>) -> Result<usize, FrameError> {
        if !self.preserve {
            self.framebuffer.clear(self.background);
        }
        let particles = self.particles.host_particles().unwrap_or_default();
        self.rasterizer.draw(
            &mut self.framebuffer,
            particles,
            &frame.view_proj,
            &frame.view,
            frame.config,
        );
        Ok(simulation::count_alive(particles))
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.framebuffer.resize(width, height);
    }

    fn snapshot(&self) -> Result<Framebuffer, EngineError> {
        Ok(self.framebuffer.clone())
    }

    fn destroy(&mut self) {
        self.particles.destroy();
        self.spawners.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextOptions, SoftwareContext};
    use glam::Vec3;

    fn backend(capacity: usize) -> SoftwareBackend {
        let ctx = SoftwareContext {
            width: 48,
            height: 32,
            attributes: ContextOptions::default().resolve(Tier::Software),
        };
        SoftwareBackend::new(&ctx, capacity)
    }

    fn camera() -> (Mat4, Mat4) {
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 30.0), Vec3::ZERO, Vec3::Y);
        let proj = Mat4::perspective_rh(45f32.to_radians(), 1.5, 0.1, 100.0);
        (proj * view, view)
    }

    #[test]
    fn render_reports_alive_particles() {
        let mut backend = backend(4);
        let mut dead = Particle::new(Vec3::ZERO, Vec3::ZERO);
        dead.life = 0.0;
        backend
            .upload(&[Particle::new(Vec3::ZERO, Vec3::ZERO), dead, Particle::new(Vec3::X, Vec3::ZERO)])
            .unwrap();

        let (view_proj, view) = camera();
        let config = SimulationConfig::default();
        let frame = FrameInput {
            view_proj,
            view,
            time: 0.0,
            config: &config,
        };
        assert_eq!(backend.render(&frame).unwrap(), 2);
        assert!(backend.snapshot().unwrap().pixels().iter().any(|p| p.x > 0.0));
    }

    #[test]
    fn update_respawns_around_synced_spawners() {
        let mut backend = backend(8);
        backend.sync_spawners(&[[5.0, 5.0, 5.0, 10.0]]);
        let config = SimulationConfig::default();
        backend.update(&SimParams::new(&config, 0.016, 1.0, 8, 1));

        for p in backend.read_particles().unwrap() {
            assert_eq!(p.life, 1.0);
            assert!((p.position - Vec3::splat(5.0)).abs().max_element() <= config.spawn_radius);
        }
    }

    #[test]
    fn clear_uses_transparent_background_with_alpha() {
        let mut backend = backend(1);
        let (view_proj, view) = camera();
        let config = SimulationConfig::default();
        backend
            .render(&FrameInput {
                view_proj,
                view,
                time: 0.0,
                config: &config,
            })
            .unwrap();
        assert_eq!(backend.framebuffer().pixel(0, 0), Some(glam::Vec4::ZERO));
    }

    #[test]
    fn destroy_twice_is_harmless() {
        let mut backend = backend(16);
        backend.destroy();
        backend.destroy();
        assert_eq!(backend.capacity(), 0);
        assert!(backend.read_particles().unwrap().is_empty());
    }
}
