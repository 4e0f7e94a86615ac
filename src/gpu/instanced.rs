//! Instanced sprite drawing from a particle vertex buffer, and the legacy
//! tier built on it.
//!
//! The legacy tier simulates on the CPU and re-uploads the packed 48-byte
//! records every frame. The compute tier reuses [`InstancedSprites`] with its
//! 64-byte storage buffer bound as the vertex buffer.

use std::sync::Arc;

use bytemuck::Zeroable;
use tracing::debug;

use super::target::Canvas;
use super::{
    allocate_buffer, compile_shader, uniform_entry, GpuDevice, RenderParams, SpritePipelines,
    SpriteSource, TargetFormat,
};
use crate::backend::{Backend, FrameInput};
use crate::buffer::ParticleBuffer;
use crate::capability::Tier;
use crate::context::GpuContext;
use crate::error::{CapacityError, EngineError, FrameError, SetupError};
use crate::particle::{Particle, ParticleLayout};
use crate::raster::Framebuffer;
use crate::shaders::{ShaderLibrary, RENDER_PARTICLE};
use crate::simulation::{self, SimParams};

/// Render uniform, its bind group and both blend pipelines for
/// `render/particle`.
pub(crate) struct InstancedSprites {
    uniforms: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
    pipelines: SpritePipelines,
}

impl InstancedSprites {
    pub fn new(
        gpu: &GpuDevice,
        tier: Tier,
        shaders: &ShaderLibrary,
        layout: ParticleLayout,
        format: &TargetFormat,
    ) -> Result<Self, SetupError> {
        let device = &gpu.device;
        let shader = compile_shader(device, tier, shaders, RENDER_PARTICLE)?;

        let uniforms = allocate_buffer(
            device,
            tier,
            "Render Uniform Buffer",
            bytemuck::bytes_of(&RenderParams::zeroed()),
            wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        )?;
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Sprite Bind Group Layout"),
            entries: &[uniform_entry(
                0,
                wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
            )],
        });
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Sprite Bind Group"),
            layout: &bind_group_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: uniforms.as_entire_binding(),
            }],
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Sprite Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let attributes = layout.vertex_attributes();
        let instance_layout = wgpu::VertexBufferLayout {
            array_stride: layout.stride,
            step_mode: wgpu::VertexStepMode::Instance,
            attributes: &attributes,
        };
        let pipelines = SpritePipelines::new(
            device,
            tier,
            RENDER_PARTICLE,
            &SpriteSource {
                module: &shader,
                vertex_entry: "vs_main",
                buffers: &[instance_layout],
                layout: &pipeline_layout,
            },
            format,
        )?;

        Ok(Self {
            uniforms,
            bind_group,
            pipelines,
        })
    }

    /// Record and submit one sprite pass over `instances` records of
    /// `vertices`, then present.
    pub fn draw(
        &self,
        canvas: &Canvas,
        frame: &FrameInput<'_>,
        vertices: &wgpu::Buffer,
        instances: u32,
    ) -> Result<(), FrameError> {
        let gpu = canvas.gpu();
        let params = RenderParams::new(
            frame.view_proj,
            frame.view,
            canvas.target.resolution(),
            frame.config.particle_scale,
            frame.time,
        );
        gpu.queue.write_buffer(&self.uniforms, 0, bytemuck::bytes_of(&params));

        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Sprite Encoder"),
            });
        {
            let mut pass = canvas.target.begin_pass(&mut encoder);
            pass.set_pipeline(self.pipelines.get(frame.config.blend_mode));
            pass.set_bind_group(0, &self.bind_group, &[]);
            pass.set_vertex_buffer(0, vertices.slice(..));
            pass.draw(0..4, 0..instances);
        }
        canvas.finish(encoder)
    }

    pub fn destroy(&self) {
        self.uniforms.destroy();
    }
}

/// CPU simulation, instanced GPU draw.
pub(crate) struct LegacyBackend {
    canvas: Canvas,
    particles: ParticleBuffer,
    spawners: Vec<[f32; 4]>,
    sprites: InstancedSprites,
}

impl LegacyBackend {
    pub fn new(ctx: GpuContext, shaders: &ShaderLibrary, capacity: usize) -> Result<Self, SetupError> {
        let gpu: Arc<GpuDevice> = ctx.gpu.clone();
        let particles = ParticleBuffer::mirrored(gpu.clone(), capacity)?;
        let canvas = Canvas::new(ctx, shaders)?;
        let sprites = InstancedSprites::new(
            &gpu,
            Tier::Legacy,
            shaders,
            particles.read_layout(),
            canvas.target.format(),
        )?;
        debug!(target: "tpe::render", capacity, "legacy backend ready");
        Ok(Self {
            canvas,
            particles,
            spawners: Vec::new(),
            sprites,
        })
    }
}

impl Backend for LegacyBackend {
    fn tier(&self) -> Tier {
        Tier::Legacy
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
        self.particles.sync_vertices();
    }

    fn render(&mut self, frame: &FrameInput<'_>) -> Result<usize, FrameError> {
        let Some(vertices) = self.particles.vertex_buffer() else {
            return Ok(0);
        };
        let instances = self.particles.capacity() as u32;
        self.sprites.draw(&self.canvas, frame, vertices, instances)?;
        Ok(instances as usize)
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.canvas.resize(width, height);
    }

    fn snapshot(&self) -> Result<Framebuffer, EngineError> {
        self.canvas.snapshot()
    }

    fn destroy(&mut self) {
        self.particles.destroy();
        self.sprites.destroy();
        self.canvas.destroy();
    }
}

#[cfg(test)]
mod tests {
    use glam::{Mat4, Vec3};

    use super::*;
    use crate::config::SimulationConfig;
    use crate::gpu::fallback_context;

    #[test]
    fn legacy_reports_every_drawn_instance() {
        let Some(ctx) = fallback_context(Tier::Legacy) else {
            return;
        };
        let mut backend = LegacyBackend::new(ctx, &ShaderLibrary::new(), 8)
            .expect("legacy tier on the fallback adapter");

        let mut particles: Vec<Particle> = (0..8)
            .map(|i| Particle::new(Vec3::new(i as f32, 0.0, 0.0), Vec3::ZERO))
            .collect();
        for dead in &mut particles[..3] {
            dead.life = 0.0;
        }
        backend.upload(&particles).unwrap();

        let config = SimulationConfig::default();
        let frame = FrameInput {
            view_proj: Mat4::IDENTITY,
            view: Mat4::IDENTITY,
            time: 0.0,
            config: &config,
        };
        assert_eq!(backend.render(&frame).unwrap(), 8);
        backend.destroy();
    }
}
