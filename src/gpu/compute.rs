//! Compute tier: the simulation runs in place over one storage buffer, which
//! the sprite pass then reads as instance vertices.

use std::sync::Arc;

use bytemuck::Zeroable;
use tracing::debug;

use super::instanced::InstancedSprites;
use super::target::Canvas;
use super::{allocate_buffer, compile_shader, scoped, uniform_entry, GpuDevice};
use crate::backend::{Backend, FrameInput};
use crate::buffer::ParticleBuffer;
use crate::capability::Tier;
use crate::context::GpuContext;
use crate::error::{CapacityError, EngineError, FrameError, SetupError};
use crate::particle::Particle;
use crate::raster::Framebuffer;
use crate::shaders::{ShaderLibrary, COMPUTE_UPDATE};
use crate::simulation::{SimParams, WORKGROUP_SIZE};
use crate::spawner::MAX_SPAWNERS;

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

pub(crate) struct ComputeBackend {
    canvas: Canvas,
    particles: ParticleBuffer,
    params: wgpu::Buffer,
    spawners: wgpu::Buffer,
    pipeline: wgpu::ComputePipeline,
    bind_group: wgpu::BindGroup,
    sprites: InstancedSprites,
}

impl ComputeBackend {
    pub fn new(ctx: GpuContext, shaders: &ShaderLibrary, capacity: usize) -> Result<Self, SetupError> {
        let tier = Tier::Compute;
        let gpu: Arc<GpuDevice> = ctx.gpu.clone();
        let device = &gpu.device;

        let particles = ParticleBuffer::device(gpu.clone(), capacity)?;
        let canvas = Canvas::new(ctx, shaders)?;

        let params = allocate_buffer(
            device,
            tier,
            "Simulation Uniform Buffer",
            bytemuck::bytes_of(&SimParams::zeroed()),
            wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        )?;
        let spawners = allocate_buffer(
            device,
            tier,
            "Spawner Table",
            bytemuck::cast_slice(&[[0f32; 4]; MAX_SPAWNERS]),
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
        )?;

        let shader = compile_shader(device, tier, shaders, COMPUTE_UPDATE)?;
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Compute Bind Group Layout"),
            entries: &[
                storage_entry(0, false),
                uniform_entry(1, wgpu::ShaderStages::COMPUTE),
                storage_entry(2, true),
            ],
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Compute Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });
        let pipeline = scoped(device, wgpu::ErrorFilter::Validation, || {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("Compute Pipeline"),
                layout: Some(&pipeline_layout),
                module: &shader,
                entry_point: Some("main"),
                compilation_options: Default::default(),
                cache: None,
            })
        })
        .map_err(|message| SetupError::Pipeline {
            tier,
            name: COMPUTE_UPDATE.to_string(),
            message,
        })?;

        let storage = particles
            .vertex_buffer()
            .ok_or_else(|| SetupError::Allocation {
                tier,
                name: "Particle Storage Buffer".into(),
                message: "storage buffer missing".into(),
            })?;
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Compute Bind Group"),
            layout: &bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: storage.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: params.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: spawners.as_entire_binding(),
                },
            ],
        });

        let sprites = InstancedSprites::new(
            &gpu,
            tier,
            shaders,
            particles.read_layout(),
            canvas.target.format(),
        )?;

        debug!(target: "tpe::render", capacity, "compute backend ready");
        Ok(Self {
            canvas,
            particles,
            params,
            spawners,
            pipeline,
            bind_group,
            sprites,
        })
    }
}

impl Backend for ComputeBackend {
    fn tier(&self) -> Tier {
        Tier::Compute
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
        if packed.is_empty() {
            return;
        }
        let rows = &packed[..packed.len().min(MAX_SPAWNERS)];
        self.canvas
            .gpu()
            .queue
            .write_buffer(&self.spawners, 0, bytemuck::cast_slice(rows));
    }

    fn update(&mut self, params: &SimParams) {
        let count = self.particles.capacity() as u32;
        if count == 0 {
            return;
        }
        let gpu = self.canvas.gpu();
        gpu.queue.write_buffer(&self.params, 0, bytemuck::bytes_of(params));

        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Compute Encoder"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Compute Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &self.bind_group, &[]);
            pass.dispatch_workgroups(count.div_ceil(WORKGROUP_SIZE), 1, 1);
        }
        gpu.queue.submit(std::iter::once(encoder.finish()));
    }

    fn render(&mut self, frame: &FrameInput<'_>) -> Result<usize, FrameError> {
        let Some(storage) = self.particles.vertex_buffer() else {
            return Ok(0);
        };
        let instances = self.particles.capacity() as u32;
        self.sprites.draw(&self.canvas, frame, storage, instances)?;
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
        self.params.destroy();
        self.spawners.destroy();
        self.sprites.destroy();
        self.canvas.destroy();
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use super::*;
    use crate::config::SimulationConfig;
    use crate::gpu::fallback_context;
    use crate::simulation;

    fn close(a: Vec3, b: Vec3) -> bool {
        (a - b).abs().max_element() <= 1e-3 * (1.0 + b.abs().max_element())
    }

    #[test]
    fn gpu_step_matches_cpu_step() {
        let Some(ctx) = fallback_context(Tier::Compute) else {
            return;
        };

        let mut config = SimulationConfig::default();
        config.bounds = Vec3::new(10.0, 8.0, 6.0);
        config.wind = Vec3::new(1.5, 0.0, -0.5);
        config.turbulence.strength = 2.0;

        let mut initial = vec![
            Particle::new(Vec3::new(1.0, 2.0, -1.0), Vec3::new(0.5, 0.0, 0.25)),
            // Crosses the +x wall and bounces.
            Particle::new(Vec3::new(9.99, 0.0, 0.0), Vec3::new(20.0, 0.0, 0.0)),
            Particle::new(Vec3::new(-3.0, -7.5, 5.0), Vec3::new(0.0, -4.0, 0.0)),
            // Dead, respawns around a spawner.
            Particle::new(Vec3::ZERO, Vec3::ZERO),
            Particle::new(Vec3::new(0.0, 4.0, 0.0), Vec3::ZERO),
        ];
        initial[2].life = 0.05;
        initial[3].life = 0.0;
        let spawners = [[2.0, 3.0, -1.0, 10.0], [-4.0, 0.0, 2.0, 1.0]];

        let mut backend = ComputeBackend::new(ctx, &ShaderLibrary::new(), initial.len())
            .expect("compute tier on the fallback adapter");
        backend.upload(&initial).unwrap();
        backend.sync_spawners(&spawners);

        let params = SimParams::new(&config, 0.1, 1.25, initial.len() as u32, spawners.len() as u32);
        backend.update(&params);
        let gpu = backend.read_particles().unwrap();
        backend.destroy();

        let mut cpu = initial.clone();
        simulation::step(&mut cpu, &params, &spawners);

        for (i, (g, c)) in gpu.iter().zip(&cpu).enumerate() {
            assert!(close(g.position, c.position), "{i}: {g:?} vs {c:?}");
            assert!(close(g.velocity, c.velocity), "{i}: {g:?} vs {c:?}");
            assert!((g.life - c.life).abs() < 1e-5, "{i}: {g:?} vs {c:?}");
            assert!((g.size - c.size).abs() < 1e-5, "{i}: {g:?} vs {c:?}");
        }
        assert_eq!(cpu[3].life, 1.0);
        assert_eq!(gpu[3].life, 1.0);
        assert!(cpu[2].life > 0.0);
    }
}
