//! Render tier: simulation as a fullscreen fragment pass over two
//! `Rgba32Float` state textures.
//!
//! Each frame the update pass samples the front texture and renders into the
//! back one, then the pair flips. A pass never reads the texture it writes.
//! The sprite pass fetches the new front by instance index.

use std::sync::Arc;

use bytemuck::Zeroable;
use tracing::debug;

use super::target::Canvas;
use super::{
    allocate_buffer, compile_shader, scoped, unfiltered_texture_entry, uniform_entry, GpuDevice,
    RenderParams, SpritePipelines, SpriteSource, STATE_FORMAT,
};
use crate::backend::{Backend, FrameInput};
use crate::buffer::{ParticleBuffer, StateTextures};
use crate::capability::Tier;
use crate::context::GpuContext;
use crate::error::{CapacityError, EngineError, FrameError, SetupError};
use crate::particle::Particle;
use crate::raster::Framebuffer;
use crate::shaders::{ShaderLibrary, FEEDBACK_RENDER, FEEDBACK_UPDATE};
use crate::simulation::SimParams;
use crate::spawner::MAX_SPAWNERS;

const TIER: Tier = Tier::Render;

pub(crate) struct FeedbackBackend {
    canvas: Canvas,
    particles: ParticleBuffer,
    params: wgpu::Buffer,
    render_params: wgpu::Buffer,
    spawner_table: wgpu::Texture,
    update_pipeline: wgpu::RenderPipeline,
    /// Indexed by the slot the update reads from.
    update_bind_groups: [wgpu::BindGroup; 2],
    sprites: SpritePipelines,
    /// Indexed by the slot the sprite pass reads from.
    render_bind_groups: [wgpu::BindGroup; 2],
}

impl FeedbackBackend {
    pub fn new(ctx: GpuContext, shaders: &ShaderLibrary, capacity: usize) -> Result<Self, SetupError> {
        let gpu: Arc<GpuDevice> = ctx.gpu.clone();
        let device = &gpu.device;

        let particles = ParticleBuffer::state_textures(gpu.clone(), capacity)?;
        let canvas = Canvas::new(ctx, shaders)?;
        let state = particles.state().ok_or_else(|| SetupError::Allocation {
            tier: TIER,
            name: "Particle State".into(),
            message: "state textures missing".into(),
        })?;

        let params = allocate_buffer(
            device,
            TIER,
            "Simulation Uniform Buffer",
            bytemuck::bytes_of(&SimParams::zeroed()),
            wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        )?;
        let render_params = allocate_buffer(
            device,
            TIER,
            "Render Uniform Buffer",
            bytemuck::bytes_of(&RenderParams::zeroed()),
            wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        )?;
        let spawner_table = scoped(device, wgpu::ErrorFilter::OutOfMemory, || {
            device.create_texture(&wgpu::TextureDescriptor {
                label: Some("Spawner Table"),
                size: wgpu::Extent3d {
                    width: MAX_SPAWNERS as u32,
                    height: 1,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: STATE_FORMAT,
                usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                view_formats: &[],
            })
        })
        .map_err(|message| SetupError::Allocation {
            tier: TIER,
            name: "Spawner Table".into(),
            message,
        })?;
        let spawner_view = spawner_table.create_view(&wgpu::TextureViewDescriptor::default());

        let (update_pipeline, update_bind_groups) =
            build_update(device, shaders, state, &spawner_view, &params)?;
        let (sprites, render_bind_groups) =
            build_sprites(device, shaders, state, &render_params, canvas.target.format())?;

        debug!(
            target: "tpe::render",
            capacity,
            columns = state.columns,
            rows = state.rows,
            "feedback backend ready"
        );
        Ok(Self {
            canvas,
            particles,
            params,
            render_params,
            spawner_table,
            update_pipeline,
            update_bind_groups,
            sprites,
            render_bind_groups,
        })
    }
}

fn build_update(
    device: &wgpu::Device,
    shaders: &ShaderLibrary,
    state: &StateTextures,
    spawner_view: &wgpu::TextureView,
    params: &wgpu::Buffer,
) -> Result<(wgpu::RenderPipeline, [wgpu::BindGroup; 2]), SetupError> {
    let shader = compile_shader(device, TIER, shaders, FEEDBACK_UPDATE)?;
    let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("Feedback Update Bind Group Layout"),
        entries: &[
            unfiltered_texture_entry(0, wgpu::ShaderStages::FRAGMENT),
            unfiltered_texture_entry(1, wgpu::ShaderStages::FRAGMENT),
            uniform_entry(2, wgpu::ShaderStages::FRAGMENT),
        ],
    });
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("Feedback Update Pipeline Layout"),
        bind_group_layouts: &[&layout],
        push_constant_ranges: &[],
    });
    let pipeline = scoped(device, wgpu::ErrorFilter::Validation, || {
        device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Feedback Update Pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_fullscreen"),
                buffers: &[],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs_update"),
                targets: &[Some(wgpu::ColorTargetState {
                    format: STATE_FORMAT,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                ..Default::default()
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        })
    })
    .map_err(|message| SetupError::Pipeline {
        tier: TIER,
        name: FEEDBACK_UPDATE.to_string(),
        message,
    })?;

    let bind = |slot: usize| {
        device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&format!("Feedback Update Bind Group {slot}")),
            layout: &layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&state.textures.slots()[slot].view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(spawner_view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: params.as_entire_binding(),
                },
            ],
        })
    };
    Ok((pipeline, [bind(0), bind(1)]))
}

fn build_sprites(
    device: &wgpu::Device,
    shaders: &ShaderLibrary,
    state: &StateTextures,
    render_params: &wgpu::Buffer,
    format: &super::TargetFormat,
) -> Result<(SpritePipelines, [wgpu::BindGroup; 2]), SetupError> {
    let shader = compile_shader(device, TIER, shaders, FEEDBACK_RENDER)?;
    let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("Feedback Sprite Bind Group Layout"),
        entries: &[
            uniform_entry(0, wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT),
            unfiltered_texture_entry(1, wgpu::ShaderStages::VERTEX),
        ],
    });
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("Feedback Sprite Pipeline Layout"),
        bind_group_layouts: &[&layout],
        push_constant_ranges: &[],
    });
    let sprites = SpritePipelines::new(
        device,
        TIER,
        FEEDBACK_RENDER,
        &SpriteSource {
            module: &shader,
            vertex_entry: "vs_state",
            buffers: &[],
            layout: &pipeline_layout,
        },
        format,
    )?;

    let bind = |slot: usize| {
        device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&format!("Feedback Sprite Bind Group {slot}")),
            layout: &layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: render_params.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&state.textures.slots()[slot].view),
                },
            ],
        })
    };
    Ok((sprites, [bind(0), bind(1)]))
}

impl Backend for FeedbackBackend {
    fn tier(&self) -> Tier {
        TIER
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
        self.canvas.gpu().queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &self.spawner_table,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            bytemuck::cast_slice(rows),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(rows.len() as u32 * 16),
                rows_per_image: None,
            },
            wgpu::Extent3d {
                width: rows.len() as u32,
                height: 1,
                depth_or_array_layers: 1,
            },
        );
    }

    fn update(&mut self, params: &SimParams) {
        if self.particles.capacity() == 0 {
            return;
        }
        let gpu = self.canvas.gpu();
        let Some(state) = self.particles.state_mut() else {
            return;
        };
        let params = params.with_state_columns(state.columns);
        gpu.queue.write_buffer(&self.params, 0, bytemuck::bytes_of(&params));

        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Feedback Encoder"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Feedback Update Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &state.textures.back().view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(&self.update_pipeline);
            pass.set_bind_group(0, &self.update_bind_groups[state.textures.front_index()], &[]);
            pass.draw(0..3, 0..1);
        }
        gpu.queue.submit(std::iter::once(encoder.finish()));
        state.textures.flip();
    }

    fn render(&mut self, frame: &FrameInput<'_>) -> Result<usize, FrameError> {
        let Some(state) = self.particles.state() else {
            return Ok(0);
        };
        let gpu = self.canvas.gpu();
        let params = RenderParams::new(
            frame.view_proj,
            frame.view,
            self.canvas.target.resolution(),
            frame.config.particle_scale,
            frame.time,
        )
        .with_state_columns(state.columns);
        gpu.queue
            .write_buffer(&self.render_params, 0, bytemuck::bytes_of(&params));

        let instances = self.particles.capacity() as u32;
        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Sprite Encoder"),
            });
        {
            let mut pass = self.canvas.target.begin_pass(&mut encoder);
            pass.set_pipeline(self.sprites.get(frame.config.blend_mode));
            pass.set_bind_group(0, &self.render_bind_groups[state.textures.front_index()], &[]);
            pass.draw(0..4, 0..instances);
        }
        self.canvas.finish(encoder)?;
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
        self.render_params.destroy();
        self.spawner_table.destroy();
        self.canvas.destroy();
    }
}
