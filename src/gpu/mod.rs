//! wgpu plumbing for the three GPU tiers.
//!
//! - [`probe`] opens adapters and devices while the detector walks the tiers.
//! - [`target`] owns the offscreen color target, its optional MSAA and depth
//!   attachments, the present blit and pixel readback.
//! - `compute`, `feedback` and `instanced` are the per-tier backends behind
//!   [`crate::backend::Backend`].
//!
//! Everything that can fail while building resources goes through an error
//! scope and comes back as a [`SetupError`], so a broken shader or pipeline
//! drops the engine one tier instead of panicking inside wgpu.

pub mod camera;
pub(crate) mod compute;
pub(crate) mod feedback;
pub(crate) mod instanced;
pub mod probe;
pub mod target;

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2};
use wgpu::util::DeviceExt;

pub use camera::Camera;
pub use target::{RenderTarget, TargetFormat};

use crate::capability::Tier;
use crate::config::BlendMode;
use crate::error::SetupError;
use crate::shaders::ShaderLibrary;

/// Depth attachment format without stencil.
pub const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;
/// Depth attachment format when a stencil is requested.
pub const DEPTH_STENCIL_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth24PlusStencil8;
/// Offscreen color target format.
pub const COLOR_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;
/// Feedback state texture format.
pub const STATE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba32Float;
/// Sample count used when antialiasing is on.
pub const MSAA_SAMPLES: u32 = 4;

/// An adapter with its open device and queue.
///
/// Shared through an `Arc` between the detector, the context and the backend.
pub struct GpuDevice {
    pub instance: Arc<wgpu::Instance>,
    pub adapter: wgpu::Adapter,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub info: wgpu::AdapterInfo,
}

impl std::fmt::Debug for GpuDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuDevice")
            .field("name", &self.info.name)
            .field("backend", &self.info.backend)
            .finish_non_exhaustive()
    }
}

/// Per-frame draw uniform, shared by every sprite pipeline.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct RenderParams {
    pub view_proj: [[f32; 4]; 4],
    pub view: [[f32; 4]; 4],
    pub resolution: [f32; 2],
    pub particle_scale: f32,
    pub time: f32,
    /// Particles per row of the feedback state texture.
    pub state_columns: u32,
    pub _pad: [u32; 3],
}

impl RenderParams {
    pub fn new(view_proj: Mat4, view: Mat4, resolution: Vec2, particle_scale: f32, time: f32) -> Self {
        Self {
            view_proj: view_proj.to_cols_array_2d(),
            view: view.to_cols_array_2d(),
            resolution: resolution.to_array(),
            particle_scale,
            time,
            state_columns: 0,
            _pad: [0; 3],
        }
    }

    pub fn with_state_columns(mut self, columns: u32) -> Self {
        self.state_columns = columns;
        self
    }
}

/// Fixed-function blend for `mode`. [`crate::raster::blend`] is the CPU twin.
pub fn blend_state(mode: BlendMode) -> wgpu::BlendState {
    match mode {
        BlendMode::Additive => wgpu::BlendState {
            color: wgpu::BlendComponent {
                src_factor: wgpu::BlendFactor::SrcAlpha,
                dst_factor: wgpu::BlendFactor::One,
                operation: wgpu::BlendOperation::Add,
            },
            alpha: wgpu::BlendComponent {
                src_factor: wgpu::BlendFactor::Zero,
                dst_factor: wgpu::BlendFactor::One,
                operation: wgpu::BlendOperation::Add,
            },
        },
        BlendMode::Alpha => {
            let component = wgpu::BlendComponent {
                src_factor: wgpu::BlendFactor::SrcAlpha,
                dst_factor: wgpu::BlendFactor::OneMinusSrcAlpha,
                operation: wgpu::BlendOperation::Add,
            };
            wgpu::BlendState {
                color: component,
                alpha: component,
            }
        }
    }
}

/// Run `build` inside an error scope and return the first captured error.
pub(crate) fn scoped<T>(
    device: &wgpu::Device,
    filter: wgpu::ErrorFilter,
    build: impl FnOnce() -> T,
) -> Result<T, String> {
    device.push_error_scope(filter);
    let value = build();
    match pollster::block_on(device.pop_error_scope()) {
        Some(err) => Err(err.to_string()),
        None => Ok(value),
    }
}

/// Compile the named shader from `shaders`.
pub(crate) fn compile_shader(
    device: &wgpu::Device,
    tier: Tier,
    shaders: &ShaderLibrary,
    name: &str,
) -> Result<wgpu::ShaderModule, SetupError> {
    let source = shaders.get(name)?;
    scoped(device, wgpu::ErrorFilter::Validation, || {
        device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(name),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        })
    })
    .map_err(|message| SetupError::ShaderCompilation {
        tier,
        name: name.to_string(),
        message,
    })
}

/// Create a buffer, turning out-of-memory and validation errors into
/// [`SetupError::Allocation`].
pub(crate) fn allocate_buffer(
    device: &wgpu::Device,
    tier: Tier,
    label: &str,
    contents: &[u8],
    usage: wgpu::BufferUsages,
) -> Result<wgpu::Buffer, SetupError> {
    let allocation = || {
        device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents,
            usage,
        })
    };
    scoped(device, wgpu::ErrorFilter::OutOfMemory, || {
        scoped(device, wgpu::ErrorFilter::Validation, allocation)
    })
    .and_then(|inner| inner)
    .map_err(|message| SetupError::Allocation {
        tier,
        name: label.to_string(),
        message,
    })
}

/// Blocking copy of `size` bytes out of `source`. Tooling only.
pub(crate) fn read_buffer(gpu: &GpuDevice, source: &wgpu::Buffer, size: u64) -> Result<Vec<u8>, String> {
    let staging = gpu.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("Particle Readback Buffer"),
        size,
        usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
        mapped_at_creation: false,
    });
    let mut encoder = gpu
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Readback Encoder"),
        });
    encoder.copy_buffer_to_buffer(source, 0, &staging, 0, size);
    gpu.queue.submit(std::iter::once(encoder.finish()));

    let bytes = map_staging(gpu, &staging)?;
    staging.destroy();
    Ok(bytes)
}

/// Blocking copy of a whole 2D texture with the row padding stripped.
pub(crate) fn read_texture(
    gpu: &GpuDevice,
    texture: &wgpu::Texture,
    bytes_per_texel: u32,
) -> Result<Vec<u8>, String> {
    let width = texture.width();
    let height = texture.height();
    let unpadded_bytes_per_row = width * bytes_per_texel;
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    let padded_bytes_per_row = unpadded_bytes_per_row.div_ceil(align) * align;

    let staging = gpu.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("Texture Readback Buffer"),
        size: padded_bytes_per_row as u64 * height as u64,
        usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
        mapped_at_creation: false,
    });
    let mut encoder = gpu
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Readback Encoder"),
        });
    encoder.copy_texture_to_buffer(
        wgpu::TexelCopyTextureInfo {
            texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        wgpu::TexelCopyBufferInfo {
            buffer: &staging,
            layout: wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(padded_bytes_per_row),
                rows_per_image: Some(height),
            },
        },
        wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
    );
    gpu.queue.submit(std::iter::once(encoder.finish()));

    let padded = map_staging(gpu, &staging)?;
    staging.destroy();

    let mut bytes = Vec::with_capacity((unpadded_bytes_per_row * height) as usize);
    for row in padded.chunks_exact(padded_bytes_per_row as usize) {
        bytes.extend_from_slice(&row[..unpadded_bytes_per_row as usize]);
    }
    Ok(bytes)
}

fn map_staging(gpu: &GpuDevice, staging: &wgpu::Buffer) -> Result<Vec<u8>, String> {
    let slice = staging.slice(..);
    let (tx, rx) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = tx.send(result);
    });
    gpu.device.poll(wgpu::Maintain::Wait);

    rx.recv()
        .map_err(|e| e.to_string())?
        .map_err(|e| e.to_string())?;
    let bytes = slice.get_mapped_range().to_vec();
    staging.unmap();
    Ok(bytes)
}

pub(crate) fn uniform_entry(binding: u32, visibility: wgpu::ShaderStages) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

pub(crate) fn unfiltered_texture_entry(
    binding: u32,
    visibility: wgpu::ShaderStages,
) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility,
        ty: wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: false },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        count: None,
    }
}

/// What a sprite pipeline reads its particles from.
pub(crate) struct SpriteSource<'a> {
    pub module: &'a wgpu::ShaderModule,
    pub vertex_entry: &'a str,
    pub buffers: &'a [wgpu::VertexBufferLayout<'a>],
    pub layout: &'a wgpu::PipelineLayout,
}

/// The two blend variants of one sprite draw, built together at setup.
pub(crate) struct SpritePipelines {
    additive: wgpu::RenderPipeline,
    alpha: wgpu::RenderPipeline,
}

impl SpritePipelines {
    pub fn new(
        device: &wgpu::Device,
        tier: Tier,
        name: &str,
        source: &SpriteSource<'_>,
        format: &TargetFormat,
    ) -> Result<Self, SetupError> {
        let build = |mode: BlendMode, fragment_entry: &str| {
            let label = format!("{name} ({})", mode.name());
            scoped(device, wgpu::ErrorFilter::Validation, || {
                device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                    label: Some(&label),
                    layout: Some(source.layout),
                    vertex: wgpu::VertexState {
                        module: source.module,
                        entry_point: Some(source.vertex_entry),
                        buffers: source.buffers,
                        compilation_options: Default::default(),
                    },
                    fragment: Some(wgpu::FragmentState {
                        module: source.module,
                        entry_point: Some(fragment_entry),
                        targets: &[Some(wgpu::ColorTargetState {
                            format: format.color,
                            blend: Some(blend_state(mode)),
                            write_mask: wgpu::ColorWrites::ALL,
                        })],
                        compilation_options: Default::default(),
                    }),
                    primitive: wgpu::PrimitiveState {
                        topology: wgpu::PrimitiveTopology::TriangleStrip,
                        strip_index_format: None,
                        front_face: wgpu::FrontFace::Ccw,
                        cull_mode: None,
                        polygon_mode: wgpu::PolygonMode::Fill,
                        unclipped_depth: false,
                        conservative: false,
                    },
                    // Attached but never tested: draw order decides.
                    depth_stencil: format.depth.map(|depth| wgpu::DepthStencilState {
                        format: depth,
                        depth_write_enabled: false,
                        depth_compare: wgpu::CompareFunction::Always,
                        stencil: wgpu::StencilState::default(),
                        bias: wgpu::DepthBiasState::default(),
                    }),
                    multisample: wgpu::MultisampleState {
                        count: format.samples,
                        mask: !0,
                        alpha_to_coverage_enabled: false,
                    },
                    multiview: None,
                    cache: None,
                })
            })
            .map_err(|message| SetupError::Pipeline {
                tier,
                name: label.clone(),
                message,
            })
        };

        Ok(Self {
            additive: build(BlendMode::Additive, "fs_additive")?,
            alpha: build(BlendMode::Alpha, "fs_alpha")?,
        })
    }

    pub fn get(&self, mode: BlendMode) -> &wgpu::RenderPipeline {
        match mode {
            BlendMode::Additive => &self.additive,
            BlendMode::Alpha => &self.alpha,
        }
    }
}

/// Offscreen context on the platform's fallback adapter. `None` when the
/// machine has none that can run `tier`.
#[cfg(test)]
pub(crate) fn fallback_context(tier: Tier) -> Option<crate::context::GpuContext> {
    use crate::context::{BackendContextFactory, Context, ContextOptions, SurfaceTarget};

    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
    let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference: wgpu::PowerPreference::LowPower,
        force_fallback_adapter: true,
        compatible_surface: None,
    }))?;
    let flags = adapter.get_downlevel_capabilities().flags;
    if tier == Tier::Compute && !flags.contains(wgpu::DownlevelFlags::COMPUTE_SHADERS) {
        return None;
    }
    let (device, queue) = pollster::block_on(adapter.request_device(
        &wgpu::DeviceDescriptor {
            label: Some("tpe test device"),
            required_features: wgpu::Features::empty(),
            required_limits: adapter.limits(),
            memory_hints: wgpu::MemoryHints::Performance,
        },
        None,
    ))
    .ok()?;
    let gpu = Arc::new(GpuDevice {
        instance: Arc::new(instance),
        info: adapter.get_info(),
        adapter,
        device,
        queue,
    });
    let factory = BackendContextFactory::new(Some(gpu));
    match factory.create_context(&SurfaceTarget::offscreen(32, 32), tier, &ContextOptions::default()) {
        Ok(Context::Gpu(ctx)) => Some(ctx),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_params_match_wgsl_layout() {
        assert_eq!(std::mem::size_of::<RenderParams>(), 160);
        assert_eq!(std::mem::offset_of!(RenderParams, resolution), 128);
        assert_eq!(std::mem::offset_of!(RenderParams, state_columns), 144);
    }

    #[test]
    fn additive_blend_keeps_destination_alpha() {
        let state = blend_state(BlendMode::Additive);
        assert_eq!(state.color.dst_factor, wgpu::BlendFactor::One);
        assert_eq!(state.alpha.src_factor, wgpu::BlendFactor::Zero);
        assert_eq!(state.alpha.dst_factor, wgpu::BlendFactor::One);
    }

    #[test]
    fn alpha_blend_is_symmetric() {
        let state = blend_state(BlendMode::Alpha);
        assert_eq!(state.color, state.alpha);
        assert_eq!(state.color.dst_factor, wgpu::BlendFactor::OneMinusSrcAlpha);
    }
}
