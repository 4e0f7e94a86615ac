//! Offscreen render target and presentation.
//!
//! Every GPU tier draws into an `Rgba8Unorm` texture. A window gets that
//! texture blitted onto its swapchain image each frame. Headless hosts read
//! it back into a [`Framebuffer`].

use glam::Vec2;
use tracing::{debug, warn};

use super::{
    compile_shader, read_texture, scoped, GpuDevice, COLOR_FORMAT, DEPTH_FORMAT,
    DEPTH_STENCIL_FORMAT, MSAA_SAMPLES,
};
use crate::capability::Tier;
use crate::context::{ContextAttributes, GpuContext, PresentSurface};
use crate::error::{EngineError, FrameError, SetupError};
use crate::raster::{clear_color, Framebuffer};
use crate::shaders::{ShaderLibrary, PRESENT_BLIT};

/// Frame error for a lost or outdated surface once reconfiguration ran.
fn recovery_error(lost: wgpu::SurfaceError, reconfigured: Result<(), String>) -> FrameError {
    match reconfigured {
        Ok(()) => FrameError::Surface(lost),
        Err(message) => FrameError::Device(format!("surface reconfiguration failed: {message}")),
    }
}

/// Formats and sample count every pipeline drawing into the target must match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetFormat {
    pub color: wgpu::TextureFormat,
    pub depth: Option<wgpu::TextureFormat>,
    pub samples: u32,
}

impl TargetFormat {
    pub fn for_attributes(adapter: &wgpu::Adapter, attributes: &ContextAttributes) -> Self {
        let samples = if attributes.antialias {
            let flags = adapter.get_texture_format_features(COLOR_FORMAT).flags;
            if flags.sample_count_supported(MSAA_SAMPLES) {
                MSAA_SAMPLES
            } else {
                warn!(target: "tpe::render", "4x MSAA unsupported for the color target, antialiasing disabled");
                1
            }
        } else {
            1
        };
        let depth = match (attributes.depth, attributes.stencil) {
            (_, true) => Some(DEPTH_STENCIL_FORMAT),
            (true, false) => Some(DEPTH_FORMAT),
            (false, false) => None,
        };
        Self {
            color: COLOR_FORMAT,
            depth,
            samples,
        }
    }
}

struct Attachment {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
}

impl Attachment {
    fn new(
        device: &wgpu::Device,
        label: &str,
        (width, height): (u32, u32),
        format: wgpu::TextureFormat,
        samples: u32,
        usage: wgpu::TextureUsages,
    ) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: samples,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Self { texture, view }
    }
}

/// Fullscreen blit from the offscreen target to the swapchain.
struct Presenter {
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    bind_group: wgpu::BindGroup,
    sampler: wgpu::Sampler,
}

impl Presenter {
    fn new(
        device: &wgpu::Device,
        tier: Tier,
        shaders: &ShaderLibrary,
        scene: &wgpu::TextureView,
        surface_format: wgpu::TextureFormat,
    ) -> Result<Self, SetupError> {
        let shader = compile_shader(device, tier, shaders, PRESENT_BLIT)?;

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Present Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Present Bind Group Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });
        let bind_group = Self::bind(device, &bind_group_layout, scene, &sampler);

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Present Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });
        let pipeline = scoped(device, wgpu::ErrorFilter::Validation, || {
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("Present Pipeline"),
                layout: Some(&pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &shader,
                    entry_point: Some("vs_main"),
                    buffers: &[],
                    compilation_options: Default::default(),
                },
                fragment: Some(wgpu::FragmentState {
                    module: &shader,
                    entry_point: Some("fs_main"),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: surface_format,
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
            tier,
            name: PRESENT_BLIT.to_string(),
            message,
        })?;

        Ok(Self {
            pipeline,
            bind_group_layout,
            bind_group,
            sampler,
        })
    }

    fn bind(
        device: &wgpu::Device,
        layout: &wgpu::BindGroupLayout,
        scene: &wgpu::TextureView,
        sampler: &wgpu::Sampler,
    ) -> wgpu::BindGroup {
        device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Present Bind Group"),
            layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(scene),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(sampler),
                },
            ],
        })
    }
}

/// Offscreen color target plus its optional MSAA and depth attachments.
pub struct RenderTarget {
    format: TargetFormat,
    size: (u32, u32),
    color: Attachment,
    msaa: Option<Attachment>,
    depth: Option<Attachment>,
    clear: wgpu::Color,
    preserve: bool,
    presenter: Option<Presenter>,
}

impl RenderTarget {
    pub(crate) fn new(
        gpu: &GpuDevice,
        tier: Tier,
        shaders: &ShaderLibrary,
        size: (u32, u32),
        attributes: &ContextAttributes,
        surface_format: Option<wgpu::TextureFormat>,
    ) -> Result<Self, SetupError> {
        let format = TargetFormat::for_attributes(&gpu.adapter, attributes);
        let (color, msaa, depth) = Self::attachments(&gpu.device, &format, size);
        let presenter = surface_format
            .map(|surface_format| Presenter::new(&gpu.device, tier, shaders, &color.view, surface_format))
            .transpose()?;

        let background = clear_color(attributes.alpha);
        debug!(
            target: "tpe::render",
            width = size.0,
            height = size.1,
            samples = format.samples,
            depth = ?format.depth,
            "render target created"
        );

        Ok(Self {
            format,
            size,
            color,
            msaa,
            depth,
            clear: wgpu::Color {
                r: background.x as f64,
                g: background.y as f64,
                b: background.z as f64,
                a: background.w as f64,
            },
            preserve: attributes.preserve_drawing_buffer,
            presenter,
        })
    }

    fn attachments(
        device: &wgpu::Device,
        format: &TargetFormat,
        size: (u32, u32),
    ) -> (Attachment, Option<Attachment>, Option<Attachment>) {
        let color = Attachment::new(
            device,
            "Offscreen Color",
            size,
            format.color,
            1,
            wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC,
        );
        let msaa = (format.samples > 1).then(|| {
            Attachment::new(
                device,
                "Offscreen Color (MSAA)",
                size,
                format.color,
                format.samples,
                wgpu::TextureUsages::RENDER_ATTACHMENT,
            )
        });
        let depth = format.depth.map(|depth_format| {
            Attachment::new(
                device,
                "Offscreen Depth",
                size,
                depth_format,
                format.samples,
                wgpu::TextureUsages::RENDER_ATTACHMENT,
            )
        });
        (color, msaa, depth)
    }

    pub fn format(&self) -> &TargetFormat {
        &self.format
    }

    pub fn size(&self) -> (u32, u32) {
        self.size
    }

    pub fn resolution(&self) -> Vec2 {
        Vec2::new(self.size.0 as f32, self.size.1 as f32)
    }

    /// Start the particle pass. Clears unless the drawing buffer is preserved.
    pub fn begin_pass<'e>(&'e self, encoder: &'e mut wgpu::CommandEncoder) -> wgpu::RenderPass<'e> {
        let load = if self.preserve {
            wgpu::LoadOp::Load
        } else {
            wgpu::LoadOp::Clear(self.clear)
        };
        let (view, resolve_target) = match &self.msaa {
            Some(msaa) => (&msaa.view, Some(&self.color.view)),
            None => (&self.color.view, None),
        };
        let stencil = self.format.depth == Some(DEPTH_STENCIL_FORMAT);

        encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Particle Pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view,
                resolve_target,
                ops: wgpu::Operations {
                    load,
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: self.depth.as_ref().map(|depth| {
                wgpu::RenderPassDepthStencilAttachment {
                    view: &depth.view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(1.0),
                        store: wgpu::StoreOp::Discard,
                    }),
                    stencil_ops: stencil.then_some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(0),
                        store: wgpu::StoreOp::Discard,
                    }),
                }
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
        })
    }

    /// Blit onto the swapchain and present. Lost and outdated surfaces are
    /// reconfigured and the frame is skipped. A reconfiguration the device
    /// rejects surfaces as [`FrameError::Device`].
    pub(crate) fn present(&self, gpu: &GpuDevice, surface: &PresentSurface) -> Result<(), FrameError> {
        let Some(presenter) = &self.presenter else {
            return Ok(());
        };
        let output = match surface.surface.get_current_texture() {
            Ok(output) => output,
            Err(err @ (wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated)) => {
                let reconfigured = scoped(&gpu.device, wgpu::ErrorFilter::Validation, || {
                    surface.surface.configure(&gpu.device, &surface.config)
                });
                return Err(recovery_error(err, reconfigured));
            }
            Err(err) => return Err(err.into()),
        };
        let view = output
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());

        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Present Encoder"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Present Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(&presenter.pipeline);
            pass.set_bind_group(0, &presenter.bind_group, &[]);
            pass.draw(0..3, 0..1);
        }
        gpu.queue.submit(std::iter::once(encoder.finish()));
        output.present();
        Ok(())
    }

    /// Blocking copy of the last frame.
    pub(crate) fn read_pixels(&self, gpu: &GpuDevice) -> Result<Framebuffer, EngineError> {
        let bytes = read_texture(gpu, &self.color.texture, 4).map_err(EngineError::Readback)?;
        Ok(Framebuffer::from_rgba8(self.size.0, self.size.1, &bytes))
    }

    pub(crate) fn resize(&mut self, gpu: &GpuDevice, width: u32, height: u32) {
        let size = (width.max(1), height.max(1));
        if size == self.size {
            return;
        }
        self.destroy();
        let (color, msaa, depth) = Self::attachments(&gpu.device, &self.format, size);
        self.color = color;
        self.msaa = msaa;
        self.depth = depth;
        self.size = size;
        if let Some(presenter) = self.presenter.as_mut() {
            presenter.bind_group = Presenter::bind(
                &gpu.device,
                &presenter.bind_group_layout,
                &self.color.view,
                &presenter.sampler,
            );
        }
    }

    pub(crate) fn destroy(&self) {
        self.color.texture.destroy();
        if let Some(msaa) = &self.msaa {
            msaa.texture.destroy();
        }
        if let Some(depth) = &self.depth {
            depth.texture.destroy();
        }
    }
}

/// A GPU context together with the target the backend draws into.
pub(crate) struct Canvas {
    pub ctx: GpuContext,
    pub target: RenderTarget,
}

impl Canvas {
    pub fn new(ctx: GpuContext, shaders: &ShaderLibrary) -> Result<Self, SetupError> {
        let surface_format = ctx.surface.as_ref().map(|s| s.config.format);
        let target = RenderTarget::new(
            &ctx.gpu,
            ctx.tier,
            shaders,
            (ctx.width, ctx.height),
            &ctx.attributes,
            surface_format,
        )?;
        Ok(Self { ctx, target })
    }

    pub fn gpu(&self) -> &GpuDevice {
        &self.ctx.gpu
    }

    /// Submit the particle pass, then present when there is a window.
    pub fn finish(&self, encoder: wgpu::CommandEncoder) -> Result<(), FrameError> {
        let gpu = self.gpu();
        gpu.queue.submit(std::iter::once(encoder.finish()));
        match &self.ctx.surface {
            Some(surface) => self.target.present(gpu, surface),
            None => Ok(()),
        }
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        let (width, height) = (width.max(1), height.max(1));
        self.ctx.width = width;
        self.ctx.height = height;
        if let Some(surface) = self.ctx.surface.as_mut() {
            surface.config.width = width;
            surface.config.height = height;
            surface.surface.configure(&self.ctx.gpu.device, &surface.config);
        }
        self.target.resize(&self.ctx.gpu, width, height);
    }

    pub fn snapshot(&self) -> Result<Framebuffer, EngineError> {
        self.target.read_pixels(self.gpu())
    }

    pub fn destroy(&mut self) {
        self.target.destroy();
        self.ctx.surface = None;
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconfigured_surface_skips_the_frame() {
        let err = recovery_error(wgpu::SurfaceError::Outdated, Ok(()));
        assert!(matches!(err, FrameError::Surface(wgpu::SurfaceError::Outdated)));
    }

    #[test]
    fn rejected_reconfiguration_is_a_device_error() {
        let err = recovery_error(wgpu::SurfaceError::Lost, Err("unsupported present mode".into()));
        match err {
            FrameError::Device(message) => assert!(message.contains("unsupported present mode")),
            other => panic!("expected a device error, got {other:?}"),
        }
    }
}
