//! Rendering contexts for the committed tier.
//!
//! [`BackendContextFactory`] turns a [`SurfaceTarget`] plus the device opened
//! during probing into a [`Context`]. A GPU tier without a device, or a
//! window the adapter cannot present to, is a [`ContextError`]. The engine
//! answers that by switching to the software tier, never by probing again.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use winit::window::Window;

use crate::capability::{PowerPreference, Tier};
use crate::error::ContextError;
use crate::gpu::GpuDevice;

/// Optional device features the GPU tiers pick up when the adapter grants them.
pub const EXTENSION_ALLOWLIST: [(&str, wgpu::Features); 7] = [
    ("float32-filterable", wgpu::Features::FLOAT32_FILTERABLE),
    ("texture-compression-bc", wgpu::Features::TEXTURE_COMPRESSION_BC),
    ("texture-compression-etc2", wgpu::Features::TEXTURE_COMPRESSION_ETC2),
    ("texture-compression-astc", wgpu::Features::TEXTURE_COMPRESSION_ASTC),
    ("timestamp-query", wgpu::Features::TIMESTAMP_QUERY),
    ("multi-draw-indirect", wgpu::Features::MULTI_DRAW_INDIRECT),
    ("shader-f16", wgpu::Features::SHADER_F16),
];

/// All allowlisted features as one set.
pub fn allowlisted_features() -> wgpu::Features {
    EXTENSION_ALLOWLIST
        .iter()
        .fold(wgpu::Features::empty(), |acc, (_, feature)| acc | *feature)
}

/// Extensions the device actually granted. Absent names were refused.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionTable {
    granted: BTreeMap<&'static str, wgpu::Features>,
}

impl ExtensionTable {
    pub fn from_features(features: wgpu::Features) -> Self {
        let granted = EXTENSION_ALLOWLIST
            .iter()
            .filter(|(_, feature)| features.contains(*feature))
            .map(|(name, feature)| (*name, *feature))
            .collect();
        Self { granted }
    }

    pub fn get(&self, name: &str) -> Option<wgpu::Features> {
        self.granted.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.granted.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.granted.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.granted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.granted.is_empty()
    }
}

/// Where frames end up.
#[derive(Debug, Clone)]
pub enum SurfaceTarget {
    /// A window presented through a swapchain.
    Window(Arc<Window>),
    /// No window. Frames stay in the offscreen target and are read back.
    Offscreen { width: u32, height: u32 },
}

impl SurfaceTarget {
    pub fn offscreen(width: u32, height: u32) -> Self {
        SurfaceTarget::Offscreen { width, height }
    }

    /// Current size, never smaller than 1x1.
    pub fn size(&self) -> (u32, u32) {
        let (w, h) = match self {
            SurfaceTarget::Window(window) => {
                let size = window.inner_size();
                (size.width, size.height)
            }
            SurfaceTarget::Offscreen { width, height } => (*width, *height),
        };
        (w.max(1), h.max(1))
    }
}

/// Overrides for [`ContextAttributes`]. Unset fields take the tier default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextOptions {
    pub alpha: Option<bool>,
    pub antialias: Option<bool>,
    pub depth: Option<bool>,
    pub stencil: Option<bool>,
    pub power_preference: Option<PowerPreference>,
    pub preserve_drawing_buffer: Option<bool>,
    pub premultiplied_alpha: Option<bool>,
}

impl ContextOptions {
    /// Fill unset fields with the defaults for `tier`.
    pub fn resolve(&self, tier: Tier) -> ContextAttributes {
        let defaults = ContextAttributes::defaults_for(tier);
        ContextAttributes {
            alpha: self.alpha.unwrap_or(defaults.alpha),
            antialias: self.antialias.unwrap_or(defaults.antialias),
            depth: self.depth.unwrap_or(defaults.depth),
            stencil: self.stencil.unwrap_or(defaults.stencil),
            power_preference: self.power_preference.unwrap_or(defaults.power_preference),
            preserve_drawing_buffer: self
                .preserve_drawing_buffer
                .unwrap_or(defaults.preserve_drawing_buffer),
            premultiplied_alpha: self.premultiplied_alpha.unwrap_or(defaults.premultiplied_alpha),
        }
    }
}

/// Resolved context attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextAttributes {
    /// Keep an alpha channel on the presented surface.
    pub alpha: bool,
    /// Multisample the offscreen target.
    pub antialias: bool,
    pub depth: bool,
    pub stencil: bool,
    pub power_preference: PowerPreference,
    /// Load the previous frame instead of clearing.
    pub preserve_drawing_buffer: bool,
    pub premultiplied_alpha: bool,
}

impl ContextAttributes {
    pub fn defaults_for(tier: Tier) -> Self {
        Self {
            alpha: tier == Tier::Software,
            antialias: false,
            depth: true,
            stencil: false,
            power_preference: PowerPreference::HighPerformance,
            preserve_drawing_buffer: false,
            premultiplied_alpha: true,
        }
    }
}

/// A configured swapchain.
pub struct PresentSurface {
    pub surface: wgpu::Surface<'static>,
    pub config: wgpu::SurfaceConfiguration,
}

pub struct GpuContext {
    pub tier: Tier,
    pub gpu: Arc<GpuDevice>,
    pub surface: Option<PresentSurface>,
    pub width: u32,
    pub height: u32,
    pub attributes: ContextAttributes,
    pub extensions: ExtensionTable,
}

pub struct SoftwareContext {
    pub width: u32,
    pub height: u32,
    pub attributes: ContextAttributes,
}

/// Context for one tier.
pub enum Context {
    Gpu(GpuContext),
    Software(SoftwareContext),
}

impl Context {
    pub fn tier(&self) -> Tier {
        match self {
            Context::Gpu(ctx) => ctx.tier,
            Context::Software(_) => Tier::Software,
        }
    }

    pub fn size(&self) -> (u32, u32) {
        match self {
            Context::Gpu(ctx) => (ctx.width, ctx.height),
            Context::Software(ctx) => (ctx.width, ctx.height),
        }
    }

    pub fn attributes(&self) -> &ContextAttributes {
        match self {
            Context::Gpu(ctx) => &ctx.attributes,
            Context::Software(ctx) => &ctx.attributes,
        }
    }

    /// `None` on the software tier.
    pub fn extensions(&self) -> Option<&ExtensionTable> {
        match self {
            Context::Gpu(ctx) => Some(&ctx.extensions),
            Context::Software(_) => None,
        }
    }
}

/// Builds contexts on top of the device committed while probing.
pub struct BackendContextFactory {
    device: Option<Arc<GpuDevice>>,
}

impl BackendContextFactory {
    pub fn new(device: Option<Arc<GpuDevice>>) -> Self {
        Self { device }
    }

    pub fn create_context(
        &self,
        target: &SurfaceTarget,
        tier: Tier,
        options: &ContextOptions,
    ) -> Result<Context, ContextError> {
        let (width, height) = target.size();
        let attributes = options.resolve(tier);

        if tier == Tier::Software {
            debug!(target: "tpe::context", width, height, "software context");
            return Ok(Context::Software(SoftwareContext {
                width,
                height,
                attributes,
            }));
        }

        let gpu = self.device.clone().ok_or(ContextError::NoDevice { tier })?;
        let surface = match target {
            SurfaceTarget::Window(window) => Some(configure_surface(
                &gpu,
                window.clone(),
                tier,
                (width, height),
                &attributes,
            )?),
            SurfaceTarget::Offscreen { .. } => None,
        };
        let extensions = ExtensionTable::from_features(gpu.device.features());

        info!(
            target: "tpe::context",
            %tier,
            width,
            height,
            windowed = surface.is_some(),
            extensions = extensions.len(),
            "context created"
        );

        Ok(Context::Gpu(GpuContext {
            tier,
            gpu,
            surface,
            width,
            height,
            attributes,
            extensions,
        }))
    }
}

fn configure_surface(
    gpu: &GpuDevice,
    window: Arc<Window>,
    tier: Tier,
    (width, height): (u32, u32),
    attributes: &ContextAttributes,
) -> Result<PresentSurface, ContextError> {
    let surface = gpu.instance.create_surface(window)?;
    if !gpu.adapter.is_surface_supported(&surface) {
        return Err(ContextError::SurfaceUnsupported { tier });
    }

    let caps = surface.get_capabilities(&gpu.adapter);
    let format = caps
        .formats
        .iter()
        .copied()
        .find(|f| !f.is_srgb())
        .or_else(|| caps.formats.first().copied())
        .ok_or(ContextError::SurfaceUnsupported { tier })?;

    let wanted_alpha = if !attributes.alpha {
        wgpu::CompositeAlphaMode::Opaque
    } else if attributes.premultiplied_alpha {
        wgpu::CompositeAlphaMode::PreMultiplied
    } else {
        wgpu::CompositeAlphaMode::PostMultiplied
    };
    let alpha_mode = if caps.alpha_modes.contains(&wanted_alpha) {
        wanted_alpha
    } else {
        wgpu::CompositeAlphaMode::Auto
    };

    let config = wgpu::SurfaceConfiguration {
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
        format,
        width,
        height,
        present_mode: wgpu::PresentMode::AutoVsync,
        desired_maximum_frame_latency: 2,
        alpha_mode,
        view_formats: vec![],
    };
    surface.configure(&gpu.device, &config);

    Ok(PresentSurface { surface, config })
}
