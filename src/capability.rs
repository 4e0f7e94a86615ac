//! Backend capability detection.
//!
//! The [`CapabilityDetector`] walks the tiers from richest to poorest and
//! commits to the first one whose device comes up. The software tier at the
//! bottom has no requirements, so probing always produces a record.
//!
//! ```ignore
//! let mut detector = CapabilityDetector::new(ProbeOptions::default());
//! let caps = detector.probe();
//! println!("{} tier on {} ({})", caps.tier, caps.renderer, caps.score);
//! if detector.is_feature_supported("instancing") { /* ... */ }
//! ```

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ProbeError;
use crate::gpu::probe::WgpuProbe;
use crate::gpu::GpuDevice;
use crate::particle::ParticleLayout;

/// Backend capability level, ordered from richest to poorest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Modern API with compute shaders. Simulation runs in a compute pass.
    Compute,
    /// Modern API without compute. Simulation runs as a render-to-texture
    /// feedback pass over double-buffered state.
    Render,
    /// Legacy-class device. Simulation runs on the CPU, drawing is instanced.
    Legacy,
    /// No GPU at all. CPU simulation and a software rasterizer.
    Software,
}

impl Tier {
    /// All tiers in probe order.
    pub const ALL: [Tier; 4] = [Tier::Compute, Tier::Render, Tier::Legacy, Tier::Software];

    pub fn name(self) -> &'static str {
        match self {
            Tier::Compute => "compute",
            Tier::Render => "render",
            Tier::Legacy => "legacy",
            Tier::Software => "software",
        }
    }

    /// The next tier down, or `None` below software.
    pub fn next_lower(self) -> Option<Tier> {
        match self {
            Tier::Compute => Some(Tier::Render),
            Tier::Render => Some(Tier::Legacy),
            Tier::Legacy => Some(Tier::Software),
            Tier::Software => None,
        }
    }

    /// Score every device on this tier starts from.
    pub fn base_score(self) -> u32 {
        match self {
            Tier::Compute => 40,
            Tier::Render => 30,
            Tier::Legacy => 20,
            Tier::Software => 10,
        }
    }

    /// Binary layout of particle state on this tier.
    pub fn layout(self) -> ParticleLayout {
        match self {
            Tier::Compute => ParticleLayout::ALIGNED,
            _ => ParticleLayout::PACKED,
        }
    }

    /// Whether this tier needs a GPU device.
    pub fn uses_gpu(self) -> bool {
        self != Tier::Software
    }

    /// Whether the simulation step runs on the GPU.
    pub fn simulates_on_gpu(self) -> bool {
        matches!(self, Tier::Compute | Tier::Render)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "compute" | "a" => Ok(Tier::Compute),
            "render" | "b" => Ok(Tier::Render),
            "legacy" | "c" => Ok(Tier::Legacy),
            "software" | "d" => Ok(Tier::Software),
            other => Err(format!("unknown tier `{other}`")),
        }
    }
}

/// Numeric device limits extracted at probe time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeviceLimits {
    pub max_texture_dimension_2d: u32,
    pub max_texture_dimension_3d: u32,
    pub max_buffer_size: u64,
    pub max_storage_buffer_binding_size: u32,
    pub max_uniform_buffer_binding_size: u32,
    pub max_vertex_attributes: u32,
    pub max_color_attachments: u32,
    pub max_compute_workgroup_size_x: u32,
    pub max_compute_invocations_per_workgroup: u32,
    pub max_compute_workgroups_per_dimension: u32,
}

impl From<&wgpu::Limits> for DeviceLimits {
    fn from(limits: &wgpu::Limits) -> Self {
        Self {
            max_texture_dimension_2d: limits.max_texture_dimension_2d,
            max_texture_dimension_3d: limits.max_texture_dimension_3d,
            max_buffer_size: limits.max_buffer_size,
            max_storage_buffer_binding_size: limits.max_storage_buffer_binding_size,
            max_uniform_buffer_binding_size: limits.max_uniform_buffer_binding_size,
            max_vertex_attributes: limits.max_vertex_attributes,
            max_color_attachments: limits.max_color_attachments,
            max_compute_workgroup_size_x: limits.max_compute_workgroup_size_x,
            max_compute_invocations_per_workgroup: limits.max_compute_invocations_per_workgroup,
            max_compute_workgroups_per_dimension: limits.max_compute_workgroups_per_dimension,
        }
    }
}

/// Optional features. Everything defaults to unsupported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FeatureSet {
    pub compute_shaders: bool,
    pub instancing: bool,
    pub vertex_arrays: bool,
    pub multiple_render_targets: bool,
    pub float_textures: bool,
    pub half_float_textures: bool,
    pub anisotropic_filtering: bool,
    pub timer_queries: bool,
    pub multi_draw_indirect: bool,
    pub offscreen_surface: bool,
}

/// Capability record for the committed tier. Immutable once probed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierCapabilities {
    pub tier: Tier,
    /// Graphics API the device runs on (`vulkan`, `metal`, `gl`, `software`, ...).
    pub backend_api: String,
    pub vendor: String,
    pub renderer: String,
    pub driver: String,
    pub limits: DeviceLimits,
    pub features: FeatureSet,
    /// Derived performance score in `[0, 100]`.
    pub score: u32,
}

impl TierCapabilities {
    /// Record for the software rasterizer.
    pub fn software() -> Self {
        let mut caps = Self {
            tier: Tier::Software,
            backend_api: "software".into(),
            vendor: "cpu".into(),
            renderer: "software rasterizer".into(),
            driver: concat!("tpe ", env!("CARGO_PKG_VERSION")).into(),
            limits: DeviceLimits {
                max_texture_dimension_2d: 32767,
                ..DeviceLimits::default()
            },
            features: FeatureSet {
                offscreen_surface: true,
                ..FeatureSet::default()
            },
            score: 0,
        };
        caps.score = performance_score(&caps);
        caps
    }

    /// Answer a single-feature query by name.
    ///
    /// Features that are native on the richer tiers and optional on the
    /// poorer ones answer the same way regardless of where they come from.
    pub fn is_feature_supported(&self, name: &str) -> bool {
        let f = &self.features;
        match name {
            "compute" => self.tier == Tier::Compute,
            "instancing" => matches!(self.tier, Tier::Compute | Tier::Render) || f.instancing,
            "mrt" => {
                matches!(self.tier, Tier::Compute | Tier::Render) || f.multiple_render_targets
            }
            "float-textures" => self.tier == Tier::Compute || f.float_textures,
            "anisotropic-filtering" => self.tier == Tier::Compute || f.anisotropic_filtering,
            "timer-queries" => f.timer_queries,
            "multi-draw" => f.multi_draw_indirect,
            "offscreen-surface" => f.offscreen_surface,
            _ => false,
        }
    }
}

/// Map a PCI vendor id to a readable name.
pub fn vendor_name(id: u32) -> String {
    match id {
        0x10DE => "NVIDIA".into(),
        0x1002 | 0x1022 => "AMD".into(),
        0x8086 => "Intel".into(),
        0x106B => "Apple".into(),
        0x5143 => "Qualcomm".into(),
        0x13B5 => "ARM".into(),
        0x1010 => "Imagination".into(),
        0x1414 => "Microsoft".into(),
        0x10005 => "Mesa".into(),
        other => format!("0x{other:04x}"),
    }
}

const GIB: u64 = 1 << 30;

/// Base score for the tier plus bonuses for high-value features, capped at 100.
pub fn performance_score(caps: &TierCapabilities) -> u32 {
    let f = &caps.features;
    let l = &caps.limits;
    let bonus = |on: bool, points: u32| if on { points } else { 0 };

    let extra = match caps.tier {
        Tier::Compute => {
            bonus(f.compute_shaders, 10)
                + bonus(f.timer_queries, 5)
                + bonus(f.multi_draw_indirect, 5)
                + bonus(l.max_buffer_size > GIB, 10)
                + bonus(l.max_compute_workgroups_per_dimension > 65535, 5)
        }
        Tier::Render => {
            bonus(f.float_textures, 10)
                + bonus(f.multiple_render_targets, 10)
                + bonus(f.anisotropic_filtering, 5)
                + bonus(f.timer_queries, 5)
                + bonus(l.max_texture_dimension_2d >= 16384, 10)
        }
        Tier::Legacy => {
            bonus(f.vertex_arrays, 10) + bonus(f.instancing, 10) + bonus(f.float_textures, 10)
        }
        Tier::Software => 0,
    };

    (caps.tier.base_score() + extra).min(100)
}

/// Named quality preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityPreset {
    Ultra,
    High,
    Medium,
    Low,
}

/// Settings derived from the performance score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecommendedSettings {
    pub quality: QualityPreset,
    /// Ceiling for the particle count.
    pub particle_count: usize,
    pub texture_resolution: u32,
    /// Zero disables shadows.
    pub shadow_map_size: u32,
    pub post_processing: bool,
    pub bloom: bool,
    pub antialiasing: bool,
}

impl RecommendedSettings {
    /// Threshold ladder over the score.
    pub fn for_score(score: u32) -> Self {
        if score >= 80 {
            Self {
                quality: QualityPreset::Ultra,
                particle_count: 1_000_000,
                texture_resolution: 2048,
                shadow_map_size: 2048,
                post_processing: true,
                bloom: true,
                antialiasing: true,
            }
        } else if score >= 60 {
            Self {
                quality: QualityPreset::High,
                particle_count: 100_000,
                texture_resolution: 1024,
                shadow_map_size: 1024,
                post_processing: true,
                bloom: true,
                antialiasing: true,
            }
        } else if score >= 40 {
            Self {
                quality: QualityPreset::Medium,
                particle_count: 10_000,
                texture_resolution: 512,
                shadow_map_size: 512,
                post_processing: false,
                bloom: false,
                antialiasing: true,
            }
        } else {
            Self {
                quality: QualityPreset::Low,
                particle_count: 1_000,
                texture_resolution: 256,
                shadow_map_size: 0,
                post_processing: false,
                bloom: false,
                antialiasing: false,
            }
        }
    }
}

/// A tier that came up during probing.
pub struct ProbedTier {
    pub capabilities: TierCapabilities,
    /// Device handle for GPU tiers. Scripted probes may leave this empty.
    pub device: Option<Arc<GpuDevice>>,
}

/// One attempt per tier. Implementations must not panic on failure.
pub trait TierProbe {
    fn try_tier(&mut self, tier: Tier) -> Result<ProbedTier, ProbeError>;
}

/// Power hint passed to adapter selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PowerPreference {
    #[default]
    HighPerformance,
    LowPower,
}

impl From<PowerPreference> for wgpu::PowerPreference {
    fn from(pref: PowerPreference) -> Self {
        match pref {
            PowerPreference::HighPerformance => wgpu::PowerPreference::HighPerformance,
            PowerPreference::LowPower => wgpu::PowerPreference::LowPower,
        }
    }
}

/// Knobs for the probe cascade.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeOptions {
    pub power_preference: PowerPreference,
    /// Start the cascade at this tier instead of the top.
    pub start_tier: Option<Tier>,
    /// Tiers to skip.
    pub disabled_tiers: Vec<Tier>,
}

impl ProbeOptions {
    fn allows(&self, tier: Tier) -> bool {
        self.start_tier.map_or(true, |start| tier >= start) && !self.disabled_tiers.contains(&tier)
    }
}

struct Committed {
    capabilities: TierCapabilities,
    device: Option<Arc<GpuDevice>>,
}

/// Probes tiers in order and caches the first one that works.
pub struct CapabilityDetector<P = WgpuProbe> {
    probe: P,
    options: ProbeOptions,
    committed: Option<Committed>,
}

impl CapabilityDetector<WgpuProbe> {
    /// Detector backed by real wgpu adapters.
    pub fn new(options: ProbeOptions) -> Self {
        let probe = WgpuProbe::new(options.power_preference);
        Self::with_probe(probe, options)
    }
}

impl<P: TierProbe> CapabilityDetector<P> {
    pub fn with_probe(probe: P, options: ProbeOptions) -> Self {
        Self {
            probe,
            options,
            committed: None,
        }
    }

    /// Run the cascade once and return the committed record.
    ///
    /// Later calls return the cached record without probing again.
    pub fn probe(&mut self) -> &TierCapabilities {
        let committed = match self.committed.take() {
            Some(committed) => committed,
            None => self.cascade(),
        };
        &self.committed.insert(committed).capabilities
    }

    fn cascade(&mut self) -> Committed {
        for tier in [Tier::Compute, Tier::Render, Tier::Legacy] {
            if !self.options.allows(tier) {
                debug!(target: "tpe::probe", %tier, "tier skipped by configuration");
                continue;
            }
            match self.probe.try_tier(tier) {
                Ok(probed) => {
                    let mut capabilities = probed.capabilities;
                    capabilities.tier = tier;
                    capabilities.score = performance_score(&capabilities);
                    info!(
                        target: "tpe::probe",
                        %tier,
                        renderer = %capabilities.renderer,
                        backend = %capabilities.backend_api,
                        score = capabilities.score,
                        "committed tier"
                    );
                    return Committed {
                        capabilities,
                        device: probed.device,
                    };
                }
                Err(err) => debug!(target: "tpe::probe", %tier, %err, "tier unavailable"),
            }
        }

        info!(target: "tpe::probe", "no GPU tier available, using software rasterizer");
        Committed {
            capabilities: TierCapabilities::software(),
            device: None,
        }
    }

    /// The committed record, if `probe` has run.
    pub fn capabilities(&self) -> Option<&TierCapabilities> {
        self.committed.as_ref().map(|c| &c.capabilities)
    }

    /// Committed tier, if `probe` has run.
    pub fn backend(&self) -> Option<Tier> {
        self.capabilities().map(|c| c.tier)
    }

    /// Device opened while probing. `None` for the software tier.
    pub fn device(&self) -> Option<&Arc<GpuDevice>> {
        self.committed.as_ref().and_then(|c| c.device.as_ref())
    }

    /// Score of the committed tier, `0` before probing.
    pub fn performance_score(&self) -> u32 {
        self.capabilities().map_or(0, |c| c.score)
    }

    pub fn recommended_settings(&self) -> RecommendedSettings {
        RecommendedSettings::for_score(self.performance_score())
    }

    /// `false` for unknown names and before probing.
    pub fn is_feature_supported(&self, name: &str) -> bool {
        self.capabilities()
            .is_some_and(|c| c.is_feature_supported(name))
    }

    pub fn options(&self) -> &ProbeOptions {
        &self.options
    }

    /// Drop the device handle held since probing. The record stays cached.
    pub fn release_device(&mut self) {
        if let Some(committed) = self.committed.as_mut() {
            committed.device = None;
        }
    }
}
