//! # TPE - Tiered Particle Engine
//!
//! A GPU particle simulation that runs on whatever the machine offers. At
//! start-up the engine probes for the richest graphics tier available and
//! falls back one tier at a time, ending at a pure-CPU software rasterizer
//! that always works.
//!
//! | Tier | Simulation | Rendering |
//! |------|------------|-----------|
//! | [`Tier::Compute`] | compute shader over a storage buffer | instanced sprites |
//! | [`Tier::Render`] | fragment pass over ping-pong state textures | sprites reading the state texture |
//! | [`Tier::Legacy`] | CPU, re-uploaded every frame | instanced sprites |
//! | [`Tier::Software`] | CPU | [`SoftwareRasterizer`] into a [`Framebuffer`] |
//!
//! ## Quick Start
//!
//! ```ignore
//! use tpe::prelude::*;
//!
//! let mut engine = GpuComponent::new(EngineConfig::default(), SimulationConfig::default());
//! engine.add_spawner(Vec3::new(0.0, 20.0, 0.0), 200.0)?;
//! let report = engine.init(SurfaceTarget::offscreen(1280, 720))?;
//!
//! let camera = Camera::default();
//! let (view_proj, view) = camera.matrices(1280, 720);
//! for _ in 0..120 {
//!     engine.update(1.0 / 60.0);
//!     engine.render(view_proj, view);
//! }
//! engine.save_snapshot("frame.png")?;
//! ```
//!
//! ## Staging
//!
//! [`GpuComponent::set_config`], [`GpuComponent::add_spawner`] and
//! [`GpuComponent::remove_spawner`] take effect at the next
//! [`GpuComponent::update`]. A frame never sees half a configuration.
//!
//! ## Logging
//!
//! Everything logs through `tracing` under the `tpe::probe`, `tpe::context`,
//! `tpe::buffer`, `tpe::sim`, `tpe::render` and `tpe::engine` targets. The
//! library installs no subscriber.

pub mod backend;
pub mod buffer;
pub mod capability;
pub mod component;
pub mod config;
pub mod context;
pub mod error;
pub mod gpu;
pub mod noise;
pub mod particle;
pub mod raster;
pub mod shaders;
pub mod simulation;
pub mod spawner;
pub mod time;
pub mod window;

pub use backend::{Backend, FrameInput, SoftwareBackend};
pub use capability::{
    CapabilityDetector, DeviceLimits, FeatureSet, PowerPreference, ProbeOptions, ProbedTier,
    QualityPreset, RecommendedSettings, Tier, TierCapabilities, TierProbe,
};
pub use component::{EngineEvent, GpuComponent, InitReport, Lifecycle, Stats};
pub use config::{
    Attractor, BlendMode, ConfigPatch, EngineConfig, Settings, SimulationConfig, SpawnerSpec,
    Turbulence,
};
pub use context::{ContextOptions, SurfaceTarget};
pub use error::{
    CapacityError, ConfigError, ContextError, EngineError, FrameError, ProbeError, SetupError,
};
pub use glam::{Mat4, Vec3, Vec4};
pub use gpu::Camera;
pub use particle::{Particle, ParticleLayout};
pub use raster::{Framebuffer, SoftwareRasterizer};
pub use spawner::{SpawnerId, SpawnerRegistry};
pub use window::run_windowed;

/// Convenient re-exports for common usage.
///
/// ```ignore
/// use tpe::prelude::*;
/// ```
pub mod prelude {
    pub use crate::capability::{Tier, TierCapabilities};
    pub use crate::component::{EngineEvent, GpuComponent, InitReport, Stats};
    pub use crate::config::{BlendMode, ConfigPatch, EngineConfig, Settings, SimulationConfig};
    pub use crate::context::SurfaceTarget;
    pub use crate::error::{EngineError, Result};
    pub use crate::gpu::Camera;
    pub use crate::particle::Particle;
    pub use crate::spawner::SpawnerId;
    pub use crate::{Mat4, Vec3, Vec4};
}
