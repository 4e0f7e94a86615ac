//! The engine as a host sees it.
//!
//! [`GpuComponent`] owns the detector, the spawner registry, the staged
//! configuration and one [`Backend`]. The host drives it:
//!
//! ```ignore
//! let mut engine = GpuComponent::new(EngineConfig::default(), SimulationConfig::default());
//! let report = engine.init(SurfaceTarget::offscreen(1280, 720))?;
//! println!("running on the {} tier with {} particles", report.tier, report.particle_count);
//!
//! loop {
//!     engine.update(dt);
//!     engine.render(view_proj, view);
//! }
//! engine.destroy();
//! ```
//!
//! Configuration and spawner changes are staged and picked up by the next
//! `update`, never in the middle of a frame.

use std::path::Path;
use std::time::Instant;

use glam::{Mat4, Vec3};
use tracing::{debug, error, info, trace, warn};

use crate::backend::{Backend, FrameInput, SoftwareBackend};
use crate::capability::{
    CapabilityDetector, RecommendedSettings, Tier, TierCapabilities, TierProbe,
};
use crate::config::{ConfigPatch, EngineConfig, Settings, SimulationConfig};
use crate::context::{BackendContextFactory, Context, SurfaceTarget};
use crate::error::{CapacityError, ContextError, EngineError, Result, SetupError};
use crate::gpu::compute::ComputeBackend;
use crate::gpu::feedback::FeedbackBackend;
use crate::gpu::instanced::LegacyBackend;
use crate::gpu::probe::WgpuProbe;
use crate::particle::Particle;
use crate::raster::Framebuffer;
use crate::shaders::{DirectoryShaders, ShaderLibrary};
use crate::simulation::{seed_particles, SimParams};
use crate::spawner::{SpawnerId, SpawnerRegistry};
use crate::time::Time;

/// Where the component is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialized,
    /// `update` and `render` do work.
    Running,
    /// Initialized, but `update` and `render` are no-ops until `start`.
    Stopped,
    /// Resources released. Terminal.
    Destroyed,
}

/// Something the host may want to react to. Collected by
/// [`GpuComponent::drain_events`].
#[derive(Debug)]
pub enum EngineEvent {
    /// The tier's resources could not be built. The engine retried one tier lower.
    SetupFailed { tier: Tier, error: SetupError },
    /// The surface could not produce a context for the tier. The engine
    /// switched to the software tier.
    ContextUnavailable { tier: Tier, error: ContextError },
    /// A backend is up and seeded.
    Ready { tier: Tier, particle_count: usize },
}

/// Outcome of a successful `init`.
#[derive(Debug, Clone, PartialEq)]
pub struct InitReport {
    /// Tier the engine runs on.
    pub tier: Tier,
    /// Tier the detector committed to.
    pub probed_tier: Tier,
    pub particle_count: usize,
    /// Performance score of the running tier.
    pub score: u32,
}

impl InitReport {
    /// Whether setup ended below the probed tier.
    pub fn fell_back(&self) -> bool {
        self.tier != self.probed_tier
    }
}

/// Read-only telemetry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stats {
    pub backend_tier: Option<Tier>,
    pub particle_count: usize,
    pub spawner_count: usize,
    pub fps: f32,
    /// Instances drawn on GPU tiers, alive particles on the software tier.
    pub particles_rendered: usize,
}

pub struct GpuComponent<P: TierProbe = WgpuProbe> {
    detector: CapabilityDetector<P>,
    engine: EngineConfig,
    config: SimulationConfig,
    staged: Option<ConfigPatch>,
    spawners: SpawnerRegistry,
    synced_revision: Option<u64>,
    shaders: ShaderLibrary,
    backend: Option<Box<dyn Backend>>,
    capabilities: Option<TierCapabilities>,
    time: Time,
    lifecycle: Lifecycle,
    events: Vec<EngineEvent>,
    particles_rendered: usize,
}

impl GpuComponent<WgpuProbe> {
    /// Component probing real adapters.
    pub fn new(engine: EngineConfig, config: SimulationConfig) -> Self {
        let detector = CapabilityDetector::new(engine.probe_options());
        Self::with_detector(detector, engine, config)
    }

    /// Component configured from a settings file, spawners included.
    pub fn from_settings(settings: &Settings) -> Result<Self, CapacityError> {
        let mut component = Self::new(settings.engine.clone(), settings.simulation);
        for spec in &settings.spawners {
            component.add_spawner(spec.position, spec.rate)?;
        }
        Ok(component)
    }
}

impl<P: TierProbe> GpuComponent<P> {
    /// Component with a custom probe, for hosts that pick adapters themselves
    /// and for tests.
    pub fn with_probe(probe: P, engine: EngineConfig, config: SimulationConfig) -> Self {
        let detector = CapabilityDetector::with_probe(probe, engine.probe_options());
        Self::with_detector(detector, engine, config)
    }

    fn with_detector(detector: CapabilityDetector<P>, engine: EngineConfig, config: SimulationConfig) -> Self {
        let shaders = match &engine.shader_dir {
            Some(dir) => ShaderLibrary::with_provider(DirectoryShaders::new(dir)),
            None => ShaderLibrary::new(),
        };
        Self {
            detector,
            engine,
            config,
            staged: None,
            spawners: SpawnerRegistry::new(),
            synced_revision: None,
            shaders,
            backend: None,
            capabilities: None,
            time: Time::new(),
            lifecycle: Lifecycle::Uninitialized,
            events: Vec::new(),
            particles_rendered: 0,
        }
    }

    /// Replace the shader source used by later `init` calls.
    pub fn set_shader_library(&mut self, shaders: ShaderLibrary) {
        self.shaders = shaders;
    }

    /// Probe, build the richest backend that comes up and seed it.
    ///
    /// A context failure switches straight to the software tier. A setup
    /// failure is recorded as [`EngineEvent::SetupFailed`] and retried one
    /// tier lower. The software tier cannot fail, so this only errors on a
    /// destroyed component.
    pub fn init(&mut self, surface: SurfaceTarget) -> Result<InitReport> {
        self.ensure_alive()?;
        self.release_backend();

        let probed = self.detector.probe().clone();
        let mut capacity = self.particle_budget(probed.score);
        let factory = BackendContextFactory::new(self.detector.device().cloned());

        let mut tier = probed.tier;
        let backend = loop {
            let context = match factory.create_context(&surface, tier, &self.engine.context) {
                Ok(context) => context,
                Err(err) => {
                    warn!(target: "tpe::engine", %tier, %err, "no context for tier, using software rasterizer");
                    self.events.push(EngineEvent::ContextUnavailable { tier, error: err });
                    tier = Tier::Software;
                    continue;
                }
            };
            if tier == Tier::Software && probed.tier != Tier::Software {
                capacity = capacity.min(self.particle_budget(TierCapabilities::software().score));
            }
            match build_backend(context, &self.shaders, capacity) {
                Ok(backend) => break backend,
                Err(err) => {
                    error!(target: "tpe::engine", %tier, %err, "backend setup failed, retrying one tier lower");
                    self.events.push(EngineEvent::SetupFailed { tier, error: err });
                    tier = tier.next_lower().unwrap_or(Tier::Software);
                }
            }
        };

        let capabilities = if tier == probed.tier {
            probed.clone()
        } else if tier == Tier::Software {
            TierCapabilities::software()
        } else {
            let mut lowered = probed.clone();
            lowered.tier = tier;
            lowered.score = crate::capability::performance_score(&lowered);
            lowered
        };
        self.commit(backend, capabilities.clone())?;

        Ok(InitReport {
            tier,
            probed_tier: probed.tier,
            particle_count: capacity,
            score: capabilities.score,
        })
    }

    /// Build exactly `tier` on `surface`, with no fallback.
    ///
    /// Uses the device committed by the detector, so a GPU tier needs a
    /// probe that opened one.
    pub fn init_at(&mut self, surface: SurfaceTarget, tier: Tier) -> Result<InitReport> {
        self.ensure_alive()?;
        self.release_backend();

        let probed = self.detector.probe().clone();
        let mut capabilities = if tier == Tier::Software {
            TierCapabilities::software()
        } else {
            probed.clone()
        };
        capabilities.tier = tier;
        capabilities.score = crate::capability::performance_score(&capabilities);
        let capacity = self.particle_budget(capabilities.score);

        let factory = BackendContextFactory::new(self.detector.device().cloned());
        let context = factory
            .create_context(&surface, tier, &self.engine.context)
            .map_err(SetupError::from)?;
        let backend = build_backend(context, &self.shaders, capacity)?;
        self.commit(backend, capabilities.clone())?;

        Ok(InitReport {
            tier,
            probed_tier: probed.tier,
            particle_count: capacity,
            score: capabilities.score,
        })
    }

    fn commit(&mut self, mut backend: Box<dyn Backend>, capabilities: TierCapabilities) -> Result<()> {
        let tier = backend.tier();
        let capacity = backend.capacity();
        backend.upload(&seed_particles(capacity, &self.config))?;

        info!(target: "tpe::engine", %tier, particles = capacity, score = capabilities.score, "engine initialized");
        self.events.push(EngineEvent::Ready {
            tier,
            particle_count: capacity,
        });
        self.backend = Some(backend);
        self.capabilities = Some(capabilities);
        self.synced_revision = None;
        self.particles_rendered = 0;
        self.time = Time::new();
        self.lifecycle = Lifecycle::Running;
        Ok(())
    }

    /// `min(max_particles, preset ceiling)`, at least one.
    fn particle_budget(&self, score: u32) -> usize {
        let ceiling = RecommendedSettings::for_score(score).particle_count;
        self.engine.max_particles.min(ceiling).max(1)
    }

    fn ensure_alive(&self) -> Result<()> {
        match self.lifecycle {
            Lifecycle::Destroyed => Err(EngineError::Destroyed),
            _ => Ok(()),
        }
    }

    fn backend(&self) -> Result<&dyn Backend> {
        match (&self.backend, self.lifecycle) {
            (_, Lifecycle::Destroyed) => Err(EngineError::Destroyed),
            (Some(backend), _) => Ok(backend.as_ref()),
            (None, _) => Err(EngineError::NotInitialized),
        }
    }

    fn backend_mut(&mut self) -> Result<&mut Box<dyn Backend>> {
        match (&mut self.backend, self.lifecycle) {
            (_, Lifecycle::Destroyed) => Err(EngineError::Destroyed),
            (Some(backend), _) => Ok(backend),
            (None, _) => Err(EngineError::NotInitialized),
        }
    }

    /// Advance the simulation by `dt` seconds, clamped to 0.1.
    ///
    /// Staged configuration and spawner changes apply first. No-op unless
    /// running.
    pub fn update(&mut self, dt: f32) {
        if self.lifecycle != Lifecycle::Running {
            return;
        }
        let Some(backend) = self.backend.as_mut() else {
            return;
        };

        let dt = self.time.advance(dt);
        if let Some(patch) = self.staged.take() {
            patch.apply(&mut self.config);
            debug!(target: "tpe::sim", ?patch, "configuration applied");
        }
        let revision = self.spawners.revision();
        if self.synced_revision != Some(revision) {
            backend.sync_spawners(self.spawners.packed());
            self.synced_revision = Some(revision);
            debug!(target: "tpe::sim", spawners = self.spawners.len(), revision, "spawner table synced");
        }

        let params = SimParams::new(
            &self.config,
            dt,
            self.time.elapsed(),
            backend.capacity() as u32,
            self.spawners.len() as u32,
        );
        trace!(target: "tpe::sim", dt, time = params.time, "step");
        backend.update(&params);
    }

    /// Draw the current state and present it. Frame errors are logged and
    /// the frame is dropped. No-op unless running.
    pub fn render(&mut self, view_proj: Mat4, view: Mat4) {
        if self.lifecycle != Lifecycle::Running {
            return;
        }
        let Some(backend) = self.backend.as_mut() else {
            return;
        };
        let frame = FrameInput {
            view_proj,
            view,
            time: self.time.elapsed(),
            config: &self.config,
        };
        match backend.render(&frame) {
            Ok(rendered) => self.particles_rendered = rendered,
            Err(err) => warn!(target: "tpe::engine", %err, "frame skipped"),
        }
        self.time.record_frame(Instant::now());
    }

    /// Stage a configuration change for the next `update`.
    pub fn set_config(&mut self, patch: ConfigPatch) {
        match self.staged.as_mut() {
            Some(staged) => staged.merge(&patch),
            None => self.staged = Some(patch),
        }
    }

    /// Configuration in effect for the current step.
    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Register a spawner. Respawns start using it at the next `update`.
    pub fn add_spawner(&mut self, position: Vec3, rate: f32) -> Result<SpawnerId, CapacityError> {
        self.spawners.add(position, rate)
    }

    /// Returns `false` for an unknown id.
    pub fn remove_spawner(&mut self, id: SpawnerId) -> bool {
        self.spawners.remove(id)
    }

    pub fn spawners(&self) -> &SpawnerRegistry {
        &self.spawners
    }

    pub fn stats(&self) -> Stats {
        let backend = self.backend.as_ref();
        Stats {
            backend_tier: backend.map(|b| b.tier()),
            particle_count: backend.map_or(0, |b| b.capacity()),
            spawner_count: self.spawners.len(),
            fps: self.time.fps(),
            particles_rendered: self.particles_rendered,
        }
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        if self.lifecycle == Lifecycle::Destroyed {
            return;
        }
        if let Some(backend) = self.backend.as_mut() {
            debug!(target: "tpe::engine", width, height, "resize");
            backend.resize(width, height);
        }
    }

    /// Resume the frame loop after `stop`.
    pub fn start(&mut self) {
        if self.lifecycle == Lifecycle::Stopped && self.backend.is_some() {
            self.lifecycle = Lifecycle::Running;
            self.time.resume();
        }
    }

    pub fn stop(&mut self) {
        if self.lifecycle == Lifecycle::Running {
            self.lifecycle = Lifecycle::Stopped;
            self.time.pause();
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// Tier of the running backend.
    pub fn tier(&self) -> Option<Tier> {
        self.backend.as_ref().map(|b| b.tier())
    }

    pub fn upload_particles(&mut self, particles: &[Particle]) -> Result<()> {
        self.backend_mut()?.upload(particles)?;
        Ok(())
    }

    /// Blocking read of every particle slot.
    pub fn read_particles(&self) -> Result<Vec<Particle>> {
        self.backend()?.read_particles()
    }

    /// Blocking copy of the last rendered frame.
    pub fn snapshot(&self) -> Result<Framebuffer> {
        self.backend()?.snapshot()
    }

    pub fn save_snapshot(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.snapshot()?.save_png(path)?;
        info!(target: "tpe::engine", path = %path.display(), "snapshot saved");
        Ok(())
    }

    /// Record of the running tier. After a fallback this describes the tier
    /// actually in use, not the one probed.
    pub fn capabilities(&self) -> Option<&TierCapabilities> {
        self.capabilities.as_ref()
    }

    pub fn recommended_settings(&self) -> RecommendedSettings {
        RecommendedSettings::for_score(self.capabilities.as_ref().map_or(0, |c| c.score))
    }

    pub fn is_feature_supported(&self, name: &str) -> bool {
        self.capabilities
            .as_ref()
            .is_some_and(|c| c.is_feature_supported(name))
    }

    pub fn detector(&self) -> &CapabilityDetector<P> {
        &self.detector
    }

    pub fn drain_events(&mut self) -> Vec<EngineEvent> {
        std::mem::take(&mut self.events)
    }

    /// Stop the loop, then release every device resource. Idempotent.
    pub fn destroy(&mut self) {
        if self.lifecycle == Lifecycle::Destroyed {
            return;
        }
        self.stop();
        self.release_backend();
        self.detector.release_device();
        self.lifecycle = Lifecycle::Destroyed;
        info!(target: "tpe::engine", "engine destroyed");
    }

    fn release_backend(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            backend.destroy();
            debug!(target: "tpe::engine", tier = %backend.tier(), "backend released");
        }
    }
}

impl<P: TierProbe> Drop for GpuComponent<P> {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn build_backend(
    context: Context,
    shaders: &ShaderLibrary,
    capacity: usize,
) -> Result<Box<dyn Backend>, SetupError> {
    Ok(match context {
        Context::Software(ctx) => Box::new(SoftwareBackend::new(&ctx, capacity)),
        Context::Gpu(ctx) => match ctx.tier {
            Tier::Compute => Box::new(ComputeBackend::new(ctx, shaders, capacity)?),
            Tier::Render => Box::new(FeedbackBackend::new(ctx, shaders, capacity)?),
            Tier::Legacy | Tier::Software => Box::new(LegacyBackend::new(ctx, shaders, capacity)?),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::tests::{gpu_caps, ScriptedProbe};
    use crate::capability::{DeviceLimits, FeatureSet};
    use crate::gpu::Camera;

    fn software_engine() -> GpuComponent<ScriptedProbe> {
        let engine = EngineConfig {
            max_particles: 500,
            ..Default::default()
        };
        GpuComponent::with_probe(ScriptedProbe::failing_all(), engine, SimulationConfig::default())
    }

    fn camera() -> (Mat4, Mat4) {
        Camera::default().matrices(64, 48)
    }

    #[test]
    fn init_on_software_seeds_the_budget() {
        let mut engine = software_engine();
        let report = engine.init(SurfaceTarget::offscreen(64, 48)).unwrap();
        assert_eq!(report.tier, Tier::Software);
        assert!(!report.fell_back());
        assert_eq!(report.particle_count, 500);
        assert_eq!(report.score, 10);
        assert_eq!(engine.lifecycle(), Lifecycle::Running);
        assert!(matches!(
            engine.drain_events().as_slice(),
            [EngineEvent::Ready { tier: Tier::Software, particle_count: 500 }]
        ));
    }

    #[test]
    fn budget_is_capped_by_the_preset() {
        let mut engine = GpuComponent::with_probe(
            ScriptedProbe::failing_all(),
            EngineConfig::default(),
            SimulationConfig::default(),
        );
        let report = engine.init(SurfaceTarget::offscreen(8, 8)).unwrap();
        assert_eq!(report.particle_count, 1_000);
    }

    #[test]
    fn gpu_tier_without_device_drops_to_software() {
        let legacy = gpu_caps(
            Tier::Legacy,
            FeatureSet {
                instancing: true,
                vertex_arrays: true,
                float_textures: true,
                ..Default::default()
            },
            DeviceLimits::default(),
        );
        let probe = ScriptedProbe::failing_all().with(Tier::Legacy, legacy);
        let mut engine = GpuComponent::with_probe(probe, EngineConfig::default(), SimulationConfig::default());

        let report = engine.init(SurfaceTarget::offscreen(32, 32)).unwrap();
        assert_eq!(report.probed_tier, Tier::Legacy);
        assert_eq!(report.tier, Tier::Software);
        assert!(report.fell_back());
        assert_eq!(engine.capabilities().map(|c| c.tier), Some(Tier::Software));

        let events = engine.drain_events();
        assert!(matches!(
            events.first(),
            Some(EngineEvent::ContextUnavailable { tier: Tier::Legacy, .. })
        ));
    }

    #[test]
    fn strict_init_surfaces_the_context_error() {
        let mut engine = software_engine();
        let err = engine
            .init_at(SurfaceTarget::offscreen(32, 32), Tier::Render)
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Setup(SetupError::Context(ContextError::NoDevice { tier: Tier::Render }))
        ));
        assert_eq!(engine.lifecycle(), Lifecycle::Uninitialized);
    }

    #[test]
    fn staged_config_waits_for_update() {
        let mut engine = software_engine();
        engine.init(SurfaceTarget::offscreen(16, 16)).unwrap();
        engine.set_config(ConfigPatch::default().gravity(0.0));
        engine.set_config(ConfigPatch::default().damping(0.5));
        assert_eq!(engine.config().gravity, 9.81);

        engine.update(0.016);
        assert_eq!(engine.config().gravity, 0.0);
        assert_eq!(engine.config().damping, 0.5);
    }

    #[test]
    fn stats_follow_the_frame() {
        let mut engine = software_engine();
        engine.add_spawner(Vec3::ZERO, 50.0).unwrap();
        engine.init(SurfaceTarget::offscreen(64, 48)).unwrap();
        engine.update(0.016);
        let (view_proj, view) = camera();
        engine.render(view_proj, view);

        let stats = engine.stats();
        assert_eq!(stats.backend_tier, Some(Tier::Software));
        assert_eq!(stats.particle_count, 500);
        assert_eq!(stats.spawner_count, 1);
        assert_eq!(stats.particles_rendered, 500);
    }

    #[test]
    fn stopped_engine_does_not_step() {
        let mut engine = software_engine();
        engine.init(SurfaceTarget::offscreen(16, 16)).unwrap();
        let before = engine.read_particles().unwrap();
        engine.stop();
        engine.update(0.05);
        assert_eq!(engine.read_particles().unwrap(), before);

        engine.start();
        engine.update(0.05);
        assert_ne!(engine.read_particles().unwrap(), before);
    }

    #[test]
    fn destroy_is_idempotent_and_final() {
        let mut engine = software_engine();
        engine.init(SurfaceTarget::offscreen(16, 16)).unwrap();
        engine.destroy();
        engine.destroy();
        assert_eq!(engine.lifecycle(), Lifecycle::Destroyed);
        engine.update(0.016);
        let (view_proj, view) = camera();
        engine.render(view_proj, view);
        assert!(matches!(engine.read_particles(), Err(EngineError::Destroyed)));
        assert!(matches!(
            engine.init(SurfaceTarget::offscreen(16, 16)),
            Err(EngineError::Destroyed)
        ));
    }

    #[test]
    fn calls_before_init_are_rejected() {
        let engine = software_engine();
        assert!(matches!(engine.snapshot(), Err(EngineError::NotInitialized)));
        assert_eq!(engine.stats().backend_tier, None);
        assert_eq!(engine.recommended_settings().particle_count, 1_000);
        assert!(!engine.is_feature_supported("offscreen-surface"));
    }

    #[test]
    fn oversized_upload_is_rejected() {
        let mut engine = software_engine();
        engine.init(SurfaceTarget::offscreen(16, 16)).unwrap();
        let too_many = vec![Particle::default(); 501];
        assert!(matches!(
            engine.upload_particles(&too_many),
            Err(EngineError::Capacity(CapacityError::TooManyParticles {
                requested: 501,
                capacity: 500
            }))
        ));
    }
}
