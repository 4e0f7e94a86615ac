//! Simulation and engine configuration.
//!
//! Everything can be loaded from TOML. Every section and field is optional:
//!
//! ```toml
//! [engine]
//! max_particles = 200000
//! disabled_tiers = ["render"]
//!
//! [simulation]
//! gravity = 4.0
//! wind = [1.0, 0.0, 0.0]
//! blend_mode = "alpha"
//!
//! [simulation.turbulence]
//! strength = 2.0
//!
//! [[spawners]]
//! position = [0.0, 10.0, 0.0]
//! rate = 500.0
//! ```

use std::path::{Path, PathBuf};

use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::capability::{PowerPreference, ProbeOptions, Tier};
use crate::context::ContextOptions;
use crate::error::ConfigError;

/// How particle fragments combine with the framebuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlendMode {
    /// Colors add up. Overlapping particles glow.
    #[default]
    Additive,
    /// Standard alpha blending.
    Alpha,
}

impl BlendMode {
    pub fn name(self) -> &'static str {
        match self {
            BlendMode::Additive => "additive",
            BlendMode::Alpha => "alpha",
        }
    }
}

/// Point attractor. Zero strength disables it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Attractor {
    pub position: Vec3,
    pub strength: f32,
}

impl Default for Attractor {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            strength: 0.0,
        }
    }
}

/// Curl-noise turbulence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Turbulence {
    /// World to noise space scale.
    pub scale: f32,
    /// Acceleration per unit of curl. Zero disables turbulence.
    pub strength: f32,
    /// Extra multiplier on top of `strength`.
    pub intensity: f32,
    /// Vertical scroll of the noise field per second.
    pub drift: f32,
}

impl Default for Turbulence {
    fn default() -> Self {
        Self {
            scale: 0.1,
            strength: 0.0,
            intensity: 1.0,
            drift: 0.1,
        }
    }
}

/// Parameters of the simulation step and the draw.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Downward acceleration.
    pub gravity: f32,
    pub wind: Vec3,
    pub attractor: Attractor,
    /// Velocity damping per second.
    pub damping: f32,
    pub turbulence: Turbulence,
    /// Half-extents of the world box centred on the origin.
    pub bounds: Vec3,
    /// Jitter around the spawn point.
    pub spawn_radius: f32,
    /// Respawn velocity scale.
    pub spawn_speed: f32,
    pub blend_mode: BlendMode,
    /// Screen-space size multiplier, in pixels per unit of particle size.
    pub particle_scale: f32,
    /// Secondary glow fill on the software rasterizer.
    pub software_glow: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            gravity: 9.81,
            wind: Vec3::ZERO,
            attractor: Attractor::default(),
            damping: 0.1,
            turbulence: Turbulence::default(),
            bounds: Vec3::splat(100.0),
            spawn_radius: 1.0,
            spawn_speed: 1.0,
            blend_mode: BlendMode::Additive,
            particle_scale: 4.0,
            software_glow: true,
        }
    }
}

/// Partial update for [`SimulationConfig`]. `None` leaves a field untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigPatch {
    pub gravity: Option<f32>,
    pub wind: Option<Vec3>,
    pub attractor_position: Option<Vec3>,
    pub attractor_strength: Option<f32>,
    pub damping: Option<f32>,
    pub noise_scale: Option<f32>,
    pub noise_strength: Option<f32>,
    pub turbulence: Option<f32>,
    pub noise_drift: Option<f32>,
    pub bounds: Option<Vec3>,
    pub spawn_radius: Option<f32>,
    pub spawn_speed: Option<f32>,
    pub blend_mode: Option<BlendMode>,
    pub particle_scale: Option<f32>,
    pub software_glow: Option<bool>,
}

impl ConfigPatch {
    pub fn gravity(mut self, gravity: f32) -> Self {
        self.gravity = Some(gravity);
        self
    }

    pub fn wind(mut self, wind: Vec3) -> Self {
        self.wind = Some(wind);
        self
    }

    pub fn attractor(mut self, position: Vec3, strength: f32) -> Self {
        self.attractor_position = Some(position);
        self.attractor_strength = Some(strength);
        self
    }

    pub fn damping(mut self, damping: f32) -> Self {
        self.damping = Some(damping);
        self
    }

    pub fn noise_strength(mut self, strength: f32) -> Self {
        self.noise_strength = Some(strength);
        self
    }

    pub fn bounds(mut self, bounds: Vec3) -> Self {
        self.bounds = Some(bounds);
        self
    }

    pub fn blend_mode(mut self, mode: BlendMode) -> Self {
        self.blend_mode = Some(mode);
        self
    }

    /// Fold a later patch on top of this one.
    pub fn merge(&mut self, later: &ConfigPatch) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if later.$field.is_some() { self.$field = later.$field; })*
            };
        }
        take!(
            gravity, wind, attractor_position, attractor_strength, damping, noise_scale,
            noise_strength, turbulence, noise_drift, bounds, spawn_radius, spawn_speed,
            blend_mode, particle_scale, software_glow
        );
    }

    /// Write the set fields into `config`.
    pub fn apply(&self, config: &mut SimulationConfig) {
        if let Some(v) = self.gravity {
            config.gravity = v;
        }
        if let Some(v) = self.wind {
            config.wind = v;
        }
        if let Some(v) = self.attractor_position {
            config.attractor.position = v;
        }
        if let Some(v) = self.attractor_strength {
            config.attractor.strength = v;
        }
        if let Some(v) = self.damping {
            config.damping = v;
        }
        if let Some(v) = self.noise_scale {
            config.turbulence.scale = v;
        }
        if let Some(v) = self.noise_strength {
            config.turbulence.strength = v;
        }
        if let Some(v) = self.turbulence {
            config.turbulence.intensity = v;
        }
        if let Some(v) = self.noise_drift {
            config.turbulence.drift = v;
        }
        if let Some(v) = self.bounds {
            config.bounds = v.abs();
        }
        if let Some(v) = self.spawn_radius {
            config.spawn_radius = v;
        }
        if let Some(v) = self.spawn_speed {
            config.spawn_speed = v;
        }
        if let Some(v) = self.blend_mode {
            config.blend_mode = v;
        }
        if let Some(v) = self.particle_scale {
            config.particle_scale = v;
        }
        if let Some(v) = self.software_glow {
            config.software_glow = v;
        }
    }
}

/// Engine-level settings fixed at initialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Hard ceiling on the particle count. The capability preset may pick less.
    pub max_particles: usize,
    /// Start probing at this tier.
    pub force_tier: Option<Tier>,
    pub disabled_tiers: Vec<Tier>,
    pub power_preference: PowerPreference,
    pub context: ContextOptions,
    /// Directory searched for shader overrides before the built-in sources.
    pub shader_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_particles: 1_000_000,
            force_tier: None,
            disabled_tiers: Vec::new(),
            power_preference: PowerPreference::HighPerformance,
            context: ContextOptions::default(),
            shader_dir: None,
        }
    }
}

impl EngineConfig {
    pub fn probe_options(&self) -> ProbeOptions {
        ProbeOptions {
            power_preference: self.power_preference,
            start_tier: self.force_tier,
            disabled_tiers: self.disabled_tiers.clone(),
        }
    }
}

/// A spawner declared in a settings file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpawnerSpec {
    pub position: Vec3,
    #[serde(default = "default_rate")]
    pub rate: f32,
}

fn default_rate() -> f32 {
    100.0
}

/// Top-level settings file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub engine: EngineConfig,
    pub simulation: SimulationConfig,
    pub spawners: Vec<SpawnerSpec>,
}

impl Settings {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_disable_optional_forces() {
        let config = SimulationConfig::default();
        assert_eq!(config.gravity, 9.81);
        assert_eq!(config.wind, Vec3::ZERO);
        assert_eq!(config.attractor.strength, 0.0);
        assert_eq!(config.turbulence.strength, 0.0);
        assert_eq!(config.blend_mode, BlendMode::Additive);
    }

    #[test]
    fn patch_only_touches_set_fields() {
        let mut config = SimulationConfig::default();
        ConfigPatch::default()
            .gravity(0.0)
            .blend_mode(BlendMode::Alpha)
            .apply(&mut config);
        assert_eq!(config.gravity, 0.0);
        assert_eq!(config.blend_mode, BlendMode::Alpha);
        assert_eq!(config.damping, 0.1);
        assert_eq!(config.bounds, Vec3::splat(100.0));
    }

    #[test]
    fn later_patch_wins_on_merge() {
        let mut staged = ConfigPatch::default().gravity(1.0).damping(0.5);
        staged.merge(&ConfigPatch::default().gravity(2.0));
        assert_eq!(staged.gravity, Some(2.0));
        assert_eq!(staged.damping, Some(0.5));
    }

    #[test]
    fn bounds_patch_is_made_positive() {
        let mut config = SimulationConfig::default();
        ConfigPatch::default()
            .bounds(Vec3::new(-5.0, 6.0, -7.0))
            .apply(&mut config);
        assert_eq!(config.bounds, Vec3::new(5.0, 6.0, 7.0));
    }

    #[test]
    fn settings_parse_from_toml() {
        let settings = Settings::from_toml_str(
            r#"
            [engine]
            max_particles = 5000
            force_tier = "legacy"
            disabled_tiers = ["render"]
            power_preference = "low-power"

            [engine.context]
            antialias = true

            [simulation]
            gravity = 2.5
            wind = [1.0, 0.0, -1.0]
            blend_mode = "alpha"

            [simulation.turbulence]
            strength = 3.0

            [[spawners]]
            position = [0.0, 10.0, 0.0]
            "#,
        )
        .unwrap();

        assert_eq!(settings.engine.max_particles, 5000);
        assert_eq!(settings.engine.force_tier, Some(Tier::Legacy));
        assert_eq!(settings.engine.disabled_tiers, vec![Tier::Render]);
        assert_eq!(settings.engine.power_preference, PowerPreference::LowPower);
        assert_eq!(settings.engine.context.antialias, Some(true));
        assert_eq!(settings.simulation.gravity, 2.5);
        assert_eq!(settings.simulation.wind, Vec3::new(1.0, 0.0, -1.0));
        assert_eq!(settings.simulation.turbulence.strength, 3.0);
        assert_eq!(settings.simulation.turbulence.scale, 0.1);
        assert_eq!(settings.spawners.len(), 1);
        assert_eq!(settings.spawners[0].rate, 100.0);
    }

    #[test]
    fn empty_settings_are_defaults() {
        assert_eq!(Settings::from_toml_str("").unwrap(), Settings::default());
    }

    #[test]
    fn bad_toml_is_a_parse_error() {
        let err = Settings::from_toml_str("[simulation]\ngravity = \"heavy\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
