//! WGSL sources by logical name.
//!
//! | name                        | built from                         |
//! |-----------------------------|------------------------------------|
//! | `compute/particle-update`   | `common.wgsl` + `compute.wgsl`     |
//! | `feedback/particle-update`  | `common.wgsl` + `feedback.wgsl`    |
//! | `render/particle`           | `sprite.wgsl` + `render.wgsl`      |
//! | `feedback/particle-render`  | `sprite.wgsl` + `render_feedback.wgsl` |
//! | `present/blit`              | `blit.wgsl`                        |
//!
//! A [`ShaderLibrary`] asks its provider first and falls back to the
//! embedded copy, so a host can override any single module.

use std::path::PathBuf;

use tracing::debug;

use crate::error::SetupError;

pub const COMPUTE_UPDATE: &str = "compute/particle-update";
pub const FEEDBACK_UPDATE: &str = "feedback/particle-update";
pub const RENDER_PARTICLE: &str = "render/particle";
pub const FEEDBACK_RENDER: &str = "feedback/particle-render";
pub const PRESENT_BLIT: &str = "present/blit";

/// Every name the engine asks for.
pub const ALL: [&str; 5] = [
    COMPUTE_UPDATE,
    FEEDBACK_UPDATE,
    RENDER_PARTICLE,
    FEEDBACK_RENDER,
    PRESENT_BLIT,
];

const COMMON_WGSL: &str = include_str!("shaders/common.wgsl");
const COMPUTE_WGSL: &str = include_str!("shaders/compute.wgsl");
const FEEDBACK_WGSL: &str = include_str!("shaders/feedback.wgsl");
const SPRITE_WGSL: &str = include_str!("shaders/sprite.wgsl");
const RENDER_WGSL: &str = include_str!("shaders/render.wgsl");
const RENDER_FEEDBACK_WGSL: &str = include_str!("shaders/render_feedback.wgsl");
const BLIT_WGSL: &str = include_str!("shaders/blit.wgsl");

/// Resolves shader text by logical name.
pub trait ShaderSource {
    fn resolve(&self, name: &str) -> Option<String>;
}

impl<F> ShaderSource for F
where
    F: Fn(&str) -> Option<String>,
{
    fn resolve(&self, name: &str) -> Option<String> {
        self(name)
    }
}

/// The sources compiled into the crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmbeddedShaders;

impl ShaderSource for EmbeddedShaders {
    fn resolve(&self, name: &str) -> Option<String> {
        let parts: &[&str] = match name {
            COMPUTE_UPDATE => &[COMMON_WGSL, COMPUTE_WGSL],
            FEEDBACK_UPDATE => &[COMMON_WGSL, FEEDBACK_WGSL],
            RENDER_PARTICLE => &[SPRITE_WGSL, RENDER_WGSL],
            FEEDBACK_RENDER => &[SPRITE_WGSL, RENDER_FEEDBACK_WGSL],
            PRESENT_BLIT => &[BLIT_WGSL],
            _ => return None,
        };
        Some(parts.join("\n"))
    }
}

/// Reads `<root>/<name>.wgsl`, so `render/particle` maps to
/// `<root>/render/particle.wgsl`.
#[derive(Debug, Clone)]
pub struct DirectoryShaders {
    root: PathBuf,
}

impl DirectoryShaders {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ShaderSource for DirectoryShaders {
    fn resolve(&self, name: &str) -> Option<String> {
        let path = self.root.join(format!("{name}.wgsl"));
        std::fs::read_to_string(path).ok()
    }
}

/// Provider lookup with an embedded fallback.
#[derive(Default)]
pub struct ShaderLibrary {
    provider: Option<Box<dyn ShaderSource>>,
}

impl ShaderLibrary {
    /// Embedded sources only.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(provider: impl ShaderSource + 'static) -> Self {
        Self {
            provider: Some(Box::new(provider)),
        }
    }

    pub fn get(&self, name: &str) -> Result<String, SetupError> {
        if let Some(provider) = &self.provider {
            if let Some(source) = provider.resolve(name) {
                return Ok(source);
            }
            debug!(target: "tpe::render", shader = name, "provider has no override, using embedded source");
        }
        EmbeddedShaders
            .resolve(name)
            .ok_or_else(|| SetupError::MissingShader(name.to_string()))
    }
}
