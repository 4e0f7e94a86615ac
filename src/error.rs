//! Error types for the engine.
//!
//! Errors are split by when they can happen:
//!
//! - [`ProbeError`] - a tier could not be brought up while probing. The
//!   detector swallows these and moves on to the next tier.
//! - [`ContextError`] - the committed tier could not produce a context for
//!   the requested surface. Fatal for that tier; the engine drops to the
//!   software path.
//! - [`SetupError`] - shader, pipeline or allocation failure after a tier was
//!   committed. Surfaced to the host as an [`EngineEvent`](crate::EngineEvent).
//! - [`CapacityError`] - a request exceeds a hard limit. Returned
//!   synchronously from the call that made it.
//! - [`FrameError`] - per-frame trouble. Logged and swallowed by the frame loop.

use std::path::PathBuf;

use thiserror::Error;

use crate::capability::Tier;

/// A single tier attempt failed during probing.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProbeError {
    #[error("no adapter available for the {tier} tier")]
    NoAdapter { tier: Tier },

    #[error("{tier} tier requires {requirement}")]
    MissingCapability {
        tier: Tier,
        requirement: &'static str,
    },

    #[error("device request for the {tier} tier was refused: {message}")]
    DeviceRequest { tier: Tier, message: String },
}

/// The surface could not produce a context for the committed tier.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("no device was committed for the {tier} tier")]
    NoDevice { tier: Tier },

    #[error("failed to create a presentation surface: {0}")]
    SurfaceCreation(#[from] wgpu::CreateSurfaceError),

    #[error("the {tier} tier adapter cannot present to this surface")]
    SurfaceUnsupported { tier: Tier },
}

/// A hard limit was exceeded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapacityError {
    #[error("upload of {requested} particles exceeds the buffer capacity of {capacity}")]
    TooManyParticles { requested: usize, capacity: usize },

    #[error("particle storage of {bytes} bytes exceeds the device limit of {limit} bytes")]
    BufferTooLarge { bytes: u64, limit: u64 },

    #[error("state texture needs {rows} rows but the device allows {limit}")]
    TextureTooLarge { rows: u32, limit: u32 },

    #[error("spawner limit of {limit} reached")]
    TooManySpawners { limit: usize },
}

/// The committed tier failed while building its resources.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("{tier} tier: shader `{name}` failed to compile: {message}")]
    ShaderCompilation {
        tier: Tier,
        name: String,
        message: String,
    },

    #[error("{tier} tier: pipeline `{name}` failed validation: {message}")]
    Pipeline {
        tier: Tier,
        name: String,
        message: String,
    },

    #[error("{tier} tier: allocation of `{name}` failed: {message}")]
    Allocation {
        tier: Tier,
        name: String,
        message: String,
    },

    #[error("no shader source for `{0}`")]
    MissingShader(String),

    #[error(transparent)]
    Capacity(#[from] CapacityError),

    #[error(transparent)]
    Context(#[from] ContextError),
}

impl SetupError {
    /// Tier the failure belongs to, when it is known.
    pub fn tier(&self) -> Option<Tier> {
        match self {
            SetupError::ShaderCompilation { tier, .. }
            | SetupError::Pipeline { tier, .. }
            | SetupError::Allocation { tier, .. } => Some(*tier),
            _ => None,
        }
    }
}

/// Per-frame failures. Never abort the frame loop.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("surface error: {0}")]
    Surface(#[from] wgpu::SurfaceError),

    #[error("device error: {0}")]
    Device(String),
}

/// Errors while loading [`Settings`](crate::Settings).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Umbrella error for the public engine API.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine is not initialized")]
    NotInitialized,

    #[error("engine has been destroyed")]
    Destroyed,

    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error(transparent)]
    Capacity(#[from] CapacityError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("readback failed: {0}")]
    Readback(String),

    #[error("failed to write image: {0}")]
    Image(#[from] image::ImageError),

    #[error("event loop error: {0}")]
    EventLoop(#[from] winit::error::EventLoopError),

    #[error("failed to open window: {0}")]
    Window(#[from] winit::error::OsError),
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
