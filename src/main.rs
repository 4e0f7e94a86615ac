//! tpe demo: run the engine in a window, or headless for a fixed number of
//! frames and write the last one to a PNG.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tpe::error::Result;
use tpe::{Camera, EngineEvent, GpuComponent, Settings, SurfaceTarget, Tier, Vec3};

#[derive(Parser)]
#[command(name = "tpe")]
#[command(about = "Tiered GPU particle engine demo", long_about = None)]
#[command(version)]
struct Cli {
    /// TOML settings file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run exactly this tier (compute, render, legacy, software) with no fallback
    #[arg(long)]
    tier: Option<Tier>,

    /// Particle budget; the device preset may lower it
    #[arg(long)]
    particles: Option<usize>,

    /// Render offscreen instead of opening a window
    #[arg(long)]
    headless: bool,

    /// Frames to simulate in headless mode
    #[arg(long, default_value_t = 120)]
    frames: u32,

    #[arg(long, default_value_t = 1280)]
    width: u32,

    #[arg(long, default_value_t = 720)]
    height: u32,

    /// Write the last headless frame here
    #[arg(long)]
    output: Option<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "tpe failed");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut settings = match &cli.config {
        Some(path) => Settings::from_file(path)?,
        None => Settings::default(),
    };
    if let Some(tier) = cli.tier {
        settings.engine.force_tier = Some(tier);
    }
    if let Some(particles) = cli.particles {
        settings.engine.max_particles = particles;
    }
    if settings.spawners.is_empty() {
        settings.spawners.push(tpe::SpawnerSpec {
            position: Vec3::new(0.0, settings.simulation.bounds.y * 0.5, 0.0),
            rate: 100.0,
        });
    }

    if cli.headless {
        run_headless(&cli, &settings)
    } else {
        tpe::run_windowed(&settings)
    }
}

fn run_headless(cli: &Cli, settings: &Settings) -> Result<()> {
    let mut engine = GpuComponent::from_settings(settings)?;
    let surface = SurfaceTarget::offscreen(cli.width, cli.height);
    let report = match settings.engine.force_tier {
        Some(tier) => engine.init_at(surface, tier)?,
        None => engine.init(surface)?,
    };
    info!(
        tier = %report.tier,
        probed = %report.probed_tier,
        particles = report.particle_count,
        score = report.score,
        "headless run"
    );
    for event in engine.drain_events() {
        if let EngineEvent::SetupFailed { tier, error } = event {
            warn!(%tier, %error, "tier skipped");
        }
    }

    let mut camera = Camera::framing(settings.simulation.bounds);
    let dt = 1.0 / 60.0;
    for frame in 0..cli.frames {
        engine.update(dt);
        camera.spin(dt * 0.2);
        let (view_proj, view) = camera.matrices(cli.width, cli.height);
        engine.render(view_proj, view);

        if frame % 60 == 59 {
            let stats = engine.stats();
            info!(frame = frame + 1, rendered = stats.particles_rendered, fps = stats.fps, "progress");
        }
    }

    if let Some(path) = &cli.output {
        engine.save_snapshot(path)?;
    }
    engine.destroy();
    Ok(())
}
