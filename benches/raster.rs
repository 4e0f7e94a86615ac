//! Software rasterizer throughput.
//!
//! Run with: `cargo bench --bench raster`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use tpe::config::{BlendMode, SimulationConfig};
use tpe::gpu::Camera;
use tpe::raster::{clear_color, Framebuffer, SoftwareRasterizer};
use tpe::simulation::seed_particles;

fn bench_draw(c: &mut Criterion) {
    let mut group = c.benchmark_group("raster");
    let (width, height) = (640, 360);
    let (view_proj, view) = Camera::default().matrices(width, height);

    for count in [1_000usize, 10_000] {
        group.throughput(Throughput::Elements(count as u64));
        for mode in [BlendMode::Additive, BlendMode::Alpha] {
            for glow in [false, true] {
                let config = SimulationConfig {
                    blend_mode: mode,
                    software_glow: glow,
                    ..Default::default()
                };
                let particles = seed_particles(count, &config);
                let mut target = Framebuffer::new(width, height);
                let label = format!("{}{}", mode.name(), if glow { "_glow" } else { "" });
                group.bench_with_input(BenchmarkId::new(label, count), &count, |b, _| {
                    b.iter(|| {
                        target.clear(clear_color(false));
                        black_box(SoftwareRasterizer.draw(&mut target, &particles, &view_proj, &view, &config))
                    })
                });
            }
        }
    }
    group.finish();
}

fn bench_encode(c: &mut Criterion) {
    let mut target = Framebuffer::new(1280, 720);
    target.clear(clear_color(true));
    c.bench_function("to_rgba8_720p", |b| b.iter(|| black_box(target.to_rgba8())));
}

criterion_group!(benches, bench_draw, bench_encode);
criterion_main!(benches);
