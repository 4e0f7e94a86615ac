//! CPU simulation step, as run by the legacy and software tiers.
//!
//! Run with: `cargo bench --bench cpu_step`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use glam::Vec3;

use tpe::config::{ConfigPatch, SimulationConfig};
use tpe::simulation::{seed_particles, step, SimParams};
use tpe::spawner::SpawnerRegistry;

fn bench_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("cpu_step");
    let calm = SimulationConfig::default();
    let mut turbulent = calm;
    ConfigPatch::default().noise_strength(2.0).apply(&mut turbulent);

    let mut spawners = SpawnerRegistry::new();
    for i in 0..8 {
        spawners.add(Vec3::new(i as f32 * 10.0 - 40.0, 20.0, 0.0), 50.0).unwrap();
    }

    for count in [1_000usize, 10_000, 100_000] {
        group.throughput(Throughput::Elements(count as u64));
        for (label, config) in [("calm", &calm), ("turbulent", &turbulent)] {
            let mut particles = seed_particles(count, config);
            let mut time = 0.0;
            group.bench_with_input(BenchmarkId::new(label, count), &count, |b, &count| {
                b.iter(|| {
                    time += 1.0 / 60.0;
                    let params = SimParams::new(config, 1.0 / 60.0, time, count as u32, spawners.len() as u32);
                    step(black_box(&mut particles), &params, spawners.packed());
                })
            });
        }
    }
    group.finish();
}

fn bench_seed(c: &mut Criterion) {
    let config = SimulationConfig::default();
    c.bench_function("seed_particles_100k", |b| {
        b.iter(|| black_box(seed_particles(100_000, &config)))
    });
}

criterion_group!(benches, bench_step, bench_seed);
criterion_main!(benches);
