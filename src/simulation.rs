//! The per-particle simulation step.
//!
//! One frame of simulation, per particle:
//!
//! 1. A dead particle (`life <= 0`) respawns around a spawner (or the origin)
//!    with `life = 1` and does nothing else this step.
//! 2. An alive particle accumulates gravity, wind, the attractor pull and
//!    curl-noise turbulence, integrates with damping, bounces off the world
//!    box with restitution `0.8`, loses `0.2 * dt` life and gets a new color
//!    from its speed.
//!
//! [`step`] is the CPU loop used by the legacy and software tiers. The GPU
//! tiers run `simulate` in `shaders/common.wgsl`, which mirrors this file
//! line for line and reads the same [`SimParams`] uniform.

use bytemuck::{Pod, Zeroable};
use glam::{Vec3, Vec4};

use crate::config::SimulationConfig;
use crate::noise::{curl_noise, hash, rand, respawn_seed};
use crate::particle::Particle;
use crate::spawner::pick_origin;

/// Particles per GPU workgroup.
pub const WORKGROUP_SIZE: u32 = 256;

/// Velocity kept (and inverted) on a wall hit.
pub const RESTITUTION: f32 = 0.8;

/// Life lost per second.
pub const LIFE_DECAY: f32 = 0.2;

/// Attractor pull is skipped closer than this squared distance.
pub const ATTRACTOR_MIN_DIST_SQ: f32 = 0.01;

/// Per-frame simulation uniform, shared by every tier.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct SimParams {
    pub delta_time: f32,
    pub time: f32,
    pub particle_count: u32,
    pub spawner_count: u32,
    pub wind: [f32; 3],
    pub gravity: f32,
    pub attractor: [f32; 3],
    pub attractor_strength: f32,
    pub bounds: [f32; 3],
    pub damping: f32,
    pub noise_scale: f32,
    pub noise_strength: f32,
    pub turbulence: f32,
    pub noise_drift: f32,
    pub spawn_radius: f32,
    pub spawn_speed: f32,
    /// Particles per row of the feedback state texture.
    pub state_columns: u32,
    pub _pad: u32,
}

impl SimParams {
    pub fn new(
        config: &SimulationConfig,
        delta_time: f32,
        time: f32,
        particle_count: u32,
        spawner_count: u32,
    ) -> Self {
        Self {
            delta_time,
            time,
            particle_count,
            spawner_count,
            wind: config.wind.to_array(),
            gravity: config.gravity,
            attractor: config.attractor.position.to_array(),
            attractor_strength: config.attractor.strength,
            bounds: config.bounds.to_array(),
            damping: config.damping,
            noise_scale: config.turbulence.scale,
            noise_strength: config.turbulence.strength,
            turbulence: config.turbulence.intensity,
            noise_drift: config.turbulence.drift,
            spawn_radius: config.spawn_radius,
            spawn_speed: config.spawn_speed,
            state_columns: 0,
            _pad: 0,
        }
    }

    pub fn with_state_columns(mut self, columns: u32) -> Self {
        self.state_columns = columns;
        self
    }

    #[inline]
    pub fn bounds(&self) -> Vec3 {
        Vec3::from_array(self.bounds)
    }
}

/// Color derived from speed and remaining life.
#[inline]
pub fn particle_color(speed: f32, life: f32) -> Vec4 {
    Vec4::new(speed * 0.1, 0.5 + speed * 0.05, 1.0 - speed * 0.1, life).clamp(Vec4::ZERO, Vec4::ONE)
}

/// Advance every particle one step.
///
/// `spawners` holds packed `[x, y, z, rate]` rows.
pub fn step(particles: &mut [Particle], params: &SimParams, spawners: &[[f32; 4]]) {
    for (index, particle) in particles.iter_mut().enumerate() {
        step_particle(particle, index as u32, params, spawners);
    }
}

pub fn step_particle(p: &mut Particle, index: u32, params: &SimParams, spawners: &[[f32; 4]]) {
    if p.life <= 0.0 {
        *p = respawn(index, params, spawners);
        return;
    }

    let dt = params.delta_time;
    let mut acc = Vec3::new(0.0, -params.gravity, 0.0) + Vec3::from_array(params.wind);

    let to_attractor = Vec3::from_array(params.attractor) - p.position;
    let dist_sq = to_attractor.length_squared();
    if dist_sq > ATTRACTOR_MIN_DIST_SQ {
        acc += to_attractor / dist_sq.sqrt() * params.attractor_strength / dist_sq;
    }

    let noise_gain = params.noise_strength * params.turbulence;
    if noise_gain != 0.0 {
        let noise_pos =
            p.position * params.noise_scale + Vec3::new(0.0, params.time * params.noise_drift, 0.0);
        acc += curl_noise(noise_pos) * noise_gain;
    }

    let mut velocity = p.velocity + acc * dt;
    velocity *= (1.0 - params.damping * dt).max(0.0);
    let mut position = p.position + velocity * dt;

    let bounds = params.bounds();
    for axis in 0..3 {
        if position[axis] > bounds[axis] {
            position[axis] = bounds[axis];
            velocity[axis] *= -RESTITUTION;
        } else if position[axis] < -bounds[axis] {
            position[axis] = -bounds[axis];
            velocity[axis] *= -RESTITUTION;
        }
    }

    p.position = position;
    p.velocity = velocity;
    p.life = (p.life - dt * LIFE_DECAY).min(1.0);
    p.color = particle_color(velocity.length(), p.life);
}

/// Fresh particle for slot `index` at the current time.
pub fn respawn(index: u32, params: &SimParams, spawners: &[[f32; 4]]) -> Particle {
    let seed = respawn_seed(index, params.time);
    let r = |k: u32| rand(seed.wrapping_add(k));

    let count = spawners.len().min(params.spawner_count as usize);
    let origin = pick_origin(&spawners[..count], r(6)).unwrap_or(Vec3::ZERO);

    let jitter = Vec3::new(r(0) - 0.5, r(1) - 0.5, r(2) - 0.5) * 2.0 * params.spawn_radius;
    let bounds = params.bounds();
    let position = (origin + jitter).clamp(-bounds, bounds);
    let velocity =
        Vec3::new((r(3) - 0.5) * 2.0, r(4) * 2.0, (r(5) - 0.5) * 2.0) * params.spawn_speed;

    Particle {
        position,
        velocity,
        color: particle_color(velocity.length(), 1.0),
        life: 1.0,
        size: r(7) * 0.5 + 0.5,
    }
}

/// Initial population spread through the world box.
pub fn seed_particles(count: usize, config: &SimulationConfig) -> Vec<Particle> {
    (0..count as u32)
        .map(|index| {
            let seed = hash(index ^ 0x9e37_79b9);
            let r = |k: u32| rand(seed.wrapping_add(k));
            let position = Vec3::new(r(0) - 0.5, r(1) - 0.5, r(2) - 0.5) * 2.0 * config.bounds;
            let velocity = Vec3::new(r(3) - 0.5, r(4) - 0.5, r(5) - 0.5) * 2.0;
            let life = 1.0 - r(6) * 0.99;
            Particle {
                position,
                velocity,
                color: particle_color(velocity.length(), life),
                life,
                size: r(7) * 0.5 + 0.5,
            }
        })
        .collect()
}

pub fn count_alive(particles: &[Particle]) -> usize {
    particles.iter().filter(|p| p.is_alive()).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigPatch;
    use rand::{Rng, SeedableRng};

    const DT: f32 = 1.0 / 60.0;

    fn params(config: &SimulationConfig, dt: f32, time: f32, count: usize) -> SimParams {
        SimParams::new(config, dt, time, count as u32, 0)
    }

    #[test]
    fn params_layout_is_96_bytes() {
        assert_eq!(std::mem::size_of::<SimParams>(), 96);
    }

    #[test]
    fn zero_gravity_keeps_height() {
        let mut config = SimulationConfig::default();
        ConfigPatch::default().gravity(0.0).apply(&mut config);

        let mut particles: Vec<Particle> = (0..64)
            .map(|i| Particle::new(Vec3::new(i as f32 - 32.0, (i % 7) as f32 * 3.0, 1.0), Vec3::ZERO))
            .collect();
        let heights: Vec<f32> = particles.iter().map(|p| p.position.y).collect();

        for frame in 0..100 {
            step(&mut particles, &params(&config, DT, frame as f32 * DT, 64), &[]);
        }

        for (p, y) in particles.iter().zip(heights) {
            assert!(p.is_alive());
            assert!((p.position.y - y).abs() < 1e-5);
        }
    }

    #[test]
    fn dying_particle_respawns_on_next_step() {
        let config = SimulationConfig::default();
        let mut p = Particle::new(Vec3::ZERO, Vec3::ZERO);
        p.life = 0.05;

        let big = params(&config, 0.5, 1.0, 1);
        step_particle(&mut p, 0, &big, &[]);
        assert!(p.life <= 0.0);

        step_particle(&mut p, 0, &params(&config, DT, 1.5, 1), &[]);
        assert_eq!(p.life, 1.0);
        assert!(p.size >= 0.5 && p.size <= 1.0);
    }

    #[test]
    fn life_stays_in_range() {
        let config = SimulationConfig::default();
        let mut particles = seed_particles(500, &config);
        for frame in 0..400 {
            step(&mut particles, &params(&config, 0.05, frame as f32 * 0.05, 500), &[]);
            for p in &particles {
                assert!(p.life <= 1.0);
                assert!(p.life > -0.05 * LIFE_DECAY - f32::EPSILON);
            }
        }
    }

    #[test]
    fn no_particle_leaves_the_box() {
        let mut config = SimulationConfig::default();
        config.bounds = Vec3::new(5.0, 3.0, 4.0);
        config.turbulence.strength = 4.0;
        config.wind = Vec3::new(30.0, 0.0, -20.0);

        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let mut particles: Vec<Particle> = (0..300)
            .map(|_| {
                let mut p = Particle::new(
                    Vec3::new(rng.gen_range(-5.0..5.0), rng.gen_range(-3.0..3.0), rng.gen_range(-4.0..4.0)),
                    Vec3::new(rng.gen_range(-200.0..200.0), rng.gen_range(-200.0..200.0), rng.gen_range(-200.0..200.0)),
                );
                p.life = rng.gen_range(0.01..1.0);
                p
            })
            .collect();

        for frame in 0..200 {
            step(&mut particles, &params(&config, 0.1, frame as f32 * 0.1, 300), &[]);
            for p in &particles {
                assert!(p.position.abs().cmple(config.bounds + Vec3::splat(1e-4)).all(), "{p:?}");
            }
        }
    }

    #[test]
    fn wall_hit_inverts_with_restitution() {
        let mut config = SimulationConfig::default();
        config.gravity = 0.0;
        config.damping = 0.0;
        config.bounds = Vec3::splat(1.0);
        let mut p = Particle::new(Vec3::new(0.95, 0.0, 0.0), Vec3::new(10.0, 0.0, 0.0));
        step_particle(&mut p, 0, &params(&config, 0.1, 0.0, 1), &[]);
        assert_eq!(p.position.x, 1.0);
        assert!((p.velocity.x + 8.0).abs() < 1e-5);
    }

    #[test]
    fn floor_is_one_sided_per_direction() {
        let mut config = SimulationConfig::default();
        config.bounds = Vec3::splat(2.0);
        let mut p = Particle::new(Vec3::new(0.0, -1.99, 0.0), Vec3::new(0.0, -5.0, 0.0));
        step_particle(&mut p, 0, &params(&config, 0.1, 0.0, 1), &[]);
        assert_eq!(p.position.y, -2.0);
        assert!(p.velocity.y > 0.0);
    }

    #[test]
    fn attractor_pulls_towards_itself() {
        let mut config = SimulationConfig::default();
        config.gravity = 0.0;
        config.attractor.position = Vec3::new(10.0, 0.0, 0.0);
        config.attractor.strength = 50.0;
        let mut p = Particle::new(Vec3::ZERO, Vec3::ZERO);
        step_particle(&mut p, 0, &params(&config, DT, 0.0, 1), &[]);
        assert!(p.velocity.x > 0.0);
        assert_eq!(p.velocity.y, 0.0);
    }

    #[test]
    fn attractor_ignores_coincident_particles() {
        let mut config = SimulationConfig::default();
        config.gravity = 0.0;
        config.attractor.strength = 1e6;
        let mut p = Particle::new(Vec3::splat(0.01), Vec3::ZERO);
        step_particle(&mut p, 0, &params(&config, DT, 0.0, 1), &[]);
        assert_eq!(p.velocity, Vec3::ZERO);
    }

    #[test]
    fn respawn_is_reproducible_and_uses_spawners() {
        let mut config = SimulationConfig::default();
        config.spawn_radius = 0.5;
        let spawners = [[20.0, 30.0, -10.0, 5.0]];
        let with_spawner = SimParams::new(&config, DT, 3.25, 10, 1);

        let a = respawn(4, &with_spawner, &spawners);
        let b = respawn(4, &with_spawner, &spawners);
        assert_eq!(a, b);
        assert!((a.position - Vec3::new(20.0, 30.0, -10.0)).abs().max_element() <= 0.5);

        let at_origin = respawn(4, &params(&config, DT, 3.25, 10), &[]);
        assert!(at_origin.position.abs().max_element() <= 0.5);

        let later = respawn(4, &SimParams::new(&config, DT, 3.5, 10, 1), &spawners);
        assert_ne!(a.velocity, later.velocity);
    }

    #[test]
    fn respawn_origin_comes_from_the_shared_pick() {
        let mut config = SimulationConfig::default();
        config.spawn_radius = 0.0;
        let spawners = [[-30.0, 0.0, 0.0, 1.0], [30.0, 0.0, 0.0, 100.0], [0.0, 0.0, 30.0, 1.0]];
        for index in 0..32 {
            let params = SimParams::new(&config, DT, 2.0, 32, 3);
            let expected = pick_origin(&spawners, rand(respawn_seed(index, 2.0).wrapping_add(6)));
            assert_eq!(Some(respawn(index, &params, &spawners).position), expected);
        }

        // Rows past spawner_count are ignored.
        let one = SimParams::new(&config, DT, 2.0, 32, 1);
        assert!((0..32).all(|i| respawn(i, &one, &spawners).position == Vec3::new(-30.0, 0.0, 0.0)));
    }

    #[test]
    fn respawn_is_clamped_into_bounds() {
        let mut config = SimulationConfig::default();
        config.bounds = Vec3::splat(1.0);
        let spawners = [[50.0, 0.0, 0.0, 1.0]];
        let p = respawn(0, &SimParams::new(&config, DT, 0.0, 1, 1), &spawners);
        assert_eq!(p.position.x, 1.0);
    }

    #[test]
    fn seeded_population_is_alive_and_inside() {
        let config = SimulationConfig::default();
        let particles = seed_particles(1000, &config);
        assert_eq!(count_alive(&particles), 1000);
        assert!(particles
            .iter()
            .all(|p| p.life > 0.0 && p.life <= 1.0 && p.position.abs().cmple(config.bounds).all()));
    }

    #[test]
    fn color_tracks_speed_and_life() {
        let slow = particle_color(0.0, 0.5);
        assert_eq!(slow, Vec4::new(0.0, 0.5, 1.0, 0.5));
        let fast = particle_color(100.0, 1.0);
        assert_eq!(fast, Vec4::new(1.0, 1.0, 0.0, 1.0));
    }
}
