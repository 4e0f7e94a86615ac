//! Hashing and noise shared by the CPU step.
//!
//! Every function here has a WGSL twin in `shaders/common.wgsl` with the same
//! arithmetic, so GPU and CPU tiers produce matching motion.

use glam::{IVec3, Vec3};

/// Finite-difference step used for the curl estimate.
pub const CURL_EPSILON: f32 = 0.01;

/// Integer avalanche hash.
#[inline]
pub fn hash(n: u32) -> u32 {
    let mut x = n;
    x ^= x >> 17;
    x = x.wrapping_mul(0xed5a_d4bb);
    x ^= x >> 11;
    x = x.wrapping_mul(0xac4c_1b51);
    x ^= x >> 15;
    x = x.wrapping_mul(0x3184_8bab);
    x ^= x >> 14;
    x
}

#[inline]
pub fn hash3(x: u32, y: u32, z: u32) -> u32 {
    hash(x.wrapping_add(hash(y.wrapping_add(hash(z)))))
}

/// Uniform float in `[0, 1]`.
#[inline]
pub fn rand(seed: u32) -> f32 {
    hash(seed) as f32 / 4_294_967_295.0
}

/// Seed for respawning particle `index` at simulation time `time`.
#[inline]
pub fn respawn_seed(index: u32, time: f32) -> u32 {
    hash(index ^ hash(time.to_bits()))
}

#[inline]
fn lattice(cell: IVec3) -> f32 {
    rand(hash3(cell.x as u32, cell.y as u32, cell.z as u32))
}

#[inline]
fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

/// Trilinear value noise with smoothstep fade. Output lies in `[0, 1]`.
pub fn value_noise(p: Vec3) -> f32 {
    let cell = p.floor();
    let f = p - cell;
    let u = f * f * (Vec3::splat(3.0) - 2.0 * f);
    let c = cell.as_ivec3();

    let n000 = lattice(c);
    let n100 = lattice(c.wrapping_add(IVec3::new(1, 0, 0)));
    let n010 = lattice(c.wrapping_add(IVec3::new(0, 1, 0)));
    let n110 = lattice(c.wrapping_add(IVec3::new(1, 1, 0)));
    let n001 = lattice(c.wrapping_add(IVec3::new(0, 0, 1)));
    let n101 = lattice(c.wrapping_add(IVec3::new(1, 0, 1)));
    let n011 = lattice(c.wrapping_add(IVec3::new(0, 1, 1)));
    let n111 = lattice(c.wrapping_add(IVec3::new(1, 1, 1)));

    let x00 = lerp(n000, n100, u.x);
    let x10 = lerp(n010, n110, u.x);
    let x01 = lerp(n001, n101, u.x);
    let x11 = lerp(n011, n111, u.x);
    let y0 = lerp(x00, x10, u.y);
    let y1 = lerp(x01, x11, u.y);
    lerp(y0, y1, u.z)
}

/// Curl of the noise field by central differences.
pub fn curl_noise(p: Vec3) -> Vec3 {
    let e = CURL_EPSILON;
    let dx = Vec3::new(e, 0.0, 0.0);
    let dy = Vec3::new(0.0, e, 0.0);
    let dz = Vec3::new(0.0, 0.0, e);

    let x = value_noise(p + dy) - value_noise(p - dy) - value_noise(p + dz) + value_noise(p - dz);
    let y = value_noise(p + dz) - value_noise(p - dz) - value_noise(p + dx) + value_noise(p - dx);
    let z = value_noise(p + dx) - value_noise(p - dx) - value_noise(p + dy) + value_noise(p - dy);
    Vec3::new(x, y, z) / (2.0 * e)
}
