//! CPU framebuffer and the software particle rasterizer.
//!
//! The fragment shading and blend equations here are the same ones the GPU
//! pipelines use (`shaders/sprite.wgsl` and [`gpu::blend_state`]), so a frame
//! from the software tier looks like one from the GPU tiers.
//!
//! [`gpu::blend_state`]: crate::gpu::blend_state

use std::path::Path;

use glam::{Mat4, Vec2, Vec3, Vec4, Vec4Swizzles};

use crate::config::{BlendMode, SimulationConfig};
use crate::particle::Particle;

/// Alpha multiplier of the software glow pass.
pub const GLOW_ALPHA: f32 = 0.25;
/// Radius multiplier of the software glow pass.
pub const GLOW_RADIUS: f32 = 2.0;

/// Background every tier clears to. Transparent when the surface keeps alpha.
pub fn clear_color(alpha: bool) -> Vec4 {
    if alpha {
        Vec4::ZERO
    } else {
        Vec4::new(0.02, 0.02, 0.05, 1.0)
    }
}

/// Pixels in a `width` by `height` image, counted in `usize`.
#[inline]
fn pixel_count(width: u32, height: u32) -> usize {
    width as usize * height as usize
}

/// RGBA float framebuffer, row-major, top row first.
#[derive(Debug, Clone, PartialEq)]
pub struct Framebuffer {
    width: u32,
    height: u32,
    pixels: Vec<Vec4>,
}

impl Framebuffer {
    pub fn new(width: u32, height: u32) -> Self {
        let (width, height) = (width.max(1), height.max(1));
        Self {
            width,
            height,
            pixels: vec![Vec4::ZERO; pixel_count(width, height)],
        }
    }

    /// Build from tightly packed RGBA8 rows.
    pub fn from_rgba8(width: u32, height: u32, bytes: &[u8]) -> Self {
        let mut fb = Self::new(width, height);
        for (pixel, chunk) in fb.pixels.iter_mut().zip(bytes.chunks_exact(4)) {
            *pixel = Vec4::new(
                chunk[0] as f32,
                chunk[1] as f32,
                chunk[2] as f32,
                chunk[3] as f32,
            ) / 255.0;
        }
        fb
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[Vec4] {
        &self.pixels
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<Vec4> {
        if x < self.width && y < self.height {
            Some(self.pixels[self.index(x, y)])
        } else {
            None
        }
    }

    #[inline]
    fn index(&self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }

    pub fn clear(&mut self, color: Vec4) {
        self.pixels.fill(color);
    }

    /// Reallocate at a new size. Contents are cleared.
    pub fn resize(&mut self, width: u32, height: u32) {
        *self = Self::new(width, height);
    }

    /// Copy another framebuffer of any size into this one.
    pub fn copy_from(&mut self, other: &Framebuffer) {
        self.width = other.width;
        self.height = other.height;
        self.pixels.clone_from(&other.pixels);
    }

    /// Blend `src` into pixel `(x, y)`. Out-of-range coordinates are ignored.
    pub fn blend(&mut self, x: i32, y: i32, src: Vec4, mode: BlendMode) {
        if x < 0 || y < 0 || x >= self.width as i32 || y >= self.height as i32 {
            return;
        }
        let index = self.index(x as u32, y as u32);
        self.pixels[index] = blend(mode, src, self.pixels[index]);
    }

    pub fn to_rgba8(&self) -> Vec<u8> {
        self.pixels
            .iter()
            .flat_map(|p| {
                let c = (p.clamp(Vec4::ZERO, Vec4::ONE) * 255.0).round();
                [c.x as u8, c.y as u8, c.z as u8, c.w as u8]
            })
            .collect()
    }

    pub fn save_png(&self, path: impl AsRef<Path>) -> Result<(), image::ImageError> {
        image::save_buffer(
            path,
            &self.to_rgba8(),
            self.width,
            self.height,
            image::ExtendedColorType::Rgba8,
        )
    }
}

/// Fixed-function blend for `mode`, saturated like a unorm target.
///
/// Additive: color `(srcAlpha, one)`, alpha `(zero, one)`.
/// Alpha: `(srcAlpha, oneMinusSrcAlpha)` on both channels.
pub fn blend(mode: BlendMode, src: Vec4, dst: Vec4) -> Vec4 {
    let a = src.w;
    let out = match mode {
        BlendMode::Additive => (src.xyz() * a + dst.xyz()).extend(dst.w),
        BlendMode::Alpha => (src.xyz() * a + dst.xyz() * (1.0 - a)).extend(a * a + dst.w * (1.0 - a)),
    };
    out.clamp(Vec4::ZERO, Vec4::ONE)
}

fn smoothstep(edge0: f32, edge1: f32, x: f32) -> f32 {
    let t = ((x - edge0) / (edge1 - edge0)).clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

/// Point-sprite fragment at distance `dist` from the centre in quad UV units.
///
/// `size` is the on-screen half size in pixels. Returns `None` where the
/// fragment is discarded.
pub fn shade(mode: BlendMode, dist: f32, color: Vec4, life: f32, size: f32) -> Option<Vec4> {
    if life <= 0.0 || dist > 0.5 {
        return None;
    }
    match mode {
        BlendMode::Additive => {
            let intensity = (1.0 - dist * 2.0).powi(3) * life;
            let mut rgb = color.xyz() * intensity * 2.0;
            let peak = rgb.max_element();
            if peak > 1.0 {
                rgb /= peak;
            }
            Some(rgb.extend(1.0))
        }
        BlendMode::Alpha => {
            let mut alpha = 1.0 - smoothstep(0.0, 0.5, dist);
            let glow = alpha * alpha * 2.0;
            let rgb = (color.xyz() + Vec3::new(0.5, 0.3, 0.8) * glow).min(Vec3::ONE);
            alpha *= life;
            alpha *= (size * 2.0).clamp(0.0, 1.0);
            Some(rgb.extend(alpha))
        }
    }
}

/// Screen-space footprint of a particle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sprite {
    pub center: Vec2,
    /// Half size in pixels.
    pub radius: f32,
}

/// Project a particle the way the sprite vertex stage does.
///
/// Dead particles and particles at or behind the camera plane give `None`.
pub fn project(
    particle: &Particle,
    view_proj: &Mat4,
    view: &Mat4,
    resolution: Vec2,
    particle_scale: f32,
) -> Option<Sprite> {
    if !particle.is_alive() {
        return None;
    }
    let world = particle.position.extend(1.0);
    if (*view * world).z >= 0.0 {
        return None;
    }
    let clip = *view_proj * world;
    if clip.w <= 0.0 {
        return None;
    }
    let ndc = clip.xy() / clip.w;
    let center = Vec2::new((ndc.x * 0.5 + 0.5) * resolution.x, (0.5 - ndc.y * 0.5) * resolution.y);
    Some(Sprite {
        center,
        radius: particle.size * particle_scale * particle.life,
    })
}

/// Draws particles as filled circles into a [`Framebuffer`].
#[derive(Debug, Default)]
pub struct SoftwareRasterizer;

impl SoftwareRasterizer {
    /// Draw every alive particle in index order. Returns how many were drawn.
    pub fn draw(
        &self,
        target: &mut Framebuffer,
        particles: &[Particle],
        view_proj: &Mat4,
        view: &Mat4,
        config: &SimulationConfig,
    ) -> usize {
        let resolution = Vec2::new(target.width() as f32, target.height() as f32);
        let mut drawn = 0;
        for particle in particles {
            let Some(sprite) = project(particle, view_proj, view, resolution, config.particle_scale)
            else {
                continue;
            };
            if sprite.radius <= 0.0 {
                continue;
            }
            if config.software_glow {
                self.fill(target, particle, sprite, GLOW_RADIUS, GLOW_ALPHA, config.blend_mode);
            }
            self.fill(target, particle, sprite, 1.0, 1.0, config.blend_mode);
            drawn += 1;
        }
        drawn
    }

    fn fill(
        &self,
        target: &mut Framebuffer,
        particle: &Particle,
        sprite: Sprite,
        radius_scale: f32,
        alpha_scale: f32,
        mode: BlendMode,
    ) {
        let radius = sprite.radius * radius_scale;
        let min = (sprite.center - radius).floor();
        let max = (sprite.center + radius).ceil();
        let x0 = min.x.max(0.0) as i32;
        let y0 = min.y.max(0.0) as i32;
        let x1 = max.x.min(target.width() as f32) as i32;
        let y1 = max.y.min(target.height() as f32) as i32;

        for y in y0..y1 {
            for x in x0..x1 {
                let offset = Vec2::new(x as f32 + 0.5, y as f32 + 0.5) - sprite.center;
                let dist = offset.length() / (2.0 * radius);
                if let Some(mut color) = shade(mode, dist, particle.color, particle.life, radius) {
                    color.w *= alpha_scale;
                    target.blend(x, y, color, mode);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera() -> (Mat4, Mat4) {
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 10.0), Vec3::ZERO, Vec3::Y);
        let proj = Mat4::perspective_rh(45f32.to_radians(), 1.0, 0.1, 100.0);
        (proj * view, view)
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn pixel_count_does_not_wrap_at_u32() {
        assert_eq!(pixel_count(65_536, 65_537), 65_536 * 65_537);
        assert!(pixel_count(u32::MAX, 2) > u32::MAX as usize);
    }

    #[test]
    fn pixels_are_row_major() {
        let mut fb = Framebuffer::new(5, 3);
        fb.blend(4, 1, Vec4::ONE, BlendMode::Alpha);
        assert_eq!(fb.pixels()[9], Vec4::ONE);
        assert_eq!(fb.pixel(4, 1), Some(Vec4::ONE));
        assert_eq!(fb.pixel(5, 1), None);
    }

    fn bright(position: Vec3) -> Particle {
        Particle {
            position,
            velocity: Vec3::ZERO,
            color: Vec4::new(1.0, 0.9, 0.8, 1.0),
            life: 1.0,
            size: 1.0,
        }
    }

    #[test]
    fn additive_accumulation_never_exceeds_one() {
        let (view_proj, view) = camera();
        let mut fb = Framebuffer::new(64, 64);
        let config = SimulationConfig {
            blend_mode: BlendMode::Additive,
            particle_scale: 8.0,
            ..Default::default()
        };
        let particles = [bright(Vec3::ZERO), bright(Vec3::ZERO), bright(Vec3::ZERO)];

        let drawn = SoftwareRasterizer.draw(&mut fb, &particles, &view_proj, &view, &config);
        assert_eq!(drawn, 3);

        let centre = fb.pixel(32, 32).unwrap();
        assert!(centre.max_element() <= 1.0);
        assert!(centre.x > 0.9, "overlap should saturate, got {centre}");
        assert!(fb.pixels().iter().all(|p| p.max_element() <= 1.0));
    }

    #[test]
    fn additive_fragment_is_normalised_by_peak() {
        let color = shade(BlendMode::Additive, 0.0, Vec4::new(2.0, 1.0, 0.5, 1.0), 1.0, 4.0).unwrap();
        assert_eq!(color.x, 1.0);
        assert!((color.y - 0.5).abs() < 1e-6);
        assert_eq!(color.w, 1.0);
    }

    #[test]
    fn dead_or_outside_fragments_are_discarded() {
        assert!(shade(BlendMode::Alpha, 0.1, Vec4::ONE, 0.0, 4.0).is_none());
        assert!(shade(BlendMode::Additive, 0.51, Vec4::ONE, 1.0, 4.0).is_none());
    }

    #[test]
    fn alpha_fragment_fades_with_life() {
        let full = shade(BlendMode::Alpha, 0.1, Vec4::ONE, 1.0, 4.0).unwrap();
        let faded = shade(BlendMode::Alpha, 0.1, Vec4::ONE, 0.5, 4.0).unwrap();
        assert!((faded.w - full.w * 0.5).abs() < 1e-6);
    }

    #[test]
    fn blend_equations_match_fixed_function() {
        let src = Vec4::new(0.5, 0.25, 1.0, 0.5);
        let dst = Vec4::new(0.2, 0.2, 0.2, 0.8);

        let add = blend(BlendMode::Additive, src, dst);
        assert!((add - Vec4::new(0.45, 0.325, 0.7, 0.8)).abs().max_element() < 1e-6);

        let over = blend(BlendMode::Alpha, src, dst);
        assert!((over - Vec4::new(0.35, 0.225, 0.6, 0.65)).abs().max_element() < 1e-6);
    }

    #[test]
    fn dead_and_behind_camera_particles_are_not_drawn() {
        let (view_proj, view) = camera();
        let mut fb = Framebuffer::new(32, 32);
        let mut dead = bright(Vec3::ZERO);
        dead.life = 0.0;
        let behind = bright(Vec3::new(0.0, 0.0, 20.0));

        let drawn = SoftwareRasterizer.draw(
            &mut fb,
            &[dead, behind],
            &view_proj,
            &view,
            &SimulationConfig::default(),
        );
        assert_eq!(drawn, 0);
        assert!(fb.pixels().iter().all(|p| *p == Vec4::ZERO));
    }

    #[test]
    fn glow_reaches_past_the_core() {
        let (view_proj, view) = camera();
        let config = SimulationConfig {
            particle_scale: 4.0,
            ..Default::default()
        };
        let particles = [bright(Vec3::ZERO)];

        let mut with_glow = Framebuffer::new(64, 64);
        SoftwareRasterizer.draw(&mut with_glow, &particles, &view_proj, &view, &config);
        let mut without = Framebuffer::new(64, 64);
        let plain = SimulationConfig {
            software_glow: false,
            ..config
        };
        SoftwareRasterizer.draw(&mut without, &particles, &view_proj, &view, &plain);

        let lit = |fb: &Framebuffer| fb.pixels().iter().filter(|p| p.max_element() > 0.0).count();
        assert!(lit(&with_glow) > lit(&without));
    }

    #[test]
    fn rgba8_round_trip() {
        let mut fb = Framebuffer::new(2, 1);
        fb.clear(Vec4::new(1.0, 0.0, 0.5, 1.0));
        let bytes = fb.to_rgba8();
        assert_eq!(&bytes[..4], &[255, 0, 128, 255]);
        let back = Framebuffer::from_rgba8(2, 1, &bytes);
        assert!((back.pixel(1, 0).unwrap() - fb.pixel(1, 0).unwrap()).abs().max_element() < 0.01);
    }
}
