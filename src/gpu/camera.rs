//! Orbit camera used by the windowed runner and the demo.

use glam::{Mat4, Vec3};

/// Orbits `target` at `distance`, looking at it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    /// Horizontal rotation angle in radians.
    pub yaw: f32,
    /// Vertical rotation angle in radians.
    pub pitch: f32,
    pub distance: f32,
    pub target: Vec3,
    /// Vertical field of view in radians.
    pub fov_y: f32,
    pub near: f32,
    pub far: f32,
}

impl Camera {
    pub const MIN_DISTANCE: f32 = 1.0;
    pub const MAX_DISTANCE: f32 = 2000.0;

    /// Camera that frames a box with the given half-extents.
    pub fn framing(bounds: Vec3) -> Self {
        let radius = bounds.length().max(1.0);
        Self {
            yaw: 0.0,
            pitch: 0.3,
            distance: (radius * 2.0).clamp(Self::MIN_DISTANCE, Self::MAX_DISTANCE),
            target: Vec3::ZERO,
            fov_y: 45f32.to_radians(),
            near: 0.1,
            far: radius * 8.0,
        }
    }

    pub fn position(&self) -> Vec3 {
        let x = self.distance * self.pitch.cos() * self.yaw.sin();
        let y = self.distance * self.pitch.sin();
        let z = self.distance * self.pitch.cos() * self.yaw.cos();
        self.target + Vec3::new(x, y, z)
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at_rh(self.position(), self.target, Vec3::Y)
    }

    pub fn projection_matrix(&self, aspect: f32) -> Mat4 {
        Mat4::perspective_rh(self.fov_y, aspect.max(f32::EPSILON), self.near, self.far)
    }

    /// `(view_proj, view)` for a viewport of `width` by `height` pixels.
    pub fn matrices(&self, width: u32, height: u32) -> (Mat4, Mat4) {
        let view = self.view_matrix();
        let aspect = width.max(1) as f32 / height.max(1) as f32;
        (self.projection_matrix(aspect) * view, view)
    }

    /// Rotate by a mouse drag of `(dx, dy)` pixels.
    pub fn orbit(&mut self, dx: f32, dy: f32) {
        self.yaw -= dx * 0.005;
        self.pitch = (self.pitch + dy * 0.005).clamp(-1.5, 1.5);
    }

    /// Move closer for positive `scroll`, proportionally to the distance.
    pub fn zoom(&mut self, scroll: f32) {
        self.distance =
            (self.distance * (1.0 - scroll * 0.1)).clamp(Self::MIN_DISTANCE, Self::MAX_DISTANCE);
    }

    /// Rotate around the vertical axis, for unattended demos.
    pub fn spin(&mut self, radians: f32) {
        self.yaw = (self.yaw + radians) % std::f32::consts::TAU;
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self::framing(Vec3::splat(100.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_is_in_front_of_the_camera() {
        let camera = Camera::default();
        let (view_proj, view) = camera.matrices(1280, 720);
        assert!((view * Vec3::ZERO.extend(1.0)).z < 0.0);
        let clip = view_proj * Vec3::ZERO.extend(1.0);
        assert!(clip.w > 0.0);
        assert!((clip.x / clip.w).abs() < 1e-4);
    }

    #[test]
    fn pitch_and_distance_are_clamped() {
        let mut camera = Camera::default();
        camera.orbit(0.0, 10_000.0);
        assert_eq!(camera.pitch, 1.5);
        camera.zoom(100.0);
        assert_eq!(camera.distance, Camera::MIN_DISTANCE);
        camera.zoom(-1e6);
        assert_eq!(camera.distance, Camera::MAX_DISTANCE);
    }
}
