//! Simulation clock and frame-rate counter.
//!
//! Two clocks live here. Simulated time moves only through
//! [`Time::advance`], so a host that supplies its own `dt` gets reproducible
//! respawns. The FPS counter follows the wall clock through
//! [`Time::record_frame`] and is recomputed every 500 ms.
//!
//! ```ignore
//! let mut time = Time::new();
//! // per frame:
//! let dt = time.tick();
//! time.advance(dt);
//! time.record_frame(Instant::now());
//! println!("{:.1} fps at t = {:.2}s", time.fps(), time.elapsed());
//! ```

use std::time::{Duration, Instant};

/// Largest step the simulation takes in one update, in seconds.
pub const MAX_DELTA: f32 = 0.1;

/// How often the FPS counter is recomputed.
pub const FPS_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct Time {
    /// Simulated seconds since start, after scaling.
    elapsed: f32,
    /// The last step taken by `advance`.
    delta: f32,
    frame_count: u64,
    fps: f32,
    fps_frames: u64,
    fps_window_start: Option<Instant>,
    last_tick: Option<Instant>,
    paused: bool,
    time_scale: f32,
}

impl Time {
    pub fn new() -> Self {
        Self {
            elapsed: 0.0,
            delta: 0.0,
            frame_count: 0,
            fps: 0.0,
            fps_frames: 0,
            fps_window_start: None,
            last_tick: None,
            paused: false,
            time_scale: 1.0,
        }
    }

    /// Wall-clock seconds since the previous call. The first call returns 0.
    pub fn tick(&mut self) -> f32 {
        let now = Instant::now();
        let delta = self
            .last_tick
            .map_or(0.0, |last| now.duration_since(last).as_secs_f32());
        self.last_tick = Some(now);
        delta
    }

    /// Move simulated time forward by `dt` seconds.
    ///
    /// Negative and non-finite steps count as zero, and the scaled step is
    /// clamped to [`MAX_DELTA`]. Returns the step actually taken.
    pub fn advance(&mut self, dt: f32) -> f32 {
        let dt = if dt.is_finite() { dt.max(0.0) } else { 0.0 };
        self.delta = if self.paused {
            0.0
        } else {
            (dt * self.time_scale).min(MAX_DELTA)
        };
        self.elapsed += self.delta;
        self.delta
    }

    /// Count one presented frame at `now`.
    pub fn record_frame(&mut self, now: Instant) {
        self.frame_count += 1;
        let start = *self.fps_window_start.get_or_insert(now);
        self.fps_frames += 1;

        let window = now.duration_since(start);
        if window >= FPS_INTERVAL {
            self.fps = self.fps_frames as f32 / window.as_secs_f32();
            self.fps_frames = 0;
            self.fps_window_start = Some(now);
        }
    }

    #[inline]
    pub fn elapsed(&self) -> f32 {
        self.elapsed
    }

    #[inline]
    pub fn delta(&self) -> f32 {
        self.delta
    }

    /// Frames recorded since start.
    #[inline]
    pub fn frame(&self) -> u64 {
        self.frame_count
    }

    /// Frames per second over the last complete 500 ms window.
    #[inline]
    pub fn fps(&self) -> f32 {
        self.fps
    }

    #[inline]
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    #[inline]
    pub fn time_scale(&self) -> f32 {
        self.time_scale
    }

    /// While paused, `advance` takes zero-length steps.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
        self.last_tick = None;
    }

    pub fn toggle_pause(&mut self) {
        if self.paused {
            self.resume();
        } else {
            self.pause();
        }
    }

    /// `1.0` is real time. Negative scales clamp to zero.
    pub fn set_time_scale(&mut self, scale: f32) {
        self.time_scale = scale.max(0.0);
    }

    pub fn reset(&mut self) {
        *self = Self {
            time_scale: self.time_scale,
            ..Self::new()
        };
    }
}

impl Default for Time {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_new() {
        let time = Time::new();
        assert_eq!(time.frame(), 0);
        assert!(!time.is_paused());
        assert_eq!(time.time_scale(), 1.0);
        assert_eq!(time.fps(), 0.0);
    }

    #[test]
    fn test_advance_clamps_large_steps() {
        let mut time = Time::new();
        assert_eq!(time.advance(0.016), 0.016);
        assert_eq!(time.advance(3.0), MAX_DELTA);
        assert_eq!(time.advance(-1.0), 0.0);
        assert_eq!(time.advance(f32::NAN), 0.0);
        assert!((time.elapsed() - 0.116).abs() < 1e-6);
    }

    #[test]
    fn test_time_pause() {
        let mut time = Time::new();
        time.advance(0.05);
        time.pause();
        let before = time.elapsed();
        assert_eq!(time.advance(0.05), 0.0);
        assert_eq!(time.elapsed(), before);
        time.toggle_pause();
        assert!(time.advance(0.05) > 0.0);
    }

    #[test]
    fn test_time_scale() {
        let mut time = Time::new();
        time.set_time_scale(2.0);
        assert_eq!(time.advance(0.01), 0.02);

        time.set_time_scale(-1.0);
        assert_eq!(time.time_scale(), 0.0);
    }

    #[test]
    fn test_fps_updates_every_interval() {
        let mut time = Time::new();
        let start = Instant::now();
        for i in 0..30 {
            time.record_frame(start + Duration::from_millis(i * 10));
        }
        assert_eq!(time.fps(), 0.0, "window not complete yet");

        time.record_frame(start + Duration::from_millis(500));
        assert!((time.fps() - 62.0).abs() < 0.5, "got {}", time.fps());
        assert_eq!(time.frame(), 31);
    }

    #[test]
    fn test_reset_keeps_scale() {
        let mut time = Time::new();
        time.set_time_scale(0.5);
        time.advance(0.1);
        time.reset();
        assert_eq!(time.elapsed(), 0.0);
        assert_eq!(time.time_scale(), 0.5);
    }
}
