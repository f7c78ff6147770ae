//! Frame timing.
//!
//! [`Time`] is the clock the viewer feeds to
//! [`FluidParticlesEffect::tick`](crate::FluidParticlesEffect::tick). Elapsed
//! time is kept as `f64` seconds so long-running installations do not lose
//! precision.
//!
//! A fixed delta makes the clock advance by a constant step per update, which
//! keeps headless runs and benchmarks reproducible.
//!
//! ```ignore
//! let mut time = Time::new();
//! loop {
//!     time.update();
//!     effect.tick(time.elapsed());
//! }
//! ```

use std::time::{Duration, Instant};

/// Time tracking for ticks and FPS display.
#[derive(Debug)]
pub struct Time {
    /// When the timer was created.
    start: Instant,
    /// When the last frame occurred.
    last_frame: Instant,
    /// Seconds since start, or the sum of fixed steps.
    elapsed_secs: f64,
    /// Seconds since the previous update.
    delta_secs: f32,
    frame_count: u64,
    /// Calculated FPS (updated periodically).
    fps: f32,
    fps_frame_count: u64,
    fps_update_time: Instant,
    fps_update_interval: Duration,
    /// Constant step replacing wall-clock time.
    fixed_delta: Option<f32>,
}

impl Time {
    /// Create a new time tracker starting from now.
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last_frame: now,
            elapsed_secs: 0.0,
            delta_secs: 0.0,
            frame_count: 0,
            fps: 0.0,
            fps_frame_count: 0,
            fps_update_time: now,
            fps_update_interval: Duration::from_millis(500),
            fixed_delta: None,
        }
    }

    /// A clock that advances by exactly `step` seconds per update.
    pub fn fixed(step: f32) -> Self {
        let mut time = Self::new();
        time.set_fixed_delta(Some(step));
        time
    }

    /// Update timing values. Call once per frame.
    ///
    /// Returns `(elapsed_time, delta_time)` for convenience.
    pub fn update(&mut self) -> (f64, f32) {
        let now = Instant::now();

        match self.fixed_delta {
            Some(step) => {
                self.delta_secs = step;
                self.elapsed_secs += step as f64;
            }
            None => {
                self.delta_secs = now.duration_since(self.last_frame).as_secs_f32();
                self.elapsed_secs = now.duration_since(self.start).as_secs_f64();
            }
        }
        self.last_frame = now;
        self.frame_count += 1;

        let fps_elapsed = now.duration_since(self.fps_update_time);
        if fps_elapsed >= self.fps_update_interval {
            let frames_since = self.frame_count - self.fps_frame_count;
            self.fps = frames_since as f32 / fps_elapsed.as_secs_f32();
            self.fps_frame_count = self.frame_count;
            self.fps_update_time = now;
        }

        (self.elapsed_secs, self.delta_secs)
    }

    /// Total elapsed time in seconds.
    #[inline]
    pub fn elapsed(&self) -> f64 {
        self.elapsed_secs
    }

    /// Time since last frame in seconds.
    #[inline]
    pub fn delta(&self) -> f32 {
        self.delta_secs
    }

    /// Total frames since start.
    #[inline]
    pub fn frame(&self) -> u64 {
        self.frame_count
    }

    /// Calculated frames per second.
    #[inline]
    pub fn fps(&self) -> f32 {
        self.fps
    }

    /// Pass `None` to go back to wall-clock timing.
    pub fn set_fixed_delta(&mut self, delta: Option<f32>) {
        self.fixed_delta = delta;
    }

    /// Reset the timer to its initial state.
    pub fn reset(&mut self) {
        let fixed = self.fixed_delta;
        *self = Self::new();
        self.fixed_delta = fixed;
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
    use std::thread;

    #[test]
    fn test_time_new() {
        let time = Time::new();
        assert_eq!(time.frame(), 0);
        assert_eq!(time.elapsed(), 0.0);
    }

    #[test]
    fn test_time_update() {
        let mut time = Time::new();
        thread::sleep(Duration::from_millis(10));
        let (elapsed, delta) = time.update();

        assert!(elapsed > 0.0);
        assert!(delta > 0.0);
        assert_eq!(time.frame(), 1);
    }

    #[test]
    fn test_fixed_delta() {
        let mut time = Time::fixed(1.0 / 60.0);
        thread::sleep(Duration::from_millis(20));
        for _ in 0..60 {
            time.update();
        }
        assert!((time.delta() - 1.0 / 60.0).abs() < 1e-6);
        assert!((time.elapsed() - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_reset_keeps_fixed_step() {
        let mut time = Time::fixed(0.5);
        time.update();
        time.reset();
        assert_eq!(time.frame(), 0);
        time.update();
        assert!((time.elapsed() - 0.5).abs() < 1e-9);
    }
}
