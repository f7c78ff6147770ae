//! Motion estimation between consecutive camera frames.
//!
//! [`MotionEstimator`] keeps the previous grayscale [`Frame`] and produces a
//! dense [`FlowField`] each time a new frame of the same size arrives. The
//! estimate uses Farneback's polynomial expansion on a Gaussian pyramid.
//!
//! Flow vectors are in estimator pixels per tick and are **not normalized**.
//! Callers scale them into their own coordinate space.
//!
//! # Example
//!
//! ```ignore
//! let mut estimator = MotionEstimator::new(FarnebackParams::default());
//! assert!(estimator.estimate(first).is_none()); // warm-up
//! if let Some(flow) = estimator.estimate(second) {
//!     println!("mean motion: {}", flow.mean());
//! }
//! ```

mod farneback;
mod pyramid;

use farneback::Pyramid;

use glam::Vec2;
use serde::{Deserialize, Serialize};

use crate::frame::Frame;

/// Tuning for the pyramidal polynomial-expansion flow.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FarnebackParams {
    /// Scale between consecutive pyramid levels.
    pub pyr_scale: f32,
    /// Number of pyramid levels including the full-size image.
    pub levels: u32,
    /// Averaging window size in pixels.
    pub win_size: u32,
    /// Solver iterations per level.
    pub iterations: u32,
    /// Neighbourhood size of the polynomial fit.
    pub poly_n: u32,
    /// Gaussian sigma weighting the polynomial fit.
    pub poly_sigma: f32,
}

impl Default for FarnebackParams {
    fn default() -> Self {
        Self {
            pyr_scale: 0.5,
            levels: 5,
            win_size: 13,
            iterations: 5,
            poly_n: 5,
            poly_sigma: 1.1,
        }
    }
}

impl FarnebackParams {
    /// Clamp every field into a usable range.
    pub fn clamped(self) -> Self {
        let odd = |v: u32, lo: u32, hi: u32| {
            let v = v.clamp(lo, hi);
            if v % 2 == 0 {
                v + 1
            } else {
                v
            }
        };
        Self {
            pyr_scale: self.pyr_scale.clamp(0.1, 0.9),
            levels: self.levels.clamp(1, 8),
            win_size: odd(self.win_size, 3, 31),
            iterations: self.iterations.clamp(1, 20),
            poly_n: odd(self.poly_n, 3, 9),
            poly_sigma: self.poly_sigma.clamp(0.5, 3.0),
        }
    }
}

/// Dense per-cell velocity in estimator pixels per tick.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowField {
    width: u32,
    height: u32,
    data: Vec<Vec2>,
}

impl FlowField {
    pub(crate) fn from_vec(width: u32, height: u32, data: Vec<Vec2>) -> Self {
        debug_assert_eq!(data.len(), (width * height) as usize);
        Self { width, height, data }
    }

    /// Build a field by evaluating `f(x, y)` for every cell.
    pub fn from_fn(width: u32, height: u32, f: impl Fn(u32, u32) -> Vec2) -> Self {
        let mut data = Vec::with_capacity((width * height) as usize);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Self { width, height, data }
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32) -> Vec2 {
        self.data[(y * self.width + x) as usize]
    }

    pub fn data(&self) -> &[Vec2] {
        &self.data
    }

    /// Iterate `(x, y, velocity)` in row-major order.
    pub fn cells(&self) -> impl Iterator<Item = (u32, u32, Vec2)> + '_ {
        let w = self.width;
        self.data
            .iter()
            .enumerate()
            .map(move |(i, &v)| (i as u32 % w, i as u32 / w, v))
    }

    /// Mean velocity over the whole field.
    pub fn mean(&self) -> Vec2 {
        if self.data.is_empty() {
            return Vec2::ZERO;
        }
        self.data.iter().copied().sum::<Vec2>() / self.data.len() as f32
    }
}

/// Dense optical flow between consecutive frames.
///
/// The previous frame's pyramid of polynomial expansions is kept, so each new
/// frame is expanded exactly once.
pub struct MotionEstimator {
    params: FarnebackParams,
    prev: Option<Frame>,
    prev_pyramid: Option<Pyramid>,
}

impl MotionEstimator {
    pub fn new(params: FarnebackParams) -> Self {
        Self {
            params: params.clamped(),
            prev: None,
            prev_pyramid: None,
        }
    }

    pub fn params(&self) -> &FarnebackParams {
        &self.params
    }

    /// Takes effect on the next estimate.
    pub fn set_params(&mut self, params: FarnebackParams) {
        let params = params.clamped();
        if params != self.params {
            self.prev_pyramid = None;
        }
        self.params = params;
    }

    /// Forget the previous frame. The next call to [`estimate`](Self::estimate)
    /// warms up again.
    pub fn reset(&mut self) {
        self.prev = None;
        self.prev_pyramid = None;
    }

    /// Whether a previous frame is stored.
    pub fn is_warm(&self) -> bool {
        self.prev.is_some()
    }

    /// Whether the previous frame's expansion is cached.
    pub fn has_cached_pyramid(&self) -> bool {
        self.prev_pyramid.is_some()
    }

    /// Store `frame` and return the flow from the previous frame to it.
    ///
    /// Returns `None` on the first frame and when the previous frame has
    /// different dimensions. In both cases `frame` replaces the stored one.
    pub fn estimate(&mut self, frame: Frame) -> Option<FlowField> {
        let cached = self.prev_pyramid.take();
        let Some(prev) = self.prev.replace(frame) else {
            log::debug!("Motion estimator warming up");
            return None;
        };
        let next = self.prev.as_ref()?;
        if prev.dimensions() != next.dimensions() {
            log::debug!(
                "Skipping flow: frame size changed from {:?} to {:?}",
                prev.dimensions(),
                next.dimensions()
            );
            return None;
        }
        if next.width() < 2 || next.height() < 2 {
            return None;
        }

        let prev_pyramid = match cached {
            Some(pyramid) => Some(pyramid),
            None => Pyramid::build(&prev, &self.params),
        };
        let (Some(prev_pyramid), Some(next_pyramid)) = (prev_pyramid, Pyramid::build(next, &self.params)) else {
            log::warn!("Flow polynomial fit is singular for {:?}", self.params);
            return None;
        };
        let flow = farneback::estimate(&prev_pyramid, &next_pyramid, &self.params);
        self.prev_pyramid = Some(next_pyramid);
        Some(flow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(shift: f32) -> Frame {
        Frame::from_fn(64, 48, |x, y| {
            let (x, y) = (x as f32 - shift, y as f32);
            128.0 + 50.0 * (x * 0.31 + 0.4 * (y * 0.19).sin()).sin() + 40.0 * (y * 0.23 + x * 0.11).cos()
        })
    }

    #[test]
    fn test_first_frame_warms_up() {
        let mut estimator = MotionEstimator::new(FarnebackParams::default());
        assert!(!estimator.is_warm());
        assert!(estimator.estimate(pattern(0.0)).is_none());
        assert!(estimator.is_warm());
    }

    #[test]
    fn test_size_mismatch_skips_and_replaces() {
        let mut estimator = MotionEstimator::new(FarnebackParams::default());
        estimator.estimate(pattern(0.0));
        assert!(estimator.estimate(Frame::from_fn(32, 24, |_, _| 0.0)).is_none());
        // The small frame is now the reference
        assert!(estimator.estimate(Frame::from_fn(32, 24, |_, _| 0.0)).is_some());
    }

    #[test]
    fn test_static_scene_has_no_motion() {
        let mut estimator = MotionEstimator::new(FarnebackParams::default());
        estimator.estimate(pattern(0.0));
        let flow = estimator.estimate(pattern(0.0)).unwrap();
        assert_eq!(flow.width(), 64);
        assert!(flow.mean().length() < 1e-3);
    }

    #[test]
    fn test_detects_horizontal_shift() {
        let mut estimator = MotionEstimator::new(FarnebackParams::default());
        estimator.estimate(pattern(0.0));
        let flow = estimator.estimate(pattern(2.0)).unwrap();
        let mean = flow.mean();
        assert!(mean.x > 0.5, "mean = {}", mean);
        assert!(mean.y.abs() < 0.5, "mean = {}", mean);
    }

    #[test]
    fn test_reuses_previous_expansion() {
        let mut estimator = MotionEstimator::new(FarnebackParams::default());
        estimator.estimate(pattern(0.0));
        assert!(!estimator.has_cached_pyramid());
        estimator.estimate(pattern(1.0)).unwrap();
        assert!(estimator.has_cached_pyramid());

        // The cached expansion gives the same flow as a cold start
        let warm = estimator.estimate(pattern(2.0)).unwrap();
        let mut cold = MotionEstimator::new(FarnebackParams::default());
        cold.estimate(pattern(1.0));
        let cold = cold.estimate(pattern(2.0)).unwrap();
        assert_eq!(warm, cold);

        estimator.set_params(FarnebackParams {
            iterations: 2,
            ..Default::default()
        });
        assert!(!estimator.has_cached_pyramid());
        estimator.reset();
        assert!(!estimator.is_warm());
    }

    #[test]
    fn test_params_clamped() {
        let p = FarnebackParams {
            win_size: 12,
            levels: 0,
            ..Default::default()
        }
        .clamped();
        assert_eq!(p.win_size, 13);
        assert_eq!(p.levels, 1);
    }

    #[test]
    fn test_flow_field_cells() {
        let field = FlowField::from_fn(3, 2, |x, y| Vec2::new(x as f32, y as f32));
        let cells: Vec<_> = field.cells().collect();
        assert_eq!(cells[4], (1, 1, Vec2::new(1.0, 1.0)));
        assert!((field.mean() - Vec2::new(1.0, 0.5)).length() < 1e-6);
    }
}
