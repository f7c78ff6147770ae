//! Kawase light-streak filter.
//!
//! Bright pixels are smeared along the four diagonals. Each diagonal is built
//! by a short series of passes; pass `n` takes four taps spaced `4^n` pixels
//! apart, weighting tap `s` by `attenuation^(4^n * s)`. Repeating the pass
//! with growing spacing produces a long, exponentially fading trail from a
//! handful of taps. The four streaks are merged with a per-channel maximum
//! and added onto the source at `strength`.
//!
//! Streaks are built on a max-pooled copy of the layer, `downsample` times
//! smaller per side, and upsampled bilinearly when added back. Scratch
//! buffers are reused between calls. No state carries from one frame to the
//! next.

use serde::{Deserialize, Serialize};

use crate::error::StageError;
use crate::frame::{check_dimensions, Layer};
use crate::stage::PostStage;

const DIRECTIONS: [(isize, isize); 4] = [(1, 1), (1, -1), (-1, 1), (-1, -1)];
const TAPS: usize = 4;

/// Streak tunables.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreakParams {
    /// Per-pixel falloff along a streak, in `[0, 1)`.
    pub attenuation: f32,
    /// Upper bound on passes per direction.
    pub iterations: u32,
    /// Blend of the streaks onto the source, in `[0, 1]`.
    pub strength: f32,
    /// Streaks are built on a layer this many times smaller per side.
    pub downsample: u32,
}

impl Default for StreakParams {
    fn default() -> Self {
        Self {
            attenuation: 0.975,
            iterations: 8,
            strength: 0.8,
            downsample: 4,
        }
    }
}

impl StreakParams {
    pub fn clamped(self) -> Self {
        Self {
            attenuation: self.attenuation.clamp(0.0, 0.999),
            iterations: self.iterations.clamp(1, 32),
            strength: self.strength.clamp(0.0, 1.0),
            downsample: self.downsample.clamp(1, 8),
        }
    }
}

/// Streak filter with scratch buffers for one layer size.
pub struct KawaseStreak {
    params: StreakParams,
    enabled: bool,
    width: usize,
    height: usize,
    /// Scratch size, the layer size divided by `downsample` and rounded up.
    low_width: usize,
    low_height: usize,
    reduced: Vec<[f32; 4]>,
    ping: Vec<[f32; 4]>,
    pong: Vec<[f32; 4]>,
    streak: Vec<[f32; 4]>,
}

impl KawaseStreak {
    /// Allocate scratch space for `width` x `height` layers.
    pub fn new(width: u32, height: u32) -> Result<Self, StageError> {
        check_dimensions(width, height)?;
        let mut streak = Self {
            params: StreakParams::default(),
            enabled: true,
            width: width as usize,
            height: height as usize,
            low_width: 0,
            low_height: 0,
            reduced: Vec::new(),
            ping: Vec::new(),
            pong: Vec::new(),
            streak: Vec::new(),
        };
        streak.allocate();
        Ok(streak)
    }

    fn allocate(&mut self) {
        let ds = self.params.downsample as usize;
        self.low_width = self.width.div_ceil(ds);
        self.low_height = self.height.div_ceil(ds);
        let n = self.low_width * self.low_height;
        self.reduced = vec![[0.0; 4]; n];
        self.ping = vec![[0.0; 4]; n];
        self.pong = vec![[0.0; 4]; n];
        self.streak = vec![[0.0; 4]; n];
    }

    /// Builder method to set the parameters.
    pub fn with_params(mut self, params: StreakParams) -> Self {
        self.set_params(params);
        self
    }

    pub fn params(&self) -> &StreakParams {
        &self.params
    }

    /// A changed downsample factor reallocates the scratch buffers.
    pub fn set_params(&mut self, params: StreakParams) {
        let params = params.clamped();
        let realloc = params.downsample != self.params.downsample;
        self.params = params;
        if realloc {
            self.allocate();
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width as u32, self.height as u32)
    }

    /// Size of the layer streaks are built on.
    pub fn scratch_dimensions(&self) -> (u32, u32) {
        (self.low_width as u32, self.low_height as u32)
    }

    /// Max-pool `pixels` into `self.reduced` at scratch resolution.
    fn reduce(&mut self, pixels: &[f32]) {
        let ds = self.params.downsample as usize;
        if ds == 1 {
            for (dst, src) in self.reduced.iter_mut().zip(pixels.chunks_exact(4)) {
                dst.copy_from_slice(src);
            }
            return;
        }
        self.reduced.fill([0.0; 4]);
        for y in 0..self.height {
            let row = (y / ds) * self.low_width;
            for x in 0..self.width {
                let i = (y * self.width + x) * 4;
                let dst = &mut self.reduced[row + x / ds];
                for c in 0..4 {
                    dst[c] = dst[c].max(pixels[i + c]);
                }
            }
        }
    }

    /// One diagonal streak of `self.ping`, left in `self.ping`.
    fn streak_pass(&mut self, dir: (isize, isize)) {
        let (w, h) = (self.low_width as isize, self.low_height as isize);
        let longest = self.low_width.max(self.low_height);
        let atten = self.params.attenuation;

        let mut spacing = 1usize;
        for _ in 0..self.params.iterations {
            if spacing >= longest {
                break;
            }
            let mut weights = [0.0_f32; TAPS];
            for (s, w) in weights.iter_mut().enumerate() {
                *w = atten.powi((spacing * s) as i32);
            }
            let inv_sum = 1.0 / weights.iter().sum::<f32>();
            for w in &mut weights {
                *w *= inv_sum;
            }

            // Taps of pixels in [x_lo, x_hi) x [y_lo, y_hi) never leave the layer
            let reach = (spacing * (TAPS - 1)) as isize;
            let (x_lo, x_hi) = interior(dir.0, reach, w);
            let (y_lo, y_hi) = interior(dir.1, reach, h);
            let step = dir.1 * w + dir.0;

            for y in 0..h {
                let row_inside = y >= y_lo && y < y_hi;
                for x in 0..w {
                    let i = y * w + x;
                    let mut acc = [0.0_f32; 4];
                    if row_inside && x >= x_lo && x < x_hi {
                        for (s, &wt) in weights.iter().enumerate() {
                            let src = self.ping[(i + step * (spacing * s) as isize) as usize];
                            for c in 0..4 {
                                acc[c] += wt * src[c];
                            }
                        }
                    } else {
                        for (s, &wt) in weights.iter().enumerate() {
                            let off = (spacing * s) as isize;
                            let sx = (x + dir.0 * off).clamp(0, w - 1);
                            let sy = (y + dir.1 * off).clamp(0, h - 1);
                            let src = self.ping[(sy * w + sx) as usize];
                            for c in 0..4 {
                                acc[c] += wt * src[c];
                            }
                        }
                    }
                    self.pong[i as usize] = acc;
                }
            }
            std::mem::swap(&mut self.ping, &mut self.pong);
            spacing *= TAPS;
        }
    }

    /// Filter a raw RGBA slice of the configured size in place.
    fn filter(&mut self, pixels: &mut [f32]) {
        self.streak.fill([0.0; 4]);
        self.reduce(pixels);
        for dir in DIRECTIONS {
            self.ping.copy_from_slice(&self.reduced);
            self.streak_pass(dir);
            for (acc, s) in self.streak.iter_mut().zip(&self.ping) {
                for c in 0..4 {
                    acc[c] = acc[c].max(s[c]);
                }
            }
        }

        let strength = self.params.strength;
        let ds = self.params.downsample as usize;
        if ds == 1 {
            for (px, s) in pixels.chunks_exact_mut(4).zip(&self.streak) {
                for c in 0..4 {
                    px[c] = (px[c] + strength * s[c]).clamp(0.0, 1.0);
                }
            }
            return;
        }

        // Bilinear upsample of the streaks while compositing
        let columns: Vec<(usize, usize, f32)> = (0..self.width).map(|x| taps(x, ds, self.low_width)).collect();
        for y in 0..self.height {
            let (j0, j1, ty) = taps(y, ds, self.low_height);
            let (r0, r1) = (j0 * self.low_width, j1 * self.low_width);
            let row = &mut pixels[y * self.width * 4..(y + 1) * self.width * 4];
            for (px, &(i0, i1, tx)) in row.chunks_exact_mut(4).zip(&columns) {
                let (a, b) = (self.streak[r0 + i0], self.streak[r0 + i1]);
                let (c, d) = (self.streak[r1 + i0], self.streak[r1 + i1]);
                for ch in 0..4 {
                    let top = a[ch] + (b[ch] - a[ch]) * tx;
                    let bottom = c[ch] + (d[ch] - c[ch]) * tx;
                    let s = top + (bottom - top) * ty;
                    px[ch] = (px[ch] + strength * s).clamp(0.0, 1.0);
                }
            }
        }
    }
}

/// Range of coordinates whose taps at up to `reach` along `dir` stay in `0..len`.
fn interior(dir: isize, reach: isize, len: isize) -> (isize, isize) {
    if dir > 0 {
        (0, len - reach)
    } else {
        (reach, len)
    }
}

/// Scratch cells and weight for full-resolution coordinate `x`.
fn taps(x: usize, ds: usize, low_len: usize) -> (usize, usize, f32) {
    let u = ((x as f32 + 0.5) / ds as f32 - 0.5).max(0.0);
    let i0 = (u as usize).min(low_len - 1);
    let i1 = (i0 + 1).min(low_len - 1);
    (i0, i1, u - i0 as f32)
}

impl PostStage for KawaseStreak {
    fn name(&self) -> &'static str {
        "streak"
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn apply(&mut self, layer: &mut Layer) -> Result<(), StageError> {
        let expected = self.dimensions();
        if layer.dimensions() != expected {
            return Err(StageError::SizeMismatch {
                expected,
                actual: layer.dimensions(),
            });
        }
        if self.params.strength <= 0.0 {
            return Ok(());
        }
        self.filter(layer.as_raw_mut());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dot_layer() -> Layer {
        let mut layer = Layer::new(32, 32).unwrap();
        layer.put_pixel(16, 16, [1.0, 1.0, 1.0, 1.0]);
        layer
    }

    #[test]
    fn test_zero_strength_is_identity() {
        let mut layer = dot_layer();
        let before = layer.as_raw().to_vec();
        let mut streak = KawaseStreak::new(32, 32).unwrap().with_params(StreakParams {
            strength: 0.0,
            ..Default::default()
        });
        streak.apply(&mut layer).unwrap();
        assert_eq!(layer.as_raw(), &before[..]);
    }

    fn full_resolution() -> StreakParams {
        StreakParams {
            downsample: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_streaks_run_diagonally() {
        let mut layer = dot_layer();
        let mut streak = KawaseStreak::new(32, 32).unwrap().with_params(full_resolution());
        streak.apply(&mut layer).unwrap();
        // Light spreads along the diagonals but not along the axes
        assert!(layer.pixel(13, 13)[0] > 0.0);
        assert!(layer.pixel(19, 13)[0] > 0.0);
        assert_eq!(layer.pixel(16, 10)[0], 0.0);
        // The source pixel only gets brighter
        assert!(layer.pixel(16, 16)[0] >= 1.0 - 1e-6);
    }

    #[test]
    fn test_downsampled_streaks_stay_diagonal() {
        let mut layer = dot_layer();
        let mut streak = KawaseStreak::new(32, 32).unwrap().with_params(StreakParams {
            downsample: 2,
            ..Default::default()
        });
        assert_eq!(streak.scratch_dimensions(), (16, 16));
        streak.apply(&mut layer).unwrap();
        assert!(layer.pixel(13, 13)[0] > 0.0);
        assert!(layer.pixel(19, 13)[0] > 0.0);
        assert_eq!(layer.pixel(16, 10)[0], 0.0);
        assert!(layer.pixel(16, 16)[0] >= 1.0 - 1e-6);
    }

    #[test]
    fn test_interior_matches_clamped_taps() {
        // Same trail whether the dot sits near the border or in the middle
        let mut centre = Layer::new(64, 64).unwrap();
        centre.put_pixel(32, 32, [1.0; 4]);
        let mut streak = KawaseStreak::new(64, 64).unwrap().with_params(full_resolution());
        streak.apply(&mut centre).unwrap();
        let a = centre.pixel(29, 29)[0];
        let b = centre.pixel(35, 29)[0];
        assert!(a > 0.0);
        assert!((a - b).abs() < 1e-6);
    }

    #[test]
    fn test_downsample_change_reallocates() {
        let mut streak = KawaseStreak::new(30, 20).unwrap().with_params(full_resolution());
        assert_eq!(streak.scratch_dimensions(), (30, 20));
        streak.set_params(StreakParams {
            downsample: 4,
            ..Default::default()
        });
        assert_eq!(streak.scratch_dimensions(), (8, 5));
        let mut layer = Layer::new(30, 20).unwrap();
        layer.put_pixel(15, 10, [1.0; 4]);
        streak.apply(&mut layer).unwrap();
        assert!(layer.as_raw().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_disabled_stage_is_skipped() {
        let mut layer = dot_layer();
        let before = layer.as_raw().to_vec();
        let mut streak = KawaseStreak::new(32, 32).unwrap();
        streak.set_enabled(false);
        crate::stage::apply_stages(&mut [&mut streak], &mut layer);
        assert_eq!(layer.as_raw(), &before[..]);
    }

    #[test]
    fn test_output_is_bounded() {
        let mut layer = Layer::new(16, 16).unwrap();
        layer.clear([1.0; 4]);
        let mut streak = KawaseStreak::new(16, 16).unwrap().with_params(StreakParams {
            strength: 1.0,
            ..Default::default()
        });
        streak.apply(&mut layer).unwrap();
        assert!(layer.as_raw().iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn test_size_mismatch_leaves_layer() {
        let mut layer = dot_layer();
        let before = layer.as_raw().to_vec();
        let mut streak = KawaseStreak::new(8, 8).unwrap();
        assert!(matches!(streak.apply(&mut layer), Err(StageError::SizeMismatch { .. })));
        assert_eq!(layer.as_raw(), &before[..]);
    }

    #[test]
    fn test_rejects_empty_buffers() {
        assert!(KawaseStreak::new(0, 4).is_err());
    }
}
