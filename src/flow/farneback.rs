//! Two-frame dense flow by polynomial expansion.
//!
//! Each neighbourhood of an image is approximated by a quadratic
//! `f(x) ~ x^T A x + b^T x + c`, fitted by Gaussian-weighted least squares.
//! If the second frame is the first shifted by `d`, then `A2 = A1` and
//! `b2 = b1 - 2 A1 d`, so `d` follows from the coefficient difference. The
//! per-pixel equations are averaged over a window and solved iteratively on a
//! coarse-to-fine pyramid.

use glam::Vec2;

use super::pyramid::{gaussian_kernel, resize_bilinear, separable_blur};
use super::{FarnebackParams, FlowField};
use crate::frame::Frame;

/// Levels smaller than this on either side are not built.
const MIN_LEVEL_SIZE: f32 = 32.0;

/// Pixels this close to the border get their equations down-weighted.
const BORDER_WEIGHTS: [f32; 5] = [0.14, 0.14, 0.4472, 0.8221, 1.0];

/// Per-pixel quadratic coefficients: `[bx, by, axx, ayy, axy]`.
type Coeffs = [f32; 5];

/// Polynomial expansion with a fixed neighbourhood size and weighting.
pub(super) struct PolyExpansion {
    /// 1D Gaussian applicability weights, unnormalized.
    weights: Vec<f32>,
    /// Inverse of the 6x6 normal matrix for basis `1, x, y, x^2, y^2, xy`.
    ginv: [[f64; 6]; 6],
}

impl PolyExpansion {
    /// Returns `None` if the normal matrix is singular for these parameters.
    pub fn new(poly_n: u32, sigma: f32) -> Option<Self> {
        let radius = (poly_n / 2).max(1) as i32;
        let sigma = sigma.max(1e-3) as f64;
        let weights: Vec<f64> = (-radius..=radius)
            .map(|t| (-(t * t) as f64 / (2.0 * sigma * sigma)).exp())
            .collect();

        let mut g = [[0.0_f64; 6]; 6];
        for (iy, dy) in (-radius..=radius).enumerate() {
            for (ix, dx) in (-radius..=radius).enumerate() {
                let (x, y) = (dx as f64, dy as f64);
                let basis = [1.0, x, y, x * x, y * y, x * y];
                let w = weights[ix] * weights[iy];
                for i in 0..6 {
                    for j in 0..6 {
                        g[i][j] += w * basis[i] * basis[j];
                    }
                }
            }
        }

        Some(Self {
            weights: weights.iter().map(|&w| w as f32).collect(),
            ginv: invert6(g)?,
        })
    }

    /// Fit the quadratic model around every pixel of `src`.
    pub fn expand(&self, src: &[f32], width: usize, height: usize) -> Vec<Coeffs> {
        let radius = (self.weights.len() / 2) as isize;
        let max_x = width as isize - 1;
        let max_y = height as isize - 1;

        // Vertical pass: moments 1, y, y^2
        let mut vert = vec![[0.0_f32; 3]; width * height];
        for y in 0..height {
            for x in 0..width {
                let mut acc = [0.0_f32; 3];
                for (i, &w) in self.weights.iter().enumerate() {
                    let t = i as isize - radius;
                    let sy = (y as isize + t).clamp(0, max_y) as usize;
                    let v = w * src[sy * width + x];
                    let t = t as f32;
                    acc[0] += v;
                    acc[1] += v * t;
                    acc[2] += v * t * t;
                }
                vert[y * width + x] = acc;
            }
        }

        let gi = &self.ginv;
        let mut out = Vec::with_capacity(width * height);
        for y in 0..height {
            let row = &vert[y * width..(y + 1) * width];
            for x in 0..width {
                // Horizontal pass: h = [1, x, y, x^2, y^2, xy] moments
                let mut h = [0.0_f64; 6];
                for (i, &w) in self.weights.iter().enumerate() {
                    let t = i as isize - radius;
                    let sx = (x as isize + t).clamp(0, max_x) as usize;
                    let v = row[sx];
                    let (w, t) = (w as f64, t as f64);
                    h[0] += w * v[0] as f64;
                    h[1] += w * t * v[0] as f64;
                    h[2] += w * v[1] as f64;
                    h[3] += w * t * t * v[0] as f64;
                    h[4] += w * v[2] as f64;
                    h[5] += w * t * v[1] as f64;
                }

                let mut r = [0.0_f64; 6];
                for i in 0..6 {
                    r[i] = (0..6).map(|j| gi[i][j] * h[j]).sum();
                }
                out.push([
                    r[1] as f32,
                    r[2] as f32,
                    r[3] as f32,
                    r[4] as f32,
                    (r[5] * 0.5) as f32,
                ]);
            }
        }
        out
    }
}

/// Gauss-Jordan inversion with partial pivoting.
fn invert6(mut m: [[f64; 6]; 6]) -> Option<[[f64; 6]; 6]> {
    let mut inv = [[0.0_f64; 6]; 6];
    for (i, row) in inv.iter_mut().enumerate() {
        row[i] = 1.0;
    }

    for col in 0..6 {
        let pivot = (col..6).max_by(|&a, &b| m[a][col].abs().total_cmp(&m[b][col].abs()))?;
        if m[pivot][col].abs() < 1e-12 {
            return None;
        }
        m.swap(col, pivot);
        inv.swap(col, pivot);

        let p = m[col][col];
        for j in 0..6 {
            m[col][j] /= p;
            inv[col][j] /= p;
        }
        for row in 0..6 {
            if row == col {
                continue;
            }
            let f = m[row][col];
            if f == 0.0 {
                continue;
            }
            for j in 0..6 {
                m[row][j] -= f * m[col][j];
                inv[row][j] -= f * inv[col][j];
            }
        }
    }
    Some(inv)
}

fn border_weight(i: usize, len: usize) -> f32 {
    let edge = BORDER_WEIGHTS.len();
    let mut w = 1.0;
    if i < edge {
        w *= BORDER_WEIGHTS[i];
    }
    if i + edge >= len {
        w *= BORDER_WEIGHTS[len - 1 - i];
    }
    w
}

fn sample_coeffs(r: &[Coeffs], width: usize, height: usize, pos: Vec2) -> Option<Coeffs> {
    let x0 = pos.x.floor();
    let y0 = pos.y.floor();
    if x0 < 0.0 || y0 < 0.0 || x0 >= (width - 1) as f32 || y0 >= (height - 1) as f32 {
        return None;
    }
    let (tx, ty) = (pos.x - x0, pos.y - y0);
    let (x0, y0) = (x0 as usize, y0 as usize);
    let i = y0 * width + x0;
    let (a, b, c, d) = (r[i], r[i + 1], r[i + width], r[i + width + 1]);
    let mut out = [0.0; 5];
    for k in 0..5 {
        out[k] = (a[k] * (1.0 - tx) + b[k] * tx) * (1.0 - ty) + (c[k] * (1.0 - tx) + d[k] * tx) * ty;
    }
    Some(out)
}

/// Build the normal equations `[g11, g12, g22, h1, h2]` for every pixel given
/// the current flow estimate.
fn update_matrices(r0: &[Coeffs], r1: &[Coeffs], flow: &[Vec2], width: usize, height: usize) -> Vec<Coeffs> {
    let mut out = Vec::with_capacity(width * height);
    for y in 0..height {
        let wy = border_weight(y, height);
        for x in 0..width {
            let i = y * width + x;
            let d = flow[i];
            let c0 = r0[i];
            let c1 = sample_coeffs(r1, width, height, Vec2::new(x as f32, y as f32) + d).unwrap_or(c0);

            let mut axx = (c0[2] + c1[2]) * 0.5;
            let mut ayy = (c0[3] + c1[3]) * 0.5;
            let mut axy = (c0[4] + c1[4]) * 0.5;
            let mut bx = (c0[0] - c1[0]) * 0.5 + axx * d.x + axy * d.y;
            let mut by = (c0[1] - c1[1]) * 0.5 + axy * d.x + ayy * d.y;

            let w = wy * border_weight(x, width);
            if w < 1.0 {
                axx *= w;
                ayy *= w;
                axy *= w;
                bx *= w;
                by *= w;
            }

            out.push([
                axx * axx + axy * axy,
                (axx + ayy) * axy,
                ayy * ayy + axy * axy,
                axx * bx + axy * by,
                axy * bx + ayy * by,
            ]);
        }
    }
    out
}

fn solve_flow(m: &[Coeffs], flow: &mut [Vec2]) {
    for (d, &[g11, g12, g22, h1, h2]) in flow.iter_mut().zip(m) {
        let idet = 1.0 / (g11 * g22 - g12 * g12 + 1e-3);
        *d = Vec2::new((g22 * h1 - g12 * h2) * idet, (g11 * h2 - g12 * h1) * idet);
    }
}

fn to_planes(frame: &Frame) -> Vec<[f32; 1]> {
    frame.data().iter().map(|&v| [v]).collect()
}

fn from_planes(plane: Vec<[f32; 1]>) -> Vec<f32> {
    plane.into_iter().map(|[v]| v).collect()
}

/// One pyramid level: its size and the expansion of every pixel.
struct Level {
    width: usize,
    height: usize,
    coeffs: Vec<Coeffs>,
}

/// Polynomial expansions of one frame at every pyramid level, finest first.
///
/// A frame is expanded once and then serves as the second frame of one
/// estimate and the first frame of the next.
pub(super) struct Pyramid {
    levels: Vec<Level>,
    width: u32,
    height: u32,
}

impl Pyramid {
    /// Expand `frame` at every level the parameters allow.
    ///
    /// Returns `None` when the expansion parameters give a singular fit.
    pub fn build(frame: &Frame, params: &FarnebackParams) -> Option<Self> {
        let (w, h) = (frame.width() as usize, frame.height() as usize);
        let poly = PolyExpansion::new(params.poly_n, params.poly_sigma)?;
        let pyr_scale = params.pyr_scale;

        let mut top = 0;
        let mut scale = 1.0_f32;
        while top + 1 < params.levels {
            scale *= pyr_scale;
            if (w as f32) * scale < MIN_LEVEL_SIZE || (h as f32) * scale < MIN_LEVEL_SIZE {
                break;
            }
            top += 1;
        }

        let src = to_planes(frame);
        let mut levels = Vec::with_capacity(top as usize + 1);
        for k in 0..=top {
            let scale = pyr_scale.powi(k as i32);
            let lw = ((w as f32 * scale).round() as usize).max(1);
            let lh = ((h as f32 * scale).round() as usize).max(1);
            let img = if k == 0 {
                frame.data().to_vec()
            } else {
                let sigma = (1.0 / scale - 1.0) * 0.5;
                let radius = ((sigma * 2.5).round() as usize).max(1);
                let blurred = separable_blur(&src, w, h, &gaussian_kernel(sigma, radius));
                from_planes(resize_bilinear(&blurred, w, h, lw, lh))
            };
            levels.push(Level {
                width: lw,
                height: lh,
                coeffs: poly.expand(&img, lw, lh),
            });
        }

        Some(Self {
            levels,
            width: frame.width(),
            height: frame.height(),
        })
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }
}

/// Estimate the flow that carries the frame behind `prev` onto the frame
/// behind `next`.
///
/// Both pyramids must come from same-size frames expanded with `params`.
pub(super) fn estimate(prev: &Pyramid, next: &Pyramid, params: &FarnebackParams) -> FlowField {
    debug_assert_eq!(prev.dimensions(), next.dimensions());
    debug_assert_eq!(prev.depth(), next.depth());

    let win_radius = (params.win_size / 2).max(1) as usize;
    let win_kernel = gaussian_kernel(win_radius as f32 * 0.3, win_radius);

    let mut flow: Vec<Vec2> = Vec::new();
    let mut flow_dims = (0, 0);

    for (l0, l1) in prev.levels.iter().zip(&next.levels).rev() {
        let (lw, lh) = (l0.width, l0.height);
        flow = if flow.is_empty() {
            vec![Vec2::ZERO; lw * lh]
        } else {
            let ratio = Vec2::new(lw as f32 / flow_dims.0 as f32, lh as f32 / flow_dims.1 as f32);
            let coarse: Vec<[f32; 2]> = flow.iter().map(|v| v.to_array()).collect();
            resize_bilinear(&coarse, flow_dims.0, flow_dims.1, lw, lh)
                .into_iter()
                .map(|v| Vec2::from_array(v) * ratio)
                .collect()
        };
        flow_dims = (lw, lh);

        for _ in 0..params.iterations {
            let m = update_matrices(&l0.coeffs, &l1.coeffs, &flow, lw, lh);
            let m = separable_blur(&m, lw, lh, &win_kernel);
            solve_flow(&m, &mut flow);
        }
    }

    FlowField::from_vec(prev.width, prev.height, flow)
}
