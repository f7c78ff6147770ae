//! Separable filtering and resampling over small interleaved planes.
//!
//! Planes are row-major `[f32; C]` slices so the same code blurs a luminance
//! image (`C = 1`), a flow field (`C = 2`) and the per-pixel flow equations
//! (`C = 5`). Borders replicate the edge pixel.

/// Normalized 1D Gaussian kernel with `2 * radius + 1` taps.
pub(super) fn gaussian_kernel(sigma: f32, radius: usize) -> Vec<f32> {
    let sigma = sigma.max(1e-3);
    let denom = 2.0 * sigma * sigma;
    let mut kernel: Vec<f32> = (0..=2 * radius)
        .map(|i| {
            let t = i as f32 - radius as f32;
            (-t * t / denom).exp()
        })
        .collect();
    let sum: f32 = kernel.iter().sum();
    for k in &mut kernel {
        *k /= sum;
    }
    kernel
}

/// Convolve with `kernel` horizontally then vertically.
pub(super) fn separable_blur<const C: usize>(
    src: &[[f32; C]],
    width: usize,
    height: usize,
    kernel: &[f32],
) -> Vec<[f32; C]> {
    let radius = (kernel.len() / 2) as isize;
    let max_x = width as isize - 1;
    let max_y = height as isize - 1;

    let mut tmp = vec![[0.0; C]; src.len()];
    for y in 0..height {
        let row = &src[y * width..(y + 1) * width];
        for x in 0..width {
            let mut acc = [0.0; C];
            for (i, &k) in kernel.iter().enumerate() {
                let sx = (x as isize + i as isize - radius).clamp(0, max_x) as usize;
                for c in 0..C {
                    acc[c] += k * row[sx][c];
                }
            }
            tmp[y * width + x] = acc;
        }
    }

    let mut out = vec![[0.0; C]; src.len()];
    for y in 0..height {
        for x in 0..width {
            let mut acc = [0.0; C];
            for (i, &k) in kernel.iter().enumerate() {
                let sy = (y as isize + i as isize - radius).clamp(0, max_y) as usize;
                let v = tmp[sy * width + x];
                for c in 0..C {
                    acc[c] += k * v[c];
                }
            }
            out[y * width + x] = acc;
        }
    }
    out
}

/// Bilinear resize with pixel-center alignment.
pub(super) fn resize_bilinear<const C: usize>(
    src: &[[f32; C]],
    src_width: usize,
    src_height: usize,
    dst_width: usize,
    dst_height: usize,
) -> Vec<[f32; C]> {
    if (src_width, src_height) == (dst_width, dst_height) {
        return src.to_vec();
    }
    let sx_ratio = src_width as f32 / dst_width as f32;
    let sy_ratio = src_height as f32 / dst_height as f32;
    let max_x = (src_width - 1) as f32;
    let max_y = (src_height - 1) as f32;

    let mut out = Vec::with_capacity(dst_width * dst_height);
    for y in 0..dst_height {
        let fy = ((y as f32 + 0.5) * sy_ratio - 0.5).clamp(0.0, max_y);
        let y0 = fy.floor() as usize;
        let y1 = (y0 + 1).min(src_height - 1);
        let ty = fy - y0 as f32;
        for x in 0..dst_width {
            let fx = ((x as f32 + 0.5) * sx_ratio - 0.5).clamp(0.0, max_x);
            let x0 = fx.floor() as usize;
            let x1 = (x0 + 1).min(src_width - 1);
            let tx = fx - x0 as f32;

            let a = src[y0 * src_width + x0];
            let b = src[y0 * src_width + x1];
            let c = src[y1 * src_width + x0];
            let d = src[y1 * src_width + x1];
            let mut v = [0.0; C];
            for ch in 0..C {
                let top = a[ch] + (b[ch] - a[ch]) * tx;
                let bottom = c[ch] + (d[ch] - c[ch]) * tx;
                v[ch] = top + (bottom - top) * ty;
            }
            out.push(v);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_is_normalized_and_symmetric() {
        let k = gaussian_kernel(1.8, 6);
        assert_eq!(k.len(), 13);
        let sum: f32 = k.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!((k[0] - k[12]).abs() < 1e-7);
        assert!(k[6] > k[5]);
    }

    #[test]
    fn test_blur_preserves_constant() {
        let src = vec![[3.0_f32, -1.0]; 8 * 5];
        let out = separable_blur(&src, 8, 5, &gaussian_kernel(1.0, 2));
        for v in out {
            assert!((v[0] - 3.0).abs() < 1e-5);
            assert!((v[1] + 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_resize_linear_ramp() {
        let src: Vec<[f32; 1]> = (0..8).map(|x| [x as f32]).collect();
        let out = resize_bilinear(&src, 8, 1, 4, 1);
        // Centers of the half-size image fall between source pixels
        assert!((out[0][0] - 0.5).abs() < 1e-5);
        assert!((out[3][0] - 6.5).abs() < 1e-5);
    }
}
