//! Rasters passed between pipeline stages.
//!
//! - [`Frame`] is an immutable single-channel luminance image at the flow
//!   resolution. It lives for one tick inside the motion estimator.
//! - [`Layer`] is an RGBA `f32` render target with premultiplied alpha. The
//!   effect owns one for the particle pass and one for the composited output.
//!
//! Layer values are kept in `0.0..=1.0`; every drawing helper clamps.

use glam::Vec2;
use image::imageops::{self, FilterType};
use image::{GrayImage, Rgba, Rgba32FImage, RgbaImage, RgbImage};

use crate::error::StageError;

/// Largest width or height accepted for a [`Layer`].
pub const MAX_LAYER_DIMENSION: u32 = 8192;

/// How a drawn primitive combines with what is already in the layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlendMode {
    /// Standard alpha blending (`src * a + dst * (1 - a)`).
    #[default]
    Alpha,
    /// Additive blending (`dst + src * a`), saturating at 1.
    Additive,
    /// Overwrite the destination.
    Replace,
}

/// A grayscale frame at the motion estimator's resolution.
///
/// Luminance is stored as `f32` in `0.0..=255.0`.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    width: u32,
    height: u32,
    data: Vec<f32>,
}

impl Frame {
    /// Build a frame from an 8-bit grayscale image.
    pub fn from_gray(image: &GrayImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            width,
            height,
            data: image.as_raw().iter().map(|&v| v as f32).collect(),
        }
    }

    /// Convert a color camera image to grayscale, resizing it to
    /// `width` x `height` when its size differs.
    pub fn from_rgb(image: &RgbImage, width: u32, height: u32) -> Self {
        let gray = imageops::grayscale(image);
        if gray.dimensions() == (width, height) {
            Self::from_gray(&gray)
        } else {
            Self::from_gray(&imageops::resize(&gray, width, height, FilterType::Triangle))
        }
    }

    /// Build a frame by evaluating `f(x, y)` for every pixel.
    pub fn from_fn(width: u32, height: u32, f: impl Fn(u32, u32) -> f32) -> Self {
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
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Row-major luminance values.
    #[inline]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Luminance at `(x, y)`.
    #[inline]
    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.data[(y * self.width + x) as usize]
    }
}

/// An RGBA render target with premultiplied alpha.
#[derive(Clone, Debug)]
pub struct Layer {
    image: Rgba32FImage,
}

impl Layer {
    /// Allocate a transparent black layer.
    pub fn new(width: u32, height: u32) -> Result<Self, StageError> {
        check_dimensions(width, height)?;
        Ok(Self {
            image: Rgba32FImage::new(width, height),
        })
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.image.height()
    }

    #[inline]
    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    /// Layer size as a vector, for mapping normalized coordinates.
    #[inline]
    pub fn size(&self) -> Vec2 {
        Vec2::new(self.width() as f32, self.height() as f32)
    }

    /// Interleaved RGBA values.
    pub fn as_raw(&self) -> &[f32] {
        self.image.as_raw()
    }

    pub fn as_raw_mut(&mut self) -> &mut [f32] {
        &mut self.image
    }

    /// Raw bytes of the RGBA `f32` data, ready for a GPU texture upload.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(self.image.as_raw())
    }

    /// RGBA at `(x, y)`.
    #[inline]
    pub fn pixel(&self, x: u32, y: u32) -> [f32; 4] {
        self.image.get_pixel(x, y).0
    }

    #[inline]
    pub fn put_pixel(&mut self, x: u32, y: u32, rgba: [f32; 4]) {
        self.image.put_pixel(x, y, Rgba(rgba));
    }

    /// Fill the whole layer with one color.
    pub fn clear(&mut self, rgba: [f32; 4]) {
        for p in self.image.pixels_mut() {
            *p = Rgba(rgba);
        }
    }

    fn check_same_size(&self, other: &Layer) -> Result<(), StageError> {
        if self.dimensions() != other.dimensions() {
            return Err(StageError::SizeMismatch {
                expected: self.dimensions(),
                actual: other.dimensions(),
            });
        }
        Ok(())
    }

    /// Overwrite this layer with `other`.
    pub fn copy_from(&mut self, other: &Layer) -> Result<(), StageError> {
        self.check_same_size(other)?;
        self.image.copy_from_slice(other.as_raw());
        Ok(())
    }

    /// Composite premultiplied `src` over this layer.
    pub fn composite_over(&mut self, src: &Layer) -> Result<(), StageError> {
        self.check_same_size(src)?;
        for (dst, src) in self.image.pixels_mut().zip(src.image.pixels()) {
            let inv = 1.0 - src[3];
            for c in 0..4 {
                dst[c] = (src[c] + dst[c] * inv).clamp(0.0, 1.0);
            }
        }
        Ok(())
    }

    /// Additively blend an 8-bit color image at `alpha`, resizing it to the
    /// layer size first when needed.
    pub fn add_image(&mut self, src: &RgbImage, alpha: f32) {
        if alpha <= 0.0 {
            return;
        }
        let resized;
        let src = if src.dimensions() == self.dimensions() {
            src
        } else {
            resized = imageops::resize(src, self.width(), self.height(), FilterType::Triangle);
            &resized
        };
        let scale = alpha / 255.0;
        for (dst, s) in self.image.pixels_mut().zip(src.pixels()) {
            for c in 0..3 {
                dst[c] = (dst[c] + s[c] as f32 * scale).min(1.0);
            }
            dst[3] = (dst[3] + alpha).min(1.0);
        }
    }

    /// Overwrite the layer with `grid` stretched to the layer size.
    ///
    /// Grid texels are treated as cell centres and interpolated bilinearly,
    /// one axis at a time.
    pub fn fill_scaled(&mut self, grid: &Rgba32FImage) -> Result<(), StageError> {
        let (gw, gh) = grid.dimensions();
        check_dimensions(gw, gh)?;
        let (w, h) = (self.width() as usize, self.height() as usize);
        let (gw, gh) = (gw as usize, gh as usize);

        let columns: Vec<(usize, usize, f32)> = (0..w).map(|x| resample_taps(x, w, gw)).collect();
        let mut rows = Vec::with_capacity(gh * w);
        for j in 0..gh {
            for &(i0, i1, t) in &columns {
                let (a, b) = (grid.get_pixel(i0 as u32, j as u32).0, grid.get_pixel(i1 as u32, j as u32).0);
                rows.push(lerp4(a, b, t));
            }
        }

        for (y, row) in self.image.chunks_exact_mut(w * 4).enumerate() {
            let (j0, j1, t) = resample_taps(y, h, gh);
            let (top, bottom) = (&rows[j0 * w..(j0 + 1) * w], &rows[j1 * w..(j1 + 1) * w]);
            for ((px, &a), &b) in row.chunks_exact_mut(4).zip(top).zip(bottom) {
                px.copy_from_slice(&lerp4(a, b, t));
            }
        }
        Ok(())
    }

    /// Mirror the layer in place.
    pub fn mirror(&mut self, horizontal: bool, vertical: bool) {
        if horizontal {
            imageops::flip_horizontal_in_place(&mut self.image);
        }
        if vertical {
            imageops::flip_vertical_in_place(&mut self.image);
        }
    }

    /// Blend a single pixel. Out-of-bounds coordinates are ignored.
    #[inline]
    pub fn plot(&mut self, x: i64, y: i64, color: [f32; 3], alpha: f32, mode: BlendMode) {
        if x < 0 || y < 0 || x >= self.width() as i64 || y >= self.height() as i64 {
            return;
        }
        let dst = self.image.get_pixel_mut(x as u32, y as u32);
        match mode {
            BlendMode::Alpha => {
                let inv = 1.0 - alpha;
                for c in 0..3 {
                    dst[c] = (color[c] * alpha + dst[c] * inv).clamp(0.0, 1.0);
                }
                dst[3] = (alpha + dst[3] * inv).clamp(0.0, 1.0);
            }
            BlendMode::Additive => {
                for c in 0..3 {
                    dst[c] = (dst[c] + color[c] * alpha).clamp(0.0, 1.0);
                }
                dst[3] = (dst[3] + alpha).clamp(0.0, 1.0);
            }
            BlendMode::Replace => {
                *dst = Rgba([color[0], color[1], color[2], alpha]);
            }
        }
    }

    /// Draw a one pixel wide line segment in pixel coordinates.
    pub fn draw_line(&mut self, from: Vec2, to: Vec2, color: [f32; 3], alpha: f32, mode: BlendMode) {
        let max = self.size() - Vec2::ONE;
        let Some((from, to)) = clip_segment(from, to, Vec2::ZERO, max) else {
            return;
        };

        let (x1, y1) = (to.x.round() as i64, to.y.round() as i64);
        let mut cx = from.x.round() as i64;
        let mut cy = from.y.round() as i64;
        let dx = (x1 - cx).abs();
        let dy = -(y1 - cy).abs();
        let sx = if cx < x1 { 1 } else { -1 };
        let sy = if cy < y1 { 1 } else { -1 };
        let mut err = dx + dy;

        loop {
            self.plot(cx, cy, color, alpha, mode);
            if cx == x1 && cy == y1 {
                break;
            }
            let e2 = 2 * err;
            if e2 >= dy {
                err += dy;
                cx += sx;
            }
            if e2 <= dx {
                err += dx;
                cy += sy;
            }
        }
    }

    /// Convert to an 8-bit image (straight values, alpha kept).
    pub fn to_rgba8(&self) -> RgbaImage {
        RgbaImage::from_fn(self.width(), self.height(), |x, y| {
            let p = self.image.get_pixel(x, y);
            Rgba([
                (p[0].clamp(0.0, 1.0) * 255.0).round() as u8,
                (p[1].clamp(0.0, 1.0) * 255.0).round() as u8,
                (p[2].clamp(0.0, 1.0) * 255.0).round() as u8,
                (p[3].clamp(0.0, 1.0) * 255.0).round() as u8,
            ])
        })
    }
}

/// Source cells and weight for output coordinate `x` when stretching `src_len`
/// cells over `dst_len`.
fn resample_taps(x: usize, dst_len: usize, src_len: usize) -> (usize, usize, f32) {
    let u = ((x as f32 + 0.5) * src_len as f32 / dst_len as f32 - 0.5).max(0.0);
    let i0 = (u as usize).min(src_len - 1);
    let i1 = (i0 + 1).min(src_len - 1);
    (i0, i1, (u - i0 as f32).min(1.0))
}

#[inline]
fn lerp4(a: [f32; 4], b: [f32; 4], t: f32) -> [f32; 4] {
    [
        a[0] + (b[0] - a[0]) * t,
        a[1] + (b[1] - a[1]) * t,
        a[2] + (b[2] - a[2]) * t,
        a[3] + (b[3] - a[3]) * t,
    ]
}

/// Validate the size of a render target or scratch buffer.
pub(crate) fn check_dimensions(width: u32, height: u32) -> Result<(), StageError> {
    if width == 0 || height == 0 {
        return Err(StageError::InvalidDimensions { width, height });
    }
    if width > MAX_LAYER_DIMENSION || height > MAX_LAYER_DIMENSION {
        return Err(StageError::TooLarge {
            width,
            height,
            max: MAX_LAYER_DIMENSION,
        });
    }
    Ok(())
}

/// Liang-Barsky clip of a segment against an axis-aligned box.
fn clip_segment(from: Vec2, to: Vec2, min: Vec2, max: Vec2) -> Option<(Vec2, Vec2)> {
    if !from.is_finite() || !to.is_finite() {
        return None;
    }
    let d = to - from;
    let mut t0 = 0.0_f32;
    let mut t1 = 1.0_f32;
    let checks = [
        (-d.x, from.x - min.x),
        (d.x, max.x - from.x),
        (-d.y, from.y - min.y),
        (d.y, max.y - from.y),
    ];
    for (p, q) in checks {
        if p == 0.0 {
            if q < 0.0 {
                return None;
            }
            continue;
        }
        let r = q / p;
        if p < 0.0 {
            if r > t1 {
                return None;
            }
            t0 = t0.max(r);
        } else {
            if r < t0 {
                return None;
            }
            t1 = t1.min(r);
        }
    }
    Some((from + d * t0, from + d * t1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_rejects_zero_size() {
        assert_eq!(
            Layer::new(0, 10).unwrap_err(),
            StageError::InvalidDimensions { width: 0, height: 10 }
        );
        assert!(matches!(
            Layer::new(MAX_LAYER_DIMENSION + 1, 4),
            Err(StageError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_frame_from_rgb_resizes() {
        let rgb = RgbImage::from_pixel(64, 48, image::Rgb([200, 200, 200]));
        let frame = Frame::from_rgb(&rgb, 16, 12);
        assert_eq!(frame.dimensions(), (16, 12));
        assert!((frame.get(3, 3) - 200.0).abs() < 1.5);
    }

    #[test]
    fn test_alpha_plot_on_black() {
        let mut layer = Layer::new(4, 4).unwrap();
        layer.plot(1, 1, [1.0, 1.0, 1.0], 0.5, BlendMode::Alpha);
        let p = layer.pixel(1, 1);
        assert!((p[0] - 0.5).abs() < 1e-6);
        assert!((p[3] - 0.5).abs() < 1e-6);
        // Out of bounds is ignored
        layer.plot(-1, 9, [1.0; 3], 1.0, BlendMode::Alpha);
    }

    #[test]
    fn test_draw_line_endpoints() {
        let mut layer = Layer::new(10, 10).unwrap();
        layer.draw_line(Vec2::new(1.0, 1.0), Vec2::new(8.0, 1.0), [1.0; 3], 1.0, BlendMode::Replace);
        for x in 1..=8 {
            assert_eq!(layer.pixel(x, 1)[0], 1.0);
        }
        assert_eq!(layer.pixel(9, 1)[0], 0.0);
    }

    #[test]
    fn test_draw_line_clips_offscreen() {
        let mut layer = Layer::new(10, 10).unwrap();
        layer.draw_line(
            Vec2::new(-1.0e9, 5.0),
            Vec2::new(1.0e9, 5.0),
            [1.0; 3],
            1.0,
            BlendMode::Replace,
        );
        assert_eq!(layer.pixel(0, 5)[0], 1.0);
        assert_eq!(layer.pixel(9, 5)[0], 1.0);
        // Fully outside draws nothing
        layer.draw_line(Vec2::new(-5.0, -5.0), Vec2::new(-1.0, -9.0), [1.0; 3], 1.0, BlendMode::Replace);
    }

    #[test]
    fn test_composite_over_premultiplied() {
        let mut dst = Layer::new(2, 1).unwrap();
        dst.clear([0.0, 0.0, 1.0, 1.0]);
        let mut src = Layer::new(2, 1).unwrap();
        src.put_pixel(0, 0, [0.5, 0.0, 0.0, 0.5]);
        dst.composite_over(&src).unwrap();
        let p = dst.pixel(0, 0);
        assert!((p[0] - 0.5).abs() < 1e-6);
        assert!((p[2] - 0.5).abs() < 1e-6);
        assert_eq!(dst.pixel(1, 0), [0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn test_composite_size_mismatch() {
        let mut dst = Layer::new(2, 2).unwrap();
        let src = Layer::new(3, 2).unwrap();
        assert!(matches!(dst.composite_over(&src), Err(StageError::SizeMismatch { .. })));
    }

    #[test]
    fn test_fill_scaled_interpolates() {
        let grid = Rgba32FImage::from_fn(2, 1, |x, _| Rgba([x as f32, 0.0, 0.0, 1.0]));
        let mut layer = Layer::new(8, 4).unwrap();
        layer.fill_scaled(&grid).unwrap();
        // Outer quarters hold the cell values, the middle ramps between them
        assert_eq!(layer.pixel(0, 0)[0], 0.0);
        assert_eq!(layer.pixel(1, 3)[0], 0.0);
        assert_eq!(layer.pixel(7, 2)[0], 1.0);
        assert!((layer.pixel(3, 1)[0] - 0.375).abs() < 1e-6);
        assert!((layer.pixel(4, 1)[0] - 0.625).abs() < 1e-6);
        assert_eq!(layer.pixel(5, 0)[3], 1.0);
    }

    #[test]
    fn test_fill_scaled_same_size_copies() {
        let grid = Rgba32FImage::from_fn(3, 2, |x, y| Rgba([x as f32 * 0.25, y as f32 * 0.5, 0.0, 1.0]));
        let mut layer = Layer::new(3, 2).unwrap();
        layer.fill_scaled(&grid).unwrap();
        assert_eq!(layer.as_raw(), grid.as_raw().as_slice());
        assert!(layer.fill_scaled(&Rgba32FImage::new(0, 2)).is_err());
    }

    #[test]
    fn test_mirror_horizontal() {
        let mut layer = Layer::new(3, 1).unwrap();
        layer.put_pixel(0, 0, [1.0, 0.0, 0.0, 1.0]);
        layer.mirror(true, false);
        assert_eq!(layer.pixel(2, 0), [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(layer.pixel(0, 0), [0.0; 4]);
    }
}
