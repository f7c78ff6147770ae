//! Frame sources standing in for a camera.
//!
//! - [`SyntheticSource`] renders a deterministic scene of moving blobs.
//! - [`ImageSequenceSource`] plays the image files of a directory in name
//!   order, looping.
//! - [`FrameQueue`] hands out a fixed list of frames once.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use image::{Rgb, RgbImage};

use crate::effect::FrameSource;
use crate::error::SourceError;

/// Bright blobs orbiting over a dark background.
pub struct SyntheticSource {
    width: u32,
    height: u32,
    frame: u64,
    interval: u64,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            frame: 0,
            interval: 1,
        }
    }

    /// Only deliver a frame every `interval` calls, like a camera slower
    /// than the display.
    pub fn with_frame_interval(mut self, interval: u64) -> Self {
        self.interval = interval.max(1);
        self
    }

    /// Render the scene at frame `n`.
    pub fn render(&self, n: u64) -> RgbImage {
        let t = n as f32 * 0.05;
        let (w, h) = (self.width as f32, self.height as f32);
        let radius = w.min(h) * 0.08;
        let blobs = [
            (0.5 + 0.3 * t.cos(), 0.5 + 0.3 * (t * 1.3).sin()),
            (0.5 + 0.25 * (t * 0.7 + 2.0).sin(), 0.5 + 0.2 * (t * 0.9).cos()),
            ((t * 0.15).fract(), 0.3),
        ];
        let inv = 1.0 / (2.0 * radius * radius);
        RgbImage::from_fn(self.width, self.height, |x, y| {
            let mut v = 20.0;
            for (bx, by) in blobs {
                let dx = x as f32 - bx * w;
                let dy = y as f32 - by * h;
                v += 220.0 * (-(dx * dx + dy * dy) * inv).exp();
            }
            let v = v.min(255.0) as u8;
            Rgb([v, v, v])
        })
    }
}

impl FrameSource for SyntheticSource {
    fn next_frame(&mut self) -> Option<RgbImage> {
        let n = self.frame;
        self.frame += 1;
        if n % self.interval != 0 {
            return None;
        }
        Some(self.render(n / self.interval))
    }
}

/// Image files of one directory, played in name order and looped.
pub struct ImageSequenceSource {
    paths: Vec<PathBuf>,
    next: usize,
}

impl ImageSequenceSource {
    /// List the PNG and JPEG files of `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, SourceError> {
        let dir = dir.as_ref();
        let mut paths = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let is_image = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| matches!(e.to_ascii_lowercase().as_str(), "png" | "jpg" | "jpeg"))
                .unwrap_or(false);
            if is_image {
                paths.push(path);
            }
        }
        if paths.is_empty() {
            return Err(SourceError::Empty(dir.to_path_buf()));
        }
        paths.sort();
        log::info!("Playing {} frames from {}", paths.len(), dir.display());
        Ok(Self { paths, next: 0 })
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl FrameSource for ImageSequenceSource {
    fn next_frame(&mut self) -> Option<RgbImage> {
        let path = &self.paths[self.next];
        self.next = (self.next + 1) % self.paths.len();
        match image::open(path) {
            Ok(img) => Some(img.to_rgb8()),
            Err(e) => {
                log::warn!("Skipping frame {}: {}", path.display(), e);
                None
            }
        }
    }
}

/// A fixed list of frames, each delivered once.
#[derive(Default)]
pub struct FrameQueue {
    frames: VecDeque<RgbImage>,
}

impl FrameQueue {
    pub fn new(frames: impl IntoIterator<Item = RgbImage>) -> Self {
        Self {
            frames: frames.into_iter().collect(),
        }
    }

    pub fn push(&mut self, frame: RgbImage) {
        self.frames.push_back(frame);
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl FrameSource for FrameQueue {
    fn next_frame(&mut self) -> Option<RgbImage> {
        self.frames.pop_front()
    }
}
