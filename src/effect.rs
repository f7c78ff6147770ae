//! The fluid particles effect.
//!
//! [`FluidParticlesEffect`] owns the whole pipeline and runs it one tick at a
//! time:
//!
//! 1. **Inject.** In [`EffectMode::Interactive`] a new camera frame is turned
//!    into a flow field and every flow cell inside the clip rectangle that
//!    moves enough spawns particles and pushes force and dye into the fluid.
//!    In [`EffectMode::Rain`] the camera is ignored and random drops fall
//!    from the top edge.
//! 2. **Simulate.** The fluid steps, then particles age and follow it.
//! 3. **Render.** [`render`](FluidParticlesEffect::render) composes the dye,
//!    the streaked particle layer, the camera passthrough and the optional
//!    flow overlay, then mirrors the result if asked.
//!
//! Ticks without a new camera frame still simulate and render, so a slow
//! source never freezes the output.
//!
//! # Example
//!
//! ```ignore
//! let source = SyntheticSource::new(320, 240);
//! let mut effect = FluidParticlesEffect::new(EffectConfig::default(), Box::new(source))?;
//! loop {
//!     time.update();
//!     effect.tick(time.elapsed());
//!     present(effect.render());
//! }
//! ```

use glam::Vec2;
use image::imageops::{self, FilterType};
use image::{Rgba, Rgba32FImage, RgbImage};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::config::EffectConfig;
use crate::error::StageError;
use crate::flow::{FlowField, MotionEstimator};
use crate::fluid::FluidSolver;
use crate::frame::{BlendMode, Frame, Layer};
use crate::particles::{ParticleSystem, SpawnPolicy};
use crate::stage::{apply_stages, Mirror};
use crate::streak::KawaseStreak;

/// Events whose squared normalized speed is at or below this are noise.
pub const NOISE_EPSILON_SQ: f32 = 1e-6;

/// Rain rolls an integer below this and compares it with the particle max.
pub const RAIN_CEILING: u32 = 128;

/// Speed of a rain drop in normalized units per tick.
const RAIN_SPEED: f32 = 0.05;

/// Produces camera frames. `None` means no new frame this tick.
pub trait FrameSource {
    fn next_frame(&mut self) -> Option<RgbImage>;
}

/// Where particles and fluid forces come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EffectMode {
    /// Driven by camera motion.
    #[default]
    Interactive,
    /// Random falling drops.
    Rain,
}

impl EffectMode {
    pub fn toggled(self) -> Self {
        match self {
            EffectMode::Interactive => EffectMode::Rain,
            EffectMode::Rain => EffectMode::Interactive,
        }
    }
}

/// Active region in normalized coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClipRect {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl Default for ClipRect {
    fn default() -> Self {
        Self::FULL
    }
}

impl ClipRect {
    /// The whole frame.
    pub const FULL: Self = Self {
        x1: 0.0,
        y1: 0.0,
        x2: 1.0,
        y2: 1.0,
    };

    /// Full-height rectangle spanning the horizontal extent of a drag.
    pub fn from_drag(start: Vec2, end: Vec2) -> Self {
        Self {
            x1: start.x.min(end.x),
            y1: 0.0,
            x2: start.x.max(end.x),
            y2: 1.0,
        }
        .normalized()
    }

    /// Clamp into `[0, 1]` and order the corners.
    pub fn normalized(self) -> Self {
        let c = |v: f32| if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 };
        let (x1, x2) = (c(self.x1), c(self.x2));
        let (y1, y2) = (c(self.y1), c(self.y2));
        Self {
            x1: x1.min(x2),
            y1: y1.min(y2),
            x2: x1.max(x2),
            y2: y1.max(y2),
        }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn contains_x(&self, x: f32) -> bool {
        self.x1 <= x && x <= self.x2
    }

    pub fn contains(&self, p: Vec2) -> bool {
        self.contains_x(p.x) && self.y1 <= p.y && p.y <= self.y2
    }
}

/// Camera motion driving a fluid and a particle system, rendered with streaks.
pub struct FluidParticlesEffect {
    config: EffectConfig,
    source: Box<dyn FrameSource>,
    estimator: MotionEstimator,
    flow: Option<FlowField>,
    capture: Option<RgbImage>,
    /// `capture` resized to the layer, built on first use after each frame.
    capture_scaled: Option<RgbImage>,
    fluid: FluidSolver,
    particles: ParticleSystem,
    spawn_policy: SpawnPolicy,
    streak: Option<KawaseStreak>,
    mirror: Mirror,
    particle_layer: Layer,
    output: Layer,
    clip: ClipRect,
    drag_origin: Option<Vec2>,
    rain_rng: SmallRng,
    mode_switches: u64,
    active: bool,
}

impl FluidParticlesEffect {
    /// Build the pipeline from a config and a camera source.
    ///
    /// Fails only if the output layers cannot be allocated. A streak filter
    /// that cannot be allocated is logged and bypassed.
    pub fn new(config: EffectConfig, source: Box<dyn FrameSource>) -> Result<Self, StageError> {
        let config = config.clamped();
        let (lw, lh) = (config.layer_width, config.layer_height);
        let output = Layer::new(lw, lh)?;
        let particle_layer = Layer::new(lw, lh)?;

        let mut effect = Self {
            estimator: MotionEstimator::new(config.flow.farneback),
            flow: None,
            capture: None,
            capture_scaled: None,
            fluid: FluidSolver::new(config.fluid.width, config.fluid.height).with_params(config.fluid.solver),
            particles: ParticleSystem::new(config.particles.capacity, output.size(), config.seed)
                .with_color(config.particles.color),
            spawn_policy: config.particles.spawn_policy(),
            streak: build_streak(lw, lh),
            mirror: Mirror::new(config.draw.flip_horizontal, config.draw.flip_vertical),
            particle_layer,
            output,
            clip: config.clip,
            drag_origin: None,
            rain_rng: SmallRng::seed_from_u64(config.seed.wrapping_add(1)),
            mode_switches: 0,
            active: false,
            source,
            config,
        };
        if let Some(streak) = &mut effect.streak {
            streak.set_params(effect.config.streak);
        }
        effect.activate();
        Ok(effect)
    }

    /// Start (or restart) the effect: forget the previous camera frame and
    /// zero the fluid.
    pub fn activate(&mut self) {
        self.estimator.reset();
        self.flow = None;
        self.capture = None;
        self.capture_scaled = None;
        self.fluid.reset();
        self.active = true;
        log::info!("Fluid particles effect activated in {:?} mode", self.config.mode);
    }

    /// Stop ticking. All state stays valid and may be dropped at any time.
    pub fn deactivate(&mut self) {
        self.active = false;
        log::info!("Fluid particles effect deactivated");
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Zero the fluid grid.
    pub fn reset_fluid(&mut self) {
        self.fluid.reset();
        log::info!("Fluid reset");
    }

    pub fn mode(&self) -> EffectMode {
        self.config.mode
    }

    /// Switch modes. Per-mode state (stored camera frame, flow, rain random
    /// stream) starts over; particles are kept.
    pub fn set_mode(&mut self, mode: EffectMode) {
        if mode == self.config.mode {
            return;
        }
        self.config.mode = mode;
        self.estimator.reset();
        self.flow = None;
        self.mode_switches += 1;
        self.rain_rng = SmallRng::seed_from_u64(self.config.seed.wrapping_add(1).wrapping_add(self.mode_switches));
        log::info!("Switched to {:?} mode", mode);
    }

    pub fn config(&self) -> &EffectConfig {
        &self.config
    }

    /// Apply a new config between ticks.
    ///
    /// Changed grid resolutions rebuild the affected component. A changed
    /// pool capacity starts a new, empty pool.
    pub fn set_config(&mut self, config: EffectConfig) -> Result<(), StageError> {
        let config = config.clamped();
        let old = std::mem::replace(&mut self.config, config);
        let new = &self.config;

        if (new.layer_width, new.layer_height) != (old.layer_width, old.layer_height) {
            self.output = Layer::new(new.layer_width, new.layer_height)?;
            self.particle_layer = Layer::new(new.layer_width, new.layer_height)?;
            self.streak = build_streak(new.layer_width, new.layer_height);
            self.particles.set_bounds(self.output.size());
            self.capture_scaled = None;
        }
        if (new.flow.width, new.flow.height) != (old.flow.width, old.flow.height) {
            self.estimator.reset();
            self.flow = None;
        }
        if (new.fluid.width, new.fluid.height) != (old.fluid.width, old.fluid.height) {
            log::debug!("Rebuilding fluid at {}x{}", new.fluid.width, new.fluid.height);
            self.fluid = FluidSolver::new(new.fluid.width, new.fluid.height);
        }
        if new.particles.capacity != old.particles.capacity || new.seed != old.seed {
            self.particles = ParticleSystem::new(new.particles.capacity, self.output.size(), new.seed);
        }
        if new.mode != old.mode {
            // set_mode only resets when the mode differs from the stored one
            let mode = new.mode;
            self.config.mode = old.mode;
            self.set_mode(mode);
        }

        let new = &self.config;
        self.estimator.set_params(new.flow.farneback);
        self.fluid.set_params(new.fluid.solver);
        self.particles.set_color(new.particles.color);
        self.particles.set_aging(new.particles.aging);
        self.spawn_policy = new.particles.spawn_policy();
        if let Some(streak) = &mut self.streak {
            streak.set_params(new.streak);
        }
        self.mirror = Mirror::new(new.draw.flip_horizontal, new.draw.flip_vertical);
        if new.clip != old.clip {
            self.clip = new.clip;
        }
        Ok(())
    }

    pub fn clip(&self) -> ClipRect {
        self.clip
    }

    pub fn set_clip(&mut self, clip: ClipRect) {
        self.clip = clip.normalized();
        self.config.clip = self.clip;
    }

    /// Begin a pointer drag at a normalized position.
    pub fn drag_start(&mut self, pos: Vec2) {
        self.drag_origin = Some(pos);
    }

    /// Extend the drag; the clip rectangle follows it.
    pub fn drag_update(&mut self, pos: Vec2) {
        if let Some(origin) = self.drag_origin {
            self.set_clip(ClipRect::from_drag(origin, pos));
        }
    }

    /// Finish the drag.
    pub fn drag_end(&mut self, pos: Vec2) {
        self.drag_update(pos);
        self.drag_origin = None;
    }

    /// Flow from the last estimated camera frame pair.
    pub fn flow(&self) -> Option<&FlowField> {
        self.flow.as_ref()
    }

    /// The last camera frame, at its original resolution.
    pub fn capture(&self) -> Option<&RgbImage> {
        self.capture.as_ref()
    }

    pub fn fluid(&self) -> &FluidSolver {
        &self.fluid
    }

    pub fn particles(&self) -> &ParticleSystem {
        &self.particles
    }

    /// The most recently rendered image.
    pub fn output(&self) -> &Layer {
        &self.output
    }

    /// Run one tick. `time` is the elapsed time in seconds.
    ///
    /// Does nothing while the effect is deactivated.
    pub fn tick(&mut self, time: f64) {
        if !self.active {
            return;
        }
        match self.config.mode {
            EffectMode::Interactive => self.interactive_tick(),
            EffectMode::Rain => self.rain_tick(),
        }

        self.fluid.step();
        self.particles.set_aging(self.config.particles.aging);
        self.particles.update(time, Some(&self.fluid));
    }

    fn interactive_tick(&mut self) {
        let Some(image) = self.source.next_frame() else {
            return;
        };
        let frame = Frame::from_rgb(&image, self.config.flow.width, self.config.flow.height);
        self.capture = Some(image);
        self.capture_scaled = None;
        self.flow = self.estimator.estimate(frame);

        if !self.config.fluid.enabled {
            return;
        }
        let Some(flow) = self.flow.take() else {
            return;
        };

        let size = Vec2::new(flow.width() as f32, flow.height() as f32);
        let x_range = (self.clip.x1 * size.x).round() as u32..(self.clip.x2 * size.x).round() as u32;
        let y_range = (self.clip.y1 * size.y).round() as u32..(self.clip.y2 * size.y).round() as u32;
        let multiplier = self.config.flow.multiplier;
        for y in y_range {
            for x in x_range.clone() {
                let p = (Vec2::new(x as f32, y as f32) + 0.5) / size;
                let v = flow.get(x, y) / size * multiplier;
                self.add_to_fluid(p, v, true);
            }
        }
        self.flow = Some(flow);
    }

    fn rain_tick(&mut self) {
        if !self.config.fluid.enabled {
            return;
        }
        if self.rain_rng.gen_range(0..RAIN_CEILING) >= self.config.particles.count_max {
            return;
        }

        // One falling drop
        let p = Vec2::new(self.rain_rng.gen(), 0.0);
        let angle: f32 = self.rain_rng.gen_range(-1.0..1.0);
        if self.clip.contains_x(p.x) {
            let v = Vec2::from_angle(angle).rotate(Vec2::new(0.0, RAIN_SPEED));
            self.add_to_fluid(p, v, true);
        }

        // Keep the fluid moving
        let p = Vec2::new(self.rain_rng.gen(), self.rain_rng.gen());
        let angle = self.rain_rng.gen_range(0.0..std::f32::consts::TAU);
        let v = Vec2::from_angle(angle).rotate(Vec2::new(0.0, RAIN_SPEED));
        self.add_to_fluid(p, v, false);
    }

    /// Inject one motion event at normalized `pos` moving at normalized
    /// `vel`: particles, force and dye. Returns false if the event was
    /// discarded as noise.
    pub fn inject(&mut self, pos: Vec2, vel: Vec2) -> bool {
        self.add_to_fluid(pos, vel, true)
    }

    fn add_to_fluid(&mut self, pos: Vec2, vel: Vec2, spawn: bool) -> bool {
        if !vel.is_finite() || vel.length_squared() <= NOISE_EPSILON_SQ {
            return false;
        }
        let p = pos.clamp(Vec2::ZERO, Vec2::ONE);

        if spawn {
            let layer = self.output.size();
            let count = self.spawn_policy.count_for(vel.length(), layer.x);
            if count > 0 {
                self.particles.spawn(p * layer, count);
            }
        }
        self.fluid.add_force_at_pos(p, vel * self.config.fluid.velocity_mult);
        self.fluid.add_color_at_pos(p, self.config.fluid.color_mult);
        true
    }

    /// Compose the output image for the current state.
    pub fn render(&mut self) -> &Layer {
        let draw = self.config.draw;
        self.output.clear([0.0, 0.0, 0.0, 1.0]);

        if draw.fluid {
            let tint = self.config.fluid.color;
            let fluid = &self.fluid;
            let (nx, ny) = fluid.resolution();
            let dye = Rgba32FImage::from_fn(nx, ny, |i, j| {
                let d = fluid.dye(i, j).clamp(0.0, 1.0);
                Rgba([d * tint[0], d * tint[1], d * tint[2], 1.0])
            });
            if let Err(e) = self.output.fill_scaled(&dye) {
                log::warn!("Skipping dye layer: {}", e);
            }
        }

        if draw.particles {
            self.particle_layer.clear([0.0; 4]);
            self.particles.draw(&mut self.particle_layer);
            if let Some(streak) = &mut self.streak {
                apply_stages(&mut [streak], &mut self.particle_layer);
            }
            let result = if draw.fluid {
                self.output.composite_over(&self.particle_layer)
            } else {
                self.output.copy_from(&self.particle_layer)
            };
            if let Err(e) = result {
                log::warn!("Skipping particle layer: {}", e);
            }
        }

        if draw.capture && draw.capture_alpha > 0.0 {
            self.refresh_scaled_capture();
            if let Some(capture) = &self.capture_scaled {
                self.output.add_image(capture, draw.capture_alpha);
            }
        }

        if draw.flow {
            self.draw_flow();
        }

        apply_stages(&mut [&mut self.mirror], &mut self.output);
        &self.output
    }

    /// Resize the last camera frame to the layer, at most once per frame.
    fn refresh_scaled_capture(&mut self) {
        let Some(capture) = &self.capture else {
            return;
        };
        let (w, h) = self.output.dimensions();
        if self.capture_scaled.as_ref().is_some_and(|c| c.dimensions() == (w, h)) {
            return;
        }
        self.capture_scaled = Some(if capture.dimensions() == (w, h) {
            capture.clone()
        } else {
            imageops::resize(capture, w, h, FilterType::Triangle)
        });
    }

    /// Whether the layer-size camera frame is cached.
    pub fn has_scaled_capture(&self) -> bool {
        self.capture_scaled.is_some()
    }

    /// Raw flow vectors as white segments, one per flow cell.
    fn draw_flow(&mut self) {
        let Some(flow) = &self.flow else {
            return;
        };
        let size = Vec2::new(flow.width() as f32, flow.height() as f32);
        let to_layer = self.output.size() / size;
        let scale = self.config.flow.multiplier * self.output.size().x / size.x;
        for (x, y, v) in flow.cells() {
            let p = Vec2::new(x as f32, y as f32) + 0.5;
            self.output
                .draw_line(p * to_layer, (p + v * scale) * to_layer, [1.0; 3], 1.0, BlendMode::Replace);
        }
    }
}

fn build_streak(width: u32, height: u32) -> Option<KawaseStreak> {
    match KawaseStreak::new(width, height) {
        Ok(streak) => Some(streak),
        Err(e) => {
            log::warn!("Streak filter unavailable, bypassing: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoFrames;

    impl FrameSource for NoFrames {
        fn next_frame(&mut self) -> Option<RgbImage> {
            None
        }
    }

    fn small_config() -> EffectConfig {
        let mut config = EffectConfig::default().with_layer_size(64, 48);
        config.fluid.width = 32;
        config.fluid.height = 24;
        config.particles.capacity = 200;
        config
    }

    fn effect(config: EffectConfig) -> FluidParticlesEffect {
        FluidParticlesEffect::new(config, Box::new(NoFrames)).unwrap()
    }

    #[test]
    fn test_clip_from_drag() {
        let clip = ClipRect::from_drag(Vec2::new(0.7, 0.2), Vec2::new(0.3, 0.9));
        assert_eq!(clip, ClipRect { x1: 0.3, y1: 0.0, x2: 0.7, y2: 1.0 });
        assert!(clip.contains_x(0.5));
        assert!(!clip.contains_x(0.8));
    }

    #[test]
    fn test_drag_updates_clip() {
        let mut fx = effect(small_config());
        fx.drag_start(Vec2::new(0.2, 0.5));
        fx.drag_update(Vec2::new(0.6, 0.1));
        assert!((fx.clip().x2 - 0.6).abs() < 1e-6);
        fx.drag_end(Vec2::new(1.4, 0.1));
        assert_eq!(fx.clip().x2, 1.0);
        // No drag in progress
        fx.drag_update(Vec2::new(0.0, 0.0));
        assert!((fx.clip().x1 - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_inject_spawns_and_forces() {
        let mut config = small_config();
        config.particles.vel_mult = 30.0;
        let mut fx = effect(config);
        assert!(fx.inject(Vec2::new(0.5, 0.5), Vec2::new(0.02, 0.0)));
        assert!(!fx.particles().is_empty());
        fx.tick(0.0);
        assert!(fx.fluid().stats().avg_speed > 0.0);
        assert!(fx.fluid().stats().avg_density > 0.0);
    }

    #[test]
    fn test_noise_is_ignored() {
        let mut fx = effect(small_config());
        assert!(!fx.inject(Vec2::new(0.5, 0.5), Vec2::new(0.0005, 0.0)));
        fx.tick(0.0);
        assert!(fx.particles().is_empty());
        assert_eq!(fx.fluid().max_abs(), 0.0);
    }

    #[test]
    fn test_rain_spawns_over_time() {
        let mut fx = effect(small_config().with_mode(EffectMode::Rain));
        for i in 0..200 {
            fx.tick(i as f64 / 60.0);
        }
        assert!(fx.fluid().stats().avg_density > 0.0);
    }

    #[test]
    fn test_rain_gate_closed_at_zero_max() {
        let mut config = small_config().with_mode(EffectMode::Rain);
        config.particles.count_max = 0;
        let mut fx = effect(config);
        for i in 0..50 {
            fx.tick(i as f64);
        }
        assert!(fx.particles().is_empty());
        assert_eq!(fx.fluid().max_abs(), 0.0);
    }

    #[test]
    fn test_fluid_disabled_injects_nothing() {
        let mut config = small_config().with_mode(EffectMode::Rain);
        config.fluid.enabled = false;
        config.particles.count_max = 127;
        let mut fx = effect(config);
        for i in 0..50 {
            fx.tick(i as f64);
        }
        assert!(fx.particles().is_empty());
    }

    #[test]
    fn test_mode_switch_keeps_particles() {
        let mut config = small_config();
        config.particles.vel_mult = 1.0;
        let mut fx = effect(config);
        fx.inject(Vec2::new(0.5, 0.5), Vec2::new(0.5, 0.0));
        let live = fx.particles().len();
        fx.set_mode(EffectMode::Rain);
        fx.set_mode(EffectMode::Interactive);
        assert_eq!(fx.particles().len(), live);
    }

    #[test]
    fn test_deactivated_does_not_tick() {
        let mut fx = effect(small_config().with_mode(EffectMode::Rain));
        fx.deactivate();
        for i in 0..50 {
            fx.tick(i as f64);
        }
        assert_eq!(fx.fluid().max_abs(), 0.0);
        fx.activate();
        assert!(fx.is_active());
    }

    #[test]
    fn test_render_fluid_tint() {
        let mut config = small_config();
        config.draw.fluid = true;
        config.draw.particles = false;
        let mut fx = effect(config);
        fx.inject(Vec2::new(0.5, 0.5), Vec2::new(0.01, 0.0));
        fx.tick(0.0);
        let out = fx.render();
        let max_red = out.as_raw().chunks_exact(4).map(|p| p[0]).fold(0.0, f32::max);
        let max_blue = out.as_raw().chunks_exact(4).map(|p| p[2]).fold(0.0, f32::max);
        assert!(max_red > 0.0);
        assert!(max_blue < max_red);
    }

    #[test]
    fn test_capture_resized_once_per_frame() {
        let frames = [
            RgbImage::from_pixel(32, 24, image::Rgb([255, 0, 0])),
            RgbImage::from_pixel(32, 24, image::Rgb([0, 0, 255])),
        ];
        let mut config = small_config();
        config.draw.particles = false;
        config.draw.capture_alpha = 1.0;
        let mut fx = FluidParticlesEffect::new(config, Box::new(crate::source::FrameQueue::new(frames))).unwrap();

        fx.tick(0.0);
        assert!(!fx.has_scaled_capture());
        let red = fx.render().pixel(10, 10);
        assert!(fx.has_scaled_capture());
        assert!(red[0] > 0.99 && red[2] == 0.0);

        fx.tick(1.0);
        assert!(!fx.has_scaled_capture());
        let blue = fx.render().pixel(10, 10);
        assert!(blue[2] > 0.99 && blue[0] == 0.0);
    }

    #[test]
    fn test_set_config_rebuilds_grids() {
        let mut fx = effect(small_config());
        let mut config = fx.config().clone();
        config.fluid.width = 20;
        config.layer_width = 80;
        fx.set_config(config).unwrap();
        assert_eq!(fx.fluid().resolution(), (20, 24));
        assert_eq!(fx.render().width(), 80);
    }
}
