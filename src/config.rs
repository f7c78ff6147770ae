//! Typed effect configuration.
//!
//! [`EffectConfig`] gathers every tunable of the pipeline. It is plain data:
//! the viewer edits it, [`EffectConfig::clamped`] brings it into range and
//! [`FluidParticlesEffect::set_config`](crate::FluidParticlesEffect::set_config)
//! hands the values to each component.
//!
//! Configs round-trip through JSON. Missing fields take their defaults, so a
//! file only needs to list what it changes:
//!
//! ```json
//! { "mode": "Rain", "fluid": { "solver": { "vorticity_confinement": true } } }
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::effect::{ClipRect, EffectMode};
use crate::error::ConfigError;
use crate::flow::FarnebackParams;
use crate::fluid::FluidParams;
use crate::particles::{SpawnPolicy, DEFAULT_AGING, DEFAULT_CAPACITY, MAX_AGING, MIN_AGING};
use crate::streak::StreakParams;

/// Motion estimation settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Estimator resolution; camera frames are resized to it.
    pub width: u32,
    pub height: u32,
    /// Scale applied to normalized flow before it drives the fluid.
    pub multiplier: f32,
    pub farneback: FarnebackParams,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            width: 160,
            height: 120,
            multiplier: 0.105,
            farneback: FarnebackParams::default(),
        }
    }
}

/// Fluid grid settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FluidConfig {
    /// When false, motion and rain inject nothing.
    pub enabled: bool,
    pub width: u32,
    pub height: u32,
    pub solver: FluidParams,
    /// Tint applied to the dye when drawn.
    pub color: [f32; 3],
    /// Scale from event velocity to fluid force.
    pub velocity_mult: f32,
    /// Dye added per event.
    pub color_mult: f32,
}

impl Default for FluidConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            width: 160,
            height: 120,
            solver: FluidParams::default(),
            color: [1.0, 0.05, 0.01],
            velocity_mult: 10.0,
            color_mult: 0.5,
        }
    }
}

/// Particle pool and spawn settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParticleConfig {
    pub capacity: usize,
    /// Alpha multiplier per tick.
    pub aging: f32,
    pub count_min: u32,
    /// Also the rain spawn gate: a drop falls when a roll below 128 is
    /// under this value.
    pub count_max: u32,
    pub vel_mult: f32,
    pub vel_min: f32,
    pub vel_max: f32,
    pub color: [f32; 3],
}

impl Default for ParticleConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            aging: DEFAULT_AGING,
            count_min: 0,
            count_max: 25,
            vel_mult: 0.57,
            vel_min: 1.0,
            vel_max: 60.0,
            color: [1.0, 1.0, 1.0],
        }
    }
}

impl ParticleConfig {
    pub fn spawn_policy(&self) -> SpawnPolicy {
        SpawnPolicy {
            vel_mult: self.vel_mult,
            vel_min: self.vel_min,
            vel_max: self.vel_max,
            count_min: self.count_min,
            count_max: self.count_max,
        }
    }
}

/// What ends up in the output image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrawConfig {
    pub fluid: bool,
    pub particles: bool,
    /// Additive camera passthrough.
    pub capture: bool,
    pub capture_alpha: f32,
    /// Debug overlay of raw flow vectors.
    pub flow: bool,
    pub flip_horizontal: bool,
    pub flip_vertical: bool,
}

impl Default for DrawConfig {
    fn default() -> Self {
        Self {
            fluid: false,
            particles: true,
            capture: true,
            capture_alpha: 0.1,
            flow: false,
            flip_horizontal: true,
            flip_vertical: true,
        }
    }
}

/// Complete effect configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectConfig {
    pub mode: EffectMode,
    /// Seed for every random decision of the effect.
    pub seed: u64,
    /// Size of the particle and output layers.
    pub layer_width: u32,
    pub layer_height: u32,
    /// Initial active region for motion input.
    pub clip: ClipRect,
    pub flow: FlowConfig,
    pub fluid: FluidConfig,
    pub particles: ParticleConfig,
    pub streak: StreakParams,
    pub draw: DrawConfig,
}

impl Default for EffectConfig {
    fn default() -> Self {
        Self {
            mode: EffectMode::Interactive,
            seed: 0x5eed,
            layer_width: 1024,
            layer_height: 768,
            clip: ClipRect::default(),
            flow: FlowConfig::default(),
            fluid: FluidConfig::default(),
            particles: ParticleConfig::default(),
            streak: StreakParams::default(),
            draw: DrawConfig::default(),
        }
    }
}

impl EffectConfig {
    /// Builder method to set the mode.
    pub fn with_mode(mut self, mode: EffectMode) -> Self {
        self.mode = mode;
        self
    }

    /// Builder method to set the seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Builder method to set the output layer size.
    pub fn with_layer_size(mut self, width: u32, height: u32) -> Self {
        self.layer_width = width;
        self.layer_height = height;
        self
    }

    /// Bring every value into the range the pipeline supports.
    pub fn clamped(mut self) -> Self {
        self.layer_width = self.layer_width.clamp(16, crate::frame::MAX_LAYER_DIMENSION);
        self.layer_height = self.layer_height.clamp(16, crate::frame::MAX_LAYER_DIMENSION);
        self.clip = self.clip.normalized();

        let flow = &mut self.flow;
        flow.width = flow.width.clamp(20, 640);
        flow.height = flow.height.clamp(20, 480);
        flow.multiplier = finite_or(flow.multiplier, 0.0).max(0.0);
        flow.farneback = flow.farneback.clamped();

        let fluid = &mut self.fluid;
        fluid.width = fluid.width.clamp(16, 512);
        fluid.height = fluid.height.clamp(16, 512);
        fluid.solver = fluid.solver.clamped();
        fluid.velocity_mult = finite_or(fluid.velocity_mult, 0.0);
        fluid.color_mult = finite_or(fluid.color_mult, 0.0).max(0.0);
        for c in &mut fluid.color {
            *c = finite_or(*c, 0.0).clamp(0.0, 1.0);
        }

        let particles = &mut self.particles;
        particles.capacity = particles.capacity.clamp(1, 100_000);
        particles.aging = finite_or(particles.aging, DEFAULT_AGING).clamp(MIN_AGING, MAX_AGING);
        particles.count_max = particles.count_max.min(500);
        particles.count_min = particles.count_min.min(particles.count_max);
        particles.vel_mult = finite_or(particles.vel_mult, 0.0).max(0.0);
        for c in &mut particles.color {
            *c = finite_or(*c, 1.0).clamp(0.0, 1.0);
        }

        self.streak = self.streak.clamped();
        self.draw.capture_alpha = finite_or(self.draw.capture_alpha, 0.0).clamp(0.0, 1.0);
        self
    }

    /// Load a config from a JSON file. The result is clamped.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config: EffectConfig = serde_json::from_str(&text)?;
        Ok(config.clamped())
    }

    /// Write the config as pretty-printed JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text)?;
        Ok(())
    }
}

fn finite_or(v: f32, fallback: f32) -> f32 {
    if v.is_finite() {
        v
    } else {
        fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_effect_defaults() {
        let config = EffectConfig::default();
        assert_eq!((config.flow.width, config.flow.height), (160, 120));
        assert!((config.flow.multiplier - 0.105).abs() < 1e-6);
        assert!((config.fluid.solver.fade_speed - 0.012).abs() < 1e-6);
        assert!(config.fluid.solver.wrap_x && config.fluid.solver.wrap_y);
        assert!((config.particles.aging - 0.97).abs() < 1e-6);
        assert_eq!(config.streak.iterations, 8);
        assert!(!config.draw.fluid && config.draw.particles && config.draw.capture);
        assert!(config.draw.flip_horizontal && config.draw.flip_vertical);
        assert_eq!(config.clone().clamped(), config);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EffectConfig =
            serde_json::from_str(r#"{ "mode": "Rain", "fluid": { "solver": { "delta_t": 0.2 } } }"#).unwrap();
        assert_eq!(config.mode, EffectMode::Rain);
        assert!((config.fluid.solver.delta_t - 0.2).abs() < 1e-6);
        assert!((config.fluid.solver.fade_speed - 0.012).abs() < 1e-6);
        assert_eq!(config.particles.capacity, DEFAULT_CAPACITY);
    }

    #[test]
    fn test_clamped_ranges() {
        let mut config = EffectConfig::default();
        config.fluid.solver.viscosity = 5.0;
        config.particles.aging = 1.5;
        config.streak.iterations = 100;
        config.flow.width = 4;
        config.particles.count_min = 90;
        config.particles.count_max = 10;
        let config = config.clamped();
        assert!(config.fluid.solver.viscosity < 1.0);
        assert!(config.particles.aging < 1.0);
        assert_eq!(config.streak.iterations, 32);
        assert_eq!(config.flow.width, 20);
        assert_eq!(config.particles.count_min, 10);
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("lumenflow-config-{}.json", std::process::id()));
        let config = EffectConfig::default().with_mode(EffectMode::Rain).with_seed(9);
        config.save(&path).unwrap();
        let loaded = EffectConfig::load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_file() {
        let err = EffectConfig::load("/nonexistent/lumenflow.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
