//! Pooled particles driven by the fluid.
//!
//! [`ParticleSystem`] owns a fixed-capacity pool. Dead slots are kept on a
//! free stack, so spawning and reclaiming never allocate. When the pool is
//! full, spawn requests that do not fit are dropped; live particles are never
//! evicted.
//!
//! Particle positions are in output-layer pixels. Each update blends the
//! sampled fluid velocity (scaled by the particle's mass) with half of the
//! previous velocity, moves the particle, bounces it off the layer edges and
//! multiplies its alpha by the aging factor. Particles whose alpha drops
//! below [`ALPHA_EPSILON`] return to the pool.
//!
//! # Example
//!
//! ```ignore
//! let mut particles = ParticleSystem::new(5000, Vec2::new(1024.0, 768.0), 42);
//! particles.set_aging(0.97);
//! particles.spawn(Vec2::new(512.0, 384.0), 10);
//! particles.update(time.elapsed(), Some(&fluid));
//! particles.draw(&mut layer);
//! ```

use glam::Vec2;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::fluid::VelocitySampler;
use crate::frame::{BlendMode, Layer};

/// Default pool size.
pub const DEFAULT_CAPACITY: usize = 5000;

/// Share of the fluid velocity picked up per unit of mass.
pub const FLUID_FORCE: f32 = 0.6;

/// Share of the previous velocity kept each update.
pub const MOMENTUM: f32 = 0.5;

/// Particles below this alpha are reclaimed.
pub const ALPHA_EPSILON: f32 = 0.01;

/// Alpha multiplier applied every update unless configured.
pub const DEFAULT_AGING: f32 = 0.97;

/// Aging factors are kept in this range so particles always fade out.
pub const MIN_AGING: f32 = 0.01;
pub const MAX_AGING: f32 = 0.999;

/// Seconds a new particle takes to cool from white to the pool colour.
const COOL_DOWN: f64 = 0.5;

/// Spawn positions scatter this far (in pixels) around the request point.
const SPAWN_JITTER: f32 = 10.0;

/// A single pooled particle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Particle {
    /// Position in layer pixels.
    pub position: Vec2,
    /// Displacement per tick in layer pixels.
    pub velocity: Vec2,
    /// Opacity, decays every update.
    pub alpha: f32,
    /// How strongly the fluid drags this particle.
    pub mass: f32,
    /// Time the particle was spawned, in seconds.
    pub born: f64,
    pub alive: bool,
}

impl Default for Particle {
    fn default() -> Self {
        Self {
            position: Vec2::ZERO,
            velocity: Vec2::ZERO,
            alpha: 0.0,
            mass: 1.0,
            born: 0.0,
            alive: false,
        }
    }
}

impl Particle {
    /// Seconds since spawn.
    pub fn age(&self, now: f64) -> f64 {
        (now - self.born).max(0.0)
    }

    /// Draw colour at `now`: white at spawn, cooling to `base` over
    /// [`COOL_DOWN`] seconds, then dimmed by alpha.
    pub fn color(&self, base: [f32; 3], now: f64) -> [f32; 3] {
        let heat = (1.0 - self.age(now) / COOL_DOWN).clamp(0.0, 1.0) as f32;
        base.map(|c| (c + (1.0 - c) * heat) * self.alpha)
    }
}

/// Maps event speed to how many particles an event spawns.
///
/// `speed * vel_mult * layer_width` is mapped linearly from
/// `vel_min..vel_max` onto `count_min..count_max` and clamped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpawnPolicy {
    pub vel_mult: f32,
    pub vel_min: f32,
    pub vel_max: f32,
    pub count_min: u32,
    pub count_max: u32,
}

impl Default for SpawnPolicy {
    fn default() -> Self {
        Self {
            vel_mult: 0.57,
            vel_min: 1.0,
            vel_max: 60.0,
            count_min: 0,
            count_max: 25,
        }
    }
}

impl SpawnPolicy {
    /// Particle count for an event moving at `speed` normalized units per tick.
    pub fn count_for(&self, speed: f32, layer_width: f32) -> usize {
        let v = speed * self.vel_mult * layer_width;
        let (lo, hi) = (self.count_min as f32, self.count_max as f32);
        let span = self.vel_max - self.vel_min;
        let count = if span.abs() < f32::EPSILON {
            if v < self.vel_min {
                lo
            } else {
                hi
            }
        } else {
            lo + (v - self.vel_min) / span * (hi - lo)
        };
        if !count.is_finite() {
            return 0;
        }
        count.clamp(lo.min(hi), lo.max(hi)) as usize
    }
}

/// Fixed-capacity particle pool.
pub struct ParticleSystem {
    particles: Vec<Particle>,
    free: Vec<usize>,
    bounds: Vec2,
    aging: f32,
    color: [f32; 3],
    time: f64,
    rng: SmallRng,
}

impl ParticleSystem {
    /// An empty pool of `capacity` slots for a layer of size `bounds`.
    pub fn new(capacity: usize, bounds: Vec2, seed: u64) -> Self {
        Self {
            particles: vec![Particle::default(); capacity],
            // Reversed so slot 0 is handed out first
            free: (0..capacity).rev().collect(),
            bounds,
            aging: DEFAULT_AGING,
            color: [1.0, 1.0, 1.0],
            time: 0.0,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Builder method to set the draw color.
    pub fn with_color(mut self, color: [f32; 3]) -> Self {
        self.color = color;
        self
    }

    pub fn capacity(&self) -> usize {
        self.particles.len()
    }

    /// Number of live particles.
    pub fn len(&self) -> usize {
        self.particles.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.free.is_empty()
    }

    pub fn bounds(&self) -> Vec2 {
        self.bounds
    }

    /// Change the layer size particles live in. Live particles are kept.
    pub fn set_bounds(&mut self, bounds: Vec2) {
        self.bounds = bounds;
    }

    pub fn aging(&self) -> f32 {
        self.aging
    }

    /// Per-update alpha multiplier, clamped to `[MIN_AGING, MAX_AGING]`.
    /// Non-finite values fall back to the default.
    pub fn set_aging(&mut self, aging: f32) {
        self.aging = if aging.is_finite() {
            aging.clamp(MIN_AGING, MAX_AGING)
        } else {
            DEFAULT_AGING
        };
    }

    pub fn set_color(&mut self, color: [f32; 3]) {
        self.color = color;
    }

    /// Time passed to the last [`update`](Self::update).
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Live particles.
    pub fn iter(&self) -> impl Iterator<Item = &Particle> {
        self.particles.iter().filter(|p| p.alive)
    }

    /// Kill every particle.
    pub fn clear(&mut self) {
        for p in &mut self.particles {
            p.alive = false;
        }
        self.free = (0..self.particles.len()).rev().collect();
    }

    /// Spawn up to `count` particles around `position` (layer pixels).
    ///
    /// Returns how many were created; fewer than `count` when the pool fills.
    pub fn spawn(&mut self, position: Vec2, count: usize) -> usize {
        let mut spawned = 0;
        for _ in 0..count {
            let Some(slot) = self.free.pop() else {
                log::trace!("Particle pool full, dropped {} spawns", count - spawned);
                break;
            };
            let jitter = Vec2::new(
                self.rng.gen_range(-SPAWN_JITTER..=SPAWN_JITTER),
                self.rng.gen_range(-SPAWN_JITTER..=SPAWN_JITTER),
            );
            let velocity = Vec2::new(self.rng.gen_range(-0.5..=0.5), self.rng.gen_range(-0.5..=0.5));
            self.particles[slot] = Particle {
                position: (position + jitter).clamp(Vec2::ZERO, self.bounds),
                velocity,
                alpha: self.rng.gen_range(0.3..=1.0),
                mass: self.rng.gen_range(0.1..=1.0),
                born: self.time,
                alive: true,
            };
            spawned += 1;
        }
        spawned
    }

    /// Advance every live particle by one tick.
    ///
    /// With a `field`, velocity follows the fluid. Without one, particles
    /// keep moving ballistically.
    pub fn update(&mut self, time: f64, field: Option<&dyn VelocitySampler>) {
        self.time = time;
        let bounds = self.bounds;
        let inv_bounds = Vec2::ONE / bounds.max(Vec2::ONE);

        for (slot, p) in self.particles.iter_mut().enumerate() {
            if !p.alive {
                continue;
            }

            if let Some(field) = field {
                let fluid = field.sample_velocity(p.position * inv_bounds);
                p.velocity = fluid * (p.mass * FLUID_FORCE) * bounds + p.velocity * MOMENTUM;
            }
            if !p.velocity.is_finite() {
                p.velocity = Vec2::ZERO;
            }
            p.position += p.velocity;

            if p.position.x < 0.0 {
                p.position.x = 0.0;
                p.velocity.x = -p.velocity.x;
            } else if p.position.x > bounds.x {
                p.position.x = bounds.x;
                p.velocity.x = -p.velocity.x;
            }
            if p.position.y < 0.0 {
                p.position.y = 0.0;
                p.velocity.y = -p.velocity.y;
            } else if p.position.y > bounds.y {
                p.position.y = bounds.y;
                p.velocity.y = -p.velocity.y;
            }

            // Keep slow particles shimmering
            if p.velocity.length_squared() < 1.0 {
                let angle = self.rng.gen_range(0.0..std::f32::consts::TAU);
                p.velocity += Vec2::from_angle(angle) * 0.5;
            }

            p.alpha *= self.aging;
            if p.alpha < ALPHA_EPSILON {
                p.alive = false;
                self.free.push(slot);
            }
        }
    }

    /// Draw every live particle as a short trail from its last position,
    /// coloured by its age.
    pub fn draw(&self, layer: &mut Layer) {
        for p in self.iter() {
            let color = p.color(self.color, self.time);
            layer.draw_line(p.position - p.velocity, p.position, color, p.alpha, BlendMode::Alpha);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Constant(Vec2);

    impl VelocitySampler for Constant {
        fn sample_velocity(&self, _pos: Vec2) -> Vec2 {
            self.0
        }
    }

    fn system(capacity: usize) -> ParticleSystem {
        ParticleSystem::new(capacity, Vec2::new(200.0, 100.0), 7)
    }

    #[test]
    fn test_spawn_respects_capacity() {
        let mut ps = system(10);
        assert_eq!(ps.spawn(Vec2::new(50.0, 50.0), 6), 6);
        assert_eq!(ps.spawn(Vec2::new(50.0, 50.0), 6), 4);
        assert!(ps.is_full());
        assert_eq!(ps.spawn(Vec2::new(50.0, 50.0), 3), 0);
        assert_eq!(ps.len(), 10);
    }

    #[test]
    fn test_spawn_initial_state() {
        let mut ps = system(100);
        ps.spawn(Vec2::new(100.0, 50.0), 100);
        for p in ps.iter() {
            assert!(p.alpha >= 0.3 && p.alpha <= 1.0);
            assert!(p.mass >= 0.1 && p.mass <= 1.0);
            assert!((p.position - Vec2::new(100.0, 50.0)).abs().max_element() <= SPAWN_JITTER + 1e-4);
        }
    }

    #[test]
    fn test_aging_decays_alpha() {
        let mut ps = system(4);
        ps.set_aging(0.9);
        ps.spawn(Vec2::new(100.0, 50.0), 4);
        let before: Vec<f32> = ps.iter().map(|p| p.alpha).collect();
        ps.update(0.0, None);
        for (p, a) in ps.iter().zip(&before) {
            assert!((p.alpha - a * 0.9).abs() < 1e-6);
        }
    }

    #[test]
    fn test_aging_stays_below_one() {
        let mut ps = system(4);
        ps.set_aging(1.0);
        assert!((ps.aging() - MAX_AGING).abs() < 1e-6);
        ps.set_aging(0.0);
        assert!((ps.aging() - MIN_AGING).abs() < 1e-6);
        ps.set_aging(f32::NAN);
        assert!((ps.aging() - DEFAULT_AGING).abs() < 1e-6);

        // Even the slowest aging strictly decays alpha
        ps.set_aging(5.0);
        ps.spawn(Vec2::new(100.0, 50.0), 1);
        let before = ps.iter().next().unwrap().alpha;
        ps.update(0.0, None);
        assert!(ps.iter().next().unwrap().alpha < before);
    }

    #[test]
    fn test_color_cools_with_age() {
        let p = Particle {
            alpha: 0.5,
            born: 2.0,
            alive: true,
            ..Default::default()
        };
        let base = [1.0, 0.2, 0.0];
        assert_eq!(p.age(1.0), 0.0);
        let hot = p.color(base, 2.0);
        assert!(hot.iter().all(|&c| (c - 0.5).abs() < 1e-6));
        let cooled = p.color(base, 2.0 + COOL_DOWN);
        assert!((cooled[0] - 0.5).abs() < 1e-6);
        assert!((cooled[1] - 0.1).abs() < 1e-6);
        assert_eq!(cooled[2], 0.0);
        let warm = p.color(base, 2.0 + COOL_DOWN * 0.5);
        assert!(warm[1] > cooled[1] && warm[1] < hot[1]);
    }

    #[test]
    fn test_particles_die_and_slots_return() {
        let mut ps = system(8);
        ps.set_aging(0.5);
        ps.spawn(Vec2::new(100.0, 50.0), 8);
        for i in 0..10 {
            ps.update(i as f64, None);
        }
        assert!(ps.is_empty());
        assert_eq!(ps.spawn(Vec2::new(10.0, 10.0), 8), 8);
    }

    #[test]
    fn test_fluid_advection() {
        let mut ps = system(1);
        ps.spawn(Vec2::new(100.0, 50.0), 1);
        let start = ps.iter().next().unwrap().position;
        ps.update(0.016, Some(&Constant(Vec2::new(0.05, 0.0))));
        let p = ps.iter().next().unwrap();
        assert!(p.position.x > start.x);
        assert!((ps.time() - 0.016).abs() < 1e-12);
    }

    #[test]
    fn test_bounce_keeps_particles_inside() {
        let mut ps = system(20);
        ps.set_aging(1.0);
        ps.spawn(Vec2::new(195.0, 95.0), 20);
        for i in 0..50 {
            ps.update(i as f64, Some(&Constant(Vec2::new(0.2, 0.3))));
        }
        for p in ps.iter() {
            assert!(p.position.x >= 0.0 && p.position.x <= 200.0);
            assert!(p.position.y >= 0.0 && p.position.y <= 100.0);
        }
    }

    #[test]
    fn test_spawn_policy_mapping() {
        let policy = SpawnPolicy {
            vel_mult: 1.0,
            vel_min: 0.0,
            vel_max: 10.0,
            count_min: 0,
            count_max: 20,
        };
        assert_eq!(policy.count_for(0.5, 10.0), 10);
        assert_eq!(policy.count_for(100.0, 10.0), 20);
        assert_eq!(policy.count_for(-1.0, 10.0), 0);
    }

    #[test]
    fn test_draw_writes_pixels() {
        let mut ps = system(1);
        ps.spawn(Vec2::new(100.0, 50.0), 1);
        let mut layer = Layer::new(200, 100).unwrap();
        ps.draw(&mut layer);
        assert!(layer.as_raw().iter().any(|&v| v > 0.0));
    }
}
