//! Benchmarks for the per-tick pipeline.
//!
//! Run with: `cargo bench`
//!
//! Budget: `tick/tick_render` at the default config should stay within one
//! 60 Hz frame (16.7 ms) on a single core in a release build. The
//! `components` group shows where the time goes when it does not.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use lumenflow::fluid::FluidSolver;
use lumenflow::prelude::*;
use lumenflow::{BlendMode, KawaseStreak, MotionEstimator, StreakParams};

fn bench_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("tick");
    group.sample_size(20);

    for mode in [EffectMode::Interactive, EffectMode::Rain] {
        group.bench_with_input(BenchmarkId::new("tick_render", format!("{:?}", mode)), &mode, |b, &mode| {
            let config = EffectConfig::default().with_mode(mode);
            let source = SyntheticSource::new(640, 480);
            let mut effect = FluidParticlesEffect::new(config, Box::new(source)).unwrap();
            let mut time = Time::fixed(1.0 / 60.0);
            b.iter(|| {
                time.update();
                effect.tick(time.elapsed());
                black_box(effect.render().width());
            })
        });
    }

    group.finish();
}

fn bench_components(c: &mut Criterion) {
    let mut group = c.benchmark_group("components");
    group.sample_size(20);

    group.bench_function("farneback_160x120", |b| {
        let source = SyntheticSource::new(160, 120);
        let frames = [source.render(0), source.render(1)].map(|f| Frame::from_rgb(&f, 160, 120));
        // Steady state: one new frame per estimate, the previous one cached
        let mut estimator = MotionEstimator::new(Default::default());
        estimator.estimate(frames[0].clone());
        let mut n = 0;
        b.iter(|| {
            n += 1;
            black_box(estimator.estimate(frames[n % 2].clone()))
        })
    });

    group.bench_function("fluid_step_160x120", |b| {
        let mut fluid = FluidSolver::new(160, 120);
        b.iter(|| {
            fluid.add_force_at_pos(Vec2::new(0.5, 0.5), Vec2::new(0.1, 0.0));
            fluid.add_color_at_pos(Vec2::new(0.5, 0.5), 1.0);
            fluid.step();
            black_box(fluid.stats())
        })
    });

    for downsample in [1, 4] {
        group.bench_with_input(BenchmarkId::new("streak_1024x768", downsample), &downsample, |b, &downsample| {
            let mut layer = Layer::new(1024, 768).unwrap();
            layer.draw_line(Vec2::new(100.0, 100.0), Vec2::new(900.0, 600.0), [1.0; 3], 1.0, BlendMode::Additive);
            let mut streak = KawaseStreak::new(1024, 768).unwrap().with_params(StreakParams {
                downsample,
                ..Default::default()
            });
            b.iter(|| {
                let mut target = layer.clone();
                black_box(streak.apply(&mut target).is_ok())
            })
        });
    }

    group.bench_function("render_1024x768", |b| {
        let mut config = EffectConfig::default();
        config.draw.fluid = true;
        let mut effect = FluidParticlesEffect::new(config, Box::new(SyntheticSource::new(640, 480))).unwrap();
        for i in 0..30 {
            effect.tick(i as f64 / 30.0);
        }
        b.iter(|| black_box(effect.render().width()))
    });

    group.finish();
}

criterion_group!(benches, bench_tick, bench_components);
criterion_main!(benches);
