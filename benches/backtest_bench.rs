//! Performance benchmarks for the walk-forward comparison.
//!
//! Run with: cargo bench

use chrono::NaiveDate;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use portfolio_lab::allocators::{Allocator, MeanVarianceAllocator, RiskParityAllocator};
use portfolio_lab::analytics::MetricsConfig;
use portfolio_lab::engine::{BacktestConfig, Engine};
use portfolio_lab::estimation::{Estimator, EstimatorConfig, Shrinkage};
use portfolio_lab::sensitivity::{SensitivityAnalysis, SensitivityConfig};
use portfolio_lab::significance::{SignificanceConfig, SignificanceTester};
use portfolio_lab::types::{ReturnMatrix, RiskFreeRate, WeightBounds};
use portfolio_lab::walkforward::{EstimationWindow, WalkForwardConfig};

/// Generate a synthetic monthly return matrix for benchmarking.
fn generate_returns(months: usize, assets: usize) -> ReturnMatrix {
    let dates = (0..months)
        .map(|i| NaiveDate::from_ymd_opt(1990 + (i / 12) as i32, (i % 12) as u32 + 1, 1).unwrap())
        .collect();
    let names = (0..assets).map(|j| format!("A{}", j)).collect();
    let rows = (0..months)
        .map(|i| {
            let t = i as f64;
            (0..assets)
                .map(|j| {
                    let k = j as f64 + 1.0;
                    0.004 + 0.001 * k + 0.01 * k.sqrt() * (t * (0.3 + 0.17 * k)).sin()
                        + 0.008 * (t * 0.9 + k).cos()
                })
                .collect()
        })
        .collect();
    ReturnMatrix::new(dates, names, rows).unwrap()
}

/// Benchmark covariance estimation.
fn bench_estimation(c: &mut Criterion) {
    let mut group = c.benchmark_group("estimation");
    let window = EstimationWindow::new(0, 60);

    for assets in [5, 10, 25].iter() {
        let matrix = generate_returns(60, *assets);

        group.bench_with_input(BenchmarkId::new("sample", assets), &matrix, |b, matrix| {
            let estimator = Estimator::new(EstimatorConfig::default());
            b.iter(|| estimator.estimate(black_box(matrix), &window))
        });

        group.bench_with_input(BenchmarkId::new("ledoit_wolf", assets), &matrix, |b, matrix| {
            let estimator = Estimator::new(EstimatorConfig {
                shrinkage: Shrinkage::Auto,
                ..Default::default()
            });
            b.iter(|| estimator.estimate(black_box(matrix), &window))
        });
    }

    group.finish();
}

/// Benchmark the weight solvers.
fn bench_allocators(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocators");

    for assets in [5, 10, 25].iter() {
        let matrix = generate_returns(60, *assets);
        let estimate = Estimator::new(EstimatorConfig {
            shrinkage: Shrinkage::Auto,
            ..Default::default()
        })
        .estimate(&matrix, &EstimationWindow::new(0, 60))
        .unwrap();

        let mv = MeanVarianceAllocator::new(WeightBounds::default());
        group.bench_with_input(BenchmarkId::new("mean_variance", assets), &estimate, |b, e| {
            b.iter(|| mv.allocate(black_box(e), 0.002))
        });

        let rp = RiskParityAllocator::new(WeightBounds::default());
        group.bench_with_input(BenchmarkId::new("risk_parity", assets), &estimate, |b, e| {
            b.iter(|| rp.allocate(black_box(e), 0.002))
        });
    }

    group.finish();
}

/// Benchmark full walk-forward runs.
fn bench_backtest(c: &mut Criterion) {
    let mut group = c.benchmark_group("backtest");

    for months in [120, 240, 480].iter() {
        let matrix = generate_returns(*months, 10);

        group.bench_with_input(BenchmarkId::new("three_strategies", months), &matrix, |b, matrix| {
            let engine = Engine::new(BacktestConfig {
                schedule: WalkForwardConfig::new(36, 3),
                ..Default::default()
            });
            b.iter(|| engine.run(black_box(matrix), &RiskFreeRate::Annual(0.03)))
        });
    }

    group.finish();
}

/// Benchmark the significance tests.
fn bench_significance(c: &mut Criterion) {
    let mut group = c.benchmark_group("significance");
    group.sample_size(20);

    let matrix = generate_returns(240, 2);
    let a = matrix.column(0);
    let b = matrix.column(1);

    for iterations in [500, 2000, 5000].iter() {
        let tester = SignificanceTester::new(SignificanceConfig::default().with_iterations(*iterations));
        group.bench_with_input(BenchmarkId::new("block_bootstrap", iterations), iterations, |bench, _| {
            bench.iter(|| tester.bootstrap(black_box(&a), black_box(&b)))
        });
    }

    group.finish();
}

/// Benchmark the parameter sweep.
fn bench_sensitivity(c: &mut Criterion) {
    let mut group = c.benchmark_group("sensitivity");
    group.sample_size(10); // Fewer samples for slow benchmarks

    let matrix = generate_returns(240, 8);
    let base = BacktestConfig::default();
    let grid = SensitivityConfig::default();

    group.bench_function("default_grid_240x8", |b| {
        b.iter(|| {
            SensitivityAnalysis::run(
                &base,
                &grid,
                black_box(&matrix),
                &RiskFreeRate::Annual(0.03),
                &MetricsConfig::default(),
            )
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_estimation,
    bench_allocators,
    bench_backtest,
    bench_significance,
    bench_sensitivity,
);

criterion_main!(benches);
