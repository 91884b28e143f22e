//! Parameter Sensitivity Analysis
//!
//! Re-runs the walk-forward comparison over a grid of estimation window
//! lengths, rebalance frequencies and shrinkage settings, to show whether a
//! strategy ranking survives reasonable changes to the backtest setup.
//!
//! All grid points start trading at the same row (the longest window in the
//! grid, unless the base configuration pins a first rebalance), so their
//! Sharpe ratios cover the same months.
//!
//! # Example
//!
//! ```no_run
//! use portfolio_lab::analytics::MetricsConfig;
//! use portfolio_lab::engine::BacktestConfig;
//! use portfolio_lab::sensitivity::{SensitivityAnalysis, SensitivityConfig};
//! use portfolio_lab::types::RiskFreeRate;
//! # fn load() -> portfolio_lab::types::ReturnMatrix { unimplemented!() }
//!
//! let matrix = load();
//! let grid = SensitivityConfig::new()
//!     .with_windows(vec![12, 24, 36])
//!     .with_frequencies(vec![3, 6, 12]);
//! let analysis = SensitivityAnalysis::run(
//!     &BacktestConfig::default(),
//!     &grid,
//!     &matrix,
//!     &RiskFreeRate::Annual(0.06),
//!     &MetricsConfig::default(),
//! )
//! .unwrap();
//! println!("{}", analysis.to_csv());
//! ```

use crate::analytics::{mean, sample_std, MetricSet, MetricsConfig};
use crate::engine::{BacktestConfig, Engine};
use crate::error::{BacktestError, Result};
use crate::estimation::Shrinkage;
use crate::types::{ReturnMatrix, RiskFreeRate, StrategyKind};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Grid of backtest settings to sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensitivityConfig {
    /// Estimation window lengths, in periods.
    pub windows: Vec<usize>,
    /// Rebalance frequencies, in periods.
    pub frequencies: Vec<usize>,
    pub shrinkages: Vec<Shrinkage>,
}

impl Default for SensitivityConfig {
    fn default() -> Self {
        Self {
            windows: vec![12, 24, 36],
            frequencies: vec![3, 6, 12],
            shrinkages: vec![Shrinkage::None, Shrinkage::Auto],
        }
    }
}

impl SensitivityConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_windows(mut self, windows: Vec<usize>) -> Self {
        self.windows = windows;
        self
    }

    pub fn with_frequencies(mut self, frequencies: Vec<usize>) -> Self {
        self.frequencies = frequencies;
        self
    }

    pub fn with_shrinkages(mut self, shrinkages: Vec<Shrinkage>) -> Self {
        self.shrinkages = shrinkages;
        self
    }

    pub fn num_combinations(&self) -> usize {
        self.windows.len() * self.frequencies.len() * self.shrinkages.len()
    }

    /// All `(window, frequency, shrinkage)` combinations in grid order.
    pub fn generate_combinations(&self) -> Vec<(usize, usize, Shrinkage)> {
        let mut combinations = Vec::with_capacity(self.num_combinations());
        for &window in &self.windows {
            for &frequency in &self.frequencies {
                for &shrinkage in &self.shrinkages {
                    combinations.push((window, frequency, shrinkage));
                }
            }
        }
        combinations
    }
}

/// Net metrics for every strategy at one grid point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensitivityPoint {
    pub estimation_window: usize,
    pub rebalance_frequency: usize,
    pub shrinkage: Shrinkage,
    pub metrics: Vec<(StrategyKind, MetricSet)>,
}

impl SensitivityPoint {
    pub fn shrinkage_label(&self) -> String {
        shrinkage_label(self.shrinkage)
    }

    pub fn sharpe(&self, strategy: StrategyKind) -> Option<f64> {
        self.metrics
            .iter()
            .find(|(kind, _)| *kind == strategy)
            .map(|(_, m)| m.sharpe_ratio)
    }
}

/// Short label for a shrinkage setting.
pub fn shrinkage_label(shrinkage: Shrinkage) -> String {
    match shrinkage {
        Shrinkage::None => "none".to_string(),
        Shrinkage::Auto => "auto".to_string(),
        Shrinkage::Fixed(intensity) => format!("{:.2}", intensity),
    }
}

/// Spread of one strategy's Sharpe ratio across the grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyStability {
    pub strategy: StrategyKind,
    pub mean_sharpe: f64,
    pub std_sharpe: f64,
    pub min_sharpe: f64,
    pub max_sharpe: f64,
}

impl StrategyStability {
    /// Coefficient of variation of the Sharpe ratio.
    pub fn variation(&self) -> f64 {
        if self.mean_sharpe.abs() < 1e-12 {
            return f64::INFINITY;
        }
        self.std_sharpe / self.mean_sharpe.abs()
    }
}

/// Complete sensitivity analysis results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensitivityAnalysis {
    pub points: Vec<SensitivityPoint>,
    /// Grid points skipped for lack of history, as `(window, frequency)`.
    pub skipped: Vec<(usize, usize)>,
    pub stability: Vec<StrategyStability>,
}

impl SensitivityAnalysis {
    /// Run the full engine at every grid point in parallel.
    pub fn run(
        base: &BacktestConfig,
        grid: &SensitivityConfig,
        matrix: &ReturnMatrix,
        risk_free: &RiskFreeRate,
        metrics_config: &MetricsConfig,
    ) -> Result<Self> {
        let combinations = grid.generate_combinations();
        if combinations.is_empty() {
            return Err(BacktestError::ConfigError(
                "Sensitivity grid is empty".to_string(),
            ));
        }
        let first_rebalance = base
            .schedule
            .first_rebalance
            .or_else(|| grid.windows.iter().max().copied());

        info!("Sensitivity sweep over {} grid points", combinations.len());

        let outcomes: Vec<Result<SensitivityPoint>> = combinations
            .par_iter()
            .map(|&(window, frequency, shrinkage)| {
                let mut config = base.clone();
                config.schedule.estimation_window = window;
                config.schedule.rebalance_frequency = frequency;
                config.schedule.first_rebalance = first_rebalance.map(|row| row.max(window));
                config.estimator.shrinkage = shrinkage;

                let run = Engine::new(config.clone()).run(matrix, risk_free)?;
                let metrics = run
                    .strategies
                    .iter()
                    .map(|s| (s.strategy, MetricSet::compute(&s.net(config.cost_bps), metrics_config)))
                    .collect();
                Ok(SensitivityPoint {
                    estimation_window: window,
                    rebalance_frequency: frequency,
                    shrinkage,
                    metrics,
                })
            })
            .collect();

        let mut points = Vec::new();
        let mut skipped = Vec::new();
        for ((window, frequency, shrinkage), outcome) in combinations.into_iter().zip(outcomes) {
            match outcome {
                Ok(point) => points.push(point),
                Err(e @ BacktestError::InsufficientHistory { .. }) => {
                    warn!(
                        "Skipping window {} / frequency {} / shrinkage {}: {}",
                        window,
                        frequency,
                        shrinkage_label(shrinkage),
                        e
                    );
                    skipped.push((window, frequency));
                }
                Err(e) => return Err(e),
            }
        }

        let stability = stability_summary(&points, &base.strategies);
        Ok(Self {
            points,
            skipped,
            stability,
        })
    }

    /// Grid point with the highest Sharpe ratio for `strategy`.
    pub fn best_point(&self, strategy: StrategyKind) -> Option<&SensitivityPoint> {
        self.points
            .iter()
            .filter_map(|p| p.sharpe(strategy).map(|s| (p, s)))
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(p, _)| p)
    }

    pub fn stability_of(&self, strategy: StrategyKind) -> Option<&StrategyStability> {
        self.stability.iter().find(|s| s.strategy == strategy)
    }

    /// A strategy is fragile when its Sharpe coefficient of variation exceeds `threshold`.
    pub fn is_fragile(&self, strategy: StrategyKind, threshold: f64) -> bool {
        self.stability_of(strategy)
            .map(|s| s.variation() > threshold)
            .unwrap_or(false)
    }

    /// Export results to CSV
    pub fn to_csv(&self) -> String {
        let mut csv = String::from(
            "estimation_window,rebalance_frequency,shrinkage,strategy,sharpe,annualized_return,max_drawdown\n",
        );
        for point in &self.points {
            for (kind, metrics) in &point.metrics {
                csv.push_str(&format!(
                    "{},{},{},{},{:.6},{:.6},{:.6}\n",
                    point.estimation_window,
                    point.rebalance_frequency,
                    point.shrinkage_label(),
                    kind.label(),
                    metrics.sharpe_ratio,
                    metrics.annualized_return,
                    metrics.max_drawdown
                ));
            }
        }
        csv
    }
}

fn stability_summary(points: &[SensitivityPoint], strategies: &[StrategyKind]) -> Vec<StrategyStability> {
    strategies
        .iter()
        .filter_map(|&strategy| {
            let sharpes: Vec<f64> = points.iter().filter_map(|p| p.sharpe(strategy)).collect();
            if sharpes.is_empty() {
                return None;
            }
            Some(StrategyStability {
                strategy,
                mean_sharpe: mean(&sharpes),
                std_sharpe: sample_std(&sharpes),
                min_sharpe: sharpes.iter().cloned().fold(f64::INFINITY, f64::min),
                max_sharpe: sharpes.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            })
        })
        .collect()
}
