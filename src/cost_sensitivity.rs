//! Transaction cost post-processing and cost scenarios.
//!
//! Costs are a flat proxy: `bps / 10_000 × turnover`, deducted from the
//! first month of the holding period that follows each rebalance. Because
//! the deduction only needs the gross series and the turnover log, any number
//! of cost levels can be evaluated without re-running estimation.
//!
//! # Example
//!
//! ```no_run
//! use portfolio_lab::cost_sensitivity::{run_cost_sensitivity_analysis, CostSensitivityConfig};
//! use portfolio_lab::analytics::MetricsConfig;
//! use portfolio_lab::engine::{BacktestConfig, Engine};
//! use portfolio_lab::types::RiskFreeRate;
//! # fn load() -> portfolio_lab::types::ReturnMatrix { unimplemented!() }
//!
//! let matrix = load();
//! let run = Engine::new(BacktestConfig::default())
//!     .run(&matrix, &RiskFreeRate::Annual(0.06))
//!     .unwrap();
//! let analysis = run_cost_sensitivity_analysis(
//!     &run.strategies,
//!     &CostSensitivityConfig::default(),
//!     &MetricsConfig::default(),
//! );
//! println!("{}", analysis.summary_report());
//! ```

use crate::analytics::{annualized_return, MetricSet, MetricsConfig};
use crate::engine::{RebalanceEvent, StrategyBacktest};
use crate::types::{RealizedReturnSeries, StrategyKind};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Cost levels to evaluate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostSensitivityConfig {
    /// Basis points per unit of one-way turnover.
    pub levels_bps: Vec<f64>,
}

impl Default for CostSensitivityConfig {
    fn default() -> Self {
        Self {
            levels_bps: vec![0.0, 10.0, 25.0, 50.0],
        }
    }
}

impl CostSensitivityConfig {
    pub fn with_levels(levels_bps: Vec<f64>) -> Self {
        Self { levels_bps }
    }

    /// Stress levels up to 100 bps.
    pub fn aggressive() -> Self {
        Self {
            levels_bps: vec![0.0, 10.0, 25.0, 50.0, 100.0],
        }
    }
}

/// Deduct `bps` per unit of turnover from the first return of each holding period.
pub fn apply_costs(
    gross: &RealizedReturnSeries,
    events: &[RebalanceEvent],
    bps: f64,
) -> RealizedReturnSeries {
    let mut net = gross.clone();
    let rate = bps / 10_000.0;
    for event in events {
        if let Some(r) = net.returns.get_mut(event.period) {
            *r -= rate * event.turnover;
        }
    }
    net
}

/// Results for a single strategy at a single cost level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostScenario {
    pub strategy: StrategyKind,
    pub bps: f64,
    /// Metrics of the net series.
    pub metrics: MetricSet,
    /// Sum of all per-period deductions.
    pub total_cost: f64,
    /// Annualized gross return minus annualized net return.
    pub annual_cost_drag: f64,
}

impl CostScenario {
    pub fn is_zero_cost(&self) -> bool {
        self.bps.abs() < 1e-9
    }

    pub fn sharpe_ratio(&self) -> f64 {
        self.metrics.sharpe_ratio
    }
}

/// Cost scenarios for every strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostSensitivityAnalysis {
    pub scenarios: Vec<CostScenario>,
}

impl CostSensitivityAnalysis {
    pub fn scenario(&self, strategy: StrategyKind, bps: f64) -> Option<&CostScenario> {
        self.scenarios
            .iter()
            .find(|s| s.strategy == strategy && (s.bps - bps).abs() < 1e-9)
    }

    pub fn for_strategy(&self, strategy: StrategyKind) -> impl Iterator<Item = &CostScenario> {
        self.scenarios.iter().filter(move |s| s.strategy == strategy)
    }

    /// Percentage Sharpe degradation at `bps` relative to the zero-cost scenario.
    pub fn sharpe_degradation_at(&self, strategy: StrategyKind, bps: f64) -> Option<f64> {
        let baseline = self.scenario(strategy, 0.0)?.sharpe_ratio();
        let scenario = self.scenario(strategy, bps)?.sharpe_ratio();

        if baseline.abs() < 1e-6 {
            return None;
        }

        Some(((baseline - scenario) / baseline) * 100.0)
    }

    /// Cost level at which the net Sharpe ratio reaches zero.
    ///
    /// Linear interpolation between the bracketing scenarios; `None` when the
    /// Sharpe ratio stays positive at every tested level.
    pub fn breakeven_bps(&self, strategy: StrategyKind) -> Option<f64> {
        let mut sorted: Vec<&CostScenario> = self.for_strategy(strategy).collect();
        sorted.sort_by(|a, b| a.bps.total_cmp(&b.bps));

        sorted.windows(2).find_map(|pair| {
            let (prev, curr) = (pair[0], pair[1]);
            if prev.sharpe_ratio() > 0.0 && curr.sharpe_ratio() <= 0.0 {
                let diff = prev.sharpe_ratio() - curr.sharpe_ratio();
                if diff.abs() < 1e-12 {
                    return Some(curr.bps);
                }
                Some(prev.bps + prev.sharpe_ratio() / diff * (curr.bps - prev.bps))
            } else {
                None
            }
        })
    }

    /// Generate summary report as formatted string.
    pub fn summary_report(&self) -> String {
        let mut report = String::new();
        report.push_str("Cost Sensitivity Analysis\n");
        report.push_str(&format!("{}\n", "=".repeat(64)));
        report.push_str(&format!(
            "{:<16} {:>8} {:>12} {:>10} {:>14}\n",
            "Strategy", "Bps", "Ann. Return", "Sharpe", "Cost drag"
        ));
        report.push_str(&format!("{}\n", "-".repeat(64)));

        for scenario in &self.scenarios {
            report.push_str(&format!(
                "{:<16} {:>8.1} {:>11.2}% {:>10.3} {:>13.2}%\n",
                scenario.strategy.label(),
                scenario.bps,
                scenario.metrics.annualized_return * 100.0,
                scenario.sharpe_ratio(),
                scenario.annual_cost_drag * 100.0
            ));
        }

        let mut strategies: Vec<StrategyKind> = self.scenarios.iter().map(|s| s.strategy).collect();
        strategies.dedup();
        for strategy in strategies {
            if let Some(bps) = self.breakeven_bps(strategy) {
                report.push_str(&format!(
                    "{}: Sharpe reaches zero at {:.1} bps\n",
                    strategy, bps
                ));
            }
        }

        report
    }
}

/// Evaluate every cost level for every strategy.
pub fn run_cost_sensitivity_analysis(
    backtests: &[StrategyBacktest],
    config: &CostSensitivityConfig,
    metrics_config: &MetricsConfig,
) -> CostSensitivityAnalysis {
    let scenarios = backtests
        .par_iter()
        .flat_map_iter(|backtest| {
            let gross_annual = annualized_return(&backtest.gross.returns, metrics_config.periods_per_year);
            config.levels_bps.iter().map(move |&bps| {
                let net = backtest.net(bps);
                let total_cost = backtest
                    .gross
                    .returns
                    .iter()
                    .zip(&net.returns)
                    .map(|(g, n)| g - n)
                    .sum();
                let metrics = MetricSet::compute(&net, metrics_config);
                CostScenario {
                    strategy: backtest.strategy,
                    bps,
                    annual_cost_drag: gross_annual - metrics.annualized_return,
                    metrics,
                    total_cost,
                }
            })
        })
        .collect();

    CostSensitivityAnalysis { scenarios }
}
