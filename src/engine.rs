//! Walk-forward backtest execution engine.
//!
//! For every strategy the engine walks the rebalance schedule, estimates
//! moments on the trailing window, asks the allocator for target weights and
//! holds them with buy-and-hold drift until the next rebalance. The output is
//! a gross realized return series plus an immutable event log; transaction
//! costs are applied afterwards by [`crate::cost_sensitivity`].

use crate::allocators::{build_allocator, equal_weights, Allocation, OptimizerConfig};
use crate::cost_sensitivity::apply_costs;
use crate::error::{BacktestError, Result};
use crate::estimation::{Estimator, EstimatorConfig, MomentEstimate};
use crate::types::{
    n_effective, turnover, AllocationFlag, RealizedReturnSeries, ReturnMatrix, RiskFreeRate,
    StrategyKind, WeightBounds,
};
use crate::walkforward::{RebalanceSchedule, WalkForwardConfig};
use chrono::NaiveDate;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

/// Configuration for the backtest engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestConfig {
    /// Estimation window and rebalance cadence.
    pub schedule: WalkForwardConfig,
    /// Moment estimation settings.
    pub estimator: EstimatorConfig,
    /// Per-asset weight limits.
    pub bounds: WeightBounds,
    /// Solver limits.
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    /// Periods per year, used to de-annualize a constant risk-free rate.
    #[serde(default = "default_periods_per_year")]
    pub periods_per_year: f64,
    /// Flat cost per unit of one-way turnover, in basis points.
    #[serde(default)]
    pub cost_bps: f64,
    /// Strategies to run.
    #[serde(default = "default_strategies")]
    pub strategies: Vec<StrategyKind>,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            schedule: WalkForwardConfig::default(),
            estimator: EstimatorConfig::default(),
            bounds: WeightBounds::default(),
            optimizer: OptimizerConfig::default(),
            periods_per_year: default_periods_per_year(),
            cost_bps: 0.0,
            strategies: default_strategies(),
        }
    }
}

fn default_periods_per_year() -> f64 {
    12.0
}

fn default_strategies() -> Vec<StrategyKind> {
    StrategyKind::ALL.to_vec()
}

impl BacktestConfig {
    pub fn validate(&self, n_assets: usize) -> Result<()> {
        self.schedule.validate()?;
        self.estimator.validate()?;
        self.bounds.validate(n_assets)?;
        if self.periods_per_year.is_nan() || self.periods_per_year <= 0.0 {
            return Err(BacktestError::ConfigError(format!(
                "periods_per_year must be positive, got {}",
                self.periods_per_year
            )));
        }
        if !self.cost_bps.is_finite() || self.cost_bps < 0.0 {
            return Err(BacktestError::ConfigError(format!(
                "Cost must be a non-negative number of basis points, got {}",
                self.cost_bps
            )));
        }
        let required = self.estimator.required_observations(n_assets);
        let available = self.schedule.shortest_window();
        if available < required {
            return Err(BacktestError::InsufficientHistory {
                required,
                available,
            });
        }
        Ok(())
    }
}

/// Lifecycle of a strategy chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    AwaitingWindow,
    Estimating,
    Allocating,
    Holding,
    Complete,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::AwaitingWindow => "awaiting-window",
            Phase::Estimating => "estimating",
            Phase::Allocating => "allocating",
            Phase::Holding => "holding",
            Phase::Complete => "complete",
        };
        write!(f, "{}", name)
    }
}

/// One rebalance decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceEvent {
    pub date: NaiveDate,
    /// Row of the return matrix at which the weights take effect.
    pub row: usize,
    /// Position of `row` in the realized return series.
    pub period: usize,
    pub strategy: StrategyKind,
    pub target_weights: Vec<f64>,
    /// Drifted weights held just before the rebalance.
    pub drifted_weights: Vec<f64>,
    /// Moments used; `None` when estimation failed.
    pub estimate: Option<MomentEstimate>,
    pub turnover: f64,
    pub n_effective: f64,
    /// Risk contributions of the target weights, normalized to sum to one.
    pub risk_contributions: Option<Vec<f64>>,
    pub flag: Option<AllocationFlag>,
}

/// Event log and gross returns of one strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyBacktest {
    pub strategy: StrategyKind,
    pub events: Vec<RebalanceEvent>,
    /// Returns before transaction costs.
    pub gross: RealizedReturnSeries,
    pub phase: Phase,
}

impl StrategyBacktest {
    /// Returns after a flat `bps` cost per unit of turnover.
    pub fn net(&self, bps: f64) -> RealizedReturnSeries {
        apply_costs(&self.gross, &self.events, bps)
    }

    /// Mean turnover over the rebalances after the initial allocation.
    pub fn average_turnover(&self) -> f64 {
        let later = self.events.iter().skip(1);
        let count = later.len();
        if count == 0 {
            return 0.0;
        }
        later.map(|e| e.turnover).sum::<f64>() / count as f64
    }

    pub fn total_turnover(&self) -> f64 {
        self.events.iter().map(|e| e.turnover).sum()
    }

    pub fn average_n_effective(&self) -> f64 {
        if self.events.is_empty() {
            return 0.0;
        }
        self.events.iter().map(|e| e.n_effective).sum::<f64>() / self.events.len() as f64
    }

    pub fn flagged_events(&self) -> impl Iterator<Item = &RebalanceEvent> {
        self.events.iter().filter(|e| e.flag.is_some())
    }
}

/// Output of a multi-strategy run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestRun {
    pub config: BacktestConfig,
    pub assets: Vec<String>,
    pub strategies: Vec<StrategyBacktest>,
}

impl BacktestRun {
    pub fn get(&self, kind: StrategyKind) -> Option<&StrategyBacktest> {
        self.strategies.iter().find(|s| s.strategy == kind)
    }
}

/// The walk-forward backtest engine.
#[derive(Debug, Clone, Default)]
pub struct Engine {
    config: BacktestConfig,
}

impl Engine {
    pub fn new(config: BacktestConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    /// Run every configured strategy in parallel.
    pub fn run(&self, matrix: &ReturnMatrix, risk_free: &RiskFreeRate) -> Result<BacktestRun> {
        self.config.validate(matrix.n_assets())?;
        risk_free.validate(matrix.len())?;
        // Fail fast on short data before spawning work.
        RebalanceSchedule::build(&self.config.schedule, matrix.len())?;

        info!(
            "Running walk-forward backtest: {} strategies, {} months x {} assets",
            self.config.strategies.len(),
            matrix.len(),
            matrix.n_assets()
        );

        let strategies = self
            .config
            .strategies
            .par_iter()
            .map(|&kind| self.run_strategy(matrix, risk_free, kind))
            .collect::<Result<Vec<_>>>()?;

        Ok(BacktestRun {
            config: self.config.clone(),
            assets: matrix.assets().to_vec(),
            strategies,
        })
    }

    /// Run a single strategy through the schedule.
    pub fn run_strategy(
        &self,
        matrix: &ReturnMatrix,
        risk_free: &RiskFreeRate,
        kind: StrategyKind,
    ) -> Result<StrategyBacktest> {
        self.config.validate(matrix.n_assets())?;
        risk_free.validate(matrix.len())?;
        let schedule = RebalanceSchedule::build(&self.config.schedule, matrix.len())?;

        let n = matrix.n_assets();
        let ppy = self.config.periods_per_year;
        let estimator = Estimator::new(self.config.estimator.clone());
        let allocator = build_allocator(kind, self.config.bounds, &self.config.optimizer);

        let mut events = Vec::with_capacity(schedule.len());
        let mut dates = Vec::with_capacity(schedule.out_of_sample_len());
        let mut returns = Vec::with_capacity(schedule.out_of_sample_len());
        let mut rf_series = Vec::with_capacity(schedule.out_of_sample_len());
        let mut held: Option<Vec<f64>> = None;

        info!("Starting {} over {} rebalances", kind, schedule.len());

        for point in schedule.points() {
            let date = matrix.date(point.row);
            debug!("{} {}: {} -> {}", kind, date, Phase::AwaitingWindow, Phase::Estimating);

            let (allocation, estimate) = match estimator.estimate(matrix, &point.window) {
                Ok(estimate) => {
                    debug!("{} {}: {} -> {}", kind, date, Phase::Estimating, Phase::Allocating);
                    let rf = risk_free.window_mean(point.window.range(), ppy);
                    (allocator.allocate(&estimate, rf), Some(estimate))
                }
                Err(e) if kind == StrategyKind::EqualWeight => {
                    debug!("{} {}: estimation skipped: {}", kind, date, e);
                    (Allocation::new(equal_weights(n)), None)
                }
                Err(e) => {
                    warn!("{} {}: estimation failed, using equal weights: {}", kind, date, e);
                    let flag = AllocationFlag::EstimationFallback {
                        reason: e.to_string(),
                    };
                    (Allocation::flagged(equal_weights(n), flag), None)
                }
            };

            let target = allocation.weights;
            let drifted = held.take().unwrap_or_else(|| target.clone());
            let risk_contributions = estimate.as_ref().map(|e| e.risk_contributions(&target));

            events.push(RebalanceEvent {
                date,
                row: point.row,
                period: returns.len(),
                strategy: kind,
                turnover: turnover(&drifted, &target),
                n_effective: n_effective(&target),
                drifted_weights: drifted,
                target_weights: target.clone(),
                estimate,
                risk_contributions,
                flag: allocation.flag,
            });

            debug!("{} {}: {} -> {}", kind, date, Phase::Allocating, Phase::Holding);
            let mut weights = target;
            for row in point.holding_rows() {
                let asset_returns = matrix.row(row);
                let portfolio_return: f64 = weights
                    .iter()
                    .zip(asset_returns)
                    .map(|(w, r)| w * r)
                    .sum();

                dates.push(matrix.date(row));
                returns.push(portfolio_return);
                rf_series.push(risk_free.periodic(row, ppy));

                let growth = 1.0 + portfolio_return;
                if growth.abs() > f64::EPSILON {
                    for (w, r) in weights.iter_mut().zip(asset_returns) {
                        *w *= (1.0 + r) / growth;
                    }
                }
            }
            held = Some(weights);
        }

        let backtest = StrategyBacktest {
            strategy: kind,
            events,
            gross: RealizedReturnSeries {
                strategy: kind,
                dates,
                returns,
                risk_free: rf_series,
            },
            phase: Phase::Complete,
        };

        let flagged = backtest.flagged_events().count();
        if flagged > 0 {
            warn!("{}: {} of {} rebalances flagged", kind, flagged, backtest.events.len());
        }
        info!(
            "Finished {}: {} periods, average turnover {:.4}",
            kind,
            backtest.gross.len(),
            backtest.average_turnover()
        );

        Ok(backtest)
    }
}
