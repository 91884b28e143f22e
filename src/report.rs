//! End-to-end comparison of the configured strategies.
//!
//! [`ComparisonReport::build`] runs the engine, applies the configured cost,
//! computes net metrics, tests every strategy pair and evaluates the cost
//! scenarios and the sub-period blocks. Every flagged rebalance becomes a
//! [`FallbackNotice`].

use crate::analytics::{MetricSet, MetricsConfig};
use crate::cost_sensitivity::{run_cost_sensitivity_analysis, CostSensitivityAnalysis, CostSensitivityConfig};
use crate::engine::{BacktestConfig, BacktestRun, Engine, StrategyBacktest};
use crate::error::{BacktestError, Result};
use crate::significance::{SignificanceConfig, SignificanceResult, SignificanceTester};
use crate::subperiod::{SubperiodAnalysis, SubperiodConfig};
use crate::types::{RealizedReturnSeries, ReturnMatrix, RiskFreeRate, StrategyKind};
use chrono::NaiveDate;
use serde::Serialize;
use tracing::{info, warn};

/// Everything needed to build a report.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AnalysisConfig {
    pub backtest: BacktestConfig,
    pub significance: SignificanceConfig,
    pub metrics: MetricsConfig,
    pub cost_scenarios: CostSensitivityConfig,
    pub subperiods: SubperiodConfig,
}

/// Per-strategy headline numbers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategySummary {
    pub strategy: StrategyKind,
    /// Metrics after transaction costs.
    pub metrics: MetricSet,
    pub gross_metrics: MetricSet,
    /// Mean turnover over rebalances after the initial allocation.
    pub average_turnover: f64,
    pub total_turnover: f64,
    pub average_n_effective: f64,
    pub rebalances: usize,
    pub flagged: usize,
}

impl StrategySummary {
    fn from_backtest(backtest: &StrategyBacktest, net: &RealizedReturnSeries, metrics: &MetricsConfig) -> Self {
        Self {
            strategy: backtest.strategy,
            metrics: MetricSet::compute(net, metrics),
            gross_metrics: MetricSet::compute(&backtest.gross, metrics),
            average_turnover: backtest.average_turnover(),
            total_turnover: backtest.total_turnover(),
            average_n_effective: backtest.average_n_effective(),
            rebalances: backtest.events.len(),
            flagged: backtest.flagged_events().count(),
        }
    }
}

/// A rebalance whose weights came from a fallback path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FallbackNotice {
    pub date: NaiveDate,
    pub strategy: StrategyKind,
    pub flag: String,
    pub reason: String,
}

/// Full comparison of the strategies.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonReport {
    pub assets: Vec<String>,
    /// First out-of-sample date.
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub periods: usize,
    pub estimation_window: usize,
    pub rebalance_frequency: usize,
    pub cost_bps: f64,
    pub strategies: Vec<StrategySummary>,
    pub significance: Vec<SignificanceResult>,
    pub cost_scenarios: CostSensitivityAnalysis,
    pub fallbacks: Vec<FallbackNotice>,
    /// Net metrics per consecutive block of periods.
    pub subperiods: SubperiodAnalysis,
    /// Realized returns after costs, one per strategy.
    pub net_series: Vec<RealizedReturnSeries>,
    /// Engine output with the full event log.
    #[serde(skip)]
    pub run: BacktestRun,
}

impl ComparisonReport {
    /// Run the backtest and assemble the report.
    pub fn build(matrix: &ReturnMatrix, risk_free: &RiskFreeRate, config: &AnalysisConfig) -> Result<Self> {
        let run = Engine::new(config.backtest.clone()).run(matrix, risk_free)?;
        Self::from_run(run, config)
    }

    /// Assemble a report from an existing engine run.
    pub fn from_run(run: BacktestRun, config: &AnalysisConfig) -> Result<Self> {
        let cost_bps = config.backtest.cost_bps;
        let first = run
            .strategies
            .first()
            .ok_or_else(|| BacktestError::InvalidInput("No strategies were run".to_string()))?;
        let (start_date, end_date) = match (first.gross.dates.first(), first.gross.dates.last()) {
            (Some(&start), Some(&end)) => (start, end),
            _ => {
                return Err(BacktestError::DegenerateSeries(
                    "Backtest produced no out-of-sample periods".to_string(),
                ))
            }
        };

        let net_series: Vec<RealizedReturnSeries> =
            run.strategies.iter().map(|s| s.net(cost_bps)).collect();

        let strategies = run
            .strategies
            .iter()
            .zip(&net_series)
            .map(|(backtest, net)| StrategySummary::from_backtest(backtest, net, &config.metrics))
            .collect();

        let tester = SignificanceTester::new(config.significance.clone());
        let mut significance = Vec::new();
        for (i, a) in net_series.iter().enumerate() {
            for b in &net_series[i + 1..] {
                match tester.compare(a, b) {
                    Ok(result) => significance.push(result),
                    Err(e @ BacktestError::DegenerateSeries(_)) => {
                        warn!("Skipping significance test {} vs {}: {}", a.strategy, b.strategy, e);
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let cost_scenarios =
            run_cost_sensitivity_analysis(&run.strategies, &config.cost_scenarios, &config.metrics);

        let subperiods = SubperiodAnalysis::run(&net_series, &config.subperiods, &config.metrics)?;

        let fallbacks: Vec<FallbackNotice> = run
            .strategies
            .iter()
            .flat_map(|s| s.flagged_events())
            .filter_map(|event| {
                event.flag.as_ref().map(|flag| FallbackNotice {
                    date: event.date,
                    strategy: event.strategy,
                    flag: flag.label().to_string(),
                    reason: flag.reason(),
                })
            })
            .collect();

        info!(
            "Report built: {} strategies, {} pairs tested, {} fallback notices",
            net_series.len(),
            significance.len(),
            fallbacks.len()
        );

        Ok(Self {
            assets: run.assets.clone(),
            start_date,
            end_date,
            periods: first.gross.len(),
            estimation_window: run.config.schedule.estimation_window,
            rebalance_frequency: run.config.schedule.rebalance_frequency,
            cost_bps,
            strategies,
            significance,
            cost_scenarios,
            fallbacks,
            subperiods,
            net_series,
            run,
        })
    }

    pub fn summary(&self, strategy: StrategyKind) -> Option<&StrategySummary> {
        self.strategies.iter().find(|s| s.strategy == strategy)
    }

    pub fn comparison(&self, first: StrategyKind, second: StrategyKind) -> Option<&SignificanceResult> {
        self.significance
            .iter()
            .find(|r| (r.first == first && r.second == second) || (r.first == second && r.second == first))
    }

    /// Strategy with the highest net Sharpe ratio.
    pub fn best_strategy(&self) -> Option<StrategyKind> {
        self.strategies
            .iter()
            .max_by(|a, b| a.metrics.sharpe_ratio.total_cmp(&b.metrics.sharpe_ratio))
            .map(|s| s.strategy)
    }
}
