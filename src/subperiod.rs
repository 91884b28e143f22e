//! Sub-period robustness.
//!
//! Splits each strategy's net out-of-sample series into consecutive blocks of
//! `period_length` observations (semesters for monthly data with the default
//! of 6) and reports annualized return, volatility and Sharpe ratio per block.
//! A consistency summary then shows how much each strategy's numbers move
//! from one block to the next.
//!
//! A trailing block shorter than `min_observations` is dropped.

use crate::analytics::{mean, sample_std, MetricSet, MetricsConfig};
use crate::error::{BacktestError, Result};
use crate::types::{RealizedReturnSeries, StrategyKind};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Block settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubperiodConfig {
    /// Observations per block.
    pub period_length: usize,
    /// Shortest trailing block still reported.
    pub min_observations: usize,
}

impl Default for SubperiodConfig {
    fn default() -> Self {
        Self {
            period_length: 6,
            min_observations: 3,
        }
    }
}

impl SubperiodConfig {
    pub fn new(period_length: usize) -> Self {
        Self {
            period_length,
            ..Default::default()
        }
    }

    pub fn with_min_observations(mut self, min_observations: usize) -> Self {
        self.min_observations = min_observations;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.period_length < 2 {
            return Err(BacktestError::ConfigError(format!(
                "Sub-period length must be at least 2, got {}",
                self.period_length
            )));
        }
        if self.min_observations < 2 || self.min_observations > self.period_length {
            return Err(BacktestError::ConfigError(format!(
                "Sub-period minimum of {} observations must lie in [2, {}]",
                self.min_observations, self.period_length
            )));
        }
        Ok(())
    }
}

/// Metrics of one strategy over one block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubperiodResult {
    pub strategy: StrategyKind,
    /// Block number, from zero.
    pub index: usize,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub observations: usize,
    pub annualized_return: f64,
    pub annualized_volatility: f64,
    pub sharpe_ratio: f64,
}

/// Spread of one strategy's block metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencySummary {
    pub strategy: StrategyKind,
    pub periods: usize,
    pub mean_return: f64,
    pub std_return: f64,
    pub min_return: f64,
    pub max_return: f64,
    pub mean_volatility: f64,
    pub std_volatility: f64,
    pub mean_sharpe: f64,
    pub std_sharpe: f64,
    pub min_sharpe: f64,
    pub max_sharpe: f64,
    /// Blocks whose Sharpe ratio was positive.
    pub positive_sharpe_periods: usize,
}

/// Block metrics for every strategy, plus the consistency summaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubperiodAnalysis {
    pub period_length: usize,
    pub periods: Vec<SubperiodResult>,
    pub consistency: Vec<ConsistencySummary>,
}

impl SubperiodAnalysis {
    pub fn run(
        series: &[RealizedReturnSeries],
        config: &SubperiodConfig,
        metrics: &MetricsConfig,
    ) -> Result<Self> {
        config.validate()?;

        let mut periods = Vec::new();
        for s in series {
            let blocks = s
                .returns
                .chunks(config.period_length)
                .zip(s.risk_free.chunks(config.period_length))
                .zip(s.dates.chunks(config.period_length))
                .enumerate();
            for (index, ((returns, risk_free), dates)) in blocks {
                if returns.len() < config.min_observations {
                    debug!(
                        "{}: dropping trailing block of {} observations",
                        s.strategy,
                        returns.len()
                    );
                    continue;
                }
                let (start, end) = match (dates.first(), dates.last()) {
                    (Some(&start), Some(&end)) => (start, end),
                    _ => continue,
                };
                let set = MetricSet::from_returns(returns, risk_free, metrics);
                periods.push(SubperiodResult {
                    strategy: s.strategy,
                    index,
                    start,
                    end,
                    observations: returns.len(),
                    annualized_return: set.annualized_return,
                    annualized_volatility: set.annualized_volatility,
                    sharpe_ratio: set.sharpe_ratio,
                });
            }
        }

        let strategies: Vec<StrategyKind> = series.iter().map(|s| s.strategy).collect();
        let consistency = consistency_summary(&periods, &strategies);

        info!(
            "Sub-period analysis: {} blocks of {} across {} strategies",
            periods.len(),
            config.period_length,
            strategies.len()
        );

        Ok(Self {
            period_length: config.period_length,
            periods,
            consistency,
        })
    }

    pub fn for_strategy(&self, strategy: StrategyKind) -> impl Iterator<Item = &SubperiodResult> {
        self.periods.iter().filter(move |p| p.strategy == strategy)
    }

    pub fn consistency(&self, strategy: StrategyKind) -> Option<&ConsistencySummary> {
        self.consistency.iter().find(|c| c.strategy == strategy)
    }

    /// Strategy with the highest Sharpe ratio in each block, as `(index, strategy)`.
    pub fn block_winners(&self) -> Vec<(usize, StrategyKind)> {
        let mut indices: Vec<usize> = self.periods.iter().map(|p| p.index).collect();
        indices.sort_unstable();
        indices.dedup();
        indices
            .into_iter()
            .filter_map(|index| {
                self.periods
                    .iter()
                    .filter(|p| p.index == index)
                    .max_by(|a, b| a.sharpe_ratio.total_cmp(&b.sharpe_ratio))
                    .map(|p| (index, p.strategy))
            })
            .collect()
    }
}

fn consistency_summary(periods: &[SubperiodResult], strategies: &[StrategyKind]) -> Vec<ConsistencySummary> {
    strategies
        .iter()
        .filter_map(|&strategy| {
            let blocks: Vec<&SubperiodResult> = periods.iter().filter(|p| p.strategy == strategy).collect();
            if blocks.is_empty() {
                return None;
            }
            let returns: Vec<f64> = blocks.iter().map(|p| p.annualized_return).collect();
            let volatilities: Vec<f64> = blocks.iter().map(|p| p.annualized_volatility).collect();
            let sharpes: Vec<f64> = blocks.iter().map(|p| p.sharpe_ratio).collect();
            Some(ConsistencySummary {
                strategy,
                periods: blocks.len(),
                mean_return: mean(&returns),
                std_return: sample_std(&returns),
                min_return: returns.iter().cloned().fold(f64::INFINITY, f64::min),
                max_return: returns.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
                mean_volatility: mean(&volatilities),
                std_volatility: sample_std(&volatilities),
                mean_sharpe: mean(&sharpes),
                std_sharpe: sample_std(&sharpes),
                min_sharpe: sharpes.iter().cloned().fold(f64::INFINITY, f64::min),
                max_sharpe: sharpes.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
                positive_sharpe_periods: sharpes.iter().filter(|&&s| s > 0.0).count(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(strategy: StrategyKind, returns: Vec<f64>) -> RealizedReturnSeries {
        let dates = (0..returns.len())
            .map(|i| NaiveDate::from_ymd_opt(2020 + (i / 12) as i32, (i % 12) as u32 + 1, 1).unwrap())
            .collect();
        let risk_free = vec![0.001; returns.len()];
        RealizedReturnSeries {
            strategy,
            dates,
            returns,
            risk_free,
        }
    }

    /// Alternating calm and rough half-years.
    fn regime_returns(months: usize) -> Vec<f64> {
        (0..months)
            .map(|i| {
                let swing = if i % 2 == 0 { 1.0 } else { -1.0 };
                if (i / 6) % 2 == 0 {
                    0.010 + 0.005 * swing
                } else {
                    -0.004 + 0.03 * swing
                }
            })
            .collect()
    }

    #[test]
    fn test_semester_blocks() {
        let input = vec![
            series(StrategyKind::EqualWeight, regime_returns(24)),
            series(StrategyKind::RiskParity, vec![0.003, 0.001].repeat(12)),
        ];
        let analysis =
            SubperiodAnalysis::run(&input, &SubperiodConfig::default(), &MetricsConfig::default()).unwrap();

        assert_eq!(analysis.period_length, 6);
        assert_eq!(analysis.periods.len(), 8);

        let blocks: Vec<&SubperiodResult> = analysis.for_strategy(StrategyKind::EqualWeight).collect();
        assert_eq!(blocks.len(), 4);
        assert_eq!(blocks[0].start, NaiveDate::from_ymd_opt(2020, 1, 1).unwrap());
        assert_eq!(blocks[0].end, NaiveDate::from_ymd_opt(2020, 6, 1).unwrap());
        assert_eq!(blocks[3].index, 3);
        assert!(blocks.iter().all(|b| b.observations == 6));

        // Calm blocks beat rough ones.
        assert!(blocks[0].sharpe_ratio > 0.0);
        assert!(blocks[1].sharpe_ratio < 0.0);
        assert!(blocks[1].annualized_volatility > blocks[0].annualized_volatility);
        assert_eq!(blocks[0].sharpe_ratio, blocks[2].sharpe_ratio);
    }

    #[test]
    fn test_consistency_summary() {
        let input = vec![
            series(StrategyKind::EqualWeight, regime_returns(24)),
            series(StrategyKind::RiskParity, vec![0.003, 0.001].repeat(12)),
        ];
        let analysis =
            SubperiodAnalysis::run(&input, &SubperiodConfig::default(), &MetricsConfig::default()).unwrap();

        let ew = analysis.consistency(StrategyKind::EqualWeight).unwrap();
        assert_eq!(ew.periods, 4);
        assert_eq!(ew.positive_sharpe_periods, 2);
        assert!(ew.min_sharpe < 0.0 && ew.max_sharpe > 0.0);
        assert!(ew.std_sharpe > 0.0);
        assert!((ew.mean_sharpe - (ew.min_sharpe + ew.max_sharpe) / 2.0).abs() < 1e-9);

        // Identical blocks give identical metrics.
        let rp = analysis.consistency(StrategyKind::RiskParity).unwrap();
        assert!(rp.std_sharpe.abs() < 1e-9);
        assert!((rp.min_sharpe - rp.max_sharpe).abs() < 1e-9);
        assert_eq!(rp.positive_sharpe_periods, 4);

        assert!(analysis.consistency(StrategyKind::MeanVariance).is_none());
        let winners = analysis.block_winners();
        assert_eq!(winners.len(), 4);
        assert_eq!(winners[0], (0, StrategyKind::EqualWeight));
        assert_eq!(winners[1], (1, StrategyKind::RiskParity));
    }

    #[test]
    fn test_short_trailing_block() {
        let input = vec![series(StrategyKind::EqualWeight, regime_returns(14))];

        let analysis =
            SubperiodAnalysis::run(&input, &SubperiodConfig::default(), &MetricsConfig::default()).unwrap();
        assert_eq!(analysis.periods.len(), 2);

        let loose = SubperiodConfig::default().with_min_observations(2);
        let analysis = SubperiodAnalysis::run(&input, &loose, &MetricsConfig::default()).unwrap();
        assert_eq!(analysis.periods.len(), 3);
        assert_eq!(analysis.periods[2].observations, 2);
    }

    #[test]
    fn test_quarterly_blocks() {
        let input = vec![series(StrategyKind::MeanVariance, regime_returns(24))];
        let analysis =
            SubperiodAnalysis::run(&input, &SubperiodConfig::new(3), &MetricsConfig::default()).unwrap();
        assert_eq!(analysis.periods.len(), 8);
        assert_eq!(analysis.consistency(StrategyKind::MeanVariance).unwrap().periods, 8);
    }

    #[test]
    fn test_invalid_config() {
        assert!(SubperiodConfig::new(1).validate().is_err());
        assert!(SubperiodConfig::new(6).with_min_observations(7).validate().is_err());
        assert!(SubperiodConfig::new(6).with_min_observations(1).validate().is_err());
        assert!(SubperiodConfig::default().validate().is_ok());
    }
}
