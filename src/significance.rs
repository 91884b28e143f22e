//! Statistical significance of Sharpe ratio differences.
//!
//! Two complementary tests on a pair of realized (net) return series over
//! the same dates:
//!
//! - **Jobson-Korkie** with Memmel's correction: an asymptotic z-test that
//!   uses the joint covariance of the two series, so correlated strategies
//!   are not treated as independent.
//! - **Paired moving-block bootstrap**: blocks of consecutive dates are drawn
//!   with replacement and applied to both series at once, preserving serial
//!   and cross-sectional dependence. Block size defaults to `floor(sqrt(n))`.
//!
//! Each bootstrap resample seeds its own generator from the configured seed
//! and the resample index, so results do not depend on thread scheduling.

use crate::analytics::{excess_sharpe, mean, percentile, sample_std};
use crate::error::{BacktestError, Result};
use crate::types::{RealizedReturnSeries, StrategyKind};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::function::erf::erfc;
use tracing::{debug, info};

/// Configuration for significance testing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignificanceConfig {
    /// Number of bootstrap resamples.
    pub iterations: usize,
    /// Confidence level for the bootstrap interval (e.g., 0.95).
    pub confidence_level: f64,
    /// Base seed; resample `i` uses `seed + i`.
    pub seed: u64,
    /// Block length. If None, uses floor(sqrt(n)).
    pub block_size: Option<usize>,
    /// Used to annualize Sharpe ratios.
    pub periods_per_year: f64,
}

impl Default for SignificanceConfig {
    fn default() -> Self {
        Self {
            iterations: 2000,
            confidence_level: 0.95,
            seed: 42,
            block_size: None,
            periods_per_year: 12.0,
        }
    }
}

impl SignificanceConfig {
    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn with_confidence(mut self, level: f64) -> Self {
        self.confidence_level = level;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_block_size(mut self, size: usize) -> Self {
        self.block_size = Some(size);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.iterations == 0 {
            return Err(BacktestError::ConfigError(
                "Bootstrap iterations must be positive".to_string(),
            ));
        }
        if !(self.confidence_level > 0.0 && self.confidence_level < 1.0) {
            return Err(BacktestError::ConfigError(format!(
                "Confidence level must be in (0, 1), got {}",
                self.confidence_level
            )));
        }
        if self.block_size == Some(0) {
            return Err(BacktestError::ConfigError(
                "Block size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Block length for a series of `n` observations.
    pub fn block_size_for(&self, n: usize) -> usize {
        match self.block_size {
            Some(size) => size.max(1).min(n.max(1)),
            None => ((n as f64).sqrt().floor() as usize).max(1),
        }
    }
}

/// Jobson-Korkie test with Memmel's correction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JobsonKorkie {
    pub z_statistic: f64,
    /// Two-sided p-value.
    pub p_value: f64,
}

/// Paired block bootstrap of the annualized Sharpe difference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapResult {
    /// Sharpe difference on the original series.
    pub observed: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
    /// Standard deviation of the resampled differences.
    pub std_error: f64,
    /// Twice the share of resamples whose sign opposes the observed difference, capped at 1.
    pub p_value: f64,
    pub iterations: usize,
    pub block_size: usize,
}

impl BootstrapResult {
    pub fn excludes_zero(&self) -> bool {
        self.ci_lower > 0.0 || self.ci_upper < 0.0
    }
}

/// Outcome of comparing two strategies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignificanceResult {
    pub first: StrategyKind,
    pub second: StrategyKind,
    /// Annualized Sharpe of `first` minus that of `second`, from excess returns.
    pub sharpe_difference: f64,
    pub jobson_korkie: JobsonKorkie,
    pub bootstrap: BootstrapResult,
}

impl SignificanceResult {
    /// Both tests reject equal Sharpe ratios at `alpha`.
    pub fn is_significant(&self, alpha: f64) -> bool {
        self.jobson_korkie.p_value < alpha && self.bootstrap.excludes_zero()
    }
}

/// Runs the pairwise tests.
#[derive(Debug, Clone, Default)]
pub struct SignificanceTester {
    config: SignificanceConfig,
}

impl SignificanceTester {
    pub fn new(config: SignificanceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SignificanceConfig {
        &self.config
    }

    /// Compare two series over the same dates.
    pub fn compare(
        &self,
        first: &RealizedReturnSeries,
        second: &RealizedReturnSeries,
    ) -> Result<SignificanceResult> {
        self.config.validate()?;
        if first.len() != second.len() {
            return Err(BacktestError::InvalidInput(format!(
                "Series lengths differ: {} has {}, {} has {}",
                first.strategy,
                first.len(),
                second.strategy,
                second.len()
            )));
        }
        if first.dates != second.dates {
            return Err(BacktestError::InvalidInput(format!(
                "{} and {} cover different dates",
                first.strategy, second.strategy
            )));
        }
        if first.len() < 2 {
            return Err(BacktestError::DegenerateSeries(format!(
                "Need at least 2 observations, got {}",
                first.len()
            )));
        }

        let a = first.excess_returns();
        let b = second.excess_returns();
        let ppy = self.config.periods_per_year;

        let jobson_korkie = jobson_korkie(&a, &b)?;
        let bootstrap = self.bootstrap(&a, &b);
        let sharpe_difference = excess_sharpe(&a, ppy) - excess_sharpe(&b, ppy);

        debug!(
            "{} vs {}: dSharpe {:.4}, JK z {:.3} (p {:.4}), CI [{:.4}, {:.4}]",
            first.strategy,
            second.strategy,
            sharpe_difference,
            jobson_korkie.z_statistic,
            jobson_korkie.p_value,
            bootstrap.ci_lower,
            bootstrap.ci_upper
        );

        Ok(SignificanceResult {
            first: first.strategy,
            second: second.strategy,
            sharpe_difference,
            jobson_korkie,
            bootstrap,
        })
    }

    /// Compare every pair `(i, j)` with `i < j`, in input order.
    pub fn pairwise(&self, series: &[RealizedReturnSeries]) -> Result<Vec<SignificanceResult>> {
        info!(
            "Testing {} strategy pairs ({} bootstrap resamples each)",
            series.len() * series.len().saturating_sub(1) / 2,
            self.config.iterations
        );
        let mut results = Vec::new();
        for (i, first) in series.iter().enumerate() {
            for second in &series[i + 1..] {
                results.push(self.compare(first, second)?);
            }
        }
        Ok(results)
    }

    /// Paired moving-block bootstrap on excess returns.
    pub fn bootstrap(&self, a: &[f64], b: &[f64]) -> BootstrapResult {
        let n = a.len().min(b.len());
        let ppy = self.config.periods_per_year;
        let block_size = self.config.block_size_for(n);
        let observed = excess_sharpe(&a[..n], ppy) - excess_sharpe(&b[..n], ppy);

        let mut differences: Vec<f64> = (0..self.config.iterations)
            .into_par_iter()
            .map(|i| {
                let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(i as u64));
                let indices = block_indices(n, block_size, &mut rng);
                let sample_a: Vec<f64> = indices.iter().map(|&t| a[t]).collect();
                let sample_b: Vec<f64> = indices.iter().map(|&t| b[t]).collect();
                excess_sharpe(&sample_a, ppy) - excess_sharpe(&sample_b, ppy)
            })
            .collect();
        differences.sort_by(|x, y| x.total_cmp(y));

        let alpha = 1.0 - self.config.confidence_level;
        let opposite = if observed > 0.0 {
            differences.iter().filter(|&&d| d <= 0.0).count()
        } else if observed < 0.0 {
            differences.iter().filter(|&&d| d >= 0.0).count()
        } else {
            differences.len()
        };
        let p_value = if differences.is_empty() {
            1.0
        } else {
            (2.0 * opposite as f64 / differences.len() as f64).min(1.0)
        };

        BootstrapResult {
            observed,
            ci_lower: percentile(&differences, alpha / 2.0),
            ci_upper: percentile(&differences, 1.0 - alpha / 2.0),
            std_error: sample_std(&differences),
            p_value,
            iterations: differences.len(),
            block_size,
        }
    }
}

/// Jobson-Korkie z-test on two aligned excess-return series.
///
/// ```text
/// z = (σ_b μ_a − σ_a μ_b) / √θ
/// θ = (1/T)[2σ_a²σ_b² − 2σ_aσ_bσ_ab + ½μ_a²σ_b² + ½μ_b²σ_a² − (μ_aμ_b/(σ_aσ_b))σ_ab²]
/// ```
///
/// A zero numerator (identical series) gives `z = 0`, `p = 1`.
pub fn jobson_korkie(a: &[f64], b: &[f64]) -> Result<JobsonKorkie> {
    let t = a.len();
    if t != b.len() || t < 2 {
        return Err(BacktestError::DegenerateSeries(format!(
            "Jobson-Korkie needs two aligned series of at least 2 observations, got {} and {}",
            t,
            b.len()
        )));
    }

    let (mu_a, mu_b) = (mean(a), mean(b));
    let (sd_a, sd_b) = (sample_std(a), sample_std(b));
    let cov_ab = a
        .iter()
        .zip(b)
        .map(|(x, y)| (x - mu_a) * (y - mu_b))
        .sum::<f64>()
        / (t - 1) as f64;

    let numerator = sd_b * mu_a - sd_a * mu_b;
    if numerator == 0.0 {
        return Ok(JobsonKorkie {
            z_statistic: 0.0,
            p_value: 1.0,
        });
    }
    if sd_a == 0.0 || sd_b == 0.0 {
        return Err(BacktestError::DegenerateSeries(
            "Jobson-Korkie undefined for a zero-volatility series".to_string(),
        ));
    }

    let (var_a, var_b) = (sd_a * sd_a, sd_b * sd_b);
    let theta = (2.0 * var_a * var_b - 2.0 * sd_a * sd_b * cov_ab
        + 0.5 * mu_a * mu_a * var_b
        + 0.5 * mu_b * mu_b * var_a
        - (mu_a * mu_b / (sd_a * sd_b)) * cov_ab * cov_ab)
        / t as f64;

    if !theta.is_finite() || theta <= 0.0 {
        return Err(BacktestError::DegenerateSeries(format!(
            "Jobson-Korkie variance is not positive ({:e})",
            theta
        )));
    }

    let z_statistic = numerator / theta.sqrt();
    Ok(JobsonKorkie {
        z_statistic,
        p_value: erfc(z_statistic.abs() / std::f64::consts::SQRT_2).min(1.0),
    })
}

/// Row indices of one moving-block resample of length `n`.
fn block_indices(n: usize, block_size: usize, rng: &mut StdRng) -> Vec<usize> {
    if n == 0 {
        return Vec::new();
    }
    let block_size = block_size.clamp(1, n);
    let starts = n - block_size + 1;
    let mut indices = Vec::with_capacity(n + block_size);
    while indices.len() < n {
        let start = rng.gen_range(0..starts);
        indices.extend(start..start + block_size);
    }
    indices.truncate(n);
    indices
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn series(strategy: StrategyKind, returns: Vec<f64>) -> RealizedReturnSeries {
        let dates = (0..returns.len())
            .map(|i| NaiveDate::from_ymd_opt(2000 + (i / 12) as i32, (i % 12) as u32 + 1, 1).unwrap())
            .collect();
        let n = returns.len();
        RealizedReturnSeries {
            strategy,
            dates,
            returns,
            risk_free: vec![0.0; n],
        }
    }

    fn wavy(n: usize, drift: f64, extra: f64) -> Vec<f64> {
        (0..n)
            .map(|t| {
                let t = t as f64;
                drift + 0.02 * t.sin() + extra * (3.0 * t).cos()
            })
            .collect()
    }

    fn tester() -> SignificanceTester {
        SignificanceTester::new(SignificanceConfig::default().with_iterations(500))
    }

    #[test]
    fn test_identical_series() {
        let returns = wavy(60, 0.01, 0.0);
        let a = series(StrategyKind::EqualWeight, returns.clone());
        let b = series(StrategyKind::RiskParity, returns);
        let result = tester().compare(&a, &b).unwrap();

        assert_eq!(result.jobson_korkie.z_statistic, 0.0);
        assert_eq!(result.jobson_korkie.p_value, 1.0);
        assert_eq!(result.sharpe_difference, 0.0);
        assert!(result.bootstrap.ci_lower <= 0.0 && result.bootstrap.ci_upper >= 0.0);
        assert_eq!(result.bootstrap.p_value, 1.0);
    }

    #[test]
    fn test_identical_series_interval_stays_closed() {
        let returns = wavy(60, 0.01, 0.0);
        let widths: Vec<f64> = [100, 1000, 4000]
            .iter()
            .map(|&iterations| {
                let result = SignificanceTester::new(
                    SignificanceConfig::default().with_iterations(iterations),
                )
                .bootstrap(&returns, &returns);
                assert_eq!(result.iterations, iterations);
                assert_eq!(result.std_error, 0.0);
                result.ci_upper - result.ci_lower
            })
            .collect();
        assert_eq!(widths, vec![0.0; 3]);
    }

    #[test]
    fn test_more_resamples_steady_the_interval() {
        let a = wavy(72, 0.01, 0.0);
        let b = wavy(72, 0.005, 0.01);
        let seeds: Vec<u64> = (0..8).map(|k| k * 1_000_000).collect();

        // Spread of the lower bound across independent seeds.
        let endpoint_spread = |iterations: usize| {
            let lowers: Vec<f64> = seeds
                .iter()
                .map(|&seed| {
                    SignificanceTester::new(
                        SignificanceConfig::default()
                            .with_iterations(iterations)
                            .with_seed(seed),
                    )
                    .bootstrap(&a, &b)
                    .ci_lower
                })
                .collect();
            sample_std(&lowers)
        };

        let coarse = endpoint_spread(100);
        let fine = endpoint_spread(4000);
        assert!(coarse > 0.0);
        assert!(fine < coarse, "spread {} at 4000 vs {} at 100", fine, coarse);
    }

    #[test]
    fn test_clear_difference_is_significant() {
        let a = series(StrategyKind::MeanVariance, wavy(120, 0.01, 0.0));
        let b = series(StrategyKind::EqualWeight, wavy(120, 0.0, 0.005));
        let result = tester().compare(&a, &b).unwrap();

        assert!(result.sharpe_difference > 0.0);
        assert!(result.jobson_korkie.z_statistic > 0.0);
        assert!(result.jobson_korkie.p_value < 0.01);
        assert!(result.bootstrap.ci_lower > 0.0);
        assert!(result.bootstrap.p_value < 0.05);
        assert!(result.is_significant(0.05));
    }

    #[test]
    fn test_statistic_is_antisymmetric() {
        let a = wavy(48, 0.01, 0.0);
        let b = wavy(48, 0.004, 0.01);
        let ab = jobson_korkie(&a, &b).unwrap();
        let ba = jobson_korkie(&b, &a).unwrap();
        assert!((ab.z_statistic + ba.z_statistic).abs() < 1e-12);
        assert!((ab.p_value - ba.p_value).abs() < 1e-12);
    }

    #[test]
    fn test_bootstrap_is_reproducible() {
        let a = wavy(72, 0.01, 0.0);
        let b = wavy(72, 0.005, 0.01);
        let first = tester().bootstrap(&a, &b);
        let second = tester().bootstrap(&a, &b);
        assert_eq!(first, second);

        let other = SignificanceTester::new(
            SignificanceConfig::default().with_iterations(500).with_seed(7),
        )
        .bootstrap(&a, &b);
        assert_eq!(other.observed, first.observed);
        assert_ne!(other.ci_lower, first.ci_lower);
    }

    #[test]
    fn test_block_size() {
        let config = SignificanceConfig::default();
        assert_eq!(config.block_size_for(100), 10);
        assert_eq!(config.block_size_for(48), 6);
        assert_eq!(config.block_size_for(1), 1);
        assert_eq!(config.clone().with_block_size(20).block_size_for(12), 12);
    }

    #[test]
    fn test_block_indices_are_contiguous_runs() {
        let mut rng = StdRng::seed_from_u64(1);
        let indices = block_indices(20, 4, &mut rng);
        assert_eq!(indices.len(), 20);
        for chunk in indices.chunks(4) {
            for pair in chunk.windows(2) {
                assert_eq!(pair[1], pair[0] + 1);
            }
        }
        assert!(indices.iter().all(|&i| i < 20));
    }

    #[test]
    fn test_mismatched_series_rejected() {
        let a = series(StrategyKind::EqualWeight, wavy(24, 0.01, 0.0));
        let b = series(StrategyKind::RiskParity, wavy(25, 0.01, 0.0));
        assert!(matches!(
            tester().compare(&a, &b),
            Err(BacktestError::InvalidInput(_))
        ));

        let short = series(StrategyKind::EqualWeight, vec![0.01]);
        assert!(matches!(
            tester().compare(&short, &short.clone()),
            Err(BacktestError::DegenerateSeries(_))
        ));
    }

    #[test]
    fn test_pairwise_covers_all_pairs() {
        let all = vec![
            series(StrategyKind::EqualWeight, wavy(36, 0.008, 0.0)),
            series(StrategyKind::MeanVariance, wavy(36, 0.010, 0.01)),
            series(StrategyKind::RiskParity, wavy(36, 0.009, 0.005)),
        ];
        let results = SignificanceTester::new(SignificanceConfig::default().with_iterations(50))
            .pairwise(&all)
            .unwrap();
        let pairs: Vec<_> = results.iter().map(|r| (r.first, r.second)).collect();
        assert_eq!(
            pairs,
            vec![
                (StrategyKind::EqualWeight, StrategyKind::MeanVariance),
                (StrategyKind::EqualWeight, StrategyKind::RiskParity),
                (StrategyKind::MeanVariance, StrategyKind::RiskParity),
            ]
        );
    }
}
