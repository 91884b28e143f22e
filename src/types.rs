//! Core data types shared by the estimator, allocators and engine.

use crate::error::{BacktestError, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

/// Dense matrix of periodic (monthly) asset returns.
///
/// Rows are chronological observations, columns follow [`ReturnMatrix::assets`].
/// Missing data must be resolved before construction: any non-finite value is
/// rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReturnMatrix {
    dates: Vec<NaiveDate>,
    assets: Vec<String>,
    rows: Vec<Vec<f64>>,
}

impl ReturnMatrix {
    /// Build a validated return matrix.
    pub fn new(dates: Vec<NaiveDate>, assets: Vec<String>, rows: Vec<Vec<f64>>) -> Result<Self> {
        if assets.is_empty() {
            return Err(BacktestError::DataError(
                "Return matrix needs at least one asset".to_string(),
            ));
        }
        if dates.len() != rows.len() {
            return Err(BacktestError::DataError(format!(
                "{} dates but {} return rows",
                dates.len(),
                rows.len()
            )));
        }
        for (i, row) in rows.iter().enumerate() {
            if row.len() != assets.len() {
                return Err(BacktestError::DataError(format!(
                    "Row {} ({}) has {} values, expected {}",
                    i,
                    dates[i],
                    row.len(),
                    assets.len()
                )));
            }
            if let Some(j) = row.iter().position(|r| !r.is_finite()) {
                return Err(BacktestError::DataError(format!(
                    "Missing or non-finite return for {} on {}",
                    assets[j], dates[i]
                )));
            }
        }
        if let Some(w) = dates.windows(2).find(|w| w[1] <= w[0]) {
            return Err(BacktestError::DataError(format!(
                "Dates must be strictly increasing: {} followed by {}",
                w[0], w[1]
            )));
        }

        Ok(Self {
            dates,
            assets,
            rows,
        })
    }

    /// Number of observations (rows).
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Number of assets (columns).
    pub fn n_assets(&self) -> usize {
        self.assets.len()
    }

    pub fn assets(&self) -> &[String] {
        &self.assets
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn date(&self, row: usize) -> NaiveDate {
        self.dates[row]
    }

    pub fn row(&self, row: usize) -> &[f64] {
        &self.rows[row]
    }

    /// Rows in `range`, in chronological order.
    pub fn rows(&self, range: Range<usize>) -> &[Vec<f64>] {
        &self.rows[range]
    }

    /// Copy out a single asset's return history.
    pub fn column(&self, asset: usize) -> Vec<f64> {
        self.rows.iter().map(|row| row[asset]).collect()
    }
}

/// Risk-free rate input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RiskFreeRate {
    /// Constant annual rate, compounded down to the periodic equivalent.
    Annual(f64),
    /// Periodic rates aligned one-to-one with the return matrix rows.
    Periodic(Vec<f64>),
}

impl Default for RiskFreeRate {
    fn default() -> Self {
        RiskFreeRate::Annual(0.0)
    }
}

impl RiskFreeRate {
    /// Check that a periodic series covers every row of the matrix.
    pub fn validate(&self, rows: usize) -> Result<()> {
        match self {
            RiskFreeRate::Annual(rate) if !rate.is_finite() || *rate <= -1.0 => Err(
                BacktestError::InvalidInput(format!("Invalid annual risk-free rate {}", rate)),
            ),
            RiskFreeRate::Periodic(rates) if rates.len() != rows => {
                Err(BacktestError::InvalidInput(format!(
                    "Risk-free series has {} rates, return matrix has {} rows",
                    rates.len(),
                    rows
                )))
            }
            RiskFreeRate::Periodic(rates) if rates.iter().any(|r| !r.is_finite()) => Err(
                BacktestError::InvalidInput("Risk-free series contains non-finite rates".into()),
            ),
            _ => Ok(()),
        }
    }

    /// Periodic rate applying to `row`.
    pub fn periodic(&self, row: usize, periods_per_year: f64) -> f64 {
        match self {
            RiskFreeRate::Annual(rate) => (1.0 + rate).powf(1.0 / periods_per_year) - 1.0,
            RiskFreeRate::Periodic(rates) => rates[row],
        }
    }

    /// Periodic rates for `range`, aligned with the matrix rows.
    pub fn aligned(&self, range: Range<usize>, periods_per_year: f64) -> Vec<f64> {
        range.map(|row| self.periodic(row, periods_per_year)).collect()
    }

    /// Average periodic rate over an estimation window.
    pub fn window_mean(&self, range: Range<usize>, periods_per_year: f64) -> f64 {
        let len = range.len();
        if len == 0 {
            return 0.0;
        }
        self.aligned(range, periods_per_year).iter().sum::<f64>() / len as f64
    }
}

/// The portfolio construction rules under comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    EqualWeight,
    MeanVariance,
    RiskParity,
}

impl StrategyKind {
    /// All strategies, in reporting order.
    pub const ALL: [StrategyKind; 3] = [
        StrategyKind::EqualWeight,
        StrategyKind::MeanVariance,
        StrategyKind::RiskParity,
    ];

    /// Stable display name used as the key in exported tables.
    pub fn label(&self) -> &'static str {
        match self {
            StrategyKind::EqualWeight => "Equal Weight",
            StrategyKind::MeanVariance => "Mean-Variance",
            StrategyKind::RiskParity => "Risk Parity",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Record of a degraded allocation.
///
/// Attached to the rebalance event it affected so that a fallback can never be
/// mistaken for an unqualified optimal solve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "flag", rename_all = "snake_case")]
pub enum AllocationFlag {
    /// Solver abandoned or the problem was ill-posed; equal weights used instead.
    OptimizerFallback { reason: String },
    /// Risk parity hit its iteration cap; inverse-volatility weights used instead.
    PartialConvergence { iterations: usize, max_deviation: f64 },
    /// Some weights sit on a bound, so risk is equal only across the remaining assets.
    ConstrainedParity { pinned: usize, max_deviation: f64 },
    /// Moments could not be estimated for the date; equal weights used instead.
    EstimationFallback { reason: String },
}

impl AllocationFlag {
    pub fn label(&self) -> &'static str {
        match self {
            AllocationFlag::OptimizerFallback { .. } => "OptimizerFallback",
            AllocationFlag::PartialConvergence { .. } => "PartialConvergence",
            AllocationFlag::ConstrainedParity { .. } => "ConstrainedParity",
            AllocationFlag::EstimationFallback { .. } => "EstimationFallback",
        }
    }

    /// Human-readable reason for reports.
    pub fn reason(&self) -> String {
        match self {
            AllocationFlag::OptimizerFallback { reason }
            | AllocationFlag::EstimationFallback { reason } => reason.clone(),
            AllocationFlag::PartialConvergence {
                iterations,
                max_deviation,
            } => format!(
                "no convergence after {} iterations (max risk-contribution gap {:.2e})",
                iterations, max_deviation
            ),
            AllocationFlag::ConstrainedParity {
                pinned,
                max_deviation,
            } => format!(
                "{} asset(s) held at a weight bound, equal risk across the rest (full-universe gap {:.2e})",
                pinned, max_deviation
            ),
        }
    }
}

impl fmt::Display for AllocationFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.label(), self.reason())
    }
}

/// Per-asset weight limits shared by all allocators.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightBounds {
    pub lower: f64,
    pub upper: f64,
}

impl Default for WeightBounds {
    fn default() -> Self {
        Self {
            lower: 0.0,
            upper: 1.0,
        }
    }
}

impl WeightBounds {
    pub fn new(lower: f64, upper: f64) -> Self {
        Self { lower, upper }
    }

    /// Check that a fully-invested portfolio of `n_assets` fits inside the box.
    pub fn validate(&self, n_assets: usize) -> Result<()> {
        if !(self.lower.is_finite() && self.upper.is_finite()) || self.lower < 0.0 {
            return Err(BacktestError::ConfigError(format!(
                "Weight bounds must be finite and non-negative, got [{}, {}]",
                self.lower, self.upper
            )));
        }
        if self.lower > self.upper {
            return Err(BacktestError::ConfigError(format!(
                "Lower bound {} exceeds upper bound {}",
                self.lower, self.upper
            )));
        }
        let n = n_assets as f64;
        if self.lower * n > 1.0 + 1e-12 || self.upper * n < 1.0 - 1e-12 {
            return Err(BacktestError::ConfigError(format!(
                "Bounds [{}, {}] admit no fully-invested portfolio of {} assets",
                self.lower, self.upper, n_assets
            )));
        }
        Ok(())
    }

    pub fn contains(&self, weight: f64, tolerance: f64) -> bool {
        weight >= self.lower - tolerance && weight <= self.upper + tolerance
    }

    /// Clip weights into the box and redistribute the residual so they sum to one.
    ///
    /// The residual is spread in proportion to each asset's remaining room, so
    /// no weight is pushed back outside the box.
    pub fn project(&self, weights: &[f64]) -> Vec<f64> {
        let mut projected: Vec<f64> = weights
            .iter()
            .map(|w| w.clamp(self.lower, self.upper))
            .collect();

        for _ in 0..=projected.len() {
            let residual = 1.0 - projected.iter().sum::<f64>();
            if residual.abs() <= f64::EPSILON {
                break;
            }
            let room: Vec<f64> = projected
                .iter()
                .map(|&w| {
                    if residual > 0.0 {
                        self.upper - w
                    } else {
                        w - self.lower
                    }
                })
                .collect();
            let total_room: f64 = room.iter().sum();
            if total_room <= 0.0 {
                break;
            }
            let scale = (residual.abs() / total_room).min(1.0);
            for (w, r) in projected.iter_mut().zip(room) {
                *w += residual.signum() * r * scale;
            }
        }

        projected
    }
}

/// Effective number of holdings: the inverse Herfindahl-Hirschman index.
pub fn n_effective(weights: &[f64]) -> f64 {
    let hhi: f64 = weights.iter().map(|w| w * w).sum();
    if hhi > 0.0 {
        1.0 / hhi
    } else {
        0.0
    }
}

/// One-way turnover between two weight vectors.
pub fn turnover(from: &[f64], to: &[f64]) -> f64 {
    from.iter()
        .zip(to)
        .map(|(a, b)| (a - b).abs())
        .sum::<f64>()
        / 2.0
}

/// Realized periodic returns of one strategy, with the aligned risk-free rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealizedReturnSeries {
    pub strategy: StrategyKind,
    pub dates: Vec<NaiveDate>,
    pub returns: Vec<f64>,
    pub risk_free: Vec<f64>,
}

impl RealizedReturnSeries {
    pub fn len(&self) -> usize {
        self.returns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.returns.is_empty()
    }

    /// Returns in excess of the aligned risk-free rate.
    pub fn excess_returns(&self) -> Vec<f64> {
        self.returns
            .iter()
            .zip(&self.risk_free)
            .map(|(r, rf)| r - rf)
            .collect()
    }

    /// Cumulative value path starting from 1.0 (not included).
    pub fn cumulative_values(&self) -> Vec<f64> {
        self.returns
            .iter()
            .scan(1.0, |value, r| {
                *value *= 1.0 + r;
                Some(*value)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, 1).unwrap()
    }

    #[test]
    fn test_return_matrix_rejects_missing_values() {
        let result = ReturnMatrix::new(
            vec![date(2020, 1), date(2020, 2)],
            vec!["A".into(), "B".into()],
            vec![vec![0.01, 0.02], vec![f64::NAN, 0.01]],
        );
        assert!(matches!(result, Err(BacktestError::DataError(_))));
    }

    #[test]
    fn test_return_matrix_rejects_unordered_dates() {
        let result = ReturnMatrix::new(
            vec![date(2020, 2), date(2020, 1)],
            vec!["A".into()],
            vec![vec![0.01], vec![0.02]],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_return_matrix_accessors() {
        let matrix = ReturnMatrix::new(
            vec![date(2020, 1), date(2020, 2), date(2020, 3)],
            vec!["A".into(), "B".into()],
            vec![vec![0.01, 0.02], vec![0.03, 0.04], vec![0.05, 0.06]],
        )
        .unwrap();
        assert_eq!(matrix.len(), 3);
        assert_eq!(matrix.n_assets(), 2);
        assert_eq!(matrix.column(1), vec![0.02, 0.04, 0.06]);
        assert_eq!(matrix.rows(1..3).len(), 2);
    }

    #[test]
    fn test_annual_risk_free_compounds_back() {
        let rf = RiskFreeRate::Annual(0.12);
        let monthly = rf.periodic(0, 12.0);
        assert!(((1.0 + monthly).powi(12) - 1.12).abs() < 1e-12);
    }

    #[test]
    fn test_periodic_risk_free_length_checked() {
        let rf = RiskFreeRate::Periodic(vec![0.005; 10]);
        assert!(rf.validate(10).is_ok());
        assert!(rf.validate(11).is_err());
    }

    #[test]
    fn test_bounds_validation() {
        assert!(WeightBounds::new(0.0, 0.40).validate(4).is_ok());
        assert!(WeightBounds::new(0.0, 0.20).validate(4).is_err());
        assert!(WeightBounds::new(0.30, 1.0).validate(4).is_err());
    }

    #[test]
    fn test_projection_respects_bounds_and_budget() {
        let bounds = WeightBounds::new(0.05, 0.40);
        let projected = bounds.project(&[0.7, 0.2, 0.1, 0.0]);
        let sum: f64 = projected.iter().sum();
        assert!((sum - 1.0).abs() < 1e-12);
        assert!(projected.iter().all(|&w| bounds.contains(w, 1e-12)));
    }

    #[test]
    fn test_turnover_and_n_effective() {
        assert!((turnover(&[0.5, 0.5], &[1.0, 0.0]) - 0.5).abs() < 1e-12);
        assert!((n_effective(&[0.25; 4]) - 4.0).abs() < 1e-12);
        assert!((n_effective(&[1.0, 0.0]) - 1.0).abs() < 1e-12);
    }
}
