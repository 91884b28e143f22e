//! Rolling estimation of mean and covariance inputs.
//!
//! The [`Estimator`] turns one [`EstimationWindow`] of a [`ReturnMatrix`] into a
//! [`MomentEstimate`]: arithmetic means and the sample covariance (N-1
//! denominator), optionally shrunk towards a structured target.
//!
//! Shrinkage blends the sample covariance `S` with a target `F`:
//!
//! ```text
//! Σ = δ·F + (1 − δ)·S
//! ```
//!
//! With [`Shrinkage::Auto`] the intensity `δ` is the Ledoit-Wolf analytic
//! choice minimizing the expected Frobenius loss, `δ = clamp((π̂ − ρ̂) / (γ̂·T), 0, 1)`,
//! where `π̂` sums the asymptotic variances of the sample covariance entries,
//! `ρ̂` their covariance with the target, and `γ̂ = ‖F − S‖²`.

use crate::error::{BacktestError, Result};
use crate::types::ReturnMatrix;
use crate::walkforward::EstimationWindow;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Structured covariance target used for shrinkage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShrinkageTarget {
    /// Sample variances with a single average correlation off the diagonal.
    #[default]
    ConstantCorrelation,
    /// Sample variances, zero covariances.
    Diagonal,
    /// Average sample variance times the identity.
    ScaledIdentity,
}

/// How much to shrink the sample covariance.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", content = "intensity", rename_all = "snake_case")]
pub enum Shrinkage {
    /// Plain sample covariance.
    #[default]
    None,
    /// Fixed intensity in `[0, 1]`.
    Fixed(f64),
    /// Ledoit-Wolf analytic intensity.
    Auto,
}

/// Estimator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimatorConfig {
    /// Minimum observations a window must hold.
    pub min_observations: usize,
    pub shrinkage: Shrinkage,
    pub target: ShrinkageTarget,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            min_observations: 12,
            shrinkage: Shrinkage::None,
            target: ShrinkageTarget::ConstantCorrelation,
        }
    }
}

impl EstimatorConfig {
    pub fn validate(&self) -> Result<()> {
        if let Shrinkage::Fixed(intensity) = self.shrinkage {
            if !(0.0..=1.0).contains(&intensity) {
                return Err(BacktestError::ConfigError(format!(
                    "Shrinkage intensity must lie in [0, 1], got {}",
                    intensity
                )));
            }
        }
        Ok(())
    }

    /// Smallest window length accepted for `n_assets`.
    ///
    /// Without shrinkage the window must hold at least one observation per
    /// asset; a covariance needs at least two observations in any case.
    pub fn required_observations(&self, n_assets: usize) -> usize {
        let floor = match self.shrinkage {
            Shrinkage::None => n_assets,
            _ => 0,
        };
        self.min_observations.max(floor).max(2)
    }
}

/// Mean vector and covariance matrix estimated from one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MomentEstimate {
    pub mean: DVector<f64>,
    pub covariance: DMatrix<f64>,
    /// Observations the estimate was built from.
    pub observations: usize,
    /// Shrinkage intensity applied (0 for the raw sample covariance).
    pub shrinkage_intensity: f64,
    pub shrinkage_target: Option<ShrinkageTarget>,
}

impl MomentEstimate {
    /// Wrap externally supplied moments. The covariance is symmetrized.
    pub fn new(mean: DVector<f64>, covariance: DMatrix<f64>) -> Result<Self> {
        let n = mean.len();
        if covariance.nrows() != n || covariance.ncols() != n {
            return Err(BacktestError::InvalidInput(format!(
                "Covariance is {}x{}, expected {}x{}",
                covariance.nrows(),
                covariance.ncols(),
                n,
                n
            )));
        }
        Ok(Self {
            mean,
            covariance: symmetrize(covariance),
            observations: 0,
            shrinkage_intensity: 0.0,
            shrinkage_target: None,
        })
    }

    /// Convenience constructor from plain vectors.
    pub fn from_rows(mean: &[f64], covariance: &[Vec<f64>]) -> Result<Self> {
        let n = mean.len();
        if covariance.len() != n || covariance.iter().any(|row| row.len() != n) {
            return Err(BacktestError::InvalidInput(
                "Covariance matrix must be square and match the mean vector".to_string(),
            ));
        }
        Self::new(
            DVector::from_column_slice(mean),
            DMatrix::from_fn(n, n, |i, j| covariance[i][j]),
        )
    }

    pub fn n_assets(&self) -> usize {
        self.mean.len()
    }

    /// Per-asset standard deviations.
    pub fn volatilities(&self) -> Vec<f64> {
        self.covariance
            .diagonal()
            .iter()
            .map(|v| v.max(0.0).sqrt())
            .collect()
    }

    /// True when the covariance is finite and admits a Cholesky factorization.
    pub fn is_positive_definite(&self) -> bool {
        self.covariance.iter().all(|v| v.is_finite())
            && self.covariance.clone().cholesky().is_some()
    }

    /// Portfolio variance `wᵀΣw`.
    pub fn portfolio_variance(&self, weights: &[f64]) -> f64 {
        let w = DVector::from_column_slice(weights);
        (w.transpose() * &self.covariance * &w)[(0, 0)]
    }

    /// Expected portfolio return `μᵀw`.
    pub fn portfolio_return(&self, weights: &[f64]) -> f64 {
        self.mean
            .iter()
            .zip(weights)
            .map(|(m, w)| m * w)
            .sum()
    }

    /// Risk contributions `w_i (Σw)_i`, normalized to sum to one.
    pub fn risk_contributions(&self, weights: &[f64]) -> Vec<f64> {
        let w = DVector::from_column_slice(weights);
        let marginal = &self.covariance * &w;
        let contributions: Vec<f64> = w.iter().zip(marginal.iter()).map(|(a, b)| a * b).collect();
        let total: f64 = contributions.iter().sum();
        if total.abs() > 0.0 {
            contributions.iter().map(|c| c / total).collect()
        } else {
            contributions
        }
    }
}

/// Estimates moments from windows of a return matrix.
#[derive(Debug, Clone, Default)]
pub struct Estimator {
    config: EstimatorConfig,
}

impl Estimator {
    pub fn new(config: EstimatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    /// Estimate moments over `window`. Pure function of its inputs.
    pub fn estimate(&self, matrix: &ReturnMatrix, window: &EstimationWindow) -> Result<MomentEstimate> {
        let n = matrix.n_assets();
        let t = window.len();
        let required = self.config.required_observations(n);

        if t < required {
            return Err(BacktestError::InsufficientHistory {
                required,
                available: t,
            });
        }
        if window.end > matrix.len() {
            return Err(BacktestError::InvalidInput(format!(
                "Window [{}, {}) exceeds matrix of {} rows",
                window.start,
                window.end,
                matrix.len()
            )));
        }

        let rows = matrix.rows(window.range());
        let x = DMatrix::from_fn(t, n, |i, j| rows[i][j]);
        let mean = DVector::from_fn(n, |j, _| x.column(j).mean());
        let centered = DMatrix::from_fn(t, n, |i, j| x[(i, j)] - mean[j]);
        let scatter = centered.transpose() * &centered;
        let sample = symmetrize(&scatter / (t as f64 - 1.0));

        let (covariance, intensity, target) = match self.config.shrinkage {
            Shrinkage::None => (sample, 0.0, None),
            Shrinkage::Fixed(intensity) => {
                let target = target_matrix(&sample, self.config.target);
                (blend(&target, &sample, intensity), intensity, Some(self.config.target))
            }
            Shrinkage::Auto => {
                let biased = symmetrize(&scatter / t as f64);
                let intensity = ledoit_wolf_intensity(&centered, &biased, self.config.target);
                let target = target_matrix(&sample, self.config.target);
                (blend(&target, &sample, intensity), intensity, Some(self.config.target))
            }
        };

        debug!(
            "Estimated moments over rows [{}, {}): {} obs, shrinkage {:.4}",
            window.start, window.end, t, intensity
        );

        Ok(MomentEstimate {
            mean,
            covariance,
            observations: t,
            shrinkage_intensity: intensity,
            shrinkage_target: target,
        })
    }
}

fn symmetrize(matrix: DMatrix<f64>) -> DMatrix<f64> {
    (&matrix + matrix.transpose()) * 0.5
}

fn blend(target: &DMatrix<f64>, sample: &DMatrix<f64>, intensity: f64) -> DMatrix<f64> {
    target * intensity + sample * (1.0 - intensity)
}

/// Average pairwise correlation implied by a covariance matrix.
///
/// Pairs involving a zero-variance asset are left out.
fn average_correlation(covariance: &DMatrix<f64>) -> f64 {
    let n = covariance.nrows();
    let mut sum = 0.0;
    let mut pairs = 0usize;
    for i in 0..n {
        for j in (i + 1)..n {
            let denom = (covariance[(i, i)] * covariance[(j, j)]).sqrt();
            if denom > 0.0 {
                sum += covariance[(i, j)] / denom;
                pairs += 1;
            }
        }
    }
    if pairs == 0 {
        0.0
    } else {
        sum / pairs as f64
    }
}

fn target_matrix(covariance: &DMatrix<f64>, target: ShrinkageTarget) -> DMatrix<f64> {
    let n = covariance.nrows();
    match target {
        ShrinkageTarget::Diagonal => {
            DMatrix::from_fn(n, n, |i, j| if i == j { covariance[(i, i)] } else { 0.0 })
        }
        ShrinkageTarget::ScaledIdentity => {
            let scale = covariance.trace() / n as f64;
            DMatrix::from_diagonal_element(n, n, scale)
        }
        ShrinkageTarget::ConstantCorrelation => {
            let r_bar = average_correlation(covariance);
            DMatrix::from_fn(n, n, |i, j| {
                if i == j {
                    covariance[(i, i)]
                } else {
                    r_bar * (covariance[(i, i)] * covariance[(j, j)]).sqrt()
                }
            })
        }
    }
}

/// Ledoit-Wolf optimal shrinkage intensity.
///
/// `centered` is the demeaned T×N window and `biased` its covariance with a
/// `1/T` denominator, as in the original derivation.
fn ledoit_wolf_intensity(
    centered: &DMatrix<f64>,
    biased: &DMatrix<f64>,
    target: ShrinkageTarget,
) -> f64 {
    let (t, n) = centered.shape();
    let tf = t as f64;
    let f = target_matrix(biased, target);

    // π_ij: asymptotic variance of the (i, j) sample covariance entry.
    let mut pi = DMatrix::<f64>::zeros(n, n);
    for k in 0..t {
        for i in 0..n {
            for j in 0..n {
                let d = centered[(k, i)] * centered[(k, j)] - biased[(i, j)];
                pi[(i, j)] += d * d;
            }
        }
    }
    pi /= tf;
    let pi_hat: f64 = pi.sum();

    let gamma_hat = (&f - biased).norm_squared();
    if gamma_hat <= f64::EPSILON {
        return 0.0;
    }

    let rho_hat = match target {
        ShrinkageTarget::ScaledIdentity => 0.0,
        ShrinkageTarget::Diagonal => pi.diagonal().sum(),
        ShrinkageTarget::ConstantCorrelation => {
            let r_bar = average_correlation(biased);
            let mut off_diagonal = 0.0;
            for i in 0..n {
                for j in 0..n {
                    if i == j {
                        continue;
                    }
                    let (s_ii, s_jj) = (biased[(i, i)], biased[(j, j)]);
                    if s_ii <= 0.0 || s_jj <= 0.0 {
                        continue;
                    }
                    let (mut theta_ii, mut theta_jj) = (0.0, 0.0);
                    for k in 0..t {
                        let cross = centered[(k, i)] * centered[(k, j)] - biased[(i, j)];
                        theta_ii += (centered[(k, i)].powi(2) - s_ii) * cross;
                        theta_jj += (centered[(k, j)].powi(2) - s_jj) * cross;
                    }
                    theta_ii /= tf;
                    theta_jj /= tf;
                    off_diagonal += (s_jj / s_ii).sqrt() * theta_ii + (s_ii / s_jj).sqrt() * theta_jj;
                }
            }
            pi.diagonal().sum() + r_bar / 2.0 * off_diagonal
        }
    };

    let kappa = (pi_hat - rho_hat) / gamma_hat;
    let intensity = (kappa / tf).clamp(0.0, 1.0);
    debug!(
        "Ledoit-Wolf: pi {:.3e}, rho {:.3e}, gamma {:.3e}, intensity {:.4}",
        pi_hat, rho_hat, gamma_hat, intensity
    );
    intensity
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn matrix_from(rows: Vec<Vec<f64>>) -> ReturnMatrix {
        let n = rows[0].len();
        let dates = (0..rows.len())
            .map(|i| {
                NaiveDate::from_ymd_opt(2000 + (i / 12) as i32, (i % 12) as u32 + 1, 1).unwrap()
            })
            .collect();
        let assets = (0..n).map(|j| format!("A{}", j)).collect();
        ReturnMatrix::new(dates, assets, rows).unwrap()
    }

    fn noisy_rows(t: usize, n: usize) -> Vec<Vec<f64>> {
        (0..t)
            .map(|i| {
                (0..n)
                    .map(|j| {
                        let x = i as f64 * 0.7 + j as f64 * 1.9;
                        0.01 + 0.03 * x.sin() + 0.01 * (x * 2.3).cos() * (j as f64 + 1.0)
                    })
                    .collect()
            })
            .collect()
    }

    #[test]
    fn test_sample_moments() {
        let matrix = matrix_from(vec![vec![0.01, 0.02], vec![0.03, 0.00], vec![0.02, 0.04]]);
        let estimator = Estimator::new(EstimatorConfig {
            min_observations: 2,
            ..Default::default()
        });
        let estimate = estimator
            .estimate(&matrix, &EstimationWindow::new(0, 3))
            .unwrap();

        assert!((estimate.mean[0] - 0.02).abs() < 1e-12);
        assert!((estimate.mean[1] - 0.02).abs() < 1e-12);
        // var(A0) = ((-.01)^2 + .01^2 + 0) / 2
        assert!((estimate.covariance[(0, 0)] - 1e-4).abs() < 1e-12);
        // cov = ((-.01)(0) + (.01)(-.02) + 0(.02)) / 2
        assert!((estimate.covariance[(0, 1)] + 1e-4).abs() < 1e-12);
        assert_eq!(estimate.covariance[(0, 1)], estimate.covariance[(1, 0)]);
        assert_eq!(estimate.shrinkage_intensity, 0.0);
    }

    #[test]
    fn test_insufficient_history() {
        let matrix = matrix_from(noisy_rows(30, 4));
        let estimator = Estimator::new(EstimatorConfig {
            min_observations: 24,
            ..Default::default()
        });
        let err = estimator
            .estimate(&matrix, &EstimationWindow::new(10, 20))
            .unwrap_err();
        assert!(matches!(
            err,
            BacktestError::InsufficientHistory {
                required: 24,
                available: 10
            }
        ));
    }

    #[test]
    fn test_minimum_covers_asset_count_without_shrinkage() {
        let config = EstimatorConfig {
            min_observations: 3,
            ..Default::default()
        };
        assert_eq!(config.required_observations(10), 10);

        let shrunk = EstimatorConfig {
            min_observations: 3,
            shrinkage: Shrinkage::Auto,
            ..Default::default()
        };
        assert_eq!(shrunk.required_observations(10), 3);
    }

    #[test]
    fn test_fixed_shrinkage_blends_towards_target() {
        let matrix = matrix_from(noisy_rows(24, 3));
        let window = EstimationWindow::new(0, 24);
        let sample = Estimator::new(EstimatorConfig::default())
            .estimate(&matrix, &window)
            .unwrap();
        let shrunk = Estimator::new(EstimatorConfig {
            shrinkage: Shrinkage::Fixed(1.0),
            target: ShrinkageTarget::Diagonal,
            ..Default::default()
        })
        .estimate(&matrix, &window)
        .unwrap();

        for i in 0..3 {
            assert!((shrunk.covariance[(i, i)] - sample.covariance[(i, i)]).abs() < 1e-15);
            for j in 0..3 {
                if i != j {
                    assert_eq!(shrunk.covariance[(i, j)], 0.0);
                }
            }
        }
    }

    #[test]
    fn test_auto_shrinkage_intensity_in_unit_interval() {
        let matrix = matrix_from(noisy_rows(24, 6));
        for target in [
            ShrinkageTarget::ConstantCorrelation,
            ShrinkageTarget::Diagonal,
            ShrinkageTarget::ScaledIdentity,
        ] {
            let estimate = Estimator::new(EstimatorConfig {
                shrinkage: Shrinkage::Auto,
                target,
                ..Default::default()
            })
            .estimate(&matrix, &EstimationWindow::new(0, 24))
            .unwrap();
            assert!((0.0..=1.0).contains(&estimate.shrinkage_intensity));
            assert_eq!(estimate.shrinkage_target, Some(target));
            assert!(estimate.is_positive_definite());
        }
    }

    #[test]
    fn test_shrinkage_restores_definiteness_of_short_window() {
        // 4 observations for 6 assets: the sample covariance is singular.
        let matrix = matrix_from(noisy_rows(4, 6));
        let window = EstimationWindow::new(0, 4);
        let sample = Estimator::new(EstimatorConfig {
            min_observations: 2,
            shrinkage: Shrinkage::Fixed(0.0),
            ..Default::default()
        })
        .estimate(&matrix, &window)
        .unwrap();
        assert!(!sample.is_positive_definite());

        let shrunk = Estimator::new(EstimatorConfig {
            min_observations: 2,
            shrinkage: Shrinkage::Fixed(0.5),
            target: ShrinkageTarget::Diagonal,
        })
        .estimate(&matrix, &window)
        .unwrap();
        assert!(shrunk.is_positive_definite());
    }

    #[test]
    fn test_invalid_fixed_intensity_rejected() {
        let config = EstimatorConfig {
            shrinkage: Shrinkage::Fixed(1.5),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_risk_contributions_sum_to_one() {
        let estimate = MomentEstimate::from_rows(
            &[0.01, 0.02],
            &[vec![0.04, 0.01], vec![0.01, 0.09]],
        )
        .unwrap();
        let rc = estimate.risk_contributions(&[0.5, 0.5]);
        assert!((rc.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!(rc[1] > rc[0]);
    }
}
