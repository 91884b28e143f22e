//! Equal risk contribution (ERC) portfolio.
//!
//! Weights solve `w_i (Σw)_i = w_j (Σw)_j` for all pairs. The solution is
//! the normalized minimizer of the strictly convex
//!
//! ```text
//! f(y) = ½ yᵀΣy − (1/n) Σ_i ln y_i,   y > 0
//! ```
//!
//! found by cyclical coordinate descent: each coordinate has the closed-form
//! positive root `y_i = (−a_i + √(a_i² + 4σ_ii/n)) / (2σ_ii)` with
//! `a_i = Σ_{j≠i} σ_ij y_j`.
//!
//! When that solution leaves the weight box, the offending assets are pinned
//! at their bound and the same sweep runs over the free assets in absolute
//! weights, targeting a common contribution `c` in `w_i (Σw)_i = c`. The level
//! `c` is rescaled until the free weights absorb the budget the pins leave.
//! Pins are added and released until the pinned set stops changing.

use super::{equal_weights, inverse_volatility_weights, Allocation, Allocator};
use crate::estimation::MomentEstimate;
use crate::types::{AllocationFlag, StrategyKind, WeightBounds};
use nalgebra::{DMatrix, DVector};
use std::iter;
use tracing::{debug, warn};

/// Relative slack before a pinned asset is released back to the free set.
const RELEASE_MARGIN: f64 = 1e-4;

/// Rescaling steps allowed when matching the free budget.
const MAX_LEVEL_STEPS: usize = 200;

/// Risk parity under box constraints.
#[derive(Debug, Clone)]
pub struct RiskParityAllocator {
    bounds: WeightBounds,
    max_iter: usize,
    tolerance: f64,
}

/// Outcome of the ERC iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum ErcSolution {
    Converged { weights: Vec<f64>, iterations: usize },
    /// Parity across the free assets, with `pinned` assets held at a bound.
    Bounded { weights: Vec<f64>, pinned: usize },
    Exhausted { iterations: usize, max_deviation: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pin {
    Free,
    Lower,
    Upper,
}

impl RiskParityAllocator {
    pub fn new(bounds: WeightBounds) -> Self {
        Self {
            bounds,
            max_iter: 10_000,
            tolerance: 1e-6,
        }
    }

    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Run the coordinate descent from inverse-volatility starting weights,
    /// then enforce the weight box.
    ///
    /// `None` when the covariance has a zero or non-finite variance.
    pub fn solve(&self, estimate: &MomentEstimate) -> Option<ErcSolution> {
        let start = inverse_volatility_weights(estimate)?;
        if estimate.covariance.iter().any(|v| !v.is_finite()) {
            return None;
        }

        Some(match self.solve_unbounded(estimate, start) {
            ErcSolution::Converged { weights, .. }
                if !weights.iter().all(|&w| self.bounds.contains(w, 0.0)) =>
            {
                self.solve_bounded(estimate, weights)
            }
            solution => solution,
        })
    }

    fn solve_unbounded(&self, estimate: &MomentEstimate, start: Vec<f64>) -> ErcSolution {
        let n = estimate.n_assets();
        let budget = 1.0 / n as f64;
        let cov = &estimate.covariance;

        let sweep = |y: &Vec<f64>| -> Vec<f64> {
            let mut next = y.clone();
            for i in 0..n {
                next[i] = coordinate_root(cov, &next, i, budget);
            }
            next
        };

        let mut last_gap = f64::INFINITY;
        let found = iter::successors(Some(start), |y| Some(sweep(y)))
            .take(self.max_iter + 1)
            .enumerate()
            .find(|(_, y)| {
                last_gap = contribution_gap(estimate, y);
                last_gap < self.tolerance
            });

        match found {
            Some((iterations, y)) => {
                let total: f64 = y.iter().sum();
                ErcSolution::Converged {
                    weights: y.iter().map(|v| v / total).collect(),
                    iterations,
                }
            }
            None => ErcSolution::Exhausted {
                iterations: self.max_iter,
                max_deviation: last_gap,
            },
        }
    }

    /// Active-set loop over the box, starting from the unbounded solution.
    fn solve_bounded(&self, estimate: &MomentEstimate, mut weights: Vec<f64>) -> ErcSolution {
        let n = weights.len();
        let cov = &estimate.covariance;
        let WeightBounds { lower, upper } = self.bounds;
        let mut pins = vec![Pin::Free; n];
        let mut sweeps = 0;

        for _ in 0..=2 * n {
            let mut changed = false;
            for (pin, &w) in pins.iter_mut().zip(&weights) {
                if *pin == Pin::Free && w > upper {
                    *pin = Pin::Upper;
                    changed = true;
                } else if *pin == Pin::Free && w < lower {
                    *pin = Pin::Lower;
                    changed = true;
                }
            }

            if !changed {
                if let Some(level) = free_level(cov, &weights, &pins) {
                    let contributions = absolute_contributions(cov, &weights);
                    for (pin, c) in pins.iter_mut().zip(contributions) {
                        let release = match *pin {
                            Pin::Upper => c > level * (1.0 + RELEASE_MARGIN),
                            Pin::Lower => c < level * (1.0 - RELEASE_MARGIN),
                            Pin::Free => false,
                        };
                        if release {
                            *pin = Pin::Free;
                            changed = true;
                        }
                    }
                }
            }

            if !changed {
                let pinned = pins.iter().filter(|p| **p != Pin::Free).count();
                return if pinned == 0 {
                    ErcSolution::Converged {
                        weights,
                        iterations: sweeps,
                    }
                } else {
                    ErcSolution::Bounded { weights, pinned }
                };
            }

            for (w, pin) in weights.iter_mut().zip(&pins) {
                match pin {
                    Pin::Upper => *w = upper,
                    Pin::Lower => *w = lower,
                    Pin::Free => {}
                }
            }
            match self.fill_free(cov, &pins, &mut weights) {
                Some(used) => sweeps += used,
                None => break,
            }
        }

        ErcSolution::Exhausted {
            iterations: sweeps,
            max_deviation: contribution_gap(estimate, &weights),
        }
    }

    /// Spread the budget left by the pins over the free assets at equal risk.
    ///
    /// Returns the sweeps used, or `None` when the budget cannot be met.
    fn fill_free(&self, cov: &DMatrix<f64>, pins: &[Pin], weights: &mut [f64]) -> Option<usize> {
        let free: Vec<usize> = (0..pins.len()).filter(|&i| pins[i] == Pin::Free).collect();
        let pinned_total: f64 = (0..pins.len())
            .filter(|&i| pins[i] != Pin::Free)
            .map(|i| weights[i])
            .sum();
        let budget = 1.0 - pinned_total;

        if free.is_empty() {
            return (budget.abs() < 1e-9).then_some(0);
        }
        if budget <= 0.0 {
            return None;
        }

        let held: f64 = free.iter().map(|&i| weights[i]).sum();
        for &i in &free {
            weights[i] = if held > 0.0 {
                weights[i] * budget / held
            } else {
                budget / free.len() as f64
            };
        }

        let mut level = free
            .iter()
            .map(|&i| cov[(i, i)] * weights[i] * weights[i])
            .sum::<f64>()
            / free.len() as f64;
        let (mut below, mut above) = (0.0, f64::INFINITY);
        let mut sweeps = 0;

        for _ in 0..MAX_LEVEL_STEPS {
            sweeps += self.sweep_at_level(cov, &free, level, weights)?;
            let held: f64 = free.iter().map(|&i| weights[i]).sum();
            let miss = held / budget - 1.0;
            if miss.abs() < 1e-12 {
                break;
            }
            if miss < 0.0 {
                below = level;
            } else {
                above = level;
            }

            let proposal = level * (budget / held).powi(2);
            level = if proposal > below && proposal < above {
                proposal
            } else if above.is_infinite() {
                level * 4.0
            } else if below > 0.0 {
                (below * above).sqrt()
            } else {
                above * 0.5
            };
        }

        let held: f64 = free.iter().map(|&i| weights[i]).sum();
        if !held.is_finite() || (held / budget - 1.0).abs() > 1e-6 {
            return None;
        }
        for &i in &free {
            weights[i] *= budget / held;
        }
        Some(sweeps)
    }

    /// Sweep the free coordinates toward `w_i (Σw)_i = level`.
    fn sweep_at_level(
        &self,
        cov: &DMatrix<f64>,
        free: &[usize],
        level: f64,
        weights: &mut [f64],
    ) -> Option<usize> {
        for sweep in 1..=self.max_iter.max(1) {
            for &i in free {
                weights[i] = coordinate_root(cov, weights, i, level);
            }
            let contributions = absolute_contributions(cov, weights);
            let (lo, hi) = free.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &i| {
                (lo.min(contributions[i]), hi.max(contributions[i]))
            });
            if (hi - lo) / level < self.tolerance {
                return Some(sweep);
            }
        }
        None
    }
}

/// Positive root of `σ_ii w_i² + a_i w_i = level` for coordinate `i`.
fn coordinate_root(cov: &DMatrix<f64>, weights: &[f64], i: usize, level: f64) -> f64 {
    let sigma_ii = cov[(i, i)];
    let a: f64 = (0..weights.len())
        .filter(|&j| j != i)
        .map(|j| cov[(i, j)] * weights[j])
        .sum();
    (-a + (a * a + 4.0 * sigma_ii * level).sqrt()) / (2.0 * sigma_ii)
}

/// Unnormalized risk contributions `w_i (Σw)_i`.
fn absolute_contributions(cov: &DMatrix<f64>, weights: &[f64]) -> Vec<f64> {
    let w = DVector::from_column_slice(weights);
    let marginal = cov * &w;
    w.iter().zip(marginal.iter()).map(|(a, b)| a * b).collect()
}

/// Mean contribution across the free assets.
fn free_level(cov: &DMatrix<f64>, weights: &[f64], pins: &[Pin]) -> Option<f64> {
    let contributions = absolute_contributions(cov, weights);
    let free: Vec<f64> = contributions
        .iter()
        .zip(pins)
        .filter(|(_, pin)| **pin == Pin::Free)
        .map(|(c, _)| *c)
        .collect();
    (!free.is_empty()).then(|| free.iter().sum::<f64>() / free.len() as f64)
}

/// Largest pairwise difference between risk contributions normalized to sum to one.
pub fn contribution_gap(estimate: &MomentEstimate, weights: &[f64]) -> f64 {
    let contributions = estimate.risk_contributions(weights);
    if contributions.iter().any(|c| !c.is_finite()) {
        return f64::INFINITY;
    }
    let max = contributions.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let min = contributions.iter().cloned().fold(f64::INFINITY, f64::min);
    max - min
}

impl Allocator for RiskParityAllocator {
    fn kind(&self) -> StrategyKind {
        StrategyKind::RiskParity
    }

    fn allocate(&self, estimate: &MomentEstimate, _risk_free: f64) -> Allocation {
        match self.solve(estimate) {
            Some(ErcSolution::Converged {
                weights,
                iterations,
            }) => {
                debug!("Risk parity converged after {} sweeps", iterations);
                Allocation::new(weights)
            }
            Some(ErcSolution::Bounded { weights, pinned }) => {
                let max_deviation = contribution_gap(estimate, &weights);
                debug!("Risk parity held {} asset(s) at a weight bound", pinned);
                Allocation::flagged(
                    weights,
                    AllocationFlag::ConstrainedParity {
                        pinned,
                        max_deviation,
                    },
                )
            }
            Some(ErcSolution::Exhausted {
                iterations,
                max_deviation,
            }) => {
                warn!(
                    "Risk parity did not converge in {} sweeps (gap {:.2e}), using inverse volatility",
                    iterations, max_deviation
                );
                let fallback = inverse_volatility_weights(estimate)
                    .unwrap_or_else(|| equal_weights(estimate.n_assets()));
                Allocation::flagged(
                    self.bounds.project(&fallback),
                    AllocationFlag::PartialConvergence {
                        iterations,
                        max_deviation,
                    },
                )
            }
            None => {
                let reason = "covariance has a zero or non-finite variance".to_string();
                warn!("Risk parity fallback to equal weights: {}", reason);
                Allocation::flagged(
                    equal_weights(estimate.n_assets()),
                    AllocationFlag::OptimizerFallback { reason },
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn correlated_estimate() -> MomentEstimate {
        MomentEstimate::from_rows(
            &[0.0; 3],
            &[
                vec![0.0100, 0.0030, 0.0010],
                vec![0.0030, 0.0400, 0.0060],
                vec![0.0010, 0.0060, 0.0900],
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_equal_risk_contributions() {
        let estimate = correlated_estimate();
        let allocation = RiskParityAllocator::new(WeightBounds::default()).allocate(&estimate, 0.0);
        assert!(allocation.flag.is_none());
        assert!((allocation.weights.iter().sum::<f64>() - 1.0).abs() < 1e-12);

        let rc = estimate.risk_contributions(&allocation.weights);
        for c in &rc {
            assert!((c - 1.0 / 3.0).abs() < 1e-6);
        }
        assert!(allocation.weights[0] > allocation.weights[1]);
        assert!(allocation.weights[1] > allocation.weights[2]);
    }

    #[test]
    fn test_diagonal_matches_inverse_volatility() {
        let estimate = MomentEstimate::from_rows(
            &[0.0; 3],
            &[
                vec![0.01, 0.0, 0.0],
                vec![0.0, 0.04, 0.0],
                vec![0.0, 0.0, 0.16],
            ],
        )
        .unwrap();
        let allocation = RiskParityAllocator::new(WeightBounds::default()).allocate(&estimate, 0.0);
        let expected = inverse_volatility_weights(&estimate).unwrap();
        for (w, e) in allocation.weights.iter().zip(&expected) {
            assert!((w - e).abs() < 1e-10);
        }
    }

    #[test]
    fn test_iteration_cap_flags_partial_convergence() {
        let allocation = RiskParityAllocator::new(WeightBounds::default())
            .with_max_iter(0)
            .with_tolerance(1e-15)
            .allocate(&correlated_estimate(), 0.0);
        assert!(matches!(
            allocation.flag,
            Some(AllocationFlag::PartialConvergence { iterations: 0, .. })
        ));
        let expected = inverse_volatility_weights(&correlated_estimate()).unwrap();
        for (w, e) in allocation.weights.iter().zip(&expected) {
            assert!((w - e).abs() < 1e-12);
        }
    }

    #[test]
    fn test_zero_variance_falls_back() {
        let estimate =
            MomentEstimate::from_rows(&[0.0; 2], &[vec![0.0, 0.0], vec![0.0, 0.04]]).unwrap();
        let allocation = RiskParityAllocator::new(WeightBounds::default()).allocate(&estimate, 0.0);
        assert_eq!(allocation.weights, vec![0.5, 0.5]);
        assert!(matches!(
            allocation.flag,
            Some(AllocationFlag::OptimizerFallback { .. })
        ));
    }

    #[test]
    fn test_bounds_are_respected() {
        let bounds = WeightBounds::new(0.0, 0.45);
        let estimate = correlated_estimate();
        let allocation = RiskParityAllocator::new(bounds).allocate(&estimate, 0.0);
        assert!(allocation.weights.iter().all(|&w| bounds.contains(w, 1e-12)));
        assert!((allocation.weights.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!((allocation.weights[0] - 0.45).abs() < 1e-12);
        assert!(matches!(
            allocation.flag,
            Some(AllocationFlag::ConstrainedParity { pinned: 1, .. })
        ));

        let cov = &estimate.covariance;
        let rc = absolute_contributions(cov, &allocation.weights);
        assert!((rc[1] - rc[2]).abs() / rc[1] < 1e-4);
    }

    #[test]
    fn test_capped_asset_leaves_parity_to_the_rest() {
        let estimate = MomentEstimate::from_rows(
            &[0.0; 3],
            &[
                vec![0.0025, 0.0, 0.0],
                vec![0.0, 0.04, 0.0],
                vec![0.0, 0.0, 0.09],
            ],
        )
        .unwrap();
        let allocation =
            RiskParityAllocator::new(WeightBounds::new(0.0, 0.40)).allocate(&estimate, 0.0);

        assert!((allocation.weights[0] - 0.40).abs() < 1e-12);
        assert!((allocation.weights[1] - 0.36).abs() < 1e-6);
        assert!((allocation.weights[2] - 0.24).abs() < 1e-6);

        let rc = estimate.risk_contributions(&allocation.weights);
        assert!((rc[1] - rc[2]).abs() < 1e-6);
        assert!(rc[0] < rc[1]);
        match allocation.flag {
            Some(AllocationFlag::ConstrainedParity {
                pinned,
                max_deviation,
            }) => {
                assert_eq!(pinned, 1);
                assert!(max_deviation > 0.4);
            }
            other => panic!("expected ConstrainedParity, got {:?}", other),
        }
    }

    #[test]
    fn test_floor_lifts_low_risk_share() {
        // Unbounded weights are [0.2, 0.4, 0.4]; a 0.25 floor binds on the first asset.
        let estimate = MomentEstimate::from_rows(
            &[0.0; 3],
            &[
                vec![0.04, 0.0, 0.0],
                vec![0.0, 0.01, 0.0],
                vec![0.0, 0.0, 0.01],
            ],
        )
        .unwrap();
        let allocation =
            RiskParityAllocator::new(WeightBounds::new(0.25, 1.0)).allocate(&estimate, 0.0);

        assert!((allocation.weights[0] - 0.25).abs() < 1e-12);
        assert!((allocation.weights[1] - 0.375).abs() < 1e-6);
        assert!((allocation.weights[2] - 0.375).abs() < 1e-6);
        assert!(matches!(
            allocation.flag,
            Some(AllocationFlag::ConstrainedParity { pinned: 1, .. })
        ));
    }

    #[test]
    fn test_slack_bounds_keep_unflagged_solution() {
        let allocation = RiskParityAllocator::new(WeightBounds::new(0.05, 0.9))
            .allocate(&correlated_estimate(), 0.0);
        assert!(allocation.flag.is_none());
        let rc = correlated_estimate().risk_contributions(&allocation.weights);
        for c in &rc {
            assert!((c - 1.0 / 3.0).abs() < 1e-6);
        }
    }
}
