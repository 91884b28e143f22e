//! Maximum Sharpe ratio portfolio.
//!
//! The ratio `(μ − r_f)ᵀw / √(wᵀΣw)` is not convex in `w`, but the
//! Charnes-Cooper substitution `y = κw` turns it into a convex QP:
//!
//! ```text
//! minimize    ½ yᵀΣy
//! subject to  (μ − r_f)ᵀy = 1
//!             Σ_i y_i = κ
//!             lower·κ ≤ y_i ≤ upper·κ
//!             κ ≥ 0
//! ```
//!
//! and `w = y/κ`. The QP is handed to Clarabel.

use super::{equal_weights, Allocation, Allocator};
use crate::error::{BacktestError, Result};
use crate::estimation::MomentEstimate;
use crate::types::{AllocationFlag, StrategyKind, WeightBounds};
use tracing::{debug, warn};

/// Markowitz tangency portfolio under box constraints.
#[derive(Debug, Clone)]
pub struct MeanVarianceAllocator {
    bounds: WeightBounds,
    max_iter: u32,
    tolerance: f64,
}

impl MeanVarianceAllocator {
    pub fn new(bounds: WeightBounds) -> Self {
        Self {
            bounds,
            max_iter: 200,
            tolerance: 1e-8,
        }
    }

    pub fn with_max_iter(mut self, max_iter: u32) -> Self {
        self.max_iter = max_iter;
        self
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn bounds(&self) -> WeightBounds {
        self.bounds
    }

    /// Solve for the tangency weights, failing instead of falling back.
    pub fn maximum_sharpe(&self, estimate: &MomentEstimate, risk_free: f64) -> Result<Vec<f64>> {
        use clarabel::algebra::*;
        use clarabel::solver::*;

        let n = estimate.n_assets();
        let excess: Vec<f64> = estimate.mean.iter().map(|m| m - risk_free).collect();

        if excess.iter().any(|e| !e.is_finite()) {
            return Err(BacktestError::OptimizationError(
                "non-finite expected returns".to_string(),
            ));
        }
        if excess.iter().all(|&e| e <= 0.0) {
            return Err(BacktestError::OptimizationError(
                "no asset has a positive expected excess return".to_string(),
            ));
        }
        if !estimate.is_positive_definite() {
            return Err(BacktestError::OptimizationError(
                "covariance matrix is not positive definite".to_string(),
            ));
        }

        let cov = &estimate.covariance;
        let (lower, upper) = (self.bounds.lower, self.bounds.upper);

        // Variables x = [y_0 .. y_{n-1}, κ]. P holds the upper triangle of Σ.
        let mut p_data = Vec::new();
        let mut p_indices = Vec::new();
        let mut p_indptr = vec![0];
        for j in 0..n {
            for i in 0..=j {
                let val = cov[(i, j)];
                if val != 0.0 {
                    p_data.push(val);
                    p_indices.push(i);
                }
            }
            p_indptr.push(p_data.len());
        }
        p_indptr.push(p_data.len());
        let p = CscMatrix::new(n + 1, n + 1, p_indptr, p_indices, p_data);
        let q = vec![0.0; n + 1];

        // Rows: 0 excess return, 1 budget, 2..2+n upper, 2+n..2+2n lower, 2+2n κ ≥ 0.
        let rows = 2 * n + 3;
        let mut a_data = Vec::new();
        let mut a_indices = Vec::new();
        let mut a_indptr = vec![0];
        for (j, &e) in excess.iter().enumerate() {
            a_data.extend([e, 1.0, 1.0, -1.0]);
            a_indices.extend([0, 1, 2 + j, 2 + n + j]);
            a_indptr.push(a_data.len());
        }
        a_data.push(-1.0);
        a_indices.push(1);
        for i in 0..n {
            a_data.push(-upper);
            a_indices.push(2 + i);
        }
        if lower != 0.0 {
            for i in 0..n {
                a_data.push(lower);
                a_indices.push(2 + n + i);
            }
        }
        a_data.push(-1.0);
        a_indices.push(2 * n + 2);
        a_indptr.push(a_data.len());
        let a = CscMatrix::new(rows, n + 1, a_indptr, a_indices, a_data);

        let mut b = vec![1.0, 0.0];
        b.extend(vec![0.0; 2 * n + 1]);

        let cones = [ZeroConeT(2), NonnegativeConeT(2 * n + 1)];

        let settings = DefaultSettingsBuilder::default()
            .max_iter(self.max_iter)
            .tol_gap_abs(self.tolerance)
            .tol_gap_rel(self.tolerance)
            .tol_feas(self.tolerance)
            .verbose(false)
            .build()
            .map_err(|e| {
                BacktestError::OptimizationError(format!("Failed to build settings: {}", e))
            })?;

        let mut solver = DefaultSolver::new(&p, &q, &a, &b, &cones, settings).map_err(|e| {
            BacktestError::OptimizationError(format!("Failed to create solver: {:?}", e))
        })?;

        solver.solve();

        if !matches!(
            solver.solution.status,
            SolverStatus::Solved | SolverStatus::AlmostSolved
        ) {
            return Err(BacktestError::OptimizationError(format!(
                "solver stopped with status {:?} after {} iterations",
                solver.solution.status, solver.solution.iterations
            )));
        }
        debug!(
            "Max Sharpe solve: {:?} in {} iterations",
            solver.solution.status, solver.solution.iterations
        );

        let kappa = solver.solution.x[n];
        if !kappa.is_finite() || kappa <= 0.0 {
            return Err(BacktestError::OptimizationError(format!(
                "degenerate scaling variable {}",
                kappa
            )));
        }
        let weights: Vec<f64> = solver.solution.x[..n].iter().map(|y| y / kappa).collect();
        if weights.iter().any(|w| !w.is_finite()) {
            return Err(BacktestError::OptimizationError(
                "non-finite weights".to_string(),
            ));
        }

        Ok(self.bounds.project(&weights))
    }
}

impl Allocator for MeanVarianceAllocator {
    fn kind(&self) -> StrategyKind {
        StrategyKind::MeanVariance
    }

    fn allocate(&self, estimate: &MomentEstimate, risk_free: f64) -> Allocation {
        match self.maximum_sharpe(estimate, risk_free) {
            Ok(weights) => Allocation::new(weights),
            Err(e) => {
                let reason = match e {
                    BacktestError::OptimizationError(reason) => reason,
                    other => other.to_string(),
                };
                warn!("Mean-variance fallback to equal weights: {}", reason);
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
    use nalgebra::{DMatrix, DVector};

    fn two_asset_estimate(mean: [f64; 2]) -> MomentEstimate {
        MomentEstimate::from_rows(&mean, &[vec![0.04, 0.006], vec![0.006, 0.09]]).unwrap()
    }

    fn tangency(estimate: &MomentEstimate, rf: f64) -> Vec<f64> {
        let excess = estimate.mean.map(|m| m - rf);
        let raw = estimate.covariance.clone().cholesky().unwrap().solve(&excess);
        let total: f64 = raw.iter().sum();
        raw.iter().map(|w| w / total).collect()
    }

    #[test]
    fn test_unconstrained_matches_tangency() {
        let estimate = two_asset_estimate([0.10, 0.14]);
        let weights = MeanVarianceAllocator::new(WeightBounds::default())
            .maximum_sharpe(&estimate, 0.02)
            .unwrap();
        let expected = tangency(&estimate, 0.02);
        for (w, e) in weights.iter().zip(&expected) {
            assert!((w - e).abs() < 1e-5, "{} vs {}", w, e);
        }
    }

    #[test]
    fn test_upper_bound_binds() {
        let estimate = MomentEstimate::from_rows(
            &[0.20, 0.02, 0.03],
            &[
                vec![0.01, 0.0, 0.0],
                vec![0.0, 0.04, 0.0],
                vec![0.0, 0.0, 0.04],
            ],
        )
        .unwrap();
        let bounds = WeightBounds::new(0.0, 0.40);
        let allocation = MeanVarianceAllocator::new(bounds).allocate(&estimate, 0.0);
        assert!(allocation.flag.is_none());
        assert!((allocation.weights[0] - 0.40).abs() < 1e-6);
        assert!((allocation.weights.iter().sum::<f64>() - 1.0).abs() < 1e-10);
        assert!(allocation.weights.iter().all(|&w| bounds.contains(w, 1e-9)));
    }

    #[test]
    fn test_negative_excess_returns_fall_back() {
        let estimate = two_asset_estimate([0.01, 0.015]);
        let allocation =
            MeanVarianceAllocator::new(WeightBounds::default()).allocate(&estimate, 0.02);
        assert_eq!(allocation.weights, vec![0.5, 0.5]);
        assert!(matches!(
            allocation.flag,
            Some(AllocationFlag::OptimizerFallback { .. })
        ));
    }

    #[test]
    fn test_indefinite_covariance_falls_back() {
        let estimate = MomentEstimate::new(
            DVector::from_vec(vec![0.01, 0.02]),
            DMatrix::from_row_slice(2, 2, &[0.04, 0.05, 0.05, 0.04]),
        )
        .unwrap();
        let allocation =
            MeanVarianceAllocator::new(WeightBounds::default()).allocate(&estimate, 0.0);
        assert_eq!(allocation.weights, vec![0.5, 0.5]);
        assert!(allocation.is_flagged());
    }
}
