//! Portfolio weight solvers.
//!
//! Every allocator maps one [`MomentEstimate`] to a fully-invested,
//! long-only weight vector inside the configured [`WeightBounds`]:
//!
//! - [`EqualWeightAllocator`]: `1/n` per asset, ignores the estimate
//! - [`MeanVarianceAllocator`]: maximum ex-ante Sharpe ratio
//! - [`RiskParityAllocator`]: equal risk contributions
//!
//! Allocators never fail. When a solve cannot be trusted they return a
//! reference allocation and attach an [`AllocationFlag`] describing why.

mod equal_weight;
mod mean_variance;
mod risk_parity;

pub use equal_weight::EqualWeightAllocator;
pub use mean_variance::MeanVarianceAllocator;
pub use risk_parity::RiskParityAllocator;

use crate::estimation::MomentEstimate;
use crate::types::{AllocationFlag, StrategyKind, WeightBounds};
use serde::{Deserialize, Serialize};

/// Solver limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Interior-point iteration cap for the mean-variance solve.
    pub mv_max_iter: u32,
    /// Duality gap and feasibility tolerance for the mean-variance solve.
    pub mv_tolerance: f64,
    /// Sweep cap for the risk parity iteration.
    pub rp_max_iter: usize,
    /// Largest accepted gap between normalized risk contributions.
    pub rp_tolerance: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            mv_max_iter: 200,
            mv_tolerance: 1e-8,
            rp_max_iter: 10_000,
            rp_tolerance: 1e-6,
        }
    }
}

/// Weights chosen for one rebalance, plus an optional degradation flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub weights: Vec<f64>,
    pub flag: Option<AllocationFlag>,
}

impl Allocation {
    pub fn new(weights: Vec<f64>) -> Self {
        Self {
            weights,
            flag: None,
        }
    }

    pub fn flagged(weights: Vec<f64>, flag: AllocationFlag) -> Self {
        Self {
            weights,
            flag: Some(flag),
        }
    }

    pub fn is_flagged(&self) -> bool {
        self.flag.is_some()
    }
}

/// A portfolio construction rule.
pub trait Allocator: Send + Sync {
    /// Strategy implemented by this allocator.
    fn kind(&self) -> StrategyKind;

    /// Compute target weights from an estimate and the periodic risk-free rate.
    fn allocate(&self, estimate: &MomentEstimate, risk_free: f64) -> Allocation;
}

/// Build the allocator for `kind`.
pub fn build_allocator(
    kind: StrategyKind,
    bounds: WeightBounds,
    config: &OptimizerConfig,
) -> Box<dyn Allocator> {
    match kind {
        StrategyKind::EqualWeight => Box::new(EqualWeightAllocator::new()),
        StrategyKind::MeanVariance => Box::new(
            MeanVarianceAllocator::new(bounds)
                .with_max_iter(config.mv_max_iter)
                .with_tolerance(config.mv_tolerance),
        ),
        StrategyKind::RiskParity => Box::new(
            RiskParityAllocator::new(bounds)
                .with_max_iter(config.rp_max_iter)
                .with_tolerance(config.rp_tolerance),
        ),
    }
}

/// `1/n` for every asset.
pub fn equal_weights(n_assets: usize) -> Vec<f64> {
    vec![1.0 / n_assets as f64; n_assets]
}

/// Weights proportional to `1/σ_i`. `None` when any volatility is zero or non-finite.
pub fn inverse_volatility_weights(estimate: &MomentEstimate) -> Option<Vec<f64>> {
    let vols = estimate.volatilities();
    if vols.iter().any(|v| !v.is_finite() || *v <= 0.0) {
        return None;
    }
    let inverse: Vec<f64> = vols.iter().map(|v| 1.0 / v).collect();
    let total: f64 = inverse.iter().sum();
    Some(inverse.iter().map(|v| v / total).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inverse_volatility_weights() {
        let estimate = MomentEstimate::from_rows(
            &[0.0, 0.0],
            &[vec![0.01, 0.0], vec![0.0, 0.04]],
        )
        .unwrap();
        let weights = inverse_volatility_weights(&estimate).unwrap();
        assert!((weights[0] - 2.0 / 3.0).abs() < 1e-12);
        assert!((weights[1] - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_inverse_volatility_rejects_zero_variance() {
        let estimate =
            MomentEstimate::from_rows(&[0.0, 0.0], &[vec![0.0, 0.0], vec![0.0, 0.04]]).unwrap();
        assert!(inverse_volatility_weights(&estimate).is_none());
    }

    #[test]
    fn test_build_allocator_kinds() {
        let config = OptimizerConfig::default();
        for kind in StrategyKind::ALL {
            let allocator = build_allocator(kind, WeightBounds::default(), &config);
            assert_eq!(allocator.kind(), kind);
        }
    }
}
