use super::{equal_weights, Allocation, Allocator};
use crate::estimation::MomentEstimate;
use crate::types::StrategyKind;

/// Naive `1/n` diversification.
#[derive(Debug, Clone, Copy, Default)]
pub struct EqualWeightAllocator;

impl EqualWeightAllocator {
    pub fn new() -> Self {
        Self
    }
}

impl Allocator for EqualWeightAllocator {
    fn kind(&self) -> StrategyKind {
        StrategyKind::EqualWeight
    }

    fn allocate(&self, estimate: &MomentEstimate, _risk_free: f64) -> Allocation {
        Allocation::new(equal_weights(estimate.n_assets()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{DMatrix, DVector};

    #[test]
    fn test_ignores_estimate_content() {
        let estimate = MomentEstimate::new(
            DVector::from_element(5, f64::NAN),
            DMatrix::from_element(5, 5, f64::NAN),
        )
        .unwrap();
        let allocation = EqualWeightAllocator::new().allocate(&estimate, 0.0);
        assert!(allocation.flag.is_none());
        assert!(allocation.weights.iter().all(|&w| w == 0.2));
    }
}
