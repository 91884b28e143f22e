//! Walk-forward rebalancing schedule.
//!
//! Rebalance dates fall on rows `first, first + F, first + 2F, ...` where
//! `first` defaults to the estimation window length `L`. Each rebalance row
//! `r` gets the estimation window `[r - L, r)` (or `[0, r)` when anchored),
//! so the inputs to an allocation never include the rebalance month or any
//! later observation.

use crate::error::{BacktestError, Result};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use tracing::debug;

/// Schedule settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalkForwardConfig {
    /// Estimation window length in periods.
    pub estimation_window: usize,
    /// Periods between rebalances.
    pub rebalance_frequency: usize,
    /// Row of the first rebalance. Defaults to `estimation_window`.
    pub first_rebalance: Option<usize>,
    /// Use anchored (growing) windows instead of rolling windows.
    pub anchored: bool,
}

impl Default for WalkForwardConfig {
    fn default() -> Self {
        Self {
            estimation_window: 24,
            rebalance_frequency: 6,
            first_rebalance: None,
            anchored: false,
        }
    }
}

impl WalkForwardConfig {
    pub fn new(estimation_window: usize, rebalance_frequency: usize) -> Self {
        Self {
            estimation_window,
            rebalance_frequency,
            ..Default::default()
        }
    }

    pub fn with_first_rebalance(mut self, row: usize) -> Self {
        self.first_rebalance = Some(row);
        self
    }

    /// Use anchored (growing) windows instead of rolling windows.
    pub fn with_anchored(mut self) -> Self {
        self.anchored = true;
        self
    }

    pub fn first_row(&self) -> usize {
        self.first_rebalance.unwrap_or(self.estimation_window)
    }

    /// Length of the shortest estimation window the schedule produces.
    pub fn shortest_window(&self) -> usize {
        if self.anchored {
            self.first_row()
        } else {
            self.estimation_window
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.estimation_window == 0 {
            return Err(BacktestError::ConfigError(
                "Estimation window must be positive".to_string(),
            ));
        }
        if self.rebalance_frequency == 0 {
            return Err(BacktestError::ConfigError(
                "Rebalance frequency must be positive".to_string(),
            ));
        }
        if self.first_row() < self.estimation_window {
            return Err(BacktestError::ConfigError(format!(
                "First rebalance at row {} precedes a full {}-period window",
                self.first_row(),
                self.estimation_window
            )));
        }
        Ok(())
    }
}

/// Half-open row range `[start, end)` used to estimate inputs for the rebalance at `end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EstimationWindow {
    pub start: usize,
    pub end: usize,
}

impl EstimationWindow {
    pub fn new(start: usize, end: usize) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }
}

/// A single scheduled rebalance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalancePoint {
    /// Position in the schedule.
    pub index: usize,
    /// Row at which the new weights take effect.
    pub row: usize,
    /// Inputs for this rebalance; always ends at `row`.
    pub window: EstimationWindow,
    /// First row of the next holding period (exclusive end of this one).
    pub holding_end: usize,
}

impl RebalancePoint {
    /// Rows held with this rebalance's weights.
    pub fn holding_rows(&self) -> Range<usize> {
        self.row..self.holding_end
    }
}

/// Ordered rebalance points over a return matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceSchedule {
    points: Vec<RebalancePoint>,
    total_rows: usize,
}

impl RebalanceSchedule {
    /// Lay out the schedule for a matrix of `total_rows` observations.
    ///
    /// Fails with `InsufficientHistory` unless the matrix holds at least one
    /// full estimation window plus one holding period.
    pub fn build(config: &WalkForwardConfig, total_rows: usize) -> Result<Self> {
        config.validate()?;

        let first = config.first_row();
        let required = config.estimation_window.max(first) + 1;
        if total_rows < required {
            return Err(BacktestError::InsufficientHistory {
                required,
                available: total_rows,
            });
        }

        let rows: Vec<usize> = (first..total_rows)
            .step_by(config.rebalance_frequency)
            .collect();

        let points: Vec<RebalancePoint> = rows
            .iter()
            .enumerate()
            .map(|(index, &row)| {
                let start = if config.anchored {
                    0
                } else {
                    row - config.estimation_window
                };
                let window = EstimationWindow::new(start, row);
                debug_assert_eq!(window.end, row);
                RebalancePoint {
                    index,
                    row,
                    window,
                    holding_end: rows.get(index + 1).copied().unwrap_or(total_rows),
                }
            })
            .collect();

        debug!(
            "Scheduled {} rebalances from row {} every {} periods",
            points.len(),
            first,
            config.rebalance_frequency
        );

        Ok(Self { points, total_rows })
    }

    pub fn points(&self) -> &[RebalancePoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// First row of the out-of-sample period.
    pub fn start_row(&self) -> usize {
        self.points.first().map(|p| p.row).unwrap_or(self.total_rows)
    }

    /// Number of out-of-sample periods covered.
    pub fn out_of_sample_len(&self) -> usize {
        self.total_rows - self.start_row()
    }

    pub fn rebalance_rows(&self) -> Vec<usize> {
        self.points.iter().map(|p| p.row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_rows() {
        let schedule = RebalanceSchedule::build(&WalkForwardConfig::new(24, 6), 48).unwrap();
        assert_eq!(schedule.rebalance_rows(), vec![24, 30, 36, 42]);
        assert_eq!(schedule.out_of_sample_len(), 24);
        assert_eq!(schedule.points()[3].holding_rows(), 42..48);
    }

    #[test]
    fn test_windows_end_before_rebalance() {
        let schedule = RebalanceSchedule::build(&WalkForwardConfig::new(24, 6), 60).unwrap();
        for point in schedule.points() {
            assert_eq!(point.window.end, point.row);
            assert_eq!(point.window.len(), 24);
        }
    }

    #[test]
    fn test_anchored_windows() {
        let config = WalkForwardConfig::new(12, 6).with_anchored();
        let schedule = RebalanceSchedule::build(&config, 40).unwrap();
        for point in schedule.points() {
            assert_eq!(point.window.start, 0);
            assert_eq!(point.window.end, point.row);
        }
    }

    #[test]
    fn test_first_rebalance_override() {
        let config = WalkForwardConfig::new(12, 3).with_first_rebalance(20);
        let schedule = RebalanceSchedule::build(&config, 30).unwrap();
        assert_eq!(schedule.rebalance_rows(), vec![20, 23, 26, 29]);
        assert_eq!(schedule.points()[0].window, EstimationWindow::new(8, 20));
    }

    #[test]
    fn test_insufficient_data() {
        let result = RebalanceSchedule::build(&WalkForwardConfig::new(24, 6), 24);
        assert!(matches!(
            result,
            Err(BacktestError::InsufficientHistory {
                required: 25,
                available: 24
            })
        ));
    }

    #[test]
    fn test_invalid_config() {
        assert!(WalkForwardConfig::new(0, 6).validate().is_err());
        assert!(WalkForwardConfig::new(24, 0).validate().is_err());
        assert!(WalkForwardConfig::new(24, 6)
            .with_first_rebalance(10)
            .validate()
            .is_err());
    }
}
