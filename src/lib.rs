//! Portfolio Lab - walk-forward comparison of portfolio construction rules.
//!
//! # Overview
//!
//! Portfolio Lab backtests three allocation rules on a monthly return matrix
//! and tests whether their out-of-sample performance differs by more than
//! noise:
//!
//! - **Equal Weight**: `1/n` per asset
//! - **Mean-Variance**: maximum ex-ante Sharpe ratio under weight bounds
//! - **Risk Parity**: equal risk contribution from every asset
//!
//! Moments are estimated on a rolling window that always ends before the
//! rebalance date, optionally with Ledoit-Wolf shrinkage. Between rebalances
//! the weights drift with the market. Results are compared with the
//! Jobson-Korkie test and a paired block bootstrap on the net return series.
//!
//! # Quick Start
//!
//! ```no_run
//! use portfolio_lab::{
//!     data::{load_returns_csv, DataConfig},
//!     report::{AnalysisConfig, ComparisonReport},
//!     types::RiskFreeRate,
//!     ResultFormatter,
//! };
//!
//! let matrix = load_returns_csv("data/returns.csv", &DataConfig::default()).unwrap();
//!
//! let mut config = AnalysisConfig::default();
//! config.backtest.cost_bps = 10.0;
//!
//! let report = ComparisonReport::build(&matrix, &RiskFreeRate::Annual(0.06), &config).unwrap();
//! ResultFormatter::print_report(&report);
//! ```
//!
//! # Modules
//!
//! - [`types`]: Return matrix, risk-free rate, strategy kinds and weight bounds
//! - [`data`]: CSV loading and validation
//! - [`estimation`]: Sample moments and covariance shrinkage
//! - [`walkforward`]: Rebalance schedule and estimation windows
//! - [`allocators`]: Equal Weight, Mean-Variance and Risk Parity solvers
//! - [`engine`]: Walk-forward backtest execution
//! - [`cost_sensitivity`]: Transaction costs and cost scenarios
//! - [`analytics`]: Performance metrics and reporting
//! - [`significance`]: Jobson-Korkie test and block bootstrap
//! - [`sensitivity`]: Window, frequency and shrinkage sweeps
//! - [`subperiod`]: Per-semester metrics and their consistency
//! - [`report`]: End-to-end comparison report
//! - [`export`]: CSV and JSON export
//! - [`config`]: TOML configuration file support

pub mod allocators;
pub mod analytics;
pub mod config;
pub mod cost_sensitivity;
pub mod data;
pub mod engine;
pub mod error;
pub mod estimation;
pub mod export;
pub mod report;
pub mod sensitivity;
pub mod significance;
pub mod subperiod;
pub mod types;
pub mod walkforward;

// Re-exports for convenience
pub use allocators::{
    Allocation, Allocator, EqualWeightAllocator, MeanVarianceAllocator, OptimizerConfig,
    RiskParityAllocator,
};
pub use analytics::{MetricSet, MetricsConfig, ResultFormatter};
pub use engine::{BacktestConfig, BacktestRun, Engine, RebalanceEvent, StrategyBacktest};
pub use error::{BacktestError, Result};
pub use estimation::{Estimator, EstimatorConfig, MomentEstimate, Shrinkage, ShrinkageTarget};
pub use report::{AnalysisConfig, ComparisonReport};
pub use significance::{SignificanceConfig, SignificanceResult, SignificanceTester};
pub use types::{
    AllocationFlag, RealizedReturnSeries, ReturnMatrix, RiskFreeRate, StrategyKind, WeightBounds,
};
pub use walkforward::{EstimationWindow, RebalanceSchedule, WalkForwardConfig};

// Data handling re-exports
pub use data::{load_returns_csv, load_risk_free_csv, DataConfig};

// Cost sensitivity analysis
pub use cost_sensitivity::{
    run_cost_sensitivity_analysis, CostScenario, CostSensitivityAnalysis, CostSensitivityConfig,
};

// Parameter sensitivity analysis
pub use sensitivity::{SensitivityAnalysis, SensitivityConfig};

// Sub-period robustness
pub use subperiod::{SubperiodAnalysis, SubperiodConfig};
