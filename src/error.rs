//! Error types for the allocation and backtest engine.

use thiserror::Error;

/// Main error type for the engine.
///
/// Only structural problems surface as errors. Per-date estimation or solver
/// trouble is recorded on the rebalance event as an
/// [`AllocationFlag`](crate::types::AllocationFlag) and the run continues.
#[derive(Error, Debug)]
pub enum BacktestError {
    #[error("Insufficient history: need {required} observations, have {available}")]
    InsufficientHistory { required: usize, available: usize },

    #[error("Invalid return data: {0}")]
    DataError(String),

    #[error("CSV parsing error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Could not parse date: {0}")]
    DateParseError(#[from] chrono::ParseError),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Optimizer failed: {0}")]
    OptimizationError(String),

    #[error("Degenerate series: {0}")]
    DegenerateSeries(String),
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, BacktestError>;
