//! Configuration file support for analyses.
//!
//! Allows loading the full comparison setup from TOML files for reproducibility.

use crate::allocators::OptimizerConfig;
use crate::analytics::MetricsConfig;
use crate::cost_sensitivity::CostSensitivityConfig;
use crate::data::{load_risk_free_csv, DataConfig};
use crate::engine::BacktestConfig;
use crate::error::{BacktestError, Result};
use crate::estimation::{EstimatorConfig, Shrinkage, ShrinkageTarget};
use crate::report::AnalysisConfig;
use crate::significance::SignificanceConfig;
use crate::subperiod::SubperiodConfig;
use crate::types::{ReturnMatrix, RiskFreeRate, StrategyKind, WeightBounds};
use crate::walkforward::WalkForwardConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;

/// Complete analysis configuration loaded from a file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisFileConfig {
    /// Schedule and general settings.
    #[serde(default)]
    pub backtest: BacktestSettings,
    /// Per-asset weight limits.
    #[serde(default)]
    pub bounds: BoundsSettings,
    /// Covariance estimation.
    #[serde(default)]
    pub estimation: EstimationSettings,
    #[serde(default)]
    pub risk_free: RiskFreeSettings,
    /// Transaction cost proxy.
    #[serde(default)]
    pub costs: CostSettings,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub significance: SignificanceSettings,
    #[serde(default)]
    pub metrics: MetricsSettings,
    /// Block length for the sub-period breakdown.
    #[serde(default)]
    pub subperiods: SubperiodConfig,
}

/// Schedule and general settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestSettings {
    /// Estimation window in periods.
    #[serde(default = "default_window")]
    pub estimation_window: usize,
    /// Periods between rebalances.
    #[serde(default = "default_frequency")]
    pub rebalance_frequency: usize,
    /// Smallest window the estimator accepts.
    #[serde(default = "default_min_observations")]
    pub min_observations: usize,
    /// Row of the first rebalance (defaults to the estimation window).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_rebalance: Option<usize>,
    /// Grow the estimation window from the first row instead of rolling it.
    #[serde(default)]
    pub anchored: bool,
    #[serde(default = "default_periods_per_year")]
    pub periods_per_year: f64,
    #[serde(default = "default_strategies")]
    pub strategies: Vec<StrategyKind>,
}

fn default_window() -> usize { 24 }
fn default_frequency() -> usize { 6 }
fn default_min_observations() -> usize { 12 }
fn default_periods_per_year() -> f64 { 12.0 }
fn default_strategies() -> Vec<StrategyKind> { StrategyKind::ALL.to_vec() }

impl Default for BacktestSettings {
    fn default() -> Self {
        Self {
            estimation_window: default_window(),
            rebalance_frequency: default_frequency(),
            min_observations: default_min_observations(),
            first_rebalance: None,
            anchored: false,
            periods_per_year: default_periods_per_year(),
            strategies: default_strategies(),
        }
    }
}

/// Per-asset weight limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundsSettings {
    #[serde(default)]
    pub lower: f64,
    #[serde(default = "default_upper")]
    pub upper: f64,
}

fn default_upper() -> f64 { 1.0 }

impl Default for BoundsSettings {
    fn default() -> Self {
        Self {
            lower: 0.0,
            upper: default_upper(),
        }
    }
}

/// Shrinkage as written in TOML: `"none"`, `"auto"` or an intensity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ShrinkageSetting {
    Intensity(f64),
    Mode(String),
}

impl Default for ShrinkageSetting {
    fn default() -> Self {
        ShrinkageSetting::Mode("none".to_string())
    }
}

impl ShrinkageSetting {
    pub fn to_shrinkage(&self) -> Result<Shrinkage> {
        match self {
            ShrinkageSetting::Intensity(intensity) => Ok(Shrinkage::Fixed(*intensity)),
            ShrinkageSetting::Mode(mode) => match mode.to_lowercase().as_str() {
                "none" => Ok(Shrinkage::None),
                "auto" | "ledoit-wolf" => Ok(Shrinkage::Auto),
                other => Err(BacktestError::ConfigError(format!(
                    "Unknown shrinkage '{}', expected \"none\", \"auto\" or a number in [0, 1]",
                    other
                ))),
            },
        }
    }
}

/// Covariance estimation settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EstimationSettings {
    #[serde(default)]
    pub shrinkage: ShrinkageSetting,
    #[serde(default)]
    pub target: ShrinkageTarget,
}

/// Risk-free rate: a constant annual rate, or a CSV of periodic rates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskFreeSettings {
    #[serde(default)]
    pub annual_rate: f64,
    /// CSV with `date,rate` rows; takes precedence over `annual_rate`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl RiskFreeSettings {
    /// Resolve the rate for `matrix`, reading the CSV when one is configured.
    pub fn resolve(&self, matrix: &ReturnMatrix) -> Result<RiskFreeRate> {
        match &self.path {
            Some(path) => load_risk_free_csv(path, matrix, &DataConfig::default()),
            None => Ok(RiskFreeRate::Annual(self.annual_rate)),
        }
    }
}

/// Cost model settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostSettings {
    /// Basis points per unit of turnover applied to the headline results.
    #[serde(default)]
    pub bps: f64,
    /// Levels evaluated in the cost scenario table.
    #[serde(default = "default_scenarios")]
    pub scenarios: Vec<f64>,
}

fn default_scenarios() -> Vec<f64> { CostSensitivityConfig::default().levels_bps }

impl Default for CostSettings {
    fn default() -> Self {
        Self {
            bps: 0.0,
            scenarios: default_scenarios(),
        }
    }
}

/// Significance testing settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignificanceSettings {
    #[serde(default = "default_iterations")]
    pub bootstrap_iterations: usize,
    #[serde(default = "default_confidence")]
    pub confidence_level: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_size: Option<usize>,
}

fn default_iterations() -> usize { 2000 }
fn default_confidence() -> f64 { 0.95 }
fn default_seed() -> u64 { 42 }

impl Default for SignificanceSettings {
    fn default() -> Self {
        Self {
            bootstrap_iterations: default_iterations(),
            confidence_level: default_confidence(),
            seed: default_seed(),
            block_size: None,
        }
    }
}

/// Metric settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSettings {
    #[serde(default)]
    pub minimum_acceptable_return: f64,
    #[serde(default = "default_var_level")]
    pub var_level: f64,
}

fn default_var_level() -> f64 { 0.05 }

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            minimum_acceptable_return: 0.0,
            var_level: default_var_level(),
        }
    }
}

impl AnalysisFileConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        let content = fs::read_to_string(path)?;
        let config: AnalysisFileConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| BacktestError::ConfigError(e.to_string()))?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Checks that do not depend on the number of assets.
    pub fn validate(&self) -> Result<()> {
        self.to_backtest_config()?;
        if self.bounds.lower < 0.0 || self.bounds.lower > self.bounds.upper {
            return Err(BacktestError::ConfigError(format!(
                "Invalid weight bounds [{}, {}]",
                self.bounds.lower, self.bounds.upper
            )));
        }
        if self.backtest.strategies.is_empty() {
            return Err(BacktestError::ConfigError(
                "At least one strategy must be configured".to_string(),
            ));
        }
        if self.costs.scenarios.iter().any(|b| !b.is_finite() || *b < 0.0) {
            return Err(BacktestError::ConfigError(
                "Cost scenarios must be non-negative".to_string(),
            ));
        }
        if !(self.metrics.var_level > 0.0 && self.metrics.var_level < 1.0) {
            return Err(BacktestError::ConfigError(format!(
                "VaR level must be in (0, 1), got {}",
                self.metrics.var_level
            )));
        }
        self.subperiods.validate()?;
        self.to_significance_config().validate()
    }

    /// Convert to BacktestConfig for the engine.
    pub fn to_backtest_config(&self) -> Result<BacktestConfig> {
        let schedule = WalkForwardConfig {
            estimation_window: self.backtest.estimation_window,
            rebalance_frequency: self.backtest.rebalance_frequency,
            first_rebalance: self.backtest.first_rebalance,
            anchored: self.backtest.anchored,
        };
        schedule.validate()?;

        let estimator = EstimatorConfig {
            min_observations: self.backtest.min_observations,
            shrinkage: self.estimation.shrinkage.to_shrinkage()?,
            target: self.estimation.target,
        };
        estimator.validate()?;

        Ok(BacktestConfig {
            schedule,
            estimator,
            bounds: WeightBounds::new(self.bounds.lower, self.bounds.upper),
            optimizer: self.optimizer.clone(),
            periods_per_year: self.backtest.periods_per_year,
            cost_bps: self.costs.bps,
            strategies: self.backtest.strategies.clone(),
        })
    }

    pub fn to_significance_config(&self) -> SignificanceConfig {
        SignificanceConfig {
            iterations: self.significance.bootstrap_iterations,
            confidence_level: self.significance.confidence_level,
            seed: self.significance.seed,
            block_size: self.significance.block_size,
            periods_per_year: self.backtest.periods_per_year,
        }
    }

    pub fn to_metrics_config(&self) -> MetricsConfig {
        MetricsConfig {
            periods_per_year: self.backtest.periods_per_year,
            minimum_acceptable_return: self.metrics.minimum_acceptable_return,
            var_level: self.metrics.var_level,
        }
    }

    /// Everything the comparison report needs.
    pub fn to_analysis_config(&self) -> Result<AnalysisConfig> {
        Ok(AnalysisConfig {
            backtest: self.to_backtest_config()?,
            significance: self.to_significance_config(),
            metrics: self.to_metrics_config(),
            cost_scenarios: CostSensitivityConfig::with_levels(self.costs.scenarios.clone()),
            subperiods: self.subperiods.clone(),
        })
    }

    /// Generate an example configuration file content.
    pub fn example() -> String {
        r#"# Portfolio comparison configuration

[backtest]
estimation_window = 24     # months
rebalance_frequency = 6    # months
min_observations = 12
# first_rebalance = 24     # row index, defaults to estimation_window
anchored = false
periods_per_year = 12.0
strategies = ["equal-weight", "mean-variance", "risk-parity"]

[bounds]
lower = 0.0
upper = 0.40

[estimation]
shrinkage = "none"         # "none" | "auto" | 0.0..=1.0
target = "constant-correlation"  # | "diagonal" | "scaled-identity"

[risk_free]
annual_rate = 0.06195
# path = "risk_free.csv"

[costs]
bps = 10.0
scenarios = [0.0, 10.0, 25.0, 50.0]

[optimizer]
mv_max_iter = 200
mv_tolerance = 1e-8
rp_max_iter = 10000
rp_tolerance = 1e-6

[significance]
bootstrap_iterations = 2000
confidence_level = 0.95
seed = 42
# block_size = 4

[metrics]
minimum_acceptable_return = 0.0
var_level = 0.05

[subperiods]
period_length = 6          # months per block
min_observations = 3       # shorter trailing blocks are dropped
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = AnalysisFileConfig::default();
        assert_eq!(config.backtest.estimation_window, 24);
        assert_eq!(config.estimation.shrinkage, ShrinkageSetting::Mode("none".into()));
        assert_eq!(config.significance.bootstrap_iterations, 2000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_config() {
        let toml_content = r#"
[backtest]
estimation_window = 36
rebalance_frequency = 3

[bounds]
upper = 0.5

[estimation]
shrinkage = 0.25
target = "scaled-identity"

[costs]
bps = 25.0

[significance]
seed = 7
block_size = 4
"#;
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{}", toml_content).unwrap();

        let config = AnalysisFileConfig::load(file.path()).unwrap();
        assert_eq!(config.backtest.estimation_window, 36);
        assert_eq!(config.backtest.min_observations, 12);
        assert_eq!(config.bounds.lower, 0.0);

        let backtest = config.to_backtest_config().unwrap();
        assert_eq!(backtest.schedule.rebalance_frequency, 3);
        assert_eq!(backtest.estimator.shrinkage, Shrinkage::Fixed(0.25));
        assert_eq!(backtest.estimator.target, ShrinkageTarget::ScaledIdentity);
        assert_eq!(backtest.bounds.upper, 0.5);
        assert_eq!(backtest.cost_bps, 25.0);

        let significance = config.to_significance_config();
        assert_eq!(significance.seed, 7);
        assert_eq!(significance.block_size, Some(4));
        assert_eq!(significance.iterations, 2000);
    }

    #[test]
    fn test_auto_shrinkage() {
        let config: AnalysisFileConfig = toml::from_str("[estimation]\nshrinkage = \"auto\"\n").unwrap();
        assert_eq!(
            config.to_backtest_config().unwrap().estimator.shrinkage,
            Shrinkage::Auto
        );
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let bad_shrinkage: AnalysisFileConfig =
            toml::from_str("[estimation]\nshrinkage = 1.5\n").unwrap();
        assert!(bad_shrinkage.validate().is_err());

        let bad_mode: AnalysisFileConfig =
            toml::from_str("[estimation]\nshrinkage = \"sometimes\"\n").unwrap();
        assert!(matches!(
            bad_mode.to_backtest_config(),
            Err(BacktestError::ConfigError(_))
        ));

        let zero_window: AnalysisFileConfig =
            toml::from_str("[backtest]\nestimation_window = 0\n").unwrap();
        assert!(zero_window.validate().is_err());

        let inverted: AnalysisFileConfig =
            toml::from_str("[bounds]\nlower = 0.5\nupper = 0.2\n").unwrap();
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn test_save_config() {
        let mut config = AnalysisFileConfig::default();
        config.estimation.shrinkage = ShrinkageSetting::Intensity(0.3);
        config.risk_free.annual_rate = 0.05;
        let file = NamedTempFile::new().unwrap();
        config.save(file.path()).unwrap();

        // Verify we can load it back
        let loaded = AnalysisFileConfig::load(file.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_example_config() {
        let example = AnalysisFileConfig::example();
        let config: AnalysisFileConfig = toml::from_str(&example).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.bounds.upper, 0.40);
        assert_eq!(config.costs.bps, 10.0);
        assert_eq!(config.risk_free.annual_rate, 0.06195);
        let analysis = config.to_analysis_config().unwrap();
        assert_eq!(analysis.cost_scenarios.levels_bps, vec![0.0, 10.0, 25.0, 50.0]);
        assert_eq!(analysis.backtest.strategies.len(), 3);
        assert_eq!(analysis.subperiods, SubperiodConfig::default());
    }

    #[test]
    fn test_subperiod_settings() {
        let config: AnalysisFileConfig =
            toml::from_str("[subperiods]\nperiod_length = 12\n").unwrap();
        assert_eq!(config.subperiods.period_length, 12);
        assert_eq!(config.subperiods.min_observations, 3);
        assert_eq!(config.to_analysis_config().unwrap().subperiods.period_length, 12);

        let too_short: AnalysisFileConfig =
            toml::from_str("[subperiods]\nperiod_length = 1\n").unwrap();
        assert!(too_short.validate().is_err());
    }
}
