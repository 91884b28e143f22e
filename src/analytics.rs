//! Performance analytics and reporting.
//!
//! All ratios are computed from periodic (monthly) returns and annualized
//! with `periods_per_year`. Degenerate inputs (fewer than two periods, zero
//! volatility, no downside observations, no drawdown) produce `0.0` for the
//! affected ratio and set [`MetricSet::degenerate`]; no metric is ever NaN.

use crate::cost_sensitivity::CostSensitivityAnalysis;
use crate::report::ComparisonReport;
use crate::sensitivity::SensitivityAnalysis;
use crate::significance::SignificanceResult;
use crate::subperiod::SubperiodAnalysis;
use crate::types::RealizedReturnSeries;
use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tabled::{builder::Builder, settings::Style};

/// Volatilities below this are treated as zero.
const VOLATILITY_FLOOR: f64 = 1e-12;

/// Settings for metric computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub periods_per_year: f64,
    /// Threshold below which a return counts as downside for Sortino.
    pub minimum_acceptable_return: f64,
    /// Tail probability for VaR / CVaR (0.05 for 95%).
    pub var_level: f64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            periods_per_year: 12.0,
            minimum_acceptable_return: 0.0,
            var_level: 0.05,
        }
    }
}

/// Performance and risk summary of one realized return series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSet {
    /// Number of periods.
    pub periods: usize,
    pub total_return: f64,
    /// Geometric annualized return.
    pub annualized_return: f64,
    /// Sample standard deviation times `√periods_per_year`.
    pub annualized_volatility: f64,
    /// Geometric annualization of the aligned risk-free series.
    pub annualized_risk_free: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    /// Most negative peak-to-trough decline, as a negative fraction.
    pub max_drawdown: f64,
    pub calmar_ratio: f64,
    /// Empirical periodic VaR (a return, usually negative).
    pub value_at_risk: f64,
    /// Mean of returns at or below the VaR.
    pub conditional_value_at_risk: f64,
    pub mean_return: f64,
    pub best_period: f64,
    pub worst_period: f64,
    /// Share of periods with a positive return.
    pub positive_ratio: f64,
    /// Set when any ratio fell back to its `0.0` sentinel.
    pub degenerate: bool,
}

impl MetricSet {
    /// Compute every metric for `series`.
    pub fn compute(series: &RealizedReturnSeries, config: &MetricsConfig) -> Self {
        Self::from_returns(&series.returns, &series.risk_free, config)
    }

    /// Compute every metric from raw periodic returns and aligned risk-free rates.
    pub fn from_returns(returns: &[f64], risk_free: &[f64], config: &MetricsConfig) -> Self {
        let n = returns.len();
        let ppy = config.periods_per_year;
        let mut degenerate = n < 2;

        let annualized_risk_free = annualized_return(risk_free, ppy);
        let annualized_return = annualized_return(returns, ppy);
        let annualized_volatility = sample_std(returns) * ppy.sqrt();
        let premium = annualized_return - annualized_risk_free;

        let sharpe_ratio = if annualized_volatility > VOLATILITY_FLOOR {
            premium / annualized_volatility
        } else {
            degenerate = true;
            0.0
        };

        let downside = downside_deviation(returns, config.minimum_acceptable_return) * ppy.sqrt();
        let sortino_ratio = if downside > VOLATILITY_FLOOR {
            premium / downside
        } else {
            degenerate = true;
            0.0
        };

        let max_drawdown = max_drawdown(returns);
        let calmar_ratio = if max_drawdown < 0.0 {
            annualized_return / max_drawdown.abs()
        } else {
            degenerate = true;
            0.0
        };

        let value_at_risk = value_at_risk(returns, config.var_level);
        let conditional_value_at_risk = conditional_var(returns, value_at_risk);

        let best_period = returns.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let worst_period = returns.iter().cloned().fold(f64::INFINITY, f64::min);

        Self {
            periods: n,
            total_return: total_return(returns),
            annualized_return,
            annualized_volatility,
            annualized_risk_free,
            sharpe_ratio,
            sortino_ratio,
            max_drawdown,
            calmar_ratio,
            value_at_risk,
            conditional_value_at_risk,
            mean_return: mean(returns),
            best_period: if n > 0 { best_period } else { 0.0 },
            worst_period: if n > 0 { worst_period } else { 0.0 },
            positive_ratio: if n > 0 {
                returns.iter().filter(|&&r| r > 0.0).count() as f64 / n as f64
            } else {
                0.0
            },
            degenerate,
        }
    }

    /// Metrics as an ordered `name -> value` list, in reporting order.
    pub fn entries(&self) -> Vec<(&'static str, f64)> {
        vec![
            ("periods", self.periods as f64),
            ("total_return", self.total_return),
            ("annualized_return", self.annualized_return),
            ("annualized_volatility", self.annualized_volatility),
            ("annualized_risk_free", self.annualized_risk_free),
            ("sharpe_ratio", self.sharpe_ratio),
            ("sortino_ratio", self.sortino_ratio),
            ("max_drawdown", self.max_drawdown),
            ("calmar_ratio", self.calmar_ratio),
            ("value_at_risk_95", self.value_at_risk),
            ("cvar_95", self.conditional_value_at_risk),
            ("mean_return", self.mean_return),
            ("best_period", self.best_period),
            ("worst_period", self.worst_period),
            ("positive_ratio", self.positive_ratio),
        ]
    }

    /// Metrics keyed by name.
    pub fn to_map(&self) -> BTreeMap<String, f64> {
        self.entries()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (N-1). Zero for fewer than two values.
pub fn sample_std(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let m = mean(values);
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (n - 1) as f64;
    variance.sqrt()
}

/// Compounded return over the whole series.
pub fn total_return(returns: &[f64]) -> f64 {
    returns.iter().map(|r| 1.0 + r).product::<f64>() - 1.0
}

/// Geometric annualized return `(Π(1+r))^(ppy/n) − 1`.
///
/// A series that loses everything annualizes to `-1`.
pub fn annualized_return(returns: &[f64], periods_per_year: f64) -> f64 {
    if returns.is_empty() {
        return 0.0;
    }
    let growth = 1.0 + total_return(returns);
    if growth <= 0.0 {
        return -1.0;
    }
    growth.powf(periods_per_year / returns.len() as f64) - 1.0
}

/// Root-mean-square shortfall below `threshold`, over the shortfall periods only.
pub fn downside_deviation(returns: &[f64], threshold: f64) -> f64 {
    let shortfalls: Vec<f64> = returns
        .iter()
        .filter(|&&r| r < threshold)
        .map(|r| (r - threshold).powi(2))
        .collect();
    if shortfalls.is_empty() {
        return 0.0;
    }
    mean(&shortfalls).sqrt()
}

/// Maximum drawdown of the compounded value path, starting from a value of 1.
pub fn max_drawdown(returns: &[f64]) -> f64 {
    let mut value = 1.0_f64;
    let mut peak = 1.0_f64;
    let mut worst = 0.0_f64;
    for r in returns {
        value *= 1.0 + r;
        peak = peak.max(value);
        worst = worst.min(value / peak - 1.0);
    }
    worst
}

/// Linear-interpolated percentile of already sorted data, `p` in `[0, 1]`.
pub fn percentile(sorted_data: &[f64], p: f64) -> f64 {
    match sorted_data.len() {
        0 => 0.0,
        1 => sorted_data[0],
        n => {
            let pos = p.clamp(0.0, 1.0) * (n - 1) as f64;
            let lower = pos.floor() as usize;
            let upper = pos.ceil() as usize;
            let frac = pos - lower as f64;
            sorted_data[lower] + (sorted_data[upper] - sorted_data[lower]) * frac
        }
    }
}

/// Empirical VaR: the `level` quantile of the periodic returns.
pub fn value_at_risk(returns: &[f64], level: f64) -> f64 {
    let mut sorted = returns.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    percentile(&sorted, level)
}

/// Mean of the returns at or below `var`.
pub fn conditional_var(returns: &[f64], var: f64) -> f64 {
    let tail: Vec<f64> = returns.iter().cloned().filter(|&r| r <= var).collect();
    if tail.is_empty() {
        return var;
    }
    mean(&tail)
}

/// Annualized Sharpe ratio of periodic excess returns: `mean / std · √ppy`.
pub fn excess_sharpe(excess: &[f64], periods_per_year: f64) -> f64 {
    let std = sample_std(excess);
    if std > VOLATILITY_FLOOR {
        mean(excess) / std * periods_per_year.sqrt()
    } else {
        0.0
    }
}

/// Format results for terminal display.
pub struct ResultFormatter;

impl ResultFormatter {
    /// Print the full comparison report to stdout.
    pub fn print_report(report: &ComparisonReport) {
        println!();
        println!("{}", "═".repeat(72).blue());
        println!("{}", " PORTFOLIO COMPARISON ".bold().blue());
        println!("{}", "═".repeat(72).blue());
        println!();

        println!("{}", "Overview".bold().underline());
        println!("  Assets:          {}", report.assets.len());
        println!(
            "  Out of sample:   {} to {} ({} periods)",
            report.start_date, report.end_date, report.periods
        );
        println!("  Estimation:      {} periods", report.estimation_window);
        println!("  Rebalance every: {} periods", report.rebalance_frequency);
        println!("  Cost:            {:.1} bps per unit turnover", report.cost_bps);
        println!();

        println!("{}", "Performance (net of costs)".bold().underline());
        Self::print_metrics_table(report);
        println!();

        println!("{}", "Sharpe Ratio Differences".bold().underline());
        Self::print_significance_table(&report.significance);
        println!();

        println!("{}", "Cost Scenarios".bold().underline());
        Self::print_cost_table(&report.cost_scenarios);
        println!();

        println!(
            "{}",
            format!("Sub-period Consistency ({} periods per block)", report.subperiods.period_length)
                .bold()
                .underline()
        );
        Self::print_subperiods(&report.subperiods);
        println!();

        Self::print_fallbacks(report);
        println!("{}", "═".repeat(72).blue());
    }

    /// Format a signed ratio with color.
    fn format_signed(value: f64) -> String {
        if value >= 0.0 {
            format!("{:+.3}", value).green().to_string()
        } else {
            format!("{:+.3}", value).red().to_string()
        }
    }

    pub fn print_metrics_table(report: &ComparisonReport) {
        let mut builder = Builder::new();
        builder.push_record([
            "Strategy", "Ann. Ret %", "Vol %", "Sharpe", "Sortino", "Max DD %", "Calmar",
            "VaR95 %", "CVaR95 %", "Turnover", "N eff",
        ]);

        for summary in &report.strategies {
            let m = &summary.metrics;
            builder.push_record([
                summary.strategy.label().to_string(),
                format!("{:.2}", m.annualized_return * 100.0),
                format!("{:.2}", m.annualized_volatility * 100.0),
                format!("{:.3}", m.sharpe_ratio),
                format!("{:.3}", m.sortino_ratio),
                format!("{:.2}", m.max_drawdown * 100.0),
                format!("{:.3}", m.calmar_ratio),
                format!("{:.2}", m.value_at_risk * 100.0),
                format!("{:.2}", m.conditional_value_at_risk * 100.0),
                format!("{:.3}", summary.average_turnover),
                format!("{:.2}", summary.average_n_effective),
            ]);
        }

        let table = builder.build().with(Style::rounded()).to_string();
        println!("{}", table);
    }

    pub fn print_significance_table(results: &[SignificanceResult]) {
        let mut builder = Builder::new();
        builder.push_record([
            "Pair", "ΔSharpe", "JK z", "JK p", "Bootstrap CI", "Boot p",
        ]);

        for result in results {
            builder.push_record([
                format!("{} vs {}", result.first.label(), result.second.label()),
                Self::format_signed(result.sharpe_difference),
                format!("{:.3}", result.jobson_korkie.z_statistic),
                format!("{:.4}", result.jobson_korkie.p_value),
                format!(
                    "[{:+.3}, {:+.3}]",
                    result.bootstrap.ci_lower, result.bootstrap.ci_upper
                ),
                format!("{:.4}", result.bootstrap.p_value),
            ]);
        }

        let table = builder.build().with(Style::rounded()).to_string();
        println!("{}", table);
    }

    pub fn print_cost_table(analysis: &CostSensitivityAnalysis) {
        let mut builder = Builder::new();
        builder.push_record(["Strategy", "Cost bps", "Ann. Ret %", "Sharpe", "Cost drag %"]);

        for scenario in &analysis.scenarios {
            builder.push_record([
                scenario.strategy.label().to_string(),
                format!("{:.0}", scenario.bps),
                format!("{:.2}", scenario.metrics.annualized_return * 100.0),
                format!("{:.3}", scenario.metrics.sharpe_ratio),
                format!("{:.2}", scenario.annual_cost_drag * 100.0),
            ]);
        }

        let table = builder.build().with(Style::rounded()).to_string();
        println!("{}", table);
    }

    pub fn print_subperiods(analysis: &SubperiodAnalysis) {
        let mut builder = Builder::new();
        builder.push_record([
            "Strategy", "Blocks", "Mean Ret %", "Mean Vol %", "Mean Sharpe", "Std", "Min", "Max",
            "Positive",
        ]);

        for summary in &analysis.consistency {
            builder.push_record([
                summary.strategy.label().to_string(),
                summary.periods.to_string(),
                format!("{:.2}", summary.mean_return * 100.0),
                format!("{:.2}", summary.mean_volatility * 100.0),
                format!("{:.3}", summary.mean_sharpe),
                format!("{:.3}", summary.std_sharpe),
                Self::format_signed(summary.min_sharpe),
                Self::format_signed(summary.max_sharpe),
                format!("{}/{}", summary.positive_sharpe_periods, summary.periods),
            ]);
        }

        let table = builder.build().with(Style::rounded()).to_string();
        println!("{}", table);
    }

    /// Fallback notices are always printed so degraded allocations stay visible.
    pub fn print_fallbacks(report: &ComparisonReport) {
        if report.fallbacks.is_empty() {
            println!("{}", "All allocations solved without fallback.".green());
            println!();
            return;
        }

        println!(
            "{}",
            format!("Fallback notices ({})", report.fallbacks.len())
                .yellow()
                .bold()
        );
        for notice in &report.fallbacks {
            println!(
                "  {} {:<14} {}: {}",
                notice.date,
                notice.strategy.label(),
                notice.flag.yellow(),
                notice.reason
            );
        }
        println!();
    }

    pub fn print_sensitivity(analysis: &SensitivityAnalysis) {
        let mut builder = Builder::new();
        builder.push_record(["Window", "Frequency", "Shrinkage", "Strategy", "Sharpe", "Ann. Ret %"]);

        for point in &analysis.points {
            for (kind, metrics) in &point.metrics {
                builder.push_record([
                    point.estimation_window.to_string(),
                    point.rebalance_frequency.to_string(),
                    point.shrinkage_label(),
                    kind.label().to_string(),
                    format!("{:.3}", metrics.sharpe_ratio),
                    format!("{:.2}", metrics.annualized_return * 100.0),
                ]);
            }
        }
        let table = builder.build().with(Style::rounded()).to_string();
        println!("{}", table);

        let mut summary = Builder::new();
        summary.push_record(["Strategy", "Mean Sharpe", "Std", "Min", "Max"]);
        for stability in &analysis.stability {
            summary.push_record([
                stability.strategy.label().to_string(),
                format!("{:.3}", stability.mean_sharpe),
                format!("{:.3}", stability.std_sharpe),
                format!("{:.3}", stability.min_sharpe),
                format!("{:.3}", stability.max_sharpe),
            ]);
        }
        let table = summary.build().with(Style::rounded()).to_string();
        println!("{}", table);
    }

    /// Export the report to JSON.
    pub fn to_json(report: &ComparisonReport) -> String {
        serde_json::to_string_pretty(report).unwrap_or_else(|_| "{}".to_string())
    }
}
