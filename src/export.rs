//! Export utilities for comparison reports.
//!
//! Tabular outputs are written as CSV (rows = dates or strategies) and the
//! whole report as a single JSON document.
//!
//! | File | Rows |
//! |------|------|
//! | `events.csv` | one per rebalance per strategy |
//! | `returns.csv` | one per out-of-sample date |
//! | `metrics.csv` | one per strategy |
//! | `significance.csv` | one per strategy pair |
//! | `cost_scenarios.csv` | one per strategy and cost level |
//! | `subperiods.csv` | one per strategy and sub-period block |
//! | `consistency.csv` | one per strategy |
//! | `report.json` | whole report |
//!
//! # Example
//!
//! ```ignore
//! use portfolio_lab::export::Exporter;
//!
//! let report = ComparisonReport::build(&matrix, &risk_free, &config)?;
//! let written = Exporter::new(&report).export_all("results")?;
//! ```

use crate::error::Result;
use crate::report::ComparisonReport;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

/// Configuration for exports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Date format for CSV exports.
    pub date_format: String,
    /// Decimal precision for numeric values.
    pub precision: usize,
    /// Whether to include headers in CSV.
    pub include_headers: bool,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            date_format: "%Y-%m-%d".to_string(),
            precision: 6,
            include_headers: true,
        }
    }
}

/// Writes a [`ComparisonReport`] to disk.
pub struct Exporter<'a> {
    report: &'a ComparisonReport,
    config: ExportConfig,
}

impl<'a> Exporter<'a> {
    pub fn new(report: &'a ComparisonReport) -> Self {
        Self {
            report,
            config: ExportConfig::default(),
        }
    }

    pub fn with_config(report: &'a ComparisonReport, config: ExportConfig) -> Self {
        Self { report, config }
    }

    /// Write every table plus the JSON report into `dir`, creating it if needed.
    pub fn export_all(&self, dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let files = [
            ("events.csv", Self::export_events_csv as fn(&Self, &Path) -> Result<()>),
            ("returns.csv", Self::export_returns_csv),
            ("metrics.csv", Self::export_metrics_csv),
            ("significance.csv", Self::export_significance_csv),
            ("cost_scenarios.csv", Self::export_cost_scenarios_csv),
            ("subperiods.csv", Self::export_subperiods_csv),
            ("consistency.csv", Self::export_consistency_csv),
            ("report.json", Self::export_report_json),
        ];

        let mut written = Vec::with_capacity(files.len());
        for (name, export) in files {
            let path = dir.join(name);
            export(self, &path)?;
            written.push(path);
        }
        info!("Exported {} files to {}", written.len(), dir.display());
        Ok(written)
    }

    /// Export the rebalance log: weights, turnover, N-effective and flags.
    pub fn export_events_csv(&self, path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        let assets = &self.report.assets;

        if self.config.include_headers {
            let mut header = vec![
                "strategy".to_string(),
                "date".to_string(),
                "turnover".to_string(),
                "n_effective".to_string(),
                "flag".to_string(),
                "shrinkage_intensity".to_string(),
            ];
            header.extend(assets.iter().map(|a| format!("w_{}", a)));
            header.extend(assets.iter().map(|a| format!("rc_{}", a)));
            writeln!(writer, "{}", header.join(","))?;
        }

        let prec = self.config.precision;
        for backtest in &self.report.run.strategies {
            for event in &backtest.events {
                let mut fields = vec![
                    event.strategy.label().to_string(),
                    event.date.format(&self.config.date_format).to_string(),
                    format!("{:.prec$}", event.turnover),
                    format!("{:.prec$}", event.n_effective),
                    event.flag.as_ref().map(|f| f.label()).unwrap_or("").to_string(),
                    event
                        .estimate
                        .as_ref()
                        .map(|e| format!("{:.prec$}", e.shrinkage_intensity))
                        .unwrap_or_default(),
                ];
                fields.extend(event.target_weights.iter().map(|w| format!("{:.prec$}", w)));
                match &event.risk_contributions {
                    Some(rc) => fields.extend(rc.iter().map(|c| format!("{:.prec$}", c))),
                    None => fields.extend(assets.iter().map(|_| String::new())),
                }
                writeln!(writer, "{}", fields.join(","))?;
            }
        }

        Ok(())
    }

    /// Export realized returns, gross and net, one row per date.
    pub fn export_returns_csv(&self, path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(self.returns_to_csv().as_bytes())?;
        Ok(())
    }

    /// Realized returns as CSV text.
    pub fn returns_to_csv(&self) -> String {
        let mut csv = String::new();
        let backtests = &self.report.run.strategies;
        let net = &self.report.net_series;

        if self.config.include_headers {
            let mut header = vec!["date".to_string(), "risk_free".to_string()];
            for backtest in backtests {
                let key = backtest.strategy.label().to_lowercase().replace([' ', '-'], "_");
                header.push(format!("{}_gross", key));
                header.push(format!("{}_net", key));
            }
            csv.push_str(&header.join(","));
            csv.push('\n');
        }

        let Some(reference) = net.first() else {
            return csv;
        };
        let prec = self.config.precision;
        for (t, date) in reference.dates.iter().enumerate() {
            let mut fields = vec![
                date.format(&self.config.date_format).to_string(),
                format!("{:.prec$}", reference.risk_free[t]),
            ];
            for (backtest, series) in backtests.iter().zip(net) {
                fields.push(format!("{:.prec$}", backtest.gross.returns[t]));
                fields.push(format!("{:.prec$}", series.returns[t]));
            }
            csv.push_str(&fields.join(","));
            csv.push('\n');
        }
        csv
    }

    /// Export net metrics, one row per strategy.
    pub fn export_metrics_csv(&self, path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        let Some(first) = self.report.strategies.first() else {
            return Ok(());
        };

        if self.config.include_headers {
            let names: Vec<&str> = first.metrics.entries().iter().map(|(name, _)| *name).collect();
            writeln!(
                writer,
                "strategy,{},average_turnover,average_n_effective,flagged_rebalances",
                names.join(",")
            )?;
        }

        let prec = self.config.precision;
        for summary in &self.report.strategies {
            let values: Vec<String> = summary
                .metrics
                .entries()
                .iter()
                .map(|(_, v)| format!("{:.prec$}", v))
                .collect();
            writeln!(
                writer,
                "{},{},{:.prec$},{:.prec$},{}",
                summary.strategy.label(),
                values.join(","),
                summary.average_turnover,
                summary.average_n_effective,
                summary.flagged
            )?;
        }

        Ok(())
    }

    /// Export pairwise significance results.
    pub fn export_significance_csv(&self, path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);

        if self.config.include_headers {
            writeln!(
                writer,
                "first,second,sharpe_difference,jk_z,jk_p_value,boot_ci_lower,boot_ci_upper,boot_std_error,boot_p_value,iterations,block_size"
            )?;
        }

        let prec = self.config.precision;
        for result in &self.report.significance {
            writeln!(
                writer,
                "{},{},{:.prec$},{:.prec$},{:.prec$},{:.prec$},{:.prec$},{:.prec$},{:.prec$},{},{}",
                result.first.label(),
                result.second.label(),
                result.sharpe_difference,
                result.jobson_korkie.z_statistic,
                result.jobson_korkie.p_value,
                result.bootstrap.ci_lower,
                result.bootstrap.ci_upper,
                result.bootstrap.std_error,
                result.bootstrap.p_value,
                result.bootstrap.iterations,
                result.bootstrap.block_size,
            )?;
        }

        Ok(())
    }

    /// Export cost scenarios.
    pub fn export_cost_scenarios_csv(&self, path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);

        if self.config.include_headers {
            writeln!(
                writer,
                "strategy,bps,annualized_return,sharpe_ratio,total_cost,annual_cost_drag"
            )?;
        }

        let prec = self.config.precision;
        for scenario in &self.report.cost_scenarios.scenarios {
            writeln!(
                writer,
                "{},{},{:.prec$},{:.prec$},{:.prec$},{:.prec$}",
                scenario.strategy.label(),
                scenario.bps,
                scenario.metrics.annualized_return,
                scenario.metrics.sharpe_ratio,
                scenario.total_cost,
                scenario.annual_cost_drag,
            )?;
        }

        Ok(())
    }

    /// Export net metrics per sub-period block.
    pub fn export_subperiods_csv(&self, path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);

        if self.config.include_headers {
            writeln!(
                writer,
                "strategy,block,start,end,observations,annualized_return,annualized_volatility,sharpe_ratio"
            )?;
        }

        let prec = self.config.precision;
        let fmt = &self.config.date_format;
        for block in &self.report.subperiods.periods {
            writeln!(
                writer,
                "{},{},{},{},{},{:.prec$},{:.prec$},{:.prec$}",
                block.strategy.label(),
                block.index,
                block.start.format(fmt),
                block.end.format(fmt),
                block.observations,
                block.annualized_return,
                block.annualized_volatility,
                block.sharpe_ratio,
            )?;
        }

        Ok(())
    }

    /// Export the per-strategy spread of sub-period metrics.
    pub fn export_consistency_csv(&self, path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);

        if self.config.include_headers {
            writeln!(
                writer,
                "strategy,blocks,mean_return,std_return,min_return,max_return,mean_volatility,std_volatility,mean_sharpe,std_sharpe,min_sharpe,max_sharpe,positive_sharpe_blocks"
            )?;
        }

        let prec = self.config.precision;
        for summary in &self.report.subperiods.consistency {
            writeln!(
                writer,
                "{},{},{:.prec$},{:.prec$},{:.prec$},{:.prec$},{:.prec$},{:.prec$},{:.prec$},{:.prec$},{:.prec$},{:.prec$},{}",
                summary.strategy.label(),
                summary.periods,
                summary.mean_return,
                summary.std_return,
                summary.min_return,
                summary.max_return,
                summary.mean_volatility,
                summary.std_volatility,
                summary.mean_sharpe,
                summary.std_sharpe,
                summary.min_sharpe,
                summary.max_sharpe,
                summary.positive_sharpe_periods,
            )?;
        }

        Ok(())
    }

    /// Export the whole report as JSON.
    pub fn export_report_json(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self.report)?;
        Ok(())
    }
}
