//! Command-line interface for the portfolio comparison.

use portfolio_lab::analytics::ResultFormatter;
use portfolio_lab::config::{AnalysisFileConfig, ShrinkageSetting};
use portfolio_lab::data::{load_returns_csv, load_risk_free_csv, DataConfig};
use portfolio_lab::error::Result;
use portfolio_lab::export::Exporter;
use portfolio_lab::report::ComparisonReport;
use portfolio_lab::sensitivity::{SensitivityAnalysis, SensitivityConfig};
use portfolio_lab::types::{ReturnMatrix, RiskFreeRate};

use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Walk-forward comparison of Equal Weight, Mean-Variance and Risk Parity portfolios.
#[derive(Parser)]
#[command(name = "portfolio-lab")]
#[command(version)]
#[command(about = "Compare portfolio construction rules out of sample and test whether they differ")]
#[command(long_about = None)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the full comparison and print the report
    Run {
        /// CSV of periodic returns: date column followed by one column per asset
        #[arg(short, long)]
        returns: PathBuf,

        /// CSV of periodic risk-free rates (date,rate); overrides the config file
        #[arg(long)]
        risk_free: Option<PathBuf>,

        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Directory for CSV and JSON exports
        #[arg(short = 'd', long)]
        output_dir: Option<PathBuf>,

        /// Override the cost in basis points per unit of turnover
        #[arg(long)]
        cost_bps: Option<f64>,

        /// Override the bootstrap seed
        #[arg(long)]
        seed: Option<u64>,

        /// Override the sub-period block length, in periods
        #[arg(long)]
        subperiod_length: Option<usize>,
    },

    /// Sweep estimation windows, rebalance frequencies and shrinkage settings
    Sensitivity {
        /// CSV of periodic returns
        #[arg(short, long)]
        returns: PathBuf,

        /// CSV of periodic risk-free rates (date,rate)
        #[arg(long)]
        risk_free: Option<PathBuf>,

        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Estimation windows to test
        #[arg(long, value_delimiter = ',', default_value = "12,24,36")]
        windows: Vec<usize>,

        /// Rebalance frequencies to test
        #[arg(long, value_delimiter = ',', default_value = "3,6,12")]
        frequencies: Vec<usize>,

        /// Shrinkage settings to test: none, auto or an intensity
        #[arg(long, value_delimiter = ',', default_value = "none,auto")]
        shrinkage: Vec<String>,

        /// Write the sweep as CSV
        #[arg(long)]
        csv: Option<PathBuf>,
    },

    /// Validate a returns file
    Validate {
        /// CSV of periodic returns
        #[arg(short, long)]
        returns: PathBuf,
    },

    /// Generate an example configuration file
    InitConfig {
        /// Output path for config file
        #[arg(short, long, default_value = "portfolio.toml")]
        path: PathBuf,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

impl Cli {
    /// Initialize logging based on verbosity level.
    pub fn init_logging(&self) {
        let level = match self.verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        };

        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(false)
            .with_writer(std::io::stderr)
            .finish();

        if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
            eprintln!("Failed to set tracing subscriber: {}", e);
        }
    }
}

/// Run the CLI application.
pub fn run() -> Result<()> {
    let cli = Cli::parse();
    cli.init_logging();

    match &cli.command {
        Commands::Run {
            returns,
            risk_free,
            config,
            output_dir,
            cost_bps,
            seed,
            subperiod_length,
        } => run_comparison(
            returns,
            risk_free.as_deref(),
            config.as_deref(),
            output_dir.as_deref(),
            *cost_bps,
            *seed,
            *subperiod_length,
            cli.output,
        ),

        Commands::Sensitivity {
            returns,
            risk_free,
            config,
            windows,
            frequencies,
            shrinkage,
            csv,
        } => run_sensitivity(
            returns,
            risk_free.as_deref(),
            config.as_deref(),
            windows,
            frequencies,
            shrinkage,
            csv.as_deref(),
            cli.output,
        ),

        Commands::Validate { returns } => validate_data(returns),

        Commands::InitConfig { path } => init_config(path),
    }
}

fn load_file_config(path: Option<&Path>) -> Result<AnalysisFileConfig> {
    match path {
        Some(path) => AnalysisFileConfig::load(path),
        None => Ok(AnalysisFileConfig::default()),
    }
}

fn load_inputs(
    returns: &Path,
    risk_free: Option<&Path>,
    file_config: &AnalysisFileConfig,
) -> Result<(ReturnMatrix, RiskFreeRate)> {
    let data_config = DataConfig::default();
    let matrix = load_returns_csv(returns, &data_config)?;
    let rate = match risk_free {
        Some(path) => load_risk_free_csv(path, &matrix, &data_config)?,
        None => file_config.risk_free.resolve(&matrix)?,
    };
    Ok((matrix, rate))
}

#[allow(clippy::too_many_arguments)]
fn run_comparison(
    returns: &Path,
    risk_free: Option<&Path>,
    config_path: Option<&Path>,
    output_dir: Option<&Path>,
    cost_bps: Option<f64>,
    seed: Option<u64>,
    subperiod_length: Option<usize>,
    output: OutputFormat,
) -> Result<()> {
    let mut file_config = load_file_config(config_path)?;
    if let Some(bps) = cost_bps {
        file_config.costs.bps = bps;
    }
    if let Some(seed) = seed {
        file_config.significance.seed = seed;
    }
    if let Some(length) = subperiod_length {
        file_config.subperiods.period_length = length;
        file_config.subperiods.min_observations = file_config.subperiods.min_observations.min(length);
    }
    file_config.validate()?;

    let (matrix, rate) = load_inputs(returns, risk_free, &file_config)?;
    let analysis = file_config.to_analysis_config()?;
    let report = ComparisonReport::build(&matrix, &rate, &analysis)?;

    match output {
        OutputFormat::Text => ResultFormatter::print_report(&report),
        OutputFormat::Json => println!("{}", ResultFormatter::to_json(&report)),
    }

    if let Some(dir) = output_dir {
        let written = Exporter::new(&report).export_all(dir)?;
        info!("Wrote {} files", written.len());
        if output == OutputFormat::Text {
            println!("Results exported to {}", dir.display());
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_sensitivity(
    returns: &Path,
    risk_free: Option<&Path>,
    config_path: Option<&Path>,
    windows: &[usize],
    frequencies: &[usize],
    shrinkage: &[String],
    csv: Option<&Path>,
    output: OutputFormat,
) -> Result<()> {
    let file_config = load_file_config(config_path)?;
    let (matrix, rate) = load_inputs(returns, risk_free, &file_config)?;

    let shrinkages = shrinkage
        .iter()
        .map(|s| {
            let setting = match s.trim().parse::<f64>() {
                Ok(intensity) => ShrinkageSetting::Intensity(intensity),
                Err(_) => ShrinkageSetting::Mode(s.trim().to_string()),
            };
            setting.to_shrinkage()
        })
        .collect::<Result<Vec<_>>>()?;

    let grid = SensitivityConfig::new()
        .with_windows(windows.to_vec())
        .with_frequencies(frequencies.to_vec())
        .with_shrinkages(shrinkages);

    let analysis = SensitivityAnalysis::run(
        &file_config.to_backtest_config()?,
        &grid,
        &matrix,
        &rate,
        &file_config.to_metrics_config(),
    )?;

    match output {
        OutputFormat::Text => ResultFormatter::print_sensitivity(&analysis),
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(&analysis).unwrap_or_else(|_| "{}".to_string())
        ),
    }

    if let Some(path) = csv {
        fs::write(path, analysis.to_csv())?;
        info!("Sensitivity table written to {}", path.display());
    }

    Ok(())
}

fn init_config(output: &Path) -> Result<()> {
    let example = AnalysisFileConfig::example();
    fs::write(output, example)?;
    println!("Created example configuration file: {}", output.display());
    println!("\nEdit this file to customize the comparison, then run:");
    println!("  portfolio-lab run -r returns.csv -c {}", output.display());
    Ok(())
}

fn validate_data(returns: &Path) -> Result<()> {
    println!("Validating returns file: {}", returns.display());

    let matrix = load_returns_csv(returns, &DataConfig::default())?;

    println!("\nData Summary:");
    println!("  Periods: {}", matrix.len());
    println!("  Assets: {}", matrix.n_assets());

    if let (Some(first), Some(last)) = (matrix.dates().first(), matrix.dates().last()) {
        println!("  Start: {}", first);
        println!("  End: {}", last);
    }

    for (j, asset) in matrix.assets().iter().enumerate() {
        let column = matrix.column(j);
        let mean = column.iter().sum::<f64>() / column.len().max(1) as f64;
        let min = column.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = column.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        println!(
            "  {:<12} mean {:>8.4}  min {:>8.4}  max {:>8.4}",
            asset, mean, min, max
        );
    }

    println!("\nValidation: PASSED");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse() {
        let cli = Cli::try_parse_from([
            "portfolio-lab",
            "run",
            "-r",
            "returns.csv",
            "-c",
            "portfolio.toml",
            "--cost-bps",
            "25",
        ]);
        assert!(cli.is_ok());
    }

    #[test]
    fn test_subperiod_length_flag() {
        let cli = Cli::try_parse_from([
            "portfolio-lab",
            "run",
            "-r",
            "returns.csv",
            "--subperiod-length",
            "12",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                subperiod_length, ..
            } => assert_eq!(subperiod_length, Some(12)),
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn test_sensitivity_lists() {
        let cli = Cli::try_parse_from([
            "portfolio-lab",
            "-vv",
            "sensitivity",
            "-r",
            "returns.csv",
            "--windows",
            "12,36",
            "--shrinkage",
            "none,0.5",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Sensitivity {
                windows,
                frequencies,
                shrinkage,
                ..
            } => {
                assert_eq!(windows, vec![12, 36]);
                assert_eq!(frequencies, vec![3, 6, 12]);
                assert_eq!(shrinkage, vec!["none".to_string(), "0.5".to_string()]);
            }
            _ => panic!("expected sensitivity command"),
        }
    }

    #[test]
    fn test_init_config_command() {
        let cli = Cli::try_parse_from(["portfolio-lab", "--output", "json", "init-config"]);
        assert!(cli.is_ok());
    }
}
