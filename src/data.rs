//! Loading of return matrices and risk-free series from CSV.
//!
//! The loader expects data that has already been cleaned: one header row
//! (`date,<asset>,<asset>,...`) followed by one row per month of decimal
//! returns. Blank or unparsable cells are rejected rather than imputed.

use crate::error::{BacktestError, Result};
use crate::types::{ReturnMatrix, RiskFreeRate};
use chrono::NaiveDate;
use csv::{ReaderBuilder, StringRecord};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use tracing::{debug, info};

/// CSV reader settings.
#[derive(Debug, Clone, Default)]
pub struct DataConfig {
    /// Date format string for parsing (e.g., "%Y-%m-%d"). Tried before the built-in formats.
    pub date_format: Option<String>,
    /// CSV delimiter character. If None, delimiter is auto-detected.
    pub delimiter: Option<u8>,
}

/// Detect the CSV delimiter from the first few lines of the file.
///
/// Picks the candidate giving the most columns with a consistent count on
/// every sampled line.
fn detect_delimiter(path: &Path) -> Result<u8> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let lines: Vec<String> = reader.lines().take(5).filter_map(|l| l.ok()).collect();

    if lines.is_empty() {
        return Ok(b',');
    }

    let mut best_delimiter = b',';
    let mut best_score = 0;

    for &delim in &[b',', b'\t', b';', b'|'] {
        let counts: Vec<usize> = lines
            .iter()
            .map(|line| line.as_bytes().iter().filter(|&&b| b == delim).count() + 1)
            .collect();

        let first_count = counts[0];
        if first_count >= 2 && counts.iter().all(|&c| c == first_count) && first_count > best_score {
            best_score = first_count;
            best_delimiter = delim;
        }
    }

    Ok(best_delimiter)
}

/// Parse a monthly date. Month-only dates (`2014-03`) map to the first of the month.
pub fn parse_date(s: &str, format: Option<&str>) -> Result<NaiveDate> {
    let s = s.trim();
    if let Some(fmt) = format {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Ok(d);
        }
    }

    for fmt in ["%Y-%m-%d", "%Y/%m/%d", "%d/%m/%Y", "%d-%m-%Y"] {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Ok(d);
        }
    }

    if let Ok(d) = NaiveDate::parse_from_str(&format!("{}-01", s), "%Y-%m-%d") {
        return Ok(d);
    }
    if let Ok(d) = NaiveDate::parse_from_str(&format!("{}/01", s), "%Y/%m/%d") {
        return Ok(d);
    }

    Err(BacktestError::DataError(format!(
        "Could not parse date: '{}'",
        s
    )))
}

fn parse_value(cell: &str, column: &str, date: NaiveDate) -> Result<f64> {
    let cell = cell.trim();
    if cell.is_empty() {
        return Err(BacktestError::DataError(format!(
            "Missing value for {} on {}",
            column, date
        )));
    }
    cell.parse::<f64>().map_err(|_| {
        BacktestError::DataError(format!(
            "Invalid value '{}' for {} on {}",
            cell, column, date
        ))
    })
}

fn record_date(record: &StringRecord, row_num: usize, config: &DataConfig) -> Result<NaiveDate> {
    let cell = record.get(0).ok_or_else(|| {
        BacktestError::DataError(format!("Row {} has no date column", row_num))
    })?;
    parse_date(cell, config.date_format.as_deref())
}

/// Parse a return matrix from any CSV reader.
pub fn read_returns<R: Read>(source: R, delimiter: u8, config: &DataConfig) -> Result<ReturnMatrix> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .delimiter(delimiter)
        .from_reader(source);

    let headers = reader.headers()?.clone();
    let assets: Vec<String> = headers.iter().skip(1).map(|h| h.trim().to_string()).collect();
    if assets.is_empty() {
        return Err(BacktestError::DataError(
            "Return CSV needs a date column and at least one asset column".to_string(),
        ));
    }

    let mut dates = Vec::new();
    let mut rows = Vec::new();
    for (i, result) in reader.records().enumerate() {
        let record = result?;
        let row_num = i + 2;
        let date = record_date(&record, row_num, config)?;
        if record.len() != assets.len() + 1 {
            return Err(BacktestError::DataError(format!(
                "Row {} ({}) has {} fields, expected {}",
                row_num,
                date,
                record.len(),
                assets.len() + 1
            )));
        }
        let row = record
            .iter()
            .skip(1)
            .zip(&assets)
            .map(|(cell, asset)| parse_value(cell, asset, date))
            .collect::<Result<Vec<f64>>>()?;
        dates.push(date);
        rows.push(row);
    }

    if rows.is_empty() {
        return Err(BacktestError::DataError("Return CSV has no data rows".to_string()));
    }

    ReturnMatrix::new(dates, assets, rows)
}

/// Load a return matrix from a CSV file.
pub fn load_returns_csv(path: impl AsRef<Path>, config: &DataConfig) -> Result<ReturnMatrix> {
    let path = path.as_ref();
    info!("Loading returns from: {}", path.display());

    let delimiter = match config.delimiter {
        Some(d) => d,
        None => {
            let detected = detect_delimiter(path)?;
            debug!("Auto-detected delimiter: {:?}", char::from(detected));
            detected
        }
    };

    let matrix = read_returns(File::open(path)?, delimiter, config)?;
    info!(
        "Loaded {} months x {} assets from {} to {}",
        matrix.len(),
        matrix.n_assets(),
        matrix.date(0),
        matrix.date(matrix.len() - 1)
    );
    Ok(matrix)
}

/// Load a monthly risk-free series (`date,rate`) aligned to `matrix`.
///
/// Every matrix date must appear in the file; extra dates are ignored.
pub fn load_risk_free_csv(
    path: impl AsRef<Path>,
    matrix: &ReturnMatrix,
    config: &DataConfig,
) -> Result<RiskFreeRate> {
    let path = path.as_ref();
    info!("Loading risk-free series from: {}", path.display());

    let delimiter = match config.delimiter {
        Some(d) => d,
        None => detect_delimiter(path)?,
    };
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .delimiter(delimiter)
        .from_path(path)?;

    let mut by_date = HashMap::new();
    for (i, result) in reader.records().enumerate() {
        let record = result?;
        let date = record_date(&record, i + 2, config)?;
        let cell = record.get(1).unwrap_or("");
        by_date.insert(date, parse_value(cell, "risk-free", date)?);
    }

    let rates = matrix
        .dates()
        .iter()
        .map(|date| {
            by_date.get(date).copied().ok_or_else(|| {
                BacktestError::DataError(format!("Risk-free series has no rate for {}", date))
            })
        })
        .collect::<Result<Vec<f64>>>()?;

    debug!("Aligned {} risk-free rates", rates.len());
    let risk_free = RiskFreeRate::Periodic(rates);
    risk_free.validate(matrix.len())?;
    Ok(risk_free)
}
