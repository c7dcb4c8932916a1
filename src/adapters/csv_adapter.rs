//! CSV file adapters for prices, views and market weights.

use crate::domain::error::QuantlabError;
use crate::domain::price_table::PriceTable;
use crate::domain::view::View;
use crate::ports::price_port::PricePort;
use crate::ports::view_port::ViewPort;
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// One `<SYMBOL>.csv` per asset under `base_path`, with a `date` column and
/// an `adj_close` (preferred) or `close` column.
#[derive(Debug)]
pub struct CsvAdapter {
    base_path: PathBuf,
}

impl CsvAdapter {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn csv_path(&self, symbol: &str) -> PathBuf {
        self.base_path.join(format!("{symbol}.csv"))
    }

    fn read_series(&self, symbol: &str) -> Result<Vec<(NaiveDate, f64)>, QuantlabError> {
        let path = self.csv_path(symbol);
        let content = read_file(&path)?;
        let mut rdr = csv::Reader::from_reader(content.as_bytes());

        let headers = rdr.headers().map_err(|e| QuantlabError::Data {
            reason: format!("{}: CSV header error: {}", path.display(), e),
        })?;
        let date_col = column(headers, "date").ok_or_else(|| QuantlabError::Data {
            reason: format!("{}: missing date column", path.display()),
        })?;
        let price_col = column(headers, "adj_close")
            .or_else(|| column(headers, "close"))
            .ok_or_else(|| QuantlabError::Data {
                reason: format!("{}: missing adj_close or close column", path.display()),
            })?;

        let mut series = Vec::new();
        for (line, result) in rdr.records().enumerate() {
            let record = result.map_err(|e| QuantlabError::Data {
                reason: format!("{}: CSV parse error: {}", path.display(), e),
            })?;
            let date_str = record.get(date_col).unwrap_or("").trim();
            let date = NaiveDate::parse_from_str(date_str, "%Y-%m-%d").map_err(|e| {
                QuantlabError::Data {
                    reason: format!(
                        "{} line {}: invalid date '{}': {}",
                        path.display(),
                        line + 2,
                        date_str,
                        e
                    ),
                }
            })?;
            let price_str = record.get(price_col).unwrap_or("").trim();
            // An empty cell is a gap, not an error.
            if price_str.is_empty() {
                continue;
            }
            let price: f64 = price_str.parse().map_err(|e| QuantlabError::Data {
                reason: format!(
                    "{} line {}: invalid price '{}': {}",
                    path.display(),
                    line + 2,
                    price_str,
                    e
                ),
            })?;
            series.push((date, price));
        }

        series.sort_by_key(|(d, _)| *d);
        Ok(series)
    }
}

impl PricePort for CsvAdapter {
    fn list_symbols(&self) -> Result<Vec<String>, QuantlabError> {
        let entries = fs::read_dir(&self.base_path).map_err(|e| QuantlabError::Data {
            reason: format!(
                "failed to read directory {}: {}",
                self.base_path.display(),
                e
            ),
        })?;

        let mut symbols = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| QuantlabError::Data {
                reason: format!("directory entry error: {}", e),
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("csv") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    symbols.push(stem.to_string());
                }
            }
        }

        symbols.sort();
        Ok(symbols)
    }

    fn load_prices(&self, symbols: &[String]) -> Result<PriceTable, QuantlabError> {
        let mut table = PriceTable::new();
        for symbol in symbols {
            let series = self.read_series(symbol)?;
            table.insert_series(symbol, &series)?;
        }
        Ok(table)
    }
}

/// Views (`symbol,expected_return[,uncertainty]`) and market weights
/// (`symbol,weight`) from optional CSV files.
#[derive(Debug)]
pub struct CsvViewAdapter {
    views_path: Option<PathBuf>,
    caps_path: Option<PathBuf>,
}

impl CsvViewAdapter {
    pub fn new(views_path: Option<PathBuf>, caps_path: Option<PathBuf>) -> Self {
        Self {
            views_path,
            caps_path,
        }
    }
}

impl ViewPort for CsvViewAdapter {
    fn load_views(&self) -> Result<Vec<View>, QuantlabError> {
        let Some(path) = &self.views_path else {
            return Ok(Vec::new());
        };
        let content = read_file(path)?;
        let mut rdr = csv::Reader::from_reader(content.as_bytes());
        let headers = rdr.headers().map_err(|e| QuantlabError::Data {
            reason: format!("{}: CSV header error: {}", path.display(), e),
        })?;
        let symbol_col = require_column(headers, "symbol", path)?;
        let return_col = require_column(headers, "expected_return", path)?;
        let uncertainty_col = column(headers, "uncertainty");

        let mut views = Vec::new();
        for (line, result) in rdr.records().enumerate() {
            let record = result.map_err(|e| QuantlabError::Data {
                reason: format!("{}: CSV parse error: {}", path.display(), e),
            })?;
            let symbol = record.get(symbol_col).unwrap_or("").trim();
            if symbol.is_empty() {
                return Err(QuantlabError::Data {
                    reason: format!("{} line {}: empty symbol", path.display(), line + 2),
                });
            }
            let expected_return = parse_number(record.get(return_col), path, line, "expected_return")?
                .ok_or_else(|| QuantlabError::Data {
                    reason: format!(
                        "{} line {}: missing expected_return",
                        path.display(),
                        line + 2
                    ),
                })?;
            let uncertainty = match uncertainty_col {
                Some(col) => parse_number(record.get(col), path, line, "uncertainty")?,
                None => None,
            };
            views.push(View {
                symbol: symbol.to_string(),
                expected_return,
                uncertainty,
            });
        }
        Ok(views)
    }

    fn load_market_caps(&self) -> Result<Option<BTreeMap<String, f64>>, QuantlabError> {
        let Some(path) = &self.caps_path else {
            return Ok(None);
        };
        let content = read_file(path)?;
        let mut rdr = csv::Reader::from_reader(content.as_bytes());
        let headers = rdr.headers().map_err(|e| QuantlabError::Data {
            reason: format!("{}: CSV header error: {}", path.display(), e),
        })?;
        let symbol_col = require_column(headers, "symbol", path)?;
        let weight_col = require_column(headers, "weight", path)?;

        let mut caps = BTreeMap::new();
        for (line, result) in rdr.records().enumerate() {
            let record = result.map_err(|e| QuantlabError::Data {
                reason: format!("{}: CSV parse error: {}", path.display(), e),
            })?;
            let symbol = record.get(symbol_col).unwrap_or("").trim().to_string();
            let weight = parse_number(record.get(weight_col), path, line, "weight")?
                .ok_or_else(|| QuantlabError::Data {
                    reason: format!("{} line {}: missing weight", path.display(), line + 2),
                })?;
            if caps.insert(symbol.clone(), weight).is_some() {
                return Err(QuantlabError::Data {
                    reason: format!("{}: duplicate weight for {}", path.display(), symbol),
                });
            }
        }
        Ok(Some(caps))
    }
}

fn read_file(path: &Path) -> Result<String, QuantlabError> {
    fs::read_to_string(path).map_err(|e| QuantlabError::Data {
        reason: format!("failed to read {}: {}", path.display(), e),
    })
}

fn column(headers: &csv::StringRecord, name: &str) -> Option<usize> {
    headers
        .iter()
        .position(|h| h.trim().eq_ignore_ascii_case(name))
}

fn require_column(
    headers: &csv::StringRecord,
    name: &str,
    path: &Path,
) -> Result<usize, QuantlabError> {
    column(headers, name).ok_or_else(|| QuantlabError::Data {
        reason: format!("{}: missing {} column", path.display(), name),
    })
}

fn parse_number(
    cell: Option<&str>,
    path: &Path,
    line: usize,
    field: &str,
) -> Result<Option<f64>, QuantlabError> {
    let raw = cell.unwrap_or("").trim();
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse().map(Some).map_err(|e| QuantlabError::Data {
        reason: format!(
            "{} line {}: invalid {} '{}': {}",
            path.display(),
            line + 2,
            field,
            raw,
            e
        ),
    })
}
