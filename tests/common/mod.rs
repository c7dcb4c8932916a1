#![allow(dead_code)]

use chrono::NaiveDate;
use quantlab::domain::error::QuantlabError;
use quantlab::domain::price_table::PriceTable;
use quantlab::domain::view::View;
use quantlab::ports::price_port::PricePort;
use quantlab::ports::view_port::ViewPort;
use std::collections::BTreeMap;

pub struct MockPricePort {
    pub series: BTreeMap<String, Vec<(NaiveDate, f64)>>,
}

impl MockPricePort {
    pub fn new() -> Self {
        Self {
            series: BTreeMap::new(),
        }
    }

    pub fn with_series(mut self, symbol: &str, series: Vec<(NaiveDate, f64)>) -> Self {
        self.series.insert(symbol.to_string(), series);
        self
    }
}

impl PricePort for MockPricePort {
    fn list_symbols(&self) -> Result<Vec<String>, QuantlabError> {
        Ok(self.series.keys().cloned().collect())
    }

    fn load_prices(&self, symbols: &[String]) -> Result<PriceTable, QuantlabError> {
        let mut table = PriceTable::new();
        for symbol in symbols {
            let series = self.series.get(symbol).ok_or_else(|| QuantlabError::Data {
                reason: format!("no prices for {symbol}"),
            })?;
            table.insert_series(symbol, series)?;
        }
        Ok(table)
    }
}

pub struct MockViewPort {
    pub views: Vec<View>,
    pub caps: Option<BTreeMap<String, f64>>,
}

impl MockViewPort {
    pub fn new(views: Vec<View>) -> Self {
        Self { views, caps: None }
    }

    pub fn with_caps(mut self, caps: &[(&str, f64)]) -> Self {
        self.caps = Some(caps.iter().map(|(s, c)| (s.to_string(), *c)).collect());
        self
    }
}

impl ViewPort for MockViewPort {
    fn load_views(&self) -> Result<Vec<View>, QuantlabError> {
        Ok(self.views.clone())
    }

    fn load_market_caps(&self) -> Result<Option<BTreeMap<String, f64>>, QuantlabError> {
        Ok(self.caps.clone())
    }
}

pub fn day(i: usize) -> NaiveDate {
    NaiveDate::from_ymd_opt(2020, 1, 1).unwrap() + chrono::Duration::days(i as i64)
}

/// Compounding series with a sinusoidal return component, so different
/// frequencies give a well-conditioned covariance.
pub fn wiggly_series(n: usize, amplitude: f64, freq: f64, drift: f64) -> Vec<(NaiveDate, f64)> {
    let mut price = 100.0;
    (0..n)
        .map(|i| {
            price *= 1.0 + drift + amplitude * ((i as f64) * freq).sin();
            (day(i), price)
        })
        .collect()
}

/// Constant growth per period over `[start, end)`.
pub fn growth_series(start: usize, end: usize, growth: f64) -> Vec<(NaiveDate, f64)> {
    (start..end)
        .map(|i| (day(i), 100.0 * (1.0 + growth).powi((i - start) as i32)))
        .collect()
}

pub fn three_asset_port(n: usize) -> MockPricePort {
    MockPricePort::new()
        .with_series("AAA", wiggly_series(n, 0.010, 0.7, 0.0005))
        .with_series("BBB", wiggly_series(n, 0.020, 1.9, 0.0002))
        .with_series("CCC", wiggly_series(n, 0.015, 3.1, 0.0001))
}

pub fn symbols(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// Write `<SYMBOL>.csv` files with `date,adj_close` rows.
pub fn write_price_csv(dir: &std::path::Path, symbol: &str, series: &[(NaiveDate, f64)]) {
    let mut content = String::from("date,adj_close\n");
    for (date, price) in series {
        content.push_str(&format!("{},{}\n", date.format("%Y-%m-%d"), price));
    }
    std::fs::write(dir.join(format!("{symbol}.csv")), content).unwrap();
}
