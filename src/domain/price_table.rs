//! Multi-asset price table and date alignment.
//!
//! `PriceTable` is the immutable input handed to the core by the data-loading
//! layer (date -> symbol -> adjusted close). `AlignedPrices` is the dense
//! date x symbol grid both the estimator and the backtest engine work on.

use crate::domain::error::QuantlabError;
use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriceTable {
    rows: BTreeMap<NaiveDate, BTreeMap<String, f64>>,
}

impl PriceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert one adjusted close. Rejects non-positive or non-finite prices
    /// and a second price for the same (date, symbol).
    pub fn insert(&mut self, date: NaiveDate, symbol: &str, price: f64) -> Result<(), QuantlabError> {
        if !price.is_finite() || price <= 0.0 {
            return Err(QuantlabError::data_quality(format!(
                "{symbol} on {date}: price must be positive and finite, got {price}"
            )));
        }
        let row = self.rows.entry(date).or_default();
        if row.contains_key(symbol) {
            return Err(QuantlabError::data_quality(format!(
                "{symbol}: duplicate price for {date}"
            )));
        }
        row.insert(symbol.to_string(), price);
        Ok(())
    }

    /// Insert a whole series for one symbol.
    pub fn insert_series(
        &mut self,
        symbol: &str,
        series: &[(NaiveDate, f64)],
    ) -> Result<(), QuantlabError> {
        for &(date, price) in series {
            self.insert(date, symbol, price)?;
        }
        Ok(())
    }

    pub fn get(&self, date: NaiveDate, symbol: &str) -> Option<f64> {
        self.rows.get(&date).and_then(|row| row.get(symbol)).copied()
    }

    /// Sorted, de-duplicated symbol list.
    pub fn symbols(&self) -> Vec<String> {
        let set: BTreeSet<&String> = self.rows.values().flat_map(|row| row.keys()).collect();
        set.into_iter().cloned().collect()
    }

    pub fn dates(&self) -> Vec<NaiveDate> {
        self.rows.keys().copied().collect()
    }

    /// Number of dates on which `symbol` has a price.
    pub fn observations(&self, symbol: &str) -> usize {
        self.rows.values().filter(|row| row.contains_key(symbol)).count()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Copy of the table restricted to `symbols`. Dates left without any
    /// price are dropped.
    pub fn restrict(&self, symbols: &[String]) -> PriceTable {
        let keep: BTreeSet<&str> = symbols.iter().map(String::as_str).collect();
        let rows = self
            .rows
            .iter()
            .filter_map(|(date, row)| {
                let filtered: BTreeMap<String, f64> = row
                    .iter()
                    .filter(|(s, _)| keep.contains(s.as_str()))
                    .map(|(s, p)| (s.clone(), *p))
                    .collect();
                (!filtered.is_empty()).then_some((*date, filtered))
            })
            .collect();
        PriceTable { rows }
    }

    pub fn align(&self, rule: AlignmentRule) -> AlignedPrices {
        let symbols = self.symbols();
        let mut dates = Vec::with_capacity(self.rows.len());
        let mut prices = Vec::with_capacity(self.rows.len());

        for (date, row) in &self.rows {
            let values: Vec<Option<f64>> = symbols.iter().map(|s| row.get(s).copied()).collect();
            if rule == AlignmentRule::DropIncomplete && values.iter().any(Option::is_none) {
                continue;
            }
            dates.push(*date);
            prices.push(values);
        }

        if rule == AlignmentRule::ForwardFill {
            forward_fill_interior(&mut prices, symbols.len());
        }

        AlignedPrices {
            dates,
            symbols,
            prices,
        }
    }
}

/// Fill gaps strictly between an asset's first and last observation with the
/// previous price. Leading and trailing gaps stay empty.
fn forward_fill_interior(prices: &mut [Vec<Option<f64>>], columns: usize) {
    for j in 0..columns {
        let last_obs = prices.iter().rposition(|row| row[j].is_some());
        let Some(last_obs) = last_obs else {
            continue;
        };
        let mut carry: Option<f64> = None;
        for row in prices.iter_mut().take(last_obs + 1) {
            match row[j] {
                Some(p) => carry = Some(p),
                None => row[j] = carry,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlignmentRule {
    /// Carry the last price over interior gaps.
    #[default]
    ForwardFill,
    /// Keep only dates on which every symbol has a price.
    DropIncomplete,
}

impl AlignmentRule {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "forward_fill" | "ffill" => Some(AlignmentRule::ForwardFill),
            "drop_incomplete" | "drop" => Some(AlignmentRule::DropIncomplete),
            _ => None,
        }
    }
}

/// Dense date x symbol price grid. `None` means the asset has no usable price
/// on that date (not yet listed, delisted, or a dropped gap).
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedPrices {
    dates: Vec<NaiveDate>,
    symbols: Vec<String>,
    prices: Vec<Vec<Option<f64>>>,
}

impl AlignedPrices {
    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn price(&self, t: usize, j: usize) -> Option<f64> {
        self.prices.get(t).and_then(|row| row.get(j)).copied().flatten()
    }

    pub fn symbol_index(&self, symbol: &str) -> Option<usize> {
        self.symbols.iter().position(|s| s == symbol)
    }

    /// Index of the first row with a price for column `j`.
    pub fn first_valid(&self, j: usize) -> Option<usize> {
        self.prices.iter().position(|row| row[j].is_some())
    }

    /// Number of rows with a price for column `j`.
    pub fn count_valid(&self, j: usize) -> usize {
        self.prices.iter().filter(|row| row[j].is_some()).count()
    }

    /// Simple return of column `j` from row `from` to row `to`, if both
    /// prices exist.
    pub fn simple_return(&self, j: usize, from: usize, to: usize) -> Option<f64> {
        let start = self.price(from, j)?;
        let end = self.price(to, j)?;
        Some(end / start - 1.0)
    }

    /// The last `n` rows.
    pub fn tail(&self, n: usize) -> AlignedPrices {
        let start = self.len().saturating_sub(n);
        AlignedPrices {
            dates: self.dates[start..].to_vec(),
            symbols: self.symbols.clone(),
            prices: self.prices[start..].to_vec(),
        }
    }

    /// Keep only rows on which every column has a price.
    pub fn complete_rows(&self) -> AlignedPrices {
        let (dates, prices) = self
            .dates
            .iter()
            .zip(&self.prices)
            .filter(|(_, row)| row.iter().all(Option::is_some))
            .map(|(d, row)| (*d, row.clone()))
            .unzip();
        AlignedPrices {
            dates,
            symbols: self.symbols.clone(),
            prices,
        }
    }
}
