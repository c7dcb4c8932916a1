//! Price history port trait.

use crate::domain::error::QuantlabError;
use crate::domain::price_table::PriceTable;

pub trait PricePort {
    /// Every symbol the source can provide, sorted.
    fn list_symbols(&self) -> Result<Vec<String>, QuantlabError>;

    /// Adjusted closes for `symbols`. A symbol without data is an error.
    fn load_prices(&self, symbols: &[String]) -> Result<PriceTable, QuantlabError>;
}
