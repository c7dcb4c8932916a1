//! Investor view and market weight port trait.

use crate::domain::error::QuantlabError;
use crate::domain::view::View;
use std::collections::BTreeMap;

pub trait ViewPort {
    fn load_views(&self) -> Result<Vec<View>, QuantlabError>;

    /// Market capitalization (or any relative size) per symbol, when the
    /// source has them.
    fn load_market_caps(&self) -> Result<Option<BTreeMap<String, f64>>, QuantlabError>;
}
