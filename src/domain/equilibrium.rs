//! Equilibrium (market-implied) returns by reverse optimization.
//!
//! Π = δ Σ w_mkt: the expected returns under which the market portfolio is
//! mean-variance optimal for risk aversion δ.

use crate::domain::error::QuantlabError;
use crate::domain::estimator::CovarianceMatrix;
use nalgebra::DVector;
use std::collections::BTreeMap;
use tracing::warn;

/// Conventional market risk aversion used when none is configured.
pub const DEFAULT_RISK_AVERSION: f64 = 2.5;

/// Expected return per symbol, in covariance order.
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnVector {
    pub symbols: Vec<String>,
    pub values: DVector<f64>,
}

impl ReturnVector {
    pub fn get(&self, symbol: &str) -> Option<f64> {
        self.symbols
            .iter()
            .position(|s| s == symbol)
            .map(|i| self.values[i])
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

/// Where the market weights came from. Equal weighting changes the economic
/// meaning of the equilibrium, so it is surfaced in the optimizer metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketWeightSource {
    MarketCap,
    EqualWeight,
}

impl std::fmt::Display for MarketWeightSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MarketWeightSource::MarketCap => write!(f, "market-cap"),
            MarketWeightSource::EqualWeight => write!(f, "equal-weight"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarketWeights {
    symbols: Vec<String>,
    weights: DVector<f64>,
    source: MarketWeightSource,
}

impl MarketWeights {
    pub fn equal(symbols: &[String]) -> Self {
        let n = symbols.len().max(1);
        MarketWeights {
            symbols: symbols.to_vec(),
            weights: DVector::from_element(symbols.len(), 1.0 / n as f64),
            source: MarketWeightSource::EqualWeight,
        }
    }

    /// Market-cap weights restricted to `symbols` and renormalized to sum to
    /// one. Every symbol needs a finite, non-negative cap.
    pub fn from_caps(
        symbols: &[String],
        caps: &BTreeMap<String, f64>,
    ) -> Result<Self, QuantlabError> {
        let mut raw = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            let cap = caps.get(symbol).copied().ok_or_else(|| {
                QuantlabError::configuration(format!("no market weight for {symbol}"))
            })?;
            if !cap.is_finite() || cap < 0.0 {
                return Err(QuantlabError::configuration(format!(
                    "market weight for {symbol} must be finite and non-negative, got {cap}"
                )));
            }
            raw.push(cap);
        }
        let total: f64 = raw.iter().sum();
        if total <= 0.0 {
            return Err(QuantlabError::configuration(
                "market weights sum to zero",
            ));
        }
        let ignored = caps.keys().filter(|s| !symbols.contains(*s)).count();
        if ignored > 0 {
            warn!(ignored, "market weights supplied for assets outside the universe");
        }
        Ok(MarketWeights {
            symbols: symbols.to_vec(),
            weights: DVector::from_iterator(raw.len(), raw.iter().map(|c| c / total)),
            source: MarketWeightSource::MarketCap,
        })
    }

    /// Cap weights when given, equal weights otherwise.
    pub fn resolve(
        symbols: &[String],
        caps: Option<&BTreeMap<String, f64>>,
    ) -> Result<Self, QuantlabError> {
        match caps {
            Some(caps) => Self::from_caps(symbols, caps),
            None => Ok(Self::equal(symbols)),
        }
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn weights(&self) -> &DVector<f64> {
        &self.weights
    }

    pub fn source(&self) -> MarketWeightSource {
        self.source
    }
}

/// Π = δ Σ w
pub fn implied_returns(
    covariance: &CovarianceMatrix,
    market_weights: &MarketWeights,
    risk_aversion: f64,
) -> Result<ReturnVector, QuantlabError> {
    if !risk_aversion.is_finite() || risk_aversion <= 0.0 {
        return Err(QuantlabError::configuration(format!(
            "risk_aversion must be positive, got {risk_aversion}"
        )));
    }
    if covariance.symbols() != market_weights.symbols() {
        return Err(QuantlabError::configuration(
            "market weights and covariance cover different assets",
        ));
    }
    let values = covariance.matrix() * market_weights.weights() * risk_aversion;
    Ok(ReturnVector {
        symbols: covariance.symbols().to_vec(),
        values,
    })
}
