//! Returns & covariance estimation.
//!
//! Turns a price table into a simple-return matrix and an annualized
//! covariance matrix. When the asset count gets close to the observation
//! count the sample covariance is shrunk toward its diagonal until a
//! Cholesky factorization succeeds.

use crate::domain::error::QuantlabError;
use crate::domain::linalg::{is_positive_definite, symmetrize};
use crate::domain::price_table::{AlignedPrices, AlignmentRule, PriceTable};
use chrono::NaiveDate;
use nalgebra::DMatrix;
use tracing::{debug, warn};

/// Variances at or below this are treated as zero.
const MIN_VARIANCE: f64 = 1e-18;

/// Maximum number of intensity increases before falling back to the pure
/// diagonal target.
const MAX_SHRINKAGE_STEPS: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub struct EstimatorConfig {
    /// Number of returns in the estimation window (needs `period + 1` prices).
    pub period: usize,
    pub alignment: AlignmentRule,
    /// Periods per year used to annualize the covariance.
    pub annualization: f64,
    /// Asset/observation ratio at which shrinkage switches on.
    pub shrinkage_threshold: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        EstimatorConfig {
            period: 252,
            alignment: AlignmentRule::ForwardFill,
            annualization: 252.0,
            shrinkage_threshold: 0.5,
        }
    }
}

impl EstimatorConfig {
    pub fn validate(&self) -> Result<(), QuantlabError> {
        if self.period < 2 {
            return Err(QuantlabError::configuration(
                "estimator period must be at least 2",
            ));
        }
        if !self.annualization.is_finite() || self.annualization <= 0.0 {
            return Err(QuantlabError::configuration(
                "annualization must be positive",
            ));
        }
        if !self.shrinkage_threshold.is_finite() || self.shrinkage_threshold <= 0.0 {
            return Err(QuantlabError::configuration(
                "shrinkage_threshold must be positive",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OmissionReason {
    InsufficientHistory { observations: usize, required: usize },
    /// Enough prices overall, but not across the trailing window shared with
    /// the rest of the universe (delisted, or listed too recently).
    StaleHistory { observations: usize, required: usize },
    ZeroVariance,
}

impl std::fmt::Display for OmissionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OmissionReason::InsufficientHistory {
                observations,
                required,
            } => write!(f, "{observations} of {required} required prices"),
            OmissionReason::StaleHistory {
                observations,
                required,
            } => write!(
                f,
                "{observations} of {required} prices in the trailing window"
            ),
            OmissionReason::ZeroVariance => write!(f, "zero variance"),
        }
    }
}

/// An asset dropped from the estimation universe, reported to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetOmission {
    pub symbol: String,
    pub reason: OmissionReason,
}

/// Periodic simple returns, one row per period and one column per asset.
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnMatrix {
    dates: Vec<NaiveDate>,
    symbols: Vec<String>,
    values: DMatrix<f64>,
}

impl ReturnMatrix {
    /// Build from aligned, complete prices. Row `t` holds the return from
    /// date `t` to date `t + 1`, stamped with the later date.
    fn from_prices(prices: &AlignedPrices) -> Result<Self, QuantlabError> {
        let periods = prices.len().saturating_sub(1);
        let n = prices.symbols().len();
        let mut values = DMatrix::zeros(periods, n);
        for t in 0..periods {
            for j in 0..n {
                let r = prices.simple_return(j, t, t + 1).ok_or_else(|| {
                    QuantlabError::data_quality(format!(
                        "{}: missing price on {} after alignment",
                        prices.symbols()[j],
                        prices.dates()[t + 1]
                    ))
                })?;
                values[(t, j)] = r;
            }
        }
        Ok(ReturnMatrix {
            dates: prices.dates()[1..].to_vec(),
            symbols: prices.symbols().to_vec(),
            values,
        })
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn values(&self) -> &DMatrix<f64> {
        &self.values
    }

    pub fn n_periods(&self) -> usize {
        self.values.nrows()
    }

    pub fn n_assets(&self) -> usize {
        self.values.ncols()
    }

    pub fn column(&self, symbol: &str) -> Option<Vec<f64>> {
        let j = self.symbols.iter().position(|s| s == symbol)?;
        Some(self.values.column(j).iter().copied().collect())
    }

    fn without_columns(&self, drop: &[usize]) -> ReturnMatrix {
        let keep: Vec<usize> = (0..self.n_assets()).filter(|j| !drop.contains(j)).collect();
        let values = self.values.select_columns(keep.iter());
        ReturnMatrix {
            dates: self.dates.clone(),
            symbols: keep.iter().map(|&j| self.symbols[j].clone()).collect(),
            values,
        }
    }

    /// Unbiased sample covariance (periodic, not annualized).
    pub fn sample_covariance(&self) -> DMatrix<f64> {
        let t = self.n_periods();
        let demeaned = self.demeaned();
        if t < 2 {
            return DMatrix::zeros(self.n_assets(), self.n_assets());
        }
        symmetrize(&((demeaned.transpose() * &demeaned) / (t as f64 - 1.0)))
    }

    fn demeaned(&self) -> DMatrix<f64> {
        let mut x = self.values.clone();
        for mut col in x.column_iter_mut() {
            let mean = col.mean();
            col.add_scalar_mut(-mean);
        }
        x
    }
}

/// Symmetric covariance matrix indexed by the return matrix's symbols.
#[derive(Debug, Clone, PartialEq)]
pub struct CovarianceMatrix {
    symbols: Vec<String>,
    matrix: DMatrix<f64>,
    shrinkage: f64,
}

impl CovarianceMatrix {
    /// Wrap an externally supplied covariance. Checks shape, finiteness and
    /// symmetry.
    pub fn new(symbols: Vec<String>, matrix: DMatrix<f64>) -> Result<Self, QuantlabError> {
        let n = symbols.len();
        if matrix.nrows() != n || matrix.ncols() != n {
            return Err(QuantlabError::data_quality(format!(
                "covariance is {}x{} but {} symbols were given",
                matrix.nrows(),
                matrix.ncols(),
                n
            )));
        }
        if matrix.iter().any(|v| !v.is_finite()) {
            return Err(QuantlabError::data_quality(
                "covariance contains non-finite entries",
            ));
        }
        let asymmetry = (&matrix - matrix.transpose()).abs().max();
        if asymmetry > 1e-9 {
            return Err(QuantlabError::data_quality(format!(
                "covariance is not symmetric (max asymmetry {asymmetry:e})"
            )));
        }
        Ok(CovarianceMatrix {
            symbols,
            matrix: symmetrize(&matrix),
            shrinkage: 0.0,
        })
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    /// Shrinkage intensity applied toward the diagonal target (0 = none).
    pub fn shrinkage(&self) -> f64 {
        self.shrinkage
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn index_of(&self, symbol: &str) -> Option<usize> {
        self.symbols.iter().position(|s| s == symbol)
    }

    pub fn variance(&self, symbol: &str) -> Option<f64> {
        self.index_of(symbol).map(|i| self.matrix[(i, i)])
    }
}

/// Output of [`estimate`].
#[derive(Debug, Clone, PartialEq)]
pub struct Estimate {
    pub returns: ReturnMatrix,
    pub covariance: CovarianceMatrix,
    pub omissions: Vec<AssetOmission>,
}

/// Estimate the return matrix and covariance from a price table.
pub fn estimate(prices: &PriceTable, config: &EstimatorConfig) -> Result<Estimate, QuantlabError> {
    config.validate()?;
    let required = config.period + 1;
    let mut omissions = Vec::new();
    let mut retained = Vec::new();

    for symbol in prices.symbols() {
        let observations = prices.observations(&symbol);
        if observations < required {
            warn!(
                symbol = %symbol,
                observations,
                required,
                "omitting asset with insufficient history"
            );
            omissions.push(AssetOmission {
                symbol,
                reason: OmissionReason::InsufficientHistory {
                    observations,
                    required,
                },
            });
        } else {
            retained.push(symbol);
        }
    }
    ensure_universe(retained.len(), &omissions)?;

    // Availability is judged on the forward-filled grid so an interior gap
    // does not count against an asset, but a trailing one does.
    let trailing = prices
        .restrict(&retained)
        .align(AlignmentRule::ForwardFill)
        .tail(required);
    let mut current = Vec::with_capacity(retained.len());
    for symbol in retained {
        let observations = trailing
            .symbol_index(&symbol)
            .map_or(0, |j| trailing.count_valid(j));
        if observations < required {
            warn!(
                symbol = %symbol,
                observations,
                required,
                "omitting asset without prices across the trailing window"
            );
            omissions.push(AssetOmission {
                symbol,
                reason: OmissionReason::StaleHistory {
                    observations,
                    required,
                },
            });
        } else {
            current.push(symbol);
        }
    }
    ensure_universe(current.len(), &omissions)?;

    let aligned = prices
        .restrict(&current)
        .align(config.alignment)
        .complete_rows();
    if aligned.len() < required {
        return Err(QuantlabError::data_quality(format!(
            "date indices are misaligned: only {} common dates, need {}",
            aligned.len(),
            required
        )));
    }
    let window = aligned.tail(required);

    let mut returns = ReturnMatrix::from_prices(&window)?;
    let sample = returns.sample_covariance();

    let flat: Vec<usize> = (0..returns.n_assets())
        .filter(|&j| sample[(j, j)] <= MIN_VARIANCE)
        .collect();
    let sample = if flat.is_empty() {
        sample
    } else {
        for &j in &flat {
            let symbol = returns.symbols()[j].clone();
            warn!(symbol = %symbol, "omitting asset with zero variance");
            omissions.push(AssetOmission {
                symbol,
                reason: OmissionReason::ZeroVariance,
            });
        }
        returns = returns.without_columns(&flat);
        ensure_universe(returns.n_assets(), &omissions)?;
        returns.sample_covariance()
    };

    let (regularized, intensity) = regularize(&returns, sample, config.shrinkage_threshold)?;
    debug!(
        assets = returns.n_assets(),
        periods = returns.n_periods(),
        shrinkage = intensity,
        "covariance estimated"
    );

    let covariance = CovarianceMatrix {
        symbols: returns.symbols().to_vec(),
        matrix: symmetrize(&(regularized * config.annualization)),
        shrinkage: intensity,
    };

    Ok(Estimate {
        returns,
        covariance,
        omissions,
    })
}

fn ensure_universe(count: usize, omissions: &[AssetOmission]) -> Result<(), QuantlabError> {
    if count < 2 {
        return Err(QuantlabError::data_quality(format!(
            "only {} usable assets after omitting {} (need at least 2)",
            count,
            omissions.len()
        )));
    }
    Ok(())
}

/// Shrink toward the diagonal when the problem is ill-conditioned, raising
/// the intensity until the result is strictly positive-definite.
fn regularize(
    returns: &ReturnMatrix,
    sample: DMatrix<f64>,
    threshold: f64,
) -> Result<(DMatrix<f64>, f64), QuantlabError> {
    let ratio = returns.n_assets() as f64 / returns.n_periods() as f64;
    if ratio < threshold && is_positive_definite(&sample) {
        return Ok((sample, 0.0));
    }

    let target = DMatrix::from_diagonal(&sample.diagonal());
    let mut intensity = ledoit_wolf_intensity(returns);
    for _ in 0..MAX_SHRINKAGE_STEPS {
        let shrunk = shrink(&sample, &target, intensity);
        if is_positive_definite(&shrunk) {
            return Ok((shrunk, intensity));
        }
        intensity += (1.0 - intensity) / 2.0;
    }

    let diagonal = shrink(&sample, &target, 1.0);
    if is_positive_definite(&diagonal) {
        return Ok((diagonal, 1.0));
    }
    Err(QuantlabError::data_quality(
        "covariance is not positive-definite even after full shrinkage",
    ))
}

fn shrink(sample: &DMatrix<f64>, target: &DMatrix<f64>, intensity: f64) -> DMatrix<f64> {
    sample * (1.0 - intensity) + target * intensity
}

/// Ledoit-Wolf optimal intensity for a diagonal shrinkage target:
/// sum of off-diagonal estimation variances over the squared off-diagonal
/// mass, divided by the sample length, clamped to [0, 1].
fn ledoit_wolf_intensity(returns: &ReturnMatrix) -> f64 {
    let x = returns.demeaned();
    let t = x.nrows();
    let n = x.ncols();
    if t == 0 {
        return 1.0;
    }
    let tf = t as f64;
    let s = (x.transpose() * &x) / tf;

    let mut pi_off = 0.0;
    let mut gamma = 0.0;
    for i in 0..n {
        for j in 0..n {
            if i == j {
                continue;
            }
            let s_ij = s[(i, j)];
            let pi_ij: f64 = (0..t)
                .map(|k| (x[(k, i)] * x[(k, j)] - s_ij).powi(2))
                .sum::<f64>()
                / tf;
            pi_off += pi_ij;
            gamma += s_ij * s_ij;
        }
    }

    if gamma <= 0.0 {
        return 0.0;
    }
    (pi_off / gamma / tf).clamp(0.0, 1.0)
}
