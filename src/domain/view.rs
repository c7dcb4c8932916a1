//! Investor views and the Black-Litterman posterior.
//!
//! Views are absolute assertions on single assets. They are encoded as a
//! picking matrix P (one row per view), a view vector Q and a diagonal
//! uncertainty matrix Ω, then blended with the equilibrium prior. Several
//! views may name the same asset; each is one more noisy observation of it:
//!
//! ```text
//! μ = [(τΣ)⁻¹ + PᵀΩ⁻¹P]⁻¹ [(τΣ)⁻¹Π + PᵀΩ⁻¹Q]
//!   = Π + τΣPᵀ (PτΣPᵀ + Ω)⁻¹ (Q − PΠ)
//! ```
//!
//! The second (update) form is what gets evaluated. It needs a single K x K
//! inversion and stays well-conditioned as Ω → 0, where the first form
//! blows up.

use crate::domain::equilibrium::ReturnVector;
use crate::domain::error::QuantlabError;
use crate::domain::estimator::CovarianceMatrix;
use crate::domain::linalg::{checked_inverse, symmetrize};
use nalgebra::{DMatrix, DVector};
use tracing::{debug, warn};

/// Default weight on the prior covariance. Small τ means the equilibrium is
/// known precisely relative to the return distribution.
pub const DEFAULT_TAU: f64 = 0.05;

/// An absolute view: `symbol` is expected to return `expected_return`.
///
/// `uncertainty` is the view variance (a diagonal entry of Ω); lower means
/// more confident and zero means certain. When absent it defaults to
/// τ·σ², the prior variance of the view portfolio.
#[derive(Debug, Clone, PartialEq)]
pub struct View {
    pub symbol: String,
    pub expected_return: f64,
    pub uncertainty: Option<f64>,
}

impl View {
    pub fn new(symbol: &str, expected_return: f64) -> Self {
        View {
            symbol: symbol.to_string(),
            expected_return,
            uncertainty: None,
        }
    }

    pub fn with_uncertainty(mut self, uncertainty: f64) -> Self {
        self.uncertainty = Some(uncertainty);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Posterior {
    pub returns: ReturnVector,
    pub covariance: CovarianceMatrix,
    /// Symbols of the views that entered the blend, in input order. A symbol
    /// appears once per view on it.
    pub applied: Vec<String>,
    /// Views on symbols outside the estimated universe.
    pub skipped: Vec<String>,
}

fn validate_views(views: &[View]) -> Result<(), QuantlabError> {
    for view in views {
        if !view.expected_return.is_finite() {
            return Err(QuantlabError::configuration(format!(
                "view on {} has a non-finite expected return",
                view.symbol
            )));
        }
        if let Some(u) = view.uncertainty {
            if !u.is_finite() || u < 0.0 {
                return Err(QuantlabError::configuration(format!(
                    "view on {} has invalid uncertainty {u}",
                    view.symbol
                )));
            }
        }
    }
    Ok(())
}

/// Blend the equilibrium prior with `views`.
///
/// With no applicable views the prior is returned unchanged. Otherwise the
/// posterior covariance is the prior covariance tightened by the view
/// precision: Σ − τΣPᵀ(PτΣPᵀ + Ω)⁻¹PτΣ.
pub fn blend(
    equilibrium: &ReturnVector,
    covariance: &CovarianceMatrix,
    views: &[View],
    tau: f64,
) -> Result<Posterior, QuantlabError> {
    if !tau.is_finite() || tau <= 0.0 || tau > 1.0 {
        return Err(QuantlabError::configuration(format!(
            "tau must be in (0, 1], got {tau}"
        )));
    }
    if equilibrium.symbols != covariance.symbols() {
        return Err(QuantlabError::configuration(
            "equilibrium returns and covariance cover different assets",
        ));
    }
    validate_views(views)?;

    let mut applied: Vec<(usize, &View)> = Vec::new();
    let mut skipped = Vec::new();
    for view in views {
        match covariance.index_of(&view.symbol) {
            Some(i) => applied.push((i, view)),
            None => {
                warn!(symbol = %view.symbol, "skipping view on asset outside the universe");
                skipped.push(view.symbol.clone());
            }
        }
    }

    if applied.is_empty() {
        return Ok(Posterior {
            returns: equilibrium.clone(),
            covariance: covariance.clone(),
            applied: Vec::new(),
            skipped,
        });
    }

    let n = covariance.len();
    let k = applied.len();
    let sigma = covariance.matrix();
    let tau_sigma = sigma * tau;

    let mut p = DMatrix::<f64>::zeros(k, n);
    let mut q = DVector::<f64>::zeros(k);
    let mut omega = DMatrix::<f64>::zeros(k, k);
    for (row, (asset, view)) in applied.iter().enumerate() {
        p[(row, *asset)] = 1.0;
        q[row] = view.expected_return;
        omega[(row, row)] = view.uncertainty.unwrap_or(tau * sigma[(*asset, *asset)]);
    }

    let tau_sigma_pt = &tau_sigma * p.transpose();
    let view_cov = &p * &tau_sigma_pt + &omega;
    let view_cov_inv = checked_inverse(&view_cov, "view covariance (P·τΣ·Pᵀ + Ω)")?;
    let gain = &tau_sigma_pt * view_cov_inv;

    let surprise = &q - &p * &equilibrium.values;
    let mu = &equilibrium.values + &gain * surprise;
    if mu.iter().any(|v| !v.is_finite()) {
        return Err(QuantlabError::Optimization {
            matrix: "posterior returns".into(),
            reason: "non-finite posterior expected return".into(),
            condition: f64::NAN,
        });
    }

    let tightened = symmetrize(&(sigma - &gain * &p * &tau_sigma));
    let posterior_cov = CovarianceMatrix::new(covariance.symbols().to_vec(), tightened)?;

    debug!(views = k, skipped = skipped.len(), "views blended");

    Ok(Posterior {
        returns: ReturnVector {
            symbols: equilibrium.symbols.clone(),
            values: mu,
        },
        covariance: posterior_cov,
        applied: applied.iter().map(|(_, v)| v.symbol.clone()).collect(),
        skipped,
    })
}
