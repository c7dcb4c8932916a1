//! Black-Litterman optimization pipeline.
//!
//! estimate → implied returns → blend views → solve. The primary
//! mean-variance solve runs only when at least one view was applied; every
//! other path ends in the minimum-volatility fallback. The branch taken and
//! the reason are part of the result.
//!
//! Alongside the chosen weights the outcome carries the max-Sharpe
//! portfolio and the efficient frontier under the same expected returns,
//! covariance and constraints.

use crate::domain::equilibrium::{
    DEFAULT_RISK_AVERSION, MarketWeightSource, MarketWeights, ReturnVector, implied_returns,
};
use crate::domain::error::QuantlabError;
use crate::domain::estimator::{AssetOmission, CovarianceMatrix, EstimatorConfig, estimate};
use crate::domain::linalg::is_positive_definite;
use crate::domain::price_table::PriceTable;
use crate::domain::solver::{
    Constraints, FrontierPoint, Solution, WeightVector, efficient_frontier, solve,
    solve_max_sharpe, solve_min_volatility,
};
use crate::domain::view::{DEFAULT_TAU, View, blend};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{info, warn};

pub const DEFAULT_FRONTIER_POINTS: usize = 20;

#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerConfig {
    pub estimator: EstimatorConfig,
    pub risk_aversion: f64,
    pub tau: f64,
    pub constraints: Constraints,
    /// Annual rate the max-Sharpe portfolio is measured against.
    pub risk_free_rate: f64,
    /// Points on the efficient frontier; 0 skips it.
    pub frontier_points: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig {
            estimator: EstimatorConfig::default(),
            risk_aversion: DEFAULT_RISK_AVERSION,
            tau: DEFAULT_TAU,
            constraints: Constraints::default(),
            risk_free_rate: 0.0,
            frontier_points: DEFAULT_FRONTIER_POINTS,
        }
    }
}

impl OptimizerConfig {
    pub fn validate(&self) -> Result<(), QuantlabError> {
        self.estimator.validate()?;
        if !self.risk_aversion.is_finite() || self.risk_aversion <= 0.0 {
            return Err(QuantlabError::configuration(format!(
                "risk_aversion must be positive, got {}",
                self.risk_aversion
            )));
        }
        if !self.tau.is_finite() || self.tau <= 0.0 || self.tau > 1.0 {
            return Err(QuantlabError::configuration(format!(
                "tau must be in (0, 1], got {}",
                self.tau
            )));
        }
        if !self.risk_free_rate.is_finite() {
            return Err(QuantlabError::configuration(format!(
                "risk_free_rate must be finite, got {}",
                self.risk_free_rate
            )));
        }
        if self.frontier_points == 1 {
            return Err(QuantlabError::configuration(
                "frontier_points must be 0 or at least 2",
            ));
        }
        self.constraints.validate()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverBranch {
    Primary,
    Fallback,
}

impl fmt::Display for SolverBranch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolverBranch::Primary => write!(f, "primary"),
            SolverBranch::Fallback => write!(f, "min-volatility"),
        }
    }
}

/// Why the minimum-volatility fallback was used.
#[derive(Debug, Clone, PartialEq)]
pub enum FallbackReason {
    NoViews,
    PrimaryFailed(String),
    DegeneratePosterior(String),
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackReason::NoViews => write!(f, "no views applied"),
            FallbackReason::PrimaryFailed(reason) => write!(f, "primary solve failed: {reason}"),
            FallbackReason::DegeneratePosterior(reason) => {
                write!(f, "degenerate posterior: {reason}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptimizationMetadata {
    pub branch: SolverBranch,
    pub fallback_reason: Option<FallbackReason>,
    pub views_applied: Vec<String>,
    pub views_skipped: Vec<String>,
    pub risk_aversion: f64,
    pub tau: f64,
    pub omissions: Vec<AssetOmission>,
    pub market_weight_source: MarketWeightSource,
    pub shrinkage: f64,
    /// Expected annual return of the final weights under `expected_returns`.
    pub expected_return: f64,
    /// Annualized volatility of the final weights under the covariance the
    /// solver used.
    pub volatility: f64,
    /// False when the solve behind `weights` stopped at the iteration limit.
    pub converged: bool,
    pub iterations: usize,
    pub risk_free_rate: f64,
}

/// A portfolio with its moments under the optimizer's returns and covariance.
#[derive(Debug, Clone, PartialEq)]
pub struct PortfolioPoint {
    pub weights: WeightVector,
    pub expected_return: f64,
    pub volatility: f64,
    pub sharpe_ratio: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptimizationOutcome {
    pub weights: WeightVector,
    /// Posterior (or, without views, equilibrium) expected returns.
    pub expected_returns: ReturnVector,
    pub metadata: OptimizationMetadata,
    /// None when no asset is expected to beat the risk-free rate.
    pub max_sharpe: Option<PortfolioPoint>,
    /// Empty when `frontier_points` is 0 or the frontier could not be traced.
    pub frontier: Vec<FrontierPoint>,
}

pub fn optimize(
    prices: &PriceTable,
    views: &[View],
    market_caps: Option<&BTreeMap<String, f64>>,
    config: &OptimizerConfig,
) -> Result<OptimizationOutcome, QuantlabError> {
    config.validate()?;

    let est = estimate(prices, &config.estimator)?;
    let prior_cov = est.covariance;
    let market = MarketWeights::resolve(prior_cov.symbols(), market_caps)?;
    if market.source() == MarketWeightSource::EqualWeight {
        warn!("no market weights supplied, equilibrium uses equal weights");
    }
    let equilibrium = implied_returns(&prior_cov, &market, config.risk_aversion)?;

    let mut views_applied = Vec::new();
    let mut views_skipped = Vec::new();

    let (expected_returns, covariance, fallback_reason) =
        match blend(&equilibrium, &prior_cov, views, config.tau) {
            Ok(posterior) => {
                views_applied = posterior.applied;
                views_skipped = posterior.skipped;
                if views_applied.is_empty() {
                    (posterior.returns, posterior.covariance, Some(FallbackReason::NoViews))
                } else if !is_positive_definite(posterior.covariance.matrix()) {
                    (
                        posterior.returns,
                        prior_cov.clone(),
                        Some(FallbackReason::DegeneratePosterior(
                            "posterior covariance is not positive-definite".into(),
                        )),
                    )
                } else {
                    (posterior.returns, posterior.covariance, None)
                }
            }
            Err(e @ QuantlabError::Optimization { .. }) => (
                equilibrium.clone(),
                prior_cov.clone(),
                Some(FallbackReason::DegeneratePosterior(e.to_string())),
            ),
            Err(e) => return Err(e),
        };

    let (solution, branch, fallback_reason) = match fallback_reason {
        Some(reason) => {
            let solution = solve_min_volatility(&covariance, &config.constraints)?;
            (solution, SolverBranch::Fallback, Some(reason))
        }
        None => match solve(
            &expected_returns,
            &covariance,
            &config.constraints,
            config.risk_aversion,
        ) {
            Ok(solution) => (solution, SolverBranch::Primary, None),
            Err(e @ (QuantlabError::Infeasible { .. } | QuantlabError::Optimization { .. })) => {
                warn!(error = %e, "primary solve failed, using min-volatility fallback");
                let solution = solve_min_volatility(&covariance, &config.constraints)?;
                (
                    solution,
                    SolverBranch::Fallback,
                    Some(FallbackReason::PrimaryFailed(e.to_string())),
                )
            }
            Err(e) => return Err(e),
        },
    };

    let Solution {
        weights,
        converged,
        iterations,
    } = solution;
    if !converged {
        warn!(iterations, "final weights come from an unconverged solve");
    }
    let (expected_return, volatility) = portfolio_moments(&weights, &expected_returns, &covariance);
    let max_sharpe = max_sharpe_point(&expected_returns, &covariance, config);
    let frontier = if config.frontier_points == 0 {
        Vec::new()
    } else {
        efficient_frontier(
            &expected_returns,
            &covariance,
            &config.constraints,
            config.frontier_points,
        )
        .unwrap_or_else(|e| {
            warn!(error = %e, "efficient frontier unavailable");
            Vec::new()
        })
    };
    info!(
        branch = %branch,
        assets = weights.len(),
        views = views_applied.len(),
        "portfolio optimized"
    );

    Ok(OptimizationOutcome {
        weights,
        expected_returns,
        metadata: OptimizationMetadata {
            branch,
            fallback_reason,
            views_applied,
            views_skipped,
            risk_aversion: config.risk_aversion,
            tau: config.tau,
            omissions: est.omissions,
            market_weight_source: market.source(),
            shrinkage: prior_cov.shrinkage(),
            expected_return,
            volatility,
            converged,
            iterations,
            risk_free_rate: config.risk_free_rate,
        },
        max_sharpe,
        frontier,
    })
}

fn max_sharpe_point(
    returns: &ReturnVector,
    covariance: &CovarianceMatrix,
    config: &OptimizerConfig,
) -> Option<PortfolioPoint> {
    let solution =
        match solve_max_sharpe(returns, covariance, &config.constraints, config.risk_free_rate) {
            Ok(solution) => solution,
            Err(e) => {
                warn!(error = %e, "max-sharpe portfolio unavailable");
                return None;
            }
        };
    let (expected_return, volatility) = portfolio_moments(&solution.weights, returns, covariance);
    let sharpe_ratio = if volatility > 0.0 {
        (expected_return - config.risk_free_rate) / volatility
    } else {
        0.0
    };
    Some(PortfolioPoint {
        weights: solution.weights,
        expected_return,
        volatility,
        sharpe_ratio,
    })
}

fn portfolio_moments(
    weights: &WeightVector,
    returns: &ReturnVector,
    covariance: &CovarianceMatrix,
) -> (f64, f64) {
    let w = nalgebra::DVector::from_iterator(
        covariance.len(),
        covariance
            .symbols()
            .iter()
            .map(|s| weights.get(s).unwrap_or(0.0)),
    );
    let mean = w.dot(&returns.values);
    let variance = (covariance.matrix() * &w).dot(&w);
    (mean, variance.max(0.0).sqrt())
}
