//! Constrained mean-variance weight solver.
//!
//! Both problems are convex quadratics over the capped simplex
//! {Σw = 1, l ≤ w ≤ u}:
//!
//! - primary: maximize w·μ − λ·wᵀΣw
//! - min-volatility: minimize wᵀΣw
//!
//! They are solved with accelerated projected gradient (FISTA) using an
//! exact Euclidean projection onto the feasible set. Without any bounds the
//! KKT system is solved in closed form instead.
//!
//! The max-Sharpe portfolio and the efficient frontier reuse the same
//! solver through the family w(ν) = argmin wᵀΣw − ν·w·μ, ν ≥ 0, which walks
//! the efficient frontier from the minimum-volatility point (ν = 0) toward
//! the highest attainable return.

use crate::domain::equilibrium::ReturnVector;
use crate::domain::error::QuantlabError;
use crate::domain::estimator::CovarianceMatrix;
use crate::domain::linalg::{checked_inverse, symmetric_eigenvalues};
use nalgebra::{DMatrix, DVector};
use std::collections::BTreeMap;
use tracing::{debug, warn};

pub const MAX_ITERATIONS: usize = 20_000;
const TOLERANCE: f64 = 1e-12;
const BISECTION_STEPS: usize = 200;
/// Golden-section steps over the frontier parameter for max-Sharpe.
const GOLDEN_STEPS: usize = 80;
/// Upper end of the compactified frontier parameter s = ν / (scale + ν).
const MAX_FRONTIER_PARAM: f64 = 1.0 - 1e-6;
/// Doublings of ν allowed while bracketing a frontier target.
const MAX_EXPANSIONS: usize = 60;
const FRONTIER_BISECTION_STEPS: usize = 50;
/// Allowed shortfall of a frontier point below its target return.
const TARGET_TOLERANCE: f64 = 1e-6;
/// Allowed deviation of Σw from one in a finished weight vector.
pub const SUM_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Constraints {
    pub long_only: bool,
    /// Per-asset upper bound on the weight.
    pub max_weight: Option<f64>,
}

impl Default for Constraints {
    fn default() -> Self {
        Constraints {
            long_only: true,
            max_weight: None,
        }
    }
}

impl Constraints {
    pub fn validate(&self) -> Result<(), QuantlabError> {
        if let Some(cap) = self.max_weight {
            if !cap.is_finite() || cap <= 0.0 {
                return Err(QuantlabError::configuration(format!(
                    "max_weight must be positive and finite, got {cap}"
                )));
            }
        }
        Ok(())
    }

    fn lower(&self) -> f64 {
        if self.long_only { 0.0 } else { f64::NEG_INFINITY }
    }

    fn upper(&self) -> f64 {
        self.max_weight.unwrap_or(f64::INFINITY)
    }

    /// Σl ≤ 1 ≤ Σu for `n` assets.
    pub fn check_feasible(&self, n: usize) -> Result<(), QuantlabError> {
        self.validate()?;
        if n == 0 {
            return Err(QuantlabError::infeasible("no assets to allocate"));
        }
        let nf = n as f64;
        if self.lower() * nf > 1.0 {
            return Err(QuantlabError::infeasible(
                "lower bounds sum to more than one",
            ));
        }
        if self.upper() * nf < 1.0 {
            return Err(QuantlabError::infeasible(format!(
                "max_weight {} across {} assets cannot reach a fully invested portfolio",
                self.upper(),
                n
            )));
        }
        Ok(())
    }
}

/// Final portfolio weights, keyed by symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightVector {
    weights: BTreeMap<String, f64>,
}

impl WeightVector {
    pub fn new(symbols: &[String], values: &DVector<f64>) -> Result<Self, QuantlabError> {
        if symbols.len() != values.len() {
            return Err(QuantlabError::Optimization {
                matrix: "weights".into(),
                reason: format!("{} symbols for {} weights", symbols.len(), values.len()),
                condition: f64::NAN,
            });
        }
        if values.iter().any(|w| !w.is_finite()) {
            return Err(QuantlabError::Optimization {
                matrix: "weights".into(),
                reason: "non-finite weight".into(),
                condition: f64::NAN,
            });
        }
        let sum = values.sum();
        if (sum - 1.0).abs() > SUM_TOLERANCE {
            return Err(QuantlabError::Optimization {
                matrix: "weights".into(),
                reason: format!("weights sum to {sum}, not 1"),
                condition: f64::NAN,
            });
        }
        Ok(WeightVector {
            weights: symbols.iter().cloned().zip(values.iter().copied()).collect(),
        })
    }

    pub fn get(&self, symbol: &str) -> Option<f64> {
        self.weights.get(symbol).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.weights.iter().map(|(s, w)| (s.as_str(), *w))
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn sum(&self) -> f64 {
        self.weights.values().sum()
    }

    pub fn as_map(&self) -> &BTreeMap<String, f64> {
        &self.weights
    }
}

/// Weights from one solve, with the iteration outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    pub weights: WeightVector,
    /// False when the iterative solver stopped at [`MAX_ITERATIONS`].
    pub converged: bool,
    pub iterations: usize,
}

/// One point of the efficient frontier.
#[derive(Debug, Clone, PartialEq)]
pub struct FrontierPoint {
    pub target_return: f64,
    pub expected_return: f64,
    pub volatility: f64,
}

struct Iterate {
    x: DVector<f64>,
    converged: bool,
    iterations: usize,
}

impl Iterate {
    fn into_solution(self, symbols: &[String]) -> Result<Solution, QuantlabError> {
        Ok(Solution {
            weights: WeightVector::new(symbols, &self.x)?,
            converged: self.converged,
            iterations: self.iterations,
        })
    }
}

fn check_inputs(returns: &ReturnVector, covariance: &CovarianceMatrix) -> Result<(), QuantlabError> {
    if returns.symbols != covariance.symbols() {
        return Err(QuantlabError::configuration(
            "expected returns and covariance cover different assets",
        ));
    }
    if returns.values.iter().any(|v| !v.is_finite()) {
        return Err(QuantlabError::Optimization {
            matrix: "expected returns".into(),
            reason: "non-finite expected return".into(),
            condition: f64::NAN,
        });
    }
    Ok(())
}

/// Primary mean-variance solve with λ = δ/2.
pub fn solve(
    returns: &ReturnVector,
    covariance: &CovarianceMatrix,
    constraints: &Constraints,
    risk_aversion: f64,
) -> Result<Solution, QuantlabError> {
    if !risk_aversion.is_finite() || risk_aversion <= 0.0 {
        return Err(QuantlabError::configuration(format!(
            "risk_aversion must be positive, got {risk_aversion}"
        )));
    }
    check_inputs(returns, covariance)?;
    let lambda = risk_aversion / 2.0;
    let hessian = covariance.matrix() * (2.0 * lambda);
    minimize_quadratic(&hessian, &returns.values, constraints, "mean-variance")?
        .into_solution(covariance.symbols())
}

/// Minimum-volatility fallback.
pub fn solve_min_volatility(
    covariance: &CovarianceMatrix,
    constraints: &Constraints,
) -> Result<Solution, QuantlabError> {
    let hessian = covariance.matrix() * 2.0;
    let linear = DVector::zeros(covariance.len());
    minimize_quadratic(&hessian, &linear, constraints, "min-volatility")?
        .into_solution(covariance.symbols())
}

fn moments(x: &DVector<f64>, mu: &DVector<f64>, sigma: &DMatrix<f64>) -> (f64, f64) {
    let variance = (sigma * x).dot(x);
    (x.dot(mu), variance.max(0.0).sqrt())
}

/// Scale for ν that makes the linear term comparable to the curvature.
fn frontier_scale(hessian: &DMatrix<f64>, mu: &DVector<f64>) -> f64 {
    let curvature = symmetric_eigenvalues(hessian).last().copied().unwrap_or(1.0);
    let reach = mu.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
    if curvature > 0.0 && reach > 0.0 {
        curvature / reach
    } else {
        1.0
    }
}

/// Portfolio maximizing (w·μ − r_f) / √(wᵀΣw) under the constraints.
///
/// The Sharpe ratio is unimodal along the efficient frontier, so a
/// golden-section search over the frontier parameter finds its peak. At
/// least one asset must beat the risk-free rate.
pub fn solve_max_sharpe(
    returns: &ReturnVector,
    covariance: &CovarianceMatrix,
    constraints: &Constraints,
    risk_free_rate: f64,
) -> Result<Solution, QuantlabError> {
    if !risk_free_rate.is_finite() {
        return Err(QuantlabError::configuration(format!(
            "risk_free_rate must be finite, got {risk_free_rate}"
        )));
    }
    check_inputs(returns, covariance)?;
    constraints.check_feasible(covariance.len())?;
    if returns.values.iter().all(|&m| m <= risk_free_rate) {
        return Err(QuantlabError::Optimization {
            matrix: "expected returns".into(),
            reason: format!("no asset is expected to beat the risk-free rate {risk_free_rate}"),
            condition: f64::NAN,
        });
    }

    let sigma = covariance.matrix();
    let mu = &returns.values;
    let hessian = sigma * 2.0;
    let scale = frontier_scale(&hessian, mu);

    let evaluate = |s: f64| -> Result<(f64, Iterate), QuantlabError> {
        let nu = scale * s / (1.0 - s);
        let it = minimize_quadratic(&hessian, &(mu * nu), constraints, "max-sharpe")?;
        let (ret, vol) = moments(&it.x, mu, sigma);
        let sharpe = if vol > 0.0 {
            (ret - risk_free_rate) / vol
        } else if ret > risk_free_rate {
            f64::INFINITY
        } else {
            f64::NEG_INFINITY
        };
        Ok((sharpe, it))
    };

    let ratio = (5.0_f64.sqrt() - 1.0) / 2.0;
    let (mut a, mut b) = (0.0, MAX_FRONTIER_PARAM);
    let mut c = b - ratio * (b - a);
    let mut d = a + ratio * (b - a);
    let mut fc = evaluate(c)?;
    let mut fd = evaluate(d)?;

    let mut best = evaluate(a)?;
    let top = evaluate(b)?;
    if top.0 > best.0 {
        best = top;
    }

    for _ in 0..GOLDEN_STEPS {
        if fc.0 >= fd.0 {
            b = d;
            d = c;
            c = b - ratio * (b - a);
            let next = evaluate(c)?;
            fd = std::mem::replace(&mut fc, next);
        } else {
            a = c;
            c = d;
            d = a + ratio * (b - a);
            let next = evaluate(d)?;
            fc = std::mem::replace(&mut fd, next);
        }
    }

    for candidate in [fc, fd] {
        if candidate.0 > best.0 {
            best = candidate;
        }
    }
    debug!(sharpe = best.0, "max-sharpe portfolio found");
    best.1.into_solution(covariance.symbols())
}

/// Highest return reachable without shorting: fill the best assets up to
/// the cap.
fn highest_return(mu: &DVector<f64>, upper: f64) -> f64 {
    let mut ranked: Vec<f64> = mu.iter().copied().collect();
    ranked.sort_by(|a, b| b.total_cmp(a));
    let mut remaining = 1.0_f64;
    let mut total = 0.0;
    for m in ranked {
        if remaining <= 0.0 {
            break;
        }
        let take = remaining.min(upper);
        total += take * m;
        remaining -= take;
    }
    total
}

/// Minimum-volatility portfolios at `points` evenly spaced target returns,
/// from the minimum-volatility portfolio's return up to the highest return
/// reachable without shorting.
///
/// Each target is met by bisection on ν. Targets the constraints cannot
/// reach are left out.
pub fn efficient_frontier(
    returns: &ReturnVector,
    covariance: &CovarianceMatrix,
    constraints: &Constraints,
    points: usize,
) -> Result<Vec<FrontierPoint>, QuantlabError> {
    if points < 2 {
        return Err(QuantlabError::configuration(format!(
            "an efficient frontier needs at least 2 points, got {points}"
        )));
    }
    check_inputs(returns, covariance)?;

    let sigma = covariance.matrix();
    let mu = &returns.values;
    let hessian = sigma * 2.0;
    let scale = frontier_scale(&hessian, mu);
    let solve_at = |nu: f64| minimize_quadratic(&hessian, &(mu * nu), constraints, "frontier");

    let min_vol = solve_at(0.0)?;
    let (low, low_vol) = moments(&min_vol.x, mu, sigma);
    let high = highest_return(mu, constraints.upper());
    if high <= low + TARGET_TOLERANCE {
        return Ok(vec![FrontierPoint {
            target_return: low,
            expected_return: low,
            volatility: low_vol,
        }]);
    }

    let mut frontier = Vec::with_capacity(points);
    frontier.push(FrontierPoint {
        target_return: low,
        expected_return: low,
        volatility: low_vol,
    });
    let step = (high - low) / (points - 1) as f64;
    for k in 1..points {
        let target = low + step * k as f64;
        let tolerance = TARGET_TOLERANCE * (1.0 + target.abs());

        let mut hi = scale;
        let mut best = solve_at(hi)?;
        let mut expansions = 0;
        while best.x.dot(mu) < target - tolerance && expansions < MAX_EXPANSIONS {
            hi *= 2.0;
            best = solve_at(hi)?;
            expansions += 1;
        }
        if best.x.dot(mu) < target - tolerance {
            debug!(target, "frontier target out of reach");
            continue;
        }

        let mut lo = 0.0;
        for _ in 0..FRONTIER_BISECTION_STEPS {
            let mid = 0.5 * (lo + hi);
            let it = solve_at(mid)?;
            if it.x.dot(mu) >= target {
                hi = mid;
                best = it;
            } else {
                lo = mid;
            }
        }

        let (expected_return, volatility) = moments(&best.x, mu, sigma);
        frontier.push(FrontierPoint {
            target_return: target,
            expected_return,
            volatility,
        });
    }
    debug!(points = frontier.len(), "efficient frontier traced");
    Ok(frontier)
}

/// Minimize ½wᵀHw − cᵀw over the constraint set.
fn minimize_quadratic(
    hessian: &DMatrix<f64>,
    linear: &DVector<f64>,
    constraints: &Constraints,
    label: &str,
) -> Result<Iterate, QuantlabError> {
    let n = linear.len();
    constraints.check_feasible(n)?;
    let lower = constraints.lower();
    let upper = constraints.upper();

    if lower.is_infinite() && upper.is_infinite() {
        return Ok(Iterate {
            x: closed_form(hessian, linear, label)?,
            converged: true,
            iterations: 0,
        });
    }

    let eigenvalues = symmetric_eigenvalues(hessian);
    let lipschitz = eigenvalues.last().copied().unwrap_or(0.0);
    if !lipschitz.is_finite() || lipschitz <= 0.0 {
        return Err(QuantlabError::Optimization {
            matrix: format!("{label} hessian"),
            reason: "largest eigenvalue is not positive".into(),
            condition: f64::NAN,
        });
    }
    if eigenvalues[0] < -1e-10 * lipschitz {
        return Err(QuantlabError::Optimization {
            matrix: format!("{label} hessian"),
            reason: "covariance is not positive semi-definite".into(),
            condition: f64::NAN,
        });
    }
    let step = 1.0 / lipschitz;

    let mut x = project(&DVector::from_element(n, 1.0 / n as f64), lower, upper);
    let mut y = x.clone();
    let mut t = 1.0_f64;
    let mut converged = false;
    let mut iterations = 0;

    for iter in 0..MAX_ITERATIONS {
        iterations = iter + 1;
        let grad = hessian * &y - linear;
        let x_next = project(&(&y - &grad * step), lower, upper);
        let delta = &x_next - &x;

        // Restart momentum when it points uphill.
        if (&y - &x_next).dot(&delta) > 0.0 {
            t = 1.0;
            y = x_next.clone();
        } else {
            let t_next = (1.0 + (1.0 + 4.0 * t * t).sqrt()) / 2.0;
            y = &x_next + &delta * ((t - 1.0) / t_next);
            t = t_next;
        }

        let moved = delta.norm();
        x = x_next;
        if moved <= TOLERANCE * (1.0 + x.norm()) {
            converged = true;
            break;
        }
    }

    if converged {
        debug!(solver = label, iterations, "weights converged");
    } else {
        warn!(solver = label, iterations, "weight solver hit the iteration limit");
    }
    Ok(Iterate {
        x,
        converged,
        iterations,
    })
}

/// Equality-constrained optimum: w = H⁻¹(c − ν1) with ν chosen so Σw = 1.
fn closed_form(
    hessian: &DMatrix<f64>,
    linear: &DVector<f64>,
    label: &str,
) -> Result<DVector<f64>, QuantlabError> {
    let n = linear.len();
    let inv = checked_inverse(hessian, &format!("{label} hessian"))?;
    let ones = DVector::from_element(n, 1.0);
    let inv_c = &inv * linear;
    let inv_1 = &inv * &ones;
    let denom = ones.dot(&inv_1);
    if !denom.is_finite() || denom.abs() < f64::EPSILON {
        return Err(QuantlabError::Optimization {
            matrix: format!("{label} hessian"),
            reason: "budget constraint is degenerate".into(),
            condition: f64::NAN,
        });
    }
    let nu = (ones.dot(&inv_c) - 1.0) / denom;
    Ok(inv_c - inv_1 * nu)
}

/// Euclidean projection of `v` onto {Σw = 1, lower ≤ w ≤ upper}.
///
/// The projection is clip(v − θ) for the unique shift θ making the sum one;
/// θ is found by bisection since the clipped sum is monotone in θ.
fn project(v: &DVector<f64>, lower: f64, upper: f64) -> DVector<f64> {
    let clipped_sum = |theta: f64| -> f64 { v.iter().map(|x| (x - theta).clamp(lower, upper)).sum() };

    let mut lo = v.min() - 1.0;
    let mut hi = v.max() + 1.0;
    let mut width = 1.0;
    for _ in 0..BISECTION_STEPS {
        if clipped_sum(lo) >= 1.0 {
            break;
        }
        width *= 2.0;
        lo -= width;
    }
    width = 1.0;
    for _ in 0..BISECTION_STEPS {
        if clipped_sum(hi) <= 1.0 {
            break;
        }
        width *= 2.0;
        hi += width;
    }

    for _ in 0..BISECTION_STEPS {
        let mid = 0.5 * (lo + hi);
        if mid <= lo || mid >= hi {
            break;
        }
        if clipped_sum(mid) > 1.0 {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    let theta = 0.5 * (lo + hi);
    v.map(|x| (x - theta).clamp(lower, upper))
}
