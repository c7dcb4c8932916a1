//! Summary statistics over a backtest result.

use super::backtest::{BacktestResult, EquityPoint};

const PERIODS_PER_YEAR: f64 = 252.0;

#[derive(Debug, Clone, PartialEq)]
pub struct BacktestMetrics {
    pub total_return: f64,
    pub annualized_return: f64,
    pub annualized_volatility: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub max_drawdown: f64,
    /// Longest stretch of periods spent below a previous peak.
    pub max_drawdown_duration: usize,
    /// Share of non-flat periods with a positive return.
    pub win_rate: f64,
    pub average_turnover: f64,
    pub max_turnover: f64,
    pub rebalances: usize,
    pub forced_rebalances: usize,
    pub benchmark_return: Option<f64>,
}

impl BacktestMetrics {
    pub fn compute(result: &BacktestResult, risk_free_rate: f64) -> Self {
        let initial_capital = result.initial_capital;
        let final_equity = result.final_equity();

        let total_return = if initial_capital > 0.0 {
            (final_equity - initial_capital) / initial_capital
        } else {
            0.0
        };

        let years = result.period_returns.len() as f64 / PERIODS_PER_YEAR;
        let annualized_return = if years > 0.0 && total_return > -1.0 {
            (1.0 + total_return).powf(1.0 / years) - 1.0
        } else {
            0.0
        };

        let (max_drawdown, max_drawdown_duration) = compute_drawdown(&result.equity_curve);

        let per_period_rf = risk_free_rate / PERIODS_PER_YEAR;
        let (annualized_volatility, sharpe_ratio, sortino_ratio) =
            compute_risk_adjusted(&result.period_returns, per_period_rf);

        let moving = result.period_returns.iter().filter(|&&r| r != 0.0).count();
        let wins = result.period_returns.iter().filter(|&&r| r > 0.0).count();
        let win_rate = if moving > 0 {
            wins as f64 / moving as f64
        } else {
            0.0
        };

        // Forced rebalances trade nothing, so they stay out of the averages.
        let executed: Vec<f64> = result
            .rebalances
            .iter()
            .filter(|r| !r.forced)
            .map(|r| r.turnover)
            .collect();
        let average_turnover = if executed.is_empty() {
            0.0
        } else {
            executed.iter().sum::<f64>() / executed.len() as f64
        };
        let max_turnover = executed.iter().copied().fold(0.0_f64, f64::max);

        let benchmark_return = match (result.benchmark_curve.first(), result.benchmark_curve.last()) {
            (Some(first), Some(last)) if first.equity > 0.0 => Some(last.equity / first.equity - 1.0),
            _ => None,
        };

        BacktestMetrics {
            total_return,
            annualized_return,
            annualized_volatility,
            sharpe_ratio,
            sortino_ratio,
            max_drawdown,
            max_drawdown_duration,
            win_rate,
            average_turnover,
            max_turnover,
            rebalances: result.rebalances.len(),
            forced_rebalances: result.rebalances.iter().filter(|r| r.forced).count(),
            benchmark_return,
        }
    }
}

fn compute_drawdown(equity_curve: &[EquityPoint]) -> (f64, usize) {
    if equity_curve.is_empty() {
        return (0.0, 0);
    }

    let mut peak = equity_curve[0].equity;
    let mut max_dd = 0.0_f64;
    let mut max_dd_duration = 0usize;
    let mut current_dd_duration = 0usize;

    for point in equity_curve {
        if point.equity >= peak {
            peak = point.equity;
            current_dd_duration = 0;
        } else if peak > 0.0 {
            let dd = (peak - point.equity) / peak;
            max_dd = max_dd.max(dd);
            current_dd_duration += 1;
            max_dd_duration = max_dd_duration.max(current_dd_duration);
        }
    }

    (max_dd, max_dd_duration)
}

/// (annualized volatility, Sharpe, Sortino) from per-period returns.
fn compute_risk_adjusted(returns: &[f64], per_period_rf: f64) -> (f64, f64, f64) {
    if returns.len() < 2 {
        return (0.0, 0.0, 0.0);
    }

    let n = returns.len() as f64;
    let mean: f64 = returns.iter().sum::<f64>() / n;
    let variance: f64 = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let stddev = variance.sqrt();
    let annualized_volatility = stddev * PERIODS_PER_YEAR.sqrt();

    let excess_return = mean - per_period_rf;
    let sharpe = if stddev > 0.0 {
        (excess_return / stddev) * PERIODS_PER_YEAR.sqrt()
    } else {
        0.0
    };

    let downside: f64 = returns
        .iter()
        .filter(|&&r| r < per_period_rf)
        .map(|&r| (r - per_period_rf).powi(2))
        .sum();
    let downside_stddev = (downside / n).sqrt();
    let sortino = if downside_stddev > 0.0 {
        (excess_return / downside_stddev) * PERIODS_PER_YEAR.sqrt()
    } else {
        0.0
    };

    (annualized_volatility, sharpe, sortino)
}
