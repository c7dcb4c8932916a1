//! Momentum backtest engine.
//!
//! The simulation is a state machine (Initialized → Running → Finalized).
//! Each call to [`BacktestState::advance`] consumes the state and one row of
//! the aligned price grid and returns the next state plus a
//! [`PeriodRecord`]. Within a period, held positions first accrue that
//! period's return, then the book is rebalanced if the period is on the
//! schedule.

use crate::domain::error::QuantlabError;
use crate::domain::momentum::{equal_weights, momentum_scores, rank, select_top, turnover};
use crate::domain::price_table::{AlignedPrices, AlignmentRule, PriceTable};
use chrono::NaiveDate;
use std::collections::BTreeMap;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShortfallPolicy {
    /// Hold however many assets are eligible, up to `top_n`.
    #[default]
    HoldFewer,
    /// Refuse to start when the tradable universe is smaller than `top_n`.
    Reject,
}

impl ShortfallPolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "hold_fewer" => Some(ShortfallPolicy::HoldFewer),
            "reject" => Some(ShortfallPolicy::Reject),
            _ => None,
        }
    }
}

/// Benchmark used for the market trend filter and the buy-and-hold
/// comparison curve.
#[derive(Debug, Clone, PartialEq)]
pub struct Benchmark {
    pub symbol: String,
    /// Moving-average length for the trend filter. `None` disables the
    /// filter and keeps only the comparison curve.
    pub trend_window: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BacktestConfig {
    pub lookback: usize,
    pub skip: usize,
    pub top_n: usize,
    pub rebalance_frequency: usize,
    pub initial_capital: f64,
    /// Proportional cost charged on turnover at each rebalance.
    pub cost_rate: f64,
    pub benchmark: Option<Benchmark>,
    pub shortfall: ShortfallPolicy,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        BacktestConfig {
            lookback: 252,
            skip: 21,
            top_n: 5,
            rebalance_frequency: 21,
            initial_capital: 100_000.0,
            cost_rate: 0.0,
            benchmark: None,
            shortfall: ShortfallPolicy::HoldFewer,
        }
    }
}

impl BacktestConfig {
    pub fn validate(&self) -> Result<(), QuantlabError> {
        if self.lookback == 0 {
            return Err(QuantlabError::configuration("lookback must be positive"));
        }
        if self.skip >= self.lookback {
            return Err(QuantlabError::configuration(format!(
                "skip ({}) must be smaller than lookback ({})",
                self.skip, self.lookback
            )));
        }
        if self.top_n == 0 {
            return Err(QuantlabError::configuration("top_n must be positive"));
        }
        if self.rebalance_frequency == 0 {
            return Err(QuantlabError::configuration(
                "rebalance_frequency must be positive",
            ));
        }
        if !self.initial_capital.is_finite() || self.initial_capital <= 0.0 {
            return Err(QuantlabError::configuration(
                "initial_capital must be positive",
            ));
        }
        if !self.cost_rate.is_finite() || !(0.0..1.0).contains(&self.cost_rate) {
            return Err(QuantlabError::configuration(format!(
                "cost_rate must be in [0, 1), got {}",
                self.cost_rate
            )));
        }
        if let Some(Benchmark {
            trend_window: Some(0),
            ..
        }) = self.benchmark
        {
            return Err(QuantlabError::configuration("trend_window must be positive"));
        }
        Ok(())
    }

    fn is_rebalance(&self, t: usize) -> bool {
        t % self.rebalance_frequency == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EquityPoint {
    pub date: NaiveDate,
    pub equity: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RebalanceRecord {
    pub date: NaiveDate,
    pub index: usize,
    /// Symbols held after the rebalance.
    pub holdings: Vec<String>,
    pub turnover: f64,
    /// No asset was eligible; the previous book was kept.
    pub forced: bool,
    /// The trend filter moved the book to cash.
    pub in_cash: bool,
    pub cost: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeriodRecord {
    pub index: usize,
    pub date: NaiveDate,
    pub equity: f64,
    /// Return over the period; `None` for the first period.
    pub period_return: Option<f64>,
    pub rebalance: Option<RebalanceRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BacktestResult {
    pub initial_capital: f64,
    pub equity_curve: Vec<EquityPoint>,
    pub period_returns: Vec<f64>,
    pub rebalances: Vec<RebalanceRecord>,
    /// Buy-and-hold benchmark equity, from its first available price.
    pub benchmark_curve: Vec<EquityPoint>,
}

impl BacktestResult {
    pub fn final_equity(&self) -> f64 {
        self.equity_curve
            .last()
            .map(|p| p.equity)
            .unwrap_or(self.initial_capital)
    }

    pub fn turnovers(&self) -> Vec<f64> {
        self.rebalances.iter().map(|r| r.turnover).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initialized,
    Running,
    Finalized,
}

#[derive(Debug, Clone, PartialEq)]
struct BenchmarkTrack {
    column: usize,
    units: Option<f64>,
    last_value: Option<f64>,
    curve: Vec<EquityPoint>,
}

/// Single-owner simulation state.
#[derive(Debug, Clone, PartialEq)]
pub struct BacktestState {
    phase: Phase,
    cursor: usize,
    universe: Vec<usize>,
    cash: f64,
    /// Current market value per held symbol (drifts between rebalances).
    positions: BTreeMap<String, f64>,
    /// Target weights set at the last executed rebalance.
    target: BTreeMap<String, f64>,
    equity_curve: Vec<EquityPoint>,
    period_returns: Vec<f64>,
    rebalances: Vec<RebalanceRecord>,
    benchmark: Option<BenchmarkTrack>,
    initial_capital: f64,
}

impl BacktestState {
    pub fn new(config: &BacktestConfig, prices: &AlignedPrices) -> Result<Self, QuantlabError> {
        config.validate()?;
        if prices.is_empty() {
            return Err(QuantlabError::data_quality("no price history to backtest"));
        }

        let benchmark = match &config.benchmark {
            Some(b) => {
                let column = prices.symbol_index(&b.symbol).ok_or_else(|| {
                    QuantlabError::configuration(format!(
                        "benchmark {} is not in the price table",
                        b.symbol
                    ))
                })?;
                Some(BenchmarkTrack {
                    column,
                    units: None,
                    last_value: None,
                    curve: Vec::new(),
                })
            }
            None => None,
        };
        let benchmark_column = benchmark.as_ref().map(|b| b.column);
        let universe: Vec<usize> = (0..prices.symbols().len())
            .filter(|&j| Some(j) != benchmark_column)
            .collect();

        if universe.is_empty() {
            return Err(QuantlabError::data_quality("no tradable assets"));
        }
        if config.shortfall == ShortfallPolicy::Reject && config.top_n > universe.len() {
            return Err(QuantlabError::configuration(format!(
                "top_n ({}) exceeds the tradable universe ({})",
                config.top_n,
                universe.len()
            )));
        }

        Ok(BacktestState {
            phase: Phase::Initialized,
            cursor: 0,
            universe,
            cash: config.initial_capital,
            positions: BTreeMap::new(),
            target: BTreeMap::new(),
            equity_curve: Vec::with_capacity(prices.len()),
            period_returns: Vec::with_capacity(prices.len().saturating_sub(1)),
            rebalances: Vec::new(),
            benchmark,
            initial_capital: config.initial_capital,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Index of the next period to process.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn equity(&self) -> f64 {
        self.cash + self.positions.values().sum::<f64>()
    }

    pub fn holdings(&self) -> Vec<String> {
        self.positions.keys().cloned().collect()
    }

    /// Process period `cursor`: accrue, then rebalance if scheduled.
    pub fn advance(
        mut self,
        prices: &AlignedPrices,
        config: &BacktestConfig,
    ) -> Result<(Self, PeriodRecord), QuantlabError> {
        if self.phase == Phase::Finalized || self.cursor >= prices.len() {
            return Err(QuantlabError::configuration(
                "backtest has no periods left to process",
            ));
        }
        let t = self.cursor;
        let date = prices.dates()[t];

        if t > 0 {
            self.accrue(prices, t);
        }
        self.track_benchmark(prices, t, date);

        let rebalance = if config.is_rebalance(t) {
            Some(self.rebalance(prices, config, t, date))
        } else {
            None
        };

        // Rebalance costs belong to the period they are paid in.
        let equity = self.equity();
        let period_return = self.equity_curve.last().map(|previous| {
            if previous.equity > 0.0 {
                equity / previous.equity - 1.0
            } else {
                0.0
            }
        });
        if let Some(r) = period_return {
            self.period_returns.push(r);
        }
        self.equity_curve.push(EquityPoint { date, equity });
        if let Some(record) = &rebalance {
            self.rebalances.push(record.clone());
        }

        self.cursor += 1;
        self.phase = if self.cursor >= prices.len() {
            Phase::Finalized
        } else {
            Phase::Running
        };

        Ok((
            self,
            PeriodRecord {
                index: t,
                date,
                equity,
                period_return,
                rebalance,
            },
        ))
    }

    pub fn finalize(self) -> Result<BacktestResult, QuantlabError> {
        if self.phase != Phase::Finalized {
            return Err(QuantlabError::configuration(format!(
                "backtest finalized after {} periods, before the end of the price history",
                self.cursor
            )));
        }
        Ok(BacktestResult {
            initial_capital: self.initial_capital,
            equity_curve: self.equity_curve,
            period_returns: self.period_returns,
            rebalances: self.rebalances,
            benchmark_curve: self.benchmark.map(|b| b.curve).unwrap_or_default(),
        })
    }

    /// Move each position by its price change from t − 1 to t. A position
    /// without both prices keeps its value.
    fn accrue(&mut self, prices: &AlignedPrices, t: usize) {
        for (symbol, value) in self.positions.iter_mut() {
            let Some(j) = prices.symbol_index(symbol) else {
                continue;
            };
            if let Some(r) = prices.simple_return(j, t - 1, t) {
                *value *= 1.0 + r;
            }
        }
    }

    fn track_benchmark(&mut self, prices: &AlignedPrices, t: usize, date: NaiveDate) {
        let initial_capital = self.initial_capital;
        let Some(track) = self.benchmark.as_mut() else {
            return;
        };
        if let Some(price) = prices.price(t, track.column) {
            let units = *track.units.get_or_insert(initial_capital / price);
            track.last_value = Some(units * price);
        }
        if let Some(value) = track.last_value {
            track.curve.push(EquityPoint {
                date,
                equity: value,
            });
        }
    }

    /// The benchmark's previous close is below its moving average over the
    /// `window` closes ending there. Without enough history the filter stays
    /// off.
    fn risk_off(&self, prices: &AlignedPrices, t: usize, window: usize) -> bool {
        let Some(track) = &self.benchmark else {
            return false;
        };
        if t < window {
            return false;
        }
        let closes: Option<Vec<f64>> = (t - window..t).map(|i| prices.price(i, track.column)).collect();
        let Some(closes) = closes else {
            return false;
        };
        let average = closes.iter().sum::<f64>() / window as f64;
        closes[window - 1] < average
    }

    fn rebalance(
        &mut self,
        prices: &AlignedPrices,
        config: &BacktestConfig,
        t: usize,
        date: NaiveDate,
    ) -> RebalanceRecord {
        let window = config.benchmark.as_ref().and_then(|b| b.trend_window);
        let in_cash = window.is_some_and(|w| self.risk_off(prices, t, w));

        let next = if in_cash {
            Some(BTreeMap::new())
        } else {
            let ranked = rank(momentum_scores(
                prices,
                &self.universe,
                t,
                config.lookback,
                config.skip,
            ));
            if ranked.is_empty() {
                None
            } else {
                Some(equal_weights(&select_top(&ranked, config.top_n)))
            }
        };

        let Some(next) = next else {
            debug!(%date, "no eligible assets, keeping previous holdings");
            return RebalanceRecord {
                date,
                index: t,
                holdings: self.holdings(),
                turnover: 0.0,
                forced: true,
                in_cash: false,
                cost: 0.0,
            };
        };

        let turnover = turnover(&self.target, &next);
        let equity = self.equity();
        let cost = equity * turnover * config.cost_rate;
        let investable = equity - cost;

        self.positions = next
            .iter()
            .map(|(symbol, w)| (symbol.clone(), investable * w))
            .collect();
        self.cash = if next.is_empty() { investable } else { 0.0 };
        self.target = next;

        let holdings = self.holdings();
        if in_cash {
            info!(%date, "benchmark below trend, moving to cash");
        } else {
            debug!(%date, holdings = ?holdings, turnover, "rebalanced");
        }
        RebalanceRecord {
            date,
            index: t,
            holdings,
            turnover,
            forced: false,
            in_cash,
            cost,
        }
    }
}

/// Align `prices` and drive the state machine to completion.
pub fn run_backtest(
    prices: &PriceTable,
    config: &BacktestConfig,
) -> Result<BacktestResult, QuantlabError> {
    let aligned = prices.align(AlignmentRule::ForwardFill);
    let mut state = BacktestState::new(config, &aligned)?;
    while state.phase() != Phase::Finalized {
        let (next, _) = state.advance(&aligned, config)?;
        state = next;
    }
    let result = state.finalize()?;
    info!(
        periods = result.equity_curve.len(),
        rebalances = result.rebalances.len(),
        final_equity = result.final_equity(),
        "backtest complete"
    );
    Ok(result)
}
