//! Integration tests across ports and domain.
//!
//! Tests cover:
//! - Optimization pipeline from mock price and view ports
//! - Momentum backtest over staggered listings
//! - Benchmark trend filter and comparison curve
//! - Report port receiving pipeline output

mod common;

use approx::assert_relative_eq;
use common::*;
use quantlab::domain::backtest::{run_backtest, BacktestConfig, BacktestResult, Benchmark};
use quantlab::domain::equilibrium::MarketWeightSource;
use quantlab::domain::error::QuantlabError;
use quantlab::domain::estimator::{EstimatorConfig, OmissionReason};
use quantlab::domain::metrics::BacktestMetrics;
use quantlab::domain::optimizer::{
    optimize, FallbackReason, OptimizationOutcome, OptimizerConfig, SolverBranch,
};
use quantlab::domain::solver::Constraints;
use quantlab::domain::view::View;
use quantlab::ports::price_port::PricePort;
use quantlab::ports::report_port::ReportPort;
use quantlab::ports::view_port::ViewPort;
use std::cell::RefCell;
use std::path::Path;

fn optimizer_config() -> OptimizerConfig {
    OptimizerConfig {
        estimator: EstimatorConfig {
            period: 60,
            ..EstimatorConfig::default()
        },
        ..OptimizerConfig::default()
    }
}

mod optimize_pipeline {
    use super::*;

    fn run(view_port: &MockViewPort, config: &OptimizerConfig) -> OptimizationOutcome {
        let price_port = three_asset_port(80);
        let symbols = price_port.list_symbols().unwrap();
        let prices = price_port.load_prices(&symbols).unwrap();
        let views = view_port.load_views().unwrap();
        let caps = view_port.load_market_caps().unwrap();
        optimize(&prices, &views, caps.as_ref(), config).unwrap()
    }

    #[test]
    fn views_from_port_drive_primary_branch() {
        let outcome = run(
            &MockViewPort::new(vec![View::new("AAA", 0.12).with_uncertainty(0.01)]),
            &optimizer_config(),
        );
        assert_eq!(outcome.metadata.branch, SolverBranch::Primary);
        assert!(outcome.metadata.fallback_reason.is_none());
        assert_eq!(outcome.metadata.views_applied, vec!["AAA"]);
        assert_eq!(outcome.weights.len(), 3);
        assert_relative_eq!(outcome.weights.sum(), 1.0, epsilon = 1e-6);
        assert!(outcome.weights.iter().all(|(_, w)| w >= -1e-9));
    }

    #[test]
    fn no_views_falls_back_to_min_volatility() {
        let outcome = run(&MockViewPort::new(Vec::new()), &optimizer_config());
        assert_eq!(outcome.metadata.branch, SolverBranch::Fallback);
        assert_eq!(outcome.metadata.fallback_reason, Some(FallbackReason::NoViews));
        assert_relative_eq!(outcome.weights.sum(), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn only_unknown_views_fall_back() {
        let outcome = run(
            &MockViewPort::new(vec![View::new("ZZZ", 0.5)]),
            &optimizer_config(),
        );
        assert_eq!(outcome.metadata.branch, SolverBranch::Fallback);
        assert_eq!(outcome.metadata.views_skipped, vec!["ZZZ"]);
    }

    #[test]
    fn bullish_view_outweighs_bearish_view() {
        let config = optimizer_config();
        let bullish = run(&MockViewPort::new(vec![View::new("BBB", 0.40)]), &config);
        let bearish = run(&MockViewPort::new(vec![View::new("BBB", -0.40)]), &config);
        assert!(bullish.weights.get("BBB").unwrap() > bearish.weights.get("BBB").unwrap());
    }

    #[test]
    fn max_weight_cap_is_respected() {
        let config = OptimizerConfig {
            constraints: Constraints {
                long_only: true,
                max_weight: Some(0.4),
            },
            ..optimizer_config()
        };
        let outcome = run(&MockViewPort::new(vec![View::new("CCC", 0.8)]), &config);
        assert!(outcome.weights.iter().all(|(_, w)| w <= 0.4 + 1e-6));
        assert_relative_eq!(outcome.weights.sum(), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn market_caps_from_port_are_used() {
        let outcome = run(
            &MockViewPort::new(Vec::new()).with_caps(&[("AAA", 5.0), ("BBB", 3.0), ("CCC", 2.0)]),
            &optimizer_config(),
        );
        assert_eq!(outcome.metadata.market_weight_source, MarketWeightSource::MarketCap);
    }

    #[test]
    fn delisted_asset_is_reported_not_windowed() {
        let price_port =
            three_asset_port(200).with_series("DEL", wiggly_series(120, 0.012, 2.3, 0.0));
        let symbols = price_port.list_symbols().unwrap();
        let prices = price_port.load_prices(&symbols).unwrap();
        let outcome = optimize(&prices, &[View::new("DEL", 0.3)], None, &optimizer_config()).unwrap();

        let omission = &outcome.metadata.omissions[0];
        assert_eq!(omission.symbol, "DEL");
        assert!(matches!(omission.reason, OmissionReason::StaleHistory { .. }));
        assert!(outcome.weights.get("DEL").is_none());
        assert_eq!(outcome.weights.len(), 3);
        assert_eq!(outcome.metadata.views_skipped, vec!["DEL"]);
    }

    #[test]
    fn missing_symbol_is_data_error() {
        let err = three_asset_port(80)
            .load_prices(&symbols(&["AAA", "NOPE"]))
            .unwrap_err();
        assert!(matches!(err, QuantlabError::Data { .. }));
    }
}

/// AAA and BBB list at 0 growing 0.1% and 0.2% per period; LATE lists at 30
/// growing 1%. Lookback 50, skip 5, rebalancing every 10 periods.
fn staggered_prices() -> MockPricePort {
    MockPricePort::new()
        .with_series("AAA", growth_series(0, 120, 0.001))
        .with_series("BBB", growth_series(0, 120, 0.002))
        .with_series("LATE", growth_series(30, 120, 0.01))
}

fn staggered_config() -> BacktestConfig {
    BacktestConfig {
        lookback: 50,
        skip: 5,
        top_n: 1,
        rebalance_frequency: 10,
        initial_capital: 100_000.0,
        ..BacktestConfig::default()
    }
}

fn backtest(port: &MockPricePort, config: &BacktestConfig) -> BacktestResult {
    let symbols = port.list_symbols().unwrap();
    let prices = port.load_prices(&symbols).unwrap();
    run_backtest(&prices, config).unwrap()
}

mod momentum_backtest {
    use super::*;

    #[test]
    fn rebalances_before_full_history_are_forced() {
        let result = backtest(&staggered_prices(), &staggered_config());
        let forced: Vec<usize> = result
            .rebalances
            .iter()
            .filter(|r| r.forced)
            .map(|r| r.index)
            .collect();
        assert_eq!(forced, vec![0, 10, 20, 30, 40, 50]);
        // Nothing is held until the first real rebalance.
        for point in &result.equity_curve[..=60] {
            assert_relative_eq!(point.equity, 100_000.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn late_listing_enters_only_with_full_lookback() {
        let result = backtest(&staggered_prices(), &staggered_config());
        for r in result.rebalances.iter().filter(|r| r.index < 90) {
            assert!(!r.holdings.contains(&"LATE".to_string()), "held LATE at {}", r.index);
        }
        let at = |index: usize| result.rebalances.iter().find(|r| r.index == index).unwrap();
        assert_eq!(at(60).holdings, vec!["BBB"]);
        assert_eq!(at(80).holdings, vec!["BBB"]);
        assert_eq!(at(90).holdings, vec!["LATE"]);
        assert_eq!(at(110).holdings, vec!["LATE"]);
    }

    #[test]
    fn turnover_between_targets() {
        let result = backtest(&staggered_prices(), &staggered_config());
        let turnover: Vec<(usize, f64)> = result
            .rebalances
            .iter()
            .filter(|r| !r.forced)
            .map(|r| (r.index, r.turnover))
            .collect();
        assert_eq!(turnover.len(), 6);
        assert_eq!(turnover[0].0, 60);
        assert_relative_eq!(turnover[0].1, 0.5, epsilon = 1e-12);
        assert_relative_eq!(turnover[1].1, 0.0, epsilon = 1e-12);
        assert_relative_eq!(turnover[3].1, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn final_equity_compounds_held_assets() {
        let result = backtest(&staggered_prices(), &staggered_config());
        let expected = 100_000.0 * 1.002_f64.powi(30) * 1.01_f64.powi(29);
        assert_relative_eq!(result.final_equity(), expected, max_relative = 1e-9);
        assert_eq!(result.equity_curve.len(), 120);
        assert_eq!(result.period_returns.len(), 119);
    }

    #[test]
    fn costs_reduce_equity_at_trades() {
        let config = BacktestConfig {
            cost_rate: 0.01,
            ..staggered_config()
        };
        let result = backtest(&staggered_prices(), &config);
        let at60 = result.rebalances.iter().find(|r| r.index == 60).unwrap();
        assert_relative_eq!(at60.cost, 100_000.0 * 0.5 * 0.01, epsilon = 1e-9);
        let free = backtest(&staggered_prices(), &staggered_config());
        assert!(result.final_equity() < free.final_equity());
    }

    /// Two flat assets and one that steps up 20% at period 200, default
    /// windows (lookback 252, skip 21, every 21 periods), 300 periods.
    #[test]
    fn step_up_asset_held_once_history_is_complete() {
        let rise: Vec<_> = (0..300)
            .map(|i| (day(i), if i < 200 { 100.0 } else { 120.0 }))
            .collect();
        let port = MockPricePort::new()
            .with_series("BBB", growth_series(0, 300, 0.0))
            .with_series("CCC", growth_series(0, 300, 0.0))
            .with_series("RISE", rise);
        let config = BacktestConfig {
            top_n: 1,
            ..BacktestConfig::default()
        };
        let result = backtest(&port, &config);

        for r in result.rebalances.iter().filter(|r| r.index < 273) {
            assert!(r.forced, "rebalance at {} should be forced", r.index);
            assert!(r.holdings.is_empty());
        }
        let first = result.rebalances.iter().find(|r| !r.forced).unwrap();
        assert_eq!(first.index, 273);
        assert_eq!(first.holdings, vec!["RISE"]);
        assert!(result
            .rebalances
            .iter()
            .filter(|r| r.index < 221)
            .all(|r| !r.holdings.contains(&"RISE".to_string())));
    }

    #[test]
    fn metrics_over_backtest() {
        let result = backtest(&staggered_prices(), &staggered_config());
        let metrics = BacktestMetrics::compute(&result, 0.0);
        assert_eq!(metrics.rebalances, 12);
        assert_eq!(metrics.forced_rebalances, 6);
        assert_relative_eq!(metrics.max_drawdown, 0.0);
        assert_relative_eq!(metrics.win_rate, 1.0);
        assert_relative_eq!(
            metrics.total_return,
            result.final_equity() / 100_000.0 - 1.0,
            epsilon = 1e-12
        );
        assert_relative_eq!(metrics.average_turnover, 1.5 / 6.0, epsilon = 1e-12);
    }
}

mod benchmark_trend_filter {
    use super::*;

    /// Rises 3% per period until 80, then falls 2% per period.
    fn index_series() -> Vec<(chrono::NaiveDate, f64)> {
        let mut price = 100.0;
        (0..120)
            .map(|i| {
                if i > 0 {
                    price *= if i <= 80 { 1.03 } else { 0.98 };
                }
                (day(i), price)
            })
            .collect()
    }

    fn config(trend_window: Option<usize>) -> BacktestConfig {
        BacktestConfig {
            benchmark: Some(Benchmark {
                symbol: "IDX".into(),
                trend_window,
            }),
            ..staggered_config()
        }
    }

    fn port() -> MockPricePort {
        staggered_prices().with_series("IDX", index_series())
    }

    #[test]
    fn benchmark_is_never_held() {
        let result = backtest(&port(), &config(None));
        for r in &result.rebalances {
            assert!(!r.holdings.contains(&"IDX".to_string()));
        }
        assert_eq!(result.benchmark_curve.len(), 120);
        assert_relative_eq!(result.benchmark_curve[0].equity, 100_000.0);
    }

    #[test]
    fn falling_benchmark_moves_to_cash() {
        let result = backtest(&port(), &config(Some(20)));
        let at = |index: usize| result.rebalances.iter().find(|r| r.index == index).unwrap();
        assert!(!at(80).in_cash);
        assert_eq!(at(80).holdings, vec!["BBB"]);
        for index in [90, 100, 110] {
            assert!(at(index).in_cash, "expected cash at {index}");
            assert!(at(index).holdings.is_empty());
        }
        let equity_at_90 = result.equity_curve[90].equity;
        assert_relative_eq!(result.final_equity(), equity_at_90, epsilon = 1e-9);
    }

    #[test]
    fn disabled_filter_stays_invested() {
        let result = backtest(&port(), &config(None));
        assert!(result.rebalances.iter().all(|r| !r.in_cash));
    }

    #[test]
    fn benchmark_return_reported() {
        let result = backtest(&port(), &config(None));
        let metrics = BacktestMetrics::compute(&result, 0.0);
        let expected = 1.03_f64.powi(80) * 0.98_f64.powi(39) - 1.0;
        assert_relative_eq!(metrics.benchmark_return.unwrap(), expected, max_relative = 1e-9);
    }
}

struct RecordingReportPort {
    equity_points: RefCell<usize>,
    weights: RefCell<Vec<(String, f64)>>,
}

impl RecordingReportPort {
    fn new() -> Self {
        Self {
            equity_points: RefCell::new(0),
            weights: RefCell::new(Vec::new()),
        }
    }
}

impl ReportPort for RecordingReportPort {
    fn write_weights(
        &self,
        outcome: &OptimizationOutcome,
        _output_dir: &Path,
    ) -> Result<(), QuantlabError> {
        *self.weights.borrow_mut() = outcome
            .weights
            .iter()
            .map(|(s, w)| (s.to_string(), w))
            .collect();
        Ok(())
    }

    fn write_backtest(
        &self,
        result: &BacktestResult,
        _metrics: &BacktestMetrics,
        _output_dir: &Path,
    ) -> Result<(), QuantlabError> {
        *self.equity_points.borrow_mut() = result.equity_curve.len();
        Ok(())
    }
}

mod report_generation {
    use super::*;

    #[test]
    fn report_receives_weights_in_symbol_order() {
        let prices = three_asset_port(80)
            .load_prices(&symbols(&["AAA", "BBB", "CCC"]))
            .unwrap();
        let outcome = optimize(&prices, &[View::new("AAA", 0.1)], None, &optimizer_config()).unwrap();
        let port = RecordingReportPort::new();
        port.write_weights(&outcome, Path::new("unused")).unwrap();
        let names: Vec<String> = port.weights.borrow().iter().map(|(s, _)| s.clone()).collect();
        assert_eq!(names, vec!["AAA", "BBB", "CCC"]);
    }

    #[test]
    fn report_receives_full_equity_curve() {
        let result = backtest(&staggered_prices(), &staggered_config());
        let metrics = BacktestMetrics::compute(&result, 0.0);
        let port = RecordingReportPort::new();
        port.write_backtest(&result, &metrics, Path::new("unused")).unwrap();
        assert_eq!(*port.equity_points.borrow(), 120);
    }
}
