//! CSV report adapter implementing ReportPort.
//!
//! Optimization runs produce `weights.csv`, `optimization.csv`,
//! `frontier.csv` and, when one exists, `weights_max_sharpe.csv`; backtests
//! produce `equity.csv`, `rebalances.csv`, `monthly_returns.csv` and
//! `metrics.csv`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::domain::backtest::{BacktestResult, EquityPoint};
use crate::domain::error::QuantlabError;
use crate::domain::metrics::BacktestMetrics;
use crate::domain::optimizer::{OptimizationOutcome, PortfolioPoint};
use crate::ports::report_port::ReportPort;
use chrono::{Datelike, NaiveDate};

#[derive(Debug, Default)]
pub struct CsvReportAdapter;

impl CsvReportAdapter {
    pub fn new() -> Self {
        CsvReportAdapter
    }
}

fn writer(output_dir: &Path, name: &str) -> Result<csv::Writer<fs::File>, QuantlabError> {
    fs::create_dir_all(output_dir)?;
    Ok(csv::Writer::from_path(output_dir.join(name))?)
}

fn max_sharpe_field(outcome: &OptimizationOutcome, field: fn(&PortfolioPoint) -> f64) -> String {
    outcome
        .max_sharpe
        .as_ref()
        .map(|p| format!("{:.6}", field(p)))
        .unwrap_or_default()
}

/// Compounded return per (year, month) from an equity curve.
pub fn compute_monthly_returns(equity_curve: &[EquityPoint]) -> BTreeMap<(i32, u32), f64> {
    let mut growth: BTreeMap<(i32, u32), f64> = BTreeMap::new();
    for window in equity_curve.windows(2) {
        let prev = &window[0];
        let curr = &window[1];
        let ratio = if prev.equity > 0.0 {
            curr.equity / prev.equity
        } else {
            1.0
        };
        *growth
            .entry((curr.date.year(), curr.date.month()))
            .or_insert(1.0) *= ratio;
    }
    growth.into_iter().map(|(k, g)| (k, g - 1.0)).collect()
}

impl ReportPort for CsvReportAdapter {
    fn write_weights(
        &self,
        outcome: &OptimizationOutcome,
        output_dir: &Path,
    ) -> Result<(), QuantlabError> {
        let mut wtr = writer(output_dir, "weights.csv")?;
        wtr.write_record(["symbol", "weight", "expected_return"])?;
        for (symbol, weight) in outcome.weights.iter() {
            let expected = outcome
                .expected_returns
                .get(symbol)
                .map(|r| format!("{r:.6}"))
                .unwrap_or_default();
            wtr.write_record([symbol.to_string(), format!("{weight:.6}"), expected])?;
        }
        wtr.flush()?;

        let meta = &outcome.metadata;
        let mut wtr = writer(output_dir, "optimization.csv")?;
        wtr.write_record(["key", "value"])?;
        let fallback = meta
            .fallback_reason
            .as_ref()
            .map(|r| r.to_string())
            .unwrap_or_default();
        let omitted: Vec<&str> = meta.omissions.iter().map(|o| o.symbol.as_str()).collect();
        let rows = [
            ("branch", meta.branch.to_string()),
            ("fallback_reason", fallback),
            ("views_applied", meta.views_applied.len().to_string()),
            ("view_symbols", meta.views_applied.join(";")),
            ("views_skipped", meta.views_skipped.join(";")),
            ("risk_aversion", meta.risk_aversion.to_string()),
            ("tau", meta.tau.to_string()),
            ("market_weights", meta.market_weight_source.to_string()),
            ("shrinkage", format!("{:.6}", meta.shrinkage)),
            ("omitted", omitted.join(";")),
            ("expected_return", format!("{:.6}", meta.expected_return)),
            ("volatility", format!("{:.6}", meta.volatility)),
            ("converged", meta.converged.to_string()),
            ("iterations", meta.iterations.to_string()),
            ("risk_free_rate", meta.risk_free_rate.to_string()),
            ("max_sharpe_return", max_sharpe_field(outcome, |p| p.expected_return)),
            ("max_sharpe_volatility", max_sharpe_field(outcome, |p| p.volatility)),
            ("max_sharpe_ratio", max_sharpe_field(outcome, |p| p.sharpe_ratio)),
            ("frontier_points", outcome.frontier.len().to_string()),
        ];
        for (key, value) in rows {
            wtr.write_record([key, value.as_str()])?;
        }
        wtr.flush()?;

        if let Some(best) = &outcome.max_sharpe {
            let mut wtr = writer(output_dir, "weights_max_sharpe.csv")?;
            wtr.write_record(["symbol", "weight"])?;
            for (symbol, weight) in best.weights.iter() {
                wtr.write_record([symbol.to_string(), format!("{weight:.6}")])?;
            }
            wtr.flush()?;
        }

        let mut wtr = writer(output_dir, "frontier.csv")?;
        wtr.write_record(["target_return", "expected_return", "volatility"])?;
        for point in &outcome.frontier {
            wtr.write_record([
                format!("{:.6}", point.target_return),
                format!("{:.6}", point.expected_return),
                format!("{:.6}", point.volatility),
            ])?;
        }
        wtr.flush()?;
        Ok(())
    }

    fn write_backtest(
        &self,
        result: &BacktestResult,
        metrics: &BacktestMetrics,
        output_dir: &Path,
    ) -> Result<(), QuantlabError> {
        let benchmark: BTreeMap<NaiveDate, f64> = result
            .benchmark_curve
            .iter()
            .map(|p| (p.date, p.equity))
            .collect();

        let mut wtr = writer(output_dir, "equity.csv")?;
        wtr.write_record(["date", "equity", "benchmark"])?;
        for point in &result.equity_curve {
            let bench = benchmark
                .get(&point.date)
                .map(|v| format!("{v:.2}"))
                .unwrap_or_default();
            wtr.write_record([
                point.date.format("%Y-%m-%d").to_string(),
                format!("{:.2}", point.equity),
                bench,
            ])?;
        }
        wtr.flush()?;

        let mut wtr = writer(output_dir, "rebalances.csv")?;
        wtr.write_record(["date", "turnover", "forced", "in_cash", "cost", "holdings"])?;
        for r in &result.rebalances {
            wtr.write_record([
                r.date.format("%Y-%m-%d").to_string(),
                format!("{:.6}", r.turnover),
                r.forced.to_string(),
                r.in_cash.to_string(),
                format!("{:.2}", r.cost),
                r.holdings.join(";"),
            ])?;
        }
        wtr.flush()?;

        let mut wtr = writer(output_dir, "monthly_returns.csv")?;
        wtr.write_record(["year", "month", "return"])?;
        for ((year, month), ret) in compute_monthly_returns(&result.equity_curve) {
            wtr.write_record([year.to_string(), month.to_string(), format!("{ret:.6}")])?;
        }
        wtr.flush()?;

        let mut wtr = writer(output_dir, "metrics.csv")?;
        wtr.write_record(["metric", "value"])?;
        let benchmark_return = metrics
            .benchmark_return
            .map(|r| format!("{r:.6}"))
            .unwrap_or_default();
        let rows = [
            ("total_return", format!("{:.6}", metrics.total_return)),
            ("annualized_return", format!("{:.6}", metrics.annualized_return)),
            ("annualized_volatility", format!("{:.6}", metrics.annualized_volatility)),
            ("sharpe_ratio", format!("{:.4}", metrics.sharpe_ratio)),
            ("sortino_ratio", format!("{:.4}", metrics.sortino_ratio)),
            ("max_drawdown", format!("{:.6}", metrics.max_drawdown)),
            ("max_drawdown_duration", metrics.max_drawdown_duration.to_string()),
            ("win_rate", format!("{:.4}", metrics.win_rate)),
            ("average_turnover", format!("{:.6}", metrics.average_turnover)),
            ("max_turnover", format!("{:.6}", metrics.max_turnover)),
            ("rebalances", metrics.rebalances.to_string()),
            ("forced_rebalances", metrics.forced_rebalances.to_string()),
            ("benchmark_return", benchmark_return),
        ];
        for (key, value) in rows {
            wtr.write_record([key, value.as_str()])?;
        }
        wtr.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::backtest::RebalanceRecord;
    use crate::domain::estimator::EstimatorConfig;
    use crate::domain::optimizer::{optimize, OptimizerConfig};
    use crate::domain::price_table::PriceTable;
    use crate::domain::view::View;
    use tempfile::TempDir;

    fn point(y: i32, m: u32, d: u32, equity: f64) -> EquityPoint {
        EquityPoint {
            date: NaiveDate::from_ymd_opt(y, m, d).unwrap(),
            equity,
        }
    }

    fn sample_result() -> BacktestResult {
        BacktestResult {
            initial_capital: 100.0,
            equity_curve: vec![
                point(2024, 1, 30, 100.0),
                point(2024, 1, 31, 110.0),
                point(2024, 2, 1, 99.0),
            ],
            period_returns: vec![0.1, -0.1],
            rebalances: vec![RebalanceRecord {
                date: NaiveDate::from_ymd_opt(2024, 1, 30).unwrap(),
                index: 0,
                holdings: vec!["A".into(), "B".into()],
                turnover: 0.5,
                forced: false,
                in_cash: false,
                cost: 0.0,
            }],
            benchmark_curve: vec![point(2024, 1, 31, 100.0), point(2024, 2, 1, 101.0)],
        }
    }

    #[test]
    fn monthly_returns_compound_within_month() {
        let monthly = compute_monthly_returns(&sample_result().equity_curve);
        assert!((monthly[&(2024, 1)] - 0.10).abs() < 1e-12);
        assert!((monthly[&(2024, 2)] - (-0.10)).abs() < 1e-12);
    }

    #[test]
    fn monthly_returns_empty_for_single_point() {
        assert!(compute_monthly_returns(&[point(2024, 1, 1, 1.0)]).is_empty());
    }

    #[test]
    fn write_backtest_creates_files() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("reports");
        let result = sample_result();
        let metrics = BacktestMetrics::compute(&result, 0.0);
        CsvReportAdapter::new()
            .write_backtest(&result, &metrics, &out)
            .unwrap();

        let equity = fs::read_to_string(out.join("equity.csv")).unwrap();
        let lines: Vec<&str> = equity.lines().collect();
        assert_eq!(lines[0], "date,equity,benchmark");
        assert_eq!(lines[1], "2024-01-30,100.00,");
        assert_eq!(lines[2], "2024-01-31,110.00,100.00");

        let rebalances = fs::read_to_string(out.join("rebalances.csv")).unwrap();
        assert!(rebalances.contains("2024-01-30,0.500000,false,false,0.00,A;B"));
        assert!(out.join("metrics.csv").exists());
        assert!(out.join("monthly_returns.csv").exists());
    }

    fn optimization_outcome(frontier_points: usize) -> OptimizationOutcome {
        let mut prices = PriceTable::new();
        for (symbol, amplitude, freq) in [("AAA", 0.010, 0.7), ("BBB", 0.020, 1.9)] {
            let mut price = 100.0;
            let series: Vec<(NaiveDate, f64)> = (0..40)
                .map(|i| {
                    price *= 1.0 + 0.0004 + amplitude * ((i as f64) * freq).sin();
                    (
                        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
                            + chrono::Duration::days(i as i64),
                        price,
                    )
                })
                .collect();
            prices.insert_series(symbol, &series).unwrap();
        }
        let config = OptimizerConfig {
            estimator: EstimatorConfig {
                period: 30,
                ..EstimatorConfig::default()
            },
            frontier_points,
            ..OptimizerConfig::default()
        };
        optimize(&prices, &[View::new("BBB", 0.25)], None, &config).unwrap()
    }

    fn metadata_rows(out: &Path) -> BTreeMap<String, String> {
        let mut rdr = csv::Reader::from_path(out.join("optimization.csv")).unwrap();
        rdr.records()
            .map(|r| {
                let r = r.unwrap();
                (r[0].to_string(), r[1].to_string())
            })
            .collect()
    }

    #[test]
    fn write_weights_includes_max_sharpe_and_frontier() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("reports");
        let outcome = optimization_outcome(5);
        CsvReportAdapter::new().write_weights(&outcome, &out).unwrap();

        let rows = metadata_rows(&out);
        assert_eq!(rows["converged"], "true");
        assert_eq!(rows["frontier_points"], "5");
        assert_eq!(rows["risk_free_rate"], "0");
        assert!(!rows["max_sharpe_ratio"].is_empty());

        let best = fs::read_to_string(out.join("weights_max_sharpe.csv")).unwrap();
        let lines: Vec<&str> = best.lines().collect();
        assert_eq!(lines[0], "symbol,weight");
        assert_eq!(lines.len(), 3);

        let frontier = fs::read_to_string(out.join("frontier.csv")).unwrap();
        let lines: Vec<&str> = frontier.lines().collect();
        assert_eq!(lines[0], "target_return,expected_return,volatility");
        assert_eq!(lines.len(), 6);
    }

    #[test]
    fn disabled_frontier_writes_header_only() {
        let dir = TempDir::new().unwrap();
        let outcome = optimization_outcome(0);
        CsvReportAdapter::new()
            .write_weights(&outcome, dir.path())
            .unwrap();

        assert_eq!(metadata_rows(dir.path())["frontier_points"], "0");
        let frontier = fs::read_to_string(dir.path().join("frontier.csv")).unwrap();
        assert_eq!(frontier.lines().count(), 1);
    }
}
