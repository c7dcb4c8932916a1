//! CLI definition and dispatch.

use clap::{ArgAction, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use crate::adapters::csv_adapter::{CsvAdapter, CsvViewAdapter};
use crate::adapters::csv_report_adapter::CsvReportAdapter;
use crate::adapters::file_config_adapter::FileConfigAdapter;
use crate::domain::backtest::{self as backtest_engine, BacktestConfig, Benchmark, ShortfallPolicy};
use crate::domain::config_validation::{
    parse_value, unknown_keys, validate_backtest_config, validate_optimizer_config,
};
use crate::domain::error::QuantlabError;
use crate::domain::estimator::EstimatorConfig;
use crate::domain::metrics::BacktestMetrics;
use crate::domain::optimizer::{self, OptimizerConfig};
use crate::domain::price_table::AlignmentRule;
use crate::domain::solver::Constraints;
use crate::ports::config_port::ConfigPort;
use crate::ports::price_port::PricePort;
use crate::ports::report_port::ReportPort;
use crate::ports::view_port::ViewPort;

const DEFAULT_OUTPUT_DIR: &str = "reports";
const DEFAULT_TREND_WINDOW: i64 = 200;

#[derive(Parser, Debug)]
#[command(
    name = "quantlab",
    about = "Black-Litterman portfolio optimizer and momentum backtester"
)]
pub struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Compute optimal portfolio weights
    Optimize {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Views CSV, overrides [data] views
        #[arg(long)]
        views: Option<PathBuf>,
    },
    /// Run the momentum rotation backtest
    Backtest {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate a configuration file
    Validate {
        #[arg(short, long)]
        config: PathBuf,
    },
}

pub fn run(cli: Cli) -> ExitCode {
    init_tracing(cli.verbose);
    match cli.command {
        Command::Optimize {
            config,
            output,
            views,
        } => run_optimize(&config, output.as_deref(), views.as_deref()),
        Command::Backtest { config, output } => run_backtest(&config, output.as_deref()),
        Command::Validate { config } => run_validate(&config),
    }
}

/// `RUST_LOG` wins over `-v`. Repeated calls keep the first subscriber.
fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

pub fn load_config(path: &Path) -> Result<FileConfigAdapter, ExitCode> {
    FileConfigAdapter::from_file(path).map_err(|err| {
        eprintln!("error: {err}");
        ExitCode::from(&err)
    })
}

fn warn_unknown_keys(adapter: &dyn ConfigPort) {
    for entry in unknown_keys(adapter) {
        eprintln!("warning: unrecognized config entry {entry}");
    }
}

fn exit_with(result: Result<(), QuantlabError>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            (&e).into()
        }
    }
}

fn run_optimize(config_path: &Path, output: Option<&Path>, views: Option<&Path>) -> ExitCode {
    eprintln!("Loading config from {}", config_path.display());
    let adapter = match load_config(config_path) {
        Ok(a) => a,
        Err(code) => return code,
    };
    exit_with(optimize_pipeline(&adapter, output, views))
}

fn optimize_pipeline(
    adapter: &dyn ConfigPort,
    output: Option<&Path>,
    views_override: Option<&Path>,
) -> Result<(), QuantlabError> {
    // Stage 1: validate and build config
    validate_optimizer_config(adapter)?;
    warn_unknown_keys(adapter);
    let opt_config = build_optimizer_config(adapter)?;
    opt_config.validate()?;

    // Stage 2: load prices
    let price_port = build_price_port(adapter)?;
    let symbols = resolve_symbols(adapter, &price_port)?;
    eprintln!("Loading prices for {} symbols...", symbols.len());
    let prices = price_port.load_prices(&symbols)?;

    // Stage 3: load views and market weights
    let views_path = views_override
        .map(Path::to_path_buf)
        .or_else(|| optional_path(adapter, "data", "views"));
    let view_port = CsvViewAdapter::new(views_path, optional_path(adapter, "data", "market_caps"));
    let views = view_port.load_views()?;
    let caps = view_port.load_market_caps()?;
    eprintln!("Loaded {} views", views.len());

    // Stage 4: optimize
    eprintln!(
        "Optimizing: risk aversion {}, tau {}",
        opt_config.risk_aversion, opt_config.tau
    );
    let outcome = optimizer::optimize(&prices, &views, caps.as_ref(), &opt_config)?;
    let meta = &outcome.metadata;

    eprintln!("\n=== Optimization Result ===");
    eprintln!("Branch:           {}", meta.branch);
    if let Some(reason) = &meta.fallback_reason {
        eprintln!("Fallback Reason:  {reason}");
    }
    eprintln!(
        "Views Applied:    {} ({} skipped)",
        meta.views_applied.len(),
        meta.views_skipped.len()
    );
    eprintln!("Market Weights:   {}", meta.market_weight_source);
    eprintln!("Shrinkage:        {:.4}", meta.shrinkage);
    eprintln!("Expected Return:  {:.2}%", meta.expected_return * 100.0);
    eprintln!("Volatility:       {:.2}%", meta.volatility * 100.0);
    if !meta.converged {
        eprintln!(
            "Converged:        no (stopped after {} iterations)",
            meta.iterations
        );
    }
    for omission in &meta.omissions {
        eprintln!("  omitted {}: {}", omission.symbol, omission.reason);
    }

    eprintln!("\n=== Weights ===");
    for (symbol, weight) in outcome.weights.iter() {
        eprintln!("  {:<8} {:>8.2}%", symbol, weight * 100.0);
    }

    if let Some(best) = &outcome.max_sharpe {
        eprintln!(
            "\n=== Max Sharpe (risk-free {:.2}%) ===",
            meta.risk_free_rate * 100.0
        );
        eprintln!(
            "Return {:.2}%, volatility {:.2}%, Sharpe {:.2}",
            best.expected_return * 100.0,
            best.volatility * 100.0,
            best.sharpe_ratio
        );
        for (symbol, weight) in best.weights.iter() {
            eprintln!("  {:<8} {:>8.2}%", symbol, weight * 100.0);
        }
    }
    if !outcome.frontier.is_empty() {
        eprintln!("Efficient frontier: {} points", outcome.frontier.len());
    }

    // Stage 5: write report
    let output_dir = resolve_output_dir(adapter, output);
    CsvReportAdapter::new().write_weights(&outcome, &output_dir)?;
    eprintln!("\nReport written to: {}", output_dir.display());
    Ok(())
}

fn run_backtest(config_path: &Path, output: Option<&Path>) -> ExitCode {
    eprintln!("Loading config from {}", config_path.display());
    let adapter = match load_config(config_path) {
        Ok(a) => a,
        Err(code) => return code,
    };
    exit_with(backtest_pipeline(&adapter, output))
}

fn backtest_pipeline(adapter: &dyn ConfigPort, output: Option<&Path>) -> Result<(), QuantlabError> {
    // Stage 1: validate and build config
    validate_backtest_config(adapter)?;
    warn_unknown_keys(adapter);
    let bt_config = build_backtest_config(adapter)?;
    bt_config.validate()?;
    let risk_free_rate = parse_value::<f64>(adapter, "backtest", "risk_free_rate")?.unwrap_or(0.0);

    // Stage 2: load prices, benchmark included
    let price_port = build_price_port(adapter)?;
    let mut symbols = resolve_symbols(adapter, &price_port)?;
    if let Some(benchmark) = &bt_config.benchmark {
        if !symbols.contains(&benchmark.symbol) {
            symbols.push(benchmark.symbol.clone());
        }
    }
    eprintln!("Loading prices for {} symbols...", symbols.len());
    let prices = price_port.load_prices(&symbols)?;

    // Stage 3: run
    eprintln!(
        "Running backtest: top {} by {}-period momentum (skip {}), rebalancing every {} periods",
        bt_config.top_n, bt_config.lookback, bt_config.skip, bt_config.rebalance_frequency
    );
    eprintln!("  Processing: {} dates", prices.len());
    let result = backtest_engine::run_backtest(&prices, &bt_config)?;

    // Stage 4: metrics
    let metrics = BacktestMetrics::compute(&result, risk_free_rate);
    eprintln!("\n=== Backtest Results ===");
    eprintln!("Final Equity:     {:.2}", result.final_equity());
    eprintln!("Total Return:     {:.2}%", metrics.total_return * 100.0);
    eprintln!("Annualized:       {:.2}%", metrics.annualized_return * 100.0);
    eprintln!("Volatility:       {:.2}%", metrics.annualized_volatility * 100.0);
    eprintln!("Sharpe Ratio:     {:.2}", metrics.sharpe_ratio);
    eprintln!("Sortino Ratio:    {:.2}", metrics.sortino_ratio);
    eprintln!(
        "Max Drawdown:     -{:.1}% ({} periods)",
        metrics.max_drawdown * 100.0,
        metrics.max_drawdown_duration
    );
    eprintln!("Win Rate:         {:.1}%", metrics.win_rate * 100.0);
    eprintln!(
        "Rebalances:       {} ({} forced)",
        metrics.rebalances, metrics.forced_rebalances
    );
    eprintln!("Avg Turnover:     {:.1}%", metrics.average_turnover * 100.0);
    if let Some(bench) = metrics.benchmark_return {
        eprintln!("Benchmark Return: {:.2}%", bench * 100.0);
    }

    // Stage 5: write report
    let output_dir = resolve_output_dir(adapter, output);
    CsvReportAdapter::new().write_backtest(&result, &metrics, &output_dir)?;
    eprintln!("\nReport written to: {}", output_dir.display());
    Ok(())
}

fn run_validate(config_path: &Path) -> ExitCode {
    eprintln!("Validating config: {}", config_path.display());
    let adapter = match load_config(config_path) {
        Ok(a) => a,
        Err(code) => return code,
    };
    exit_with(validate_pipeline(&adapter))
}

fn validate_pipeline(adapter: &dyn ConfigPort) -> Result<(), QuantlabError> {
    validate_optimizer_config(adapter)?;
    validate_backtest_config(adapter)?;
    warn_unknown_keys(adapter);
    let opt_config = build_optimizer_config(adapter)?;
    opt_config.validate()?;
    let bt_config = build_backtest_config(adapter)?;
    bt_config.validate()?;

    let price_port = build_price_port(adapter)?;
    let symbols = resolve_symbols(adapter, &price_port)?;

    eprintln!("\nUniverse:");
    eprintln!("  symbols: {}", symbols.join(", "));
    if let Some(benchmark) = &bt_config.benchmark {
        eprintln!("  benchmark: {}", benchmark.symbol);
    }
    eprintln!("\nConfiguration is valid.");
    Ok(())
}

fn required_string(
    adapter: &dyn ConfigPort,
    section: &str,
    key: &str,
) -> Result<String, QuantlabError> {
    adapter
        .get_string(section, key)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| QuantlabError::ConfigMissing {
            section: section.into(),
            key: key.into(),
        })
}

fn optional_path(adapter: &dyn ConfigPort, section: &str, key: &str) -> Option<PathBuf> {
    adapter
        .get_string(section, key)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
}

fn non_negative(value: i64, section: &str, key: &str) -> Result<usize, QuantlabError> {
    usize::try_from(value).map_err(|_| QuantlabError::ConfigInvalid {
        section: section.into(),
        key: key.into(),
        reason: format!("{value} must not be negative"),
    })
}

pub fn build_price_port(adapter: &dyn ConfigPort) -> Result<CsvAdapter, QuantlabError> {
    let price_dir = required_string(adapter, "data", "price_dir")?;
    Ok(CsvAdapter::new(PathBuf::from(price_dir)))
}

/// `[data] symbols` when set, otherwise everything the price source lists.
pub fn resolve_symbols(
    adapter: &dyn ConfigPort,
    price_port: &dyn PricePort,
) -> Result<Vec<String>, QuantlabError> {
    let configured = adapter.get_list("data", "symbols");
    let symbols = if configured.is_empty() {
        price_port.list_symbols()?
    } else {
        configured
    };
    if symbols.is_empty() {
        return Err(QuantlabError::configuration("no symbols configured or found"));
    }
    Ok(symbols)
}

pub fn resolve_output_dir(adapter: &dyn ConfigPort, output: Option<&Path>) -> PathBuf {
    output
        .map(Path::to_path_buf)
        .or_else(|| optional_path(adapter, "report", "output_dir"))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR))
}

pub fn build_estimator_config(adapter: &dyn ConfigPort) -> Result<EstimatorConfig, QuantlabError> {
    let defaults = EstimatorConfig::default();
    let period = match parse_value::<i64>(adapter, "estimator", "period")? {
        Some(p) => non_negative(p, "estimator", "period")?,
        None => defaults.period,
    };
    let alignment = match adapter.get_string("estimator", "alignment") {
        Some(raw) => {
            AlignmentRule::parse(&raw).ok_or_else(|| QuantlabError::ConfigInvalid {
                section: "estimator".into(),
                key: "alignment".into(),
                reason: format!("unknown alignment rule '{}'", raw.trim()),
            })?
        }
        None => defaults.alignment,
    };
    Ok(EstimatorConfig {
        period,
        alignment,
        annualization: parse_value(adapter, "estimator", "annualization")?
            .unwrap_or(defaults.annualization),
        shrinkage_threshold: parse_value(adapter, "estimator", "shrinkage_threshold")?
            .unwrap_or(defaults.shrinkage_threshold),
    })
}

pub fn build_optimizer_config(adapter: &dyn ConfigPort) -> Result<OptimizerConfig, QuantlabError> {
    let defaults = OptimizerConfig::default();
    Ok(OptimizerConfig {
        estimator: build_estimator_config(adapter)?,
        risk_aversion: parse_value(adapter, "optimizer", "risk_aversion")?
            .unwrap_or(defaults.risk_aversion),
        tau: parse_value(adapter, "optimizer", "tau")?.unwrap_or(defaults.tau),
        constraints: Constraints {
            long_only: adapter.get_bool("optimizer", "long_only", true),
            max_weight: parse_value(adapter, "optimizer", "max_weight")?,
        },
        risk_free_rate: parse_value(adapter, "optimizer", "risk_free_rate")?
            .unwrap_or(defaults.risk_free_rate),
        frontier_points: match parse_value::<i64>(adapter, "optimizer", "frontier_points")? {
            Some(points) => non_negative(points, "optimizer", "frontier_points")?,
            None => defaults.frontier_points,
        },
    })
}

pub fn build_backtest_config(adapter: &dyn ConfigPort) -> Result<BacktestConfig, QuantlabError> {
    let defaults = BacktestConfig::default();
    let usize_or = |key: &str, default: usize| -> Result<usize, QuantlabError> {
        match parse_value::<i64>(adapter, "backtest", key)? {
            Some(v) => non_negative(v, "backtest", key),
            None => Ok(default),
        }
    };

    let benchmark = match adapter
        .get_string("backtest", "benchmark")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
    {
        Some(symbol) => {
            let trend_window = if adapter.get_bool("backtest", "trend_filter", true) {
                let window = parse_value::<i64>(adapter, "backtest", "trend_window")?
                    .unwrap_or(DEFAULT_TREND_WINDOW);
                Some(non_negative(window, "backtest", "trend_window")?)
            } else {
                None
            };
            Some(Benchmark {
                symbol,
                trend_window,
            })
        }
        None => None,
    };

    let shortfall = match adapter.get_string("backtest", "shortfall") {
        Some(raw) => ShortfallPolicy::parse(&raw).ok_or_else(|| QuantlabError::ConfigInvalid {
            section: "backtest".into(),
            key: "shortfall".into(),
            reason: format!("unknown shortfall policy '{}'", raw.trim()),
        })?,
        None => defaults.shortfall,
    };

    Ok(BacktestConfig {
        lookback: usize_or("lookback", defaults.lookback)?,
        skip: usize_or("skip", defaults.skip)?,
        top_n: usize_or("top_n", defaults.top_n)?,
        rebalance_frequency: usize_or("rebalance_frequency", defaults.rebalance_frequency)?,
        initial_capital: parse_value(adapter, "backtest", "initial_capital")?
            .unwrap_or(defaults.initial_capital),
        cost_rate: parse_value(adapter, "backtest", "cost_rate")?.unwrap_or(defaults.cost_rate),
        benchmark,
        shortfall,
    })
}
