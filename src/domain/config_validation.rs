//! Configuration validation.
//!
//! Validates every config field before any prices are loaded.

use crate::domain::backtest::ShortfallPolicy;
use crate::domain::error::QuantlabError;
use crate::domain::price_table::AlignmentRule;
use crate::ports::config_port::ConfigPort;
use std::str::FromStr;

pub fn validate_data_config(config: &dyn ConfigPort) -> Result<(), QuantlabError> {
    match config.get_string("data", "price_dir") {
        Some(s) if !s.trim().is_empty() => Ok(()),
        _ => Err(QuantlabError::ConfigMissing {
            section: "data".to_string(),
            key: "price_dir".to_string(),
        }),
    }
}

pub fn validate_optimizer_config(config: &dyn ConfigPort) -> Result<(), QuantlabError> {
    validate_data_config(config)?;
    validate_estimator(config)?;
    validate_risk_aversion(config)?;
    validate_tau(config)?;
    validate_max_weight(config)?;
    validate_risk_free_rate(config, "optimizer")?;
    validate_frontier_points(config)?;
    Ok(())
}

pub fn validate_backtest_config(config: &dyn ConfigPort) -> Result<(), QuantlabError> {
    validate_data_config(config)?;
    validate_windows(config)?;
    validate_top_n(config)?;
    validate_initial_capital(config)?;
    validate_cost_rate(config)?;
    validate_risk_free_rate(config, "backtest")?;
    validate_trend_window(config)?;
    validate_shortfall(config)?;
    Ok(())
}

const KNOWN_KEYS: &[(&str, &[&str])] = &[
    ("data", &["price_dir", "symbols", "views", "market_caps"]),
    (
        "estimator",
        &["period", "annualization", "shrinkage_threshold", "alignment"],
    ),
    (
        "optimizer",
        &[
            "risk_aversion",
            "tau",
            "long_only",
            "max_weight",
            "risk_free_rate",
            "frontier_points",
        ],
    ),
    (
        "backtest",
        &[
            "lookback",
            "skip",
            "top_n",
            "rebalance_frequency",
            "initial_capital",
            "cost_rate",
            "benchmark",
            "trend_filter",
            "trend_window",
            "shortfall",
            "risk_free_rate",
        ],
    ),
    ("report", &["output_dir"]),
];

/// Sections and keys nothing reads, as `[section] key` (or `[section]` for a
/// whole unknown section). Usually a typo.
pub fn unknown_keys(config: &dyn ConfigPort) -> Vec<String> {
    let mut unknown = Vec::new();
    for section in config.sections() {
        match KNOWN_KEYS.iter().find(|(name, _)| *name == section) {
            None => unknown.push(format!("[{section}]")),
            Some((_, keys)) => unknown.extend(
                config
                    .keys(&section)
                    .into_iter()
                    .filter(|k| !keys.contains(&k.as_str()))
                    .map(|k| format!("[{section}] {k}")),
            ),
        }
    }
    unknown
}

fn invalid(section: &str, key: &str, reason: impl Into<String>) -> QuantlabError {
    QuantlabError::ConfigInvalid {
        section: section.to_string(),
        key: key.to_string(),
        reason: reason.into(),
    }
}

/// Parse an optional value, rejecting text that is present but malformed.
pub fn parse_value<T: FromStr>(
    config: &dyn ConfigPort,
    section: &str,
    key: &str,
) -> Result<Option<T>, QuantlabError> {
    match config.get_string(section, key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| invalid(section, key, format!("cannot parse '{}'", raw.trim()))),
    }
}

fn validate_estimator(config: &dyn ConfigPort) -> Result<(), QuantlabError> {
    if let Some(period) = parse_value::<i64>(config, "estimator", "period")? {
        if period < 2 {
            return Err(invalid("estimator", "period", "period must be at least 2"));
        }
    }
    if let Some(value) = parse_value::<f64>(config, "estimator", "annualization")? {
        if !value.is_finite() || value <= 0.0 {
            return Err(invalid(
                "estimator",
                "annualization",
                "annualization must be positive",
            ));
        }
    }
    if let Some(value) = parse_value::<f64>(config, "estimator", "shrinkage_threshold")? {
        if !value.is_finite() || value <= 0.0 {
            return Err(invalid(
                "estimator",
                "shrinkage_threshold",
                "shrinkage_threshold must be positive",
            ));
        }
    }
    if let Some(rule) = config.get_string("estimator", "alignment") {
        if AlignmentRule::parse(&rule).is_none() {
            return Err(invalid(
                "estimator",
                "alignment",
                "alignment must be forward_fill or drop_incomplete",
            ));
        }
    }
    Ok(())
}

fn validate_risk_aversion(config: &dyn ConfigPort) -> Result<(), QuantlabError> {
    if let Some(value) = parse_value::<f64>(config, "optimizer", "risk_aversion")? {
        if !value.is_finite() || value <= 0.0 {
            return Err(invalid(
                "optimizer",
                "risk_aversion",
                "risk_aversion must be positive",
            ));
        }
    }
    Ok(())
}

fn validate_tau(config: &dyn ConfigPort) -> Result<(), QuantlabError> {
    if let Some(value) = parse_value::<f64>(config, "optimizer", "tau")? {
        if !value.is_finite() || value <= 0.0 || value > 1.0 {
            return Err(invalid("optimizer", "tau", "tau must be in (0, 1]"));
        }
    }
    Ok(())
}

fn validate_max_weight(config: &dyn ConfigPort) -> Result<(), QuantlabError> {
    if let Some(value) = parse_value::<f64>(config, "optimizer", "max_weight")? {
        if !value.is_finite() || value <= 0.0 {
            return Err(invalid(
                "optimizer",
                "max_weight",
                "max_weight must be positive",
            ));
        }
    }
    Ok(())
}

fn validate_windows(config: &dyn ConfigPort) -> Result<(), QuantlabError> {
    let lookback = parse_value::<i64>(config, "backtest", "lookback")?.unwrap_or(252);
    let skip = parse_value::<i64>(config, "backtest", "skip")?.unwrap_or(21);
    let frequency = parse_value::<i64>(config, "backtest", "rebalance_frequency")?.unwrap_or(21);

    if lookback < 1 {
        return Err(invalid("backtest", "lookback", "lookback must be at least 1"));
    }
    if skip < 0 {
        return Err(invalid("backtest", "skip", "skip must be non-negative"));
    }
    if skip >= lookback {
        return Err(invalid(
            "backtest",
            "skip",
            "skip must be smaller than lookback",
        ));
    }
    if frequency < 1 {
        return Err(invalid(
            "backtest",
            "rebalance_frequency",
            "rebalance_frequency must be at least 1",
        ));
    }
    Ok(())
}

fn validate_top_n(config: &dyn ConfigPort) -> Result<(), QuantlabError> {
    let value = parse_value::<i64>(config, "backtest", "top_n")?.unwrap_or(5);
    if value < 1 {
        return Err(invalid("backtest", "top_n", "top_n must be at least 1"));
    }
    Ok(())
}

fn validate_initial_capital(config: &dyn ConfigPort) -> Result<(), QuantlabError> {
    let value = parse_value::<f64>(config, "backtest", "initial_capital")?.unwrap_or(100_000.0);
    if !value.is_finite() || value <= 0.0 {
        return Err(invalid(
            "backtest",
            "initial_capital",
            "initial_capital must be positive",
        ));
    }
    Ok(())
}

fn validate_cost_rate(config: &dyn ConfigPort) -> Result<(), QuantlabError> {
    let value = parse_value::<f64>(config, "backtest", "cost_rate")?.unwrap_or(0.0);
    if !(0.0..1.0).contains(&value) {
        return Err(invalid(
            "backtest",
            "cost_rate",
            "cost_rate must be between 0 and 1",
        ));
    }
    Ok(())
}

fn validate_risk_free_rate(config: &dyn ConfigPort, section: &str) -> Result<(), QuantlabError> {
    let value = parse_value::<f64>(config, section, "risk_free_rate")?.unwrap_or(0.0);
    if !(0.0..1.0).contains(&value) {
        return Err(invalid(
            section,
            "risk_free_rate",
            "risk_free_rate must be between 0 and 1",
        ));
    }
    Ok(())
}

fn validate_frontier_points(config: &dyn ConfigPort) -> Result<(), QuantlabError> {
    if let Some(value) = parse_value::<i64>(config, "optimizer", "frontier_points")? {
        if value < 0 || value == 1 {
            return Err(invalid(
                "optimizer",
                "frontier_points",
                "frontier_points must be 0 or at least 2",
            ));
        }
    }
    Ok(())
}

fn validate_trend_window(config: &dyn ConfigPort) -> Result<(), QuantlabError> {
    if let Some(value) = parse_value::<i64>(config, "backtest", "trend_window")? {
        if value < 1 {
            return Err(invalid(
                "backtest",
                "trend_window",
                "trend_window must be at least 1",
            ));
        }
    }
    Ok(())
}

fn validate_shortfall(config: &dyn ConfigPort) -> Result<(), QuantlabError> {
    if let Some(policy) = config.get_string("backtest", "shortfall") {
        if ShortfallPolicy::parse(&policy).is_none() {
            return Err(invalid(
                "backtest",
                "shortfall",
                "shortfall must be hold_fewer or reject",
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::file_config_adapter::FileConfigAdapter;

    fn make_config(content: &str) -> FileConfigAdapter {
        FileConfigAdapter::from_string(content).unwrap()
    }

    #[test]
    fn valid_optimizer_config_passes() {
        let config = make_config(
            r#"
[data]
price_dir = data/prices

[estimator]
period = 252
annualization = 252
shrinkage_threshold = 0.5
alignment = forward_fill

[optimizer]
risk_aversion = 2.5
tau = 0.05
long_only = true
max_weight = 0.4
"#,
        );
        assert!(validate_optimizer_config(&config).is_ok());
    }

    #[test]
    fn valid_backtest_config_passes() {
        let config = make_config(
            r#"
[data]
price_dir = data/prices

[backtest]
lookback = 252
skip = 21
top_n = 5
rebalance_frequency = 21
initial_capital = 100000
cost_rate = 0.001
benchmark = SPY
trend_window = 200
shortfall = hold_fewer
risk_free_rate = 0.04
"#,
        );
        assert!(validate_backtest_config(&config).is_ok());
    }

    #[test]
    fn missing_price_dir_fails() {
        let config = make_config("[optimizer]\ntau = 0.05\n");
        let err = validate_optimizer_config(&config).unwrap_err();
        assert!(matches!(err, QuantlabError::ConfigMissing { key, .. } if key == "price_dir"));
    }

    #[test]
    fn tau_out_of_range_fails() {
        let config = make_config("[data]\nprice_dir = p\n[optimizer]\ntau = 1.5\n");
        let err = validate_optimizer_config(&config).unwrap_err();
        assert!(matches!(err, QuantlabError::ConfigInvalid { key, .. } if key == "tau"));
    }

    #[test]
    fn non_positive_risk_aversion_fails() {
        let config = make_config("[data]\nprice_dir = p\n[optimizer]\nrisk_aversion = 0\n");
        let err = validate_optimizer_config(&config).unwrap_err();
        assert!(matches!(err, QuantlabError::ConfigInvalid { key, .. } if key == "risk_aversion"));
    }

    #[test]
    fn single_frontier_point_fails() {
        let config = make_config("[data]\nprice_dir = p\n[optimizer]\nfrontier_points = 1\n");
        let err = validate_optimizer_config(&config).unwrap_err();
        assert!(matches!(err, QuantlabError::ConfigInvalid { key, .. } if key == "frontier_points"));
        let disabled = make_config("[data]\nprice_dir = p\n[optimizer]\nfrontier_points = 0\n");
        assert!(validate_optimizer_config(&disabled).is_ok());
    }

    #[test]
    fn optimizer_risk_free_rate_out_of_range_fails() {
        let config = make_config("[data]\nprice_dir = p\n[optimizer]\nrisk_free_rate = 1.5\n");
        let err = validate_optimizer_config(&config).unwrap_err();
        assert!(matches!(
            err,
            QuantlabError::ConfigInvalid { section, key, .. }
                if section == "optimizer" && key == "risk_free_rate"
        ));
    }

    #[test]
    fn malformed_number_fails() {
        let config = make_config("[data]\nprice_dir = p\n[estimator]\nperiod = lots\n");
        let err = validate_optimizer_config(&config).unwrap_err();
        assert!(matches!(err, QuantlabError::ConfigInvalid { key, .. } if key == "period"));
    }

    #[test]
    fn unknown_alignment_fails() {
        let config = make_config("[data]\nprice_dir = p\n[estimator]\nalignment = interpolate\n");
        let err = validate_optimizer_config(&config).unwrap_err();
        assert!(matches!(err, QuantlabError::ConfigInvalid { key, .. } if key == "alignment"));
    }

    #[test]
    fn skip_not_below_lookback_fails() {
        let config = make_config("[data]\nprice_dir = p\n[backtest]\nlookback = 20\nskip = 20\n");
        let err = validate_backtest_config(&config).unwrap_err();
        assert!(matches!(err, QuantlabError::ConfigInvalid { key, .. } if key == "skip"));
    }

    #[test]
    fn zero_top_n_fails() {
        let config = make_config("[data]\nprice_dir = p\n[backtest]\ntop_n = 0\n");
        let err = validate_backtest_config(&config).unwrap_err();
        assert!(matches!(err, QuantlabError::ConfigInvalid { key, .. } if key == "top_n"));
    }

    #[test]
    fn zero_rebalance_frequency_fails() {
        let config = make_config("[data]\nprice_dir = p\n[backtest]\nrebalance_frequency = 0\n");
        let err = validate_backtest_config(&config).unwrap_err();
        assert!(
            matches!(err, QuantlabError::ConfigInvalid { key, .. } if key == "rebalance_frequency")
        );
    }

    #[test]
    fn negative_cost_rate_fails() {
        let config = make_config("[data]\nprice_dir = p\n[backtest]\ncost_rate = -0.01\n");
        let err = validate_backtest_config(&config).unwrap_err();
        assert!(matches!(err, QuantlabError::ConfigInvalid { key, .. } if key == "cost_rate"));
    }

    #[test]
    fn unknown_shortfall_fails() {
        let config = make_config("[data]\nprice_dir = p\n[backtest]\nshortfall = panic\n");
        let err = validate_backtest_config(&config).unwrap_err();
        assert!(matches!(err, QuantlabError::ConfigInvalid { key, .. } if key == "shortfall"));
    }

    #[test]
    fn unknown_keys_are_listed() {
        let config = make_config(
            "[data]\nprice_dir = p\nprice_directory = q\n[optimiser]\ntau = 0.1\n[backtest]\ntop_n = 3\n",
        );
        assert_eq!(
            unknown_keys(&config),
            vec!["[data] price_directory".to_string(), "[optimiser]".to_string()]
        );
    }

    #[test]
    fn defaults_pass() {
        let config = make_config("[data]\nprice_dir = p\n");
        assert!(validate_optimizer_config(&config).is_ok());
        assert!(validate_backtest_config(&config).is_ok());
    }
}
