//! Momentum scoring, ranking and turnover.

use crate::domain::price_table::AlignedPrices;
use std::cmp::Ordering;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub struct MomentumScore {
    pub symbol: String,
    pub score: f64,
}

/// Trailing return P[t − skip] / P[t − skip − lookback] − 1 for every column
/// in `universe` that has prices at t − skip − lookback, t − skip and t.
pub fn momentum_scores(
    prices: &AlignedPrices,
    universe: &[usize],
    t: usize,
    lookback: usize,
    skip: usize,
) -> Vec<MomentumScore> {
    let Some(start) = t.checked_sub(skip + lookback) else {
        return Vec::new();
    };
    let end = t - skip;
    universe
        .iter()
        .filter(|&&j| prices.price(t, j).is_some())
        .filter_map(|&j| {
            let score = prices.simple_return(j, start, end)?;
            score.is_finite().then(|| MomentumScore {
                symbol: prices.symbols()[j].clone(),
                score,
            })
        })
        .collect()
}

/// Descending by score, ties broken by ascending symbol.
pub fn rank(mut scores: Vec<MomentumScore>) -> Vec<MomentumScore> {
    scores.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.symbol.cmp(&b.symbol))
    });
    scores
}

/// The best `n` symbols, or fewer when fewer are ranked.
pub fn select_top(ranked: &[MomentumScore], n: usize) -> Vec<String> {
    ranked.iter().take(n).map(|s| s.symbol.clone()).collect()
}

pub fn equal_weights(symbols: &[String]) -> BTreeMap<String, f64> {
    if symbols.is_empty() {
        return BTreeMap::new();
    }
    let w = 1.0 / symbols.len() as f64;
    symbols.iter().map(|s| (s.clone(), w)).collect()
}

/// ½ Σ |w_new − w_old| over the union of both holding sets.
pub fn turnover(previous: &BTreeMap<String, f64>, next: &BTreeMap<String, f64>) -> f64 {
    let mut total = 0.0;
    for (symbol, w) in next {
        total += (w - previous.get(symbol).copied().unwrap_or(0.0)).abs();
    }
    for (symbol, w) in previous {
        if !next.contains_key(symbol) {
            total += w.abs();
        }
    }
    total / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::price_table::{AlignmentRule, PriceTable};
    use chrono::NaiveDate;

    fn score(symbol: &str, score: f64) -> MomentumScore {
        MomentumScore {
            symbol: symbol.to_string(),
            score,
        }
    }

    fn grid(series: &[(&str, &[f64])]) -> AlignedPrices {
        let mut table = PriceTable::new();
        for (symbol, prices) in series {
            for (i, p) in prices.iter().enumerate() {
                let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + chrono::Duration::days(i as i64);
                table.insert(date, symbol, *p).unwrap();
            }
        }
        table.align(AlignmentRule::ForwardFill)
    }

    #[test]
    fn scores_skip_recent_window() {
        let prices = grid(&[
            ("AAA", &[100.0, 110.0, 120.0, 60.0]),
            ("BBB", &[100.0, 105.0, 110.0, 200.0]),
        ]);
        // t = 3, lookback 2, skip 1: P[2] / P[0] - 1
        let scores = momentum_scores(&prices, &[0, 1], 3, 2, 1);
        assert_eq!(scores.len(), 2);
        assert!((scores[0].score - 0.20).abs() < 1e-12);
        assert!((scores[1].score - 0.10).abs() < 1e-12);
    }

    #[test]
    fn insufficient_history_is_ineligible() {
        let prices = grid(&[("AAA", &[100.0, 110.0, 120.0])]);
        assert!(momentum_scores(&prices, &[0], 2, 2, 1).is_empty());
    }

    #[test]
    fn missing_current_price_is_ineligible() {
        let mut table = PriceTable::new();
        for i in 0..4 {
            let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + chrono::Duration::days(i);
            table.insert(date, "LIVE", 10.0 + i as f64).unwrap();
            if i < 3 {
                table.insert(date, "GONE", 10.0 + i as f64).unwrap();
            }
        }
        let prices = table.align(AlignmentRule::ForwardFill);
        let scores = momentum_scores(&prices, &[0, 1], 3, 2, 0);
        assert_eq!(scores.len(), 1);
        assert_eq!(scores[0].symbol, "LIVE");
    }

    #[test]
    fn rank_breaks_ties_by_symbol() {
        let ranked = rank(vec![score("ZZZ", 0.1), score("AAA", 0.1), score("MMM", 0.3)]);
        let order: Vec<&str> = ranked.iter().map(|s| s.symbol.as_str()).collect();
        assert_eq!(order, vec!["MMM", "AAA", "ZZZ"]);
    }

    #[test]
    fn select_top_holds_fewer_when_short() {
        let ranked = rank(vec![score("A", 0.2), score("B", 0.1)]);
        assert_eq!(select_top(&ranked, 5), vec!["A", "B"]);
        assert_eq!(select_top(&ranked, 1), vec!["A"]);
    }

    #[test]
    fn identical_holdings_have_zero_turnover() {
        let symbols = vec!["A".to_string(), "B".to_string(), "C".to_string()];
        let w = equal_weights(&symbols);
        assert_eq!(turnover(&w, &w.clone()), 0.0);
    }

    #[test]
    fn full_rotation_turnover_is_one() {
        let old = equal_weights(&["A".to_string(), "B".to_string()]);
        let new = equal_weights(&["C".to_string(), "D".to_string()]);
        assert!((turnover(&old, &new) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn partial_rotation_turnover() {
        let old = equal_weights(&["A".to_string(), "B".to_string()]);
        let new = equal_weights(&["A".to_string(), "C".to_string()]);
        assert!((turnover(&old, &new) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn entering_from_cash_counts_half() {
        let new = equal_weights(&["A".to_string()]);
        assert!((turnover(&BTreeMap::new(), &new) - 0.5).abs() < 1e-12);
    }
}
