//! Execution quality: slippage sign convention and the composite score.
//! Score = 0.5 * slippage + 0.3 * cost + 0.2 * speed, each component mapped
//! to [0, 100]. Pivots: slippage is excellent below 0.1% and worthless at
//! 1%; fees below 0.05% are free-tier, 0.5% is the floor; fills inside 1s
//! are instant, 30s hits the order deadline.

use crate::domain::types::OrderSide;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;

const SLIPPAGE_EXCELLENT_PCT: f64 = 0.1;
const SLIPPAGE_WORST_PCT: f64 = 1.0;
const COST_EXCELLENT_PCT: f64 = 0.05;
const COST_WORST_PCT: f64 = 0.5;
const SPEED_EXCELLENT_MS: f64 = 1_000.0;
const SPEED_WORST_MS: f64 = 30_000.0;

/// Signed slippage percentage; positive is adverse to the trader. A BUY
/// filled above expectation and a SELL filled below are both positive.
pub fn slippage_pct(side: OrderSide, expected: Decimal, actual: Decimal) -> f64 {
    if expected <= Decimal::ZERO {
        return 0.0;
    }
    let raw = ((actual - expected) / expected * Decimal::ONE_HUNDRED)
        .to_f64()
        .unwrap_or(0.0);
    match side {
        OrderSide::Buy => raw,
        OrderSide::Sell => -raw,
    }
}

fn linear_component(value: f64, excellent: f64, worst: f64) -> f64 {
    if value <= excellent {
        100.0
    } else if value >= worst {
        0.0
    } else {
        100.0 * (worst - value) / (worst - excellent)
    }
}

pub fn quality_score(slippage_pct: f64, fee_pct: f64, latency_ms: f64) -> f64 {
    // Favorable slippage scores as perfect.
    let slip = linear_component(slippage_pct.max(0.0), SLIPPAGE_EXCELLENT_PCT, SLIPPAGE_WORST_PCT);
    let cost = linear_component(fee_pct.max(0.0), COST_EXCELLENT_PCT, COST_WORST_PCT);
    let speed = linear_component(latency_ms.max(0.0), SPEED_EXCELLENT_MS, SPEED_WORST_MS);
    0.5 * slip + 0.3 * cost + 0.2 * speed
}

/// Per-symbol rollup of fill quality.
#[derive(Debug, Default)]
pub struct QualityRollup {
    by_symbol: HashMap<String, SymbolQuality>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SymbolQuality {
    pub fills: u64,
    pub avg_slippage_pct: f64,
    pub avg_score: f64,
}

impl QualityRollup {
    pub fn record(&mut self, symbol: &str, slippage_pct: f64, score: f64) {
        let entry = self.by_symbol.entry(symbol.to_string()).or_default();
        let n = entry.fills as f64;
        entry.avg_slippage_pct = (entry.avg_slippage_pct * n + slippage_pct) / (n + 1.0);
        entry.avg_score = (entry.avg_score * n + score) / (n + 1.0);
        entry.fills += 1;
    }

    pub fn symbol(&self, symbol: &str) -> Option<SymbolQuality> {
        self.by_symbol.get(symbol).copied()
    }

    pub fn overall_avg_score(&self) -> Option<f64> {
        if self.by_symbol.is_empty() {
            return None;
        }
        let (sum, fills) = self
            .by_symbol
            .values()
            .fold((0.0, 0u64), |(s, n), q| (s + q.avg_score * q.fills as f64, n + q.fills));
        (fills > 0).then(|| sum / fills as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_slippage_sign_convention() {
        // BUY filled higher than expected: adverse.
        assert!(slippage_pct(OrderSide::Buy, dec!(100), dec!(101)) > 0.0);
        // BUY filled lower: favorable.
        assert!(slippage_pct(OrderSide::Buy, dec!(100), dec!(99)) < 0.0);
        // SELL filled lower than expected: adverse.
        assert!(slippage_pct(OrderSide::Sell, dec!(100), dec!(99)) > 0.0);
        assert!(slippage_pct(OrderSide::Sell, dec!(100), dec!(101)) < 0.0);
    }

    #[test]
    fn test_slippage_magnitude() {
        let pct = slippage_pct(OrderSide::Buy, dec!(121617), dec!(121738));
        assert!((pct - 0.0995).abs() < 0.001);
    }

    #[test]
    fn test_quality_score_pivots() {
        // Perfect fill: tight slippage, free tier fee, instant.
        let perfect = quality_score(0.05, 0.01, 500.0);
        assert!((perfect - 100.0).abs() < 1e-9);

        // Worst on every axis.
        assert_eq!(quality_score(2.0, 1.0, 60_000.0), 0.0);

        // Mid-range slippage only.
        let mid = quality_score(0.55, 0.01, 500.0);
        assert!((mid - (0.5 * 50.0 + 30.0 + 20.0)).abs() < 1e-9);
    }

    #[test]
    fn test_favorable_slippage_is_perfect() {
        assert_eq!(quality_score(-0.5, 0.0, 0.0), 100.0);
    }

    #[test]
    fn test_rollup_running_average() {
        let mut rollup = QualityRollup::default();
        rollup.record("BTC/USDT", 0.2, 80.0);
        rollup.record("BTC/USDT", 0.4, 60.0);

        let q = rollup.symbol("BTC/USDT").unwrap();
        assert_eq!(q.fills, 2);
        assert!((q.avg_slippage_pct - 0.3).abs() < 1e-9);
        assert!((q.avg_score - 70.0).abs() < 1e-9);
        assert!((rollup.overall_avg_score().unwrap() - 70.0).abs() < 1e-9);
    }
}
