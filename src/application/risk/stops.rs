//! Stop-loss / take-profit placement. Five methods: ATR distance (default),
//! percent of price, fixed distance, recent swing extreme, and a trailing
//! variant layered on top of any of them.

use crate::domain::position::PositionSide;
use crate::domain::types::{Candle, OrderSide};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMethod {
    AtrBased,
    PercentOfPrice,
    FixedDistance,
    RecentExtreme,
}

impl FromStr for StopMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "atr" | "atr_based" => Ok(StopMethod::AtrBased),
            "percent" => Ok(StopMethod::PercentOfPrice),
            "fixed" => Ok(StopMethod::FixedDistance),
            "recent_extreme" => Ok(StopMethod::RecentExtreme),
            _ => anyhow::bail!("Invalid stop method: {}", s),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TrailingConfig {
    pub enabled: bool,
    /// Unrealized profit (as a fraction of entry) required before the stop
    /// starts trailing.
    pub activation_pct: f64,
}

impl Default for TrailingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            activation_pct: 0.01,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StopConfig {
    pub method: StopMethod,
    /// ATR multiple for the stop distance.
    pub atr_k: Decimal,
    /// Reward-to-risk multiple for the take-profit distance.
    pub rr: Decimal,
    /// Fallback stop distance as a fraction of price.
    pub percent: Decimal,
    pub fixed_distance: Decimal,
    /// Candles scanned for the swing extreme.
    pub lookback: usize,
    pub trailing: TrailingConfig,
}

impl Default for StopConfig {
    fn default() -> Self {
        Self {
            method: StopMethod::AtrBased,
            atr_k: dec!(2),
            rr: dec!(2.0),
            percent: dec!(0.02),
            fixed_distance: dec!(100),
            lookback: 20,
            trailing: TrailingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StopLevels {
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub stop_distance: Decimal,
}

/// Places stop and take-profit around `price` for an entry on `side`.
/// LONG: SL below, TP above at `rr` times the stop distance; SHORT symmetric.
pub fn place(
    config: &StopConfig,
    side: OrderSide,
    price: Decimal,
    atr: Option<Decimal>,
    recent: &[Candle],
) -> StopLevels {
    let fallback = price * config.percent;
    let distance = match config.method {
        StopMethod::AtrBased => atr
            .filter(|a| *a > Decimal::ZERO)
            .map(|a| a * config.atr_k)
            .unwrap_or(fallback),
        StopMethod::PercentOfPrice => fallback,
        StopMethod::FixedDistance => config.fixed_distance,
        StopMethod::RecentExtreme => {
            let tail = &recent[recent.len().saturating_sub(config.lookback)..];
            let extreme = match side {
                OrderSide::Buy => tail.iter().map(|c| c.low).min(),
                OrderSide::Sell => tail.iter().map(|c| c.high).max(),
            };
            extreme
                .map(|e| (price - e).abs())
                .filter(|d| *d > Decimal::ZERO)
                .unwrap_or(fallback)
        }
    };
    let distance = if distance > Decimal::ZERO { distance } else { fallback };

    match side {
        OrderSide::Buy => StopLevels {
            stop_loss: price - distance,
            take_profit: price + distance * config.rr,
            stop_distance: distance,
        },
        OrderSide::Sell => StopLevels {
            stop_loss: price + distance,
            take_profit: price - distance * config.rr,
            stop_distance: distance,
        },
    }
}

/// Trailing update: moves the stop in the favorable direction only, once the
/// position is in profit beyond the activation threshold. Returns the new
/// stop if it improves on the current one.
pub fn trail(
    config: &TrailingConfig,
    side: PositionSide,
    avg_entry: Decimal,
    current_price: Decimal,
    current_stop: Decimal,
    stop_distance: Decimal,
) -> Option<Decimal> {
    if !config.enabled || avg_entry <= Decimal::ZERO {
        return None;
    }
    let activation = Decimal::from_f64_retain(config.activation_pct)?;

    match side {
        PositionSide::Long => {
            let profit_pct = (current_price - avg_entry) / avg_entry;
            if profit_pct < activation {
                return None;
            }
            let candidate = current_price - stop_distance;
            (candidate > current_stop).then_some(candidate)
        }
        PositionSide::Short => {
            let profit_pct = (avg_entry - current_price) / avg_entry;
            if profit_pct < activation {
                return None;
            }
            let candidate = current_price + stop_distance;
            (candidate < current_stop).then_some(candidate)
        }
    }
}
