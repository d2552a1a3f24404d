//! Signal derivation rules. Each indicator family emits at most one signal
//! per candle; absence of a trigger emits nothing rather than a HOLD.

use crate::domain::signal::{IndicatorSnapshot, Signal, SignalKind};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

pub const RSI_OVERSOLD: f64 = 30.0;
pub const RSI_OVERBOUGHT: f64 = 70.0;
pub const VOLUME_CONFIRMATION_RATIO: f64 = 1.3;
pub const VOLUME_CONFIRMATION_BOOST: f64 = 1.1;

/// Evaluates all rules against the current snapshot. `prev` is the snapshot
/// of the window without its newest candle (needed for crossover detection),
/// `close` the newest close.
pub fn evaluate(
    symbol: &str,
    close: Decimal,
    prev: &IndicatorSnapshot,
    curr: &IndicatorSnapshot,
    emitted_at: i64,
) -> Vec<Signal> {
    let mut signals = Vec::new();

    if let Some(signal) = rsi_rule(symbol, curr, emitted_at) {
        signals.push(signal);
    }
    if let Some(signal) = macd_rule(symbol, prev, curr, emitted_at) {
        signals.push(signal);
    }
    if let Some(signal) = bollinger_rule(symbol, close, curr, emitted_at) {
        signals.push(signal);
    }

    apply_volume_confirmation(&mut signals, curr);
    signals
}

/// RSI < 30 buys, RSI > 70 sells; both strictly. Confidence grows linearly
/// with the excursion beyond the band.
fn rsi_rule(symbol: &str, curr: &IndicatorSnapshot, emitted_at: i64) -> Option<Signal> {
    let rsi = curr.rsi?;
    let (kind, confidence) = if rsi < RSI_OVERSOLD {
        (SignalKind::Buy, ((RSI_OVERSOLD - rsi) / RSI_OVERSOLD * 0.85 + 0.15).min(1.0))
    } else if rsi > RSI_OVERBOUGHT {
        (
            SignalKind::Sell,
            ((rsi - RSI_OVERBOUGHT) / RSI_OVERSOLD * 0.85 + 0.15).min(1.0),
        )
    } else {
        return None;
    };
    Some(Signal::new(symbol, "rsi", kind, confidence, emitted_at, curr.clone()))
}

/// MACD line crossing its signal line, confirmed by histogram sign.
/// Confidence scales with histogram magnitude relative to ATR.
fn macd_rule(
    symbol: &str,
    prev: &IndicatorSnapshot,
    curr: &IndicatorSnapshot,
    emitted_at: i64,
) -> Option<Signal> {
    let (prev_line, prev_sig) = (prev.macd_line?, prev.macd_signal?);
    let (line, sig, hist) = (curr.macd_line?, curr.macd_signal?, curr.macd_hist?);
    let atr = curr.atr?;
    if atr <= 0.0 {
        return None;
    }

    let crossed_up = prev_line <= prev_sig && line > sig && hist > 0.0;
    let crossed_down = prev_line >= prev_sig && line < sig && hist < 0.0;
    let kind = if crossed_up {
        SignalKind::Buy
    } else if crossed_down {
        SignalKind::Sell
    } else {
        return None;
    };

    let confidence = (hist.abs() / atr).clamp(0.0, 0.85);
    Some(Signal::new(symbol, "macd", kind, confidence, emitted_at, curr.clone()))
}

/// Close at or beyond a Bollinger band. Confidence is the distance from the
/// middle band normalized by the band half-width (2 sigma).
fn bollinger_rule(
    symbol: &str,
    close: Decimal,
    curr: &IndicatorSnapshot,
    emitted_at: i64,
) -> Option<Signal> {
    let (upper, middle, lower) = (curr.bb_upper?, curr.bb_middle?, curr.bb_lower?);
    let price = close.to_f64()?;
    let two_sigma = upper - middle;
    if two_sigma <= 0.0 {
        return None;
    }

    let kind = if price <= lower {
        SignalKind::Buy
    } else if price >= upper {
        SignalKind::Sell
    } else {
        return None;
    };

    let confidence = ((price - middle).abs() / two_sigma).clamp(0.0, 0.8);
    Some(Signal::new(symbol, "bollinger", kind, confidence, emitted_at, curr.clone()))
}

/// A volume surge (ratio > 1.3 over its SMA20) confirms the dominant
/// directional signal, boosting its confidence by at most 1.1x.
fn apply_volume_confirmation(signals: &mut [Signal], curr: &IndicatorSnapshot) {
    let Some(ratio) = curr.volume_ratio else { return };
    if ratio <= VOLUME_CONFIRMATION_RATIO {
        return;
    }
    let dominant = signals
        .iter_mut()
        .filter(|s| s.kind != SignalKind::Hold)
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence));
    if let Some(signal) = dominant {
        signal.confidence = (signal.confidence * VOLUME_CONFIRMATION_BOOST).min(1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn snapshot() -> IndicatorSnapshot {
        IndicatorSnapshot {
            rsi: Some(50.0),
            macd_line: Some(0.0),
            macd_signal: Some(0.0),
            macd_hist: Some(0.0),
            bb_upper: Some(110.0),
            bb_middle: Some(100.0),
            bb_lower: Some(90.0),
            atr: Some(5.0),
            volume_ratio: Some(1.0),
            ..Default::default()
        }
    }

    #[test]
    fn test_rsi_boundaries_are_strict() {
        let mut curr = snapshot();

        curr.rsi = Some(30.0);
        assert!(rsi_rule("BTC/USDT", &curr, 0).is_none());
        curr.rsi = Some(70.0);
        assert!(rsi_rule("BTC/USDT", &curr, 0).is_none());

        curr.rsi = Some(29.9);
        let signal = rsi_rule("BTC/USDT", &curr, 0).unwrap();
        assert_eq!(signal.kind, SignalKind::Buy);

        curr.rsi = Some(70.1);
        let signal = rsi_rule("BTC/USDT", &curr, 0).unwrap();
        assert_eq!(signal.kind, SignalKind::Sell);
    }

    #[test]
    fn test_rsi_confidence_scales_with_excursion() {
        let mut curr = snapshot();
        curr.rsi = Some(15.0);
        let mid = rsi_rule("BTC/USDT", &curr, 0).unwrap().confidence;
        assert!((mid - 0.575).abs() < 1e-9);

        curr.rsi = Some(0.0);
        let extreme = rsi_rule("BTC/USDT", &curr, 0).unwrap().confidence;
        assert!((extreme - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_macd_cross_up_emits_buy() {
        let mut prev = snapshot();
        prev.macd_line = Some(-1.0);
        prev.macd_signal = Some(0.5);

        let mut curr = snapshot();
        curr.macd_line = Some(1.0);
        curr.macd_signal = Some(0.2);
        curr.macd_hist = Some(0.8);
        curr.atr = Some(2.0);

        let signal = macd_rule("BTC/USDT", &prev, &curr, 0).unwrap();
        assert_eq!(signal.kind, SignalKind::Buy);
        assert!((signal.confidence - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_macd_no_cross_no_signal() {
        let mut prev = snapshot();
        prev.macd_line = Some(1.0);
        prev.macd_signal = Some(0.5);

        let mut curr = snapshot();
        curr.macd_line = Some(1.5);
        curr.macd_signal = Some(0.6);
        curr.macd_hist = Some(0.9);

        assert!(macd_rule("BTC/USDT", &prev, &curr, 0).is_none());
    }

    #[test]
    fn test_macd_confidence_is_capped() {
        let mut prev = snapshot();
        prev.macd_line = Some(-1.0);
        prev.macd_signal = Some(0.0);

        let mut curr = snapshot();
        curr.macd_line = Some(5.0);
        curr.macd_signal = Some(0.0);
        curr.macd_hist = Some(50.0);
        curr.atr = Some(1.0);

        let signal = macd_rule("BTC/USDT", &prev, &curr, 0).unwrap();
        assert_eq!(signal.confidence, 0.85);
    }

    #[test]
    fn test_bollinger_touch_emits_signal() {
        let curr = snapshot();

        let buy = bollinger_rule("BTC/USDT", dec!(89), &curr, 0).unwrap();
        assert_eq!(buy.kind, SignalKind::Buy);
        assert_eq!(buy.confidence, 0.8); // |89-100|/10 clamped to 0.8

        let sell = bollinger_rule("BTC/USDT", dec!(110), &curr, 0).unwrap();
        assert_eq!(sell.kind, SignalKind::Sell);

        assert!(bollinger_rule("BTC/USDT", dec!(100), &curr, 0).is_none());
    }

    #[test]
    fn test_volume_surge_boosts_dominant_signal() {
        let mut curr = snapshot();
        curr.rsi = Some(20.0);
        curr.volume_ratio = Some(1.5);

        let signals = evaluate("BTC/USDT", dec!(100), &snapshot(), &curr, 0);
        assert_eq!(signals.len(), 1);
        let base = (30.0 - 20.0) / 30.0 * 0.85 + 0.15;
        assert!((signals[0].confidence - base * 1.1).abs() < 1e-9);
    }

    #[test]
    fn test_volume_boost_never_exceeds_one() {
        let mut curr = snapshot();
        curr.rsi = Some(0.0); // confidence 1.0
        curr.volume_ratio = Some(2.0);

        let signals = evaluate("BTC/USDT", dec!(100), &snapshot(), &curr, 0);
        assert_eq!(signals[0].confidence, 1.0);
    }
}
