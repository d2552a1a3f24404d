//! Indicator math over a rolling candle window. Every value is recomputed
//! from the window on each call; there is no state carried between candles,
//! so the snapshot is a pure function of the window.

use crate::domain::signal::IndicatorSnapshot;
use crate::domain::types::Candle;
use rust_decimal::prelude::ToPrimitive;
use ta::indicators::{
    AverageTrueRange, BollingerBands, ExponentialMovingAverage,
    MovingAverageConvergenceDivergence, OnBalanceVolume, RelativeStrengthIndex,
    SimpleMovingAverage, SlowStochastic,
};
use ta::{DataItem, Next};

pub const RSI_PERIOD: usize = 14;
pub const MACD_FAST: usize = 12;
pub const MACD_SLOW: usize = 26;
pub const MACD_SIGNAL: usize = 9;
pub const BB_PERIOD: usize = 20;
pub const BB_STD_DEV: f64 = 2.0;
pub const ATR_PERIOD: usize = 14;
pub const STOCH_PERIOD: usize = 14;
pub const ADX_PERIOD: usize = 14;
pub const VOLUME_SMA_PERIOD: usize = 20;

/// Computes the indicator snapshot for the given window (ascending open_time).
/// Fields stay None until the window covers the indicator's lookback.
pub fn compute_snapshot(window: &[Candle]) -> IndicatorSnapshot {
    let mut snapshot = IndicatorSnapshot::default();
    if window.is_empty() {
        return snapshot;
    }

    let closes: Vec<f64> = window
        .iter()
        .map(|c| c.close.to_f64().unwrap_or(0.0))
        .collect();
    let volumes: Vec<f64> = window
        .iter()
        .map(|c| c.volume.to_f64().unwrap_or(0.0))
        .collect();
    let items: Vec<DataItem> = window
        .iter()
        .filter_map(|c| {
            DataItem::builder()
                .open(c.open.to_f64()?)
                .high(c.high.to_f64()?)
                .low(c.low.to_f64()?)
                .close(c.close.to_f64()?)
                .volume(c.volume.to_f64()?)
                .build()
                .ok()
        })
        .collect();
    if items.len() != window.len() {
        // Malformed candle slipped through; bail rather than emit garbage.
        return snapshot;
    }
    let n = window.len();
    snapshot.price = closes.last().copied();

    if n >= RSI_PERIOD + 1 {
        let mut rsi = RelativeStrengthIndex::new(RSI_PERIOD).expect("valid RSI period");
        snapshot.rsi = Some(feed_f64(&mut rsi, &closes));
    }

    if n >= MACD_SLOW + MACD_SIGNAL {
        let mut macd = MovingAverageConvergenceDivergence::new(MACD_FAST, MACD_SLOW, MACD_SIGNAL)
            .expect("valid MACD periods");
        let mut out = None;
        for &c in &closes {
            out = Some(macd.next(c));
        }
        if let Some(out) = out {
            snapshot.macd_line = Some(out.macd);
            snapshot.macd_signal = Some(out.signal);
            snapshot.macd_hist = Some(out.histogram);
        }
    }

    if n >= 20 {
        let mut sma = SimpleMovingAverage::new(20).expect("valid SMA period");
        snapshot.sma_20 = Some(feed_f64(&mut sma, &closes));
    }
    if n >= 50 {
        let mut sma = SimpleMovingAverage::new(50).expect("valid SMA period");
        snapshot.sma_50 = Some(feed_f64(&mut sma, &closes));
    }
    if n >= MACD_FAST {
        let mut ema = ExponentialMovingAverage::new(MACD_FAST).expect("valid EMA period");
        snapshot.ema_12 = Some(feed_f64(&mut ema, &closes));
    }
    if n >= MACD_SLOW {
        let mut ema = ExponentialMovingAverage::new(MACD_SLOW).expect("valid EMA period");
        snapshot.ema_26 = Some(feed_f64(&mut ema, &closes));
    }

    if n >= BB_PERIOD {
        let mut bb = BollingerBands::new(BB_PERIOD, BB_STD_DEV).expect("valid BB config");
        let mut out = None;
        for &c in &closes {
            out = Some(bb.next(c));
        }
        if let Some(out) = out {
            snapshot.bb_upper = Some(out.upper);
            snapshot.bb_middle = Some(out.average);
            snapshot.bb_lower = Some(out.lower);
        }
    }

    if n >= ATR_PERIOD + 1 {
        let mut atr = AverageTrueRange::new(ATR_PERIOD).expect("valid ATR period");
        let mut value = 0.0;
        for item in &items {
            value = atr.next(item);
        }
        snapshot.atr = Some(value);
    }

    if n >= 2 {
        let mut obv = OnBalanceVolume::new();
        let mut value = 0.0;
        for item in &items {
            value = obv.next(item);
        }
        snapshot.obv = Some(value);
    }

    if n >= STOCH_PERIOD + 3 {
        let mut stoch = SlowStochastic::new(STOCH_PERIOD, 3).expect("valid stochastic config");
        let ks: Vec<f64> = items.iter().map(|item| stoch.next(item)).collect();
        snapshot.stoch_k = ks.last().copied();
        // %D smooths %K over three slow readings.
        let tail = &ks[ks.len() - 3..];
        snapshot.stoch_d = Some(tail.iter().sum::<f64>() / 3.0);
    }

    snapshot.adx = adx(window, ADX_PERIOD);

    if n >= VOLUME_SMA_PERIOD {
        let mut sma = SimpleMovingAverage::new(VOLUME_SMA_PERIOD).expect("valid SMA period");
        let vol_sma = feed_f64(&mut sma, &volumes);
        if vol_sma > 0.0 {
            snapshot.volume_ratio = Some(volumes[n - 1] / vol_sma);
        }
    }

    snapshot
}

fn feed_f64<I: Next<f64, Output = f64>>(indicator: &mut I, values: &[f64]) -> f64 {
    let mut out = 0.0;
    for &v in values {
        out = indicator.next(v);
    }
    out
}

/// Average Directional Index with Wilder smoothing. Needs 2*period + 1
/// candles: `period` bars seed the +DM/-DM/TR smoothing and another `period`
/// DX values seed the ADX average.
pub fn adx(window: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || window.len() < 2 * period + 1 {
        return None;
    }
    let period_f = period as f64;
    let n = window.len();

    let mut plus_dm = Vec::with_capacity(n - 1);
    let mut minus_dm = Vec::with_capacity(n - 1);
    let mut tr_vals = Vec::with_capacity(n - 1);

    for i in 1..n {
        let high = window[i].high.to_f64()?;
        let low = window[i].low.to_f64()?;
        let prev_high = window[i - 1].high.to_f64()?;
        let prev_low = window[i - 1].low.to_f64()?;
        let prev_close = window[i - 1].close.to_f64()?;

        let tr = (high - low)
            .max((high - prev_close).abs())
            .max((low - prev_close).abs());

        let up_move = high - prev_high;
        let down_move = prev_low - low;
        plus_dm.push(if up_move > down_move && up_move > 0.0 { up_move } else { 0.0 });
        minus_dm.push(if down_move > up_move && down_move > 0.0 { down_move } else { 0.0 });
        tr_vals.push(tr);
    }

    let mut smooth_plus: f64 = plus_dm[..period].iter().sum();
    let mut smooth_minus: f64 = minus_dm[..period].iter().sum();
    let mut smooth_tr: f64 = tr_vals[..period].iter().sum();

    let mut dx_values = Vec::with_capacity(tr_vals.len() - period + 1);
    dx_values.push(dx(smooth_plus, smooth_minus, smooth_tr)?);

    for i in period..tr_vals.len() {
        smooth_plus = smooth_plus - smooth_plus / period_f + plus_dm[i];
        smooth_minus = smooth_minus - smooth_minus / period_f + minus_dm[i];
        smooth_tr = smooth_tr - smooth_tr / period_f + tr_vals[i];
        dx_values.push(dx(smooth_plus, smooth_minus, smooth_tr)?);
    }

    if dx_values.len() < period {
        return None;
    }
    let mut adx = dx_values[..period].iter().sum::<f64>() / period_f;
    for &v in &dx_values[period..] {
        adx = (adx * (period_f - 1.0) + v) / period_f;
    }
    adx.is_finite().then_some(adx)
}

fn dx(smooth_plus: f64, smooth_minus: f64, smooth_tr: f64) -> Option<f64> {
    if smooth_tr == 0.0 {
        return Some(0.0);
    }
    let plus_di = smooth_plus / smooth_tr * 100.0;
    let minus_di = smooth_minus / smooth_tr * 100.0;
    let sum = plus_di + minus_di;
    if sum == 0.0 {
        return Some(0.0);
    }
    let value = (plus_di - minus_di).abs() / sum * 100.0;
    value.is_finite().then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::Timeframe;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn candle(i: i64, close: f64, volume: f64) -> Candle {
        let c = Decimal::from_f64_retain(close).unwrap();
        Candle {
            symbol: "BTC/USDT".to_string(),
            timeframe: Timeframe::M1,
            open_time: i * 60_000,
            open: c - dec!(1),
            high: c + dec!(2),
            low: c - dec!(2),
            close: c,
            volume: Decimal::from_f64_retain(volume).unwrap(),
        }
    }

    fn flat_window(n: usize) -> Vec<Candle> {
        (0..n).map(|i| candle(i as i64, 100.0, 1.0)).collect()
    }

    #[test]
    fn test_short_window_yields_sparse_snapshot() {
        let snapshot = compute_snapshot(&flat_window(5));
        assert!(snapshot.rsi.is_none());
        assert!(snapshot.macd_hist.is_none());
        assert!(snapshot.bb_middle.is_none());
        assert!(snapshot.adx.is_none());
    }

    #[test]
    fn test_full_window_populates_all_fields() {
        let window: Vec<Candle> = (0..60)
            .map(|i| candle(i, 100.0 + (i as f64 * 0.7).sin() * 5.0, 1.0 + (i % 4) as f64))
            .collect();
        let snapshot = compute_snapshot(&window);
        assert!(snapshot.rsi.is_some());
        assert!(snapshot.macd_line.is_some());
        assert!(snapshot.bb_upper.is_some());
        assert!(snapshot.atr.is_some());
        assert!(snapshot.obv.is_some());
        assert!(snapshot.stoch_k.is_some());
        assert!(snapshot.adx.is_some());
        assert!(snapshot.volume_ratio.is_some());

        let rsi = snapshot.rsi.unwrap();
        assert!((0.0..=100.0).contains(&rsi));
    }

    #[test]
    fn test_snapshot_is_deterministic() {
        let window: Vec<Candle> = (0..40)
            .map(|i| candle(i, 100.0 + i as f64, 2.0))
            .collect();
        assert_eq!(compute_snapshot(&window), compute_snapshot(&window));
    }

    #[test]
    fn test_rising_closes_push_rsi_high() {
        let window: Vec<Candle> = (0..30).map(|i| candle(i, 100.0 + i as f64 * 2.0, 1.0)).collect();
        let rsi = compute_snapshot(&window).rsi.unwrap();
        assert!(rsi > 70.0, "monotonic rally should overheat RSI, got {rsi}");
    }

    #[test]
    fn test_adx_detects_trend_strength() {
        let trending: Vec<Candle> = (0..60).map(|i| candle(i, 100.0 + i as f64 * 2.0, 1.0)).collect();
        let adx_trend = adx(&trending, 14).unwrap();
        assert!(adx_trend > 25.0, "expected trending ADX > 25, got {adx_trend}");

        let flat = flat_window(60);
        let adx_flat = adx(&flat, 14).unwrap();
        assert!(adx_flat < 5.0, "expected flat ADX near 0, got {adx_flat}");
    }

    #[test]
    fn test_volume_ratio_flags_surge() {
        let mut window = flat_window(30);
        let last = window.last_mut().unwrap();
        last.volume = dec!(10);
        let ratio = compute_snapshot(&window).volume_ratio.unwrap();
        assert!(ratio > 1.3, "volume surge should lift the ratio, got {ratio}");
    }
}
