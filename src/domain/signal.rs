use crate::domain::types::OrderSide;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Direction of a technical signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalKind {
    Buy,
    Sell,
    Hold,
}

impl SignalKind {
    pub fn as_side(&self) -> Option<OrderSide> {
        match self {
            SignalKind::Buy => Some(OrderSide::Buy),
            SignalKind::Sell => Some(OrderSide::Sell),
            SignalKind::Hold => None,
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalKind::Buy => write!(f, "BUY"),
            SignalKind::Sell => write!(f, "SELL"),
            SignalKind::Hold => write!(f, "HOLD"),
        }
    }
}

/// Indicator values at the moment a signal was derived. All values come from
/// the rolling candle window; fields are None until the window covers the
/// indicator's lookback.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    /// Close of the newest candle in the window the snapshot was taken from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rsi: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub macd_line: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub macd_signal: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub macd_hist: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sma_20: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sma_50: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ema_12: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ema_26: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bb_upper: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bb_middle: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bb_lower: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atr: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub obv: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stoch_k: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stoch_d: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adx: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_ratio: Option<f64>,
}

/// A confidence-scored signal emitted by TechnicalAnalysis for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: Uuid,
    pub symbol: String,
    /// Indicator family that produced the signal ("rsi", "macd", "bollinger", ...).
    pub source: String,
    pub kind: SignalKind,
    pub confidence: f64,
    /// Unix millis.
    pub emitted_at: i64,
    pub indicators: IndicatorSnapshot,
}

impl Signal {
    pub fn new(
        symbol: impl Into<String>,
        source: impl Into<String>,
        kind: SignalKind,
        confidence: f64,
        emitted_at: i64,
        indicators: IndicatorSnapshot,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol: symbol.into(),
            source: source.into(),
            kind,
            confidence: confidence.clamp(0.0, 1.0),
            emitted_at,
            indicators,
        }
    }
}

/// One signal's contribution to a fused decision, kept for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalContribution {
    pub source: String,
    pub kind: SignalKind,
    pub confidence: f64,
    pub age_ms: i64,
}

/// Per-kind scores produced by a fusion strategy, normalized to [0, 1].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct KindScores {
    pub buy: f64,
    pub sell: f64,
    pub hold: f64,
}

impl KindScores {
    /// Winning kind and its score. Ties break to HOLD.
    pub fn argmax(&self) -> (SignalKind, f64) {
        if self.buy > self.sell && self.buy > self.hold {
            (SignalKind::Buy, self.buy)
        } else if self.sell > self.buy && self.sell > self.hold {
            (SignalKind::Sell, self.sell)
        } else {
            (SignalKind::Hold, self.hold)
        }
    }
}

/// Audit metadata describing how a decision was fused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionMeta {
    pub strategy: String,
    pub buffer_size: usize,
    pub contributing: Vec<SignalContribution>,
    pub scores: KindScores,
}

/// Desired trade emitted by Strategy after fusion, before risk sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeIntent {
    pub id: Uuid,
    pub symbol: String,
    pub action: OrderSide,
    pub confidence: f64,
    pub expected_price: Decimal,
    pub fusion: FusionMeta,
    /// Unix millis.
    pub created_at: i64,
}

/// Every fusion decision (emitted or not) is persisted for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyDecision {
    pub id: Uuid,
    pub symbol: String,
    pub action: SignalKind,
    pub confidence: f64,
    pub emitted: bool,
    pub reason: String,
    pub fusion: FusionMeta,
    /// Unix millis.
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_confidence_is_clamped() {
        let s = Signal::new(
            "BTC/USDT",
            "rsi",
            SignalKind::Buy,
            1.7,
            0,
            IndicatorSnapshot::default(),
        );
        assert_eq!(s.confidence, 1.0);

        let s = Signal::new(
            "BTC/USDT",
            "rsi",
            SignalKind::Sell,
            -0.2,
            0,
            IndicatorSnapshot::default(),
        );
        assert_eq!(s.confidence, 0.0);
    }

    #[test]
    fn test_kind_scores_ties_break_to_hold() {
        let scores = KindScores {
            buy: 0.5,
            sell: 0.5,
            hold: 0.1,
        };
        assert_eq!(scores.argmax().0, SignalKind::Hold);

        let scores = KindScores {
            buy: 0.6,
            sell: 0.5,
            hold: 0.1,
        };
        assert_eq!(scores.argmax(), (SignalKind::Buy, 0.6));
    }
}
