use crate::domain::order::{OrderStatusEvent, ValidatedOrder};
use crate::domain::position::Position;
use crate::domain::signal::{Signal, TradeIntent};
use crate::domain::types::{Candle, Ticker};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Wire schema version stamped on every envelope. Consumers reject mismatches
/// hard; unknown optional payload fields are ignored.
pub const SCHEMA_VERSION: u16 = 1;

/// Canonical topic taxonomy. Per-symbol topics carry the symbol in the name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    MarketTick(String),
    MarketOhlcv(String),
    SignalsTech,
    TradeIntent,
    TradeOrder,
    OrderStatus,
    PositionUpdate,
    Diagnostics,
}

impl Topic {
    pub fn name(&self) -> String {
        match self {
            Topic::MarketTick(symbol) => format!("market.tick.{}", symbol),
            Topic::MarketOhlcv(symbol) => format!("market.ohlcv.{}", symbol),
            Topic::SignalsTech => "signals.tech".to_string(),
            Topic::TradeIntent => "trade.intent".to_string(),
            Topic::TradeOrder => "trade.order".to_string(),
            Topic::OrderStatus => "order.status".to_string(),
            Topic::PositionUpdate => "position.update".to_string(),
            Topic::Diagnostics => "agent.diagnostics".to_string(),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Out-of-band event published on the diagnostics topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticEvent {
    pub agent: String,
    /// "agent_error", "stream_degraded", "stream_resumed", ...
    pub kind: String,
    pub detail: String,
}

/// Fixed message taxonomy carried by envelopes. Tagged so that decoding an
/// unknown variant fails hard (contract error) while unknown optional fields
/// inside a known variant are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Payload {
    Tick(Ticker),
    Ohlcv(Candle),
    Signal(Signal),
    Intent(TradeIntent),
    Order(ValidatedOrder),
    OrderStatus(OrderStatusEvent),
    Position(Position),
    Diagnostic(DiagnosticEvent),
}

/// Transport envelope common to every message on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: Uuid,
    pub source_agent: String,
    /// Unix millis.
    pub timestamp: i64,
    pub schema_version: u16,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(source_agent: &str, payload: Payload) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            source_agent: source_agent.to_string(),
            timestamp: Utc::now().timestamp_millis(),
            schema_version: SCHEMA_VERSION,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::signal::{IndicatorSnapshot, SignalKind};

    #[test]
    fn test_envelope_json_round_trip() {
        let signal = Signal::new(
            "ETH/USDT",
            "macd",
            SignalKind::Sell,
            0.72,
            1_700_000_000_000,
            IndicatorSnapshot {
                macd_hist: Some(-12.5),
                atr: Some(40.0),
                ..Default::default()
            },
        );
        let envelope = Envelope::new("technical_analysis", Payload::Signal(signal));

        let json = serde_json::to_string(&envelope).unwrap();
        let decoded: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_unknown_payload_variant_is_rejected() {
        let json = r#"{
            "message_id": "0b2f6f6e-9a51-4d0e-8f3c-2f6a39f2f001",
            "source_agent": "x",
            "timestamp": 0,
            "schema_version": 1,
            "payload": {"type": "FutureThing", "data": {}}
        }"#;
        assert!(serde_json::from_str::<Envelope>(json).is_err());
    }

    #[test]
    fn test_unknown_optional_field_is_ignored() {
        let json = r#"{
            "message_id": "0b2f6f6e-9a51-4d0e-8f3c-2f6a39f2f001",
            "source_agent": "x",
            "timestamp": 0,
            "schema_version": 1,
            "payload": {"type": "Diagnostic", "data": {
                "agent": "data_collection",
                "kind": "stream_degraded",
                "detail": "BTC/USDT silent for 91s",
                "some_future_field": 42
            }}
        }"#;
        let decoded: Envelope = serde_json::from_str(json).unwrap();
        match decoded.payload {
            Payload::Diagnostic(d) => assert_eq!(d.kind, "stream_degraded"),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_topic_names() {
        assert_eq!(Topic::MarketTick("BTC/USDT".into()).name(), "market.tick.BTC/USDT");
        assert_eq!(Topic::SignalsTech.name(), "signals.tech");
        assert_eq!(Topic::OrderStatus.name(), "order.status");
    }
}
