//! Exchange minimum-lot boundary: a quantity below the minimum is raised to
//! it and re-validated, or the trade is rejected when the raised size blows
//! the budget.

use cryptoflow::application::risk::sizing::{SizingConfig, SizingMethod};
use cryptoflow::application::risk::stops::{StopConfig, StopMethod};
use cryptoflow::application::risk::{RiskConfig, RiskManager};
use cryptoflow::domain::signal::{FusionMeta, KindScores, TradeIntent};
use cryptoflow::domain::types::OrderSide;
use cryptoflow::framework::Agent;
use cryptoflow::infrastructure::bus::InMemoryBus;
use cryptoflow::infrastructure::mock::MockExchange;
use cryptoflow::infrastructure::persistence::Database;
use cryptoflow::infrastructure::persistence::repositories::{
    SqliteAssessmentRepository, SqlitePositionRepository,
};
use cryptoflow::infrastructure::timeseries::SqliteCandleStore;
use cryptoflow::messaging::{Envelope, MessageBus, Payload, Topic};

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use uuid::Uuid;

fn intent(confidence: f64, expected_price: Decimal) -> TradeIntent {
    TradeIntent {
        id: Uuid::new_v4(),
        symbol: "SOL/USDT".to_string(),
        action: OrderSide::Buy,
        confidence,
        expected_price,
        fusion: FusionMeta {
            strategy: "hybrid".to_string(),
            buffer_size: 2,
            contributing: Vec::new(),
            scores: KindScores::default(),
        },
        created_at: 0,
    }
}

/// Volatility sizing against a wide percent stop keeps the computed quantity
/// deliberately below one lot.
fn small_quantity_config() -> RiskConfig {
    RiskConfig {
        max_risk_per_trade_pct: dec!(0.05),
        sizing: SizingConfig {
            method: SizingMethod::Volatility,
            vol_risk_pct: dec!(0.01),
            ..Default::default()
        },
        stop: StopConfig {
            method: StopMethod::PercentOfPrice,
            percent: dec!(0.2),
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn build(
    balance: Decimal,
    min_lot: Decimal,
) -> (Arc<InMemoryBus>, Arc<SqliteAssessmentRepository>, Arc<RiskManager>) {
    let db = Database::in_memory().await.unwrap();
    let bus = Arc::new(InMemoryBus::new());
    let exchange = Arc::new(MockExchange::with_balance(balance));
    exchange.set_min_lot(min_lot).await;
    let assessments = Arc::new(SqliteAssessmentRepository::new(db.pool.clone()));

    let risk = Arc::new(RiskManager::new(
        small_quantity_config(),
        bus.clone(),
        exchange,
        Arc::new(SqliteCandleStore::new(db.pool.clone())),
        assessments.clone(),
        Arc::new(SqlitePositionRepository::new(db.pool.clone())),
    ));
    risk.initialize().await.unwrap();
    (bus, assessments, risk)
}

#[tokio::test]
async fn test_quantity_below_min_lot_is_raised() {
    // Balance 1000, price 100, stop 20: risk sizing wants 0.5 units; the
    // exchange minimum is 1.
    let (bus, _assessments, risk) = build(dec!(1000), dec!(1)).await;
    let mut order_rx = bus.subscribe(&Topic::TradeOrder, "test").await;

    risk.handle(Envelope::new("strategy", Payload::Intent(intent(0.70, dec!(100)))))
        .await
        .unwrap();

    let delivery = order_rx.recv().await.unwrap();
    match &delivery.envelope.payload {
        Payload::Order(order) => {
            assert_eq!(order.quantity, dec!(1));
            assert_eq!(order.reserved_usd, dec!(100));
        }
        other => panic!("unexpected payload {:?}", other),
    }
    delivery.ack().await;
}

#[tokio::test]
async fn test_min_lot_beyond_budget_is_rejected() {
    // Raising 0.5 -> 10 units would cost 1000, past the 10% tier ceiling.
    let (bus, assessments, risk) = build(dec!(1000), dec!(10)).await;
    let mut order_rx = bus.subscribe(&Topic::TradeOrder, "test").await;

    let intent = intent(0.70, dec!(100));
    let intent_id = intent.id;
    let result = risk
        .handle(Envelope::new("strategy", Payload::Intent(intent)))
        .await;
    assert!(result.is_err(), "domain rejection surfaces as a handler error");

    assert!(order_rx.try_recv().is_err(), "no order may be published");

    let recorded = assessments.find_by_intent(intent_id).await.unwrap();
    assert_eq!(recorded.len(), 1);
    assert!(!recorded[0].approved);
    assert_eq!(recorded[0].reasons, vec!["below_min_lot_exceeds_budget".to_string()]);
}
