//! Stop-loss supervision end to end: a price print through the stop closes
//! the position within one monitoring interval, cancels the sibling
//! take-profit, and publishes the terminal position update.

use cryptoflow::application::execution::{ExecutionAgent, ExecutionConfig};
use cryptoflow::domain::order::{OrderKind, OrderStatus, ValidatedOrder};
use cryptoflow::domain::position::PositionStatus;
use cryptoflow::domain::repositories::{OrderRepository, PositionRepository};
use cryptoflow::domain::types::OrderSide;
use cryptoflow::framework::AgentRunner;
use cryptoflow::infrastructure::bus::InMemoryBus;
use cryptoflow::infrastructure::mock::MockExchange;
use cryptoflow::infrastructure::persistence::Database;
use cryptoflow::infrastructure::persistence::repositories::{
    SqliteOrderRepository, SqlitePositionRepository, SqliteSnapshotRepository,
    SqliteTradeRepository,
};
use cryptoflow::infrastructure::timeseries::SqliteCandleStore;
use cryptoflow::messaging::{MessageBus, Payload, Topic};

use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[tokio::test]
async fn test_stop_loss_fires_within_one_interval() {
    let db = Database::in_memory().await.unwrap();
    let bus = Arc::new(InMemoryBus::new());
    let exchange = Arc::new(MockExchange::with_balance(dec!(10000)));
    let orders_repo = Arc::new(SqliteOrderRepository::new(db.pool.clone()));
    let positions_repo = Arc::new(SqlitePositionRepository::new(db.pool.clone()));

    let config = ExecutionConfig {
        monitoring_interval: Duration::from_millis(100),
        ..Default::default()
    };
    let execution = Arc::new(ExecutionAgent::new(
        config,
        bus.clone(),
        exchange.clone(),
        Arc::new(SqliteCandleStore::new(db.pool.clone())),
        orders_repo.clone(),
        positions_repo.clone(),
        Arc::new(SqliteTradeRepository::new(db.pool.clone())),
        Arc::new(SqliteSnapshotRepository::new(db.pool.clone())),
    ));

    exchange.set_price("BTC/USDT", dec!(120000)).await;
    let mut position_rx = bus.subscribe(&Topic::PositionUpdate, "observer").await;
    let runner = AgentRunner::spawn(execution, bus.clone()).await.unwrap();

    // Open LONG 0.001 @ 120000, SL 117000, TP 126000.
    let order = ValidatedOrder {
        order_id: Uuid::new_v4(),
        intent_id: Uuid::new_v4(),
        symbol: "BTC/USDT".to_string(),
        side: OrderSide::Buy,
        quantity: dec!(0.001),
        expected_price: dec!(120000),
        stop_loss: dec!(117000),
        take_profit: dec!(126000),
        reserved_usd: dec!(120),
    };
    bus.publish(&Topic::TradeOrder, Payload::Order(order), "risk_manager")
        .await
        .unwrap();

    // First update: the open.
    let update = tokio::time::timeout(Duration::from_secs(5), position_rx.recv())
        .await
        .expect("position should open")
        .unwrap();
    let position_id = match &update.envelope.payload {
        Payload::Position(p) => {
            assert_eq!(p.status, PositionStatus::Open);
            p.id
        }
        other => panic!("unexpected payload {:?}", other),
    };
    update.ack().await;

    // The market prints through the stop.
    exchange.set_price("BTC/USDT", dec!(116950)).await;

    let update = tokio::time::timeout(Duration::from_secs(5), position_rx.recv())
        .await
        .expect("stop should fire within one monitoring interval")
        .unwrap();
    match &update.envelope.payload {
        Payload::Position(p) => {
            assert_eq!(p.status, PositionStatus::Closed);
            assert_eq!(p.quantity, dec!(0));
            // The close fills at the print on the paper exchange.
            assert_eq!(p.realized_pnl, (dec!(116950) - dec!(120000)) * dec!(0.001));
        }
        other => panic!("unexpected payload {:?}", other),
    }
    update.ack().await;

    runner.shutdown().await;

    // Stored state agrees: position closed, stop filled, take-profit
    // cancelled.
    let stored = positions_repo.get(position_id).await.unwrap().unwrap();
    assert_eq!(stored.status, PositionStatus::Closed);
    assert!(stored.closed_at.is_some());

    let records = orders_repo.find_by_position(position_id).await.unwrap();
    let sl = records
        .iter()
        .find(|r| r.kind == OrderKind::StopLoss)
        .expect("stop-loss record");
    let tp = records
        .iter()
        .find(|r| r.kind == OrderKind::TakeProfit)
        .expect("take-profit record");
    assert_eq!(sl.status, OrderStatus::Filled);
    assert_eq!(tp.status, OrderStatus::Cancelled);
    if let Some(exchange_id) = &tp.exchange_order_id {
        assert_eq!(
            exchange.order_status(exchange_id).await,
            Some(OrderStatus::Cancelled)
        );
    }

    assert!(positions_repo.find_open().await.unwrap().is_empty());
}
