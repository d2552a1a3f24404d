//! Restart fidelity: open positions survive a process restart byte for byte,
//! monitoring resumes immediately, and protective orders are retained when
//! still live on the exchange or re-created when lost.

use cryptoflow::application::execution::{ExecutionAgent, ExecutionConfig};
use cryptoflow::domain::order::{OrderKind, OrderStatus, ValidatedOrder};
use cryptoflow::domain::repositories::{OrderRepository, PositionRepository};
use cryptoflow::domain::types::OrderSide;
use cryptoflow::framework::Agent;
use cryptoflow::infrastructure::bus::InMemoryBus;
use cryptoflow::infrastructure::mock::MockExchange;
use cryptoflow::infrastructure::persistence::Database;
use cryptoflow::infrastructure::persistence::repositories::{
    SqliteOrderRepository, SqlitePositionRepository, SqliteSnapshotRepository,
    SqliteTradeRepository,
};
use cryptoflow::infrastructure::timeseries::SqliteCandleStore;
use cryptoflow::messaging::{Envelope, Payload};

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

struct Stores {
    orders: Arc<SqliteOrderRepository>,
    positions: Arc<SqlitePositionRepository>,
    trades: Arc<SqliteTradeRepository>,
    snapshots: Arc<SqliteSnapshotRepository>,
    candles: Arc<SqliteCandleStore>,
}

impl Stores {
    fn new(db: &Database) -> Self {
        Self {
            orders: Arc::new(SqliteOrderRepository::new(db.pool.clone())),
            positions: Arc::new(SqlitePositionRepository::new(db.pool.clone())),
            trades: Arc::new(SqliteTradeRepository::new(db.pool.clone())),
            snapshots: Arc::new(SqliteSnapshotRepository::new(db.pool.clone())),
            candles: Arc::new(SqliteCandleStore::new(db.pool.clone())),
        }
    }
}

fn build_execution(
    bus: Arc<InMemoryBus>,
    exchange: Arc<MockExchange>,
    stores: &Stores,
) -> ExecutionAgent {
    ExecutionAgent::new(
        ExecutionConfig::default(),
        bus,
        exchange,
        stores.candles.clone(),
        stores.orders.clone(),
        stores.positions.clone(),
        stores.trades.clone(),
        stores.snapshots.clone(),
    )
}

fn validated(symbol: &str, price: Decimal, qty: Decimal) -> ValidatedOrder {
    ValidatedOrder {
        order_id: Uuid::new_v4(),
        intent_id: Uuid::new_v4(),
        symbol: symbol.to_string(),
        side: OrderSide::Buy,
        quantity: qty,
        expected_price: price,
        stop_loss: price * dec!(0.975),
        take_profit: price * dec!(1.05),
        reserved_usd: price * qty,
    }
}

#[tokio::test]
async fn test_open_positions_survive_restart() {
    let db = Database::in_memory().await.unwrap();
    let stores = Stores::new(&db);
    let bus = Arc::new(InMemoryBus::new());
    let exchange = Arc::new(MockExchange::with_balance(dec!(10000)));

    exchange.set_price("BTC/USDT", dec!(120000)).await;
    exchange.set_price("ETH/USDT", dec!(3000)).await;

    // Session one: open two positions, then the process dies without
    // ceremony.
    {
        let agent = build_execution(bus.clone(), exchange.clone(), &stores);
        agent
            .handle(Envelope::new(
                "risk_manager",
                Payload::Order(validated("BTC/USDT", dec!(120000), dec!(0.001))),
            ))
            .await
            .unwrap();
        agent
            .handle(Envelope::new(
                "risk_manager",
                Payload::Order(validated("ETH/USDT", dec!(3000), dec!(0.05))),
            ))
            .await
            .unwrap();
    }

    let before: HashSet<Uuid> = stores
        .positions
        .find_open()
        .await
        .unwrap()
        .iter()
        .map(|p| p.id)
        .collect();
    assert_eq!(before.len(), 2);

    // Session two: same stores, same exchange. Recovery must reload the
    // exact open set and keep the still-live protective orders.
    let agent = build_execution(bus.clone(), exchange.clone(), &stores);
    agent.initialize().await.unwrap();

    let after: HashSet<Uuid> = stores
        .positions
        .find_open()
        .await
        .unwrap()
        .iter()
        .map(|p| p.id)
        .collect();
    assert_eq!(before, after, "the open set must survive the restart");

    for id in &after {
        let records = stores.orders.find_by_position(*id).await.unwrap();
        let live_sl = records
            .iter()
            .filter(|r| r.kind == OrderKind::StopLoss && !r.status.is_terminal())
            .count();
        let live_tp = records
            .iter()
            .filter(|r| r.kind == OrderKind::TakeProfit && !r.status.is_terminal())
            .count();
        assert_eq!(live_sl, 1, "exactly one live stop-loss after recovery");
        assert_eq!(live_tp, 1, "exactly one live take-profit after recovery");
    }

    // Monitoring resumes on the first tick: prices move, marks follow.
    exchange.set_price("BTC/USDT", dec!(121000)).await;
    exchange.set_price("ETH/USDT", dec!(3050)).await;
    agent.tick().await.unwrap();

    let btc = stores
        .positions
        .find_open_by_symbol("paper", "BTC/USDT")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(btc.current_price, dec!(121000));
    assert_eq!(btc.unrealized_pnl, (dec!(121000) - dec!(120000)) * dec!(0.001));
}

#[tokio::test]
async fn test_lost_protective_orders_are_recreated() {
    let db = Database::in_memory().await.unwrap();
    let stores = Stores::new(&db);
    let bus = Arc::new(InMemoryBus::new());

    // Session one places everything on exchange A.
    let exchange_a = Arc::new(MockExchange::with_balance(dec!(10000)));
    exchange_a.set_price("BTC/USDT", dec!(120000)).await;
    {
        let agent = build_execution(bus.clone(), exchange_a.clone(), &stores);
        agent
            .handle(Envelope::new(
                "risk_manager",
                Payload::Order(validated("BTC/USDT", dec!(120000), dec!(0.001))),
            ))
            .await
            .unwrap();
    }
    let position = stores
        .positions
        .find_open_by_symbol("paper", "BTC/USDT")
        .await
        .unwrap()
        .unwrap();

    // Session two comes up against an exchange that lost the orders.
    let exchange_b = Arc::new(MockExchange::with_balance(dec!(10000)));
    exchange_b.set_price("BTC/USDT", dec!(120000)).await;
    let agent = build_execution(bus.clone(), exchange_b.clone(), &stores);
    agent.initialize().await.unwrap();

    let records = stores.orders.find_by_position(position.id).await.unwrap();
    let live_sl: Vec<_> = records
        .iter()
        .filter(|r| r.kind == OrderKind::StopLoss && !r.status.is_terminal())
        .collect();
    let dead_sl: Vec<_> = records
        .iter()
        .filter(|r| r.kind == OrderKind::StopLoss && r.status == OrderStatus::Cancelled)
        .collect();
    assert_eq!(live_sl.len(), 1, "a fresh stop-loss must be armed");
    assert_eq!(dead_sl.len(), 1, "the lost stop-loss is closed out");
    assert!(
        live_sl[0].exchange_order_id.is_some(),
        "the fresh stop-loss lives on the new exchange"
    );
}
