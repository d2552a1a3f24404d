//! Execution agent: places validated orders, tracks fills into positions,
//! supervises stop-loss / take-profit exits, and persists every state change.

pub mod quality;

use crate::application::risk::stops::{self, TrailingConfig};
use crate::domain::errors::{ExchangeError, PipelineError};
use crate::domain::order::{OrderKind, OrderRecord, OrderStatus, OrderStatusEvent, ValidatedOrder};
use crate::domain::ports::{CandleStore, ExchangeAdapter, FetchedOrder, OrderRequest};
use crate::domain::position::{LifecycleState, Position, PositionSide, PositionStatus};
use crate::domain::repositories::{
    OrderRepository, PerformanceSnapshot, PositionRepository, SnapshotRepository, TradeFill,
    TradeRepository,
};
use crate::framework::{Agent, RetryPolicy};
use crate::messaging::{Envelope, MessageBus, Payload, Topic};
use async_trait::async_trait;
use chrono::Utc;
use quality::QualityRollup;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Exchange tag stamped on positions.
    pub exchange: String,
    pub monitoring_interval: Duration,
    /// Deadline for a single place_order call.
    pub place_deadline: Duration,
    /// Deadline for waiting on a fill after placement.
    pub fill_deadline: Duration,
    /// Fills worse than this are flagged in the log.
    pub max_slippage_pct: f64,
    /// Performance snapshot cadence, in monitor ticks.
    pub snapshot_every_ticks: u64,
    pub trailing: TrailingConfig,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            exchange: "paper".to_string(),
            monitoring_interval: Duration::from_secs(10),
            place_deadline: Duration::from_secs(5),
            fill_deadline: Duration::from_secs(30),
            max_slippage_pct: 1.0,
            snapshot_every_ticks: 6,
            trailing: TrailingConfig::default(),
        }
    }
}

/// Per-symbol slot guarding the position state machine. One OPEN position per
/// (exchange, symbol) is enforced by taking this lock for every transition.
struct PositionSlot {
    state: LifecycleState,
    position: Option<Position>,
    sl_order: Option<OrderRecord>,
    tp_order: Option<OrderRecord>,
    intent_id: Option<Uuid>,
    stop_distance: Decimal,
}

impl PositionSlot {
    fn empty() -> Self {
        Self {
            state: LifecycleState::None,
            position: None,
            sl_order: None,
            tp_order: None,
            intent_id: None,
            stop_distance: Decimal::ZERO,
        }
    }

    fn occupied(&self) -> bool {
        matches!(
            self.state,
            LifecycleState::Opening
                | LifecycleState::Open
                | LifecycleState::Reducing
                | LifecycleState::Closing
        )
    }
}

pub struct ExecutionAgent {
    config: ExecutionConfig,
    bus: Arc<dyn MessageBus>,
    exchange: Arc<dyn ExchangeAdapter>,
    candle_store: Arc<dyn CandleStore>,
    orders: Arc<dyn OrderRepository>,
    positions: Arc<dyn PositionRepository>,
    trades: Arc<dyn TradeRepository>,
    snapshots: Arc<dyn SnapshotRepository>,
    slots: RwLock<HashMap<String, Arc<Mutex<PositionSlot>>>>,
    quality: Mutex<QualityRollup>,
    realized_total: Mutex<Decimal>,
    ticks: AtomicU64,
    retry: RetryPolicy,
}

impl ExecutionAgent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ExecutionConfig,
        bus: Arc<dyn MessageBus>,
        exchange: Arc<dyn ExchangeAdapter>,
        candle_store: Arc<dyn CandleStore>,
        orders: Arc<dyn OrderRepository>,
        positions: Arc<dyn PositionRepository>,
        trades: Arc<dyn TradeRepository>,
        snapshots: Arc<dyn SnapshotRepository>,
    ) -> Self {
        Self {
            config,
            bus,
            exchange,
            candle_store,
            orders,
            positions,
            trades,
            snapshots,
            slots: RwLock::new(HashMap::new()),
            quality: Mutex::new(QualityRollup::default()),
            realized_total: Mutex::new(Decimal::ZERO),
            ticks: AtomicU64::new(0),
            retry: RetryPolicy::default(),
        }
    }

    async fn slot(&self, symbol: &str) -> Arc<Mutex<PositionSlot>> {
        {
            let slots = self.slots.read().await;
            if let Some(slot) = slots.get(symbol) {
                return slot.clone();
            }
        }
        let mut slots = self.slots.write().await;
        slots
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(PositionSlot::empty())))
            .clone()
    }

    async fn publish_status(&self, event: OrderStatusEvent) {
        if let Err(e) = self
            .bus
            .publish(&Topic::OrderStatus, Payload::OrderStatus(event), self.name())
            .await
        {
            error!("Execution: failed to publish order status: {}", e);
        }
    }

    async fn publish_position(&self, position: &Position) {
        if let Err(e) = self
            .bus
            .publish(
                &Topic::PositionUpdate,
                Payload::Position(position.clone()),
                self.name(),
            )
            .await
        {
            error!("Execution: failed to publish position update: {}", e);
        }
    }

    async fn save_record(&self, record: &OrderRecord) {
        if let Err(e) = self
            .retry
            .run("persist order record", || async { self.orders.save(record).await })
            .await
        {
            error!(
                "Execution: failed to persist order record {}: {:#}",
                record.order_id, e
            );
        }
    }

    async fn save_position(&self, position: &Position) {
        if let Err(e) = self
            .retry
            .run("persist position", || async { self.positions.save(position).await })
            .await
        {
            error!("Execution: failed to persist position {}: {:#}", position.id, e);
        }
    }

    async fn place_with_deadline(&self, request: &OrderRequest) -> Result<String, ExchangeError> {
        self.retry
            .run("place order", || async {
                match tokio::time::timeout(self.config.place_deadline, self.exchange.place_order(request))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ExchangeError::Timeout(self.config.place_deadline)),
                }
            })
            .await
    }

    /// Polls the exchange until the order reaches a terminal state or the
    /// fill deadline passes.
    async fn await_fill(
        &self,
        exchange_order_id: &str,
        symbol: &str,
    ) -> Result<FetchedOrder, ExchangeError> {
        let deadline = tokio::time::Instant::now() + self.config.fill_deadline;
        loop {
            let fetched = self.exchange.fetch_order(exchange_order_id, symbol).await?;
            if fetched.status.is_terminal() {
                return Ok(fetched);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ExchangeError::Timeout(self.config.fill_deadline));
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    async fn place_protective(
        &self,
        position: &Position,
        kind: OrderKind,
        trigger: Decimal,
        now: i64,
    ) -> OrderRecord {
        let order_id = Uuid::new_v4();
        let request = OrderRequest {
            client_order_id: order_id.to_string(),
            symbol: position.symbol.clone(),
            side: position.side.closing_side(),
            kind,
            quantity: position.quantity,
            price: Some(trigger),
            reduce_only: true,
        };

        let exchange_order_id = match self.place_with_deadline(&request).await {
            Ok(id) => Some(id),
            Err(e) => {
                // Local trigger simulation covers the position either way.
                warn!(
                    "Execution [{}]: {} placement failed ({}); relying on local triggers",
                    position.symbol, kind, e
                );
                None
            }
        };

        let record = OrderRecord {
            order_id,
            exchange_order_id,
            symbol: position.symbol.clone(),
            side: request.side,
            kind,
            status: OrderStatus::Open,
            quantity: position.quantity,
            price: Some(trigger),
            filled_qty: Decimal::ZERO,
            avg_fill_price: None,
            position_id: Some(position.id),
            created_at: now,
            updated_at: now,
        };
        self.save_record(&record).await;
        record
    }

    async fn on_validated_order(&self, order: ValidatedOrder) -> Result<(), PipelineError> {
        let now = Utc::now().timestamp_millis();
        let slot_arc = self.slot(&order.symbol).await;
        let mut slot = slot_arc.lock().await;

        // One OPEN position per (exchange, symbol): a busy slot or a
        // persisted open position rejects the order outright.
        let persisted_open = self
            .positions
            .find_open_by_symbol(&self.config.exchange, &order.symbol)
            .await
            .unwrap_or(None);
        if slot.occupied() || persisted_open.is_some() {
            warn!(
                "Execution [{}]: rejecting order {}, position already open",
                order.symbol, order.order_id
            );
            let record = OrderRecord {
                order_id: order.order_id,
                exchange_order_id: None,
                symbol: order.symbol.clone(),
                side: order.side,
                kind: OrderKind::Market,
                status: OrderStatus::Rejected,
                quantity: order.quantity,
                price: None,
                filled_qty: Decimal::ZERO,
                avg_fill_price: None,
                position_id: None,
                created_at: now,
                updated_at: now,
            };
            self.save_record(&record).await;
            self.publish_status(OrderStatusEvent {
                order_id: order.order_id,
                status: OrderStatus::Rejected,
                filled_qty: Decimal::ZERO,
                avg_price: None,
                fee: Decimal::ZERO,
                ts: now,
                intent_id: Some(order.intent_id),
                realized_pnl: None,
            })
            .await;
            return Ok(());
        }

        slot.state = LifecycleState::Opening;
        let mut record = OrderRecord {
            order_id: order.order_id,
            exchange_order_id: None,
            symbol: order.symbol.clone(),
            side: order.side,
            kind: OrderKind::Market,
            status: OrderStatus::Pending,
            quantity: order.quantity,
            price: None,
            filled_qty: Decimal::ZERO,
            avg_fill_price: None,
            position_id: None,
            created_at: now,
            updated_at: now,
        };
        self.save_record(&record).await;

        let request = OrderRequest {
            client_order_id: order.order_id.to_string(),
            symbol: order.symbol.clone(),
            side: order.side,
            kind: OrderKind::Market,
            quantity: order.quantity,
            price: None,
            reduce_only: false,
        };
        let placed_at = tokio::time::Instant::now();

        let fetched = match self.place_with_deadline(&request).await {
            Ok(exchange_order_id) => {
                record.exchange_order_id = Some(exchange_order_id.clone());
                self.await_fill(&exchange_order_id, &order.symbol).await
            }
            Err(e) => Err(e),
        };

        let fetched = match fetched {
            Ok(f) if f.status == OrderStatus::Filled && f.filled_qty > Decimal::ZERO => f,
            Ok(f) => {
                // Terminal but not filled: the exchange rejected or cancelled.
                let status = if f.status == OrderStatus::Cancelled {
                    OrderStatus::Cancelled
                } else {
                    OrderStatus::Rejected
                };
                let _ = record.transition(status, Utc::now().timestamp_millis());
                self.save_record(&record).await;
                self.publish_status(OrderStatusEvent {
                    order_id: order.order_id,
                    status,
                    filled_qty: f.filled_qty,
                    avg_price: f.avg_price,
                    fee: f.fee,
                    ts: Utc::now().timestamp_millis(),
                    intent_id: Some(order.intent_id),
                    realized_pnl: None,
                })
                .await;
                slot.state = LifecycleState::None;
                return Ok(());
            }
            Err(e) => {
                warn!(
                    "Execution [{}]: order {} failed after retries: {}",
                    order.symbol, order.order_id, e
                );
                let _ = record.transition(OrderStatus::Failed, Utc::now().timestamp_millis());
                self.save_record(&record).await;
                self.publish_status(OrderStatusEvent {
                    order_id: order.order_id,
                    status: OrderStatus::Failed,
                    filled_qty: Decimal::ZERO,
                    avg_price: None,
                    fee: Decimal::ZERO,
                    ts: Utc::now().timestamp_millis(),
                    intent_id: Some(order.intent_id),
                    realized_pnl: None,
                })
                .await;
                slot.state = LifecycleState::None;
                return Ok(());
            }
        };

        let latency_ms = placed_at.elapsed().as_millis() as f64;
        let fill_price = fetched.avg_price.unwrap_or(order.expected_price);
        let now = Utc::now().timestamp_millis();

        // Partial fills fold into the running average entry while the slot
        // stays OPENING; a market fill arrives whole from the adapter.
        let mut position = Position {
            id: Uuid::new_v4(),
            exchange: self.config.exchange.clone(),
            symbol: order.symbol.clone(),
            side: PositionSide::from_entry_side(order.side),
            quantity: Decimal::ZERO,
            avg_entry: Decimal::ZERO,
            current_price: fill_price,
            stop_loss: order.stop_loss,
            take_profit: order.take_profit,
            unrealized_pnl: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            status: PositionStatus::Open,
            opened_at: now,
            closed_at: None,
            intent_id: Some(order.intent_id),
        };
        position.add_fill(fetched.filled_qty, fill_price);
        position.mark(fill_price);

        record.position_id = Some(position.id);
        record.filled_qty = fetched.filled_qty;
        record.avg_fill_price = Some(fill_price);
        let _ = record.transition(OrderStatus::Filled, now);

        self.save_position(&position).await;
        self.save_record(&record).await;
        if let Err(e) = self
            .trades
            .save(&TradeFill {
                id: Uuid::new_v4(),
                order_id: order.order_id,
                symbol: order.symbol.clone(),
                side: order.side,
                quantity: fetched.filled_qty,
                price: fill_price,
                fee: fetched.fee,
                executed_at: now,
            })
            .await
        {
            error!("Execution: failed to persist fill: {:#}", e);
        }

        let slippage = quality::slippage_pct(order.side, order.expected_price, fill_price);
        let fee_pct = if order.expected_price > Decimal::ZERO && fetched.filled_qty > Decimal::ZERO {
            (fetched.fee / (fill_price * fetched.filled_qty) * Decimal::ONE_HUNDRED)
                .to_f64()
                .unwrap_or(0.0)
        } else {
            0.0
        };
        let score = quality::quality_score(slippage, fee_pct, latency_ms);
        if slippage > self.config.max_slippage_pct {
            warn!(
                "Execution [{}]: slippage {:.3}% exceeds limit {:.2}%",
                order.symbol, slippage, self.config.max_slippage_pct
            );
        }
        self.quality.lock().await.record(&order.symbol, slippage, score);

        let sl = self
            .place_protective(&position, OrderKind::StopLoss, order.stop_loss, now)
            .await;
        let tp = self
            .place_protective(&position, OrderKind::TakeProfit, order.take_profit, now)
            .await;

        slot.state = LifecycleState::Open;
        slot.position = Some(position.clone());
        slot.sl_order = Some(sl);
        slot.tp_order = Some(tp);
        slot.intent_id = Some(order.intent_id);
        slot.stop_distance = (position.avg_entry - order.stop_loss).abs();
        drop(slot);

        info!(
            "Execution [{}]: filled {} {} @ {} (slippage {:.3}%, quality {:.0})",
            order.symbol, order.side, fetched.filled_qty, fill_price, slippage, score
        );
        self.publish_status(OrderStatusEvent {
            order_id: order.order_id,
            status: OrderStatus::Filled,
            filled_qty: fetched.filled_qty,
            avg_price: Some(fill_price),
            fee: fetched.fee,
            ts: now,
            intent_id: Some(order.intent_id),
            realized_pnl: None,
        })
        .await;
        self.publish_position(&position).await;
        Ok(())
    }

    /// Closes the position after a protective trigger. `triggered` names the
    /// order that fired; the sibling is cancelled.
    async fn close_after_trigger(
        &self,
        symbol: &str,
        slot: &mut PositionSlot,
        triggered_kind: OrderKind,
    ) {
        let Some(mut position) = slot.position.clone() else { return };
        if !slot.state.can_transition(LifecycleState::Closing) {
            return;
        }
        slot.state = LifecycleState::Closing;

        let request = OrderRequest {
            client_order_id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            side: position.side.closing_side(),
            kind: OrderKind::Market,
            quantity: position.quantity,
            price: None,
            reduce_only: true,
        };
        let close = match self.place_with_deadline(&request).await {
            Ok(id) => self.await_fill(&id, symbol).await,
            Err(e) => Err(e),
        };
        let fetched = match close {
            Ok(f) if f.status == OrderStatus::Filled => f,
            Ok(f) => {
                warn!(
                    "Execution [{}]: close order ended {}, retrying next tick",
                    symbol, f.status
                );
                slot.state = LifecycleState::Open;
                return;
            }
            Err(e) => {
                warn!(
                    "Execution [{}]: close placement failed ({}), retrying next tick",
                    symbol, e
                );
                slot.state = LifecycleState::Open;
                return;
            }
        };

        let now = Utc::now().timestamp_millis();
        let exit_price = fetched
            .avg_price
            .unwrap_or_else(|| match triggered_kind {
                OrderKind::TakeProfit => position.take_profit,
                _ => position.stop_loss,
            });
        let realized = position.reduce(fetched.filled_qty, exit_price, now);
        self.save_position(&position).await;
        if let Err(e) = self
            .trades
            .save(&TradeFill {
                id: Uuid::new_v4(),
                order_id: Uuid::new_v4(),
                symbol: symbol.to_string(),
                side: request.side,
                quantity: fetched.filled_qty,
                price: exit_price,
                fee: fetched.fee,
                executed_at: now,
            })
            .await
        {
            error!("Execution: failed to persist closing fill: {:#}", e);
        }

        let (mut fired, mut sibling) = match triggered_kind {
            OrderKind::TakeProfit => (slot.tp_order.take(), slot.sl_order.take()),
            _ => (slot.sl_order.take(), slot.tp_order.take()),
        };

        if let Some(record) = fired.as_mut() {
            record.filled_qty = fetched.filled_qty;
            record.avg_fill_price = Some(exit_price);
            if record.transition(OrderStatus::Filled, now).is_ok() {
                self.save_record(record).await;
            }
            self.publish_status(OrderStatusEvent {
                order_id: record.order_id,
                status: OrderStatus::Filled,
                filled_qty: fetched.filled_qty,
                avg_price: Some(exit_price),
                fee: fetched.fee,
                ts: now,
                intent_id: slot.intent_id,
                realized_pnl: Some(realized),
            })
            .await;
        }

        if let Some(record) = sibling.as_mut() {
            if let Some(exchange_id) = record.exchange_order_id.clone()
                && let Err(e) = self.exchange.cancel_order(&exchange_id, symbol).await
            {
                debug!("Execution [{}]: sibling cancel failed: {}", symbol, e);
            }
            if record.transition(OrderStatus::Cancelled, now).is_ok() {
                self.save_record(record).await;
            }
        }

        *self.realized_total.lock().await += realized;
        slot.state = LifecycleState::Closed;
        slot.position = None;
        slot.intent_id = None;

        info!(
            "Execution [{}]: position closed by {} @ {} (realized {})",
            symbol, triggered_kind, exit_price, realized
        );
        self.publish_position(&position).await;
    }

    async fn monitor_slot(&self, symbol: &str, slot_arc: Arc<Mutex<PositionSlot>>) {
        let mut guard = slot_arc.lock().await;
        let slot = &mut *guard;
        if slot.state != LifecycleState::Open {
            return;
        }
        let stop_distance = slot.stop_distance;
        let Some(position) = slot.position.as_mut() else { return };

        let price = match self.candle_store.latest_price(symbol).await {
            Ok(Some(price)) => Some(price),
            _ => self
                .exchange
                .get_ticker(symbol)
                .await
                .ok()
                .map(|t| t.price),
        };
        let Some(price) = price else {
            warn!("Execution [{}]: no price available for monitoring", symbol);
            return;
        };

        position.mark(price);
        if let Some(new_stop) = stops::trail(
            &self.config.trailing,
            position.side,
            position.avg_entry,
            price,
            position.stop_loss,
            stop_distance,
        ) {
            info!(
                "Execution [{}]: trailing stop {} -> {}",
                symbol, position.stop_loss, new_stop
            );
            position.stop_loss = new_stop;
        }
        let position_snapshot = position.clone();
        self.save_position(&position_snapshot).await;

        // Exchange-side reconciliation first: a protective order may have
        // filled or vanished while we were away.
        let mut exchange_triggered = None;
        for (kind, record) in [
            (OrderKind::StopLoss, slot.sl_order.clone()),
            (OrderKind::TakeProfit, slot.tp_order.clone()),
        ] {
            let Some(record) = record else { continue };
            let Some(exchange_id) = record.exchange_order_id.clone() else { continue };
            match self.exchange.fetch_order(&exchange_id, symbol).await {
                Ok(fetched) if fetched.status == OrderStatus::Filled => {
                    exchange_triggered = Some(kind);
                }
                Ok(fetched) if fetched.status == OrderStatus::Cancelled => {
                    // Externally cancelled while the position is live: re-arm.
                    warn!(
                        "Execution [{}]: {} was cancelled externally, re-arming",
                        symbol, kind
                    );
                    let trigger = match kind {
                        OrderKind::TakeProfit => position_snapshot.take_profit,
                        _ => position_snapshot.stop_loss,
                    };
                    let fresh = self
                        .place_protective(&position_snapshot, kind, trigger, Utc::now().timestamp_millis())
                        .await;
                    match kind {
                        OrderKind::TakeProfit => slot.tp_order = Some(fresh),
                        _ => slot.sl_order = Some(fresh),
                    }
                }
                Ok(_) => {}
                Err(e) => debug!("Execution [{}]: reconcile fetch failed: {}", symbol, e),
            }
        }

        if let Some(kind) = exchange_triggered {
            self.close_after_trigger(symbol, &mut *slot, kind).await;
            return;
        }

        // Local trigger simulation for exchanges without server-side stops.
        let triggered = match position_snapshot.side {
            PositionSide::Long => {
                if price <= position_snapshot.stop_loss {
                    Some(OrderKind::StopLoss)
                } else if price >= position_snapshot.take_profit {
                    Some(OrderKind::TakeProfit)
                } else {
                    None
                }
            }
            PositionSide::Short => {
                if price >= position_snapshot.stop_loss {
                    Some(OrderKind::StopLoss)
                } else if price <= position_snapshot.take_profit {
                    Some(OrderKind::TakeProfit)
                } else {
                    None
                }
            }
        };
        if let Some(kind) = triggered {
            info!(
                "Execution [{}]: {} triggered at {} (SL {}, TP {})",
                symbol, kind, price, position_snapshot.stop_loss, position_snapshot.take_profit
            );
            self.close_after_trigger(symbol, &mut *slot, kind).await;
        }
    }

    async fn write_snapshot(&self) {
        let balance = match self.exchange.get_balance().await {
            Ok(b) => b,
            Err(e) => {
                warn!("Execution: snapshot skipped, balance unavailable: {}", e);
                return;
            }
        };

        let mut unrealized = Decimal::ZERO;
        let mut open_count = 0i64;
        let slots: Vec<Arc<Mutex<PositionSlot>>> = {
            let slots = self.slots.read().await;
            slots.values().cloned().collect()
        };
        for slot in slots {
            let slot = slot.lock().await;
            if let Some(position) = &slot.position
                && slot.state == LifecycleState::Open
            {
                unrealized += position.unrealized_pnl;
                open_count += 1;
            }
        }

        let snapshot = PerformanceSnapshot {
            id: Uuid::new_v4(),
            equity: balance + unrealized,
            balance,
            open_positions: open_count,
            realized_pnl_total: *self.realized_total.lock().await,
            avg_quality_score: self.quality.lock().await.overall_avg_score(),
            created_at: Utc::now().timestamp_millis(),
        };
        if let Err(e) = self.snapshots.save(&snapshot).await {
            error!("Execution: failed to persist snapshot: {:#}", e);
        }
    }
}

#[async_trait]
impl Agent for ExecutionAgent {
    fn name(&self) -> &'static str {
        "execution"
    }

    fn subscriptions(&self) -> Vec<Topic> {
        vec![Topic::TradeOrder]
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some(self.config.monitoring_interval)
    }

    /// Placement retries plus the fill wait must fit inside one handler run.
    fn handler_deadline(&self) -> Duration {
        self.config.place_deadline * 6 + self.config.fill_deadline + Duration::from_secs(10)
    }

    /// Restart recovery: reload OPEN positions, re-arm their slots, and
    /// reconcile protective orders with the exchange.
    async fn initialize(&self) -> anyhow::Result<()> {
        let open = self.positions.find_open().await?;
        if open.is_empty() {
            return Ok(());
        }
        info!("Execution: recovering {} open position(s)", open.len());

        for position in open {
            let records = self.orders.find_by_position(position.id).await?;
            let mut sl_order = None;
            let mut tp_order = None;
            for record in records {
                if record.status.is_terminal() {
                    continue;
                }
                match record.kind {
                    OrderKind::StopLoss => sl_order = Some(record),
                    OrderKind::TakeProfit => tp_order = Some(record),
                    _ => {}
                }
            }

            let now = Utc::now().timestamp_millis();
            // A protective order lost on the exchange side is re-created; one
            // still live is retained as-is.
            for (kind, entry, trigger) in [
                (OrderKind::StopLoss, &mut sl_order, position.stop_loss),
                (OrderKind::TakeProfit, &mut tp_order, position.take_profit),
            ] {
                let live = match entry {
                    Some(record) => match &record.exchange_order_id {
                        Some(id) => matches!(
                            self.exchange.fetch_order(id, &position.symbol).await,
                            Ok(f) if !f.status.is_terminal()
                        ),
                        None => true, // locally simulated
                    },
                    None => false,
                };
                if !live {
                    info!(
                        "Execution [{}]: re-creating {} after restart",
                        position.symbol, kind
                    );
                    if let Some(dead) = entry.take()
                        && !dead.status.is_terminal()
                    {
                        let mut dead = dead;
                        if dead.transition(OrderStatus::Cancelled, now).is_ok() {
                            self.save_record(&dead).await;
                        }
                    }
                    *entry = Some(self.place_protective(&position, kind, trigger, now).await);
                }
            }

            let slot_arc = self.slot(&position.symbol).await;
            let mut slot = slot_arc.lock().await;
            slot.state = LifecycleState::Open;
            slot.stop_distance = (position.avg_entry - position.stop_loss).abs();
            slot.intent_id = position.intent_id;
            slot.sl_order = sl_order;
            slot.tp_order = tp_order;
            slot.position = Some(position);
        }
        Ok(())
    }

    async fn handle(&self, envelope: Envelope) -> Result<(), PipelineError> {
        match envelope.payload {
            Payload::Order(order) => self.on_validated_order(order).await,
            other => Err(PipelineError::Contract(format!(
                "unexpected payload for execution: {:?}",
                other
            ))),
        }
    }

    async fn tick(&self) -> anyhow::Result<()> {
        let slots: Vec<(String, Arc<Mutex<PositionSlot>>)> = {
            let slots = self.slots.read().await;
            slots.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        for (symbol, slot) in slots {
            self.monitor_slot(&symbol, slot).await;
        }

        let tick = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
        if tick % self.config.snapshot_every_ticks == 0 {
            self.write_snapshot().await;
        }
        Ok(())
    }
}
