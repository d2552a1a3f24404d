//! Paper exchange used by tests and the `paper` run mode. Market orders fill
//! immediately at the scripted price; stop-loss / take-profit orders rest as
//! OPEN so that Execution's local trigger simulation drives them.

use crate::domain::errors::ExchangeError;
use crate::domain::order::{OrderKind, OrderStatus};
use crate::domain::ports::{ExchangeAdapter, ExchangeInfo, FetchedOrder, OrderRequest};
use crate::domain::types::{Candle, OrderSide, Ticker, Timeframe};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::sync::RwLock;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tracing::info;

#[derive(Debug, Clone)]
struct MockOrder {
    request: OrderRequest,
    status: OrderStatus,
    filled_qty: Decimal,
    avg_price: Option<Decimal>,
    fee: Decimal,
}

#[derive(Clone)]
pub struct MockExchange {
    prices: Arc<RwLock<HashMap<String, Decimal>>>,
    candles: Arc<RwLock<HashMap<String, Vec<Candle>>>>,
    orders: Arc<RwLock<HashMap<String, MockOrder>>>,
    balance: Arc<RwLock<Decimal>>,
    subscribers: Arc<RwLock<Vec<Sender<Ticker>>>>,
    /// Transient failures injected into the next N place_order calls.
    fail_next_places: Arc<AtomicU32>,
    next_order_seq: Arc<AtomicU64>,
    min_lot: Arc<RwLock<Decimal>>,
    fee_rate: Decimal,
}

impl MockExchange {
    pub fn new() -> Self {
        Self::with_balance(dec!(10000))
    }

    pub fn with_balance(balance: Decimal) -> Self {
        Self {
            prices: Arc::new(RwLock::new(HashMap::new())),
            candles: Arc::new(RwLock::new(HashMap::new())),
            orders: Arc::new(RwLock::new(HashMap::new())),
            balance: Arc::new(RwLock::new(balance)),
            subscribers: Arc::new(RwLock::new(Vec::new())),
            fail_next_places: Arc::new(AtomicU32::new(0)),
            next_order_seq: Arc::new(AtomicU64::new(1)),
            min_lot: Arc::new(RwLock::new(dec!(0.00001))),
            fee_rate: dec!(0.001),
        }
    }

    pub async fn set_min_lot(&self, min_lot: Decimal) {
        *self.min_lot.write().await = min_lot;
    }

    /// Sets the current price and pushes a tick to stream subscribers.
    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        self.prices.write().await.insert(symbol.to_string(), price);

        let tick = Ticker {
            symbol: symbol.to_string(),
            price,
            bid: price * dec!(0.9999),
            ask: price * dec!(1.0001),
            ts: Utc::now().timestamp_millis(),
        };
        let mut subs = self.subscribers.write().await;
        subs.retain(|tx| tx.try_send(tick.clone()).is_ok() || !tx.is_closed());
    }

    /// Scripts the candle history served by `get_ohlcv`.
    pub async fn push_candles(&self, symbol: &str, candles: Vec<Candle>) {
        self.candles
            .write()
            .await
            .entry(symbol.to_string())
            .or_default()
            .extend(candles);
    }

    /// The next `n` place_order calls fail with a network error.
    pub fn inject_place_failures(&self, n: u32) {
        self.fail_next_places.store(n, Ordering::SeqCst);
    }

    pub async fn order_status(&self, exchange_order_id: &str) -> Option<OrderStatus> {
        self.orders
            .read()
            .await
            .get(exchange_order_id)
            .map(|o| o.status)
    }

    async fn price_of(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        self.prices
            .read()
            .await
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::Network(format!("no price for {}", symbol)))
    }
}

impl Default for MockExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExchangeAdapter for MockExchange {
    async fn get_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        let price = self.price_of(symbol).await?;
        Ok(Ticker {
            symbol: symbol.to_string(),
            price,
            bid: price * dec!(0.9999),
            ask: price * dec!(1.0001),
            ts: Utc::now().timestamp_millis(),
        })
    }

    async fn get_ohlcv(
        &self,
        symbol: &str,
        _timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let candles = self.candles.read().await;
        let all = candles.get(symbol).cloned().unwrap_or_default();
        let start = all.len().saturating_sub(limit);
        Ok(all[start..].to_vec())
    }

    async fn subscribe_ticks(
        &self,
        _symbols: Vec<String>,
    ) -> Result<Receiver<Ticker>, ExchangeError> {
        let (tx, rx) = mpsc::channel(64);
        self.subscribers.write().await.push(tx);
        Ok(rx)
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<String, ExchangeError> {
        if self
            .fail_next_places
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ExchangeError::Network("injected place failure".into()));
        }
        if request.quantity <= Decimal::ZERO {
            return Err(ExchangeError::InvalidParam("quantity must be positive".into()));
        }

        let exchange_order_id = format!(
            "mock-{}",
            self.next_order_seq.fetch_add(1, Ordering::SeqCst)
        );

        let order = match request.kind {
            OrderKind::Market => {
                let price = self.price_of(&request.symbol).await?;
                let notional = price * request.quantity;
                let fee = notional * self.fee_rate;

                if request.side == OrderSide::Buy && !request.reduce_only {
                    let mut balance = self.balance.write().await;
                    if *balance < notional + fee {
                        return Err(ExchangeError::InsufficientFunds(format!(
                            "need {}, have {}",
                            notional + fee,
                            balance
                        )));
                    }
                    *balance -= notional + fee;
                }

                info!(
                    "MockExchange: filled {} {} {} @ {}",
                    request.side, request.quantity, request.symbol, price
                );
                MockOrder {
                    request: request.clone(),
                    status: OrderStatus::Filled,
                    filled_qty: request.quantity,
                    avg_price: Some(price),
                    fee,
                }
            }
            // Protective and limit orders rest until cancelled; Execution
            // simulates their triggers locally.
            OrderKind::Limit | OrderKind::StopLoss | OrderKind::TakeProfit => MockOrder {
                request: request.clone(),
                status: OrderStatus::Open,
                filled_qty: Decimal::ZERO,
                avg_price: None,
                fee: Decimal::ZERO,
            },
        };

        self.orders
            .write()
            .await
            .insert(exchange_order_id.clone(), order);
        Ok(exchange_order_id)
    }

    async fn fetch_order(
        &self,
        exchange_order_id: &str,
        _symbol: &str,
    ) -> Result<FetchedOrder, ExchangeError> {
        let orders = self.orders.read().await;
        let order = orders
            .get(exchange_order_id)
            .ok_or_else(|| ExchangeError::InvalidParam(format!("unknown order {}", exchange_order_id)))?;
        Ok(FetchedOrder {
            exchange_order_id: exchange_order_id.to_string(),
            status: order.status,
            filled_qty: order.filled_qty,
            avg_price: order.avg_price,
            fee: order.fee,
        })
    }

    async fn cancel_order(
        &self,
        exchange_order_id: &str,
        _symbol: &str,
    ) -> Result<(), ExchangeError> {
        let mut orders = self.orders.write().await;
        let order = orders
            .get_mut(exchange_order_id)
            .ok_or_else(|| ExchangeError::InvalidParam(format!("unknown order {}", exchange_order_id)))?;
        if order.status.is_terminal() {
            return Err(ExchangeError::Rejected(format!(
                "order {} already {}",
                exchange_order_id, order.status
            )));
        }
        order.status = OrderStatus::Cancelled;
        Ok(())
    }

    async fn get_balance(&self) -> Result<Decimal, ExchangeError> {
        Ok(*self.balance.read().await)
    }

    async fn get_exchange_info(&self, _symbol: &str) -> Result<ExchangeInfo, ExchangeError> {
        Ok(ExchangeInfo {
            min_lot: *self.min_lot.read().await,
            tick_size: dec!(0.01),
            step_size: dec!(0.00001),
        })
    }
}
