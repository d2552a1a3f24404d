use crate::domain::errors::ExchangeError;
use crate::domain::order::{OrderKind, OrderStatus};
use crate::domain::types::{Candle, OrderSide, Ticker, Timeframe};
use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::mpsc::Receiver;

/// Lot constraints for a symbol, fetched from the exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeInfo {
    pub min_lot: Decimal,
    pub tick_size: Decimal,
    pub step_size: Decimal,
}

/// Request to place an order on the exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub quantity: Decimal,
    /// Limit price or stop/take-profit trigger; None for market orders.
    pub price: Option<Decimal>,
    /// Reduce-only orders may only shrink an existing position.
    pub reduce_only: bool,
}

/// Exchange-side view of a previously placed order.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedOrder {
    pub exchange_order_id: String,
    pub status: OrderStatus,
    pub filled_qty: Decimal,
    pub avg_price: Option<Decimal>,
    pub fee: Decimal,
}

/// Contract of the exchange connectivity driver. The driver itself lives
/// outside this crate; tests and paper mode use the in-process mock.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    async fn get_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError>;

    async fn get_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError>;

    /// Long-lived tick subscription used by DataCollection's streaming mode.
    async fn subscribe_ticks(&self, symbols: Vec<String>) -> Result<Receiver<Ticker>, ExchangeError>;

    /// Returns the exchange-assigned order id.
    async fn place_order(&self, request: &OrderRequest) -> Result<String, ExchangeError>;

    async fn fetch_order(
        &self,
        exchange_order_id: &str,
        symbol: &str,
    ) -> Result<FetchedOrder, ExchangeError>;

    async fn cancel_order(&self, exchange_order_id: &str, symbol: &str) -> Result<(), ExchangeError>;

    /// Free quote-currency balance.
    async fn get_balance(&self) -> Result<Decimal, ExchangeError>;

    async fn get_exchange_info(&self, symbol: &str) -> Result<ExchangeInfo, ExchangeError>;
}

/// Contract of the time-series store. Candles are keyed by
/// (symbol, timeframe, open_time); tickers by symbol.
#[async_trait]
pub trait CandleStore: Send + Sync {
    async fn upsert_candle(&self, candle: &Candle) -> Result<()>;

    async fn upsert_ticker(&self, ticker: &Ticker) -> Result<()>;

    /// Most recent candles in ascending open_time order.
    async fn recent_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>>;

    /// Latest known price for a symbol (ticker first, candle close as fallback).
    async fn latest_price(&self, symbol: &str) -> Result<Option<Decimal>>;
}
