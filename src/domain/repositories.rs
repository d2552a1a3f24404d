//! Repository traits for the relational store. Implementations live in
//! `infrastructure::persistence`; agents depend only on these abstractions.

use crate::domain::order::{OrderRecord, OrderStatus};
use crate::domain::position::Position;
use crate::domain::risk::RiskAssessment;
use crate::domain::signal::{Signal, StrategyDecision};
use crate::domain::types::OrderSide;
use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use uuid::Uuid;

/// A single fill, persisted in the `trades` table.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeFill {
    pub id: Uuid,
    pub order_id: Uuid,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
    /// Unix millis.
    pub executed_at: i64,
}

/// Periodic account snapshot written by Execution's monitor.
#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceSnapshot {
    pub id: Uuid,
    pub equity: Decimal,
    pub balance: Decimal,
    pub open_positions: i64,
    pub realized_pnl_total: Decimal,
    pub avg_quality_score: Option<f64>,
    /// Unix millis.
    pub created_at: i64,
}

#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Insert or replace by order_id.
    async fn save(&self, record: &OrderRecord) -> Result<()>;

    async fn get(&self, order_id: Uuid) -> Result<Option<OrderRecord>>;

    async fn find_by_position(&self, position_id: Uuid) -> Result<Vec<OrderRecord>>;

    async fn find_by_status(&self, status: OrderStatus) -> Result<Vec<OrderRecord>>;
}

#[async_trait]
pub trait PositionRepository: Send + Sync {
    /// Insert or replace by id.
    async fn save(&self, position: &Position) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<Position>>;

    async fn find_open(&self) -> Result<Vec<Position>>;

    async fn find_open_by_symbol(&self, exchange: &str, symbol: &str) -> Result<Option<Position>>;
}

#[async_trait]
pub trait SignalRepository: Send + Sync {
    async fn save(&self, signal: &Signal) -> Result<()>;
}

#[async_trait]
pub trait AssessmentRepository: Send + Sync {
    async fn save(&self, assessment: &RiskAssessment) -> Result<()>;
}

#[async_trait]
pub trait DecisionRepository: Send + Sync {
    async fn save(&self, decision: &StrategyDecision) -> Result<()>;
}

#[async_trait]
pub trait TradeRepository: Send + Sync {
    async fn save(&self, fill: &TradeFill) -> Result<()>;
}

#[async_trait]
pub trait SnapshotRepository: Send + Sync {
    async fn save(&self, snapshot: &PerformanceSnapshot) -> Result<()>;
}
