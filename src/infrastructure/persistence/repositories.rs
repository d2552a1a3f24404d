use crate::domain::order::{OrderKind, OrderRecord, OrderStatus};
use crate::domain::position::{Position, PositionSide, PositionStatus};
use crate::domain::repositories::{
    AssessmentRepository, DecisionRepository, OrderRepository, PerformanceSnapshot,
    PositionRepository, SignalRepository, SnapshotRepository, TradeFill, TradeRepository,
};
use crate::domain::risk::RiskAssessment;
use crate::domain::signal::{FusionMeta, Signal, SignalKind, StrategyDecision};
use crate::domain::types::OrderSide;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use uuid::Uuid;

fn decimal_col(row: &sqlx::sqlite::SqliteRow, col: &str) -> Result<Decimal> {
    let raw: String = row.get(col);
    Decimal::from_str(&raw).with_context(|| format!("Invalid decimal in column {}", col))
}

fn opt_decimal_col(row: &sqlx::sqlite::SqliteRow, col: &str) -> Result<Option<Decimal>> {
    let raw: Option<String> = row.get(col);
    raw.map(|s| Decimal::from_str(&s).with_context(|| format!("Invalid decimal in column {}", col)))
        .transpose()
}

fn uuid_col(row: &sqlx::sqlite::SqliteRow, col: &str) -> Result<Uuid> {
    let raw: String = row.get(col);
    Uuid::parse_str(&raw).with_context(|| format!("Invalid uuid in column {}", col))
}

pub struct SqliteOrderRepository {
    pool: SqlitePool,
}

impl SqliteOrderRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<OrderRecord> {
        let side: String = row.get("side");
        let kind: String = row.get("kind");
        let status: String = row.get("status");
        let position_id: Option<String> = row.get("position_id");
        Ok(OrderRecord {
            order_id: uuid_col(row, "id")?,
            exchange_order_id: row.get("exchange_order_id"),
            symbol: row.get("symbol"),
            side: side.parse::<OrderSide>()?,
            kind: match kind.as_str() {
                "MARKET" => OrderKind::Market,
                "LIMIT" => OrderKind::Limit,
                "STOP_LOSS" => OrderKind::StopLoss,
                "TAKE_PROFIT" => OrderKind::TakeProfit,
                other => anyhow::bail!("Invalid order kind: {}", other),
            },
            status: status.parse::<OrderStatus>()?,
            quantity: decimal_col(row, "quantity")?,
            price: opt_decimal_col(row, "price")?,
            filled_qty: decimal_col(row, "filled_qty")?,
            avg_fill_price: opt_decimal_col(row, "avg_fill_price")?,
            position_id: position_id.map(|s| Uuid::parse_str(&s)).transpose()?,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

#[async_trait]
impl OrderRepository for SqliteOrderRepository {
    async fn save(&self, record: &OrderRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO orders
                (id, exchange_order_id, symbol, side, kind, status, quantity, price,
                 filled_qty, avg_fill_price, position_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                exchange_order_id = excluded.exchange_order_id,
                status = excluded.status,
                filled_qty = excluded.filled_qty,
                avg_fill_price = excluded.avg_fill_price,
                position_id = excluded.position_id,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(record.order_id.to_string())
        .bind(&record.exchange_order_id)
        .bind(&record.symbol)
        .bind(record.side.to_string())
        .bind(record.kind.to_string())
        .bind(record.status.to_string())
        .bind(record.quantity.to_string())
        .bind(record.price.map(|p| p.to_string()))
        .bind(record.filled_qty.to_string())
        .bind(record.avg_fill_price.map(|p| p.to_string()))
        .bind(record.position_id.map(|id| id.to_string()))
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .context("Failed to save order record")?;
        Ok(())
    }

    async fn get(&self, order_id: Uuid) -> Result<Option<OrderRecord>> {
        let row = sqlx::query("SELECT * FROM orders WHERE id = ?")
            .bind(order_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch order")?;
        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn find_by_position(&self, position_id: Uuid) -> Result<Vec<OrderRecord>> {
        let rows = sqlx::query("SELECT * FROM orders WHERE position_id = ? ORDER BY created_at")
            .bind(position_id.to_string())
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch orders by position")?;
        rows.iter().map(Self::row_to_record).collect()
    }

    async fn find_by_status(&self, status: OrderStatus) -> Result<Vec<OrderRecord>> {
        let rows = sqlx::query("SELECT * FROM orders WHERE status = ? ORDER BY created_at")
            .bind(status.to_string())
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch orders by status")?;
        rows.iter().map(Self::row_to_record).collect()
    }
}

pub struct SqlitePositionRepository {
    pool: SqlitePool,
}

impl SqlitePositionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_position(row: &sqlx::sqlite::SqliteRow) -> Result<Position> {
        let side: String = row.get("side");
        let status: String = row.get("status");
        let intent_id: Option<String> = row.get("intent_id");
        Ok(Position {
            id: uuid_col(row, "id")?,
            exchange: row.get("exchange"),
            symbol: row.get("symbol"),
            side: side.parse::<PositionSide>()?,
            quantity: decimal_col(row, "quantity")?,
            avg_entry: decimal_col(row, "avg_entry")?,
            current_price: decimal_col(row, "current_price")?,
            stop_loss: decimal_col(row, "stop_loss")?,
            take_profit: decimal_col(row, "take_profit")?,
            unrealized_pnl: decimal_col(row, "unrealized_pnl")?,
            realized_pnl: decimal_col(row, "realized_pnl")?,
            status: status.parse::<PositionStatus>()?,
            opened_at: row.get("opened_at"),
            closed_at: row.get("closed_at"),
            intent_id: intent_id.map(|s| Uuid::parse_str(&s)).transpose()?,
        })
    }
}

#[async_trait]
impl PositionRepository for SqlitePositionRepository {
    async fn save(&self, position: &Position) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO positions
                (id, exchange, symbol, side, quantity, avg_entry, current_price,
                 stop_loss, take_profit, unrealized_pnl, realized_pnl, status,
                 opened_at, closed_at, intent_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                quantity = excluded.quantity,
                avg_entry = excluded.avg_entry,
                current_price = excluded.current_price,
                stop_loss = excluded.stop_loss,
                take_profit = excluded.take_profit,
                unrealized_pnl = excluded.unrealized_pnl,
                realized_pnl = excluded.realized_pnl,
                status = excluded.status,
                closed_at = excluded.closed_at
            "#,
        )
        .bind(position.id.to_string())
        .bind(&position.exchange)
        .bind(&position.symbol)
        .bind(position.side.to_string())
        .bind(position.quantity.to_string())
        .bind(position.avg_entry.to_string())
        .bind(position.current_price.to_string())
        .bind(position.stop_loss.to_string())
        .bind(position.take_profit.to_string())
        .bind(position.unrealized_pnl.to_string())
        .bind(position.realized_pnl.to_string())
        .bind(position.status.to_string())
        .bind(position.opened_at)
        .bind(position.closed_at)
        .bind(position.intent_id.map(|id| id.to_string()))
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await
        .context("Failed to save position")?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Position>> {
        let row = sqlx::query("SELECT * FROM positions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch position")?;
        row.as_ref().map(Self::row_to_position).transpose()
    }

    async fn find_open(&self) -> Result<Vec<Position>> {
        let rows = sqlx::query("SELECT * FROM positions WHERE status = 'OPEN' ORDER BY opened_at")
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch open positions")?;
        rows.iter().map(Self::row_to_position).collect()
    }

    async fn find_open_by_symbol(&self, exchange: &str, symbol: &str) -> Result<Option<Position>> {
        let row = sqlx::query(
            "SELECT * FROM positions WHERE status = 'OPEN' AND exchange = ? AND symbol = ?",
        )
        .bind(exchange)
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch open position by symbol")?;
        row.as_ref().map(Self::row_to_position).transpose()
    }
}

pub struct SqliteSignalRepository {
    pool: SqlitePool,
}

impl SqliteSignalRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SignalRepository for SqliteSignalRepository {
    async fn save(&self, signal: &Signal) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO signals (id, symbol, source, kind, confidence, emitted_at, indicators_json, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(signal.id.to_string())
        .bind(&signal.symbol)
        .bind(&signal.source)
        .bind(signal.kind.to_string())
        .bind(signal.confidence)
        .bind(signal.emitted_at)
        .bind(serde_json::to_string(&signal.indicators)?)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await
        .context("Failed to save signal")?;
        Ok(())
    }
}

pub struct SqliteAssessmentRepository {
    pool: SqlitePool,
}

impl SqliteAssessmentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Assessments persisted for an intent, oldest first. Test observability.
    pub async fn find_by_intent(&self, intent_id: Uuid) -> Result<Vec<RiskAssessment>> {
        let rows =
            sqlx::query("SELECT * FROM risk_assessments WHERE intent_id = ? ORDER BY created_at")
                .bind(intent_id.to_string())
                .fetch_all(&self.pool)
                .await
                .context("Failed to fetch assessments")?;
        rows.iter()
            .map(|row| {
                let reasons: String = row.get("reasons_json");
                Ok(RiskAssessment {
                    id: uuid_col(row, "id")?,
                    intent_id: uuid_col(row, "intent_id")?,
                    approved: row.get("approved"),
                    risk_score: row.get("risk_score"),
                    reasons: serde_json::from_str(&reasons)?,
                    created_at: row.get("created_at"),
                })
            })
            .collect()
    }
}

#[async_trait]
impl AssessmentRepository for SqliteAssessmentRepository {
    async fn save(&self, assessment: &RiskAssessment) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO risk_assessments (id, intent_id, approved, risk_score, reasons_json, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(assessment.id.to_string())
        .bind(assessment.intent_id.to_string())
        .bind(assessment.approved)
        .bind(assessment.risk_score)
        .bind(serde_json::to_string(&assessment.reasons)?)
        .bind(assessment.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to save risk assessment")?;
        Ok(())
    }
}

pub struct SqliteDecisionRepository {
    pool: SqlitePool,
}

impl SqliteDecisionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Decisions recorded for a symbol, oldest first. Test observability.
    pub async fn find_by_symbol(&self, symbol: &str) -> Result<Vec<StrategyDecision>> {
        let rows =
            sqlx::query("SELECT * FROM strategy_decisions WHERE symbol = ? ORDER BY created_at")
                .bind(symbol)
                .fetch_all(&self.pool)
                .await
                .context("Failed to fetch decisions")?;
        rows.iter()
            .map(|row| {
                let action: String = row.get("action");
                let fusion: String = row.get("fusion_json");
                Ok(StrategyDecision {
                    id: uuid_col(row, "id")?,
                    symbol: row.get("symbol"),
                    action: match action.as_str() {
                        "BUY" => SignalKind::Buy,
                        "SELL" => SignalKind::Sell,
                        "HOLD" => SignalKind::Hold,
                        other => anyhow::bail!("Invalid decision action: {}", other),
                    },
                    confidence: row.get("confidence"),
                    emitted: row.get("emitted"),
                    reason: row.get("reason"),
                    fusion: serde_json::from_str::<FusionMeta>(&fusion)?,
                    created_at: row.get("created_at"),
                })
            })
            .collect()
    }
}

#[async_trait]
impl DecisionRepository for SqliteDecisionRepository {
    async fn save(&self, decision: &StrategyDecision) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO strategy_decisions (id, symbol, action, confidence, emitted, reason, fusion_json, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(decision.id.to_string())
        .bind(&decision.symbol)
        .bind(decision.action.to_string())
        .bind(decision.confidence)
        .bind(decision.emitted)
        .bind(&decision.reason)
        .bind(serde_json::to_string(&decision.fusion)?)
        .bind(decision.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to save strategy decision")?;
        Ok(())
    }
}

pub struct SqliteTradeRepository {
    pool: SqlitePool,
}

impl SqliteTradeRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TradeRepository for SqliteTradeRepository {
    async fn save(&self, fill: &TradeFill) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trades (id, order_id, symbol, side, quantity, price, fee, executed_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(fill.id.to_string())
        .bind(fill.order_id.to_string())
        .bind(&fill.symbol)
        .bind(fill.side.to_string())
        .bind(fill.quantity.to_string())
        .bind(fill.price.to_string())
        .bind(fill.fee.to_string())
        .bind(fill.executed_at)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await
        .context("Failed to save trade fill")?;
        Ok(())
    }
}

pub struct SqliteSnapshotRepository {
    pool: SqlitePool,
}

impl SqliteSnapshotRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SnapshotRepository for SqliteSnapshotRepository {
    async fn save(&self, snapshot: &PerformanceSnapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO performance_snapshots
                (id, equity, balance, open_positions, realized_pnl_total, avg_quality_score, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(snapshot.id.to_string())
        .bind(snapshot.equity.to_string())
        .bind(snapshot.balance.to_string())
        .bind(snapshot.open_positions)
        .bind(snapshot.realized_pnl_total.to_string())
        .bind(snapshot.avg_quality_score)
        .bind(snapshot.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to save performance snapshot")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::signal::KindScores;
    use crate::infrastructure::persistence::database::Database;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_order_record_round_trip() {
        let db = Database::in_memory().await.unwrap();
        let repo = SqliteOrderRepository::new(db.pool.clone());

        let mut record = OrderRecord {
            order_id: Uuid::new_v4(),
            exchange_order_id: Some("ex-1".to_string()),
            symbol: "BTC/USDT".to_string(),
            side: OrderSide::Buy,
            kind: OrderKind::Market,
            status: OrderStatus::Pending,
            quantity: dec!(0.01233),
            price: None,
            filled_qty: Decimal::ZERO,
            avg_fill_price: None,
            position_id: Some(Uuid::new_v4()),
            created_at: 1,
            updated_at: 1,
        };
        repo.save(&record).await.unwrap();

        record.transition(OrderStatus::Filled, 2).unwrap();
        record.filled_qty = dec!(0.01233);
        record.avg_fill_price = Some(dec!(121650));
        repo.save(&record).await.unwrap();

        let loaded = repo.get(record.order_id).await.unwrap().unwrap();
        assert_eq!(loaded, record);

        let by_position = repo.find_by_position(record.position_id.unwrap()).await.unwrap();
        assert_eq!(by_position.len(), 1);
    }

    #[tokio::test]
    async fn test_position_round_trip_and_open_lookup() {
        let db = Database::in_memory().await.unwrap();
        let repo = SqlitePositionRepository::new(db.pool.clone());

        let position = Position {
            id: Uuid::new_v4(),
            exchange: "paper".to_string(),
            symbol: "ETH/USDT".to_string(),
            side: PositionSide::Long,
            quantity: dec!(0.5),
            avg_entry: dec!(3000),
            current_price: dec!(3010),
            stop_loss: dec!(2900),
            take_profit: dec!(3200),
            unrealized_pnl: dec!(5),
            realized_pnl: Decimal::ZERO,
            status: PositionStatus::Open,
            opened_at: 10,
            closed_at: None,
            intent_id: Some(Uuid::new_v4()),
        };
        repo.save(&position).await.unwrap();

        let open = repo.find_open().await.unwrap();
        assert_eq!(open, vec![position.clone()]);

        let by_symbol = repo
            .find_open_by_symbol("paper", "ETH/USDT")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_symbol.id, position.id);

        let mut closed = position.clone();
        closed.status = PositionStatus::Closed;
        closed.closed_at = Some(20);
        repo.save(&closed).await.unwrap();
        assert!(repo.find_open().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_decision_round_trip() {
        let db = Database::in_memory().await.unwrap();
        let repo = SqliteDecisionRepository::new(db.pool.clone());

        let decision = StrategyDecision {
            id: Uuid::new_v4(),
            symbol: "BTC/USDT".to_string(),
            action: SignalKind::Buy,
            confidence: 0.71,
            emitted: true,
            reason: "confidence above threshold".to_string(),
            fusion: FusionMeta {
                strategy: "hybrid".to_string(),
                buffer_size: 4,
                contributing: Vec::new(),
                scores: KindScores {
                    buy: 0.71,
                    sell: 0.05,
                    hold: 0.24,
                },
            },
            created_at: 5,
        };
        repo.save(&decision).await.unwrap();

        let loaded = repo.find_by_symbol("BTC/USDT").await.unwrap();
        assert_eq!(loaded, vec![decision]);
    }
}
