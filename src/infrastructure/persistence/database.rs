use anyhow::{Context, Result};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tokio::fs;
use tracing::info;

/// Connection pool wrapper for the relational store.
#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn new(db_url: &str) -> Result<Self> {
        // Ensure the directory exists if it's a file path
        if let Some(path_part) = db_url.strip_prefix("sqlite://") {
            let path = Path::new(path_part);
            if let Some(parent) = path.parent()
                && !parent.exists()
            {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create database directory")?;
            }
        }

        let options = SqliteConnectOptions::from_str(db_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal); // Better for concurrency

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(std::time::Duration::from_secs(3))
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        info!("Connected to database: {}", db_url);

        let db = Self { pool };
        db.init().await?;

        Ok(db)
    }

    /// In-memory database for tests. A single connection keeps the shared
    /// `:memory:` store alive for the pool's lifetime.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to open in-memory database")?;

        let db = Self { pool };
        db.init().await?;
        Ok(db)
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id TEXT PRIMARY KEY,
                order_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity TEXT NOT NULL,
                price TEXT NOT NULL,
                fee TEXT NOT NULL,
                executed_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create trades table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                id TEXT PRIMARY KEY,
                exchange TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity TEXT NOT NULL,
                avg_entry TEXT NOT NULL,
                current_price TEXT NOT NULL,
                stop_loss TEXT NOT NULL,
                take_profit TEXT NOT NULL,
                unrealized_pnl TEXT NOT NULL,
                realized_pnl TEXT NOT NULL,
                status TEXT NOT NULL,
                opened_at INTEGER NOT NULL,
                closed_at INTEGER,
                intent_id TEXT,
                created_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create positions table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                id TEXT PRIMARY KEY,
                exchange_order_id TEXT,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                kind TEXT NOT NULL,
                status TEXT NOT NULL,
                quantity TEXT NOT NULL,
                price TEXT,
                filled_qty TEXT NOT NULL,
                avg_fill_price TEXT,
                position_id TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create orders table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS signals (
                id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                source TEXT NOT NULL,
                kind TEXT NOT NULL,
                confidence REAL NOT NULL,
                emitted_at INTEGER NOT NULL,
                indicators_json TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create signals table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS risk_assessments (
                id TEXT PRIMARY KEY,
                intent_id TEXT NOT NULL,
                approved BOOLEAN NOT NULL,
                risk_score REAL NOT NULL,
                reasons_json TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create risk_assessments table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS strategy_decisions (
                id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                action TEXT NOT NULL,
                confidence REAL NOT NULL,
                emitted BOOLEAN NOT NULL,
                reason TEXT NOT NULL,
                fusion_json TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create strategy_decisions table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS performance_snapshots (
                id TEXT PRIMARY KEY,
                equity TEXT NOT NULL,
                balance TEXT NOT NULL,
                open_positions INTEGER NOT NULL,
                realized_pnl_total TEXT NOT NULL,
                avg_quality_score REAL,
                created_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create performance_snapshots table")?;

        // Time-series measurements: ohlcv keyed by (symbol, timeframe, open_time),
        // ticker keyed by symbol.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ohlcv (
                symbol TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                open_time INTEGER NOT NULL,
                open TEXT NOT NULL,
                high TEXT NOT NULL,
                low TEXT NOT NULL,
                close TEXT NOT NULL,
                volume TEXT NOT NULL,
                PRIMARY KEY (symbol, timeframe, open_time)
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create ohlcv table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ticker (
                symbol TEXT PRIMARY KEY,
                price TEXT NOT NULL,
                bid TEXT NOT NULL,
                ask TEXT NOT NULL,
                ts INTEGER NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create ticker table")?;

        for stmt in [
            "CREATE INDEX IF NOT EXISTS idx_trades_symbol ON trades (symbol);",
            "CREATE INDEX IF NOT EXISTS idx_trades_created ON trades (created_at DESC);",
            "CREATE INDEX IF NOT EXISTS idx_positions_symbol ON positions (symbol);",
            "CREATE INDEX IF NOT EXISTS idx_positions_status ON positions (status);",
            "CREATE INDEX IF NOT EXISTS idx_positions_created ON positions (created_at DESC);",
            "CREATE INDEX IF NOT EXISTS idx_orders_symbol ON orders (symbol);",
            "CREATE INDEX IF NOT EXISTS idx_orders_status ON orders (status);",
            "CREATE INDEX IF NOT EXISTS idx_orders_position ON orders (position_id);",
            "CREATE INDEX IF NOT EXISTS idx_orders_created ON orders (created_at DESC);",
            "CREATE INDEX IF NOT EXISTS idx_signals_symbol ON signals (symbol);",
            "CREATE INDEX IF NOT EXISTS idx_signals_created ON signals (created_at DESC);",
            "CREATE INDEX IF NOT EXISTS idx_assessments_created ON risk_assessments (created_at DESC);",
            "CREATE INDEX IF NOT EXISTS idx_decisions_symbol ON strategy_decisions (symbol);",
            "CREATE INDEX IF NOT EXISTS idx_decisions_created ON strategy_decisions (created_at DESC);",
            "CREATE INDEX IF NOT EXISTS idx_ohlcv_symbol_time ON ohlcv (symbol, timeframe, open_time);",
        ] {
            sqlx::query(stmt)
                .execute(&mut *conn)
                .await
                .context("Failed to create index")?;
        }

        info!("Database schema initialized");
        Ok(())
    }
}
