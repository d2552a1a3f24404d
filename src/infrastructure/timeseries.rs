//! SQLite-backed implementation of the time-series contract. The production
//! deployment points this at a dedicated store; the schema mirrors the
//! measurement layout: `ohlcv` tagged by (symbol, timeframe), `ticker` by
//! symbol.

use crate::domain::ports::CandleStore;
use crate::domain::types::{Candle, Ticker, Timeframe};
use anyhow::{Context, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

pub struct SqliteCandleStore {
    pool: SqlitePool,
}

impl SqliteCandleStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CandleStore for SqliteCandleStore {
    async fn upsert_candle(&self, candle: &Candle) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ohlcv (symbol, timeframe, open_time, open, high, low, close, volume)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(symbol, timeframe, open_time) DO UPDATE SET
                open = excluded.open,
                high = excluded.high,
                low = excluded.low,
                close = excluded.close,
                volume = excluded.volume
            "#,
        )
        .bind(&candle.symbol)
        .bind(candle.timeframe.as_str())
        .bind(candle.open_time)
        .bind(candle.open.to_string())
        .bind(candle.high.to_string())
        .bind(candle.low.to_string())
        .bind(candle.close.to_string())
        .bind(candle.volume.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to upsert candle")?;
        Ok(())
    }

    async fn upsert_ticker(&self, ticker: &Ticker) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ticker (symbol, price, bid, ask, ts)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(symbol) DO UPDATE SET
                price = excluded.price,
                bid = excluded.bid,
                ask = excluded.ask,
                ts = excluded.ts
            "#,
        )
        .bind(&ticker.symbol)
        .bind(ticker.price.to_string())
        .bind(ticker.bid.to_string())
        .bind(ticker.ask.to_string())
        .bind(ticker.ts)
        .execute(&self.pool)
        .await
        .context("Failed to upsert ticker")?;
        Ok(())
    }

    async fn recent_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let rows = sqlx::query(
            r#"
            SELECT symbol, timeframe, open_time, open, high, low, close, volume
            FROM ohlcv
            WHERE symbol = ? AND timeframe = ?
            ORDER BY open_time DESC
            LIMIT ?
            "#,
        )
        .bind(symbol)
        .bind(timeframe.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch recent candles")?;

        let mut candles = rows
            .iter()
            .map(|row| {
                let tf: String = row.get("timeframe");
                Ok(Candle {
                    symbol: row.get("symbol"),
                    timeframe: tf.parse::<Timeframe>()?,
                    open_time: row.get("open_time"),
                    open: parse_decimal(row, "open")?,
                    high: parse_decimal(row, "high")?,
                    low: parse_decimal(row, "low")?,
                    close: parse_decimal(row, "close")?,
                    volume: parse_decimal(row, "volume")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        candles.reverse();
        Ok(candles)
    }

    async fn latest_price(&self, symbol: &str) -> Result<Option<Decimal>> {
        let row = sqlx::query("SELECT price FROM ticker WHERE symbol = ?")
            .bind(symbol)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch ticker price")?;
        if let Some(row) = row {
            return Ok(Some(parse_decimal(&row, "price")?));
        }

        // Fall back to the latest candle close.
        let row = sqlx::query(
            "SELECT close FROM ohlcv WHERE symbol = ? ORDER BY open_time DESC LIMIT 1",
        )
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch latest candle close")?;
        row.map(|r| parse_decimal(&r, "close")).transpose()
    }
}

fn parse_decimal(row: &sqlx::sqlite::SqliteRow, col: &str) -> Result<Decimal> {
    let raw: String = row.get(col);
    Decimal::from_str(&raw).with_context(|| format!("Invalid decimal in column {}", col))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::persistence::database::Database;
    use rust_decimal_macros::dec;

    fn candle(open_time: i64, close: Decimal) -> Candle {
        Candle {
            symbol: "BTC/USDT".to_string(),
            timeframe: Timeframe::M1,
            open_time,
            open: close - dec!(10),
            high: close + dec!(20),
            low: close - dec!(20),
            close,
            volume: dec!(3.5),
        }
    }

    #[tokio::test]
    async fn test_candle_upsert_and_ascending_read() {
        let db = Database::in_memory().await.unwrap();
        let store = SqliteCandleStore::new(db.pool.clone());

        for (t, px) in [(3, dec!(103)), (1, dec!(101)), (2, dec!(102))] {
            store.upsert_candle(&candle(t * 60_000, px)).await.unwrap();
        }
        // Re-writing an open_time replaces the row.
        store.upsert_candle(&candle(120_000, dec!(105))).await.unwrap();

        let candles = store
            .recent_candles("BTC/USDT", Timeframe::M1, 10)
            .await
            .unwrap();
        let times: Vec<i64> = candles.iter().map(|c| c.open_time).collect();
        assert_eq!(times, vec![60_000, 120_000, 180_000]);
        assert_eq!(candles[1].close, dec!(105));
    }

    #[tokio::test]
    async fn test_latest_price_prefers_ticker() {
        let db = Database::in_memory().await.unwrap();
        let store = SqliteCandleStore::new(db.pool.clone());

        store.upsert_candle(&candle(60_000, dec!(101))).await.unwrap();
        assert_eq!(
            store.latest_price("BTC/USDT").await.unwrap(),
            Some(dec!(101))
        );

        store
            .upsert_ticker(&Ticker {
                symbol: "BTC/USDT".to_string(),
                price: dec!(102.5),
                bid: dec!(102.4),
                ask: dec!(102.6),
                ts: 1,
            })
            .await
            .unwrap();
        assert_eq!(
            store.latest_price("BTC/USDT").await.unwrap(),
            Some(dec!(102.5))
        );

        assert_eq!(store.latest_price("ETH/USDT").await.unwrap(), None);
    }
}
