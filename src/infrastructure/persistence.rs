use crate::domain::ports::PersistenceSink;
use crate::domain::trading::types::{Candle, Side};
use anyhow::{Context, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Duration;
use tracing::{debug, info, warn};

/// A best-effort client for the line-oriented text protocol described in §6:
/// `table,symbol=X,side=Y price=P,qty=Q TS_NS\n`. One persistent TCP
/// connection is reused for all appends (§5 resource pooling) and
/// reconnected lazily with the same backoff schedule as the ingestor.
pub struct LineProtocolSink {
    addr: String,
    conn: Mutex<Option<TcpStream>>,
    backoff: Mutex<Duration>,
}

impl LineProtocolSink {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            conn: Mutex::new(None),
            backoff: Mutex::new(Duration::from_secs(1)),
        }
    }

    async fn write_line(&self, line: &str) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            match TcpStream::connect(&self.addr).await {
                Ok(stream) => {
                    *guard = Some(stream);
                    *self.backoff.lock().await = Duration::from_secs(1);
                }
                Err(e) => {
                    let mut backoff = self.backoff.lock().await;
                    warn!(
                        "persistence sink unreachable at {}: {}, retry in {:?}",
                        self.addr, e, *backoff
                    );
                    let wait = *backoff;
                    *backoff = (*backoff * 2).min(Duration::from_secs(30));
                    drop(backoff);
                    tokio::time::sleep(wait).await;
                    return Ok(());
                }
            }
        }

        if let Some(stream) = guard.as_mut()
            && stream.write_all(line.as_bytes()).await.is_err()
        {
            *guard = None;
        }
        Ok(())
    }
}

/// The in-process warmup store substituting for the external time-series
/// query the production persistence sink would otherwise answer (§3/§6).
/// Candles and trades appended during this process's lifetime are mirrored
/// here so `warmup_candles` has live data without a separate service.
pub struct SqliteWarmupStore {
    pool: SqlitePool,
}

impl SqliteWarmupStore {
    pub async fn new(db_path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(db_path).parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .context("failed to create warmup store directory")?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{db_path}"))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("failed to connect to warmup store")?;

        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS candles (
                symbol TEXT NOT NULL,
                start_ts_ms INTEGER NOT NULL,
                open TEXT NOT NULL,
                high TEXT NOT NULL,
                low TEXT NOT NULL,
                close TEXT NOT NULL,
                volume TEXT NOT NULL,
                PRIMARY KEY (symbol, start_ts_ms)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create candles table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                price TEXT NOT NULL,
                qty TEXT NOT NULL,
                ts_ms INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create trades table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_symbol_ts ON trades (symbol, ts_ms);")
            .execute(&self.pool)
            .await
            .context("failed to create trades index")?;

        Ok(())
    }

    async fn insert_candle(&self, candle: &Candle) -> Result<()> {
        sqlx::query(
            "INSERT INTO candles (symbol, start_ts_ms, open, high, low, close, volume)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(symbol, start_ts_ms) DO UPDATE SET
               high = excluded.high, low = excluded.low, close = excluded.close, volume = excluded.volume",
        )
        .bind(&candle.symbol)
        .bind(candle.start_ts_ms)
        .bind(candle.open.to_string())
        .bind(candle.high.to_string())
        .bind(candle.low.to_string())
        .bind(candle.close.to_string())
        .bind(candle.volume.to_string())
        .execute(&self.pool)
        .await
        .context("failed to insert candle")?;
        Ok(())
    }

    async fn insert_trade(&self, symbol: &str, side: Side, price: Decimal, qty: Decimal, ts_ms: i64) -> Result<()> {
        sqlx::query("INSERT INTO trades (symbol, side, price, qty, ts_ms) VALUES (?, ?, ?, ?, ?)")
            .bind(symbol)
            .bind(side.to_string())
            .bind(price.to_string())
            .bind(qty.to_string())
            .bind(ts_ms)
            .execute(&self.pool)
            .await
            .context("failed to insert trade")?;
        Ok(())
    }

    async fn warmup_candles(&self, symbol: &str, limit: usize) -> Result<Vec<Candle>> {
        let rows = sqlx::query(
            "SELECT symbol, start_ts_ms, open, high, low, close, volume FROM candles
             WHERE symbol = ? ORDER BY start_ts_ms DESC LIMIT ?",
        )
        .bind(symbol)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("failed to query warmup candles")?;

        if !rows.is_empty() {
            let mut candles: Vec<Candle> = rows
                .into_iter()
                .map(|row| Candle {
                    symbol: row.get::<String, _>("symbol"),
                    start_ts_ms: row.get::<i64, _>("start_ts_ms"),
                    open: Decimal::from_str(&row.get::<String, _>("open")).unwrap_or_default(),
                    high: Decimal::from_str(&row.get::<String, _>("high")).unwrap_or_default(),
                    low: Decimal::from_str(&row.get::<String, _>("low")).unwrap_or_default(),
                    close: Decimal::from_str(&row.get::<String, _>("close")).unwrap_or_default(),
                    volume: Decimal::from_str(&row.get::<String, _>("volume")).unwrap_or_default(),
                })
                .collect();
            candles.reverse();
            return Ok(candles);
        }

        debug!("no candles for {}, reconstructing from trades", symbol);
        self.downsample_trades(symbol, limit).await
    }

    /// Fallback: reconstruct 1-second OHLCV bars from the trade tape when
    /// the candle table has nothing for this symbol (§6).
    async fn downsample_trades(&self, symbol: &str, limit: usize) -> Result<Vec<Candle>> {
        let rows = sqlx::query(
            "SELECT side, price, qty, ts_ms FROM trades WHERE symbol = ? ORDER BY ts_ms ASC",
        )
        .bind(symbol)
        .fetch_all(&self.pool)
        .await
        .context("failed to query trades for downsampling")?;

        let mut candles: Vec<Candle> = Vec::new();
        for row in rows {
            let price = Decimal::from_str(&row.get::<String, _>("price")).unwrap_or_default();
            let qty = Decimal::from_str(&row.get::<String, _>("qty")).unwrap_or_default();
            let ts_ms: i64 = row.get("ts_ms");
            let bucket = (ts_ms / 1000) * 1000;

            match candles.last_mut() {
                Some(c) if c.start_ts_ms == bucket => c.update(price, qty),
                _ => candles.push(Candle {
                    symbol: symbol.to_string(),
                    start_ts_ms: bucket,
                    open: price,
                    high: price,
                    low: price,
                    close: price,
                    volume: qty,
                }),
            }
        }

        if candles.len() > limit {
            let start = candles.len() - limit;
            candles.drain(0..start);
        }
        Ok(candles)
    }
}

/// Combines the TCP append sink with the SQLite warmup fallback behind one
/// `PersistenceSink` so the application layer only ever depends on the trait.
pub struct CompositeSink {
    line: Arc<LineProtocolSink>,
    store: Arc<SqliteWarmupStore>,
}

impl CompositeSink {
    pub fn new(line: Arc<LineProtocolSink>, store: Arc<SqliteWarmupStore>) -> Self {
        Self { line, store }
    }
}

#[async_trait]
impl PersistenceSink for CompositeSink {
    async fn append_trade(
        &self,
        symbol: &str,
        side: Side,
        price: Decimal,
        qty: Decimal,
        ts_ms: i64,
    ) -> Result<()> {
        let ts_ns = ts_ms.saturating_mul(1_000_000);
        let line = format!(
            "trades,symbol={symbol},side={side} price={price},qty={qty} {ts_ns}\n"
        );
        self.line.write_line(&line).await?;
        self.store.insert_trade(symbol, side, price, qty, ts_ms).await
    }

    async fn append_candle(&self, candle: &Candle) -> Result<()> {
        let ts_ns = candle.start_ts_ms.saturating_mul(1_000_000);
        let line = format!(
            "candles_1s,symbol={} open={},high={},low={},close={},volume={} {}\n",
            candle.symbol, candle.open, candle.high, candle.low, candle.close, candle.volume, ts_ns
        );
        self.line.write_line(&line).await?;
        self.store.insert_candle(candle).await
    }

    async fn warmup_candles(&self, symbol: &str, limit: usize) -> Result<Vec<Candle>> {
        self.store.warmup_candles(symbol, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    async fn store() -> SqliteWarmupStore {
        SqliteWarmupStore::new(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn warmup_candles_returns_oldest_first() {
        let store = store().await;
        for i in 0..3 {
            store
                .insert_candle(&Candle {
                    symbol: "BTCUSDT".into(),
                    start_ts_ms: i * 1000,
                    open: dec!(100),
                    high: dec!(101),
                    low: dec!(99),
                    close: dec!(100.5),
                    volume: dec!(1),
                })
                .await
                .unwrap();
        }
        let candles = store.warmup_candles("BTCUSDT", 10).await.unwrap();
        assert_eq!(candles.len(), 3);
        assert_eq!(candles[0].start_ts_ms, 0);
        assert_eq!(candles[2].start_ts_ms, 2000);
    }

    #[tokio::test]
    async fn warmup_falls_back_to_downsampled_trades_when_no_candles() {
        let store = store().await;
        store
            .insert_trade("ETHUSDT", Side::Buy, dec!(2000), dec!(1), 500)
            .await
            .unwrap();
        store
            .insert_trade("ETHUSDT", Side::Buy, dec!(2010), dec!(1), 900)
            .await
            .unwrap();
        store
            .insert_trade("ETHUSDT", Side::Sell, dec!(1990), dec!(1), 1500)
            .await
            .unwrap();

        let candles = store.warmup_candles("ETHUSDT", 10).await.unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].start_ts_ms, 0);
        assert_eq!(candles[0].high, dec!(2010));
        assert_eq!(candles[1].start_ts_ms, 1000);
    }
}
