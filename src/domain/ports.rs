use crate::domain::trading::portfolio::Portfolio;
use crate::domain::trading::types::{Candle, PositionSide, Side};
use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A snapshot of one open position as reported in a `pnl` broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub symbol: String,
    pub side: PositionSide,
    pub entry: Decimal,
    pub mark: Decimal,
    pub qty: Decimal,
    pub pnl: Decimal,
}

/// The four event shapes broadcast on the control plane's `/logs` WebSocket (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlEvent {
    Ticker {
        symbol: String,
        price: Decimal,
    },
    Pnl {
        balance: Decimal,
        equity: Decimal,
        pnl_unrealized: Decimal,
        positions: Vec<PositionSnapshot>,
        timestamp: i64,
    },
    Trade {
        symbol: String,
        side: PositionSide,
        price: Decimal,
        qty: Decimal,
        pnl: Option<Decimal>,
    },
    Log {
        message: String,
    },
}

/// The narrow sink the core needs from an external time-series store: append
/// trades and OHLCV rows, and answer a warmup query (§6). QuestDB itself is
/// out of scope; adapters live in `infrastructure::persistence`.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn append_trade(
        &self,
        symbol: &str,
        side: Side,
        price: Decimal,
        qty: Decimal,
        ts_ms: i64,
    ) -> Result<()>;

    async fn append_candle(&self, candle: &Candle) -> Result<()>;

    /// Up to `limit` most recent candles for `symbol`, most recent last.
    async fn warmup_candles(&self, symbol: &str, limit: usize) -> Result<Vec<Candle>>;
}

/// Durable portfolio persistence, implemented with the tmp-then-rename
/// discipline of §4.5 step 8 / §6.
pub trait PortfolioStore: Send + Sync {
    fn load(&self) -> Result<Option<Portfolio>>;
    fn save(&self, portfolio: &Portfolio) -> Result<()>;
}

/// A handle to the control plane's WS fan-out (§9: replaces the singleton
/// log broadcaster with an explicit dependency).
pub trait Broadcaster: Send + Sync {
    fn publish(&self, event: ControlEvent);
}
