use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Buy/sell direction of a tick or a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// The side of an open Position, distinct from `Side` because a position
/// persists across its lifetime while a signal/tick side is a single event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl From<Side> for PositionSide {
    fn from(side: Side) -> Self {
        match side {
            Side::Buy => PositionSide::Long,
            Side::Sell => PositionSide::Short,
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionSide::Long => write!(f, "LONG"),
            PositionSide::Short => write!(f, "SHORT"),
        }
    }
}

/// A single normalized trade event off the exchange feed. Never persisted;
/// consumed once by the dispatcher and copied onward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub price: Decimal,
    pub qty: Decimal,
    pub side: Side,
    pub ts_ms: i64,
}

/// A closed (or currently-open, while the aggregator still owns it) OHLCV bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub start_ts_ms: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Candle {
    pub fn update(&mut self, price: Decimal, qty: Decimal) {
        if price > self.high {
            self.high = price;
        }
        if price < self.low {
            self.low = price;
        }
        self.close = price;
        self.volume += qty;
    }
}

/// The strategy's intent to enter or reverse a position. Carries its own
/// unique id so the Execution Engine can de-duplicate it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub price: Decimal,
    pub ts_ms: i64,
    pub reason: String,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
}

impl Signal {
    pub fn new(
        symbol: impl Into<String>,
        side: Side,
        price: Decimal,
        ts_ms: i64,
        reason: impl Into<String>,
        stop_loss: Decimal,
        take_profit: Decimal,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol: symbol.into(),
            side,
            price,
            ts_ms,
            reason: reason.into(),
            stop_loss,
            take_profit,
        }
    }
}

/// An open paper position. Exactly one per symbol may exist at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    pub entry_price: Decimal,
    pub qty: Decimal,
    #[serde(rename = "timestamp")]
    pub opened_ts: i64,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
}

impl Position {
    /// Unrealized PnL at the given mark price.
    pub fn unrealized_pnl(&self, mark: Decimal) -> Decimal {
        match self.side {
            PositionSide::Long => (mark - self.entry_price) * self.qty,
            PositionSide::Short => (self.entry_price - mark) * self.qty,
        }
    }
}

/// A closed trade, published on the `trade` control-plane event and kept in
/// the in-memory trade tape for the lifetime of the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub symbol: String,
    pub side: PositionSide,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub qty: Decimal,
    pub pnl: Decimal,
    pub opened_ts: i64,
    pub closed_ts: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn candle_update_tracks_high_low_close_volume() {
        let mut c = Candle {
            symbol: "BTCUSDT".into(),
            start_ts_ms: 0,
            open: dec!(100),
            high: dec!(100),
            low: dec!(100),
            close: dec!(100),
            volume: dec!(1),
        };
        c.update(dec!(105), dec!(2));
        c.update(dec!(95), dec!(3));
        assert_eq!(c.high, dec!(105));
        assert_eq!(c.low, dec!(95));
        assert_eq!(c.close, dec!(95));
        assert_eq!(c.volume, dec!(6));
    }

    #[test]
    fn position_unrealized_pnl_long_and_short() {
        let long = Position {
            symbol: "BTCUSDT".into(),
            side: PositionSide::Long,
            entry_price: dec!(100),
            qty: dec!(2),
            opened_ts: 0,
            stop_loss: dec!(90),
            take_profit: dec!(120),
        };
        assert_eq!(long.unrealized_pnl(dec!(110)), dec!(20));

        let short = Position {
            side: PositionSide::Short,
            ..long
        };
        assert_eq!(short.unrealized_pnl(dec!(90)), dec!(20));
    }

    #[test]
    fn side_from_position_side_roundtrip() {
        assert_eq!(PositionSide::from(Side::Buy), PositionSide::Long);
        assert_eq!(PositionSide::from(Side::Sell), PositionSide::Short);
    }
}
