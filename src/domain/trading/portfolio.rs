use crate::domain::trading::types::{Position, TradeRecord};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The Execution Engine's owned state: cash, open positions (at most one per
/// symbol), and the running realized PnL. Persisted atomically after every
/// open/close via `infrastructure::persistence::portfolio_store`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Portfolio {
    #[serde(rename = "balance")]
    pub cash_balance: Decimal,
    pub positions: HashMap<String, Position>,
    #[serde(skip)]
    pub realized_pnl: Decimal,
}

impl Portfolio {
    pub fn new(starting_cash: Decimal) -> Self {
        Self {
            cash_balance: starting_cash,
            positions: HashMap::new(),
            realized_pnl: Decimal::ZERO,
        }
    }

    /// Equity = cash + sum of unrealized PnL over open positions, marked at
    /// the caller-supplied price when present, else the entry price.
    pub fn equity(&self, marks: &HashMap<String, Decimal>) -> Decimal {
        self.cash_balance + self.unrealized_pnl(marks)
    }

    pub fn unrealized_pnl(&self, marks: &HashMap<String, Decimal>) -> Decimal {
        self.positions
            .values()
            .map(|pos| {
                let mark = marks.get(&pos.symbol).copied().unwrap_or(pos.entry_price);
                pos.unrealized_pnl(mark)
            })
            .sum()
    }

    pub fn record_close(&mut self, trade: &TradeRecord) {
        self.realized_pnl += trade.pnl;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::trading::types::PositionSide;
    use rust_decimal_macros::dec;

    fn position(symbol: &str, side: PositionSide, entry: Decimal, qty: Decimal) -> Position {
        Position {
            symbol: symbol.to_string(),
            side,
            entry_price: entry,
            qty,
            opened_ts: 0,
            stop_loss: Decimal::ZERO,
            take_profit: Decimal::ZERO,
        }
    }

    #[test]
    fn equity_uses_mark_when_present_else_entry() {
        let mut p = Portfolio::new(dec!(10000));
        p.cash_balance = dec!(8000);
        p.positions.insert(
            "BTCUSDT".into(),
            position("BTCUSDT", PositionSide::Long, dec!(100), dec!(10)),
        );

        let mut marks = HashMap::new();
        marks.insert("BTCUSDT".to_string(), dec!(110));
        assert_eq!(p.equity(&marks), dec!(8000) + dec!(100));

        assert_eq!(p.equity(&HashMap::new()), dec!(8000));
    }

    #[test]
    fn unrealized_pnl_short_position() {
        let mut p = Portfolio::new(dec!(10000));
        p.positions.insert(
            "ETHUSDT".into(),
            position("ETHUSDT", PositionSide::Short, dec!(2000), dec!(1)),
        );
        let mut marks = HashMap::new();
        marks.insert("ETHUSDT".to_string(), dec!(1900));
        assert_eq!(p.unrealized_pnl(&marks), dec!(100));
    }

    #[test]
    fn record_close_accumulates_realized_pnl() {
        let mut p = Portfolio::new(dec!(10000));
        let trade = TradeRecord {
            symbol: "BTCUSDT".into(),
            side: PositionSide::Long,
            entry_price: dec!(100),
            exit_price: dec!(120),
            qty: dec!(10),
            pnl: dec!(200),
            opened_ts: 0,
            closed_ts: 1,
        };
        p.record_close(&trade);
        assert_eq!(p.realized_pnl, dec!(200));
    }
}
