use crate::config::Config;
use crate::domain::trading::types::{Candle, Tick};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Folds ticks into fixed-width OHLCV candles per symbol (§4.3). Owns the
/// open-candles map exclusively; no other task ever touches it.
struct Aggregator {
    interval_ms: i64,
    open_candles: HashMap<String, Candle>,
}

impl Aggregator {
    fn new(interval_ms: i64) -> Self {
        Self {
            interval_ms,
            open_candles: HashMap::new(),
        }
    }

    /// Returns a closed candle when `tick` crosses into a new bucket.
    fn on_tick(&mut self, tick: &Tick) -> Option<Candle> {
        let bucket = (tick.ts_ms / self.interval_ms) * self.interval_ms;

        match self.open_candles.get_mut(&tick.symbol) {
            None => {
                self.open_candles.insert(
                    tick.symbol.clone(),
                    Candle {
                        symbol: tick.symbol.clone(),
                        start_ts_ms: bucket,
                        open: tick.price,
                        high: tick.price,
                        low: tick.price,
                        close: tick.price,
                        volume: tick.qty,
                    },
                );
                None
            }
            Some(current) if bucket == current.start_ts_ms => {
                current.update(tick.price, tick.qty);
                None
            }
            Some(current) if bucket > current.start_ts_ms => {
                let closed = current.clone();
                *current = Candle {
                    symbol: tick.symbol.clone(),
                    start_ts_ms: bucket,
                    open: tick.price,
                    high: tick.price,
                    low: tick.price,
                    close: tick.price,
                    volume: tick.qty,
                };
                Some(closed)
            }
            Some(_) => {
                debug!(
                    "candle_aggregator: discarding out-of-order tick for {} at bucket {}",
                    tick.symbol, bucket
                );
                None
            }
        }
    }

    fn flush_open_candles(&mut self) -> Vec<Candle> {
        self.open_candles.drain().map(|(_, c)| c).collect()
    }
}

pub async fn run(
    config: Arc<Config>,
    mut tick_rx: mpsc::Receiver<Tick>,
    candle_tx: mpsc::Sender<Candle>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut aggregator = Aggregator::new(config.candle_interval_ms.max(1));

    loop {
        tokio::select! {
            maybe_tick = tick_rx.recv() => {
                let Some(tick) = maybe_tick else {
                    info!("candle_aggregator: tick source closed, flushing and exiting");
                    break;
                };
                if let Some(closed) = aggregator.on_tick(&tick)
                    && candle_tx.send(closed).await.is_err() {
                        info!("candle_aggregator: candle queue closed, exiting");
                        return;
                    }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("candle_aggregator: shutdown requested, flushing and exiting");
                    break;
                }
            }
        }
    }

    for candle in aggregator.flush_open_candles() {
        if candle_tx.send(candle).await.is_err() {
            warn!("candle_aggregator: could not flush open candle, queue already closed");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::trading::types::Side;
    use rust_decimal_macros::dec;

    fn tick(symbol: &str, price: rust_decimal::Decimal, qty: rust_decimal::Decimal, ts_ms: i64) -> Tick {
        Tick {
            symbol: symbol.to_string(),
            price,
            qty,
            side: Side::Buy,
            ts_ms,
        }
    }

    #[test]
    fn emits_candle_on_bucket_rollover() {
        let mut agg = Aggregator::new(1000);
        assert!(agg.on_tick(&tick("BTCUSDT", dec!(100), dec!(1), 100)).is_none());
        assert!(agg.on_tick(&tick("BTCUSDT", dec!(105), dec!(2), 500)).is_none());
        assert!(agg.on_tick(&tick("BTCUSDT", dec!(95), dec!(1), 999)).is_none());

        let closed = agg.on_tick(&tick("BTCUSDT", dec!(102), dec!(1), 1001)).unwrap();
        assert_eq!(closed.start_ts_ms, 0);
        assert_eq!(closed.open, dec!(100));
        assert_eq!(closed.high, dec!(105));
        assert_eq!(closed.low, dec!(95));
        assert_eq!(closed.close, dec!(95));
        assert_eq!(closed.volume, dec!(4));
    }

    #[test]
    fn tick_exactly_on_boundary_opens_new_bucket() {
        let mut agg = Aggregator::new(1000);
        agg.on_tick(&tick("BTCUSDT", dec!(100), dec!(1), 0));
        let closed = agg.on_tick(&tick("BTCUSDT", dec!(101), dec!(1), 1000)).unwrap();
        assert_eq!(closed.start_ts_ms, 0);
    }

    #[test]
    fn out_of_order_tick_is_discarded() {
        let mut agg = Aggregator::new(1000);
        agg.on_tick(&tick("BTCUSDT", dec!(100), dec!(1), 2000));
        assert!(agg.on_tick(&tick("BTCUSDT", dec!(999), dec!(1), 1000)).is_none());
        let current = agg.open_candles.get("BTCUSDT").unwrap();
        assert_eq!(current.close, dec!(100));
    }

    #[test]
    fn flush_open_candles_returns_all_symbols() {
        let mut agg = Aggregator::new(1000);
        agg.on_tick(&tick("BTCUSDT", dec!(100), dec!(1), 0));
        agg.on_tick(&tick("ETHUSDT", dec!(2000), dec!(1), 0));
        let flushed = agg.flush_open_candles();
        assert_eq!(flushed.len(), 2);
        assert!(agg.open_candles.is_empty());
    }
}
