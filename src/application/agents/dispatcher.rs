use crate::config::Config;
use crate::domain::ports::{Broadcaster, ControlEvent};
use crate::domain::trading::types::Tick;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::info;

/// Fans out each ingested tick to the persistence queue and the aggregator
/// queue (§4.2), in that order, then samples every Nth tick onto the
/// control-plane ticker broadcast. Unlike the ingestor's newest-drop edge,
/// both downstream sends block on a full queue, propagating backpressure
/// upstream to the ingestor's own queue.
pub async fn run(
    config: Arc<Config>,
    mut tick_rx: mpsc::Receiver<Tick>,
    persistence_tx: mpsc::Sender<Tick>,
    aggregator_tx: mpsc::Sender<Tick>,
    broadcaster: Arc<dyn Broadcaster>,
    mut shutdown: watch::Receiver<bool>,
) {
    let sample_rate = config.ticker_sample_rate.max(1);
    let mut seen: u64 = 0;

    loop {
        tokio::select! {
            maybe_tick = tick_rx.recv() => {
                let Some(tick) = maybe_tick else {
                    info!("dispatcher: tick source closed, exiting");
                    return;
                };

                seen += 1;
                if persistence_tx.send(tick.clone()).await.is_err() {
                    info!("dispatcher: persistence queue closed, exiting");
                    return;
                }
                if aggregator_tx.send(tick.clone()).await.is_err() {
                    info!("dispatcher: aggregator queue closed, exiting");
                    return;
                }

                if seen % sample_rate == 0 {
                    broadcaster.publish(ControlEvent::Ticker {
                        symbol: tick.symbol,
                        price: tick.price,
                    });
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("dispatcher: shutdown requested, exiting");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::trading::types::Side;
    use rust_decimal_macros::dec;
    use std::sync::Mutex;

    struct RecordingBroadcaster {
        events: Mutex<Vec<ControlEvent>>,
    }

    impl Broadcaster for RecordingBroadcaster {
        fn publish(&self, event: ControlEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn tick(symbol: &str, price: rust_decimal::Decimal) -> Tick {
        Tick {
            symbol: symbol.to_string(),
            price,
            qty: dec!(1),
            side: Side::Buy,
            ts_ms: 0,
        }
    }

    #[tokio::test]
    async fn forwards_every_tick_and_samples_broadcasts() {
        let config = Arc::new(test_config());
        let (tick_tx, tick_rx) = mpsc::channel(16);
        let (persistence_tx, mut persistence_rx) = mpsc::channel(16);
        let (aggregator_tx, mut aggregator_rx) = mpsc::channel(16);
        let broadcaster = Arc::new(RecordingBroadcaster {
            events: Mutex::new(Vec::new()),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(run(
            config,
            tick_rx,
            persistence_tx,
            aggregator_tx,
            broadcaster.clone(),
            shutdown_rx,
        ));

        for i in 0..10 {
            tick_tx.send(tick("BTCUSDT", dec!(100) + rust_decimal::Decimal::from(i))).await.unwrap();
        }
        for _ in 0..10 {
            persistence_rx.recv().await.unwrap();
            aggregator_rx.recv().await.unwrap();
        }

        assert_eq!(broadcaster.events.lock().unwrap().len(), 1);

        drop(tick_tx);
        shutdown_tx.send(true).ok();
        handle.await.unwrap();
    }

    fn test_config() -> Config {
        Config {
            symbols: vec!["BTCUSDT".into()],
            exchange_ws_url: "wss://example.com".into(),
            candle_interval_ms: 1000,
            watchdog_timeout_secs: 15,
            reconnect_initial_backoff_secs: 1,
            reconnect_max_backoff_secs: 30,
            tick_queue_capacity: 5000,
            candle_queue_capacity: 1000,
            execution_queue_capacity: 300,
            ticker_sample_rate: 10,
            broadcast_timeout_ms: 500,
            learner_lookback: 50,
            learner_min_train_samples: 50,
            learner_learning_rate: 0.05,
            learner_enabled: true,
            prob_buy_threshold: 0.60,
            prob_sell_threshold: 0.40,
            adx_threshold: 25.0,
            warmup_candles: 300,
            warmup_candles_with_learner: 2000,
            initial_cash: dec!(10000),
            risk_per_trade_pct: dec!(0.01),
            max_position_pct: dec!(0.20),
            fee_rate: dec!(0.0004),
            cooldown_ms: 3000,
            min_notional: dec!(5),
            step_size: dec!(0.001),
            max_idempotence_entries: 1000,
            persistence_sink_addr: "127.0.0.1:9009".into(),
            persistence_db_path: "data/warmup.db".into(),
            portfolio_file_path: "data/portfolio.json".into(),
            control_plane_port: 8090,
            pnl_broadcast_interval_ms: 1000,
        }
    }
}
