use crate::domain::trading::types::Candle;
use tokio::sync::{mpsc, watch};
use tracing::info;

/// Copies each closed candle to the strategy stage and to the persistence
/// sink (§2, §4.3). Both sends block on a full queue (§5 block-to-backpressure).
pub async fn run(
    mut candle_rx: mpsc::Receiver<Candle>,
    strategy_tx: mpsc::Sender<Candle>,
    persistence_tx: mpsc::Sender<Candle>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            maybe_candle = candle_rx.recv() => {
                let Some(candle) = maybe_candle else {
                    info!("candle_dispatcher: candle source closed, exiting");
                    return;
                };
                if persistence_tx.send(candle.clone()).await.is_err() {
                    info!("candle_dispatcher: persistence queue closed, exiting");
                    return;
                }
                if strategy_tx.send(candle).await.is_err() {
                    info!("candle_dispatcher: strategy queue closed, exiting");
                    return;
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("candle_dispatcher: shutdown requested, exiting");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn candle() -> Candle {
        Candle {
            symbol: "BTCUSDT".into(),
            start_ts_ms: 0,
            open: dec!(100),
            high: dec!(101),
            low: dec!(99),
            close: dec!(100.5),
            volume: dec!(1),
        }
    }

    #[tokio::test]
    async fn forwards_candle_to_both_downstreams() {
        let (candle_tx, candle_rx) = mpsc::channel(4);
        let (strategy_tx, mut strategy_rx) = mpsc::channel(4);
        let (persistence_tx, mut persistence_rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(run(candle_rx, strategy_tx, persistence_tx, shutdown_rx));

        candle_tx.send(candle()).await.unwrap();
        assert_eq!(persistence_rx.recv().await.unwrap().symbol, "BTCUSDT");
        assert_eq!(strategy_rx.recv().await.unwrap().symbol, "BTCUSDT");

        drop(candle_tx);
        shutdown_tx.send(true).ok();
        handle.await.unwrap();
    }
}
