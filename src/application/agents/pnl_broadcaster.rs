use crate::application::agents::execution::ExecutionEngine;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::{Duration, interval};
use tracing::info;

/// Periodic task (§2, §4.5 equity computation) that marks open positions
/// against the latest candle closes fed by the Strategy stage and publishes
/// a `pnl` snapshot on the configured cadence.
pub async fn run(
    engine: Arc<Mutex<ExecutionEngine>>,
    mut mark_rx: mpsc::Receiver<(String, Decimal)>,
    interval_ms: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(Duration::from_millis(interval_ms.max(1)));

    loop {
        tokio::select! {
            maybe_mark = mark_rx.recv() => {
                match maybe_mark {
                    Some((symbol, price)) => engine.lock().await.update_mark(&symbol, price),
                    None => {
                        info!("pnl_broadcaster: mark source closed, exiting");
                        return;
                    }
                }
            }
            _ = ticker.tick() => {
                let now_ms = chrono::Utc::now().timestamp_millis();
                engine.lock().await.broadcast_portfolio(&HashMap::new(), now_ms);
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("pnl_broadcaster: shutdown requested, exiting");
                    return;
                }
            }
        }
    }
}
