use crate::config::Config;
use crate::domain::trading::types::Tick;
use crate::infrastructure::ingest::connect_and_stream;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// Runs the exchange WebSocket subscription until `shutdown` fires,
/// surviving network faults with exponential backoff and a silence
/// watchdog (§4.1). Emits normalized ticks to `tick_tx`; the channel itself
/// provides the newest-drop backpressure semantics via `try_send` inside
/// `infrastructure::ingest`.
pub async fn run(config: Arc<Config>, tick_tx: mpsc::Sender<Tick>, mut shutdown: watch::Receiver<bool>) {
    let mut backoff = Duration::from_secs(config.reconnect_initial_backoff_secs.max(1));
    let max_backoff = Duration::from_secs(config.reconnect_max_backoff_secs.max(1));
    let watchdog_timeout = Duration::from_secs(config.watchdog_timeout_secs.max(1));

    loop {
        if *shutdown.borrow() {
            info!("ingestor: shutdown requested, exiting");
            return;
        }

        let start = now_ms();
        let last_msg_at = Arc::new(AtomicI64::new(start));

        tokio::select! {
            res = connect_and_stream(&config.exchange_ws_url, &config.symbols, &tick_tx, &last_msg_at) => {
                match res {
                    Ok(()) => info!("ingestor: connection closed gracefully"),
                    Err(e) => warn!("ingestor: connection error: {}", e),
                }
            }
            _ = watchdog(last_msg_at.clone(), watchdog_timeout) => {
                warn!("ingestor: watchdog tripped after {:?} of silence, forcing reconnect", watchdog_timeout);
            }
            _ = shutdown.changed() => {
                info!("ingestor: shutdown requested mid-connection, exiting");
                return;
            }
        }

        if last_msg_at.load(Ordering::Relaxed) > start {
            backoff = Duration::from_secs(config.reconnect_initial_backoff_secs.max(1));
        } else {
            backoff = (backoff * 2).min(max_backoff);
        }

        tokio::time::sleep(backoff).await;
    }
}

async fn watchdog(last_msg_at: Arc<AtomicI64>, timeout: Duration) {
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    loop {
        ticker.tick().await;
        let elapsed = now_ms() - last_msg_at.load(Ordering::Relaxed);
        if elapsed >= timeout.as_millis() as i64 {
            return;
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn watchdog_returns_after_silence_elapses() {
        let last_msg_at = Arc::new(AtomicI64::new(now_ms()));
        let timeout = Duration::from_secs(15);
        let handle = tokio::spawn(watchdog(last_msg_at.clone(), timeout));
        tokio::time::advance(Duration::from_secs(16)).await;
        handle.await.unwrap();
    }
}
