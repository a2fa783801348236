use crate::domain::trading::types::{Side, Tick};
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, warn};

/// Builds the combined-stream URL for an aggregated-trade subscription,
/// mirroring the teacher's URL-param-vs-JSON-SUBSCRIBE split for small vs.
/// large symbol lists.
fn build_stream_url(base_url: &str, symbols: &[String]) -> (String, Vec<String>) {
    let streams: Vec<String> = symbols
        .iter()
        .map(|s| format!("{}@aggTrade", s.to_lowercase()))
        .collect();

    let use_url_params = symbols.len() < 50;
    let mut url = format!("{}/stream", base_url.trim_end_matches('/'));
    let remaining_subscribe = if use_url_params {
        let query = streams.join("/");
        if !query.is_empty() {
            url.push_str("?streams=");
            url.push_str(&query);
        }
        Vec::new()
    } else {
        streams
    };
    (url, remaining_subscribe)
}

/// One connection attempt: connects, subscribes (if needed), then reads
/// until the socket closes or errors. `last_msg_at` is bumped on every
/// inbound frame so the ingestor's watchdog can detect silence.
///
/// Newest-drop backpressure (§4.1): `tick_tx.try_send` is used instead of
/// `.send().await` so a full queue never stalls the WS read loop.
pub async fn connect_and_stream(
    ws_url: &str,
    symbols: &[String],
    tick_tx: &mpsc::Sender<Tick>,
    last_msg_at: &Arc<AtomicI64>,
) -> Result<()> {
    let (url, subscribe_batch) = build_stream_url(ws_url, symbols);
    debug!("connecting to exchange feed at {}", url);

    let (ws_stream, _) = connect_async(&url)
        .await
        .context("failed to connect to exchange WebSocket")?;

    let (mut write, mut read) = ws_stream.split();

    if !subscribe_batch.is_empty() {
        const BATCH_SIZE: usize = 50;
        for (i, chunk) in subscribe_batch.chunks(BATCH_SIZE).enumerate() {
            let msg = serde_json::json!({
                "method": "SUBSCRIBE",
                "params": chunk,
                "id": i + 1,
            });
            write
                .send(Message::Text(msg.to_string().into()))
                .await
                .context("failed to send subscribe frame")?;
        }
    }

    let (out_tx, mut out_rx) = mpsc::channel::<Message>(32);
    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if write.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut dropped_since_log = false;
    while let Some(msg_result) = read.next().await {
        last_msg_at.store(now_ms(), Ordering::Relaxed);
        match msg_result {
            Ok(Message::Text(text)) => {
                if let Err(e) = handle_message(&text, tick_tx, &mut dropped_since_log) {
                    warn!("malformed exchange message, skipping: {}", e);
                }
            }
            Ok(Message::Ping(_)) => {
                let _ = out_tx.send(Message::Pong(Vec::new().into())).await;
            }
            Ok(Message::Close(frame)) => {
                debug!("exchange closed the connection: {:?}", frame);
                break;
            }
            Err(e) => {
                error!("exchange WebSocket read error: {}", e);
                break;
            }
            _ => {}
        }
    }

    drop(out_tx);
    let _ = writer.await;
    Ok(())
}

fn handle_message(
    text: &str,
    tick_tx: &mpsc::Sender<Tick>,
    dropped_since_log: &mut bool,
) -> Result<()> {
    #[derive(Debug, Deserialize)]
    struct StreamMessage {
        stream: String,
        data: serde_json::Value,
    }

    #[derive(Debug, Deserialize)]
    struct AggTrade {
        #[serde(rename = "s")]
        symbol: String,
        #[serde(rename = "p")]
        price: String,
        #[serde(rename = "q")]
        qty: String,
        #[serde(rename = "m")]
        is_buyer_maker: bool,
        #[serde(rename = "T")]
        ts_ms: i64,
    }

    let envelope: StreamMessage = serde_json::from_str(text)?;
    if !envelope.stream.ends_with("@aggTrade") {
        return Ok(());
    }

    let trade: AggTrade = serde_json::from_value(envelope.data)?;
    let price = Decimal::from_str(&trade.price).context("bad price field")?;
    let qty = Decimal::from_str(&trade.qty).context("bad qty field")?;

    let tick = Tick {
        symbol: trade.symbol,
        price,
        qty,
        side: if trade.is_buyer_maker {
            Side::Sell
        } else {
            Side::Buy
        },
        ts_ms: trade.ts_ms,
    };

    match tick_tx.try_send(tick) {
        Ok(()) => {
            *dropped_since_log = false;
        }
        Err(mpsc::error::TrySendError::Full(_)) => {
            if !*dropped_since_log {
                warn!("ingestor output queue full, dropping newest tick");
                *dropped_since_log = true;
            }
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            // Receiver gone; nothing to do, the caller will shut the loop down.
        }
    }

    Ok(())
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_stream_url_uses_query_params_for_small_lists() {
        let symbols = vec!["btcusdt".to_string(), "ethusdt".to_string()];
        let (url, batch) = build_stream_url("wss://stream.example.com", &symbols);
        assert!(url.contains("streams=btcusdt@aggTrade/ethusdt@aggTrade"));
        assert!(batch.is_empty());
    }

    #[test]
    fn build_stream_url_defers_to_json_subscribe_for_large_lists() {
        let symbols: Vec<String> = (0..60).map(|i| format!("sym{i}")).collect();
        let (url, batch) = build_stream_url("wss://stream.example.com", &symbols);
        assert!(!url.contains("streams="));
        assert_eq!(batch.len(), 60);
    }
}
