//! The control plane's HTTP + WebSocket surface (§4.6, §6): manual orders,
//! panic/lockout, arbitrary broadcast relay, health, and the `/logs` event
//! fan-out dashboards subscribe to. Grounded on the axum router + WS-upgrade
//! shape used by sibling pack repos (`cooprefr-bettersys`,
//! `orc2626-tech-sBot9999`); the teacher itself is headless.

use axum::{
    Json, Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::domain::ports::ControlEvent;
use crate::domain::trading::types::{Side, Signal};
use crate::infrastructure::broadcast::EventBus;

/// Shared state behind every handler. `manual_order_tx` is the same
/// execution-queue entry point the Strategy stage feeds (§4.5: "identical
/// type"), so a manual order and a strategy signal race fairly into one
/// `ExecutionEngine`.
#[derive(Clone)]
pub struct ControlPlaneState {
    pub event_bus: Arc<EventBus>,
    pub raw_broadcast: broadcast::Sender<serde_json::Value>,
    pub manual_order_tx: mpsc::Sender<Signal>,
    pub lockout: Arc<AtomicBool>,
    pub broadcast_timeout_ms: u64,
}

impl ControlPlaneState {
    pub fn new(
        event_bus: Arc<EventBus>,
        manual_order_tx: mpsc::Sender<Signal>,
        lockout: Arc<AtomicBool>,
        broadcast_timeout_ms: u64,
    ) -> Self {
        let (raw_broadcast, _) = broadcast::channel(256);
        Self {
            event_bus,
            raw_broadcast,
            manual_order_tx,
            lockout,
            broadcast_timeout_ms,
        }
    }
}

pub fn router(state: ControlPlaneState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/orders/execute", post(orders_execute))
        .route("/panic", post(panic))
        .route("/internal/broadcast", post(internal_broadcast))
        .route("/logs", get(logs_ws))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
    adapters: Vec<&'static str>,
    lockout: bool,
}

async fn health(State(state): State<ControlPlaneState>) -> impl IntoResponse {
    Json(HealthResponse {
        ok: true,
        adapters: vec!["paper"],
        lockout: state.lockout.load(Ordering::Relaxed),
    })
}

/// `POST /orders/execute` body (§6): `{symbol, side, qty, price?, type?}`.
/// `type` is accepted and ignored — every manual order becomes a market
/// order against the paper engine's idempotence/sizing/cooldown gates,
/// matching §9's replacement of the original's brittle WS-log order format
/// with an explicit typed endpoint.
#[derive(Debug, Deserialize)]
struct OrderRequest {
    symbol: String,
    side: String,
    qty: Decimal,
    price: Option<Decimal>,
    #[serde(rename = "type")]
    #[allow(dead_code)]
    order_type: Option<String>,
}

#[derive(Debug, Serialize)]
struct OrderResponse {
    status: &'static str,
    order: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

async fn orders_execute(
    State(state): State<ControlPlaneState>,
    Json(body): Json<OrderRequest>,
) -> impl IntoResponse {
    if state.lockout.load(Ordering::Relaxed) {
        return (
            StatusCode::CONFLICT,
            Json(ErrorResponse {
                error: "engine is locked out".to_string(),
            }),
        )
            .into_response();
    }

    let side = match body.side.to_ascii_uppercase().as_str() {
        "BUY" => Side::Buy,
        "SELL" => Side::Sell,
        other => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: format!("unknown side: {other}"),
                }),
            )
                .into_response();
        }
    };

    if body.qty <= Decimal::ZERO {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "qty must be positive".to_string(),
            }),
        )
            .into_response();
    }

    let price = body.price.unwrap_or(Decimal::ZERO);
    let ts_ms = chrono::Utc::now().timestamp_millis();
    let signal = Signal::new(body.symbol.clone(), side, price, ts_ms, "manual_order", Decimal::ZERO, Decimal::ZERO);

    match state.manual_order_tx.try_send(signal.clone()) {
        Ok(()) => {
            info!(symbol = %body.symbol, side = %side, qty = %body.qty, "manual order received");
            (
                StatusCode::OK,
                Json(OrderResponse {
                    status: "received",
                    order: serde_json::json!({
                        "id": signal.id,
                        "symbol": signal.symbol,
                        "side": body.side,
                        "qty": body.qty,
                        "price": signal.price,
                    }),
                }),
            )
                .into_response()
        }
        Err(_) => {
            warn!("manual order dropped: execution queue full");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorResponse {
                    error: "execution queue is full".to_string(),
                }),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Serialize)]
struct PanicResponse {
    status: &'static str,
}

async fn panic(State(state): State<ControlPlaneState>) -> impl IntoResponse {
    state.lockout.store(true, Ordering::Relaxed);
    state.event_bus.publish(ControlEvent::Log {
        message: "PANIC activated: all incoming signals will be rejected".to_string(),
    });
    warn!("panic activated via control plane");
    Json(PanicResponse {
        status: "panic_activated",
    })
}

#[derive(Debug, Serialize)]
struct BroadcastResponse {
    status: &'static str,
}

async fn internal_broadcast(
    State(state): State<ControlPlaneState>,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    let _ = state.raw_broadcast.send(body);
    Json(BroadcastResponse { status: "broadcast" })
}

async fn logs_ws(ws: WebSocketUpgrade, State(state): State<ControlPlaneState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_logs_socket(socket, state))
}

/// Best-effort fan-out (§4.6): a client that can't keep up, disconnects, or
/// fails to drain a frame within `broadcast_timeout_ms` is dropped from the
/// set by letting its send loop end.
async fn handle_logs_socket(mut socket: WebSocket, state: ControlPlaneState) {
    let mut event_rx = state.event_bus.subscribe();
    let mut raw_rx = state.raw_broadcast.subscribe();
    let send_timeout = std::time::Duration::from_millis(state.broadcast_timeout_ms);

    loop {
        tokio::select! {
            event = event_rx.recv() => {
                match event {
                    Ok(event) => {
                        let Ok(text) = serde_json::to_string(&event) else { continue };
                        match tokio::time::timeout(send_timeout, socket.send(Message::Text(text.into()))).await {
                            Ok(Ok(())) => {}
                            Ok(Err(_)) | Err(_) => break,
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            raw = raw_rx.recv() => {
                match raw {
                    Ok(value) => {
                        match tokio::time::timeout(send_timeout, socket.send(Message::Text(value.to_string().into()))).await {
                            Ok(Ok(())) => {}
                            Ok(Err(_)) | Err(_) => break,
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn state() -> (ControlPlaneState, mpsc::Receiver<Signal>) {
        let event_bus = Arc::new(EventBus::new(16));
        let (tx, rx) = mpsc::channel(16);
        (
            ControlPlaneState::new(event_bus, tx, Arc::new(AtomicBool::new(false)), 500),
            rx,
        )
    }

    #[tokio::test]
    async fn panic_sets_lockout_and_broadcasts() {
        let (state, _rx) = state();
        let mut sub = state.event_bus.subscribe();
        let resp = panic(State(state.clone())).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(state.lockout.load(Ordering::Relaxed));
        assert!(matches!(sub.try_recv().unwrap(), ControlEvent::Log { .. }));
    }

    #[tokio::test]
    async fn orders_execute_rejects_when_locked_out() {
        let (state, _rx) = state();
        state.lockout.store(true, Ordering::Relaxed);
        let body = OrderRequest {
            symbol: "BTCUSDT".to_string(),
            side: "BUY".to_string(),
            qty: dec!(0.01),
            price: None,
            order_type: None,
        };
        let resp = orders_execute(State(state), Json(body)).await.into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn orders_execute_enqueues_signal_when_open() {
        let (state, mut rx) = state();
        let body = OrderRequest {
            symbol: "BTCUSDT".to_string(),
            side: "buy".to_string(),
            qty: dec!(0.01),
            price: Some(dec!(65000)),
            order_type: None,
        };
        let resp = orders_execute(State(state), Json(body)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let signal = rx.try_recv().unwrap();
        assert_eq!(signal.symbol, "BTCUSDT");
    }

    #[tokio::test]
    async fn orders_execute_rejects_non_positive_qty() {
        let (state, _rx) = state();
        let body = OrderRequest {
            symbol: "BTCUSDT".to_string(),
            side: "BUY".to_string(),
            qty: dec!(0),
            price: None,
            order_type: None,
        };
        let resp = orders_execute(State(state), Json(body)).await.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
