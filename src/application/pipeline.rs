//! Wires the pipeline stages of §2/§5 into a running system: one bounded
//! channel per queue named in §5, one task per stage, all sharing a single
//! shutdown `watch` so cancellation reaches every task (§5 cancellation
//! semantics). `run_live` is the `server` binary's main path; `run_backtest`
//! is the `--backtest` replay added in SPEC_FULL §2.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{info, warn};

use crate::application::agents::{candle_aggregator, candle_dispatcher, dispatcher, execution, ingestor, pnl_broadcaster, strategy};
use crate::config::Config;
use crate::domain::ports::{Broadcaster, PersistenceSink, PortfolioStore};
use crate::domain::trading::portfolio::Portfolio;
use crate::domain::trading::types::{Candle, Signal, Tick};
use crate::infrastructure::broadcast::EventBus;
use crate::infrastructure::persistence::{CompositeSink, LineProtocolSink, SqliteWarmupStore};
use crate::infrastructure::portfolio_store::FilePortfolioStore;
use crate::interfaces::control_plane::{self, ControlPlaneState};

/// Handle returned by [`run_live`]; holding it keeps every spawned task
/// alive, and dropping the shutdown sender (or calling [`PipelineHandle::shutdown`])
/// unwinds the whole pipeline in dependency order.
pub struct PipelineHandle {
    shutdown_tx: watch::Sender<bool>,
    pub control_plane_addr: SocketAddr,
    pub execution_engine: Arc<Mutex<execution::ExecutionEngine>>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl PipelineHandle {
    /// Signals every task to stop and waits for them to acknowledge (§5).
    /// The Aggregator flushes its open candles as part of its own shutdown
    /// path before this returns.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

pub async fn run_live(config: Config) -> Result<PipelineHandle> {
    let config = Arc::new(config);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let warmup_store = SqliteWarmupStore::new(&config.persistence_db_path)
        .await
        .context("failed to open warmup store")?;
    let line_sink = LineProtocolSink::new(config.persistence_sink_addr.clone());
    let persistence: Arc<dyn PersistenceSink> = Arc::new(CompositeSink::new(Arc::new(line_sink), Arc::new(warmup_store)));

    let portfolio_store: Arc<dyn PortfolioStore> = Arc::new(FilePortfolioStore::new(config.portfolio_file_path.clone()));
    let event_bus = Arc::new(EventBus::new(1024));
    let lockout = Arc::new(AtomicBool::new(false));

    let (tick_tx, tick_rx) = mpsc::channel::<Tick>(config.tick_queue_capacity);
    let (tick_persist_tx, tick_persist_rx) = mpsc::channel(config.tick_queue_capacity);
    let (tick_agg_tx, tick_agg_rx) = mpsc::channel(config.tick_queue_capacity);
    let (candle_tx, candle_rx) = mpsc::channel::<Candle>(config.candle_queue_capacity);
    let (candle_strategy_tx, candle_strategy_rx) = mpsc::channel(config.candle_queue_capacity);
    let (candle_persist_tx, candle_persist_rx) = mpsc::channel(config.candle_queue_capacity);
    let (signal_tx, signal_rx) = mpsc::channel::<Signal>(config.execution_queue_capacity);
    let (manual_tx, manual_rx) = mpsc::channel::<Signal>(config.execution_queue_capacity);
    let (mark_tx, mark_rx) = mpsc::channel(config.candle_queue_capacity);

    let engine = Arc::new(Mutex::new(execution::ExecutionEngine::new(
        config.clone(),
        portfolio_store,
        event_bus.clone() as Arc<dyn Broadcaster>,
        lockout.clone(),
    )));

    let mut tasks = Vec::new();

    tasks.push(tokio::spawn(ingestor::run(config.clone(), tick_tx, shutdown_rx.clone())));
    tasks.push(tokio::spawn(dispatcher::run(
        config.clone(),
        tick_rx,
        tick_persist_tx,
        tick_agg_tx,
        event_bus.clone() as Arc<dyn Broadcaster>,
        shutdown_rx.clone(),
    )));
    tasks.push(tokio::spawn(drain_ticks_to_persistence(persistence.clone(), tick_persist_rx)));
    tasks.push(tokio::spawn(candle_aggregator::run(config.clone(), tick_agg_rx, candle_tx, shutdown_rx.clone())));
    tasks.push(tokio::spawn(candle_dispatcher::run(
        candle_rx,
        candle_strategy_tx,
        candle_persist_tx,
        shutdown_rx.clone(),
    )));
    tasks.push(tokio::spawn(drain_candles_to_persistence(persistence.clone(), candle_persist_rx)));
    tasks.push(tokio::spawn(strategy::run(
        config.clone(),
        persistence.clone(),
        candle_strategy_rx,
        signal_tx,
        mark_tx,
        shutdown_rx.clone(),
    )));
    tasks.push(tokio::spawn(execution::run(engine.clone(), signal_rx, manual_rx, shutdown_rx.clone())));
    tasks.push(tokio::spawn(pnl_broadcaster::run(
        engine.clone(),
        mark_rx,
        config.pnl_broadcast_interval_ms,
        shutdown_rx.clone(),
    )));

    let control_plane_state = ControlPlaneState::new(
        event_bus.clone(),
        manual_tx,
        lockout.clone(),
        config.broadcast_timeout_ms,
    );
    let addr = SocketAddr::from(([0, 0, 0, 0], config.control_plane_port));
    let router = control_plane::router(control_plane_state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind control plane on {addr}"))?;
    let bound_addr = listener.local_addr().context("failed to read bound control plane address")?;

    let mut control_plane_shutdown = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move {
        let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
            let _ = control_plane_shutdown.changed().await;
        });
        if let Err(e) = serve.await {
            warn!("control plane server error: {}", e);
        }
    }));

    info!("pipeline running: control plane on {}", bound_addr);

    Ok(PipelineHandle {
        shutdown_tx,
        control_plane_addr: bound_addr,
        execution_engine: engine,
        tasks,
    })
}

async fn drain_ticks_to_persistence(sink: Arc<dyn PersistenceSink>, mut rx: mpsc::Receiver<Tick>) {
    while let Some(tick) = rx.recv().await {
        if let Err(e) = sink.append_trade(&tick.symbol, tick.side, tick.price, tick.qty, tick.ts_ms).await {
            warn!("failed to persist trade tick: {}", e);
        }
    }
}

async fn drain_candles_to_persistence(sink: Arc<dyn PersistenceSink>, mut rx: mpsc::Receiver<Candle>) {
    while let Some(candle) = rx.recv().await {
        if let Err(e) = sink.append_candle(&candle).await {
            warn!("failed to persist candle: {}", e);
        }
    }
}

struct NullPortfolioStore;
impl PortfolioStore for NullPortfolioStore {
    fn load(&self) -> Result<Option<Portfolio>> {
        Ok(None)
    }
    fn save(&self, _portfolio: &Portfolio) -> Result<()> {
        Ok(())
    }
}

/// A broadcaster that only logs — the backtest replay has no WS subscribers
/// and persistence is disabled end-to-end (SPEC_FULL §2).
struct LoggingBroadcaster;
impl Broadcaster for LoggingBroadcaster {
    fn publish(&self, event: crate::domain::ports::ControlEvent) {
        info!(?event, "backtest event");
    }
}

/// Replays a local CSV candle file (`timestamp,open,high,low,close,volume`)
/// through Strategy + Execution with persistence disabled (SPEC_FULL §2),
/// grounded on the original's `run_backtest.py` entry point. Every row is
/// attributed to `config.symbols[0]`. Returns the final portfolio, mirroring
/// the original's closing equity/PnL report.
pub async fn run_backtest(path: impl AsRef<Path>, config: Config) -> Result<Portfolio> {
    let symbol = config
        .symbols
        .first()
        .cloned()
        .context("backtest requires at least one configured symbol")?;
    let config = Arc::new(config);

    let content = tokio::fs::read_to_string(path.as_ref())
        .await
        .with_context(|| format!("failed to read backtest file {:?}", path.as_ref()))?;

    let mut engine = strategy::StrategyEngine::new(config.clone());
    let mut execution = execution::ExecutionEngine::new(
        config.clone(),
        Arc::new(NullPortfolioStore),
        Arc::new(LoggingBroadcaster),
        Arc::new(AtomicBool::new(false)),
    );

    let mut signals_emitted = 0usize;
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || lineno == 0 && line.starts_with("timestamp") {
            continue;
        }
        let candle = parse_backtest_row(&symbol, line)
            .with_context(|| format!("failed to parse backtest row {}", lineno + 1))?;

        if let Some(signal) = engine.on_candle(&candle, false) {
            signals_emitted += 1;
            let _ = execution.on_signal(signal);
        }
    }

    let portfolio = execution.portfolio().clone();
    info!(
        signals_emitted,
        cash_balance = %portfolio.cash_balance,
        realized_pnl = %portfolio.realized_pnl,
        "backtest complete"
    );
    Ok(portfolio)
}

fn parse_backtest_row(symbol: &str, line: &str) -> Result<Candle> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    anyhow::ensure!(fields.len() == 6, "expected 6 columns, got {}", fields.len());

    let ts_ms: i64 = fields[0].parse().context("bad timestamp column")?;
    let open = rust_decimal::Decimal::from_str(fields[1]).context("bad open column")?;
    let high = rust_decimal::Decimal::from_str(fields[2]).context("bad high column")?;
    let low = rust_decimal::Decimal::from_str(fields[3]).context("bad low column")?;
    let close = rust_decimal::Decimal::from_str(fields[4]).context("bad close column")?;
    let volume = rust_decimal::Decimal::from_str(fields[5]).context("bad volume column")?;

    Ok(Candle {
        symbol: symbol.to_string(),
        start_ts_ms: ts_ms,
        open,
        high,
        low,
        close,
        volume,
    })
}
