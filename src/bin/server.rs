//! The `server` binary: runs the streaming trading core described in §2,
//! or replays a local candle file through Strategy + Execution with
//! `--backtest <path>` (SPEC_FULL §2), matching the teacher's `tracing`
//! init + task-spawn + graceful-shutdown shape in spirit.

use anyhow::Result;
use clap::Parser;
use rustrade_core::application::pipeline;
use rustrade_core::config::Config;
use tracing::{Level, info};
use tracing_subscriber::prelude::*;

/// Real-time paper-trading core: WebSocket ingest, candle aggregation, a
/// hybrid trend/volatility strategy, and paper execution, with an HTTP/WS
/// control plane for manual orders and panic/lockout.
#[derive(Debug, Parser)]
#[command(name = "rustrade-server", version)]
struct Cli {
    /// Replay a local CSV candle file (timestamp,open,high,low,close,volume)
    /// through Strategy + Execution instead of connecting to the exchange.
    #[arg(long)]
    backtest: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    if let Some(path) = cli.backtest {
        info!(path = %path, "running backtest replay");
        pipeline::run_backtest(&path, config).await?;
        return Ok(());
    }

    info!(
        symbols = ?config.symbols,
        control_plane_port = config.control_plane_port,
        "starting rustrade streaming core"
    );

    let handle = pipeline::run_live(config).await?;
    info!("pipeline running, control plane listening on {}", handle.control_plane_addr);

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, draining pipeline");
    handle.shutdown().await;
    info!("shutdown complete");

    Ok(())
}
