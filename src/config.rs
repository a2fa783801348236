use anyhow::{Context, Result};
use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;

fn env_or<T: FromStr>(key: &str, default: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    let raw = env::var(key).unwrap_or_else(|_| default.to_string());
    raw.parse::<T>()
        .map_err(|e| anyhow::anyhow!("failed to parse {key}={raw}: {e}"))
        .context(format!("Failed to parse {key}"))
}

/// Process-wide configuration for the streaming core, loaded once at startup
/// from environment variables (`dotenvy::dotenv().ok()` is called before this
/// in `main`, matching the teacher's convention).
#[derive(Debug, Clone)]
pub struct Config {
    pub symbols: Vec<String>,
    pub exchange_ws_url: String,

    pub candle_interval_ms: i64,
    pub watchdog_timeout_secs: u64,
    pub reconnect_initial_backoff_secs: u64,
    pub reconnect_max_backoff_secs: u64,

    pub tick_queue_capacity: usize,
    pub candle_queue_capacity: usize,
    pub execution_queue_capacity: usize,
    pub ticker_sample_rate: u64,
    pub broadcast_timeout_ms: u64,

    pub learner_lookback: usize,
    pub learner_min_train_samples: u64,
    pub learner_learning_rate: f64,
    pub learner_enabled: bool,
    pub prob_buy_threshold: f64,
    pub prob_sell_threshold: f64,
    pub adx_threshold: f64,
    pub warmup_candles: usize,
    pub warmup_candles_with_learner: usize,

    pub initial_cash: Decimal,
    pub risk_per_trade_pct: Decimal,
    pub max_position_pct: Decimal,
    pub fee_rate: Decimal,
    pub cooldown_ms: i64,
    pub min_notional: Decimal,
    pub step_size: Decimal,
    pub max_idempotence_entries: usize,

    pub persistence_sink_addr: String,
    pub persistence_db_path: String,
    pub portfolio_file_path: String,

    pub control_plane_port: u16,
    pub pnl_broadcast_interval_ms: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let symbols_raw: String = env_or("SYMBOLS", "BTCUSDT,ETHUSDT")?;
        let symbols = symbols_raw
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            symbols,
            exchange_ws_url: env_or(
                "EXCHANGE_WS_URL",
                "wss://stream.binance.com:9443/stream",
            )?,

            candle_interval_ms: env_or("CANDLE_INTERVAL_MS", "1000")?,
            watchdog_timeout_secs: env_or("WATCHDOG_TIMEOUT_SECS", "15")?,
            reconnect_initial_backoff_secs: env_or("RECONNECT_INITIAL_BACKOFF_SECS", "1")?,
            reconnect_max_backoff_secs: env_or("RECONNECT_MAX_BACKOFF_SECS", "30")?,

            tick_queue_capacity: env_or("TICK_QUEUE_CAPACITY", "5000")?,
            candle_queue_capacity: env_or("CANDLE_QUEUE_CAPACITY", "1000")?,
            execution_queue_capacity: env_or("EXECUTION_QUEUE_CAPACITY", "300")?,
            ticker_sample_rate: env_or("TICKER_SAMPLE_RATE", "10")?,
            broadcast_timeout_ms: env_or("BROADCAST_TIMEOUT_MS", "500")?,

            learner_lookback: env_or("LEARNER_LOOKBACK", "50")?,
            learner_min_train_samples: env_or("LEARNER_MIN_TRAIN_SAMPLES", "50")?,
            learner_learning_rate: env_or("LEARNER_LEARNING_RATE", "0.05")?,
            learner_enabled: env_or("LEARNER_ENABLED", "true")?,
            prob_buy_threshold: env_or("PROB_BUY_THRESHOLD", "0.60")?,
            prob_sell_threshold: env_or("PROB_SELL_THRESHOLD", "0.40")?,
            adx_threshold: env_or("ADX_THRESHOLD", "25.0")?,
            warmup_candles: env_or("WARMUP_CANDLES", "300")?,
            warmup_candles_with_learner: env_or("WARMUP_CANDLES_WITH_LEARNER", "2000")?,

            initial_cash: env_or("INITIAL_CASH", "10000")?,
            risk_per_trade_pct: env_or("RISK_PER_TRADE_PCT", "0.01")?,
            max_position_pct: env_or("MAX_POSITION_PCT", "0.20")?,
            fee_rate: env_or("FEE_RATE", "0.0004")?,
            cooldown_ms: env_or("COOLDOWN_MS", "3000")?,
            min_notional: env_or("MIN_NOTIONAL", "5")?,
            step_size: env_or("STEP_SIZE", "0.001")?,
            max_idempotence_entries: env_or("MAX_IDEMPOTENCE_ENTRIES", "1000")?,

            persistence_sink_addr: env_or("PERSISTENCE_SINK_ADDR", "127.0.0.1:9009")?,
            persistence_db_path: env_or("PERSISTENCE_DB_PATH", "data/warmup.db")?,
            portfolio_file_path: env_or("PORTFOLIO_FILE_PATH", "data/portfolio.json")?,

            control_plane_port: env_or("CONTROL_PLANE_PORT", "8090")?,
            pnl_broadcast_interval_ms: env_or("PNL_BROADCAST_INTERVAL_MS", "1000")?,
        })
    }
}
