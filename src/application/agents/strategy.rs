use crate::config::Config;
use crate::domain::indicators::{IndicatorEngine, IndicatorSnapshot};
use crate::domain::learner::OnlineLearner;
use crate::domain::ports::PersistenceSink;
use crate::domain::trading::types::{Candle, Side, Signal};
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

const MIN_HISTORY_CANDLES: usize = 201;

struct SymbolState {
    indicators: IndicatorEngine,
    learner: Option<OnlineLearner>,
    prev_snapshot: Option<IndicatorSnapshot>,
}

impl SymbolState {
    fn new(config: &Config) -> Self {
        Self {
            indicators: IndicatorEngine::new(),
            learner: if config.learner_enabled {
                Some(OnlineLearner::new(
                    config.learner_lookback,
                    config.learner_min_train_samples,
                    config.learner_learning_rate,
                ))
            } else {
                None
            },
            prev_snapshot: None,
        }
    }
}

/// Per-symbol rolling indicators plus an optional ML veto (§4.4). Owns all
/// indicator/learner state exclusively; no other task mutates it.
pub struct StrategyEngine {
    config: Arc<Config>,
    symbols: HashMap<String, SymbolState>,
}

impl StrategyEngine {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            symbols: HashMap::new(),
        }
    }

    /// Updates indicator/learner state for `candle` and, unless `is_backtest`
    /// suppresses emission, returns at most one Signal (§4.4 rules 1-6, ML veto).
    pub fn on_candle(&mut self, candle: &Candle, is_backtest: bool) -> Option<Signal> {
        let config = self.config.clone();
        let state = self
            .symbols
            .entry(candle.symbol.clone())
            .or_insert_with(|| SymbolState::new(&config));

        let (p_up, learner_ready) = match state.learner.as_mut() {
            Some(learner) => {
                let (p, ready) = learner.on_candle(candle);
                (Some(p), ready)
            }
            None => (None, false),
        };

        let curr = state.indicators.update(candle);
        let prev = state.prev_snapshot.replace(curr);
        let prev = prev?;

        if curr_history_too_short(curr.candles_seen) {
            return None;
        }

        let Some(adx) = curr.adx else { return None };
        if adx < config.adx_threshold {
            return None;
        }

        let golden_cross = prev.sma_fast <= prev.sma_slow && curr.sma_fast > curr.sma_slow;
        let death_cross = prev.sma_fast >= prev.sma_slow && curr.sma_fast < curr.sma_slow;

        let candidate_side = if golden_cross {
            if curr.close > curr.sma_trend {
                Some(Side::Buy)
            } else {
                info!(
                    symbol = %candle.symbol,
                    "counter-trend rejection: golden cross below SMA200"
                );
                None
            }
        } else if death_cross {
            if curr.close < curr.sma_trend {
                Some(Side::Sell)
            } else {
                info!(
                    symbol = %candle.symbol,
                    "counter-trend rejection: death cross above SMA200"
                );
                None
            }
        } else {
            None
        };

        let side = candidate_side?;

        if curr.atr <= 0.0 {
            return None;
        }
        let atr = Decimal::from_f64(curr.atr).unwrap_or(Decimal::ZERO);

        let (stop_loss, take_profit) = match side {
            Side::Buy => (candle.close - atr * Decimal::from(2), candle.close + atr * Decimal::from(3)),
            Side::Sell => (candle.close + atr * Decimal::from(2), candle.close - atr * Decimal::from(3)),
        };

        if learner_ready && let Some(p_up) = p_up {
            let vetoed = match side {
                Side::Buy => p_up < config.prob_buy_threshold,
                Side::Sell => p_up > config.prob_sell_threshold,
            };
            if vetoed {
                info!(symbol = %candle.symbol, p_up, "ML VETO");
                return None;
            }
        }

        if is_backtest {
            return None;
        }

        let reason = if golden_cross { "golden_cross" } else { "death_cross" };
        Some(Signal::new(
            candle.symbol.clone(),
            side,
            candle.close,
            candle.start_ts_ms,
            reason,
            stop_loss,
            take_profit,
        ))
    }
}

fn curr_history_too_short(candles_seen: usize) -> bool {
    candles_seen < MIN_HISTORY_CANDLES
}

/// Replays warmup candles through the strategy with `is_backtest=true` so
/// indicator/learner state is primed with no signal emission or side effects (§4.4).
pub async fn warmup(
    engine: &mut StrategyEngine,
    persistence: &dyn PersistenceSink,
    symbols: &[String],
    warmup_candles: usize,
) {
    for symbol in symbols {
        match persistence.warmup_candles(symbol, warmup_candles).await {
            Ok(candles) => {
                for candle in &candles {
                    engine.on_candle(candle, true);
                }
                info!(symbol = %symbol, count = candles.len(), "strategy warmup replayed");
            }
            Err(e) => warn!(symbol = %symbol, error = %e, "strategy warmup failed, starting cold"),
        }
    }
}

pub async fn run(
    config: Arc<Config>,
    persistence: Arc<dyn PersistenceSink>,
    mut candle_rx: mpsc::Receiver<Candle>,
    signal_tx: mpsc::Sender<Signal>,
    mark_tx: mpsc::Sender<(String, rust_decimal::Decimal)>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut engine = StrategyEngine::new(config.clone());
    let warmup_count = if config.learner_enabled {
        config.warmup_candles_with_learner
    } else {
        config.warmup_candles
    };
    warmup(&mut engine, persistence.as_ref(), &config.symbols, warmup_count).await;

    loop {
        tokio::select! {
            maybe_candle = candle_rx.recv() => {
                let Some(candle) = maybe_candle else {
                    info!("strategy: candle source closed, exiting");
                    return;
                };
                let _ = mark_tx.try_send((candle.symbol.clone(), candle.close));
                if let Some(signal) = engine.on_candle(&candle, false)
                    && signal_tx.send(signal).await.is_err() {
                        info!("strategy: signal queue closed, exiting");
                        return;
                    }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("strategy: shutdown requested, exiting");
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

    fn config() -> Arc<Config> {
        Arc::new(Config {
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
            learner_enabled: false,
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
        })
    }

    fn candle(close: f64, ts_ms: i64) -> Candle {
        let c = Decimal::from_f64(close).unwrap();
        Candle {
            symbol: "BTCUSDT".into(),
            start_ts_ms: ts_ms,
            open: c,
            high: c + dec!(0.5),
            low: c - dec!(0.5),
            close: c,
            volume: dec!(10),
        }
    }

    #[test]
    fn emits_nothing_before_history_gate() {
        let mut engine = StrategyEngine::new(config());
        for i in 0..50 {
            assert!(engine.on_candle(&candle(100.0 + i as f64 * 0.1, i * 1000), false).is_none());
        }
    }

    #[test]
    fn backtest_replay_suppresses_signals_but_updates_state() {
        let mut engine = StrategyEngine::new(config());
        for i in 0..400 {
            engine.on_candle(&candle(100.0 + (i % 7) as f64, i * 1000), true);
        }
        let state = engine.symbols.get("BTCUSDT").unwrap();
        assert!(state.prev_snapshot.is_some());
        assert_eq!(state.indicators_candles_seen(), 400);
    }

    impl SymbolState {
        fn indicators_candles_seen(&self) -> usize {
            self.prev_snapshot.map(|s| s.candles_seen).unwrap_or(0)
        }
    }
}
