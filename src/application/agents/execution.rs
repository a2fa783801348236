use crate::config::Config;
use crate::domain::errors::RejectionReason;
use crate::domain::ports::{Broadcaster, ControlEvent, PortfolioStore, PositionSnapshot};
use crate::domain::trading::fee_model::FeeModel;
use crate::domain::trading::portfolio::Portfolio;
use crate::domain::trading::types::{Position, PositionSide, Side, Signal, TradeRecord};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{info, warn};
use uuid::Uuid;

/// The paper Execution Engine (§4.5). Owns the Portfolio, the idempotence
/// set, and the per-symbol cooldown clock exclusively — no other task
/// mutates this state, matching the ownership model of §5.
pub struct ExecutionEngine {
    config: Arc<Config>,
    fee_model: FeeModel,
    portfolio: Portfolio,
    portfolio_store: Arc<dyn PortfolioStore>,
    broadcaster: Arc<dyn Broadcaster>,
    locked_out: Arc<AtomicBool>,
    recent_signal_order: VecDeque<Uuid>,
    recent_signal_set: HashSet<Uuid>,
    last_closure_time: HashMap<String, i64>,
    last_marks: HashMap<String, Decimal>,
}

impl ExecutionEngine {
    pub fn new(
        config: Arc<Config>,
        portfolio_store: Arc<dyn PortfolioStore>,
        broadcaster: Arc<dyn Broadcaster>,
        locked_out: Arc<AtomicBool>,
    ) -> Self {
        let portfolio = match portfolio_store.load() {
            Ok(Some(p)) => {
                info!("execution: resumed portfolio from durable storage");
                p
            }
            Ok(None) => Portfolio::new(config.initial_cash),
            Err(e) => {
                warn!("execution: failed to load portfolio, starting fresh: {}", e);
                Portfolio::new(config.initial_cash)
            }
        };

        Self {
            fee_model: FeeModel::new(config.fee_rate),
            config,
            portfolio,
            portfolio_store,
            broadcaster,
            locked_out,
            recent_signal_order: VecDeque::new(),
            recent_signal_set: HashSet::new(),
            last_closure_time: HashMap::new(),
            last_marks: HashMap::new(),
        }
    }

    pub fn portfolio(&self) -> &Portfolio {
        &self.portfolio
    }

    pub fn update_mark(&mut self, symbol: &str, price: Decimal) {
        self.last_marks.insert(symbol.to_string(), price);
    }

    /// Processes one signal through the full gate chain (§4.5 steps 1-9).
    /// Returns `Ok(())` on acceptance (open, or close-then-open); `Err`
    /// carries the structured rejection reason, already logged as a `log`
    /// event on the broadcaster.
    pub fn on_signal(&mut self, signal: Signal) -> Result<(), RejectionReason> {
        if self.locked_out.load(Ordering::Relaxed) {
            return self.reject(RejectionReason::LockedOut);
        }

        if self.recent_signal_set.contains(&signal.id) {
            return self.reject(RejectionReason::DuplicateSignal {
                id: signal.id.to_string(),
            });
        }

        if let Some(&last_closure) = self.last_closure_time.get(&signal.symbol) {
            let elapsed = signal.ts_ms - last_closure;
            if elapsed < self.config.cooldown_ms {
                return self.reject(RejectionReason::CooldownActive {
                    symbol: signal.symbol.clone(),
                    remaining_ms: self.config.cooldown_ms - elapsed,
                });
            }
        }

        self.remember_signal(signal.id);

        let qty = match self.size_signal(&signal) {
            Some(qty) => qty,
            None => {
                return self.reject(RejectionReason::ZeroSizing {
                    symbol: signal.symbol.clone(),
                });
            }
        };

        let notional = qty * signal.price;
        if notional < self.config.min_notional {
            return self.reject(RejectionReason::BelowMinNotional {
                symbol: signal.symbol.clone(),
                notional,
                floor: self.config.min_notional,
            });
        }

        let new_side = PositionSide::from(signal.side);
        match self.portfolio.positions.get(&signal.symbol).cloned() {
            Some(existing) if existing.side == new_side => self.reject(RejectionReason::SameSideOpen {
                symbol: signal.symbol.clone(),
            }),
            Some(existing) => {
                let trade = self.close_position(existing, signal.price, signal.ts_ms);
                self.publish_trade(&trade.symbol, trade.side, trade.exit_price, trade.qty, Some(trade.pnl));
                self.open_position(&signal, qty)
            }
            None => self.open_position(&signal, qty),
        }
    }

    fn reject(&self, reason: RejectionReason) -> Result<(), RejectionReason> {
        info!("execution rejected signal: {}", reason);
        self.broadcaster.publish(ControlEvent::Log {
            message: reason.to_string(),
        });
        Err(reason)
    }

    fn remember_signal(&mut self, id: Uuid) {
        self.recent_signal_set.insert(id);
        self.recent_signal_order.push_back(id);
        while self.recent_signal_order.len() > self.config.max_idempotence_entries {
            if let Some(evicted) = self.recent_signal_order.pop_front() {
                self.recent_signal_set.remove(&evicted);
            }
        }
    }

    /// "Minimum of two" sizing rule (§4.5 step 3). Returns the step-rounded
    /// quantity, or `None` if sizing collapses to zero.
    fn size_signal(&self, signal: &Signal) -> Option<Decimal> {
        let stop = if signal.stop_loss.is_zero() {
            match signal.side {
                Side::Buy => signal.price * Decimal::new(98, 2),
                Side::Sell => signal.price * Decimal::new(102, 2),
            }
        } else {
            signal.stop_loss
        };

        let risk_distance = (signal.price - stop).abs();
        if risk_distance.is_zero() {
            return None;
        }

        // Rounded to quote precision before the min() and the exchange step
        // rounding below, matching the worked scenario's 16.67 -> 16.670.
        let qty_risk = ((self.portfolio.cash_balance * self.config.risk_per_trade_pct) / risk_distance).round_dp(2);
        let qty_cap = ((self.portfolio.cash_balance * self.config.max_position_pct) / signal.price).round_dp(2);
        let qty = qty_risk.min(qty_cap);

        let step = self.config.step_size;
        let rounded = if step > Decimal::ZERO {
            (qty / step).floor() * step
        } else {
            qty
        };

        if rounded <= Decimal::ZERO { None } else { Some(rounded) }
    }

    fn open_position(&mut self, signal: &Signal, qty: Decimal) -> Result<(), RejectionReason> {
        let cost = qty * signal.price;
        let fee = self.fee_model.fee_on(cost);
        if cost + fee > self.portfolio.cash_balance {
            return self.reject(RejectionReason::InsufficientFunds {
                symbol: signal.symbol.clone(),
                need: cost + fee,
                available: self.portfolio.cash_balance,
            });
        }

        self.portfolio.cash_balance -= cost + fee;
        self.portfolio.positions.insert(
            signal.symbol.clone(),
            Position {
                symbol: signal.symbol.clone(),
                side: PositionSide::from(signal.side),
                entry_price: signal.price,
                qty,
                opened_ts: signal.ts_ms,
                stop_loss: signal.stop_loss,
                take_profit: signal.take_profit,
            },
        );

        self.persist();
        self.publish_trade(&signal.symbol, PositionSide::from(signal.side), signal.price, qty, None);
        Ok(())
    }

    /// Closes `position` at `exit_price` (§4.5 step 7): strict `(exit-entry)*qty`
    /// for LONG, mirrored for SHORT, exit fee on the exit notional.
    fn close_position(&mut self, position: Position, exit_price: Decimal, ts_ms: i64) -> TradeRecord {
        let gross_pnl = position.unrealized_pnl(exit_price);
        let exit_value = position.qty * exit_price;
        let exit_fee = self.fee_model.fee_on(exit_value);
        let initial_cost = position.entry_price * position.qty;

        self.portfolio.cash_balance += initial_cost + gross_pnl - exit_fee;
        self.portfolio.positions.remove(&position.symbol);
        self.last_closure_time.insert(position.symbol.clone(), ts_ms);

        let trade = TradeRecord {
            symbol: position.symbol,
            side: position.side,
            entry_price: position.entry_price,
            exit_price,
            qty: position.qty,
            pnl: gross_pnl - exit_fee,
            opened_ts: position.opened_ts,
            closed_ts: ts_ms,
        };
        self.portfolio.record_close(&trade);
        self.persist();
        trade
    }

    fn persist(&self) {
        if let Err(e) = self.portfolio_store.save(&self.portfolio) {
            warn!("execution: failed to persist portfolio: {}", e);
        }
    }

    fn publish_trade(&self, symbol: &str, side: PositionSide, price: Decimal, qty: Decimal, pnl: Option<Decimal>) {
        self.broadcaster.publish(ControlEvent::Trade {
            symbol: symbol.to_string(),
            side,
            price,
            qty,
            pnl,
        });
    }

    fn resolve_marks(&self, price_hints: &HashMap<String, Decimal>) -> HashMap<String, Decimal> {
        self.portfolio
            .positions
            .values()
            .map(|p| {
                let mark = price_hints
                    .get(&p.symbol)
                    .copied()
                    .or_else(|| self.last_marks.get(&p.symbol).copied())
                    .unwrap_or(p.entry_price);
                (p.symbol.clone(), mark)
            })
            .collect()
    }

    /// Marks every open position, publishes a `pnl` snapshot (§4.5 equity computation).
    pub fn broadcast_portfolio(&self, price_hints: &HashMap<String, Decimal>, timestamp: i64) {
        let marks = self.resolve_marks(price_hints);
        let equity = self.portfolio.equity(&marks);
        let pnl_unrealized = self.portfolio.unrealized_pnl(&marks);

        let positions = self
            .portfolio
            .positions
            .values()
            .map(|p| {
                let mark = marks.get(&p.symbol).copied().unwrap_or(p.entry_price);
                PositionSnapshot {
                    symbol: p.symbol.clone(),
                    side: p.side,
                    entry: p.entry_price,
                    mark,
                    qty: p.qty,
                    pnl: p.unrealized_pnl(mark),
                }
            })
            .collect();

        self.broadcaster.publish(ControlEvent::Pnl {
            balance: self.portfolio.cash_balance,
            equity,
            pnl_unrealized,
            positions,
            timestamp,
        });
    }
}

/// Runs the Execution Engine task, merging strategy-emitted and
/// manually-injected signals (§4.5 — "identical type"; the control plane
/// and the strategy push into the same queue topology).
pub async fn run(
    engine: Arc<Mutex<ExecutionEngine>>,
    mut strategy_rx: mpsc::Receiver<Signal>,
    mut manual_rx: mpsc::Receiver<Signal>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            maybe_signal = strategy_rx.recv() => {
                let Some(signal) = maybe_signal else {
                    info!("execution: strategy signal source closed, exiting");
                    return;
                };
                let _ = engine.lock().await.on_signal(signal);
            }
            maybe_signal = manual_rx.recv() => {
                let Some(signal) = maybe_signal else {
                    info!("execution: manual signal source closed, exiting");
                    return;
                };
                let _ = engine.lock().await.on_signal(signal);
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("execution: shutdown requested, exiting");
                    return;
                }
            }
        }
    }
}
