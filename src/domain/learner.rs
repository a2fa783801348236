use crate::domain::trading::types::Candle;
use rust_decimal::prelude::ToPrimitive;
use std::collections::VecDeque;

pub const FEATURE_COUNT: usize = 9;

/// Running mean/variance per feature, Welford's online algorithm. Replaces a
/// library `StandardScaler` (§9 Design Notes) with the explicit running
/// statistics it is built on.
#[derive(Debug, Clone)]
struct Scaler {
    count: u64,
    mean: [f64; FEATURE_COUNT],
    m2: [f64; FEATURE_COUNT],
}

impl Scaler {
    fn new() -> Self {
        Self {
            count: 0,
            mean: [0.0; FEATURE_COUNT],
            m2: [0.0; FEATURE_COUNT],
        }
    }

    fn observe(&mut self, x: &[f64; FEATURE_COUNT]) {
        self.count += 1;
        let n = self.count as f64;
        for i in 0..FEATURE_COUNT {
            let delta = x[i] - self.mean[i];
            self.mean[i] += delta / n;
            let delta2 = x[i] - self.mean[i];
            self.m2[i] += delta * delta2;
        }
    }

    fn std_dev(&self, i: usize) -> f64 {
        if self.count < 2 {
            1.0
        } else {
            (self.m2[i] / (self.count as f64 - 1.0)).sqrt().max(1e-8)
        }
    }

    fn transform(&self, x: &[f64; FEATURE_COUNT]) -> [f64; FEATURE_COUNT] {
        let mut out = [0.0; FEATURE_COUNT];
        for i in 0..FEATURE_COUNT {
            out[i] = (x[i] - self.mean[i]) / self.std_dev(i);
        }
        out
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

/// A per-symbol online binary logistic classifier trained by SGD on the
/// log-loss, one sample per candle (§4.4, §9). Predicts whether the next
/// close will exceed the current close.
pub struct OnlineLearner {
    lookback: usize,
    min_train_samples: u64,
    learning_rate: f64,
    weights: [f64; FEATURE_COUNT],
    bias: f64,
    scaler: Scaler,
    train_count: u64,
    buffer: VecDeque<Candle>,
    prev_features: Option<[f64; FEATURE_COUNT]>,
    prev_close: Option<f64>,
}

impl OnlineLearner {
    pub fn new(lookback: usize, min_train_samples: u64, learning_rate: f64) -> Self {
        Self {
            lookback,
            min_train_samples,
            learning_rate,
            weights: [0.0; FEATURE_COUNT],
            bias: 0.0,
            scaler: Scaler::new(),
            train_count: 0,
            buffer: VecDeque::with_capacity(lookback + 5),
            prev_features: None,
            prev_close: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.train_count >= self.min_train_samples
    }

    /// Feed one closed candle. Returns `(p_up, ready)`: the model's current
    /// estimate that the next close exceeds this one, and whether enough
    /// samples have been trained to trust it.
    pub fn on_candle(&mut self, candle: &Candle) -> (f64, bool) {
        let close = candle.close.to_f64().unwrap_or_default();

        // Train on the previous step's features using today's close as the label.
        if let (Some(prev_features), Some(prev_close)) = (self.prev_features, self.prev_close) {
            let label = if close > prev_close { 1.0 } else { 0.0 };
            self.scaler.observe(&prev_features);
            let x = self.scaler.transform(&prev_features);
            self.sgd_step(&x, label);
            self.train_count += 1;
        }

        self.buffer.push_back(candle.clone());
        while self.buffer.len() > self.lookback + 5 {
            self.buffer.pop_front();
        }

        let features = compute_features(&self.buffer);
        // Predict with the scaler as it stands right after training.
        let x = self.scaler.transform(&features);
        let p_up = sigmoid(self.dot(&x) + self.bias);

        self.prev_features = Some(features);
        self.prev_close = Some(close);

        (p_up, self.is_ready())
    }

    fn dot(&self, x: &[f64; FEATURE_COUNT]) -> f64 {
        self.weights.iter().zip(x.iter()).map(|(w, v)| w * v).sum()
    }

    fn sgd_step(&mut self, x: &[f64; FEATURE_COUNT], label: f64) {
        let p = sigmoid(self.dot(x) + self.bias);
        let grad = p - label;
        for i in 0..FEATURE_COUNT {
            self.weights[i] -= self.learning_rate * grad * x[i];
        }
        self.bias -= self.learning_rate * grad;
    }
}

/// [last log-return, last range/close, volume/mean(volume window),
/// short-window momentum, RSI-like gains/losses ratio, short-vs-medium
/// return spread, short SMA, ATR-like volatility, last volume].
fn compute_features(window: &VecDeque<Candle>) -> [f64; FEATURE_COUNT] {
    let n = window.len();
    if n == 0 {
        return [0.0; FEATURE_COUNT];
    }
    let closes: Vec<f64> = window
        .iter()
        .map(|c| c.close.to_f64().unwrap_or_default())
        .collect();
    let volumes: Vec<f64> = window
        .iter()
        .map(|c| c.volume.to_f64().unwrap_or_default())
        .collect();
    let last = window.back().unwrap();
    let close = last.close.to_f64().unwrap_or_default();
    let high = last.high.to_f64().unwrap_or_default();
    let low = last.low.to_f64().unwrap_or_default();
    let volume = last.volume.to_f64().unwrap_or_default();

    let prev_close = if n >= 2 { closes[n - 2] } else { close };
    let last_log_return = if prev_close > 0.0 {
        (close / prev_close).ln()
    } else {
        0.0
    };
    let last_range_over_close = if close > 0.0 { (high - low) / close } else { 0.0 };

    let mean_volume = volumes.iter().sum::<f64>() / n as f64;
    let volume_ratio = if mean_volume > 0.0 {
        volume / mean_volume
    } else {
        1.0
    };

    let short_n = 5.min(n - 1);
    let momentum = if short_n > 0 && closes[n - 1 - short_n] > 0.0 {
        close / closes[n - 1 - short_n] - 1.0
    } else {
        0.0
    };

    let mut gains = 0.0;
    let mut losses = 0.0;
    for w in closes.windows(2) {
        let delta = w[1] - w[0];
        if delta > 0.0 {
            gains += delta;
        } else {
            losses -= delta;
        }
    }
    let rsi_ratio = if losses > 0.0 { gains / losses } else { gains };

    let medium_n = 20.min(n - 1);
    let short_return = momentum;
    let medium_return = if medium_n > 0 && closes[n - 1 - medium_n] > 0.0 {
        close / closes[n - 1 - medium_n] - 1.0
    } else {
        0.0
    };
    let return_spread = short_return - medium_return;

    let sma_n = 5.min(n);
    let short_sma = closes[n - sma_n..].iter().sum::<f64>() / sma_n as f64;

    let atr_n = 14.min(n);
    let atr_like = if atr_n > 1 {
        closes[n - atr_n..]
            .windows(2)
            .map(|w| (w[1] - w[0]).abs())
            .sum::<f64>()
            / (atr_n - 1) as f64
    } else {
        0.0
    };

    [
        last_log_return,
        last_range_over_close,
        volume_ratio,
        momentum,
        rsi_ratio,
        return_spread,
        short_sma,
        atr_like,
        volume,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn candle(close: f64) -> Candle {
        Candle {
            symbol: "BTCUSDT".into(),
            start_ts_ms: 0,
            open: rust_decimal::Decimal::try_from(close).unwrap(),
            high: rust_decimal::Decimal::try_from(close * 1.01).unwrap(),
            low: rust_decimal::Decimal::try_from(close * 0.99).unwrap(),
            close: rust_decimal::Decimal::try_from(close).unwrap(),
            volume: dec!(10),
        }
    }

    #[test]
    fn learner_not_ready_before_min_samples() {
        let mut learner = OnlineLearner::new(50, 30, 0.05);
        let (_p, ready) = learner.on_candle(&candle(100.0));
        assert!(!ready);
    }

    #[test]
    fn learner_becomes_ready_after_min_samples() {
        let mut learner = OnlineLearner::new(50, 5, 0.05);
        let mut ready = false;
        let mut price = 100.0;
        for i in 0..10 {
            price += if i % 2 == 0 { 1.0 } else { -0.5 };
            let (_p, r) = learner.on_candle(&candle(price));
            ready = r;
        }
        assert!(ready);
    }

    #[test]
    fn probability_stays_in_unit_interval() {
        let mut learner = OnlineLearner::new(50, 5, 0.05);
        let mut price = 100.0;
        for i in 0..50 {
            price *= 1.0 + if i % 3 == 0 { 0.01 } else { -0.004 };
            let (p, _) = learner.on_candle(&candle(price));
            assert!((0.0..=1.0).contains(&p));
        }
    }
}
