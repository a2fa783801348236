use crate::domain::trading::types::Candle;
use rust_decimal::prelude::ToPrimitive;
use ta::indicators::{AverageTrueRange, SimpleMovingAverage};
use ta::{DataItem, Next};

const WILDER_PERIOD: f64 = 14.0;
const WILDER_ALPHA: f64 = 1.0 / WILDER_PERIOD;

/// One candle's worth of rolling-indicator output. `adx` is `None` until the
/// Wilder-smoothed true range has warmed up past zero.
#[derive(Debug, Clone, Copy)]
pub struct IndicatorSnapshot {
    pub close: f64,
    pub sma_fast: f64,
    pub sma_slow: f64,
    pub sma_trend: f64,
    pub atr: f64,
    pub adx: Option<f64>,
    pub candles_seen: usize,
}

/// Per-symbol rolling technical indicators (§4.4): SMA(5/20/200) over closes,
/// ATR(14) and ADX(14) both Wilder-smoothed. SMA and ATR are the `ta` crate's
/// own rolling-window implementations; +DM/-DM/DX/ADX have no library
/// counterpart and are hand-rolled Wilder EMAs over the true range `ta`
/// already computes.
pub struct IndicatorEngine {
    sma_fast: SimpleMovingAverage,
    sma_slow: SimpleMovingAverage,
    sma_trend: SimpleMovingAverage,
    atr: AverageTrueRange,
    prev_high: Option<f64>,
    prev_low: Option<f64>,
    plus_dm_wilder: Option<f64>,
    minus_dm_wilder: Option<f64>,
    adx_wilder: Option<f64>,
    candles_seen: usize,
}

impl IndicatorEngine {
    pub fn new() -> Self {
        Self {
            sma_fast: SimpleMovingAverage::new(5).expect("period 5 is valid"),
            sma_slow: SimpleMovingAverage::new(20).expect("period 20 is valid"),
            sma_trend: SimpleMovingAverage::new(200).expect("period 200 is valid"),
            atr: AverageTrueRange::new(14).expect("period 14 is valid"),
            prev_high: None,
            prev_low: None,
            plus_dm_wilder: None,
            minus_dm_wilder: None,
            adx_wilder: None,
            candles_seen: 0,
        }
    }

    pub fn update(&mut self, candle: &Candle) -> IndicatorSnapshot {
        let high = candle.high.to_f64().unwrap_or_default();
        let low = candle.low.to_f64().unwrap_or_default();
        let close = candle.close.to_f64().unwrap_or_default();
        let open = candle.open.to_f64().unwrap_or_default();
        let volume = candle.volume.to_f64().unwrap_or_default();

        let item = DataItem::builder()
            .high(high)
            .low(low)
            .close(close)
            .open(open)
            .volume(volume)
            .build()
            .expect("candle fields are finite");

        let sma_fast = self.sma_fast.next(close);
        let sma_slow = self.sma_slow.next(close);
        let sma_trend = self.sma_trend.next(close);
        let atr = self.atr.next(&item);

        let (plus_dm, minus_dm) = match (self.prev_high, self.prev_low) {
            (Some(ph), Some(pl)) => {
                let up_move = high - ph;
                let down_move = pl - low;
                let plus = if up_move > down_move && up_move > 0.0 {
                    up_move
                } else {
                    0.0
                };
                let minus = if down_move > up_move && down_move > 0.0 {
                    down_move
                } else {
                    0.0
                };
                (plus, minus)
            }
            _ => (0.0, 0.0),
        };
        self.plus_dm_wilder = Some(wilder_update(self.plus_dm_wilder, plus_dm));
        self.minus_dm_wilder = Some(wilder_update(self.minus_dm_wilder, minus_dm));

        let adx = if atr > 0.0 {
            let plus_di = 100.0 * self.plus_dm_wilder.unwrap_or_default() / atr;
            let minus_di = 100.0 * self.minus_dm_wilder.unwrap_or_default() / atr;
            let di_sum = plus_di + minus_di;
            let dx = if di_sum > 0.0 {
                100.0 * (plus_di - minus_di).abs() / di_sum
            } else {
                0.0
            };
            self.adx_wilder = Some(wilder_update(self.adx_wilder, dx));
            self.adx_wilder
        } else {
            None
        };

        self.prev_high = Some(high);
        self.prev_low = Some(low);
        self.candles_seen += 1;

        IndicatorSnapshot {
            close,
            sma_fast,
            sma_slow,
            sma_trend,
            atr,
            adx,
            candles_seen: self.candles_seen,
        }
    }
}

impl Default for IndicatorEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn wilder_update(prev: Option<f64>, value: f64) -> f64 {
    match prev {
        Some(p) => p + WILDER_ALPHA * (value - p),
        None => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn candle(o: f64, h: f64, l: f64, c: f64) -> Candle {
        Candle {
            symbol: "BTCUSDT".into(),
            start_ts_ms: 0,
            open: rust_decimal::Decimal::try_from(o).unwrap(),
            high: rust_decimal::Decimal::try_from(h).unwrap(),
            low: rust_decimal::Decimal::try_from(l).unwrap(),
            close: rust_decimal::Decimal::try_from(c).unwrap(),
            volume: dec!(1),
        }
    }

    #[test]
    fn sma_fast_tracks_last_five_closes() {
        let mut engine = IndicatorEngine::new();
        let closes = [10.0, 11.0, 12.0, 13.0, 14.0];
        let mut last = IndicatorSnapshot {
            close: 0.0,
            sma_fast: 0.0,
            sma_slow: 0.0,
            sma_trend: 0.0,
            atr: 0.0,
            adx: None,
            candles_seen: 0,
        };
        for c in closes {
            last = engine.update(&candle(c, c, c, c));
        }
        assert!((last.sma_fast - 12.0).abs() < 1e-9);
        assert_eq!(last.candles_seen, 5);
    }

    #[test]
    fn adx_stays_none_until_true_range_warms_up() {
        let mut engine = IndicatorEngine::new();
        let first = engine.update(&candle(100.0, 100.0, 100.0, 100.0));
        assert!(first.adx.is_none() || first.adx == Some(0.0));
    }
}
