// =============================================================================
// Indicator kernel — MA / EMA / ATR and the AVG composites
// =============================================================================
//
// Pure functions over candle slices. "Not ready" is always an explicit
// `Option::None`; no sentinel value ever enters downstream arithmetic. For
// identical input series the outputs are bit-identical across callers.
// =============================================================================

pub mod atr;
pub mod ema;
pub mod ma;

pub use atr::atr_series;
pub use ema::ema_series;
pub use ma::ma_series;

use crate::types::Candle;

/// Periods the trend strategy is built around.
pub const FAST_PERIOD: usize = 20;
pub const SLOW_PERIOD: usize = 60;
pub const ATR_PERIOD: usize = 14;

/// A candle joined with its indicator columns.
///
/// `avg20`/`avg60` are the composite anchors `(MA + EMA) / 2` at the same
/// period; they are defined only once the MA side has a full window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndicatorBar {
    pub candle: Candle,
    pub ma20: Option<f64>,
    pub ma60: Option<f64>,
    pub ema20: Option<f64>,
    pub ema60: Option<f64>,
    pub avg20: Option<f64>,
    pub avg60: Option<f64>,
    pub atr14: Option<f64>,
}

impl IndicatorBar {
    /// True when every column the decision core reads is defined.
    pub fn ready(&self) -> bool {
        self.avg20.is_some() && self.avg60.is_some() && self.atr14.is_some()
    }
}

/// Compute the full indicator column set for a candle slice.
///
/// Output is aligned with the input; entry `i` describes `candles[i]`.
pub fn compute_series(candles: &[Candle]) -> Vec<IndicatorBar> {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

    let ma20 = ma_series(&closes, FAST_PERIOD);
    let ma60 = ma_series(&closes, SLOW_PERIOD);
    let ema20 = ema_series(&closes, FAST_PERIOD);
    let ema60 = ema_series(&closes, SLOW_PERIOD);
    let atr14 = atr_series(candles, ATR_PERIOD);

    candles
        .iter()
        .enumerate()
        .map(|(i, candle)| {
            let avg20 = match (ma20[i], ema20[i]) {
                (Some(m), Some(e)) => Some((m + e) / 2.0),
                _ => None,
            };
            let avg60 = match (ma60[i], ema60[i]) {
                (Some(m), Some(e)) => Some((m + e) / 2.0),
                _ => None,
            };
            IndicatorBar {
                candle: *candle,
                ma20: ma20[i],
                ma60: ma60[i],
                ema20: ema20[i],
                ema60: ema60[i],
                avg20,
                avg60,
                atr14: atr14[i],
            }
        })
        .collect()
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candle(i: i64, close: f64) -> Candle {
        Candle {
            open_time: i * 14_400_000,
            open: close - 10.0,
            high: close + 50.0,
            low: close - 50.0,
            close,
            volume: 100.0,
            close_time: (i + 1) * 14_400_000 - 1,
        }
    }

    fn series(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| candle(i as i64, 30_000.0 + (i as f64 * 0.2).sin() * 300.0))
            .collect()
    }

    #[test]
    fn not_ready_until_slow_window_fills() {
        let bars = compute_series(&series(100));
        // First 59 bars: avg60 undefined, so the bar is not ready.
        for bar in &bars[..59] {
            assert!(bar.avg60.is_none());
            assert!(!bar.ready());
        }
        assert!(bars[59].ready());
    }

    #[test]
    fn avg_is_midpoint_of_ma_and_ema() {
        let bars = compute_series(&series(80));
        let bar = &bars[70];
        let expected = (bar.ma20.unwrap() + bar.ema20.unwrap()) / 2.0;
        assert_eq!(bar.avg20, Some(expected));
    }

    #[test]
    fn atr_column_defined_after_period() {
        let bars = compute_series(&series(20));
        assert!(bars[ATR_PERIOD - 1].atr14.is_none());
        assert!(bars[ATR_PERIOD].atr14.is_some());
    }

    #[test]
    fn identical_input_identical_output() {
        let candles = series(150);
        let a = compute_series(&candles);
        let b = compute_series(&candles);
        assert_eq!(a, b);
    }
}
