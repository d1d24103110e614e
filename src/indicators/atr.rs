// =============================================================================
// Average True Range — rolling mean of the True Range
// =============================================================================
//
// True Range (TR) for each bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// TR is undefined for the first bar (no previous close). The ATR here is the
// simple rolling mean of the last `period` TR values, so index `i` is defined
// from `i >= period` onward. Default period: 14.
// =============================================================================

use crate::types::Candle;

/// Rolling-mean ATR over `candles`, aligned with the input.
///
/// `out[i]` is `None` when:
/// - `period` is zero,
/// - fewer than `period` TR values exist at `i` (i.e. `i < period`),
/// - any TR inside the window is non-finite.
pub fn atr_series(candles: &[Candle], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; candles.len()];
    if period == 0 || candles.len() <= period {
        return out;
    }

    // TR aligned with candles; tr[0] stays NaN (no previous close).
    let mut tr = vec![f64::NAN; candles.len()];
    for i in 1..candles.len() {
        let high = candles[i].high;
        let low = candles[i].low;
        let prev_close = candles[i - 1].close;

        let hl = high - low;
        let hc = (high - prev_close).abs();
        let lc = (low - prev_close).abs();
        tr[i] = hl.max(hc).max(lc);
    }

    for i in period..candles.len() {
        let window = &tr[i + 1 - period..=i];
        let sum: f64 = window.iter().sum();
        let mean = sum / period as f64;
        if mean.is_finite() {
            out[i] = Some(mean);
        }
    }

    out
}
