// =============================================================================
// Strategy decision core — BiGe 7x trend-following on the AVG20/AVG60 anchors
// =============================================================================
//
// One call per (symbol, completed bar). The core is pure over its inputs:
// no I/O, no globals, no clock. It mutates only the passed `SymbolState`
// (bar gate, trailing stop, confirmation counter) and returns at most one
// action for the controller to execute. Fills are committed back into the
// state by the controller via the `apply_*` methods, so a rejected order
// leaves the state machine consistent.
//
// Per-bar order of evaluation (fixed, behaviour-defining):
//   1. new-bar gate
//   2. indicator readiness
//   3. with a position: trailing stop -> emergency stop -> confirmation
//      stop -> scale-in
//   4. without a position: entry
// =============================================================================

use tracing::{debug, info, warn};

use crate::config::StrategyParams;
use crate::indicators::IndicatorBar;
use crate::state::SymbolState;
use crate::types::PositionSide;

// ---------------------------------------------------------------------------
// Decision types
// ---------------------------------------------------------------------------

/// Why a position is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Single-bar breach beyond the ATR multiple (black-swan guard).
    Emergency,
    /// Confirmed trailing-stop violation over N consecutive bars.
    StopLoss,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Emergency => write!(f, "emergency stop"),
            Self::StopLoss => write!(f, "trailing stop"),
        }
    }
}

/// The single action (at most) produced for one bar of one symbol.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    None,
    Open {
        direction: PositionSide,
        stop_loss: f64,
    },
    Add,
    Close {
        reason: ExitReason,
    },
}

/// Trailing-stop anchor: AVG20 shifted by the buffer, against the position.
pub fn stop_anchor(direction: PositionSide, avg20: f64, ma20_buffer: f64) -> f64 {
    match direction {
        PositionSide::Long => avg20 * (1.0 - ma20_buffer),
        PositionSide::Short => avg20 * (1.0 + ma20_buffer),
    }
}

// ---------------------------------------------------------------------------
// Per-bar evaluation
// ---------------------------------------------------------------------------

/// Evaluate one completed bar for one symbol.
pub fn evaluate(state: &mut SymbolState, bar: &IndicatorBar, params: &StrategyParams) -> Decision {
    // 1. New-bar gate: a bar at or before the last observed open time is
    //    stale (same poll window) and must not be processed twice.
    if !state.observe_bar(bar.candle.open_time) {
        return Decision::None;
    }

    // 2. Every column the rules read must be defined.
    let (Some(avg20), Some(avg60), Some(atr14)) = (bar.avg20, bar.avg60, bar.atr14) else {
        debug!(symbol = %state.symbol, bar_seq = state.bar_seq, "indicators not ready");
        return Decision::None;
    };
    if avg20 <= 0.0 {
        return Decision::None;
    }

    let low = bar.candle.low;
    let high = bar.candle.high;
    let close = bar.candle.close;

    match state.direction {
        Some(direction) => {
            with_position(state, direction, params, avg20, atr14, low, high, close)
        }
        None => entry_signal(state, params, avg20, avg60, low, high, close),
    }
}

/// Rules for a bar while holding a position.
#[allow(clippy::too_many_arguments)]
fn with_position(
    state: &mut SymbolState,
    direction: PositionSide,
    params: &StrategyParams,
    avg20: f64,
    atr14: f64,
    low: f64,
    high: f64,
    close: f64,
) -> Decision {
    // 3a. Trailing stop update — monotone in favour of the position. A state
    //     recovered without a stop gets one installed here, on the first bar
    //     with ready indicators.
    let anchor = stop_anchor(direction, avg20, params.ma20_buffer);
    let stop = match state.stop_loss {
        None => {
            info!(
                symbol = %state.symbol,
                stop = anchor,
                "installing stop for recovered position"
            );
            anchor
        }
        Some(current) => match direction {
            PositionSide::Long => current.max(anchor),
            PositionSide::Short => current.min(anchor),
        },
    };
    if state.stop_loss != Some(stop) {
        debug!(symbol = %state.symbol, stop, "trailing stop moved");
    }
    state.stop_loss = Some(stop);

    // 3b. Emergency stop, checked before the confirmation counter: a single
    //     bar breaching AVG20 by more than the ATR multiple closes now.
    if params.emergency_stop_atr > 0.0 && atr14 > 0.0 {
        let breach = match direction {
            PositionSide::Long => avg20 - low,
            PositionSide::Short => high - avg20,
        };
        if breach > params.emergency_stop_atr * atr14 {
            warn!(
                symbol = %state.symbol,
                breach_atr = breach / atr14,
                limit_atr = params.emergency_stop_atr,
                "emergency stop triggered"
            );
            return Decision::Close {
                reason: ExitReason::Emergency,
            };
        }
    }

    // 3c. Confirmation stop: count consecutive bars touching the stop level;
    //     any non-touching bar resets the streak.
    let touched = match direction {
        PositionSide::Long => low <= stop,
        PositionSide::Short => high >= stop,
    };
    if touched {
        state.below_stop_ct += 1;
        if state.below_stop_ct >= params.stop_loss_confirm_bars {
            return Decision::Close {
                reason: ExitReason::StopLoss,
            };
        }
    } else {
        state.below_stop_ct = 0;
    }

    // 3d. Scale-in: pullback to AVG20 on the right side of the stop, gated
    //     by the add budget and the minimum bar interval.
    if state.add_count < params.max_add_count
        && state.bars_since_scale_in() >= params.add_position_min_interval
    {
        let pullback = match direction {
            PositionSide::Long => {
                (low - avg20).abs() / avg20 < params.pullback_tolerance
                    && low > stop
                    && close > avg20
            }
            PositionSide::Short => {
                (high - avg20).abs() / avg20 < params.pullback_tolerance
                    && high < stop
                    && close < avg20
            }
        };
        if pullback {
            return Decision::Add;
        }
    }

    Decision::None
}

/// Entry rules for a flat symbol: trend by AVG20 vs AVG60, pullback touch of
/// AVG20 without breaking the buffer, close back on the trend side.
fn entry_signal(
    state: &SymbolState,
    params: &StrategyParams,
    avg20: f64,
    avg60: f64,
    low: f64,
    high: f64,
    close: f64,
) -> Decision {
    let uptrend = avg20 > avg60;
    let downtrend = avg20 < avg60;

    if uptrend {
        let near = (low - avg20).abs() / avg20 < params.pullback_tolerance;
        let held = low > avg20 * (1.0 - params.ma20_buffer);
        if near && held && close > avg20 {
            debug!(symbol = %state.symbol, avg20, avg60, "long entry signal");
            return Decision::Open {
                direction: PositionSide::Long,
                stop_loss: stop_anchor(PositionSide::Long, avg20, params.ma20_buffer),
            };
        }
    }

    if downtrend {
        let near = (high - avg20).abs() / avg20 < params.pullback_tolerance;
        let held = high < avg20 * (1.0 + params.ma20_buffer);
        if near && held && close < avg20 {
            debug!(symbol = %state.symbol, avg20, avg60, "short entry signal");
            return Decision::Open {
                direction: PositionSide::Short,
                stop_loss: stop_anchor(PositionSide::Short, avg20, params.ma20_buffer),
            };
        }
    }

    Decision::None
}

// =============================================================================
// Unit Tests — seed scenarios for the BTCUSDT 4h Phase-1 profile
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Candle;

    /// Phase-1 profile used by every scenario below.
    fn params() -> StrategyParams {
        StrategyParams::default()
    }

    fn bar(seq: i64, low: f64, high: f64, close: f64, avg20: f64, avg60: f64, atr: f64) -> IndicatorBar {
        let candle = Candle {
            open_time: seq * 14_400_000,
            open: close,
            high,
            low,
            close,
            volume: 10.0,
            close_time: (seq + 1) * 14_400_000 - 1,
        };
        IndicatorBar {
            candle,
            ma20: Some(avg20),
            ma60: Some(avg60),
            ema20: Some(avg20),
            ema60: Some(avg60),
            avg20: Some(avg20),
            avg60: Some(avg60),
            atr14: Some(atr),
        }
    }

    fn not_ready_bar(seq: i64) -> IndicatorBar {
        let mut b = bar(seq, 29_900.0, 30_300.0, 30_200.0, 30_000.0, 29_500.0, 100.0);
        b.avg60 = None;
        b
    }

    // --- S1: clean long entry ------------------------------------------------

    #[test]
    fn s1_clean_long_entry() {
        let mut state = SymbolState::new("BTCUSDT");
        let decision = evaluate(
            &mut state,
            &bar(1, 29_900.0, 30_300.0, 30_200.0, 30_000.0, 29_500.0, 100.0),
            &params(),
        );

        match decision {
            Decision::Open {
                direction,
                stop_loss,
            } => {
                assert_eq!(direction, PositionSide::Long);
                assert!((stop_loss - 29_400.0).abs() < 1e-9);
            }
            other => panic!("expected long entry, got {other:?}"),
        }

        // Controller commits the fill; entry pins the bar counters.
        state.apply_entry(PositionSide::Long, 30_200.0, 29_400.0);
        assert_eq!(state.entry_bar_seq, state.bar_seq);
        assert_eq!(state.last_add_bar_seq, state.bar_seq);
        assert_eq!(state.add_count, 0);
        assert_eq!(state.below_stop_ct, 0);
    }

    // --- S2: no entry when close is below AVG20 ------------------------------

    #[test]
    fn s2_no_entry_below_avg20() {
        let mut state = SymbolState::new("BTCUSDT");
        let decision = evaluate(
            &mut state,
            &bar(1, 29_900.0, 30_100.0, 29_950.0, 30_000.0, 29_500.0, 100.0),
            &params(),
        );
        assert_eq!(decision, Decision::None);
        assert!(!state.has_position());
    }

    // --- S3: add fires only after the minimum interval -----------------------

    #[test]
    fn s3_add_gated_by_interval() {
        let mut state = SymbolState::new("BTCUSDT");
        evaluate(
            &mut state,
            &bar(1, 29_900.0, 30_300.0, 30_200.0, 30_000.0, 29_500.0, 100.0),
            &params(),
        );
        state.apply_entry(PositionSide::Long, 30_200.0, 29_400.0);

        // Three pullback bars all satisfying the add conditions; the first
        // two are blocked by the interval (delta 1 and 2 < 3).
        for seq in 2..=3 {
            let d = evaluate(
                &mut state,
                &bar(seq, 29_950.0, 30_250.0, 30_100.0, 30_000.0, 29_500.0, 100.0),
                &params(),
            );
            assert_eq!(d, Decision::None, "bar {seq} should be interval-blocked");
        }

        // Fourth bar: delta from entry is exactly 3 — the add fires.
        let d = evaluate(
            &mut state,
            &bar(4, 29_950.0, 30_250.0, 30_100.0, 30_000.0, 29_500.0, 100.0),
            &params(),
        );
        assert_eq!(d, Decision::Add);

        state.apply_add();
        assert_eq!(state.add_count, 1);
        assert_eq!(state.last_add_bar_seq, state.bar_seq);
    }

    #[test]
    fn add_budget_is_bounded() {
        let mut state = SymbolState::new("BTCUSDT");
        state.observe_bar(0);
        state.apply_entry(PositionSide::Long, 30_200.0, 29_400.0);
        state.add_count = params().max_add_count;

        let d = evaluate(
            &mut state,
            &bar(10, 29_950.0, 30_250.0, 30_100.0, 30_000.0, 29_500.0, 100.0),
            &params(),
        );
        assert_eq!(d, Decision::None, "no add beyond max_add_count");
    }

    // --- S4: emergency stop precedes the confirmation counter ----------------

    #[test]
    fn s4_emergency_stop_on_deep_breach() {
        let mut state = SymbolState::new("BTCUSDT");
        state.observe_bar(0);
        state.apply_entry(PositionSide::Long, 30_000.0, 29_400.0);

        // breach = 30_000 - 29_640 = 360 > 3.5 * 100 = 350
        let d = evaluate(
            &mut state,
            &bar(1, 29_640.0, 29_850.0, 29_700.0, 30_000.0, 29_500.0, 100.0),
            &params(),
        );
        assert_eq!(
            d,
            Decision::Close {
                reason: ExitReason::Emergency
            }
        );

        state.apply_exit();
        assert!(!state.has_position());
        assert_eq!(state.below_stop_ct, 0);
    }

    #[test]
    fn emergency_stop_disabled_when_multiplier_is_zero() {
        let mut p = params();
        p.emergency_stop_atr = 0.0;

        let mut state = SymbolState::new("BTCUSDT");
        state.observe_bar(0);
        state.apply_entry(PositionSide::Long, 30_000.0, 29_400.0);

        // A breach deep below the stop: emergency is off, so the bar only
        // starts the confirmation streak.
        let d = evaluate(
            &mut state,
            &bar(1, 29_300.0, 29_850.0, 29_700.0, 30_000.0, 29_500.0, 100.0),
            &p,
        );
        assert_eq!(d, Decision::None);
        assert_eq!(state.below_stop_ct, 1);
    }

    #[test]
    fn emergency_stop_short_side() {
        let mut state = SymbolState::new("BTCUSDT");
        state.observe_bar(0);
        state.apply_entry(PositionSide::Short, 30_000.0, 30_600.0);

        // breach = 30_400 - 30_000 = 400 > 350
        let d = evaluate(
            &mut state,
            &bar(1, 30_100.0, 30_400.0, 30_300.0, 30_000.0, 30_500.0, 100.0),
            &params(),
        );
        assert_eq!(
            d,
            Decision::Close {
                reason: ExitReason::Emergency
            }
        );
    }

    // --- S5: confirmation stop needs the full streak --------------------------

    #[test]
    fn s5_confirmation_stop_after_streak() {
        let mut state = SymbolState::new("BTCUSDT");
        state.observe_bar(0);
        state.apply_entry(PositionSide::Long, 30_000.0, 29_400.0);

        // Nine touching bars: counter climbs, no close. ATR is kept wide so
        // the emergency stop stays out of the picture.
        for seq in 1..=9 {
            let d = evaluate(
                &mut state,
                &bar(seq, 29_400.0, 30_050.0, 29_900.0, 30_000.0, 29_500.0, 200.0),
                &params(),
            );
            assert_eq!(d, Decision::None, "bar {seq} must not close yet");
            assert_eq!(state.below_stop_ct, seq as u32);
        }

        // Tenth touching bar: confirmed exit.
        let d = evaluate(
            &mut state,
            &bar(10, 29_400.0, 30_050.0, 29_900.0, 30_000.0, 29_500.0, 200.0),
            &params(),
        );
        assert_eq!(
            d,
            Decision::Close {
                reason: ExitReason::StopLoss
            }
        );
    }

    #[test]
    fn s5_intervening_bar_resets_streak() {
        let mut state = SymbolState::new("BTCUSDT");
        state.observe_bar(0);
        state.apply_entry(PositionSide::Long, 30_000.0, 29_400.0);

        for seq in 1..=5 {
            evaluate(
                &mut state,
                &bar(seq, 29_400.0, 30_050.0, 29_900.0, 30_000.0, 29_500.0, 200.0),
                &params(),
            );
        }
        assert_eq!(state.below_stop_ct, 5);

        // One bar holding above the stop resets the counter to zero.
        evaluate(
            &mut state,
            &bar(6, 29_500.0, 30_050.0, 29_900.0, 30_000.0, 29_500.0, 200.0),
            &params(),
        );
        assert_eq!(state.below_stop_ct, 0);
    }

    // --- Trailing-stop monotonicity ------------------------------------------

    #[test]
    fn trailing_stop_never_retreats_for_long() {
        let mut state = SymbolState::new("BTCUSDT");
        state.observe_bar(0);
        state.apply_entry(PositionSide::Long, 30_000.0, 29_400.0);

        // AVG20 rises: stop follows up to 30_500 * 0.98 = 29_890.
        evaluate(
            &mut state,
            &bar(1, 30_400.0, 30_700.0, 30_600.0, 30_500.0, 29_800.0, 150.0),
            &params(),
        );
        assert_eq!(state.stop_loss, Some(30_500.0 * 0.98));

        // AVG20 falls back: the stop must not move down.
        evaluate(
            &mut state,
            &bar(2, 30_000.0, 30_300.0, 30_200.0, 30_100.0, 29_800.0, 150.0),
            &params(),
        );
        assert_eq!(state.stop_loss, Some(30_500.0 * 0.98));
    }

    #[test]
    fn trailing_stop_never_retreats_for_short() {
        let mut state = SymbolState::new("BTCUSDT");
        state.observe_bar(0);
        state.apply_entry(PositionSide::Short, 30_000.0, 30_600.0);

        evaluate(
            &mut state,
            &bar(1, 29_300.0, 29_600.0, 29_400.0, 29_500.0, 30_200.0, 150.0),
            &params(),
        );
        assert_eq!(state.stop_loss, Some(29_500.0 * 1.02));

        evaluate(
            &mut state,
            &bar(2, 29_700.0, 30_000.0, 29_900.0, 29_900.0, 30_200.0, 150.0),
            &params(),
        );
        assert_eq!(state.stop_loss, Some(29_500.0 * 1.02));
    }

    // --- Recovered positions get their stop on the first ready bar -----------

    #[test]
    fn s6_recovered_position_installs_stop_from_current_anchor() {
        let mut state = SymbolState::new("BTCUSDT");
        state.recover(PositionSide::Long, 30_000.0, None, 3);

        let d = evaluate(
            &mut state,
            &bar(1, 30_300.0, 30_700.0, 30_600.0, 30_500.0, 29_800.0, 150.0),
            &params(),
        );
        assert_eq!(d, Decision::None);
        // 30_500 * 0.98 = 29_890
        assert_eq!(state.stop_loss, Some(30_500.0 * 0.98));
        // add_count stays pinned at the maximum.
        assert_eq!(state.add_count, 3);
    }

    // --- Gates ----------------------------------------------------------------

    #[test]
    fn stale_bar_is_ignored() {
        let mut state = SymbolState::new("BTCUSDT");
        let b = bar(1, 29_900.0, 30_300.0, 30_200.0, 30_000.0, 29_500.0, 100.0);
        let first = evaluate(&mut state, &b, &params());
        assert!(matches!(first, Decision::Open { .. }));

        // Same open_time again: no-op, bar_seq unchanged.
        let again = evaluate(&mut state, &b, &params());
        assert_eq!(again, Decision::None);
        assert_eq!(state.bar_seq, 1);
    }

    #[test]
    fn not_ready_indicators_are_a_no_op() {
        let mut state = SymbolState::new("BTCUSDT");
        let d = evaluate(&mut state, &not_ready_bar(1), &params());
        assert_eq!(d, Decision::None);
        // The bar still consumed the gate.
        assert_eq!(state.bar_seq, 1);
    }

    #[test]
    fn short_entry_is_symmetric() {
        let mut state = SymbolState::new("ETHUSDT");
        let d = evaluate(
            &mut state,
            &bar(1, 29_700.0, 30_100.0, 29_800.0, 30_000.0, 30_500.0, 100.0),
            &params(),
        );
        match d {
            Decision::Open {
                direction,
                stop_loss,
            } => {
                assert_eq!(direction, PositionSide::Short);
                assert!((stop_loss - 30_600.0).abs() < 1e-9);
            }
            other => panic!("expected short entry, got {other:?}"),
        }
    }
}
