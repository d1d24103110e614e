// =============================================================================
// Per-symbol strategy state + run-level statistics
// =============================================================================
//
// One `SymbolState` per traded symbol, exclusively owned by the controller.
// All transitions go through the commit methods below so the state-machine
// invariants hold by construction:
//
//   - no direction  =>  entry_price / stop_loss / counters are cleared
//   - bar_seq is strictly monotone; the same bar is never observed twice
//   - after entry: entry_bar_seq == last_add_bar_seq == bar_seq, counters 0
// =============================================================================

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::PositionSide;

// ---------------------------------------------------------------------------
// SymbolState
// ---------------------------------------------------------------------------

/// Durable-within-run strategy state for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolState {
    pub symbol: String,
    /// Open position direction; `None` when flat.
    pub direction: Option<PositionSide>,
    /// Average entry price, defined iff `direction` is set.
    pub entry_price: Option<f64>,
    /// Trailing stop, defined iff `direction` is set — except right after a
    /// restart recovery where indicators were not yet ready.
    pub stop_loss: Option<f64>,
    /// Number of scale-ins executed for the current position.
    pub add_count: u32,
    /// Consecutive completed bars that touched the stop level.
    pub below_stop_ct: u32,
    /// Bar counter value at entry.
    pub entry_bar_seq: u64,
    /// Bar counter value at the most recent scale-in (or entry).
    pub last_add_bar_seq: u64,
    /// Monotone per-symbol counter, +1 per newly completed bar observed.
    pub bar_seq: u64,
    /// Open time of the last bar processed; used for new-bar detection.
    pub last_bar_open_time: Option<i64>,
}

impl SymbolState {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            direction: None,
            entry_price: None,
            stop_loss: None,
            add_count: 0,
            below_stop_ct: 0,
            entry_bar_seq: 0,
            last_add_bar_seq: 0,
            bar_seq: 0,
            last_bar_open_time: None,
        }
    }

    pub fn has_position(&self) -> bool {
        self.direction.is_some()
    }

    /// New-bar gate. A bar whose open time is not strictly greater than the
    /// last observed one is stale and must be ignored.
    ///
    /// Returns `true` (and advances `bar_seq`) only for a fresh bar.
    pub fn observe_bar(&mut self, open_time: i64) -> bool {
        if let Some(last) = self.last_bar_open_time {
            if open_time <= last {
                return false;
            }
        }
        self.last_bar_open_time = Some(open_time);
        self.bar_seq += 1;
        true
    }

    /// Bars elapsed since the position was last scaled into (or opened).
    pub fn bars_since_scale_in(&self) -> u64 {
        self.bar_seq
            .saturating_sub(self.entry_bar_seq.max(self.last_add_bar_seq))
    }

    /// Commit a successful entry fill.
    pub fn apply_entry(&mut self, direction: PositionSide, entry_price: f64, stop_loss: f64) {
        self.direction = Some(direction);
        self.entry_price = Some(entry_price);
        self.stop_loss = Some(stop_loss);
        self.add_count = 0;
        self.below_stop_ct = 0;
        self.entry_bar_seq = self.bar_seq;
        self.last_add_bar_seq = self.bar_seq;
    }

    /// Commit a successful scale-in fill.
    pub fn apply_add(&mut self) {
        self.add_count += 1;
        self.last_add_bar_seq = self.bar_seq;
    }

    /// Commit a position close: everything tied to the position resets. The
    /// bar counters survive — they order the whole run, not one trade.
    pub fn apply_exit(&mut self) {
        self.direction = None;
        self.entry_price = None;
        self.stop_loss = None;
        self.add_count = 0;
        self.below_stop_ct = 0;
    }

    /// Re-hydrate state from a venue-reported position after a restart.
    ///
    /// The scale-in count cannot be reconstructed, so it is pinned to the
    /// maximum — no further adds until the position turns over. When the
    /// stop could not be computed (indicators not ready yet) the state is
    /// explicit about it: `stop_loss` stays `None` and the decision core
    /// installs it on the first ready bar.
    pub fn recover(
        &mut self,
        direction: PositionSide,
        entry_price: f64,
        stop_loss: Option<f64>,
        max_add_count: u32,
    ) {
        self.direction = Some(direction);
        self.entry_price = Some(entry_price);
        self.stop_loss = stop_loss;
        self.add_count = max_add_count;
        self.below_stop_ct = 0;
        if stop_loss.is_none() {
            warn!(
                symbol = %self.symbol,
                "position recovered without a stop level — indicators not ready, \
                 stop will be installed on the first ready bar"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// RunState
// ---------------------------------------------------------------------------

/// Global per-controller statistics, owned by the controller task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub symbols: Vec<String>,
    pub start_time: DateTime<Utc>,
    pub start_equity: Decimal,
    pub daily_start_equity: Decimal,
    pub daily_trades: u32,
    pub daily_wins: u32,
    pub total_trades: u32,
    pub winning_trades: u32,
    /// Cumulative per-trade return, in percent.
    pub total_pnl_pct: Decimal,
    pub last_daily_report_date: Option<NaiveDate>,
    pub consecutive_errors: u32,
}

impl RunState {
    pub fn new(symbols: Vec<String>, start_equity: Decimal, now: DateTime<Utc>) -> Self {
        Self {
            symbols,
            start_time: now,
            start_equity,
            daily_start_equity: start_equity,
            daily_trades: 0,
            daily_wins: 0,
            total_trades: 0,
            winning_trades: 0,
            total_pnl_pct: Decimal::ZERO,
            last_daily_report_date: None,
            consecutive_errors: 0,
        }
    }

    /// Record a closed trade with its return in percent.
    pub fn record_trade(&mut self, pnl_pct: Decimal) {
        self.total_trades += 1;
        self.daily_trades += 1;
        if pnl_pct > Decimal::ZERO {
            self.winning_trades += 1;
            self.daily_wins += 1;
        }
        self.total_pnl_pct += pnl_pct;
    }

    /// Reset the daily window after a report went out.
    pub fn roll_daily(&mut self, equity: Decimal, date: NaiveDate) {
        self.last_daily_report_date = Some(date);
        self.daily_start_equity = equity;
        self.daily_trades = 0;
        self.daily_wins = 0;
    }

    pub fn win_rate_pct(&self) -> f64 {
        if self.total_trades == 0 {
            return 0.0;
        }
        self.winning_trades as f64 / self.total_trades as f64 * 100.0
    }

    pub fn uptime_hours(&self, now: DateTime<Utc>) -> f64 {
        (now - self.start_time).num_seconds() as f64 / 3600.0
    }
}
