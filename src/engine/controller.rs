// =============================================================================
// Live controller loop — poll, decide, execute, notify
// =============================================================================
//
// One controller task per process. Every tick (default 60 s):
//   1. per symbol, concurrently: fetch klines -> indicators -> second-to-last
//      (fully closed) bar -> decision core -> execute via the route -> commit
//      state. The per-symbol sequence is strictly serial; symbols only run
//      next to each other.
//   2. hourly: status summary + heartbeat.
//   3. daily-report window check.
//   4. error accounting: a tick with any escaped per-symbol failure bumps the
//      consecutive-error counter; five in a row raise SYSTEM_ERROR and reset
//      the counter. A clean tick resets it to zero.
//
// Ticks never overlap: if one runs long the next scheduled tick is skipped,
// not queued. Interrupt handling is cooperative at tick boundaries, and open
// positions are deliberately left untouched on shutdown.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{Timelike, Utc};
use futures_util::future::join_all;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::allocator;
use crate::binance::{BrokerError, FuturesClient};
use crate::config::StrategyParams;
use crate::engine::route::ExecutionRoute;
use crate::indicators::{self, IndicatorBar};
use crate::notifier::{report_time_now, Notifier, PositionPnl};
use crate::state::{RunState, SymbolState};
use crate::strategy::{self, Decision, ExitReason};
use crate::types::{MarginMode, PositionSide};

/// Failing ticks in a row before a SYSTEM_ERROR alert fires.
const MAX_CONSECUTIVE_ERRORS: u32 = 5;
/// Seconds between status summaries / heartbeats.
const STATUS_INTERVAL: Duration = Duration::from_secs(3600);

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub symbols: Vec<String>,
    pub timeframe: String,
    pub tick_interval: Duration,
    /// Local (UTC+8) hour inside which the daily report may go out.
    pub daily_report_hour: u32,
    /// Candles fetched per symbol per tick; must cover the slow indicator.
    pub kline_limit: u32,
}

impl ControllerSettings {
    pub fn new(symbols: Vec<String>, timeframe: String, tick_interval: Duration) -> Self {
        Self {
            symbols,
            timeframe,
            tick_interval,
            daily_report_hour: 8,
            kline_limit: 200,
        }
    }
}

// ---------------------------------------------------------------------------
// Per-symbol tick outcome
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum TickOutcome {
    Idle,
    Opened,
    Added,
    Closed { pnl_pct: Decimal },
    /// An error escaped per-symbol processing; feeds the error counter.
    Failed(String),
}

/// Fold one tick's error flag into the run counters.
///
/// Returns `true` when the consecutive-error threshold was just reached (the
/// caller alerts and the counter has been reset so the engine keeps going).
fn register_tick_errors(run: &mut RunState, had_error: bool) -> bool {
    if !had_error {
        run.consecutive_errors = 0;
        return false;
    }
    run.consecutive_errors += 1;
    if run.consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
        run.consecutive_errors = 0;
        return true;
    }
    false
}

/// Stop level for a position recovered at startup, from the latest bar's
/// AVG20. `None` when the indicator is not ready yet.
fn recovery_stop(bars: &[IndicatorBar], side: PositionSide, ma20_buffer: f64) -> Option<f64> {
    bars.last()
        .and_then(|bar| bar.avg20)
        .map(|avg20| strategy::stop_anchor(side, avg20, ma20_buffer))
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct Controller {
    client: Arc<FuturesClient>,
    route: Arc<dyn ExecutionRoute>,
    notifier: Arc<Notifier>,
    params: StrategyParams,
    settings: ControllerSettings,
    states: HashMap<String, SymbolState>,
    run: RunState,
}

impl Controller {
    /// Fail-fast initialization: ping the venue, configure every symbol, seed
    /// the run equity, and reconstruct state for any position the venue still
    /// holds from a previous run. Any failure here aborts the process.
    pub async fn initialize(
        client: Arc<FuturesClient>,
        route: Arc<dyn ExecutionRoute>,
        notifier: Arc<Notifier>,
        params: StrategyParams,
        settings: ControllerSettings,
    ) -> Result<Self> {
        params.validate()?;
        anyhow::ensure!(!settings.symbols.is_empty(), "no symbols configured");

        info!("============================================================");
        info!(
            route = route.label(),
            symbols = ?settings.symbols,
            timeframe = %settings.timeframe,
            "BiGe 7x trading engine starting"
        );
        info!("============================================================");

        client.ping().await.context("venue unreachable")?;
        info!("venue connectivity ok");

        for symbol in &settings.symbols {
            route
                .prepare_symbol(symbol, params.leverage, MarginMode::Isolated)
                .await
                .with_context(|| format!("failed to configure {symbol}"))?;
        }

        let balance = route.balance().await.context("failed to read balance")?;
        info!(
            total = %balance.total,
            available = %balance.available,
            "account balance read"
        );

        let run = RunState::new(settings.symbols.clone(), balance.total, Utc::now());

        let mut states: HashMap<String, SymbolState> = settings
            .symbols
            .iter()
            .map(|s| (s.clone(), SymbolState::new(s.clone())))
            .collect();

        // --- Position recovery ------------------------------------------------
        let mut recovered: Vec<String> = Vec::new();
        for symbol in &settings.symbols {
            let position = route
                .position(symbol)
                .await
                .with_context(|| format!("failed to query position for {symbol}"))?;
            let Some(position) = position else { continue };

            info!(
                symbol,
                side = %position.side,
                qty = %position.qty,
                entry = position.entry_price,
                "existing position detected — reconstructing state"
            );

            // Recompute the stop from the current AVG20 anchor; on thin or
            // failed data the stop stays unset and the decision core installs
            // it on the first ready bar.
            let stop = match client
                .get_klines(symbol, &settings.timeframe, settings.kline_limit)
                .await
            {
                Ok(klines) if klines.len() >= indicators::SLOW_PERIOD => {
                    let bars = indicators::compute_series(&klines);
                    recovery_stop(&bars, position.side, params.ma20_buffer)
                }
                Ok(_) => {
                    warn!(symbol, "not enough history to recompute the stop");
                    None
                }
                Err(e) => {
                    warn!(symbol, error = %e, "kline fetch failed during recovery");
                    None
                }
            };

            if let Some(state) = states.get_mut(symbol) {
                state.recover(
                    position.side,
                    position.entry_price,
                    stop,
                    params.max_add_count,
                );
            }
            recovered.push(format!("{symbol}: {}", position.side));
        }

        if !recovered.is_empty() {
            let body = format!(
                "Recovered {} open position(s) from a previous run:\n{}",
                recovered.len(),
                recovered
                    .iter()
                    .map(|p| format!("├ {p}"))
                    .collect::<Vec<_>>()
                    .join("\n")
            );
            notifier.send_alert("POSITIONS_RECOVERED", &body, None).await;
        }

        // --- Startup notification ---------------------------------------------
        let per_symbol = balance.total / Decimal::from(settings.symbols.len() as u64);
        let scope = if settings.symbols.len() == 1 {
            settings.symbols[0].clone()
        } else {
            format!("{} symbols", settings.symbols.len())
        };
        let config_summary = format!(
            "├ Symbols: {}\n├ Per-symbol slot: ${}\n├ Size: {:.0}%\n├ Max adds: {}\n└ Stop mode: AVG20 trailing",
            settings
                .symbols
                .iter()
                .map(|s| s.trim_end_matches("USDT"))
                .collect::<Vec<_>>()
                .join(", "),
            per_symbol.round_dp(2),
            params.position_size_pct * 100.0,
            params.max_add_count,
        );
        notifier
            .send_startup(balance.total, params.leverage, &scope, &config_summary)
            .await;

        info!("initialization complete");

        Ok(Self {
            client,
            route,
            notifier,
            params,
            settings,
            states,
            run,
        })
    }

    // -------------------------------------------------------------------------
    // Main loop
    // -------------------------------------------------------------------------

    /// Run until interrupted. The in-flight tick always completes before the
    /// loop exits; positions are never auto-closed on shutdown.
    pub async fn run(mut self) -> Result<()> {
        info!(
            interval_secs = self.settings.tick_interval.as_secs(),
            "entering main loop"
        );

        let mut interval = tokio::time::interval(self.settings.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        let mut last_status = Instant::now();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;

                    if last_status.elapsed() >= STATUS_INTERVAL {
                        self.print_status().await;
                        self.heartbeat().await;
                        last_status = Instant::now();
                    }
                    self.check_daily_report().await;
                }
                _ = &mut ctrl_c => {
                    info!("interrupt received — draining and shutting down");
                    break;
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// One full tick over all symbols.
    async fn tick(&mut self) {
        let symbols = self.settings.symbols.clone();

        let mut taken = Vec::with_capacity(symbols.len());
        for symbol in &symbols {
            let state = self
                .states
                .remove(symbol)
                .unwrap_or_else(|| SymbolState::new(symbol.clone()));
            taken.push(state);
        }

        // Per-symbol pipelines run next to each other; each one is serial
        // inside (fetch -> decide -> execute -> commit).
        let jobs = taken.into_iter().map(|state| self.process_symbol(state));
        let results = join_all(jobs).await;

        let mut had_error = false;
        for (state, outcome) in results {
            self.states.insert(state.symbol.clone(), state);
            match outcome {
                TickOutcome::Closed { pnl_pct } => self.run.record_trade(pnl_pct),
                TickOutcome::Failed(msg) => {
                    error!(error = %msg, "symbol processing failed");
                    had_error = true;
                }
                TickOutcome::Idle | TickOutcome::Opened | TickOutcome::Added => {}
            }
        }

        if register_tick_errors(&mut self.run, had_error) {
            self.notifier
                .send_alert(
                    "SYSTEM_ERROR",
                    &format!(
                        "{MAX_CONSECUTIVE_ERRORS} consecutive failing ticks. \
                         The engine keeps running, but it needs a look."
                    ),
                    None,
                )
                .await;
        }
    }

    /// fetch -> indicators -> decide -> execute -> commit, for one symbol.
    async fn process_symbol(&self, mut state: SymbolState) -> (SymbolState, TickOutcome) {
        let symbol = state.symbol.clone();

        let klines = match self
            .client
            .get_klines(&symbol, &self.settings.timeframe, self.settings.kline_limit)
            .await
        {
            Ok(k) => k,
            Err(e) => {
                return (state, TickOutcome::Failed(format!("{symbol}: kline fetch: {e}")));
            }
        };

        // Short history is a data-integrity gap, not an error: no action and
        // no escalation until the venue serves enough bars.
        if klines.len() < indicators::SLOW_PERIOD + 2 {
            warn!(symbol, bars = klines.len(), "insufficient kline history — skipping");
            return (state, TickOutcome::Idle);
        }

        let bars = indicators::compute_series(&klines);
        // Second-to-last element: the last fully closed bar.
        let row = bars[bars.len() - 2];

        let seq_before = state.bar_seq;
        let decision = strategy::evaluate(&mut state, &row, &self.params);
        let fresh_bar = state.bar_seq > seq_before;

        if fresh_bar {
            info!(
                symbol,
                bar_seq = state.bar_seq,
                open_time = row.candle.open_time,
                close = row.candle.close,
                avg20 = row.avg20,
                avg60 = row.avg60,
                ready = row.ready(),
                "completed bar processed"
            );
        }

        let outcome = match decision {
            Decision::None => TickOutcome::Idle,
            Decision::Open {
                direction,
                stop_loss,
            } => self.execute_entry(&mut state, direction, stop_loss, &row).await,
            Decision::Add => self.execute_add(&mut state, &row).await,
            Decision::Close { reason } => self.execute_exit(&mut state, reason, &row).await,
        };

        // Mark-to-market hook for the shadow book; no-op on the live route.
        if fresh_bar {
            self.route.mark_bar(&symbol, row.candle.close);
        }

        (state, outcome)
    }

    // -------------------------------------------------------------------------
    // Action execution
    // -------------------------------------------------------------------------

    async fn execute_entry(
        &self,
        state: &mut SymbolState,
        direction: PositionSide,
        stop_loss: f64,
        row: &IndicatorBar,
    ) -> TickOutcome {
        let symbol = state.symbol.clone();

        // Equity is read fresh at entry time, never cached across ticks.
        let balance = match self.route.balance().await {
            Ok(b) => b,
            Err(e) => return TickOutcome::Failed(format!("{symbol}: balance read: {e}")),
        };
        let precision = match self.client.get_symbol_precision(&symbol).await {
            Ok(p) => p,
            Err(e) => return TickOutcome::Failed(format!("{symbol}: precision lookup: {e}")),
        };
        let mark = match self.client.mark_price(&symbol).await {
            Ok(p) => p,
            Err(e) => return TickOutcome::Failed(format!("{symbol}: mark price: {e}")),
        };

        let qty = match allocator::entry_qty(
            balance.available,
            self.settings.symbols.len(),
            &self.params,
            mark,
            &precision,
        ) {
            Ok(q) => q,
            Err(e) => {
                warn!(symbol, error = %e, "entry sizing rejected — skipping");
                return TickOutcome::Idle;
            }
        };

        info!(symbol, direction = %direction, %qty, mark, "attempting entry");

        match self
            .route
            .market_order(&symbol, direction.entry_order_side(), qty, row.candle.close)
            .await
        {
            Ok(order) => {
                let fill = order.avg_price.value();
                state.apply_entry(direction, fill, stop_loss);
                info!(symbol, fill, stop = stop_loss, "entry filled");

                let equity = self
                    .route
                    .balance()
                    .await
                    .map(|b| b.total)
                    .unwrap_or(balance.total);
                self.notifier
                    .send_entry(
                        direction,
                        &symbol,
                        order.executed_qty,
                        fill,
                        self.params.leverage,
                        stop_loss,
                        equity,
                    )
                    .await;
                TickOutcome::Opened
            }
            Err(e) => self.order_failure(&symbol, "entry", e).await,
        }
    }

    async fn execute_add(&self, state: &mut SymbolState, row: &IndicatorBar) -> TickOutcome {
        let symbol = state.symbol.clone();
        let Some(direction) = state.direction else {
            return TickOutcome::Idle;
        };

        let position = match self.route.position(&symbol).await {
            Ok(Some(p)) => p,
            Ok(None) => {
                warn!(symbol, "state holds a position but the venue is flat — skipping add");
                return TickOutcome::Idle;
            }
            Err(e) => return TickOutcome::Failed(format!("{symbol}: position query: {e}")),
        };
        let precision = match self.client.get_symbol_precision(&symbol).await {
            Ok(p) => p,
            Err(e) => return TickOutcome::Failed(format!("{symbol}: precision lookup: {e}")),
        };

        let Some(qty) = allocator::add_qty(position.qty, &precision) else {
            warn!(symbol, "add quantity truncates to zero — skipping");
            return TickOutcome::Idle;
        };

        info!(symbol, %qty, add_count = state.add_count + 1, "attempting scale-in");

        match self
            .route
            .market_order(&symbol, direction.entry_order_side(), qty, row.candle.close)
            .await
        {
            Ok(order) => {
                state.apply_add();
                info!(symbol, add_count = state.add_count, "scale-in filled");

                let updated = self.route.position(&symbol).await.ok().flatten();
                let (total_qty, avg_price) = updated
                    .map(|p| (p.qty, p.entry_price))
                    .unwrap_or((order.executed_qty, order.avg_price.value()));

                self.notifier
                    .send_add_position(
                        direction,
                        &symbol,
                        order.executed_qty,
                        order.avg_price.value(),
                        state.add_count,
                        self.params.max_add_count,
                        total_qty,
                        avg_price,
                    )
                    .await;
                TickOutcome::Added
            }
            Err(e) => self.order_failure(&symbol, "scale-in", e).await,
        }
    }

    async fn execute_exit(
        &self,
        state: &mut SymbolState,
        reason: ExitReason,
        row: &IndicatorBar,
    ) -> TickOutcome {
        let symbol = state.symbol.clone();
        let Some(direction) = state.direction else {
            return TickOutcome::Idle;
        };
        let entry_price = state.entry_price.unwrap_or(0.0);

        let qty_before = self
            .route
            .position(&symbol)
            .await
            .ok()
            .flatten()
            .map(|p| p.qty)
            .unwrap_or(Decimal::ZERO);

        match self.route.close_position(&symbol, row.candle.close).await {
            Ok(Some(result)) => {
                let exit_price = result.avg_price.value();
                let pnl_frac = if entry_price > 0.0 {
                    match direction {
                        PositionSide::Long => (exit_price - entry_price) / entry_price,
                        PositionSide::Short => (entry_price - exit_price) / entry_price,
                    }
                } else {
                    0.0
                };
                let pnl_pct = pnl_frac * 100.0;
                let pnl_amount = (qty_before
                    * Decimal::from_f64(entry_price * pnl_frac).unwrap_or(Decimal::ZERO))
                .round_dp(4);

                state.apply_exit();
                info!(symbol, exit_price, pnl_pct, reason = %reason, "position closed");

                self.notifier
                    .send_exit(
                        direction,
                        &symbol,
                        qty_before,
                        entry_price,
                        exit_price,
                        pnl_amount,
                        pnl_pct,
                        &reason.to_string(),
                    )
                    .await;

                TickOutcome::Closed {
                    pnl_pct: Decimal::from_f64(pnl_pct).unwrap_or(Decimal::ZERO),
                }
            }
            Ok(None) => {
                warn!(symbol, "venue reports no position on close — clearing state");
                state.apply_exit();
                TickOutcome::Idle
            }
            Err(e) => self.order_failure(&symbol, "close", e).await,
        }
    }

    /// Order-failure policy: trade-logical rejects are logged and alerted but
    /// do not escalate (the next bar retries); transport/auth/venue failures
    /// feed the consecutive-error counter. A failed order is never retried
    /// here — order placement is not idempotent.
    async fn order_failure(&self, symbol: &str, action: &str, e: BrokerError) -> TickOutcome {
        match e {
            BrokerError::Rejected(_)
            | BrokerError::Precision(_)
            | BrokerError::InsufficientMargin(_) => {
                warn!(symbol, action, error = %e, "order rejected");
                self.notifier
                    .send_alert(
                        "TRADE_ERROR",
                        &format!("{symbol} {action} failed — check the account."),
                        Some(&e.to_string()),
                    )
                    .await;
                TickOutcome::Idle
            }
            e if e.is_auth() => {
                // Mid-run auth failures alert immediately and still feed the
                // error counter.
                self.notifier
                    .send_alert(
                        "API_ERROR",
                        &format!("{symbol} {action} failed to authenticate."),
                        Some(&e.to_string()),
                    )
                    .await;
                TickOutcome::Failed(format!("{symbol}: {action}: {e}"))
            }
            other => TickOutcome::Failed(format!("{symbol}: {action}: {other}")),
        }
    }

    // -------------------------------------------------------------------------
    // Periodic reporting
    // -------------------------------------------------------------------------

    async fn print_status(&self) {
        let balance = match self.route.balance().await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "status: balance read failed");
                return;
            }
        };

        info!("========== status ==========");
        info!(
            equity = %balance.total,
            unrealized = %balance.unrealized_pnl,
            "account"
        );

        let mut open = 0;
        for symbol in &self.settings.symbols {
            if let Ok(Some(pos)) = self.route.position(symbol).await {
                open += 1;
                let add_count = self.states.get(symbol).map(|s| s.add_count).unwrap_or(0);
                info!(
                    symbol,
                    side = %pos.side,
                    qty = %pos.qty,
                    entry = pos.entry_price,
                    adds = format!("{add_count}/{}", self.params.max_add_count),
                    "open position"
                );
            }
        }
        if open == 0 {
            info!("no open positions");
        }

        if self.run.total_trades > 0 {
            info!(
                trades = self.run.total_trades,
                win_rate_pct = format!("{:.1}", self.run.win_rate_pct()),
                "trade statistics"
            );
        }
        info!("============================");
    }

    async fn heartbeat(&self) {
        let balance = match self.route.balance().await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "heartbeat: balance read failed");
                return;
            }
        };

        let ref_symbol = self
            .settings
            .symbols
            .first()
            .cloned()
            .unwrap_or_else(|| "BTCUSDT".to_string());
        let ref_price = self.client.mark_price(&ref_symbol).await.unwrap_or(0.0);

        let mut holding: Vec<String> = Vec::new();
        let mut pnls: Vec<PositionPnl> = Vec::new();
        for symbol in &self.settings.symbols {
            let Ok(Some(pos)) = self.route.position(symbol).await else {
                continue;
            };
            holding.push(symbol.trim_end_matches("USDT").to_string());

            let current = self.client.mark_price(symbol).await.unwrap_or(0.0);
            if pos.entry_price > 0.0 && current > 0.0 {
                let pnl_pct = match pos.side {
                    PositionSide::Long => (current - pos.entry_price) / pos.entry_price * 100.0,
                    PositionSide::Short => (pos.entry_price - current) / pos.entry_price * 100.0,
                };
                pnls.push(PositionPnl {
                    symbol: symbol.clone(),
                    direction: pos.side,
                    pnl_pct,
                });
            }
        }

        let position_info =
            (!holding.is_empty()).then(|| format!("holding {}", holding.join(", ")));
        let total_unrealized = (!pnls.is_empty()).then_some(balance.unrealized_pnl);

        self.notifier
            .send_heartbeat(
                balance.total,
                &ref_symbol,
                ref_price,
                position_info.as_deref(),
                Some(self.run.uptime_hours(Utc::now())),
                &pnls,
                total_unrealized,
            )
            .await;
    }

    async fn check_daily_report(&mut self) {
        let now = report_time_now();
        if now.hour() != self.settings.daily_report_hour {
            return;
        }
        let today = now.date_naive();
        if self.run.last_daily_report_date == Some(today) {
            return;
        }

        let balance = match self.route.balance().await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "daily report: balance read failed");
                return;
            }
        };
        let equity = balance.total;

        let (change, change_pct) = if self.run.daily_start_equity > Decimal::ZERO {
            let change = equity - self.run.daily_start_equity;
            let pct = (change / self.run.daily_start_equity * Decimal::from(100))
                .to_f64()
                .unwrap_or(0.0);
            (change, pct)
        } else {
            (Decimal::ZERO, 0.0)
        };

        let mut holding: Vec<String> = Vec::new();
        for symbol in &self.settings.symbols {
            if let Ok(Some(pos)) = self.route.position(symbol).await {
                holding.push(format!("{}: {}", symbol.trim_end_matches("USDT"), pos.side));
            }
        }
        let position_info = (!holding.is_empty()).then(|| holding.join(", "));

        self.notifier
            .send_daily_report(
                equity,
                change.round_dp(2),
                change_pct,
                self.run.daily_trades,
                self.run.daily_wins,
                position_info.as_deref(),
                self.run.uptime_hours(Utc::now()),
            )
            .await;

        self.run.roll_daily(equity, today);
    }

    async fn shutdown(&self) {
        self.print_status().await;

        let equity = self
            .route
            .balance()
            .await
            .map(|b| b.total)
            .unwrap_or(self.run.start_equity);

        self.notifier
            .send_shutdown(
                "interrupt (ctrl-c)",
                equity,
                self.run.total_trades,
                self.run.total_pnl_pct.to_f64().unwrap_or(0.0),
            )
            .await;

        info!("shutdown complete — open positions left untouched");
    }
}
