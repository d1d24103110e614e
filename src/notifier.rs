// =============================================================================
// Watchdog notifier — rate-limited Telegram messages, fire-and-forget
// =============================================================================
//
// Message classes and their gates:
//   1. heartbeat     — at most once per hour per process
//   2. trade events  — entry / exit / add, ungated
//   3. alerts        — per-category cooldown (10 min), dropped silently inside
//   4. daily report  — at most once per calendar day (UTC+8)
//   5. startup/shutdown — ungated framing messages
//
// Delivery is strictly best-effort: failures are logged and swallowed. The
// controller must never see a notification error.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::{debug, error, warn};

use crate::types::PositionSide;

/// Alert cooldown per category, in seconds.
const ALERT_COOLDOWN_SECS: i64 = 10 * 60;
/// Heartbeat interval floor, in seconds.
const HEARTBEAT_INTERVAL_SECS: i64 = 3600;
/// Reporting timezone (UTC+8).
const TZ_OFFSET_HOURS: i32 = 8;

/// Current time in the reporting timezone.
pub fn report_time_now() -> DateTime<FixedOffset> {
    let offset = FixedOffset::east_opt(TZ_OFFSET_HOURS * 3600).expect("valid fixed offset");
    Utc::now().with_timezone(&offset)
}

/// Per-position PnL line for the heartbeat summary.
#[derive(Debug, Clone)]
pub struct PositionPnl {
    pub symbol: String,
    pub direction: PositionSide,
    pub pnl_pct: f64,
}

/// Telegram notifier with per-class delivery gates.
pub struct Notifier {
    bot_token: String,
    chat_id: String,
    enabled: bool,
    client: reqwest::Client,

    last_heartbeat: Mutex<Option<DateTime<FixedOffset>>>,
    last_daily_report: Mutex<Option<NaiveDate>>,
    /// category -> last time an alert of that category went out.
    cooldowns: Mutex<HashMap<String, DateTime<FixedOffset>>>,

    messages_sent: AtomicU64,
    delivery_errors: AtomicU64,
}

impl Notifier {
    /// Build from `BOT_TOKEN` / `CHAT_ID`. Missing credentials are fatal —
    /// a live engine must not start silently mute.
    pub fn from_env() -> Result<Self> {
        let bot_token = std::env::var("BOT_TOKEN").map_err(|_| {
            anyhow::anyhow!("BOT_TOKEN is not set — notification channel unavailable")
        })?;
        let chat_id = std::env::var("CHAT_ID")
            .map_err(|_| anyhow::anyhow!("CHAT_ID is not set — notification channel unavailable"))?;
        anyhow::ensure!(!bot_token.is_empty(), "BOT_TOKEN is empty");
        anyhow::ensure!(!chat_id.is_empty(), "CHAT_ID is empty");
        Ok(Self::build(bot_token, chat_id, true))
    }

    /// A notifier that formats nothing and sends nothing. Used by the
    /// downloader and by tests.
    pub fn disabled() -> Self {
        Self::build(String::new(), String::new(), false)
    }

    fn build(bot_token: String, chat_id: String, enabled: bool) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            bot_token,
            chat_id,
            enabled,
            client,
            last_heartbeat: Mutex::new(None),
            last_daily_report: Mutex::new(None),
            cooldowns: Mutex::new(HashMap::new()),
            messages_sent: AtomicU64::new(0),
            delivery_errors: AtomicU64::new(0),
        }
    }

    // -------------------------------------------------------------------------
    // Delivery gates (pure over the supplied clock, directly testable)
    // -------------------------------------------------------------------------

    /// Heartbeat gate: passes at most once per hour. Passing consumes the slot.
    fn heartbeat_gate(&self, now: DateTime<FixedOffset>) -> bool {
        let mut last = self.last_heartbeat.lock();
        if let Some(prev) = *last {
            if (now - prev).num_seconds() < HEARTBEAT_INTERVAL_SECS {
                return false;
            }
        }
        *last = Some(now);
        true
    }

    /// Alert gate: one alert per category per cooldown window.
    fn alert_gate(&self, category: &str, now: DateTime<FixedOffset>) -> bool {
        let mut cooldowns = self.cooldowns.lock();
        if let Some(prev) = cooldowns.get(category) {
            if (now - *prev).num_seconds() < ALERT_COOLDOWN_SECS {
                debug!(category, "alert dropped — category cooling down");
                return false;
            }
        }
        cooldowns.insert(category.to_string(), now);
        true
    }

    /// Daily-report gate: once per calendar day.
    fn daily_gate(&self, today: NaiveDate) -> bool {
        let mut last = self.last_daily_report.lock();
        if *last == Some(today) {
            return false;
        }
        *last = Some(today);
        true
    }

    // -------------------------------------------------------------------------
    // Raw delivery
    // -------------------------------------------------------------------------

    /// Fire a message at the Telegram API. Never returns an error; failures
    /// are counted and logged.
    async fn deliver(&self, text: String) -> bool {
        if !self.enabled {
            debug!("notifier disabled — message dropped");
            return false;
        }

        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let payload = serde_json::json!({
            "chat_id": self.chat_id,
            "text": text,
            "parse_mode": "HTML",
        });

        match self.client.post(&url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => {
                self.messages_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Ok(resp) => {
                self.delivery_errors.fetch_add(1, Ordering::Relaxed);
                error!(status = %resp.status(), "telegram delivery failed");
                false
            }
            Err(e) => {
                self.delivery_errors.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, "telegram delivery error");
                false
            }
        }
    }

    // -------------------------------------------------------------------------
    // Message shapes
    // -------------------------------------------------------------------------

    pub async fn send_startup(
        &self,
        equity: Decimal,
        leverage: u32,
        scope: &str,
        config_summary: &str,
    ) -> bool {
        let now = report_time_now();
        let text = format!(
            "<b>🐕 Woof! The watchdog is on duty!</b>\n\n\
             Started: {}\n\n\
             ⚙️ <b>Setup</b>\n\
             ├ Watching: {scope}\n\
             ├ Leverage: {leverage}x\n\
             ├ Equity: <code>${equity}</code> USDT\n\
             └ Mode: BiGe 7x trend\n\n\
             📋 <b>Strategy</b>\n{config_summary}\n\n\
             <i>🦴 Patrol starting — you'll hear about anything that moves.</i>",
            now.format("%Y-%m-%d %H:%M:%S"),
        );
        self.deliver(text).await
    }

    pub async fn send_shutdown(
        &self,
        reason: &str,
        equity: Decimal,
        total_trades: u32,
        total_pnl_pct: f64,
    ) -> bool {
        let now = report_time_now();
        let sign = if total_pnl_pct >= 0.0 { "+" } else { "" };
        let text = format!(
            "<b>🐕 The watchdog is clocking out...</b>\n\n\
             Stopped: {}\nReason: {reason}\n\n\
             📊 <b>Run totals</b>\n\
             ├ Final equity: <code>${equity}</code> USDT\n\
             ├ Trades: {total_trades}\n\
             └ Cumulative return: <code>{sign}{total_pnl_pct:.2}%</code>\n\n\
             <i>🦴 Off to the kennel — see you next run!</i>",
            now.format("%Y-%m-%d %H:%M:%S"),
        );
        self.deliver(text).await
    }

    /// Hourly heartbeat. Returns `false` without sending when the hour gate
    /// has not elapsed yet.
    #[allow(clippy::too_many_arguments)]
    pub async fn send_heartbeat(
        &self,
        equity: Decimal,
        ref_symbol: &str,
        price: f64,
        position_info: Option<&str>,
        uptime_hours: Option<f64>,
        positions_pnl: &[PositionPnl],
        total_unrealized_pnl: Option<Decimal>,
    ) -> bool {
        let now = report_time_now();
        if !self.heartbeat_gate(now) {
            return false;
        }

        let position_text = position_info.unwrap_or("flat, standing by");
        let uptime_text = match uptime_hours {
            Some(h) => format!("{h:.1}h"),
            None => "just started".to_string(),
        };

        let mut pnl_section = String::new();
        if !positions_pnl.is_empty() {
            pnl_section.push_str("\n\n📊 <b>Open PnL</b>");
            for pos in positions_pnl {
                let emoji = if pos.pnl_pct >= 0.0 { "📈" } else { "📉" };
                let sign = if pos.pnl_pct >= 0.0 { "+" } else { "" };
                let base = pos.symbol.trim_end_matches("USDT");
                let dir = match pos.direction {
                    PositionSide::Long => "L",
                    PositionSide::Short => "S",
                };
                pnl_section.push_str(&format!(
                    "\n├ {base} ({dir}): {emoji} {sign}{:.2}%",
                    pos.pnl_pct
                ));
            }
            if let Some(total) = total_unrealized_pnl {
                let emoji = if total >= Decimal::ZERO { "💚" } else { "❤️" };
                pnl_section.push_str(&format!("\n└ Total: {emoji} <code>${total}</code>"));
            }
        }

        let text = format!(
            "<b>🐕 Woof! Still at my post!</b>\n\n\
             📊 <b>System</b>\n\
             ├ Time: {}\n\
             ├ Uptime: {uptime_text}\n\
             └ Status: nominal\n\n\
             💰 <b>Account</b>\n\
             ├ Equity: <code>${equity}</code> USDT\n\
             ├ {}: <code>${price:.2}</code>\n\
             └ Position: {position_text}{pnl_section}\n\n\
             <i>🦴 Patrol continues...</i>",
            now.format("%Y-%m-%d %H:%M"),
            ref_symbol.trim_end_matches("USDT"),
        );
        self.deliver(text).await
    }

    pub async fn send_entry(
        &self,
        direction: PositionSide,
        symbol: &str,
        qty: Decimal,
        price: f64,
        leverage: u32,
        stop_loss: f64,
        equity: Decimal,
    ) -> bool {
        let (emoji, mood) = match direction {
            PositionSide::Long => ("🟢", "Tail up — prey spotted!"),
            PositionSide::Short => ("🔴", "Ears up — hunting downhill!"),
        };
        let notional = (qty * dec2(price)).round_dp(2);
        let text = format!(
            "<b>{emoji} Woof woof! Position opened! {mood}</b>\n\n\
             🎯 <b>Trade</b>\n\
             ├ Direction: <b>{direction}</b> {symbol}\n\
             ├ Quantity: <code>{qty}</code>\n\
             ├ Price: <code>${price:.2}</code>\n\
             ├ Leverage: {leverage}x\n\
             └ Notional: <code>${notional}</code>\n\n\
             🛡️ <b>Risk</b>\n\
             └ Stop: <code>${stop_loss:.2}</code>\n\n\
             💰 Equity: <code>${equity}</code> USDT\n\n\
             <i>🐕 Locked on. Watching every bar...</i>"
        );
        self.deliver(text).await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn send_add_position(
        &self,
        direction: PositionSide,
        symbol: &str,
        add_qty: Decimal,
        price: f64,
        add_count: u32,
        max_add: u32,
        total_qty: Decimal,
        avg_price: f64,
    ) -> bool {
        let emoji = match direction {
            PositionSide::Long => "🟢",
            PositionSide::Short => "🔴",
        };
        let hint = if add_count >= max_add {
            " (budget spent — no more adds!)"
        } else if add_count + 1 >= max_add {
            " (almost at the limit, careful!)"
        } else {
            ""
        };
        let text = format!(
            "<b>{emoji} Woof! Pressing the advantage!</b>\n\n\
             📈 <b>Scale-in</b>\n\
             ├ Direction: {direction} {symbol}\n\
             ├ Added: <code>{add_qty}</code>\n\
             ├ Price: <code>${price:.2}</code>\n\
             └ Add {add_count}/{max_add}{hint}\n\n\
             📊 <b>Position now</b>\n\
             ├ Total qty: <code>{total_qty}</code>\n\
             └ Avg price: <code>${avg_price:.2}</code>\n\n\
             <i>🦴 Done adding — back to watching.</i>"
        );
        self.deliver(text).await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn send_exit(
        &self,
        direction: PositionSide,
        symbol: &str,
        qty: Decimal,
        entry_price: f64,
        exit_price: f64,
        pnl: Decimal,
        pnl_pct: f64,
        reason: &str,
    ) -> bool {
        let (emoji, label, mood, sign) = if pnl >= Decimal::ZERO {
            ("🎉", "Profit", "Woof woof! Got the bone!", "+")
        } else {
            ("😢", "Loss", "Whine... that one got away.", "")
        };
        let text = format!(
            "<b>{emoji} Position closed. {mood}</b>\n\n\
             📋 <b>Settlement</b>\n\
             ├ Direction: {direction} {symbol}\n\
             ├ Quantity: <code>{qty}</code>\n\
             ├ Entry: <code>${entry_price:.2}</code>\n\
             ├ Exit: <code>${exit_price:.2}</code>\n\
             └ Reason: {reason}\n\n\
             💵 <b>Result</b>\n\
             ├ {label}: <code>{sign}${}</code> USDT\n\
             └ Return: <code>{sign}{pnl_pct:.2}%</code>\n\n\
             <i>🐕 Resting up for the next hunt...</i>",
            pnl.abs()
        );
        self.deliver(text).await
    }

    /// Category-gated alert. Dropped silently inside the cooldown window.
    pub async fn send_alert(&self, category: &str, body: &str, details: Option<&str>) -> bool {
        let now = report_time_now();
        if !self.alert_gate(category, now) {
            return false;
        }

        let emoji = match category {
            "API_ERROR" => "🚨",
            "CONNECTION_LOST" => "📡",
            "LIQUIDATION_RISK" => "💀",
            "SYSTEM_ERROR" => "🔥",
            "TRADE_ERROR" => "🛑",
            "LOW_BALANCE" => "💸",
            _ => "⚠️",
        };
        let details_text = match details {
            Some(d) => format!("\n\n📝 <b>Details</b>\n<code>{d}</code>"),
            None => String::new(),
        };
        let text = format!(
            "<b>{emoji} Bark bark! Alert!</b>\n\n\
             🚨 <b>Category: {category}</b>\n\n\
             {body}{details_text}\n\n\
             ⏰ {}\n\n\
             <i>🐕 On it — watch for follow-ups.</i>",
            now.format("%Y-%m-%d %H:%M:%S"),
        );
        warn!(category, body, "alert raised");
        self.deliver(text).await
    }

    /// Daily summary, gated to once per calendar day.
    #[allow(clippy::too_many_arguments)]
    pub async fn send_daily_report(
        &self,
        equity: Decimal,
        equity_change: Decimal,
        equity_change_pct: f64,
        trades_today: u32,
        wins_today: u32,
        position_info: Option<&str>,
        uptime_hours: f64,
    ) -> bool {
        let now = report_time_now();
        if !self.daily_gate(now.date_naive()) {
            return false;
        }

        let win_rate = if trades_today > 0 {
            wins_today as f64 / trades_today as f64 * 100.0
        } else {
            0.0
        };
        let (emoji, comment) = if equity_change_pct > 5.0 {
            ("🚀", "Great day — extra bone earned!")
        } else if equity_change_pct > 0.0 {
            ("😊", "Steady as she goes. Keep it up!")
        } else if equity_change_pct > -5.0 {
            ("😐", "Small dip. Tomorrow's another hunt.")
        } else {
            ("😢", "Rough day... but this dog doesn't quit.")
        };
        let sign = if equity_change >= Decimal::ZERO { "+" } else { "" };
        let position_text = position_info.unwrap_or("flat, resting");

        let text = format!(
            "<b>{emoji} Watchdog daily — {}</b>\n\n\
             {comment}\n\n\
             💰 <b>Account</b>\n\
             ├ Equity: <code>${equity}</code> USDT\n\
             ├ Day PnL: <code>{sign}${equity_change}</code> ({sign}{equity_change_pct:.2}%)\n\
             └ Position: {position_text}\n\n\
             📊 <b>Trades</b>\n\
             ├ Today: {trades_today}\n\
             ├ Wins: {wins_today}\n\
             └ Win rate: {win_rate:.1}%\n\n\
             ⏱️ Uptime: {uptime_hours:.1} h\n\n\
             <i>🐕 Guarding your stack again tomorrow!</i>",
            now.format("%Y-%m-%d"),
        );
        self.deliver(text).await
    }
}

/// Lossy f64 -> Decimal for display math inside notification text only.
fn dec2(v: f64) -> Decimal {
    use rust_decimal::prelude::FromPrimitive;
    Decimal::from_f64(v).unwrap_or(Decimal::ZERO).round_dp(2)
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("enabled", &self.enabled)
            .field("messages_sent", &self.messages_sent.load(Ordering::Relaxed))
            .field(
                "delivery_errors",
                &self.delivery_errors.load(Ordering::Relaxed),
            )
            .finish()
    }
}
