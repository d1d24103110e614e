// =============================================================================
// Shadow route — simulated fills, virtual book, signal & equity journals
// =============================================================================
//
// Mirrors live decisions without submitting a single order. Fills are assumed
// at the close of the decision bar. The book tracks a simulated USDT balance
// and per-symbol virtual positions; every simulated action appends to the
// signals journal, and every action or bar close that moves mark-to-market
// value appends an equity snapshot. Both journals are rewritten atomically
// (tmp + rename) so a crash never leaves a torn file.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::binance::BrokerError;
use crate::engine::route::ExecutionRoute;
use crate::types::{
    Balance, ExecPrice, MarginMode, OrderResult, OrderSide, Position, PositionSide,
};

const SIGNALS_FILE: &str = "shadow_signals.json";
const EQUITY_FILE: &str = "shadow_equity.json";

// ---------------------------------------------------------------------------
// Journal records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Open,
    Add,
    Exit,
}

/// One simulated order event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub side: OrderSide,
    pub kind: SignalKind,
    pub qty: Decimal,
    /// Assumed fill price — the close of the decision bar.
    pub price_assumed: f64,
}

/// One point of the simulated equity curve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquitySnapshot {
    pub timestamp: DateTime<Utc>,
    pub equity: Decimal,
    pub cash: Decimal,
    pub unrealized_pnl: Decimal,
}

// ---------------------------------------------------------------------------
// Virtual book
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct VirtualPosition {
    side: PositionSide,
    qty: Decimal,
    entry_price: f64,
    last_price: f64,
}

#[derive(Debug)]
struct SimBook {
    cash: Decimal,
    positions: HashMap<String, VirtualPosition>,
    signals: Vec<SignalRecord>,
    equity_curve: Vec<EquitySnapshot>,
}

impl SimBook {
    fn direction_sign(side: PositionSide) -> Decimal {
        match side {
            PositionSide::Long => Decimal::ONE,
            PositionSide::Short => Decimal::NEGATIVE_ONE,
        }
    }

    fn unrealized_pnl(&self) -> Decimal {
        self.positions
            .values()
            .map(|p| {
                let last = Decimal::from_f64(p.last_price).unwrap_or(Decimal::ZERO);
                let entry = Decimal::from_f64(p.entry_price).unwrap_or(Decimal::ZERO);
                Self::direction_sign(p.side) * (last - entry) * p.qty
            })
            .sum()
    }

    fn margin_used(&self, leverage: u32) -> Decimal {
        let lev = Decimal::from(leverage.max(1));
        self.positions
            .values()
            .map(|p| {
                let entry = Decimal::from_f64(p.entry_price).unwrap_or(Decimal::ZERO);
                p.qty * entry / lev
            })
            .sum()
    }

    fn snapshot(&mut self, now: DateTime<Utc>) {
        let unrealized = self.unrealized_pnl();
        self.equity_curve.push(EquitySnapshot {
            timestamp: now,
            equity: self.cash + unrealized,
            cash: self.cash,
            unrealized_pnl: unrealized,
        });
    }
}

// ---------------------------------------------------------------------------
// Shadow route
// ---------------------------------------------------------------------------

/// Execution route that books fills against the virtual book.
pub struct ShadowRoute {
    book: Mutex<SimBook>,
    leverage: u32,
    data_dir: PathBuf,
    next_order_id: AtomicI64,
}

impl ShadowRoute {
    pub fn new(start_cash: Decimal, leverage: u32, data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        info!(%start_cash, leverage, dir = %data_dir.display(), "shadow book initialised");
        Self {
            book: Mutex::new(SimBook {
                cash: start_cash,
                positions: HashMap::new(),
                signals: Vec::new(),
                equity_curve: Vec::new(),
            }),
            leverage,
            data_dir,
            next_order_id: AtomicI64::new(1),
        }
    }

    fn record_signal(
        &self,
        book: &mut SimBook,
        symbol: &str,
        side: OrderSide,
        kind: SignalKind,
        qty: Decimal,
        price: f64,
        now: DateTime<Utc>,
    ) {
        book.signals.push(SignalRecord {
            id: Uuid::new_v4().to_string(),
            timestamp: now,
            symbol: symbol.to_string(),
            side,
            kind,
            qty,
            price_assumed: price,
        });
        book.snapshot(now);
        self.persist(book);
    }

    /// Rewrite both journals atomically. Journal trouble is logged, never
    /// propagated — the shadow run keeps going on its in-memory book.
    fn persist(&self, book: &SimBook) {
        if let Err(e) = write_json_atomic(&self.data_dir.join(SIGNALS_FILE), &book.signals) {
            warn!(error = %e, "failed to persist shadow signals journal");
        }
        if let Err(e) = write_json_atomic(&self.data_dir.join(EQUITY_FILE), &book.equity_curve) {
            warn!(error = %e, "failed to persist shadow equity journal");
        }
    }

    fn sim_order(&self, symbol: &str, side: OrderSide, qty: Decimal, price: f64) -> OrderResult {
        OrderResult {
            order_id: self.next_order_id.fetch_add(1, Ordering::Relaxed),
            symbol: symbol.to_string(),
            side,
            executed_qty: qty,
            avg_price: ExecPrice::Reported(price),
            status: "FILLED".to_string(),
        }
    }
}

#[async_trait]
impl ExecutionRoute for ShadowRoute {
    fn label(&self) -> &'static str {
        "shadow"
    }

    async fn prepare_symbol(
        &self,
        _symbol: &str,
        _leverage: u32,
        _margin_mode: MarginMode,
    ) -> Result<(), BrokerError> {
        // The venue is never configured from shadow mode.
        Ok(())
    }

    async fn balance(&self) -> Result<Balance, BrokerError> {
        let book = self.book.lock();
        let unrealized = book.unrealized_pnl();
        Ok(Balance {
            total: book.cash + unrealized,
            available: book.cash - book.margin_used(self.leverage),
            unrealized_pnl: unrealized,
        })
    }

    async fn position(&self, symbol: &str) -> Result<Option<Position>, BrokerError> {
        let book = self.book.lock();
        Ok(book.positions.get(symbol).map(|p| {
            let last = Decimal::from_f64(p.last_price).unwrap_or(Decimal::ZERO);
            let entry = Decimal::from_f64(p.entry_price).unwrap_or(Decimal::ZERO);
            Position {
                symbol: symbol.to_string(),
                side: p.side,
                qty: p.qty,
                entry_price: p.entry_price,
                unrealized_pnl: SimBook::direction_sign(p.side) * (last - entry) * p.qty,
                leverage: self.leverage,
                margin_mode: MarginMode::Isolated,
            }
        }))
    }

    async fn market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        bar_close: f64,
    ) -> Result<OrderResult, BrokerError> {
        use std::collections::hash_map::Entry;

        let now = Utc::now();
        let mut book = self.book.lock();

        let kind = match book.positions.entry(symbol.to_string()) {
            Entry::Vacant(slot) => {
                let position_side = match side {
                    OrderSide::Buy => PositionSide::Long,
                    OrderSide::Sell => PositionSide::Short,
                };
                slot.insert(VirtualPosition {
                    side: position_side,
                    qty,
                    entry_price: bar_close,
                    last_price: bar_close,
                });
                SignalKind::Open
            }
            Entry::Occupied(mut slot) => {
                let pos = slot.get_mut();
                if pos.side.entry_order_side() != side {
                    return Err(BrokerError::Rejected(
                        "shadow route only scales in the position direction".to_string(),
                    ));
                }
                // Weighted-average the entry across the old size and the add.
                let old_qty = pos.qty.to_f64().unwrap_or(0.0);
                let add_qty = qty.to_f64().unwrap_or(0.0);
                let total = old_qty + add_qty;
                if total > 0.0 {
                    pos.entry_price =
                        (old_qty * pos.entry_price + add_qty * bar_close) / total;
                }
                pos.qty += qty;
                pos.last_price = bar_close;
                SignalKind::Add
            }
        };

        self.record_signal(&mut book, symbol, side, kind, qty, bar_close, now);
        info!(symbol, side = %side, %qty, price = bar_close, ?kind, "shadow fill booked");
        Ok(self.sim_order(symbol, side, qty, bar_close))
    }

    async fn close_position(
        &self,
        symbol: &str,
        bar_close: f64,
    ) -> Result<Option<OrderResult>, BrokerError> {
        let now = Utc::now();
        let mut book = self.book.lock();

        let pos = match book.positions.remove(symbol) {
            Some(p) => p,
            None => return Ok(None),
        };

        let close = Decimal::from_f64(bar_close).unwrap_or(Decimal::ZERO);
        let entry = Decimal::from_f64(pos.entry_price).unwrap_or(Decimal::ZERO);
        let realized = SimBook::direction_sign(pos.side) * (close - entry) * pos.qty;
        book.cash += realized;

        let exit_side = pos.side.exit_order_side();
        self.record_signal(
            &mut book,
            symbol,
            exit_side,
            SignalKind::Exit,
            pos.qty,
            bar_close,
            now,
        );
        info!(symbol, %realized, price = bar_close, "shadow position closed");
        Ok(Some(self.sim_order(symbol, exit_side, pos.qty, bar_close)))
    }

    fn mark_bar(&self, symbol: &str, close: f64) {
        let mut book = self.book.lock();
        if let Some(pos) = book.positions.get_mut(symbol) {
            pos.last_price = close;
            book.snapshot(Utc::now());
            self.persist(&book);
        }
    }
}

/// Serialize `value` to `path` via a tmp sibling and rename.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let content = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn route(dir: &Path) -> ShadowRoute {
        ShadowRoute::new(dec!(10000), 10, dir)
    }

    #[tokio::test]
    async fn open_reserves_margin_and_books_signal() {
        let dir = tempfile::tempdir().unwrap();
        let route = route(dir.path());

        route
            .market_order("BTCUSDT", OrderSide::Buy, dec!(1), 30_000.0)
            .await
            .unwrap();

        let balance = route.balance().await.unwrap();
        // 1 BTC at 30_000 with 10x leverage reserves 3_000 margin.
        assert_eq!(balance.available, dec!(7000));
        assert_eq!(balance.total, dec!(10000));

        let pos = route.position("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(pos.side, PositionSide::Long);
        assert_eq!(pos.qty, dec!(1));
        assert_eq!(pos.entry_price, 30_000.0);

        // Journals exist on disk after the first action.
        assert!(dir.path().join(SIGNALS_FILE).exists());
        assert!(dir.path().join(EQUITY_FILE).exists());
    }

    #[tokio::test]
    async fn add_merges_with_weighted_entry() {
        let dir = tempfile::tempdir().unwrap();
        let route = route(dir.path());

        route
            .market_order("BTCUSDT", OrderSide::Buy, dec!(1), 30_000.0)
            .await
            .unwrap();
        route
            .market_order("BTCUSDT", OrderSide::Buy, dec!(1), 32_000.0)
            .await
            .unwrap();

        let pos = route.position("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(pos.qty, dec!(2));
        assert!((pos.entry_price - 31_000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn opposite_side_order_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let route = route(dir.path());

        route
            .market_order("BTCUSDT", OrderSide::Buy, dec!(1), 30_000.0)
            .await
            .unwrap();
        let err = route
            .market_order("BTCUSDT", OrderSide::Sell, dec!(1), 30_000.0)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Rejected(_)));
    }

    #[tokio::test]
    async fn close_realises_pnl_into_cash() {
        let dir = tempfile::tempdir().unwrap();
        let route = route(dir.path());

        route
            .market_order("BTCUSDT", OrderSide::Buy, dec!(1), 30_000.0)
            .await
            .unwrap();
        let result = route
            .close_position("BTCUSDT", 31_000.0)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.side, OrderSide::Sell);

        let balance = route.balance().await.unwrap();
        assert_eq!(balance.total, dec!(11000));
        assert_eq!(balance.available, dec!(11000));
        assert!(route.position("BTCUSDT").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn close_when_flat_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let route = route(dir.path());
        assert!(route.close_position("BTCUSDT", 30_000.0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn short_pnl_sign_is_inverted() {
        let dir = tempfile::tempdir().unwrap();
        let route = route(dir.path());

        route
            .market_order("ETHUSDT", OrderSide::Sell, dec!(10), 2_000.0)
            .await
            .unwrap();
        route.close_position("ETHUSDT", 1_900.0).await.unwrap();

        let balance = route.balance().await.unwrap();
        // Short 10 ETH from 2_000 to 1_900: +1_000.
        assert_eq!(balance.total, dec!(11000));
    }

    #[tokio::test]
    async fn mark_bar_appends_equity_point_only_with_position() {
        let dir = tempfile::tempdir().unwrap();
        let route = route(dir.path());

        // No position: no snapshot, no files.
        route.mark_bar("BTCUSDT", 30_000.0);
        assert!(!dir.path().join(EQUITY_FILE).exists());

        route
            .market_order("BTCUSDT", OrderSide::Buy, dec!(1), 30_000.0)
            .await
            .unwrap();
        route.mark_bar("BTCUSDT", 30_500.0);

        let balance = route.balance().await.unwrap();
        assert_eq!(balance.unrealized_pnl, dec!(500));
        assert_eq!(balance.total, dec!(10500));

        let content = std::fs::read_to_string(dir.path().join(EQUITY_FILE)).unwrap();
        let curve: Vec<EquitySnapshot> = serde_json::from_str(&content).unwrap();
        // One snapshot from the open, one from the bar close.
        assert_eq!(curve.len(), 2);
        assert_eq!(curve.last().unwrap().equity, dec!(10500));
    }

    #[tokio::test]
    async fn signals_journal_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let route = route(dir.path());

        route
            .market_order("BTCUSDT", OrderSide::Buy, dec!(1), 30_000.0)
            .await
            .unwrap();
        route
            .market_order("BTCUSDT", OrderSide::Buy, dec!(0.5), 30_200.0)
            .await
            .unwrap();
        route.close_position("BTCUSDT", 30_400.0).await.unwrap();

        let content = std::fs::read_to_string(dir.path().join(SIGNALS_FILE)).unwrap();
        let signals: Vec<SignalRecord> = serde_json::from_str(&content).unwrap();
        assert_eq!(signals.len(), 3);
        assert_eq!(signals[0].kind, SignalKind::Open);
        assert_eq!(signals[1].kind, SignalKind::Add);
        assert_eq!(signals[2].kind, SignalKind::Exit);
        assert_eq!(signals[2].side, OrderSide::Sell);
        assert_eq!(signals[2].qty, dec!(1.5));
    }
}
