// =============================================================================
// Execution routes — the seam between the controller and order placement
// =============================================================================
//
// The live and shadow controllers share one loop; only this seam differs.
// The live route forwards to the venue. The shadow route books simulated
// fills at the bar close and never places an order. Klines always come from
// the venue directly and are not part of this trait.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::binance::{BrokerError, FuturesClient};
use crate::types::{Balance, MarginMode, OrderResult, OrderSide, Position};

#[async_trait]
pub trait ExecutionRoute: Send + Sync {
    /// Route label for logs and the startup notification.
    fn label(&self) -> &'static str;

    /// One-time per-symbol setup at controller start (leverage, margin mode).
    async fn prepare_symbol(
        &self,
        symbol: &str,
        leverage: u32,
        margin_mode: MarginMode,
    ) -> Result<(), BrokerError>;

    /// Equity snapshot backing sizing and reports. For the live route this is
    /// always a fresh venue read — never cached across ticks.
    async fn balance(&self) -> Result<Balance, BrokerError>;

    /// Current position for `symbol`, `None` when flat.
    async fn position(&self, symbol: &str) -> Result<Option<Position>, BrokerError>;

    /// Market order for an entry or scale-in. `bar_close` is the assumed fill
    /// price for simulated routes; the live route ignores it.
    async fn market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        bar_close: f64,
    ) -> Result<OrderResult, BrokerError>;

    /// Close the entire position on `symbol`. `None` when already flat.
    async fn close_position(
        &self,
        symbol: &str,
        bar_close: f64,
    ) -> Result<Option<OrderResult>, BrokerError>;

    /// Mark-to-market hook, invoked once per newly completed bar. The live
    /// route does nothing; the shadow route re-values its book.
    fn mark_bar(&self, symbol: &str, close: f64);
}

// ---------------------------------------------------------------------------
// Live route
// ---------------------------------------------------------------------------

/// Direct pass-through to the venue gateway.
pub struct LiveRoute {
    client: Arc<FuturesClient>,
}

impl LiveRoute {
    pub fn new(client: Arc<FuturesClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ExecutionRoute for LiveRoute {
    fn label(&self) -> &'static str {
        "live"
    }

    async fn prepare_symbol(
        &self,
        symbol: &str,
        leverage: u32,
        margin_mode: MarginMode,
    ) -> Result<(), BrokerError> {
        self.client.set_leverage(symbol, leverage).await?;
        self.client.set_margin_mode(symbol, margin_mode).await?;
        Ok(())
    }

    async fn balance(&self) -> Result<Balance, BrokerError> {
        self.client.get_balance().await
    }

    async fn position(&self, symbol: &str) -> Result<Option<Position>, BrokerError> {
        self.client.get_position(symbol).await
    }

    async fn market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        _bar_close: f64,
    ) -> Result<OrderResult, BrokerError> {
        self.client.market_order(symbol, side, qty).await
    }

    async fn close_position(
        &self,
        symbol: &str,
        _bar_close: f64,
    ) -> Result<Option<OrderResult>, BrokerError> {
        self.client.close_position(symbol).await
    }

    fn mark_bar(&self, _symbol: &str, _close: f64) {}
}
