// =============================================================================
// Shared types used across the Trendhound trading engine
// =============================================================================

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

/// A single OHLCV candle from the Binance futures kline endpoint.
///
/// `open_time` / `close_time` are venue timestamps in milliseconds. The last
/// candle of a kline response may still be forming; consumers that require a
/// completed bar must select the second-to-last element.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: i64,
}

/// Milliseconds per timeframe label, e.g. "4h" -> 14_400_000.
///
/// Returns `None` for labels the engine does not recognise.
pub fn interval_ms(timeframe: &str) -> Option<i64> {
    let ms = match timeframe {
        "1m" => 60_000,
        "3m" => 180_000,
        "5m" => 300_000,
        "15m" => 900_000,
        "30m" => 1_800_000,
        "1h" => 3_600_000,
        "2h" => 7_200_000,
        "4h" => 14_400_000,
        "6h" => 21_600_000,
        "8h" => 28_800_000,
        "12h" => 43_200_000,
        "1d" => 86_400_000,
        _ => return None,
    };
    Some(ms)
}

// ---------------------------------------------------------------------------
// Order / position primitives
// ---------------------------------------------------------------------------

/// Order side as submitted to the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// The string the venue expects in the `side` parameter.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of an open position. "No position" is `Option::None` at the call
/// sites — a position value always has a side and a non-zero quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Order side that opens or scales into this position.
    pub fn entry_order_side(&self) -> OrderSide {
        match self {
            Self::Long => OrderSide::Buy,
            Self::Short => OrderSide::Sell,
        }
    }

    /// Order side that closes this position.
    pub fn exit_order_side(&self) -> OrderSide {
        match self {
            Self::Long => OrderSide::Sell,
            Self::Short => OrderSide::Buy,
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// Margin mode for a futures symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarginMode {
    Isolated,
    Crossed,
}

impl MarginMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Isolated => "ISOLATED",
            Self::Crossed => "CROSSED",
        }
    }
}

impl std::fmt::Display for MarginMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Account snapshots
// ---------------------------------------------------------------------------

/// USDT balance snapshot from the futures account.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub total: Decimal,
    pub available: Decimal,
    pub unrealized_pnl: Decimal,
}

/// An open position reported by the venue. Entries with `positionAmt == 0`
/// are never materialised into this type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    pub qty: Decimal,
    pub entry_price: f64,
    pub unrealized_pnl: Decimal,
    pub leverage: u32,
    pub margin_mode: MarginMode,
}

/// Price and quantity precision for a symbol, plus the minimum notional the
/// venue will accept for an order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SymbolPrecision {
    pub price_digits: u32,
    pub qty_digits: u32,
    pub min_notional: Decimal,
}

// ---------------------------------------------------------------------------
// Order results
// ---------------------------------------------------------------------------

/// Where the average fill price of an executed order came from.
///
/// The venue usually reports `avgPrice` directly; on some order responses the
/// field is zero and the price must be derived as the fill-weighted mean.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ExecPrice {
    /// Taken from the venue's `avgPrice` field.
    Reported(f64),
    /// Derived from the `fills` array as sum(qty * price) / sum(qty).
    FillWeighted(f64),
}

impl ExecPrice {
    pub fn value(&self) -> f64 {
        match self {
            Self::Reported(p) | Self::FillWeighted(p) => *p,
        }
    }
}

/// Result of a market order accepted by the venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: i64,
    pub symbol: String,
    pub side: OrderSide,
    pub executed_qty: Decimal,
    pub avg_price: ExecPrice,
    pub status: String,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_sides_for_long() {
        assert_eq!(PositionSide::Long.entry_order_side(), OrderSide::Buy);
        assert_eq!(PositionSide::Long.exit_order_side(), OrderSide::Sell);
    }

    #[test]
    fn order_sides_for_short() {
        assert_eq!(PositionSide::Short.entry_order_side(), OrderSide::Sell);
        assert_eq!(PositionSide::Short.exit_order_side(), OrderSide::Buy);
    }

    #[test]
    fn interval_ms_known_timeframes() {
        assert_eq!(interval_ms("1m"), Some(60_000));
        assert_eq!(interval_ms("1h"), Some(3_600_000));
        assert_eq!(interval_ms("4h"), Some(14_400_000));
        assert_eq!(interval_ms("1d"), Some(86_400_000));
    }

    #[test]
    fn interval_ms_unknown_timeframe() {
        assert_eq!(interval_ms("7h"), None);
        assert_eq!(interval_ms(""), None);
    }

    #[test]
    fn exec_price_value_ignores_source() {
        assert_eq!(ExecPrice::Reported(30_000.0).value(), 30_000.0);
        assert_eq!(ExecPrice::FillWeighted(30_000.0).value(), 30_000.0);
    }
}
