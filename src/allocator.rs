// =============================================================================
// Capital allocator — equal equity slots across the configured symbol set
// =============================================================================
//
// Sizing runs in fixed-scale decimals, never binary floats: the venue price
// enters as a decimal, quantities are truncated toward zero to the symbol's
// quantity digits (truncation guarantees affordability), and the result is
// checked against the minimum notional before any order leaves the engine.
//
// Available equity must be read fresh from the venue at entry time — the
// allocator deliberately takes it as an argument instead of caching it.
// A symbol with an open position still claims its slot; there is no
// cross-symbol reallocation.
// =============================================================================

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use thiserror::Error;

use crate::config::StrategyParams;
use crate::types::SymbolPrecision;

/// Fraction of the current position quantity used for each scale-in.
const ADD_FRACTION: Decimal = Decimal::from_parts(5, 0, 0, false, 1); // 0.5

#[derive(Debug, Error, PartialEq)]
pub enum SizingError {
    #[error("mark price {0} is not a positive finite number")]
    BadPrice(f64),

    #[error("no symbols configured — cannot split equity")]
    NoSymbols,

    #[error("quantity truncates to zero at {qty_digits} digits (notional {notional})")]
    ZeroQuantity { qty_digits: u32, notional: Decimal },

    #[error("notional {notional} below venue minimum {min_notional}")]
    BelowMinNotional {
        notional: Decimal,
        min_notional: Decimal,
    },
}

/// Size a new entry for one symbol.
///
/// `per_symbol_equity = available / symbol_count`, margin = slot × size pct,
/// notional = margin × leverage, qty = notional / mark price truncated to the
/// symbol's quantity digits.
pub fn entry_qty(
    available: Decimal,
    symbol_count: usize,
    params: &StrategyParams,
    mark_price: f64,
    precision: &SymbolPrecision,
) -> Result<Decimal, SizingError> {
    if symbol_count == 0 {
        return Err(SizingError::NoSymbols);
    }
    let mark = Decimal::from_f64(mark_price)
        .filter(|m| *m > Decimal::ZERO)
        .ok_or(SizingError::BadPrice(mark_price))?;

    let size_pct =
        Decimal::from_f64(params.position_size_pct).ok_or(SizingError::BadPrice(mark_price))?;

    let per_symbol_equity = available / Decimal::from(symbol_count as u64);
    let margin = per_symbol_equity * size_pct;
    let notional = margin * Decimal::from(params.leverage);

    let qty = (notional / mark)
        .round_dp_with_strategy(precision.qty_digits, RoundingStrategy::ToZero);

    if qty <= Decimal::ZERO {
        return Err(SizingError::ZeroQuantity {
            qty_digits: precision.qty_digits,
            notional,
        });
    }

    let order_notional = qty * mark;
    if order_notional < precision.min_notional {
        return Err(SizingError::BelowMinNotional {
            notional: order_notional,
            min_notional: precision.min_notional,
        });
    }

    Ok(qty)
}

/// Size a scale-in: half of the current position quantity, truncated to the
/// symbol's quantity digits. Returns `None` when the half rounds to zero.
pub fn add_qty(current_qty: Decimal, precision: &SymbolPrecision) -> Option<Decimal> {
    let half = (current_qty * ADD_FRACTION)
        .round_dp_with_strategy(precision.qty_digits, RoundingStrategy::ToZero);
    if half > Decimal::ZERO {
        Some(half)
    } else {
        None
    }
}
