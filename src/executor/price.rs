//! Venue price and size arithmetic.
//!
//! Everything here is `Decimal`: prices align to the book tick with half-up
//! rounding, sizes truncate toward zero. The CLOB rejects amounts that do
//! not quantize exactly, so float arithmetic is not an option on this path.

use rust_decimal::prelude::*;
use rust_decimal::{Decimal, RoundingStrategy};

pub const PRICE_MIN: Decimal = Decimal::from_parts(1, 0, 0, false, 2); // 0.01
pub const PRICE_MAX: Decimal = Decimal::from_parts(99, 0, 0, false, 2); // 0.99
pub const DEFAULT_TICK: Decimal = Decimal::from_parts(1, 0, 0, false, 3); // 0.001

/// Aggressive reprice increment after an open-order timeout.
pub const REPRICE_BUMP: Decimal = Decimal::from_parts(10, 0, 0, false, 2); // 0.10

/// Size precision ladder retried on `invalid amounts` rejects.
pub const SIZE_PRECISION_LADDER: [u32; 3] = [5, 4, 3];

/// Align to the tick grid (round half up), clamp into the venue band and
/// normalize to 4 decimals.
pub fn align_to_tick(price: Decimal, tick: Decimal) -> Decimal {
    let tick = if tick <= Decimal::ZERO { DEFAULT_TICK } else { tick };
    let ticks = (price / tick).round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    let aligned = ticks * tick;
    aligned.clamp(PRICE_MIN, PRICE_MAX).round_dp(4)
}

/// Reference price for a BUY: source price nudged up one tick (0.10 on a
/// timeout retry), falling back to best bid + nudge, then best ask.
pub fn buy_reference_price(
    source_price: Option<Decimal>,
    best_bid: Option<Decimal>,
    best_ask: Option<Decimal>,
    tick: Decimal,
    reprice_retry: bool,
) -> Decimal {
    let bump = if reprice_retry { REPRICE_BUMP } else { tick };
    let raw = source_price
        .map(|p| p + bump)
        .or_else(|| best_bid.map(|b| b + bump))
        .or(best_ask)
        .unwrap_or_else(|| Decimal::new(5, 1));
    align_to_tick(raw, tick)
}

/// Reference price for a SELL: source price minus a tick, then best ask
/// minus a tick, then best bid.
pub fn sell_reference_price(
    source_price: Option<Decimal>,
    best_bid: Option<Decimal>,
    best_ask: Option<Decimal>,
    tick: Decimal,
) -> Decimal {
    let raw = source_price
        .map(|p| p - tick)
        .or_else(|| best_ask.map(|a| a - tick))
        .or(best_bid)
        .unwrap_or_else(|| Decimal::new(5, 1));
    align_to_tick(raw, tick)
}

/// Truncate toward zero at `dp` decimals.
pub fn floor_to_dp(value: Decimal, dp: u32) -> Decimal {
    value.round_dp_with_strategy(dp, RoundingStrategy::ToZero)
}

/// Quantized amounts for a BUY: the quote (USDC spent) floors to cents,
/// the share size floors to the precision step.
pub fn quantize_buy(notional: Decimal, price: Decimal, size_dp: u32) -> (Decimal, Decimal) {
    let quote = floor_to_dp(notional, 2);
    if price <= Decimal::ZERO {
        return (quote, Decimal::ZERO);
    }
    let size = floor_to_dp(quote / price, size_dp);
    (quote, size)
}

/// Quantized share size for a SELL from the notional being unwound.
pub fn quantize_sell(notional: Decimal, price: Decimal, size_dp: u32) -> Decimal {
    if price <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    floor_to_dp(notional / price, size_dp)
}

pub fn decimal_from_f64(value: f64) -> Option<Decimal> {
    Decimal::from_f64(value).map(|d| d.round_dp(8))
}
