//! Order sizing.
//!
//! Turns a source fill plus pair policy and follower budget into the
//! notional the follower should spend. Proportional sizing activates only
//! when the source portfolio baseline is known; otherwise the source
//! notional is copied absolutely, subject to the floors and cap.

#[derive(Debug, Clone)]
pub struct SizerInput {
    pub source_notional_usdc: f64,
    pub source_portfolio_usdc: Option<f64>,
    pub min_order_usdc: f64,
    pub max_order_usdc: Option<f64>,
    pub follower_budget_usdc: f64,
    pub source_price: Option<f64>,
    pub market_min_order_usdc: f64,
}

/// Compute the adjusted notional. Never negative; a value below
/// `max(min_order, market_min)` signals the caller to block, zero means not
/// even one share is affordable.
pub fn adjusted_notional(input: &SizerInput) -> f64 {
    let mut requested = input.source_notional_usdc;
    if let Some(portfolio) = input.source_portfolio_usdc {
        if portfolio > 0.0 {
            // Source bet ratio applied to the follower budget proxy.
            requested = input.follower_budget_usdc * (input.source_notional_usdc / portfolio);
        }
    }

    // The venue minimum binds even when the pair floor is configured lower.
    let floor = input.min_order_usdc.max(input.market_min_order_usdc);
    let mut adjusted = requested.max(floor);
    if let Some(max_order) = input.max_order_usdc {
        adjusted = adjusted.min(max_order);
    }
    if input.follower_budget_usdc >= adjusted {
        return adjusted;
    }

    // Budget is short: fall back to a single share at the source price.
    if let Some(price) = input.source_price {
        if price > 0.0 && input.follower_budget_usdc >= price {
            return price;
        }
    }

    adjusted.min(input.follower_budget_usdc).max(0.0)
}
