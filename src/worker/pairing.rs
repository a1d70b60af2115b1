//! Pairing policy: which unmirrored signals become queued orders and which
//! are blocked before sizing.
//!
//! Filters run in order, first match wins. Policy and noise blocks are
//! silent; only budget verdicts from the sizer alert the operator.

use anyhow::Result;
use chrono::Utc;
use tracing::debug;

use crate::gamma::MarketMeta;
use crate::models::{OrderStatus, Side};
use crate::notifier::{blocked_message, AlertKind};
use crate::risk::BlockAlertVerdict;
use crate::worker::sizer::{adjusted_notional, SizerInput};
use crate::worker::Worker;

const CRYPTO_TOKENS: &[&str] = &[
    "bitcoin", "btc", "ethereum", "eth", "solana", "sol", "xrp", "doge", "bnb", "ada", "stx",
];
const PRICE_WORDS: &[&str] = &[
    "price", "priced", "trading", "above", "below", "over", "under", "reach", "hit", "close at",
    "$", "usd", "가격", "달러",
];
const TIME_WORDS: &[&str] = &[
    "today", "tomorrow", "tonight", "this week", "next week", "by ", "before ", "in the next",
    "5m", "15m", "1h", "24h", "오늘", "내일", "이번 주", "몇시", "시간 내",
];

/// Market categories the operator refuses to mirror. Kept as one pure
/// function so the keyword coverage can be revised in isolation.
pub fn market_policy_block_reason(
    meta: Option<&MarketMeta>,
    fallback_slug: Option<&str>,
) -> Option<String> {
    let meta = meta?;
    let category = meta.category.as_deref().unwrap_or("").to_lowercase();
    let question = meta.question.as_deref().unwrap_or("");
    let slug = meta
        .slug
        .as_deref()
        .or(fallback_slug)
        .unwrap_or("");
    let text = format!("{question} {slug}").to_lowercase();

    if category.contains("sport") {
        return Some("market_policy_filtered:sports_event".to_string());
    }

    let has_crypto =
        category.contains("crypto") || CRYPTO_TOKENS.iter().any(|k| text.contains(k));
    let has_price = PRICE_WORDS.iter().any(|k| text.contains(k));
    let has_time = TIME_WORDS.iter().any(|k| text.contains(k));
    if has_crypto && has_price && has_time {
        return Some("market_policy_filtered:crypto_short_term_price".to_string());
    }

    None
}

pub fn is_balance_or_allowance_failure(fail_reason: Option<&str>) -> bool {
    let Some(reason) = fail_reason else {
        return false;
    };
    let normalized = reason.to_lowercase();
    normalized.contains("not enough balance / allowance")
        || normalized.contains("insufficient_balance")
}

pub fn is_market_min_size_failure(fail_reason: Option<&str>) -> bool {
    let Some(reason) = fail_reason else {
        return false;
    };
    let normalized = reason.to_lowercase();
    normalized.contains("min size: $1")
        && normalized.contains("invalid amount for a marketable buy order")
}

impl Worker {
    /// Join unmirrored signals to active pairs and decide queued vs blocked.
    /// Returns the number of orders queued this pass.
    pub(crate) async fn hydrate_orders(&mut self) -> Result<u32> {
        let candidates = self.signals.list_unmirrored(self.cfg.batch_limit).await?;
        let mut created = 0u32;

        for candidate in candidates {
            let requested = candidate.source_notional_usdc;

            if candidate.pair_mode == "observe" {
                // Observe pairs record what they would have mirrored.
                self.orders
                    .create_mirror_order(
                        candidate.pair_id,
                        candidate.trade_signal_id,
                        requested,
                        0.0,
                        OrderStatus::Blocked,
                        Some("pair_observe_mode"),
                    )
                    .await?;
                continue;
            }

            let meta = match candidate.token_id.as_deref() {
                Some(token_id) => self.meta.market_meta(token_id).await,
                None => None,
            };
            if let Some(reason) =
                market_policy_block_reason(meta.as_ref(), candidate.market_slug.as_deref())
            {
                // Policy-filtered markets are intentionally silent.
                self.orders
                    .create_mirror_order(
                        candidate.pair_id,
                        candidate.trade_signal_id,
                        requested,
                        0.0,
                        OrderStatus::Blocked,
                        Some(&reason),
                    )
                    .await?;
                debug!(pair = candidate.pair_id, reason = %reason, "signal blocked by policy");
                continue;
            }

            if requested < self.cfg.min_source_notional_usdc {
                // Dust trades are noise; block without alerting.
                let reason = format!(
                    "source_notional_below_threshold:{:.2}",
                    self.cfg.min_source_notional_usdc
                );
                self.orders
                    .create_mirror_order(
                        candidate.pair_id,
                        candidate.trade_signal_id,
                        requested,
                        0.0,
                        OrderStatus::Blocked,
                        Some(&reason),
                    )
                    .await?;
                continue;
            }

            if self
                .orders
                .has_recent_balance_or_allowance_failure(
                    candidate.pair_id,
                    self.cfg.balance_fail_cooldown_seconds,
                )
                .await?
            {
                self.orders
                    .create_mirror_order(
                        candidate.pair_id,
                        candidate.trade_signal_id,
                        requested,
                        0.0,
                        OrderStatus::Blocked,
                        Some("recent_balance_or_allowance_failure_cooldown"),
                    )
                    .await?;
                continue;
            }

            if candidate.side == Side::Sell
                && !self
                    .orders
                    .has_filled_buy_for_pair_token(
                        candidate.pair_id,
                        candidate.token_id.as_deref(),
                    )
                    .await?
            {
                self.orders
                    .create_mirror_order(
                        candidate.pair_id,
                        candidate.trade_signal_id,
                        requested,
                        0.0,
                        OrderStatus::Blocked,
                        Some("no_prior_buy_inventory_for_sell"),
                    )
                    .await?;
                continue;
            }

            let adjusted = adjusted_notional(&SizerInput {
                source_notional_usdc: requested,
                source_portfolio_usdc: candidate.source_portfolio_usdc,
                min_order_usdc: candidate.min_order_usdc,
                max_order_usdc: candidate.max_order_usdc,
                follower_budget_usdc: candidate.budget_usdc,
                source_price: candidate.source_price,
                market_min_order_usdc: self.cfg.market_min_buy_usdc,
            });
            let floor = candidate.min_order_usdc.max(self.cfg.market_min_buy_usdc);

            if adjusted <= 0.0 || adjusted < floor {
                let reason = if adjusted <= 0.0 {
                    "insufficient_budget_for_one_share"
                } else {
                    "insufficient_budget_for_market_min_order"
                };
                self.orders
                    .create_mirror_order(
                        candidate.pair_id,
                        candidate.trade_signal_id,
                        requested,
                        0.0,
                        OrderStatus::Blocked,
                        Some(reason),
                    )
                    .await?;
                self.alert_blocked(candidate.pair_id, candidate.trade_signal_id, requested, reason)
                    .await;
                continue;
            }

            let inserted = self
                .orders
                .create_mirror_order(
                    candidate.pair_id,
                    candidate.trade_signal_id,
                    requested,
                    adjusted,
                    OrderStatus::Queued,
                    None,
                )
                .await?;
            if inserted.is_some() {
                created += 1;
            }
        }

        Ok(created)
    }

    pub(crate) async fn alert_blocked(
        &mut self,
        pair_id: i64,
        trade_signal_id: i64,
        requested_notional: f64,
        reason: &str,
    ) {
        let now = Utc::now().timestamp();
        match self.block_alerts.check(
            pair_id,
            reason,
            now,
            self.cfg.block_alert_cooldown_seconds,
        ) {
            BlockAlertVerdict::Deliver {
                suppressed_since_last,
            } => {
                self.notifier
                    .send(
                        AlertKind::Blocked,
                        blocked_message(
                            pair_id,
                            trade_signal_id,
                            requested_notional,
                            reason,
                            suppressed_since_last,
                        ),
                    )
                    .await;
            }
            BlockAlertVerdict::Suppress => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(category: &str, question: &str, slug: &str) -> MarketMeta {
        MarketMeta {
            category: Some(category.to_string()),
            question: Some(question.to_string()),
            slug: Some(slug.to_string()),
        }
    }

    #[test]
    fn no_metadata_means_no_policy_block() {
        assert_eq!(market_policy_block_reason(None, Some("some-market")), None);
    }

    #[test]
    fn sports_category_is_blocked() {
        let m = meta("Sports", "Will the Lakers win?", "lakers-win");
        assert_eq!(
            market_policy_block_reason(Some(&m), None).as_deref(),
            Some("market_policy_filtered:sports_event")
        );
    }

    #[test]
    fn short_term_crypto_price_is_blocked() {
        let m = meta(
            "Crypto",
            "Will Bitcoin close above $100k today?",
            "btc-above-100k",
        );
        assert_eq!(
            market_policy_block_reason(Some(&m), None).as_deref(),
            Some("market_policy_filtered:crypto_short_term_price")
        );
    }

    #[test]
    fn korean_keywords_count() {
        let m = meta("", "비트코인 가격이 오늘 오를까요? btc", "btc-kr");
        assert_eq!(
            market_policy_block_reason(Some(&m), None).as_deref(),
            Some("market_policy_filtered:crypto_short_term_price")
        );
    }

    #[test]
    fn long_horizon_crypto_passes() {
        // Crypto + price words but no short-term time anchor.
        let m = meta("Crypto", "Will Ethereum flip Bitcoin in market cap?", "eth-flip");
        assert_eq!(market_policy_block_reason(Some(&m), None), None);
    }

    #[test]
    fn politics_passes() {
        let m = meta("Politics", "Will the incumbent win the election?", "election");
        assert_eq!(market_policy_block_reason(Some(&m), None), None);
    }

    #[test]
    fn failure_classifiers() {
        assert!(is_balance_or_allowance_failure(Some(
            "exchange_rejected:not enough balance / allowance"
        )));
        assert!(is_balance_or_allowance_failure(Some("insufficient_balance")));
        assert!(!is_balance_or_allowance_failure(Some("rpc_error")));
        assert!(!is_balance_or_allowance_failure(None));

        assert!(is_market_min_size_failure(Some(
            "exchange_rejected:invalid amount for a marketable buy order. min size: $1"
        )));
        assert!(!is_market_min_size_failure(Some("invalid amounts")));
        assert!(!is_market_min_size_failure(None));
    }
}
