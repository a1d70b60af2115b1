//! Core domain types shared by the watcher, worker, executor and stores.

use serde::{Deserialize, Serialize};

/// Trade direction as observed on the source wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    pub fn parse(raw: &str) -> Option<Side> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "buy" => Some(Side::Buy),
            "sell" => Some(Side::Sell),
            _ => None,
        }
    }
}

/// Mirror order lifecycle. Terminal states: filled, failed, canceled, blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Queued,
    Sent,
    Filled,
    Failed,
    Canceled,
    Blocked,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Queued => "queued",
            OrderStatus::Sent => "sent",
            OrderStatus::Filled => "filled",
            OrderStatus::Failed => "failed",
            OrderStatus::Canceled => "canceled",
            OrderStatus::Blocked => "blocked",
        }
    }

    pub fn parse(raw: &str) -> Option<OrderStatus> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "queued" => Some(OrderStatus::Queued),
            "sent" => Some(OrderStatus::Sent),
            "filled" => Some(OrderStatus::Filled),
            "failed" => Some(OrderStatus::Failed),
            "canceled" => Some(OrderStatus::Canceled),
            "blocked" => Some(OrderStatus::Blocked),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Failed | OrderStatus::Canceled | OrderStatus::Blocked
        )
    }
}

/// A normalized source-wallet trade leg ready for insertion.
#[derive(Debug, Clone)]
pub struct NewChainSignal {
    pub source_address: String,
    pub chain_id: i64,
    pub tx_hash: String,
    pub log_index: i64,
    pub block_number: Option<i64>,
    pub side: Side,
    pub token_id: Option<String>,
    pub outcome: Option<String>,
    pub market_slug: Option<String>,
    pub source_notional_usdc: f64,
    pub source_price: Option<f64>,
}

/// Signal row as read back for display/status.
#[derive(Debug, Clone, Serialize)]
pub struct TradeSignalRow {
    pub id: i64,
    pub source_address: String,
    pub side: String,
    pub source_notional_usdc: f64,
    pub source_price: Option<f64>,
    pub market_slug: Option<String>,
    pub created_at: i64,
}

/// One unmirrored (pair, signal) candidate produced by the pairing join.
#[derive(Debug, Clone)]
pub struct MirrorCandidate {
    pub trade_signal_id: i64,
    pub pair_id: i64,
    pub pair_mode: String,
    pub side: Side,
    pub token_id: Option<String>,
    pub market_slug: Option<String>,
    pub source_notional_usdc: f64,
    pub source_price: Option<f64>,
    pub source_portfolio_usdc: Option<f64>,
    pub min_order_usdc: f64,
    pub max_order_usdc: Option<f64>,
    pub budget_usdc: f64,
}

/// Queued mirror order joined with everything the executor needs.
#[derive(Debug, Clone)]
pub struct QueuedOrder {
    pub id: i64,
    pub pair_id: i64,
    pub trade_signal_id: i64,
    pub adjusted_notional_usdc: f64,
    pub blocked_reason: Option<String>,
    pub source_tx_hash: Option<String>,
    pub side: Side,
    pub outcome: Option<String>,
    pub market_slug: Option<String>,
    pub token_id: Option<String>,
    pub source_price: Option<f64>,
    pub follower_wallet_id: i64,
    pub max_slippage_bps: i64,
    pub source_address: String,
    pub follower_address: String,
    pub key_ref: String,
    pub budget_usdc: f64,
}

impl QueuedOrder {
    /// A one-shot timeout retry is flagged by the reconciler via blocked_reason.
    pub fn is_reprice_retry(&self) -> bool {
        self.blocked_reason
            .as_deref()
            .map(|r| r.contains("reprice_after_timeout"))
            .unwrap_or(false)
    }
}

/// Stale `sent` order as seen by the reconciler.
#[derive(Debug, Clone)]
pub struct StaleSentOrder {
    pub id: i64,
    pub pair_id: i64,
    pub trade_signal_id: i64,
    pub blocked_reason: Option<String>,
    pub executor_ref: Option<String>,
    pub side: Side,
    pub outcome: Option<String>,
    pub follower_wallet_id: i64,
    pub follower_address: String,
    pub key_ref: String,
    pub updated_at: i64,
}

impl StaleSentOrder {
    pub fn already_repriced(&self) -> bool {
        self.blocked_reason
            .as_deref()
            .map(|r| r.contains("reprice_after_timeout"))
            .unwrap_or(false)
    }
}

/// Mirror order row for status listings.
#[derive(Debug, Clone, Serialize)]
pub struct MirrorOrderRow {
    pub id: i64,
    pub pair_id: i64,
    pub trade_signal_id: i64,
    pub requested_notional_usdc: f64,
    pub adjusted_notional_usdc: f64,
    pub status: String,
    pub blocked_reason: Option<String>,
    pub created_at: i64,
}

/// Fill/failure record attached to a mirror order.
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub mirror_order_id: i64,
    pub pair_id: i64,
    pub follower_wallet_id: i64,
    pub chain_tx_hash: Option<String>,
    pub executed_side: Side,
    pub executed_outcome: Option<String>,
    pub executed_price: Option<f64>,
    pub executed_notional_usdc: Option<f64>,
    pub status: &'static str,
    pub fail_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRow {
    pub id: i64,
    pub mirror_order_id: i64,
    pub pair_id: i64,
    pub follower_wallet_id: i64,
    pub chain_tx_hash: Option<String>,
    pub executed_side: String,
    pub executed_outcome: Option<String>,
    pub executed_price: Option<f64>,
    pub executed_notional_usdc: Option<f64>,
    pub status: String,
    pub fail_reason: Option<String>,
    pub executed_at: i64,
}

/// Pair summary for the operator CLI.
#[derive(Debug, Clone, Serialize)]
pub struct PairSummary {
    pub id: i64,
    pub mode: String,
    pub active: bool,
    pub sizing_policy: String,
    pub min_order_usdc: f64,
    pub max_order_usdc: Option<f64>,
    pub max_slippage_bps: i64,
    pub source_address: String,
    pub source_alias: Option<String>,
    pub follower_address: String,
    pub follower_label: Option<String>,
    pub budget_usdc: f64,
    pub cumulative_source_volume_usdc: f64,
}

/// Follower funding metadata for the gas/balance monitor.
#[derive(Debug, Clone)]
pub struct FollowerFunding {
    pub follower_wallet_id: i64,
    pub address: String,
    pub min_matic_alert: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_round_trips_through_text() {
        assert_eq!(Side::parse("buy"), Some(Side::Buy));
        assert_eq!(Side::parse("SELL"), Some(Side::Sell));
        assert_eq!(Side::parse(" Buy "), Some(Side::Buy));
        assert_eq!(Side::parse("hold"), None);
        assert_eq!(Side::Buy.as_str(), "buy");
    }

    #[test]
    fn terminal_statuses() {
        assert!(!OrderStatus::Queued.is_terminal());
        assert!(!OrderStatus::Sent.is_terminal());
        assert!(OrderStatus::Blocked.is_terminal());
        assert!(OrderStatus::Canceled.is_terminal());
        assert_eq!(OrderStatus::parse("FILLED"), Some(OrderStatus::Filled));
    }

    #[test]
    fn reprice_marker_detection() {
        let mut order = QueuedOrder {
            id: 1,
            pair_id: 1,
            trade_signal_id: 1,
            adjusted_notional_usdc: 10.0,
            blocked_reason: None,
            source_tx_hash: None,
            side: Side::Buy,
            outcome: None,
            market_slug: None,
            token_id: None,
            source_price: None,
            follower_wallet_id: 1,
            max_slippage_bps: 300,
            source_address: "0xaaa".into(),
            follower_address: "0xbbb".into(),
            key_ref: "vault://test".into(),
            budget_usdc: 100.0,
        };
        assert!(!order.is_reprice_retry());
        order.blocked_reason = Some("reprice_after_timeout".into());
        assert!(order.is_reprice_retry());
    }
}
