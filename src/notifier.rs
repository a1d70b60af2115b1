//! Outbound alerting.
//!
//! A bounded queue feeds one consumer task that posts to Telegram, at most
//! one request in flight. Every alert lands in the `alerts` ledger as sent,
//! skipped or failed; a full queue or missing credentials never block the
//! pipeline.

use anyhow::Result;
use chrono::Utc;
use reqwest::Client;
use rusqlite::params;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::TelegramConfig;
use crate::db::Db;

const QUEUE_CAPACITY: usize = 256;
const SEND_TIMEOUT_SECS: u64 = 10;
const RETRY_DELAY_SECS: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    Filled,
    Sent,
    Failed,
    Blocked,
    Canceled,
    KillSwitch,
    RiskAlert,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Filled => "filled",
            AlertKind::Sent => "sent",
            AlertKind::Failed => "failed",
            AlertKind::Blocked => "blocked",
            AlertKind::Canceled => "canceled",
            AlertKind::KillSwitch => "kill_switch",
            AlertKind::RiskAlert => "risk_alert",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Alert {
    pub kind: AlertKind,
    pub text: String,
}

#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::Sender<Alert>,
    db: Db,
}

impl Notifier {
    /// Enqueue an alert. Queue pressure degrades to a ledger `skipped` row.
    pub async fn send(&self, kind: AlertKind, text: impl Into<String>) {
        let alert = Alert {
            kind,
            text: text.into(),
        };
        if let Err(e) = self.tx.try_send(alert) {
            let alert = match e {
                mpsc::error::TrySendError::Full(alert)
                | mpsc::error::TrySendError::Closed(alert) => alert,
            };
            warn!(kind = alert.kind.as_str(), "alert queue unavailable, skipping");
            record_alert(&self.db, &alert, "skipped").await.ok();
        }
    }
}

async fn record_alert(db: &Db, alert: &Alert, status: &str) -> Result<()> {
    let conn = db.conn().await;
    conn.execute(
        "INSERT INTO alerts(event_type, payload, status, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![alert.kind.as_str(), alert.text, status, Utc::now().timestamp()],
    )?;
    Ok(())
}

async fn send_telegram(client: &Client, cfg: &TelegramConfig, text: &str) -> bool {
    let (Some(token), Some(chat_id)) = (cfg.bot_token.as_deref(), cfg.chat_id.as_deref()) else {
        return false;
    };
    let url = format!("https://api.telegram.org/bot{token}/sendMessage");
    for _ in 0..cfg.max_retries {
        let attempt = client
            .post(&url)
            .json(&serde_json::json!({ "chat_id": chat_id, "text": text }))
            .send()
            .await;
        match attempt {
            Ok(resp) if resp.status().is_success() => return true,
            Ok(resp) => {
                warn!(status = %resp.status(), "telegram send rejected");
            }
            Err(e) => {
                warn!(error = %e, "telegram send error");
            }
        }
        tokio::time::sleep(Duration::from_secs(RETRY_DELAY_SECS)).await;
    }
    false
}

async fn consume(mut rx: mpsc::Receiver<Alert>, db: Db, cfg: TelegramConfig) {
    let client = Client::builder()
        .timeout(Duration::from_secs(SEND_TIMEOUT_SECS))
        .build()
        .expect("build telegram http client");

    while let Some(alert) = rx.recv().await {
        let status = if !cfg.is_configured() {
            "skipped"
        } else if send_telegram(&client, &cfg, &alert.text).await {
            "sent"
        } else {
            "failed"
        };
        if status != "sent" {
            warn!(kind = alert.kind.as_str(), status, "alert not delivered");
        }
        record_alert(&db, &alert, status).await.ok();
    }
}

/// Start the consumer task and hand back the cloneable producer handle.
pub fn spawn_notifier(db: Db, cfg: TelegramConfig) -> Notifier {
    let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
    if !cfg.is_configured() {
        info!("telegram not configured, alerts will be ledgered as skipped");
    }
    tokio::spawn(consume(rx, db.clone(), cfg));
    Notifier { tx, db }
}

// ---- message composition ---------------------------------------------------

pub fn source_tx_link(tx_hash: Option<&str>) -> Option<String> {
    let raw = tx_hash?.trim();
    if raw.is_empty() || raw.starts_with("mock-") {
        return None;
    }
    Some(format!("https://polygonscan.com/tx/{raw}"))
}

fn encode_slug(slug: &str) -> String {
    let mut out = String::with_capacity(slug.len());
    for b in slug.bytes() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' => out.push(b as char),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

pub fn market_link(market_slug: Option<&str>) -> Option<String> {
    let slug = market_slug?.trim();
    if slug.is_empty() {
        return None;
    }
    Some(format!("https://polymarket.com/event/{}", encode_slug(slug)))
}

fn append_links(message: &mut String, source_tx_hash: Option<&str>, market_slug: Option<&str>) {
    if let Some(link) = source_tx_link(source_tx_hash) {
        message.push_str(&format!("\nsource tx: {link}"));
    }
    if let Some(link) = market_link(market_slug) {
        message.push_str(&format!("\nmarket: {link}"));
    }
}

#[allow(clippy::too_many_arguments)]
pub fn filled_message(
    order_id: i64,
    pair_id: i64,
    follower_wallet_id: i64,
    side: &str,
    outcome: Option<&str>,
    notional: f64,
    chain_tx_hash: Option<&str>,
    source_tx_hash: Option<&str>,
    market_slug: Option<&str>,
) -> String {
    let mut message = format!(
        "copybot mirror filled\npair: {pair_id}\norder: {order_id}\nfollower wallet: {follower_wallet_id}\nside: {side}\noutcome: {}\nfilled (USDC): {notional:.4}\nfollower tx: {}",
        outcome.unwrap_or("-"),
        chain_tx_hash.unwrap_or("-"),
    );
    append_links(&mut message, source_tx_hash, market_slug);
    message
}

#[allow(clippy::too_many_arguments)]
pub fn sent_message(
    order_id: i64,
    pair_id: i64,
    follower_wallet_id: i64,
    side: &str,
    outcome: Option<&str>,
    notional: f64,
    source_tx_hash: Option<&str>,
    market_slug: Option<&str>,
) -> String {
    let mut message = format!(
        "copybot order resting (awaiting fill)\npair: {pair_id}\norder: {order_id}\nfollower wallet: {follower_wallet_id}\nside: {side}\noutcome: {}\nnotional (USDC): {notional:.4}",
        outcome.unwrap_or("-"),
    );
    append_links(&mut message, source_tx_hash, market_slug);
    message
}

#[allow(clippy::too_many_arguments)]
pub fn failed_message(
    order_id: i64,
    pair_id: i64,
    follower_wallet_id: i64,
    side: &str,
    outcome: Option<&str>,
    notional: f64,
    fail_reason: &str,
    source_tx_hash: Option<&str>,
    market_slug: Option<&str>,
) -> String {
    let mut message = format!(
        "copybot mirror failed\npair: {pair_id}\norder: {order_id}\nfollower wallet: {follower_wallet_id}\nside: {side}\noutcome: {}\nnotional (USDC): {notional:.4}\nreason: {fail_reason}",
        outcome.unwrap_or("-"),
    );
    append_links(&mut message, source_tx_hash, market_slug);
    message
}

pub fn blocked_message(
    pair_id: i64,
    trade_signal_id: i64,
    requested_notional: f64,
    blocked_reason: &str,
    suppressed_since_last: i64,
) -> String {
    let mut message = format!(
        "copybot order blocked\npair: {pair_id}\nsignal: {trade_signal_id}\nrequested (USDC): {requested_notional:.4}\nreason: {blocked_reason}"
    );
    if suppressed_since_last > 0 {
        message.push_str(&format!("\nsuppressed_since_last: {suppressed_since_last}"));
    }
    message
}

pub fn canceled_message(
    order_id: i64,
    pair_id: i64,
    follower_wallet_id: i64,
    side: &str,
    reason: &str,
) -> String {
    format!(
        "copybot order canceled\npair: {pair_id}\norder: {order_id}\nfollower wallet: {follower_wallet_id}\nside: {side}\nreason: {reason}"
    )
}

pub fn kill_switch_message(consecutive_exec_failures: u32) -> String {
    format!(
        "copybot kill switch ON\nconsecutive executor failures: {consecutive_exec_failures}\ntrading halted until operator resume"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_link_skips_mock_hashes() {
        assert_eq!(source_tx_link(None), None);
        assert_eq!(source_tx_link(Some("")), None);
        assert_eq!(source_tx_link(Some("mock-abc123")), None);
        assert_eq!(
            source_tx_link(Some("0xfeed")).as_deref(),
            Some("https://polygonscan.com/tx/0xfeed")
        );
    }

    #[test]
    fn market_link_encodes_slug() {
        assert_eq!(market_link(None), None);
        assert_eq!(market_link(Some("  ")), None);
        assert_eq!(
            market_link(Some("will-btc-close-above")).as_deref(),
            Some("https://polymarket.com/event/will-btc-close-above")
        );
        assert_eq!(
            market_link(Some("a b/c")).as_deref(),
            Some("https://polymarket.com/event/a%20b%2Fc")
        );
    }

    #[test]
    fn blocked_message_mentions_suppressions() {
        let quiet = blocked_message(1, 2, 25.0, "insufficient_budget_for_one_share", 0);
        assert!(!quiet.contains("suppressed_since_last"));
        let noisy = blocked_message(1, 2, 25.0, "insufficient_budget_for_one_share", 4);
        assert!(noisy.contains("suppressed_since_last: 4"));
    }

    #[tokio::test]
    async fn unconfigured_notifier_ledgers_skipped() {
        let db = Db::open_in_memory().unwrap();
        let notifier = spawn_notifier(
            db.clone(),
            TelegramConfig {
                bot_token: None,
                chat_id: None,
                max_retries: 1,
            },
        );
        notifier.send(AlertKind::Blocked, "test alert").await;
        // Give the consumer a beat to drain.
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let conn = db.conn().await;
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM alerts WHERE status='skipped'", [], |r| {
                    r.get(0)
                })
                .unwrap();
            if count == 1 {
                return;
            }
        }
        panic!("alert was not ledgered");
    }
}
