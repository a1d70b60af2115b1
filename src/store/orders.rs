//! Mirror order and execution store.
//!
//! Order rows are owned here; the executor only borrows a joined snapshot
//! and hands a status back. `(pair_id, trade_signal_id)` is unique, so
//! re-running the pairing step can never double-create an order.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use crate::db::Db;
use crate::models::{
    ExecutionRow, MirrorOrderRow, NewExecution, OrderStatus, QueuedOrder, Side, StaleSentOrder,
};

#[derive(Clone)]
pub struct OrderStore {
    db: Db,
}

impl OrderStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Create a mirror order (queued or blocked). Returns `None` when the
    /// (pair, signal) combination already has an order.
    pub async fn create_mirror_order(
        &self,
        pair_id: i64,
        trade_signal_id: i64,
        requested_notional_usdc: f64,
        adjusted_notional_usdc: f64,
        status: OrderStatus,
        blocked_reason: Option<&str>,
    ) -> Result<Option<i64>> {
        let now = Utc::now().timestamp();
        let conn = self.db.conn().await;
        let changed = conn
            .execute(
                "INSERT OR IGNORE INTO mirror_orders(
                    pair_id, trade_signal_id, requested_notional_usdc,
                    adjusted_notional_usdc, status, blocked_reason, executor_ref,
                    created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7, ?8)",
                params![
                    pair_id,
                    trade_signal_id,
                    requested_notional_usdc,
                    adjusted_notional_usdc,
                    status.as_str(),
                    blocked_reason,
                    now,
                    now,
                ],
            )
            .context("insert mirror order")?;
        if changed == 0 {
            return Ok(None);
        }
        Ok(Some(conn.last_insert_rowid()))
    }

    pub async fn mark_status(
        &self,
        order_id: i64,
        status: OrderStatus,
        blocked_reason: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().timestamp();
        let conn = self.db.conn().await;
        conn.execute(
            "UPDATE mirror_orders SET status = ?1, blocked_reason = ?2, updated_at = ?3
             WHERE id = ?4",
            params![status.as_str(), blocked_reason, now, order_id],
        )?;
        Ok(())
    }

    pub async fn set_executor_ref(&self, order_id: i64, executor_ref: &str) -> Result<()> {
        let now = Utc::now().timestamp();
        let conn = self.db.conn().await;
        conn.execute(
            "UPDATE mirror_orders SET executor_ref = ?1, updated_at = ?2 WHERE id = ?3",
            params![executor_ref, now, order_id],
        )?;
        Ok(())
    }

    pub async fn get_status(&self, order_id: i64) -> Result<Option<(OrderStatus, Option<String>)>> {
        let conn = self.db.conn().await;
        let row = conn
            .query_row(
                "SELECT status, blocked_reason FROM mirror_orders WHERE id = ?1",
                [order_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?)),
            )
            .optional()?;
        Ok(row.and_then(|(status, reason)| OrderStatus::parse(&status).map(|s| (s, reason))))
    }

    /// Queued orders joined with the signal, pair and follower context the
    /// executor needs, oldest first.
    pub async fn list_queued(&self, limit: usize) -> Result<Vec<QueuedOrder>> {
        let conn = self.db.conn().await;
        let mut stmt = conn.prepare_cached(
            "SELECT
                m.id, m.pair_id, m.trade_signal_id, m.adjusted_notional_usdc,
                m.blocked_reason, t.tx_hash, t.side, t.outcome, t.market_slug,
                t.token_id, t.source_price, p.follower_wallet_id, p.max_slippage_bps,
                s.address, f.address, f.key_ref, f.budget_usdc
             FROM mirror_orders m
             JOIN trade_signals t ON t.id = m.trade_signal_id
             JOIN wallet_pairs p ON p.id = m.pair_id
             JOIN source_wallets s ON s.id = t.source_wallet_id
             JOIN follower_wallets f ON f.id = p.follower_wallet_id
             WHERE m.status = 'queued'
             ORDER BY m.id ASC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            let side_raw: String = row.get(6)?;
            Ok(QueuedOrder {
                id: row.get(0)?,
                pair_id: row.get(1)?,
                trade_signal_id: row.get(2)?,
                adjusted_notional_usdc: row.get(3)?,
                blocked_reason: row.get(4)?,
                source_tx_hash: row.get(5)?,
                side: Side::parse(&side_raw).unwrap_or(Side::Buy),
                outcome: row.get(7)?,
                market_slug: row.get(8)?,
                token_id: row.get(9)?,
                source_price: row.get(10)?,
                follower_wallet_id: row.get(11)?,
                max_slippage_bps: row.get(12)?,
                source_address: row.get(13)?,
                follower_address: row.get(14)?,
                key_ref: row.get(15)?,
                budget_usdc: row.get(16)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// `sent` orders that have not moved for `max_age_seconds`. Orders with
    /// an empty executor ref (submit timeout) are included; the cancel path
    /// treats them as nothing-to-cancel.
    pub async fn list_stale_sent(
        &self,
        max_age_seconds: i64,
        limit: usize,
    ) -> Result<Vec<StaleSentOrder>> {
        let cutoff = Utc::now().timestamp() - max_age_seconds.max(0);
        let conn = self.db.conn().await;
        let mut stmt = conn.prepare_cached(
            "SELECT
                m.id, m.pair_id, m.trade_signal_id, m.blocked_reason, m.executor_ref,
                t.side, t.outcome, p.follower_wallet_id, f.address, f.key_ref, m.updated_at
             FROM mirror_orders m
             JOIN trade_signals t ON t.id = m.trade_signal_id
             JOIN wallet_pairs p ON p.id = m.pair_id
             JOIN follower_wallets f ON f.id = p.follower_wallet_id
             WHERE m.status = 'sent'
               AND m.updated_at <= ?1
             ORDER BY m.id ASC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![cutoff, limit as i64], |row| {
            let side_raw: String = row.get(5)?;
            Ok(StaleSentOrder {
                id: row.get(0)?,
                pair_id: row.get(1)?,
                trade_signal_id: row.get(2)?,
                blocked_reason: row.get(3)?,
                executor_ref: row.get(4)?,
                side: Side::parse(&side_raw).unwrap_or(Side::Buy),
                outcome: row.get(6)?,
                follower_wallet_id: row.get(7)?,
                follower_address: row.get(8)?,
                key_ref: row.get(9)?,
                updated_at: row.get(10)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub async fn create_execution(&self, rec: &NewExecution) -> Result<i64> {
        let now = Utc::now().timestamp();
        let conn = self.db.conn().await;
        conn.execute(
            "INSERT INTO executions(
                mirror_order_id, pair_id, follower_wallet_id, chain_tx_hash,
                executed_side, executed_outcome, executed_price, executed_notional_usdc,
                fee_usdc, pnl_realized_usdc, status, fail_reason, executed_at, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, NULL, ?9, ?10, ?11, ?12)",
            params![
                rec.mirror_order_id,
                rec.pair_id,
                rec.follower_wallet_id,
                rec.chain_tx_hash.as_deref(),
                rec.executed_side.as_str(),
                rec.executed_outcome.as_deref(),
                rec.executed_price,
                rec.executed_notional_usdc,
                rec.status,
                rec.fail_reason.as_deref(),
                now,
                now,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Budget decreases by the executed notional, clamped at zero.
    pub async fn consume_follower_budget(
        &self,
        follower_wallet_id: i64,
        amount_usdc: f64,
    ) -> Result<()> {
        let now = Utc::now().timestamp();
        let conn = self.db.conn().await;
        conn.execute(
            "UPDATE follower_wallets
             SET budget_usdc = CASE
                 WHEN budget_usdc - ?1 < 0 THEN 0
                 ELSE budget_usdc - ?1
             END,
             updated_at = ?2
             WHERE id = ?3",
            params![amount_usdc, now, follower_wallet_id],
        )?;
        Ok(())
    }

    /// Inventory rule probe: has this pair ever filled a BUY of the token?
    pub async fn has_filled_buy_for_pair_token(
        &self,
        pair_id: i64,
        token_id: Option<&str>,
    ) -> Result<bool> {
        let Some(token_id) = token_id else {
            return Ok(false);
        };
        let conn = self.db.conn().await;
        let row = conn
            .query_row(
                "SELECT 1
                 FROM executions e
                 JOIN mirror_orders m ON m.id = e.mirror_order_id
                 JOIN trade_signals t ON t.id = m.trade_signal_id
                 WHERE e.pair_id = ?1
                   AND e.status = 'filled'
                   AND lower(COALESCE(e.executed_side, '')) = 'buy'
                   AND t.token_id = ?2
                 LIMIT 1",
                params![pair_id, token_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(row.is_some())
    }

    /// Balance/allowance cooldown probe over recent failed executions.
    pub async fn has_recent_balance_or_allowance_failure(
        &self,
        pair_id: i64,
        within_seconds: i64,
    ) -> Result<bool> {
        let cutoff = Utc::now().timestamp() - within_seconds.max(0);
        let conn = self.db.conn().await;
        let row = conn
            .query_row(
                "SELECT 1
                 FROM executions
                 WHERE pair_id = ?1
                   AND status = 'failed'
                   AND COALESCE(executed_at, created_at) >= ?2
                   AND (
                       lower(COALESCE(fail_reason, '')) LIKE '%not enough balance / allowance%'
                    OR lower(COALESCE(fail_reason, '')) LIKE '%insufficient_balance%'
                   )
                 LIMIT 1",
                params![pair_id, cutoff],
                |_| Ok(()),
            )
            .optional()?;
        Ok(row.is_some())
    }

    /// Realized pnl accumulated since `since` epoch, for risk hydration.
    pub async fn sum_realized_pnl_since(&self, since: i64) -> Result<f64> {
        let conn = self.db.conn().await;
        let total: f64 = conn.query_row(
            "SELECT COALESCE(SUM(pnl_realized_usdc), 0)
             FROM executions
             WHERE status = 'filled' AND executed_at >= ?1",
            [since],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    pub async fn list_recent_orders(&self, limit: usize) -> Result<Vec<MirrorOrderRow>> {
        let conn = self.db.conn().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, pair_id, trade_signal_id, requested_notional_usdc,
                    adjusted_notional_usdc, status, blocked_reason, created_at
             FROM mirror_orders
             ORDER BY id DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            Ok(MirrorOrderRow {
                id: row.get(0)?,
                pair_id: row.get(1)?,
                trade_signal_id: row.get(2)?,
                requested_notional_usdc: row.get(3)?,
                adjusted_notional_usdc: row.get(4)?,
                status: row.get(5)?,
                blocked_reason: row.get(6)?,
                created_at: row.get(7)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub async fn list_recent_executions(&self, limit: usize) -> Result<Vec<ExecutionRow>> {
        let conn = self.db.conn().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, mirror_order_id, pair_id, follower_wallet_id, chain_tx_hash,
                    executed_side, executed_outcome, executed_price, executed_notional_usdc,
                    status, fail_reason, executed_at
             FROM executions
             ORDER BY id DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            Ok(ExecutionRow {
                id: row.get(0)?,
                mirror_order_id: row.get(1)?,
                pair_id: row.get(2)?,
                follower_wallet_id: row.get(3)?,
                chain_tx_hash: row.get(4)?,
                executed_side: row.get(5)?,
                executed_outcome: row.get(6)?,
                executed_price: row.get(7)?,
                executed_notional_usdc: row.get(8)?,
                status: row.get(9)?,
                fail_reason: row.get(10)?,
                executed_at: row.get(11)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub async fn follower_budget(&self, follower_wallet_id: i64) -> Result<f64> {
        let conn = self.db.conn().await;
        let budget: f64 = conn.query_row(
            "SELECT budget_usdc FROM follower_wallets WHERE id = ?1",
            [follower_wallet_id],
            |row| row.get(0),
        )?;
        Ok(budget)
    }
}
