//! Wallet and pair store.
//!
//! A pair binds one watched source wallet to one funded follower wallet plus
//! its policy knobs. Deleting a pair cascades to nothing historical: signals
//! and orders stay.

use anyhow::{bail, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::db::Db;
use crate::models::{FollowerFunding, PairSummary};

/// All inputs needed to register (or refresh) a pair.
#[derive(Debug, Clone)]
pub struct NewPair {
    pub source_address: String,
    pub follower_address: String,
    pub source_alias: Option<String>,
    pub follower_label: Option<String>,
    pub budget_usdc: f64,
    pub key_ref: String,
    pub mode: String,
    pub active: bool,
    pub sizing_policy: String,
    pub min_order_usdc: f64,
    pub max_order_usdc: Option<f64>,
    pub max_slippage_bps: i64,
    pub max_consecutive_failures: i64,
    pub initial_matic: f64,
    pub min_matic_alert: f64,
    pub source_portfolio_usdc: Option<f64>,
    /// Tests seed pairs without a vault; production always checks.
    pub skip_key_ref_check: bool,
}

#[derive(Clone)]
pub struct PairStore {
    db: Db,
}

impl PairStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    fn ensure_source_wallet(
        conn: &Connection,
        address: &str,
        alias: Option<&str>,
        portfolio_usdc: Option<f64>,
    ) -> Result<i64> {
        let now = Utc::now().timestamp();
        let address = address.to_lowercase();
        let existing = conn
            .query_row(
                "SELECT id FROM source_wallets WHERE address = ?1",
                [&address],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        if let Some(id) = existing {
            conn.execute(
                "UPDATE source_wallets
                 SET alias = COALESCE(?1, alias),
                     source_portfolio_usdc = COALESCE(?2, source_portfolio_usdc),
                     updated_at = ?3
                 WHERE id = ?4",
                params![alias, portfolio_usdc, now, id],
            )?;
            return Ok(id);
        }
        conn.execute(
            "INSERT INTO source_wallets(address, alias, status, source_portfolio_usdc, created_at, updated_at)
             VALUES (?1, ?2, 'active', ?3, ?4, ?5)",
            params![address, alias, portfolio_usdc, now, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn ensure_follower_wallet(conn: &Connection, pair: &NewPair) -> Result<i64> {
        let now = Utc::now().timestamp();
        let address = pair.follower_address.to_lowercase();
        let existing = conn
            .query_row(
                "SELECT id FROM follower_wallets WHERE address = ?1",
                [&address],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        if let Some(id) = existing {
            conn.execute(
                "UPDATE follower_wallets
                 SET label = ?1, budget_usdc = ?2, initial_matic = ?3,
                     min_matic_alert = ?4, key_ref = ?5, updated_at = ?6
                 WHERE id = ?7",
                params![
                    pair.follower_label.as_deref(),
                    pair.budget_usdc,
                    pair.initial_matic,
                    pair.min_matic_alert,
                    pair.key_ref,
                    now,
                    id
                ],
            )?;
            return Ok(id);
        }
        conn.execute(
            "INSERT INTO follower_wallets(
                address, label, budget_usdc, initial_matic, min_matic_alert,
                key_ref, status, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'active', ?7, ?8)",
            params![
                address,
                pair.follower_label.as_deref(),
                pair.budget_usdc,
                pair.initial_matic,
                pair.min_matic_alert,
                pair.key_ref,
                now,
                now
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn create_pair(&self, pair: &NewPair) -> Result<i64> {
        let now = Utc::now().timestamp();
        let conn = self.db.conn().await;

        if !pair.skip_key_ref_check {
            let exists = conn
                .query_row(
                    "SELECT 1 FROM vault_keys WHERE key_ref = ?1 AND status = 'active'",
                    [&pair.key_ref],
                    |_| Ok(()),
                )
                .optional()?;
            if exists.is_none() {
                bail!("key_ref not found in vault: {}", pair.key_ref);
            }
        }

        let source_id = Self::ensure_source_wallet(
            &conn,
            &pair.source_address,
            pair.source_alias.as_deref(),
            pair.source_portfolio_usdc,
        )?;
        let follower_id = Self::ensure_follower_wallet(&conn, pair)?;

        let changed = conn.execute(
            "INSERT OR IGNORE INTO wallet_pairs(
                source_wallet_id, follower_wallet_id, mode, active, sizing_policy,
                min_order_usdc, max_order_usdc, max_slippage_bps,
                max_consecutive_failures, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                source_id,
                follower_id,
                pair.mode,
                pair.active as i64,
                pair.sizing_policy,
                pair.min_order_usdc,
                pair.max_order_usdc,
                pair.max_slippage_bps,
                pair.max_consecutive_failures,
                now,
                now
            ],
        )?;
        if changed == 0 {
            bail!(
                "pair already exists for source {} / follower {}",
                pair.source_address,
                pair.follower_address
            );
        }
        Ok(conn.last_insert_rowid())
    }

    pub async fn list_pairs(&self) -> Result<Vec<PairSummary>> {
        let conn = self.db.conn().await;
        let mut stmt = conn.prepare_cached(
            "SELECT
                p.id, p.mode, p.active, p.sizing_policy, p.min_order_usdc,
                p.max_order_usdc, p.max_slippage_bps,
                s.address, s.alias, f.address, f.label, f.budget_usdc,
                COALESCE((
                    SELECT SUM(t.source_notional_usdc)
                    FROM trade_signals t
                    WHERE t.source_wallet_id = p.source_wallet_id
                ), 0)
             FROM wallet_pairs p
             JOIN source_wallets s ON s.id = p.source_wallet_id
             JOIN follower_wallets f ON f.id = p.follower_wallet_id
             ORDER BY p.id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(PairSummary {
                id: row.get(0)?,
                mode: row.get(1)?,
                active: row.get::<_, i64>(2)? != 0,
                sizing_policy: row.get(3)?,
                min_order_usdc: row.get(4)?,
                max_order_usdc: row.get(5)?,
                max_slippage_bps: row.get(6)?,
                source_address: row.get(7)?,
                source_alias: row.get(8)?,
                follower_address: row.get(9)?,
                follower_label: row.get(10)?,
                budget_usdc: row.get(11)?,
                cumulative_source_volume_usdc: row.get(12)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub async fn delete_pair(&self, pair_id: i64) -> Result<bool> {
        let conn = self.db.conn().await;
        let changed = conn.execute("DELETE FROM wallet_pairs WHERE id = ?1", [pair_id])?;
        Ok(changed > 0)
    }

    pub async fn active_pair_count(&self) -> Result<i64> {
        let conn = self.db.conn().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM wallet_pairs WHERE active = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Follower wallets of active pairs, for the gas/balance monitor.
    pub async fn list_follower_funding(&self) -> Result<Vec<FollowerFunding>> {
        let conn = self.db.conn().await;
        let mut stmt = conn.prepare_cached(
            "SELECT DISTINCT f.id, f.address, f.min_matic_alert
             FROM follower_wallets f
             JOIN wallet_pairs p ON p.follower_wallet_id = f.id
             WHERE p.active = 1 AND f.min_matic_alert > 0",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(FollowerFunding {
                follower_wallet_id: row.get(0)?,
                address: row.get(1)?,
                min_matic_alert: row.get(2)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Aggregate follower budgets of active pairs: the daily-start equity
    /// baseline the risk guard hydrates from.
    pub async fn sum_active_follower_budgets(&self) -> Result<f64> {
        let conn = self.db.conn().await;
        let total: f64 = conn.query_row(
            "SELECT COALESCE(SUM(budget_usdc), 0) FROM follower_wallets f
             WHERE EXISTS (
                SELECT 1 FROM wallet_pairs p
                WHERE p.follower_wallet_id = f.id AND p.active = 1
             )",
            [],
            |row| row.get(0),
        )?;
        Ok(total)
    }
}
