//! Trade signal store.
//!
//! Signals are append-only: inserted once by the watcher (or the mock
//! injector), never mutated. At-most-once is enforced by the unique index on
//! (chain_id, source_wallet_id, tx_hash, log_index) plus `INSERT OR IGNORE`.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use crate::db::Db;
use crate::models::{MirrorCandidate, NewChainSignal, Side, TradeSignalRow};

#[derive(Clone)]
pub struct SignalStore {
    db: Db,
}

impl SignalStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    async fn source_wallet_id(&self, address: &str) -> Result<Option<i64>> {
        let conn = self.db.conn().await;
        let id = conn
            .query_row(
                "SELECT id FROM source_wallets WHERE address = ?1",
                [address.to_lowercase()],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(id)
    }

    /// Insert a watcher-observed signal. Returns the new row id, or `None`
    /// when the source wallet is unknown or the (chain, source, tx, log)
    /// key was already ingested.
    pub async fn create_chain_signal(&self, sig: &NewChainSignal) -> Result<Option<i64>> {
        let Some(source_wallet_id) = self.source_wallet_id(&sig.source_address).await? else {
            return Ok(None);
        };

        let now = Utc::now().timestamp();
        let conn = self.db.conn().await;
        let changed = conn
            .execute(
                "INSERT OR IGNORE INTO trade_signals(
                    source_wallet_id, chain_id, tx_hash, log_index, block_number,
                    market_slug, token_id, outcome, side,
                    source_notional_usdc, source_price, observed_at, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    source_wallet_id,
                    sig.chain_id,
                    sig.tx_hash,
                    sig.log_index,
                    sig.block_number,
                    sig.market_slug.as_deref(),
                    sig.token_id.as_deref(),
                    sig.outcome.as_deref(),
                    sig.side.as_str(),
                    sig.source_notional_usdc,
                    sig.source_price,
                    now,
                    now,
                ],
            )
            .context("insert trade signal")?;
        if changed == 0 {
            return Ok(None);
        }
        Ok(Some(conn.last_insert_rowid()))
    }

    /// Operator-injected test signal: `mock-<uuid>` tx hash, log index -1.
    pub async fn create_mock_signal(
        &self,
        source_address: &str,
        side: Side,
        source_notional_usdc: f64,
        source_price: Option<f64>,
        market_slug: Option<&str>,
        token_id: Option<&str>,
        outcome: Option<&str>,
    ) -> Result<i64> {
        let source_wallet_id = self
            .source_wallet_id(source_address)
            .await?
            .ok_or_else(|| anyhow::anyhow!("source wallet not found: {source_address}"))?;

        let now = Utc::now().timestamp();
        let tx_hash = format!("mock-{}", uuid::Uuid::new_v4().simple());
        let conn = self.db.conn().await;
        conn.execute(
            "INSERT INTO trade_signals(
                source_wallet_id, chain_id, tx_hash, log_index, block_number,
                market_slug, token_id, outcome, side,
                source_notional_usdc, source_price, observed_at, created_at
             ) VALUES (?1, 137, ?2, -1, NULL, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                source_wallet_id,
                tx_hash,
                market_slug,
                token_id,
                outcome,
                side.as_str(),
                source_notional_usdc,
                source_price,
                now,
                now,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Addresses the watcher should look for: sources of active pairs.
    pub async fn list_active_source_addresses(&self) -> Result<Vec<String>> {
        let conn = self.db.conn().await;
        let mut stmt = conn.prepare_cached(
            "SELECT DISTINCT s.address
             FROM source_wallets s
             JOIN wallet_pairs p ON p.source_wallet_id = s.id
             WHERE p.active = 1",
        )?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().map(|a| a.to_lowercase()).collect())
    }

    /// Unmirrored (active pair, signal) combinations, ascending signal id.
    /// Only signals observed at or after the pair's creation are eligible.
    pub async fn list_unmirrored(&self, limit: usize) -> Result<Vec<MirrorCandidate>> {
        let conn = self.db.conn().await;
        let mut stmt = conn.prepare_cached(
            "SELECT
                t.id, p.id, p.mode, t.side, t.token_id, t.market_slug,
                t.source_notional_usdc, t.source_price, s.source_portfolio_usdc,
                p.min_order_usdc, p.max_order_usdc, f.budget_usdc
             FROM trade_signals t
             JOIN source_wallets s ON s.id = t.source_wallet_id
             JOIN wallet_pairs p
               ON p.source_wallet_id = t.source_wallet_id AND p.active = 1
             JOIN follower_wallets f ON f.id = p.follower_wallet_id
             LEFT JOIN mirror_orders m
               ON m.trade_signal_id = t.id AND m.pair_id = p.id
             WHERE m.id IS NULL
               AND t.created_at >= p.created_at
             ORDER BY t.id ASC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            let side_raw: String = row.get(3)?;
            Ok(MirrorCandidate {
                trade_signal_id: row.get(0)?,
                pair_id: row.get(1)?,
                pair_mode: row.get(2)?,
                side: Side::parse(&side_raw).unwrap_or(Side::Buy),
                token_id: row.get(4)?,
                market_slug: row.get(5)?,
                source_notional_usdc: row.get(6)?,
                source_price: row.get(7)?,
                source_portfolio_usdc: row.get(8)?,
                min_order_usdc: row.get(9)?,
                max_order_usdc: row.get(10)?,
                budget_usdc: row.get(11)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub async fn list_recent(&self, limit: usize) -> Result<Vec<TradeSignalRow>> {
        let conn = self.db.conn().await;
        let mut stmt = conn.prepare_cached(
            "SELECT t.id, s.address, t.side, t.source_notional_usdc, t.source_price,
                    t.market_slug, t.created_at
             FROM trade_signals t
             JOIN source_wallets s ON s.id = t.source_wallet_id
             ORDER BY t.id DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            Ok(TradeSignalRow {
                id: row.get(0)?,
                source_address: row.get(1)?,
                side: row.get(2)?,
                source_notional_usdc: row.get(3)?,
                source_price: row.get(4)?,
                market_slug: row.get(5)?,
                created_at: row.get(6)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::pairs::{NewPair, PairStore};

    async fn seeded() -> (Db, SignalStore) {
        let db = Db::open_in_memory().unwrap();
        let pairs = PairStore::new(db.clone());
        pairs
            .create_pair(&NewPair {
                source_address: "0xAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA".into(),
                follower_address: "0xBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB".into(),
                source_alias: None,
                follower_label: None,
                budget_usdc: 200.0,
                key_ref: "vault://test".into(),
                mode: "paper".into(),
                active: true,
                sizing_policy: "absolute".into(),
                min_order_usdc: 1.0,
                max_order_usdc: None,
                max_slippage_bps: 300,
                max_consecutive_failures: 3,
                initial_matic: 3.0,
                min_matic_alert: 0.5,
                source_portfolio_usdc: None,
                skip_key_ref_check: true,
            })
            .await
            .unwrap();
        (db.clone(), SignalStore::new(db))
    }

    fn chain_signal(log_index: i64) -> NewChainSignal {
        NewChainSignal {
            source_address: "0xAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA".into(),
            chain_id: 137,
            tx_hash: "0xdead".into(),
            log_index,
            block_number: Some(100),
            side: Side::Buy,
            token_id: Some("123".into()),
            outcome: None,
            market_slug: None,
            source_notional_usdc: 25.0,
            source_price: Some(0.52),
        }
    }

    #[tokio::test]
    async fn reingesting_same_log_inserts_once() {
        let (_db, store) = seeded().await;
        let first = store.create_chain_signal(&chain_signal(7)).await.unwrap();
        assert!(first.is_some());
        for _ in 0..5 {
            let dup = store.create_chain_signal(&chain_signal(7)).await.unwrap();
            assert!(dup.is_none());
        }
        assert_eq!(store.list_recent(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_source_is_skipped() {
        let (_db, store) = seeded().await;
        let mut sig = chain_signal(1);
        sig.source_address = "0xCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCC".into();
        assert!(store.create_chain_signal(&sig).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unmirrored_join_sees_new_signal_once() {
        let (_db, store) = seeded().await;
        store.create_chain_signal(&chain_signal(1)).await.unwrap();
        let candidates = store.list_unmirrored(50).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].source_notional_usdc, 25.0);
        assert_eq!(candidates[0].budget_usdc, 200.0);
    }
}
