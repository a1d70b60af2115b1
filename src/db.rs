//! SQLite handle and schema.
//!
//! One database is the single source of truth for the whole deployment.
//! Every status write is a single statement; idempotency is enforced with
//! unique indexes + `INSERT OR IGNORE` rather than application locks.

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open sqlite db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory db")?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS source_wallets (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            address TEXT NOT NULL UNIQUE,
            alias TEXT,
            status TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active', 'disabled')),
            source_portfolio_usdc REAL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS follower_wallets (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            address TEXT NOT NULL UNIQUE,
            label TEXT,
            budget_usdc REAL NOT NULL DEFAULT 0,
            initial_matic REAL NOT NULL DEFAULT 0,
            min_matic_alert REAL NOT NULL DEFAULT 0,
            key_ref TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active', 'disabled')),
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS wallet_pairs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_wallet_id INTEGER NOT NULL REFERENCES source_wallets(id) ON DELETE CASCADE,
            follower_wallet_id INTEGER NOT NULL REFERENCES follower_wallets(id) ON DELETE CASCADE,
            mode TEXT NOT NULL DEFAULT 'paper' CHECK (mode IN ('live', 'paper', 'observe')),
            active INTEGER NOT NULL DEFAULT 1,
            sizing_policy TEXT NOT NULL DEFAULT 'absolute'
                CHECK (sizing_policy IN ('absolute', 'proportional')),
            min_order_usdc REAL NOT NULL DEFAULT 1.0,
            max_order_usdc REAL,
            max_slippage_bps INTEGER NOT NULL DEFAULT 300,
            max_consecutive_failures INTEGER NOT NULL DEFAULT 3,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE (source_wallet_id, follower_wallet_id)
        );

        CREATE TABLE IF NOT EXISTS trade_signals (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_wallet_id INTEGER NOT NULL REFERENCES source_wallets(id),
            chain_id INTEGER NOT NULL,
            tx_hash TEXT NOT NULL,
            log_index INTEGER NOT NULL,
            block_number INTEGER,
            market_slug TEXT,
            token_id TEXT,
            outcome TEXT,
            side TEXT NOT NULL CHECK (side IN ('buy', 'sell')),
            source_notional_usdc REAL NOT NULL CHECK (source_notional_usdc > 0),
            source_price REAL,
            observed_at INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_trade_signals_unique
            ON trade_signals (chain_id, source_wallet_id, tx_hash, log_index);
        CREATE INDEX IF NOT EXISTS idx_trade_signals_source
            ON trade_signals (source_wallet_id, id);

        CREATE TABLE IF NOT EXISTS mirror_orders (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            pair_id INTEGER NOT NULL REFERENCES wallet_pairs(id),
            trade_signal_id INTEGER NOT NULL REFERENCES trade_signals(id),
            requested_notional_usdc REAL NOT NULL,
            adjusted_notional_usdc REAL NOT NULL,
            status TEXT NOT NULL
                CHECK (status IN ('queued', 'sent', 'filled', 'failed', 'canceled', 'blocked')),
            blocked_reason TEXT,
            executor_ref TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE (pair_id, trade_signal_id)
        );
        CREATE INDEX IF NOT EXISTS idx_mirror_orders_status
            ON mirror_orders (status, updated_at);

        CREATE TABLE IF NOT EXISTS executions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            mirror_order_id INTEGER NOT NULL REFERENCES mirror_orders(id),
            pair_id INTEGER NOT NULL,
            follower_wallet_id INTEGER NOT NULL,
            chain_tx_hash TEXT,
            executed_side TEXT,
            executed_outcome TEXT,
            executed_price REAL,
            executed_notional_usdc REAL,
            fee_usdc REAL,
            pnl_realized_usdc REAL,
            status TEXT NOT NULL CHECK (status IN ('filled', 'failed')),
            fail_reason TEXT,
            executed_at INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_executions_pair
            ON executions (pair_id, executed_at DESC);

        CREATE TABLE IF NOT EXISTS watcher_state (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS service_runtime (
            component TEXT PRIMARY KEY,
            pid INTEGER NOT NULL,
            db_path TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            extra_json TEXT
        );

        CREATE TABLE IF NOT EXISTS alerts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_type TEXT NOT NULL,
            payload TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('sent', 'skipped', 'failed')),
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_alerts_created ON alerts (created_at DESC);

        CREATE TABLE IF NOT EXISTS vault_keys (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            key_ref TEXT NOT NULL UNIQUE,
            ciphertext_b64 TEXT NOT NULL,
            salt_b64 TEXT NOT NULL,
            nonce_b64 TEXT NOT NULL,
            mac_b64 TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active', 'disabled')),
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            last_used_at INTEGER
        );
        ",
    )
    .context("init schema")?;
    Ok(())
}
