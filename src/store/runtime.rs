//! Runtime state: watcher cursor KV, risk flags and service heartbeats.

use anyhow::Result;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use crate::db::Db;

pub const KEY_WATCHER_LAST_BLOCK: &str = "watcher_last_block";
pub const KEY_MANUAL_PAUSE: &str = "risk_manual_pause";
pub const KEY_KILL_SWITCH: &str = "risk_kill_switch";

#[derive(Debug, Clone, Serialize)]
pub struct RuntimeServiceRow {
    pub component: String,
    pub pid: i64,
    pub db_path: String,
    pub updated_at: i64,
    pub extra_json: Option<String>,
}

#[derive(Clone)]
pub struct RuntimeStore {
    db: Db,
    db_path: String,
}

impl RuntimeStore {
    pub fn new(db: Db, db_path: &str) -> Self {
        Self {
            db,
            db_path: db_path.to_string(),
        }
    }

    pub async fn get_state(&self, key: &str) -> Result<Option<String>> {
        let conn = self.db.conn().await;
        let value = conn
            .query_row(
                "SELECT value FROM watcher_state WHERE key = ?1",
                [key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    pub async fn set_state(&self, key: &str, value: &str) -> Result<()> {
        let now = Utc::now().timestamp();
        let conn = self.db.conn().await;
        conn.execute(
            "INSERT INTO watcher_state(key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at",
            params![key, value, now],
        )?;
        Ok(())
    }

    pub async fn get_flag(&self, key: &str) -> Result<bool> {
        Ok(matches!(
            self.get_state(key).await?.as_deref(),
            Some("1") | Some("true")
        ))
    }

    pub async fn set_flag(&self, key: &str, on: bool) -> Result<()> {
        self.set_state(key, if on { "1" } else { "0" }).await
    }

    pub async fn heartbeat(&self, component: &str, extra: Option<serde_json::Value>) -> Result<()> {
        let now = Utc::now().timestamp();
        let payload = extra.map(|v| v.to_string());
        let conn = self.db.conn().await;
        conn.execute(
            "INSERT INTO service_runtime(component, pid, db_path, updated_at, extra_json)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(component) DO UPDATE SET
                pid = excluded.pid,
                db_path = excluded.db_path,
                updated_at = excluded.updated_at,
                extra_json = excluded.extra_json",
            params![component, std::process::id() as i64, self.db_path, now, payload],
        )?;
        Ok(())
    }

    pub async fn list_services(&self) -> Result<Vec<RuntimeServiceRow>> {
        let conn = self.db.conn().await;
        let mut stmt = conn.prepare_cached(
            "SELECT component, pid, db_path, updated_at, extra_json
             FROM service_runtime
             ORDER BY component ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(RuntimeServiceRow {
                component: row.get(0)?,
                pid: row.get(1)?,
                db_path: row.get(2)?,
                updated_at: row.get(3)?,
                extra_json: row.get(4)?,
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

    #[tokio::test]
    async fn state_kv_round_trip() {
        let db = Db::open_in_memory().unwrap();
        let store = RuntimeStore::new(db, ":memory:");
        assert!(store.get_state(KEY_WATCHER_LAST_BLOCK).await.unwrap().is_none());
        store.set_state(KEY_WATCHER_LAST_BLOCK, "100").await.unwrap();
        store.set_state(KEY_WATCHER_LAST_BLOCK, "200").await.unwrap();
        assert_eq!(
            store.get_state(KEY_WATCHER_LAST_BLOCK).await.unwrap().as_deref(),
            Some("200")
        );
    }

    #[tokio::test]
    async fn flags_default_off() {
        let db = Db::open_in_memory().unwrap();
        let store = RuntimeStore::new(db, ":memory:");
        assert!(!store.get_flag(KEY_MANUAL_PAUSE).await.unwrap());
        store.set_flag(KEY_MANUAL_PAUSE, true).await.unwrap();
        assert!(store.get_flag(KEY_MANUAL_PAUSE).await.unwrap());
        store.set_flag(KEY_MANUAL_PAUSE, false).await.unwrap();
        assert!(!store.get_flag(KEY_MANUAL_PAUSE).await.unwrap());
    }

    #[tokio::test]
    async fn heartbeat_upserts_component() {
        let db = Db::open_in_memory().unwrap();
        let store = RuntimeStore::new(db, "/tmp/test.db");
        store
            .heartbeat("watcher", Some(serde_json::json!({"poll_seconds": 5})))
            .await
            .unwrap();
        store.heartbeat("watcher", None).await.unwrap();
        let rows = store.list_services().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].component, "watcher");
    }
}
