//! GAMMA market metadata for the policy filter.
//!
//! One lookup per token id with a TTL cache: hits live 10 minutes, negative
//! results 2 minutes so a flaky API cannot hammer the filter path.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

const GAMMA_API_BASE: &str = "https://gamma-api.polymarket.com";
const HIT_TTL_SECONDS: i64 = 600;
const MISS_TTL_SECONDS: i64 = 120;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MarketMeta {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub slug: Option<String>,
}

/// Metadata lookup behind a trait so the worker is testable offline.
#[async_trait]
pub trait MarketMetaSource: Send + Sync {
    async fn market_meta(&self, token_id: &str) -> Option<MarketMeta>;
}

/// Disabled lookup: every market passes the metadata-based filters.
pub struct NullMetaSource;

#[async_trait]
impl MarketMetaSource for NullMetaSource {
    async fn market_meta(&self, _token_id: &str) -> Option<MarketMeta> {
        None
    }
}

pub struct GammaClient {
    client: Client,
    cache: RwLock<HashMap<String, (i64, Option<MarketMeta>)>>,
}

impl GammaClient {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(6))
            .user_agent("copybot-worker/1.0")
            .build()
            .expect("build gamma http client");
        Self {
            client,
            cache: RwLock::new(HashMap::new()),
        }
    }

    async fn fetch(&self, token_id: &str) -> Option<MarketMeta> {
        let url = format!("{GAMMA_API_BASE}/markets");
        let resp = self
            .client
            .get(&url)
            .query(&[("clob_token_ids", token_id)])
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let rows: Vec<MarketMeta> = resp.json().await.ok()?;
        rows.into_iter().next()
    }
}

impl Default for GammaClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarketMetaSource for GammaClient {
    async fn market_meta(&self, token_id: &str) -> Option<MarketMeta> {
        let now = Utc::now().timestamp();
        if let Some((expires_at, cached)) = self.cache.read().get(token_id) {
            if *expires_at > now {
                return cached.clone();
            }
        }

        let fetched = self.fetch(token_id).await;
        let ttl = if fetched.is_some() {
            HIT_TTL_SECONDS
        } else {
            MISS_TTL_SECONDS
        };
        debug!(token_id, hit = fetched.is_some(), "gamma meta fetched");
        self.cache
            .write()
            .insert(token_id.to_string(), (now + ttl, fetched.clone()));
        fetched
    }
}
