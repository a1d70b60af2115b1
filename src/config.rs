//! Environment-driven configuration.
//!
//! Everything is read once at startup into a typed `Config`. Optional knobs
//! fall back to the defaults below; values required by the selected command
//! are validated with `require_*` helpers and surface as `ConfigError`
//! (exit code 2) instead of a runtime failure.

use anyhow::Result;
use std::env;
use std::fmt;

/// Startup misconfiguration. The only error class that is fatal by design.
#[derive(Debug)]
pub struct ConfigError(pub String);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "config error: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

pub fn config_err(msg: impl Into<String>) -> anyhow::Error {
    anyhow::Error::new(ConfigError(msg.into()))
}

fn env_str(name: &str, default: &str) -> String {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_opt(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub rpc_url: Option<String>,
    pub exchanges: Vec<String>,
    pub chain_id: i64,
    pub confirmations: u64,
    pub max_block_range: u64,
    pub max_lag_blocks: u64,
    pub poll_min_seconds: u64,
    pub poll_max_seconds: u64,
    pub backoff_slow_tick_ms: u64,
    pub backoff_error_streak: u32,
    pub recovery_healthy_ticks: u32,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub executor_mode: String,
    pub poll_seconds: u64,
    pub market_min_buy_usdc: f64,
    pub min_source_notional_usdc: f64,
    pub balance_fail_cooldown_seconds: i64,
    pub block_alert_cooldown_seconds: i64,
    pub open_order_cancel_after_seconds: i64,
    pub gas_alert_cooldown_seconds: i64,
    pub batch_limit: usize,
}

#[derive(Debug, Clone)]
pub struct RiskConfig {
    pub max_order_usdc: f64,
    pub max_daily_loss_pct: f64,
    pub max_consecutive_losses: u32,
    pub max_consecutive_exec_failures: u32,
}

#[derive(Debug, Clone)]
pub struct ClobConfig {
    pub host: String,
    pub chain_id: u64,
}

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: Option<String>,
    pub chat_id: Option<String>,
    pub max_retries: u32,
}

impl TelegramConfig {
    pub fn is_configured(&self) -> bool {
        self.bot_token.is_some() && self.chat_id.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: String,
    pub vault_passphrase: Option<String>,
    pub usdc_address: Option<String>,
    pub watcher: WatcherConfig,
    pub worker: WorkerConfig,
    pub risk: RiskConfig,
    pub clob: ClobConfig,
    pub telegram: TelegramConfig,
}

// Polymarket CTF exchange + neg-risk exchange on Polygon.
const DEFAULT_EXCHANGES: &[&str] = &[
    "0xC5d563A36AE78145C45a50134d48A1215220f80a",
    "0x4bFb41d5B3570DeFd03C39a9A4D8dE6Bd8B8982E",
];

impl Config {
    pub fn from_env() -> Result<Self> {
        let exchanges = env_opt("COPYBOT_WATCHER_EXCHANGES")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_else(|| DEFAULT_EXCHANGES.iter().map(|s| s.to_string()).collect());

        let poll_min = env_parse("COPYBOT_WATCHER_POLL_MIN_SECONDS", 5u64).max(1);
        let poll_max = env_parse("COPYBOT_WATCHER_POLL_MAX_SECONDS", 10u64).max(poll_min);

        let market_min_buy = env_parse("COPYBOT_MARKET_MIN_BUY_USDC", 1.0f64).max(1.0);

        Ok(Self {
            db_path: env_str("COPYBOT_DB_PATH", "copybot.db"),
            vault_passphrase: env_opt("COPYBOT_VAULT_PASSPHRASE"),
            usdc_address: env_opt("COPYBOT_USDC_ADDRESS"),
            watcher: WatcherConfig {
                rpc_url: env_opt("COPYBOT_RPC_URL"),
                exchanges,
                chain_id: env_parse("COPYBOT_CHAIN_ID", 137i64),
                confirmations: env_parse("COPYBOT_WATCHER_CONFIRMATIONS", 2u64),
                max_block_range: env_parse("COPYBOT_WATCHER_MAX_BLOCK_RANGE", 200u64).max(1),
                max_lag_blocks: env_parse("COPYBOT_WATCHER_MAX_LAG_BLOCKS", 600u64),
                poll_min_seconds: poll_min,
                poll_max_seconds: poll_max,
                backoff_slow_tick_ms: env_parse("COPYBOT_WATCHER_BACKOFF_SLOW_TICK_MS", 4000u64),
                backoff_error_streak: env_parse("COPYBOT_WATCHER_BACKOFF_ERROR_STREAK", 2u32),
                recovery_healthy_ticks: env_parse("COPYBOT_WATCHER_RECOVERY_HEALTHY_TICKS", 6u32),
            },
            worker: WorkerConfig {
                executor_mode: env_str("COPYBOT_EXECUTOR_MODE", "stub").to_lowercase(),
                poll_seconds: env_parse("COPYBOT_EXECUTOR_POLL_SECONDS", 10u64).max(1),
                market_min_buy_usdc: market_min_buy,
                min_source_notional_usdc: env_parse("COPYBOT_MIN_SOURCE_NOTIONAL_USDC", 1.0f64),
                balance_fail_cooldown_seconds: env_parse(
                    "COPYBOT_BALANCE_FAIL_COOLDOWN_SECONDS",
                    900i64,
                ),
                block_alert_cooldown_seconds: env_parse(
                    "COPYBOT_BLOCK_ALERT_COOLDOWN_SECONDS",
                    600i64,
                ),
                open_order_cancel_after_seconds: env_parse(
                    "COPYBOT_OPEN_ORDER_CANCEL_AFTER_SECONDS",
                    180i64,
                ),
                gas_alert_cooldown_seconds: env_parse(
                    "COPYBOT_GAS_ALERT_COOLDOWN_SECONDS",
                    3600i64,
                ),
                batch_limit: env_parse("COPYBOT_WORKER_BATCH_LIMIT", 100usize),
            },
            risk: RiskConfig {
                max_order_usdc: env_parse("COPYBOT_MAX_ORDER_USDC", 250.0f64),
                max_daily_loss_pct: env_parse("COPYBOT_MAX_DAILY_LOSS_PCT", 10.0f64),
                max_consecutive_losses: env_parse("COPYBOT_MAX_CONSECUTIVE_LOSSES", 3u32),
                max_consecutive_exec_failures: env_parse(
                    "COPYBOT_MAX_CONSECUTIVE_EXEC_FAILURES",
                    3u32,
                ),
            },
            clob: ClobConfig {
                host: env_str("COPYBOT_CLOB_HOST", "https://clob.polymarket.com"),
                chain_id: env_parse("COPYBOT_CLOB_CHAIN_ID", 137u64),
            },
            telegram: TelegramConfig {
                bot_token: env_opt("COPYBOT_TELEGRAM_BOT_TOKEN"),
                chat_id: env_opt("COPYBOT_TELEGRAM_CHAT_ID"),
                max_retries: env_parse("COPYBOT_TELEGRAM_MAX_RETRIES", 3u32).max(1),
            },
        })
    }

    pub fn require_rpc_url(&self) -> Result<String> {
        self.watcher
            .rpc_url
            .clone()
            .ok_or_else(|| config_err("COPYBOT_RPC_URL is not set"))
    }

    pub fn require_vault_passphrase(&self) -> Result<String> {
        self.vault_passphrase
            .clone()
            .ok_or_else(|| config_err("COPYBOT_VAULT_PASSPHRASE is not set"))
    }

    pub fn require_exchanges(&self) -> Result<Vec<String>> {
        if self.watcher.exchanges.is_empty() {
            return Err(config_err("COPYBOT_WATCHER_EXCHANGES is empty"));
        }
        Ok(self.watcher.exchanges.clone())
    }
}
