//! Source wallet watcher.
//!
//! Tails OrderFilled logs on the configured exchanges and turns fills by
//! watched source wallets into trade signals, at-most-once. The loop is
//! lag-aware: bounded ranges per tick, a fast-forward jump when too far
//! behind, and poll cadence that backs off on errors or slow ticks and
//! recovers after a healthy streak.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::chain::logs::{detect_trade_for_address, order_filled_topic0, parse_order_filled};
use crate::chain::rpc::{is_range_too_large_error, ChainRpc};
use crate::config::WatcherConfig;
use crate::models::NewChainSignal;
use crate::store::runtime::KEY_WATCHER_LAST_BLOCK;
use crate::store::{RuntimeStore, SignalStore};

/// Outcome of one tick, for logging and tests.
#[derive(Debug, Default, Clone)]
pub struct WatcherTick {
    pub from_block: Option<u64>,
    pub to_block: Option<u64>,
    pub logs_seen: usize,
    pub inserted_signals: usize,
    pub watched_wallets: usize,
    pub lag_jump: bool,
}

pub struct SourceWatcher {
    rpc: Arc<dyn ChainRpc>,
    signals: SignalStore,
    runtime: RuntimeStore,
    cfg: WatcherConfig,
    exchanges: Vec<String>,
    topic0: String,
    last_block: u64,
    poll_seconds: u64,
    error_streak: u32,
    healthy_streak: u32,
}

impl SourceWatcher {
    pub async fn new(
        rpc: Arc<dyn ChainRpc>,
        signals: SignalStore,
        runtime: RuntimeStore,
        cfg: WatcherConfig,
        exchanges: Vec<String>,
    ) -> Result<Self> {
        let last_block = runtime
            .get_state(KEY_WATCHER_LAST_BLOCK)
            .await?
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let poll_seconds = cfg.poll_min_seconds;
        Ok(Self {
            rpc,
            signals,
            runtime,
            cfg,
            exchanges,
            topic0: order_filled_topic0(),
            last_block,
            poll_seconds,
            error_streak: 0,
            healthy_streak: 0,
        })
    }

    pub fn poll_seconds(&self) -> u64 {
        self.poll_seconds
    }

    pub fn last_block(&self) -> u64 {
        self.last_block
    }

    async fn persist_last_block(&mut self, block: u64) -> Result<()> {
        self.last_block = block;
        self.runtime
            .set_state(KEY_WATCHER_LAST_BLOCK, &block.to_string())
            .await
    }

    pub async fn tick(&mut self) -> Result<WatcherTick> {
        let mut outcome = WatcherTick::default();

        self.runtime
            .heartbeat(
                "watcher",
                Some(serde_json::json!({ "poll_seconds": self.poll_seconds })),
            )
            .await
            .ok();

        let head = self.rpc.block_number().await.context("fetch head block")?;
        let target = head.saturating_sub(self.cfg.confirmations);

        if self.last_block == 0 {
            let seeded = target.saturating_sub(self.cfg.max_block_range);
            self.persist_last_block(seeded).await?;
        }

        if target <= self.last_block {
            return Ok(outcome);
        }

        let lag = target - self.last_block;
        if lag > self.cfg.max_lag_blocks {
            self.persist_last_block(target).await?;
            warn!(jumped_to = target, lag_blocks = lag, "watcher lag jump");
            outcome.lag_jump = true;
            return Ok(outcome);
        }

        let watched = self.signals.list_active_source_addresses().await?;
        outcome.watched_wallets = watched.len();
        if watched.is_empty() {
            self.persist_last_block(target).await?;
            return Ok(outcome);
        }

        let from_block = self.last_block + 1;
        let to_block = target.min(self.last_block + self.cfg.max_block_range);
        outcome.from_block = Some(from_block);
        outcome.to_block = Some(to_block);

        let logs = match self
            .rpc
            .get_logs(from_block, to_block, &self.exchanges, &self.topic0)
            .await
        {
            Ok(logs) => logs,
            Err(e) => {
                if is_range_too_large_error(&format!("{e:#}")) {
                    let rewound = target.saturating_sub(self.cfg.max_block_range);
                    self.persist_last_block(rewound).await?;
                    warn!(rewound, "getLogs range rejected, rewinding cursor");
                }
                return Err(e).context("fetch logs");
            }
        };
        outcome.logs_seen = logs.len();

        for log in &logs {
            let fill = match parse_order_filled(log) {
                Ok(fill) => fill,
                Err(e) => {
                    warn!(tx = %log.transaction_hash, error = %e, "watcher parse error");
                    continue;
                }
            };
            let (Some(block_number), Some(log_index)) =
                (log.block_number_u64(), log.log_index_u64())
            else {
                warn!(tx = %log.transaction_hash, "watcher log missing block/index");
                continue;
            };

            // A fill where both parties are watched yields two signals.
            for addr in [fill.maker.clone(), fill.taker.clone()] {
                if !watched.contains(&addr) {
                    continue;
                }
                let Some(trade) = detect_trade_for_address(&addr, &fill) else {
                    continue;
                };
                let inserted = self
                    .signals
                    .create_chain_signal(&NewChainSignal {
                        source_address: addr,
                        chain_id: self.cfg.chain_id,
                        tx_hash: log.transaction_hash.clone(),
                        log_index: log_index as i64,
                        block_number: Some(block_number as i64),
                        side: trade.side,
                        token_id: Some(trade.token_id),
                        outcome: None,
                        market_slug: None,
                        source_notional_usdc: trade.notional_usdc,
                        source_price: trade.price,
                    })
                    .await?;
                if inserted.is_some() {
                    outcome.inserted_signals += 1;
                }
            }
        }

        self.persist_last_block(to_block).await?;
        info!(
            from = from_block,
            to = to_block,
            logs = outcome.logs_seen,
            inserted = outcome.inserted_signals,
            watched = outcome.watched_wallets,
            poll = self.poll_seconds,
            "watcher tick"
        );
        Ok(outcome)
    }

    /// fast -> (error | slow) -> slow poll -> healthy streak -> fast.
    fn apply_pacing(&mut self, had_error: bool, tick_ms: u64) {
        let is_slow = tick_ms >= self.cfg.backoff_slow_tick_ms;
        if had_error {
            self.error_streak += 1;
            self.healthy_streak = 0;
        } else {
            self.error_streak = 0;
            self.healthy_streak = if is_slow { 0 } else { self.healthy_streak + 1 };
        }

        if had_error || is_slow {
            if is_slow || self.error_streak >= self.cfg.backoff_error_streak {
                self.poll_seconds = self.cfg.poll_max_seconds;
            }
        } else if self.poll_seconds == self.cfg.poll_max_seconds
            && self.healthy_streak >= self.cfg.recovery_healthy_ticks
        {
            self.poll_seconds = self.cfg.poll_min_seconds;
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        info!(
            exchanges = self.exchanges.len(),
            confirmations = self.cfg.confirmations,
            max_block_range = self.cfg.max_block_range,
            "watcher starting"
        );
        loop {
            let started = Instant::now();
            let result = self.tick().await;
            let tick_ms = started.elapsed().as_millis() as u64;
            let had_error = result.is_err();
            if let Err(e) = result {
                warn!(error = %format!("{e:#}"), "watcher tick failed");
            }
            self.apply_pacing(had_error, tick_ms);
            info!(
                tick_ms,
                poll = self.poll_seconds,
                error_streak = self.error_streak,
                healthy_streak = self.healthy_streak,
                "watcher perf"
            );

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(self.poll_seconds)) => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("stop signal received, watcher exiting");
                    return Ok(());
                }
            }
        }
    }
}
