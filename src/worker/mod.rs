//! The mirror worker.
//!
//! One tick = hydrate new orders from unmirrored signals, reconcile stale
//! open orders, then run the executor over the queue. The risk guard gates
//! every executor call; its counters are a value owned by this loop.

pub mod pairing;
pub mod reconcile;
pub mod sizer;

use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::chain::rpc::{biguint_to_f64, ChainRpc};
use crate::config::{RiskConfig, WorkerConfig};
use crate::db::Db;
use crate::executor::{ExecOutcome, VenueExecutor, EXECUTE_TIMEOUT_SECS};
use crate::gamma::MarketMetaSource;
use crate::models::{NewExecution, OrderStatus, QueuedOrder};
use crate::notifier::{
    failed_message, filled_message, kill_switch_message, sent_message, AlertKind, Notifier,
};
use crate::risk::{check_pre_trade, BlockAlertDeduper, BlockAlertVerdict, RiskLimits, RiskState};
use crate::store::runtime::{KEY_KILL_SWITCH, KEY_MANUAL_PAUSE};
use crate::store::{OrderStore, PairStore, RuntimeStore, SignalStore};

const GAS_CHECK_INTERVAL_SECONDS: i64 = 300;

#[derive(Debug, Default, Clone)]
pub struct WorkerTick {
    pub active_pairs: i64,
    pub created: u32,
    pub canceled: u32,
    pub cancel_failed: u32,
    pub filled: u32,
    pub failed: u32,
}

pub struct Worker {
    pub(crate) signals: SignalStore,
    pub(crate) orders: OrderStore,
    pub(crate) pairs: PairStore,
    pub(crate) runtime: RuntimeStore,
    pub(crate) executor: Arc<dyn VenueExecutor>,
    pub(crate) notifier: Notifier,
    pub(crate) meta: Arc<dyn MarketMetaSource>,
    pub(crate) rpc: Option<Arc<dyn ChainRpc>>,
    pub(crate) usdc_address: Option<String>,
    pub(crate) cfg: WorkerConfig,
    pub(crate) limits: RiskLimits,
    pub(crate) risk: RiskState,
    pub(crate) block_alerts: BlockAlertDeduper,
    pub(crate) risk_alerts: BlockAlertDeduper,
    pub(crate) pair_cooldown_until: HashMap<i64, i64>,
    gas_alert_at: HashMap<i64, i64>,
    last_gas_check: i64,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Db,
        db_path: &str,
        executor: Arc<dyn VenueExecutor>,
        notifier: Notifier,
        meta: Arc<dyn MarketMetaSource>,
        rpc: Option<Arc<dyn ChainRpc>>,
        usdc_address: Option<String>,
        cfg: WorkerConfig,
        risk_cfg: RiskConfig,
    ) -> Self {
        Self {
            signals: SignalStore::new(db.clone()),
            orders: OrderStore::new(db.clone()),
            pairs: PairStore::new(db.clone()),
            runtime: RuntimeStore::new(db, db_path),
            executor,
            notifier,
            meta,
            rpc,
            usdc_address,
            cfg,
            limits: RiskLimits {
                max_order_usd: risk_cfg.max_order_usdc,
                max_daily_loss_pct: risk_cfg.max_daily_loss_pct,
                max_consecutive_losses: risk_cfg.max_consecutive_losses,
                max_consecutive_exec_failures: risk_cfg.max_consecutive_exec_failures,
            },
            risk: RiskState::default(),
            block_alerts: BlockAlertDeduper::default(),
            risk_alerts: BlockAlertDeduper::default(),
            pair_cooldown_until: HashMap::new(),
            gas_alert_at: HashMap::new(),
            last_gas_check: 0,
        }
    }

    /// Rebuild process-local risk state from durable rows: equity from the
    /// follower budgets, pnl from today's fills, flags from the KV store.
    pub async fn hydrate_risk(&mut self) -> Result<()> {
        let start_of_day = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp())
            .unwrap_or(0);
        self.risk.daily_start_equity_usd = self.pairs.sum_active_follower_budgets().await?;
        self.risk.running_pnl_usd = self.orders.sum_realized_pnl_since(start_of_day).await?;
        self.risk.kill_switch = self.runtime.get_flag(KEY_KILL_SWITCH).await?;
        self.risk.manual_pause = self.runtime.get_flag(KEY_MANUAL_PAUSE).await?;
        info!(
            daily_start_equity = self.risk.daily_start_equity_usd,
            running_pnl = self.risk.running_pnl_usd,
            kill_switch = self.risk.kill_switch,
            manual_pause = self.risk.manual_pause,
            "risk state hydrated"
        );
        Ok(())
    }

    pub fn risk_state(&self) -> &RiskState {
        &self.risk
    }

    pub async fn tick(&mut self) -> Result<WorkerTick> {
        self.runtime
            .heartbeat(
                "worker",
                Some(serde_json::json!({ "mode": self.cfg.executor_mode })),
            )
            .await
            .ok();

        // Operator pause/resume lands through the KV store between ticks.
        self.risk.manual_pause = self.runtime.get_flag(KEY_MANUAL_PAUSE).await?;

        let mut summary = WorkerTick {
            active_pairs: self.pairs.active_pair_count().await?,
            ..WorkerTick::default()
        };
        summary.created = self.hydrate_orders().await?;
        let (canceled, cancel_failed) = self.reconcile_stale().await?;
        summary.canceled = canceled;
        summary.cancel_failed = cancel_failed;
        let (filled, failed) = self.execute_queued().await?;
        summary.filled = filled;
        summary.failed = failed;

        self.check_follower_funding().await;

        info!(
            mode = %self.cfg.executor_mode,
            active_pairs = summary.active_pairs,
            queued_orders = summary.created,
            canceled = summary.canceled,
            cancel_failed = summary.cancel_failed,
            filled = summary.filled,
            failed = summary.failed,
            "worker tick"
        );
        Ok(summary)
    }

    async fn execute_queued(&mut self) -> Result<(u32, u32)> {
        let queued = self.orders.list_queued(self.cfg.batch_limit).await?;
        let mut filled = 0u32;
        let mut failed = 0u32;

        for order in queued {
            let now = Utc::now().timestamp();

            if self
                .pair_cooldown_until
                .get(&order.pair_id)
                .copied()
                .unwrap_or(0)
                > now
            {
                self.orders
                    .mark_status(
                        order.id,
                        OrderStatus::Blocked,
                        Some("pair_local_balance_failure_cooldown"),
                    )
                    .await?;
                continue;
            }

            let decision = check_pre_trade(order.adjusted_notional_usdc, &self.limits, &self.risk);
            if !decision.allowed {
                warn!(order_id = order.id, reason = decision.reason, "risk denied trade");
                if let BlockAlertVerdict::Deliver {
                    suppressed_since_last,
                } = self.risk_alerts.check(
                    order.pair_id,
                    decision.reason,
                    now,
                    self.cfg.block_alert_cooldown_seconds,
                ) {
                    let mut text = format!(
                        "copybot risk denied order\npair: {}\norder: {}\nreason: {}",
                        order.pair_id, order.id, decision.reason
                    );
                    if suppressed_since_last > 0 {
                        text.push_str(&format!(
                            "\nsuppressed_since_last: {suppressed_since_last}"
                        ));
                    }
                    self.notifier.send(AlertKind::RiskAlert, text).await;
                }
                // The order stays queued until the guard clears or the
                // operator intervenes.
                continue;
            }

            // Commit point: from here recovery belongs to the reconciler.
            // The reprice marker survives the transition so a second timeout
            // cancels instead of repricing again.
            self.orders
                .mark_status(order.id, OrderStatus::Sent, order.blocked_reason.as_deref())
                .await?;

            let result = match timeout(
                Duration::from_secs(EXECUTE_TIMEOUT_SECS),
                self.executor.execute(&order),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => {
                    warn!(order_id = order.id, "executor submit timed out, leaving order sent");
                    continue;
                }
            };

            if let Some(exec_ref) = result.executor_ref.as_deref() {
                if !exec_ref.is_empty() {
                    self.orders.set_executor_ref(order.id, exec_ref).await?;
                }
            }

            match result.outcome {
                ExecOutcome::Filled => {
                    self.orders
                        .mark_status(order.id, OrderStatus::Filled, None)
                        .await?;
                    let executed_price = result.executed_price.or(order.source_price);
                    self.orders
                        .create_execution(&NewExecution {
                            mirror_order_id: order.id,
                            pair_id: order.pair_id,
                            follower_wallet_id: order.follower_wallet_id,
                            chain_tx_hash: result.chain_tx_hash.clone(),
                            executed_side: order.side,
                            executed_outcome: order.outcome.clone(),
                            executed_price,
                            executed_notional_usdc: Some(order.adjusted_notional_usdc),
                            status: "filled",
                            fail_reason: None,
                        })
                        .await?;
                    self.orders
                        .consume_follower_budget(
                            order.follower_wallet_id,
                            order.adjusted_notional_usdc,
                        )
                        .await?;
                    self.risk.record_fill(None);
                    self.notifier
                        .send(
                            AlertKind::Filled,
                            filled_message(
                                order.id,
                                order.pair_id,
                                order.follower_wallet_id,
                                order.side.as_str(),
                                order.outcome.as_deref(),
                                order.adjusted_notional_usdc,
                                result.chain_tx_hash.as_deref(),
                                order.source_tx_hash.as_deref(),
                                order.market_slug.as_deref(),
                            ),
                        )
                        .await;
                    filled += 1;
                }
                ExecOutcome::Sent => {
                    self.orders
                        .mark_status(order.id, OrderStatus::Sent, order.blocked_reason.as_deref())
                        .await?;
                    self.notifier
                        .send(
                            AlertKind::Sent,
                            sent_message(
                                order.id,
                                order.pair_id,
                                order.follower_wallet_id,
                                order.side.as_str(),
                                order.outcome.as_deref(),
                                order.adjusted_notional_usdc,
                                order.source_tx_hash.as_deref(),
                                order.market_slug.as_deref(),
                            ),
                        )
                        .await;
                }
                ExecOutcome::Failed | ExecOutcome::Canceled => {
                    failed += 1;
                    self.handle_execution_failure(&order, result.fail_reason, now).await?;
                }
            }
        }

        Ok((filled, failed))
    }

    async fn handle_execution_failure(
        &mut self,
        order: &QueuedOrder,
        fail_reason: Option<String>,
        now: i64,
    ) -> Result<()> {
        let fail_reason = fail_reason.unwrap_or_else(|| "executor_failed".to_string());
        let min_size_block = pairing::is_market_min_size_failure(Some(&fail_reason));

        if min_size_block {
            // Below the venue minimum is a policy outcome, not a failure.
            self.orders
                .mark_status(order.id, OrderStatus::Blocked, Some("market_min_order_size"))
                .await?;
        } else {
            self.orders
                .mark_status(order.id, OrderStatus::Failed, Some(&fail_reason))
                .await?;
        }

        self.orders
            .create_execution(&NewExecution {
                mirror_order_id: order.id,
                pair_id: order.pair_id,
                follower_wallet_id: order.follower_wallet_id,
                chain_tx_hash: None,
                executed_side: order.side,
                executed_outcome: order.outcome.clone(),
                executed_price: order.source_price,
                executed_notional_usdc: Some(order.adjusted_notional_usdc),
                status: "failed",
                fail_reason: Some(fail_reason.clone()),
            })
            .await?;

        if pairing::is_balance_or_allowance_failure(Some(&fail_reason)) {
            self.pair_cooldown_until.insert(
                order.pair_id,
                now + self.cfg.balance_fail_cooldown_seconds,
            );
        }

        if !min_size_block {
            self.notifier
                .send(
                    AlertKind::Failed,
                    failed_message(
                        order.id,
                        order.pair_id,
                        order.follower_wallet_id,
                        order.side.as_str(),
                        order.outcome.as_deref(),
                        order.adjusted_notional_usdc,
                        &fail_reason,
                        order.source_tx_hash.as_deref(),
                        order.market_slug.as_deref(),
                    ),
                )
                .await;

            let newly_latched = self.risk.record_exec_failure(&self.limits);
            if newly_latched {
                self.runtime.set_flag(KEY_KILL_SWITCH, true).await?;
                self.notifier
                    .send(
                        AlertKind::KillSwitch,
                        kill_switch_message(self.risk.consecutive_exec_failures),
                    )
                    .await;
            }
        }

        Ok(())
    }

    /// Low-gas (and optionally USDC) check for follower wallets, throttled
    /// to one RPC sweep every few minutes and one alert per cooldown.
    async fn check_follower_funding(&mut self) {
        let Some(rpc) = self.rpc.clone() else {
            return;
        };
        let now = Utc::now().timestamp();
        if now - self.last_gas_check < GAS_CHECK_INTERVAL_SECONDS {
            return;
        }
        self.last_gas_check = now;

        let followers = match self.pairs.list_follower_funding().await {
            Ok(followers) => followers,
            Err(e) => {
                warn!(error = %e, "follower funding query failed");
                return;
            }
        };

        for follower in followers {
            let balance = match rpc.native_balance(&follower.address).await {
                Ok(balance) => balance,
                Err(e) => {
                    warn!(address = %follower.address, error = %e, "gas balance check failed");
                    continue;
                }
            };
            if balance >= follower.min_matic_alert {
                continue;
            }
            let last = self
                .gas_alert_at
                .get(&follower.follower_wallet_id)
                .copied()
                .unwrap_or(0);
            if now - last < self.cfg.gas_alert_cooldown_seconds {
                continue;
            }
            self.gas_alert_at.insert(follower.follower_wallet_id, now);

            let mut text = format!(
                "copybot follower gas low\nwallet: {}\nPOL balance: {:.4}\nalert floor: {:.4}",
                follower.address, balance, follower.min_matic_alert
            );
            if let Some(usdc) = self.usdc_address.as_deref() {
                if let Ok(raw) = rpc.erc20_balance(usdc, &follower.address).await {
                    text.push_str(&format!(
                        "\nUSDC balance: {:.2}",
                        biguint_to_f64(&raw) / 1e6
                    ));
                }
            }
            self.notifier.send(AlertKind::RiskAlert, text).await;
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        self.hydrate_risk().await?;
        info!(
            mode = %self.cfg.executor_mode,
            poll_seconds = self.cfg.poll_seconds,
            "worker starting"
        );
        loop {
            if let Err(e) = self.tick().await {
                warn!(error = %format!("{e:#}"), "worker tick failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(self.cfg.poll_seconds)) => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("stop signal received, worker exiting");
                    return Ok(());
                }
            }
        }
    }
}
