//! End-to-end pipeline tests: chain log -> signal -> mirror order ->
//! executor -> reconciler, driven through the real stores on a temp
//! database with scripted venue and chain fakes.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use num_bigint::BigUint;
use parking_lot::Mutex;

use copybot_backend::chain::logs::order_filled_topic0;
use copybot_backend::chain::rpc::{ChainRpc, RawLog};
use copybot_backend::chain::SourceWatcher;
use copybot_backend::config::{RiskConfig, TelegramConfig, WatcherConfig, WorkerConfig};
use copybot_backend::db::Db;
use copybot_backend::executor::{
    ExecutionResult, StubExecutor, VenueExecutor,
};
use copybot_backend::gamma::NullMetaSource;
use copybot_backend::models::{QueuedOrder, Side, StaleSentOrder};
use copybot_backend::notifier::spawn_notifier;
use copybot_backend::store::pairs::{NewPair, PairStore};
use copybot_backend::store::runtime::KEY_WATCHER_LAST_BLOCK;
use copybot_backend::store::{OrderStore, RuntimeStore, SignalStore};
use copybot_backend::worker::Worker;

const SOURCE: &str = "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
const FOLLOWER: &str = "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
const COUNTERPARTY: &str = "0xdddddddddddddddddddddddddddddddddddddddd";

fn worker_cfg() -> WorkerConfig {
    WorkerConfig {
        executor_mode: "stub".into(),
        poll_seconds: 1,
        market_min_buy_usdc: 1.0,
        min_source_notional_usdc: 1.0,
        balance_fail_cooldown_seconds: 900,
        block_alert_cooldown_seconds: 600,
        open_order_cancel_after_seconds: 180,
        gas_alert_cooldown_seconds: 3600,
        batch_limit: 100,
    }
}

fn risk_cfg() -> RiskConfig {
    RiskConfig {
        max_order_usdc: 250.0,
        max_daily_loss_pct: 10.0,
        max_consecutive_losses: 3,
        max_consecutive_exec_failures: 3,
    }
}

fn watcher_cfg() -> WatcherConfig {
    WatcherConfig {
        rpc_url: None,
        exchanges: vec![],
        chain_id: 137,
        confirmations: 2,
        max_block_range: 200,
        max_lag_blocks: 300,
        poll_min_seconds: 5,
        poll_max_seconds: 10,
        backoff_slow_tick_ms: 4000,
        backoff_error_streak: 2,
        recovery_healthy_ticks: 6,
    }
}

async fn seed_pair(db: &Db, budget: f64, max_slippage_bps: i64) {
    PairStore::new(db.clone())
        .create_pair(&NewPair {
            source_address: SOURCE.into(),
            follower_address: FOLLOWER.into(),
            source_alias: None,
            follower_label: None,
            budget_usdc: budget,
            key_ref: "vault://test".into(),
            mode: "paper".into(),
            active: true,
            sizing_policy: "absolute".into(),
            min_order_usdc: 1.0,
            max_order_usdc: None,
            max_slippage_bps,
            max_consecutive_failures: 3,
            initial_matic: 3.0,
            min_matic_alert: 0.0,
            source_portfolio_usdc: None,
            skip_key_ref_check: true,
        })
        .await
        .unwrap();
}

fn build_worker(db: &Db, executor: Arc<dyn VenueExecutor>) -> Worker {
    let notifier = spawn_notifier(
        db.clone(),
        TelegramConfig {
            bot_token: None,
            chat_id: None,
            max_retries: 1,
        },
    );
    Worker::new(
        db.clone(),
        ":memory:",
        executor,
        notifier,
        Arc::new(NullMetaSource),
        None,
        None,
        worker_cfg(),
        risk_cfg(),
    )
}

struct FakeRpc {
    head: u64,
    logs: Vec<RawLog>,
}

#[async_trait]
impl ChainRpc for FakeRpc {
    async fn block_number(&self) -> Result<u64> {
        Ok(self.head)
    }

    async fn get_logs(
        &self,
        _from: u64,
        _to: u64,
        _addresses: &[String],
        _topic0: &str,
    ) -> Result<Vec<RawLog>> {
        Ok(self.logs.clone())
    }

    async fn native_balance(&self, _address: &str) -> Result<f64> {
        Ok(1.0)
    }

    async fn erc20_balance(&self, _token: &str, _wallet: &str) -> Result<BigUint> {
        Ok(BigUint::from(0u32))
    }
}

fn order_filled_log(
    maker: &str,
    taker: &str,
    maker_asset: u128,
    taker_asset: u128,
    maker_amt: u128,
    taker_amt: u128,
) -> RawLog {
    let word = |v: u128| format!("{v:064x}");
    RawLog {
        address: "0xc5d563a36ae78145c45a50134d48a1215220f80a".into(),
        topics: vec![
            order_filled_topic0(),
            format!("0x{:064x}", 1u8),
            format!("0x{:0>64}", maker.trim_start_matches("0x")),
            format!("0x{:0>64}", taker.trim_start_matches("0x")),
        ],
        data: format!(
            "0x{}{}{}{}{}",
            word(maker_asset),
            word(taker_asset),
            word(maker_amt),
            word(taker_amt),
            word(0)
        ),
        block_number: "0x6e".into(),
        transaction_hash: "0xfeedbeef".into(),
        log_index: "0x1".into(),
    }
}

/// Venue double with scripted outcomes and call capture.
#[derive(Default)]
struct ScriptedVenue {
    executions: Mutex<Vec<QueuedOrder>>,
    cancels: Mutex<Vec<StaleSentOrder>>,
    execute_result: Mutex<Option<ExecutionResult>>,
    cancel_result: Mutex<Option<ExecutionResult>>,
}

#[async_trait]
impl VenueExecutor for ScriptedVenue {
    async fn execute(&self, order: &QueuedOrder) -> ExecutionResult {
        self.executions.lock().push(order.clone());
        self.execute_result
            .lock()
            .clone()
            .unwrap_or_else(|| ExecutionResult::sent(order.source_price, Some("open-1".into())))
    }

    async fn cancel(&self, order: &StaleSentOrder) -> ExecutionResult {
        self.cancels.lock().push(order.clone());
        self.cancel_result
            .lock()
            .clone()
            .unwrap_or_else(ExecutionResult::canceled)
    }
}

async fn age_sent_orders(db: &Db, seconds: i64) {
    let conn = db.conn().await;
    conn.execute(
        "UPDATE mirror_orders SET updated_at = updated_at - ?1 WHERE status = 'sent'",
        [seconds],
    )
    .unwrap();
}

async fn alert_count(db: &Db, event_type: &str) -> i64 {
    // Ledger writes land from the notifier task; give it a beat.
    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
    let conn = db.conn().await;
    conn.query_row(
        "SELECT COUNT(*) FROM alerts WHERE event_type = ?1",
        [event_type],
        |row| row.get(0),
    )
    .unwrap()
}

#[tokio::test]
async fn ingest_mirror_and_fill_updates_budget() {
    let db = Db::open_in_memory().unwrap();
    seed_pair(&db, 200.0, 10_000).await;

    // Source pays 25 USDC for 48 shares; watcher classifies a BUY.
    let runtime = RuntimeStore::new(db.clone(), ":memory:");
    runtime.set_state(KEY_WATCHER_LAST_BLOCK, "100").await.unwrap();
    let rpc = Arc::new(FakeRpc {
        head: 152,
        logs: vec![order_filled_log(
            SOURCE,
            COUNTERPARTY,
            0,
            7777,
            25_000_000,
            48_000_000,
        )],
    });
    let mut watcher = SourceWatcher::new(
        rpc,
        SignalStore::new(db.clone()),
        runtime,
        watcher_cfg(),
        vec!["0xC5d563A36AE78145C45a50134d48A1215220f80a".into()],
    )
    .await
    .unwrap();
    let tick = watcher.tick().await.unwrap();
    assert_eq!(tick.inserted_signals, 1);

    let signals = SignalStore::new(db.clone()).list_recent(5).await.unwrap();
    assert_eq!(signals.len(), 1);
    assert_eq!(signals[0].side, "buy");
    assert!((signals[0].source_notional_usdc - 25.0).abs() < 1e-9);
    let price = signals[0].source_price.unwrap();
    assert!((price - 25.0 / 48.0).abs() < 1e-6);

    let mut worker = build_worker(&db, Arc::new(StubExecutor));
    worker.hydrate_risk().await.unwrap();
    let summary = worker.tick().await.unwrap();
    assert_eq!(summary.created, 1);
    assert_eq!(summary.filled, 1);
    assert_eq!(summary.failed, 0);

    let orders = OrderStore::new(db.clone());
    let rows = orders.list_recent_orders(5).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, "filled");
    assert!((rows[0].adjusted_notional_usdc - 25.0).abs() < 1e-9);

    // 200 - 25 = 175 left.
    let executions = orders.list_recent_executions(5).await.unwrap();
    assert_eq!(executions.len(), 1);
    let budget = orders
        .follower_budget(executions[0].follower_wallet_id)
        .await
        .unwrap();
    assert!((budget - 175.0).abs() < 1e-9);

    assert_eq!(alert_count(&db, "filled").await, 1);
}

#[tokio::test]
async fn sell_without_inventory_blocks_silently() {
    let db = Db::open_in_memory().unwrap();
    seed_pair(&db, 200.0, 10_000).await;

    SignalStore::new(db.clone())
        .create_mock_signal(SOURCE, Side::Sell, 25.0, Some(0.5), None, Some("7777"), None)
        .await
        .unwrap();

    let mut worker = build_worker(&db, Arc::new(StubExecutor));
    worker.hydrate_risk().await.unwrap();
    let summary = worker.tick().await.unwrap();
    assert_eq!(summary.created, 0);

    let rows = OrderStore::new(db.clone()).list_recent_orders(5).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, "blocked");
    assert_eq!(
        rows[0].blocked_reason.as_deref(),
        Some("no_prior_buy_inventory_for_sell")
    );
    assert_eq!(alert_count(&db, "blocked").await, 0);
}

#[tokio::test]
async fn dust_source_notional_blocks_silently() {
    let db = Db::open_in_memory().unwrap();
    seed_pair(&db, 200.0, 10_000).await;

    SignalStore::new(db.clone())
        .create_mock_signal(SOURCE, Side::Buy, 0.40, Some(0.5), None, Some("7777"), None)
        .await
        .unwrap();

    let mut worker = build_worker(&db, Arc::new(StubExecutor));
    worker.hydrate_risk().await.unwrap();
    worker.tick().await.unwrap();

    let rows = OrderStore::new(db.clone()).list_recent_orders(5).await.unwrap();
    assert_eq!(rows[0].status, "blocked");
    assert_eq!(
        rows[0].blocked_reason.as_deref(),
        Some("source_notional_below_threshold:1.00")
    );
    assert_eq!(alert_count(&db, "blocked").await, 0);
}

#[tokio::test]
async fn empty_budget_blocks_with_alert() {
    let db = Db::open_in_memory().unwrap();
    seed_pair(&db, 0.0, 10_000).await;

    SignalStore::new(db.clone())
        .create_mock_signal(SOURCE, Side::Buy, 25.0, Some(0.5), None, Some("7777"), None)
        .await
        .unwrap();

    let mut worker = build_worker(&db, Arc::new(StubExecutor));
    worker.hydrate_risk().await.unwrap();
    worker.tick().await.unwrap();

    let rows = OrderStore::new(db.clone()).list_recent_orders(5).await.unwrap();
    assert_eq!(rows[0].status, "blocked");
    assert_eq!(
        rows[0].blocked_reason.as_deref(),
        Some("insufficient_budget_for_one_share")
    );
    assert_eq!(alert_count(&db, "blocked").await, 1);
}

#[tokio::test]
async fn buy_timeout_reprices_once_then_cancels() {
    let db = Db::open_in_memory().unwrap();
    seed_pair(&db, 200.0, 10_000).await;

    SignalStore::new(db.clone())
        .create_mock_signal(SOURCE, Side::Buy, 25.0, Some(0.52), None, Some("7777"), None)
        .await
        .unwrap();

    let venue = Arc::new(ScriptedVenue::default());
    let mut worker = build_worker(&db, venue.clone());
    worker.hydrate_risk().await.unwrap();

    // Tick 1: queued then sent (venue leaves the order resting).
    worker.tick().await.unwrap();
    let orders = OrderStore::new(db.clone());
    assert_eq!(orders.list_recent_orders(5).await.unwrap()[0].status, "sent");

    // Age past the cancel window; tick 2 cancels and requeues with the
    // reprice marker, and the same tick re-sends aggressively.
    age_sent_orders(&db, 10_000).await;
    let summary = worker.tick().await.unwrap();
    assert_eq!(summary.canceled, 0);
    assert_eq!(venue.cancels.lock().len(), 1);

    let executions = venue.executions.lock();
    assert_eq!(executions.len(), 2);
    assert!(!executions[0].is_reprice_retry());
    assert!(executions[1].is_reprice_retry());
    drop(executions);

    let row = &orders.list_recent_orders(5).await.unwrap()[0];
    assert_eq!(row.status, "sent");

    // Second timeout: no second reprice, the order cancels for good.
    age_sent_orders(&db, 10_000).await;
    let summary = worker.tick().await.unwrap();
    assert_eq!(summary.canceled, 1);
    assert_eq!(venue.cancels.lock().len(), 2);
    assert_eq!(venue.executions.lock().len(), 2);

    let row = &orders.list_recent_orders(5).await.unwrap()[0];
    assert_eq!(row.status, "canceled");
    assert_eq!(row.blocked_reason.as_deref(), Some("open_order_timeout"));
    assert_eq!(alert_count(&db, "canceled").await, 1);
}

#[tokio::test]
async fn sell_timeout_cancels_without_reprice() {
    let db = Db::open_in_memory().unwrap();
    seed_pair(&db, 200.0, 10_000).await;

    let signals = SignalStore::new(db.clone());
    let orders = OrderStore::new(db.clone());

    // Prior BUY inventory so the SELL passes the policy chain.
    let buy_signal = signals
        .create_mock_signal(SOURCE, Side::Buy, 10.0, Some(0.5), None, Some("7777"), None)
        .await
        .unwrap();
    let venue = Arc::new(ScriptedVenue::default());
    *venue.execute_result.lock() = Some(ExecutionResult::filled(
        Some("0xfill".into()),
        Some(0.5),
        Some("ref-1".into()),
    ));
    let mut worker = build_worker(&db, venue.clone());
    worker.hydrate_risk().await.unwrap();
    worker.tick().await.unwrap();
    assert_eq!(
        orders.list_recent_orders(5).await.unwrap()[0].status,
        "filled"
    );
    let _ = buy_signal;

    // Now the SELL rests and times out: straight to canceled.
    signals
        .create_mock_signal(SOURCE, Side::Sell, 10.0, Some(0.5), None, Some("7777"), None)
        .await
        .unwrap();
    *venue.execute_result.lock() = Some(ExecutionResult::sent(Some(0.5), Some("open-2".into())));
    worker.tick().await.unwrap();
    age_sent_orders(&db, 10_000).await;
    let summary = worker.tick().await.unwrap();
    assert_eq!(summary.canceled, 1);

    let row = &orders.list_recent_orders(5).await.unwrap()[0];
    assert_eq!(row.status, "canceled");
}

#[tokio::test]
async fn cancel_failure_marks_failed() {
    let db = Db::open_in_memory().unwrap();
    seed_pair(&db, 200.0, 10_000).await;

    SignalStore::new(db.clone())
        .create_mock_signal(SOURCE, Side::Buy, 25.0, Some(0.52), None, Some("7777"), None)
        .await
        .unwrap();

    let venue = Arc::new(ScriptedVenue::default());
    *venue.cancel_result.lock() = Some(ExecutionResult::failed(
        "cancel_failed_or_not_supported:not_confirmed",
    ));
    let mut worker = build_worker(&db, venue);
    worker.hydrate_risk().await.unwrap();
    worker.tick().await.unwrap();
    age_sent_orders(&db, 10_000).await;
    let summary = worker.tick().await.unwrap();
    assert_eq!(summary.cancel_failed, 1);

    let row = &OrderStore::new(db.clone()).list_recent_orders(5).await.unwrap()[0];
    assert_eq!(row.status, "failed");
    assert_eq!(
        row.blocked_reason.as_deref(),
        Some("cancel_failed_or_not_supported:not_confirmed")
    );
}

#[tokio::test]
async fn three_exec_failures_latch_kill_switch_once() {
    let db = Db::open_in_memory().unwrap();
    seed_pair(&db, 200.0, 10_000).await;

    let signals = SignalStore::new(db.clone());
    for _ in 0..3 {
        signals
            .create_mock_signal(SOURCE, Side::Buy, 25.0, Some(0.5), None, Some("7777"), None)
            .await
            .unwrap();
    }

    let venue = Arc::new(ScriptedVenue::default());
    *venue.execute_result.lock() = Some(ExecutionResult::failed("rpc_error"));
    let mut worker = build_worker(&db, venue.clone());
    worker.hydrate_risk().await.unwrap();

    let summary = worker.tick().await.unwrap();
    assert_eq!(summary.failed, 3);
    assert!(worker.risk_state().kill_switch);
    assert_eq!(worker.risk_state().consecutive_exec_failures, 3);
    assert_eq!(alert_count(&db, "kill_switch").await, 1);

    // A fresh signal is still queued but the guard refuses to send it.
    signals
        .create_mock_signal(SOURCE, Side::Buy, 25.0, Some(0.5), None, Some("7777"), None)
        .await
        .unwrap();
    let summary = worker.tick().await.unwrap();
    assert_eq!(summary.created, 1);
    assert_eq!(summary.filled, 0);
    assert_eq!(summary.failed, 0);
    assert_eq!(venue.executions.lock().len(), 3);

    let rows = OrderStore::new(db.clone()).list_recent_orders(5).await.unwrap();
    assert_eq!(rows[0].status, "queued");
    // Still exactly one kill switch alert.
    assert_eq!(alert_count(&db, "kill_switch").await, 1);
}

#[tokio::test]
async fn balance_failure_starts_pair_cooldown() {
    let db = Db::open_in_memory().unwrap();
    seed_pair(&db, 200.0, 10_000).await;

    let signals = SignalStore::new(db.clone());
    signals
        .create_mock_signal(SOURCE, Side::Buy, 25.0, Some(0.5), None, Some("7777"), None)
        .await
        .unwrap();

    let venue = Arc::new(ScriptedVenue::default());
    *venue.execute_result.lock() = Some(ExecutionResult::failed(
        "exchange_rejected:not enough balance / allowance",
    ));
    let mut worker = build_worker(&db, venue.clone());
    worker.hydrate_risk().await.unwrap();
    worker.tick().await.unwrap();

    // The next signal for this pair is blocked by the cooldown before
    // reaching the executor.
    signals
        .create_mock_signal(SOURCE, Side::Buy, 25.0, Some(0.5), None, Some("7777"), None)
        .await
        .unwrap();
    worker.tick().await.unwrap();

    let rows = OrderStore::new(db.clone()).list_recent_orders(5).await.unwrap();
    assert_eq!(rows[0].status, "blocked");
    assert_eq!(
        rows[0].blocked_reason.as_deref(),
        Some("recent_balance_or_allowance_failure_cooldown")
    );
    assert_eq!(venue.executions.lock().len(), 1);
}

#[tokio::test]
async fn observe_pair_records_without_trading() {
    let db = Db::open_in_memory().unwrap();
    PairStore::new(db.clone())
        .create_pair(&NewPair {
            source_address: SOURCE.into(),
            follower_address: FOLLOWER.into(),
            source_alias: None,
            follower_label: None,
            budget_usdc: 200.0,
            key_ref: "vault://test".into(),
            mode: "observe".into(),
            active: true,
            sizing_policy: "absolute".into(),
            min_order_usdc: 1.0,
            max_order_usdc: None,
            max_slippage_bps: 10_000,
            max_consecutive_failures: 3,
            initial_matic: 3.0,
            min_matic_alert: 0.0,
            source_portfolio_usdc: None,
            skip_key_ref_check: true,
        })
        .await
        .unwrap();

    SignalStore::new(db.clone())
        .create_mock_signal(SOURCE, Side::Buy, 25.0, Some(0.5), None, Some("7777"), None)
        .await
        .unwrap();

    let venue = Arc::new(ScriptedVenue::default());
    let mut worker = build_worker(&db, venue.clone());
    worker.hydrate_risk().await.unwrap();
    worker.tick().await.unwrap();

    let rows = OrderStore::new(db.clone()).list_recent_orders(5).await.unwrap();
    assert_eq!(rows[0].status, "blocked");
    assert_eq!(rows[0].blocked_reason.as_deref(), Some("pair_observe_mode"));
    assert!(venue.executions.lock().is_empty());
}

#[tokio::test]
async fn venue_min_size_reject_becomes_blocked_without_alert() {
    let db = Db::open_in_memory().unwrap();
    seed_pair(&db, 200.0, 10_000).await;

    SignalStore::new(db.clone())
        .create_mock_signal(SOURCE, Side::Buy, 25.0, Some(0.5), None, Some("7777"), None)
        .await
        .unwrap();

    let venue = Arc::new(ScriptedVenue::default());
    *venue.execute_result.lock() = Some(ExecutionResult::failed(
        "exchange_rejected:invalid amount for a marketable buy order. min size: $1",
    ));
    let mut worker = build_worker(&db, venue);
    worker.hydrate_risk().await.unwrap();
    worker.tick().await.unwrap();

    let rows = OrderStore::new(db.clone()).list_recent_orders(5).await.unwrap();
    assert_eq!(rows[0].status, "blocked");
    assert_eq!(rows[0].blocked_reason.as_deref(), Some("market_min_order_size"));
    assert_eq!(alert_count(&db, "failed").await, 0);
    // Venue-minimum rejects do not count toward the kill switch.
    assert_eq!(worker.risk_state().consecutive_exec_failures, 0);
}
