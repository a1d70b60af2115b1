//! Venue execution adapters.
//!
//! One trait, two implementations: a deterministic stub for paper runs and
//! tests, and the live CLOB adapter. The worker owns the 25s submit budget;
//! when it elapses the order is left `sent` for the reconciler.

pub mod book;
pub mod clob;
pub mod price;
pub mod signing;
pub mod stub;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{ClobConfig, WorkerConfig};
use crate::models::{QueuedOrder, StaleSentOrder};
use crate::store::VaultStore;

pub use clob::ClobExecutor;
pub use stub::StubExecutor;

pub const EXECUTE_TIMEOUT_SECS: u64 = 25;
pub const CANCEL_TIMEOUT_SECS: u64 = 10;

/// Terminal-ish outcome of one executor attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    /// Venue confirmed an onchain fill.
    Filled,
    /// Venue accepted the order but it rests open.
    Sent,
    Failed,
    Canceled,
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub outcome: ExecOutcome,
    pub fail_reason: Option<String>,
    pub chain_tx_hash: Option<String>,
    pub executed_price: Option<f64>,
    pub executor_ref: Option<String>,
}

impl ExecutionResult {
    pub fn filled(tx_hash: Option<String>, price: Option<f64>, exec_ref: Option<String>) -> Self {
        Self {
            outcome: ExecOutcome::Filled,
            fail_reason: None,
            chain_tx_hash: tx_hash,
            executed_price: price,
            executor_ref: exec_ref,
        }
    }

    pub fn sent(price: Option<f64>, exec_ref: Option<String>) -> Self {
        Self {
            outcome: ExecOutcome::Sent,
            fail_reason: None,
            chain_tx_hash: None,
            executed_price: price,
            executor_ref: exec_ref,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            outcome: ExecOutcome::Failed,
            fail_reason: Some(reason.into()),
            chain_tx_hash: None,
            executed_price: None,
            executor_ref: None,
        }
    }

    pub fn canceled() -> Self {
        Self {
            outcome: ExecOutcome::Canceled,
            fail_reason: None,
            chain_tx_hash: None,
            executed_price: None,
            executor_ref: None,
        }
    }
}

#[async_trait]
pub trait VenueExecutor: Send + Sync {
    async fn execute(&self, order: &QueuedOrder) -> ExecutionResult;
    async fn cancel(&self, order: &StaleSentOrder) -> ExecutionResult;
}

/// Pick the executor for the configured mode. Anything but "live" gets the
/// stub, matching the safe default.
pub fn build_executor(
    worker_cfg: &WorkerConfig,
    clob_cfg: &ClobConfig,
    vault: VaultStore,
    vault_passphrase: Option<String>,
) -> Arc<dyn VenueExecutor> {
    if worker_cfg.executor_mode == "live" {
        Arc::new(ClobExecutor::new(clob_cfg.clone(), vault, vault_passphrase))
    } else {
        Arc::new(StubExecutor)
    }
}
