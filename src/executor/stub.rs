//! Deterministic mock venue.
//!
//! Outcomes are a pure function of the order row, so paper runs and tests
//! are reproducible: a synthetic slippage draw against the pair limit, a
//! budget check, and a periodic simulated RPC failure.

use async_trait::async_trait;

use super::{ExecOutcome, ExecutionResult, VenueExecutor};
use crate::models::{QueuedOrder, StaleSentOrder};

pub struct StubExecutor;

#[async_trait]
impl VenueExecutor for StubExecutor {
    async fn execute(&self, order: &QueuedOrder) -> ExecutionResult {
        let simulated_slippage_bps = 100 + ((order.id * 37) % 401);
        if simulated_slippage_bps > order.max_slippage_bps {
            return ExecutionResult::failed("slippage_exceeded");
        }
        if order.adjusted_notional_usdc > order.budget_usdc {
            return ExecutionResult::failed("insufficient_balance");
        }
        if order.id % 11 == 0 {
            return ExecutionResult::failed("rpc_error");
        }
        ExecutionResult {
            outcome: ExecOutcome::Filled,
            fail_reason: None,
            chain_tx_hash: Some(format!("stub-order-{}", order.id)),
            executed_price: order.source_price,
            executor_ref: Some(format!("stub-ref-{}", order.id)),
        }
    }

    async fn cancel(&self, _order: &StaleSentOrder) -> ExecutionResult {
        ExecutionResult::canceled()
    }
}
