//! Stale open-order reconciliation.
//!
//! `sent` orders that outlive the cancel window are canceled at the venue.
//! A canceled BUY gets one aggressive retry: back to the queue flagged
//! `reprice_after_timeout`, which the executor prices a dime above source.
//! Everything else terminates as canceled or failed with an alert.

use anyhow::Result;
use std::time::Duration;
use tokio::time::timeout;
use tracing::warn;

use crate::executor::{ExecOutcome, CANCEL_TIMEOUT_SECS};
use crate::models::{OrderStatus, Side};
use crate::notifier::{canceled_message, failed_message, AlertKind};
use crate::worker::Worker;

impl Worker {
    /// Returns (canceled, cancel_failed) counts for the tick log line.
    pub(crate) async fn reconcile_stale(&mut self) -> Result<(u32, u32)> {
        let stale = self
            .orders
            .list_stale_sent(self.cfg.open_order_cancel_after_seconds, self.cfg.batch_limit)
            .await?;
        let mut canceled = 0u32;
        let mut failed = 0u32;

        for order in stale {
            let result = match timeout(
                Duration::from_secs(CANCEL_TIMEOUT_SECS),
                self.executor.cancel(&order),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => {
                    warn!(order_id = order.id, "cancel timed out");
                    crate::executor::ExecutionResult::failed(
                        "cancel_failed_or_not_supported:timeout",
                    )
                }
            };

            if result.outcome == ExecOutcome::Canceled {
                if order.side == Side::Buy && !order.already_repriced() {
                    // One-shot retry: clear the venue ref and let the next
                    // executor pass reprice aggressively.
                    self.orders.set_executor_ref(order.id, "").await?;
                    self.orders
                        .mark_status(order.id, OrderStatus::Queued, Some("reprice_after_timeout"))
                        .await?;
                } else {
                    self.orders
                        .mark_status(order.id, OrderStatus::Canceled, Some("open_order_timeout"))
                        .await?;
                    self.notifier
                        .send(
                            AlertKind::Canceled,
                            canceled_message(
                                order.id,
                                order.pair_id,
                                order.follower_wallet_id,
                                order.side.as_str(),
                                &format!(
                                    "open_order_timeout>{}s",
                                    self.cfg.open_order_cancel_after_seconds
                                ),
                            ),
                        )
                        .await;
                    canceled += 1;
                }
            } else {
                let reason = result
                    .fail_reason
                    .unwrap_or_else(|| "cancel_failed_or_not_supported".to_string());
                self.orders
                    .mark_status(order.id, OrderStatus::Failed, Some(&reason))
                    .await?;
                self.notifier
                    .send(
                        AlertKind::Failed,
                        failed_message(
                            order.id,
                            order.pair_id,
                            order.follower_wallet_id,
                            order.side.as_str(),
                            order.outcome.as_deref(),
                            0.0,
                            &reason,
                            None,
                            None,
                        ),
                    )
                    .await;
                failed += 1;
            }
        }

        Ok((canceled, failed))
    }
}
