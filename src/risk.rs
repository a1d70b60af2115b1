//! Process-wide risk guard.
//!
//! A value threaded through the worker loop, never a global: pre-trade
//! checks gate every executor call, post-trade transitions track losses and
//! executor failures, and the kill switch latches until an operator clears
//! it. Alert deduplication for noisy blocked reasons lives here too.

use std::collections::HashMap;

/// Hard limits, fixed at startup.
#[derive(Debug, Clone)]
pub struct RiskLimits {
    pub max_order_usd: f64,
    pub max_daily_loss_pct: f64,
    pub max_consecutive_losses: u32,
    pub max_consecutive_exec_failures: u32,
}

/// Mutable counters, hydrated at startup from recent executions.
#[derive(Debug, Clone, Default)]
pub struct RiskState {
    pub daily_start_equity_usd: f64,
    pub running_pnl_usd: f64,
    pub consecutive_losses: u32,
    pub consecutive_exec_failures: u32,
    pub manual_pause: bool,
    pub kill_switch: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiskDecision {
    pub allowed: bool,
    pub reason: &'static str,
}

impl RiskDecision {
    fn deny(reason: &'static str) -> Self {
        Self {
            allowed: false,
            reason,
        }
    }

    fn allow() -> Self {
        Self {
            allowed: true,
            reason: "risk_ok",
        }
    }
}

fn daily_loss_pct(state: &RiskState) -> f64 {
    if state.running_pnl_usd >= 0.0 {
        return 0.0;
    }
    state.running_pnl_usd.abs() / state.daily_start_equity_usd * 100.0
}

/// First matching rule denies; otherwise the trade may proceed.
pub fn check_pre_trade(order_usd: f64, limits: &RiskLimits, state: &RiskState) -> RiskDecision {
    if state.kill_switch {
        return RiskDecision::deny("kill_switch_on");
    }
    if state.manual_pause {
        return RiskDecision::deny("manual_pause_on");
    }
    if order_usd <= 0.0 {
        return RiskDecision::deny("invalid_order_size");
    }
    if order_usd > limits.max_order_usd {
        return RiskDecision::deny("order_above_max");
    }
    if state.consecutive_losses >= limits.max_consecutive_losses {
        return RiskDecision::deny("max_consecutive_losses_reached");
    }
    if state.consecutive_exec_failures >= limits.max_consecutive_exec_failures {
        return RiskDecision::deny("max_consecutive_exec_failures_reached");
    }
    if state.daily_start_equity_usd <= 0.0 {
        return RiskDecision::deny("invalid_daily_start_equity");
    }
    if daily_loss_pct(state) >= limits.max_daily_loss_pct {
        return RiskDecision::deny("max_daily_loss_reached");
    }
    RiskDecision::allow()
}

impl RiskState {
    /// A fill resets the executor-failure streak and, when a realized pnl is
    /// known, rolls it into the loss counters.
    pub fn record_fill(&mut self, realized_pnl_usd: Option<f64>) {
        self.consecutive_exec_failures = 0;
        if let Some(pnl) = realized_pnl_usd {
            self.running_pnl_usd += pnl;
            if pnl < 0.0 {
                self.consecutive_losses += 1;
            } else {
                self.consecutive_losses = 0;
            }
        }
    }

    /// Returns true exactly once: when this failure latches the kill switch.
    pub fn record_exec_failure(&mut self, limits: &RiskLimits) -> bool {
        self.consecutive_exec_failures += 1;
        if !self.kill_switch && self.consecutive_exec_failures >= limits.max_consecutive_exec_failures
        {
            self.kill_switch = true;
            return true;
        }
        false
    }
}

/// Per-(pair, reason) cooldown for noisy blocked alerts. Tracks how many
/// repeats were suppressed since the last delivery.
#[derive(Debug, Default)]
pub struct BlockAlertDeduper {
    state: HashMap<(i64, String), (i64, i64)>,
}

pub enum BlockAlertVerdict {
    /// Deliver, mentioning how many repeats were swallowed meanwhile.
    Deliver { suppressed_since_last: i64 },
    Suppress,
}

impl BlockAlertDeduper {
    pub fn check(
        &mut self,
        pair_id: i64,
        reason: &str,
        now: i64,
        cooldown_seconds: i64,
    ) -> BlockAlertVerdict {
        if cooldown_seconds <= 0 {
            return BlockAlertVerdict::Deliver {
                suppressed_since_last: 0,
            };
        }
        let key = (pair_id, reason.to_string());
        let (last_sent_at, suppressed) = self.state.get(&key).copied().unwrap_or((0, 0));
        if last_sent_at > 0 && now - last_sent_at < cooldown_seconds {
            self.state.insert(key, (last_sent_at, suppressed + 1));
            return BlockAlertVerdict::Suppress;
        }
        self.state.insert(key, (now, 0));
        BlockAlertVerdict::Deliver {
            suppressed_since_last: suppressed,
        }
    }
}
