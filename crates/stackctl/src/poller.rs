//! Readiness polling with fixed interval and deadline budgets.
//!
//! Cloud resources report `Creating` for anywhere from seconds (subnets) to
//! twenty minutes (search collections), so every asynchronous resource gets
//! a budget tuned to its worst observed activation time. Transient probe
//! errors are tolerated and simply consume a tick; a resource that reports
//! `Failed` aborts the wait immediately.

use crate::provider::{CloudProvider, ProviderResult};
use stack_common::{ProviderError, ResourceKind, ResourceState};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// Interval between probes and the total time allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollBudget {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollBudget {
    pub const fn new(interval_secs: u64, timeout_secs: u64) -> Self {
        Self {
            interval: Duration::from_secs(interval_secs),
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

pub const SUBNET: PollBudget = PollBudget::new(2, 60);
pub const NAT_GATEWAY: PollBudget = PollBudget::new(10, 600);
pub const COLLECTION: PollBudget = PollBudget::new(10, 1200);
pub const KNOWLEDGE_BASE: PollBudget = PollBudget::new(10, 600);
pub const INSTANCE: PollBudget = PollBudget::new(10, 600);
pub const AGENT: PollBudget = PollBudget::new(10, 300);
pub const COMMAND: PollBudget = PollBudget::new(10, 3600);
pub const APP_HEALTH: PollBudget = PollBudget::new(15, 900);

/// One observation from a probe.
pub enum PollOutcome<T> {
    Ready(T),
    Pending,
    /// Terminal failure; gives up without waiting out the budget.
    Failed(String),
}

/// Probe until `Ready`, the budget runs out, or the resource fails.
pub async fn await_ready<T, F, Fut>(
    what: &str,
    budget: PollBudget,
    mut probe: F,
) -> ProviderResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ProviderResult<PollOutcome<T>>>,
{
    let deadline = Instant::now() + budget.timeout;
    loop {
        match probe().await {
            Ok(PollOutcome::Ready(value)) => {
                debug!(what, "ready");
                return Ok(value);
            }
            Ok(PollOutcome::Pending) => {
                debug!(what, "still pending");
            }
            Ok(PollOutcome::Failed(reason)) => {
                return Err(ProviderError::other(format!(
                    "{what} entered a failed state: {reason}"
                )));
            }
            // Transient hiccups consume a tick rather than the whole wait.
            Err(err) if err.is(stack_common::ErrorClass::Transient) => {
                warn!(what, error = %err, "transient error while polling");
            }
            Err(err) => return Err(err),
        }
        if Instant::now() + budget.interval > deadline {
            return Err(ProviderError::timeout(format!(
                "{what} was not ready within {}s",
                budget.timeout.as_secs()
            )));
        }
        sleep(budget.interval).await;
    }
}

/// Wait for a resource's lifecycle state to reach `Ready`.
pub async fn await_state(
    provider: &dyn CloudProvider,
    kind: ResourceKind,
    id: &str,
    budget: PollBudget,
) -> ProviderResult<()> {
    let what = format!("{kind} {id}");
    await_ready(&what, budget, || async move {
        Ok(match provider.resource_state(kind, id).await? {
            ResourceState::Ready => PollOutcome::Ready(()),
            ResourceState::Failed => {
                PollOutcome::Failed("provider reports failed".into())
            }
            ResourceState::Creating | ResourceState::Absent => PollOutcome::Pending,
        })
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use stack_common::ErrorClass;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_ready_on_first_probe_returns_immediately() {
        let value = await_ready("thing", SUBNET, || async {
            Ok(PollOutcome::Ready(7))
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_then_ready() {
        let polls = AtomicU32::new(0);
        let polls_ref = &polls;
        let value = await_ready("thing", NAT_GATEWAY, || async move {
            if polls_ref.fetch_add(1, Ordering::SeqCst) < 3 {
                Ok(PollOutcome::Pending)
            } else {
                Ok(PollOutcome::Ready("done"))
            }
        })
        .await
        .unwrap();
        assert_eq!(value, "done");
        assert_eq!(polls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhaustion_is_a_timeout() {
        let err = await_ready::<(), _, _>("thing", SUBNET, || async {
            Ok(PollOutcome::Pending)
        })
        .await
        .unwrap_err();
        assert!(err.is(ErrorClass::Timeout));
        assert!(err.message.contains("thing"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_state_aborts_before_deadline() {
        let start = Instant::now();
        let err = await_ready::<(), _, _>("thing", COLLECTION, || async {
            Ok(PollOutcome::Failed("internal".into()))
        })
        .await
        .unwrap_err();
        assert!(err.is(ErrorClass::Other));
        assert!(start.elapsed() < COLLECTION.timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_probe_errors_are_tolerated() {
        let polls = AtomicU32::new(0);
        let polls_ref = &polls;
        let value = await_ready("thing", SUBNET, || async move {
            match polls_ref.fetch_add(1, Ordering::SeqCst) {
                0 => Err(stack_common::ProviderError::transient("blip")),
                _ => Ok(PollOutcome::Ready(())),
            }
        })
        .await;
        assert!(value.is_ok());
    }
}
