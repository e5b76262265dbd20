//! Polling for asynchronous resource state.
//!
//! Every control-plane resource that transitions asynchronously (agents,
//! aliases, knowledge bases, collections, ingestion jobs, functions) is waited
//! on through [`wait_for_status`]. Read-after-write settling, which has no
//! status to poll, goes through [`await_consistency`]. Deletes that return
//! while the resource is still `DELETING` are followed by
//! [`wait_until_deleted`].

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::error::{ApiError, ProvisionError};

/// Timeout and interval schedule for one polling loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollPolicy {
    /// Give up after this long
    pub timeout: Duration,
    /// Delay before the second probe
    pub interval: Duration,
    /// Multiplier applied to the delay after every probe (1.0 = fixed interval)
    pub backoff: f64,
    /// Upper bound on the delay between probes
    pub max_interval: Duration,
}

impl PollPolicy {
    /// Fixed-interval polling.
    pub const fn fixed(timeout: Duration, interval: Duration) -> Self {
        Self {
            timeout,
            interval,
            backoff: 1.0,
            max_interval: interval,
        }
    }

    /// Exponential backoff polling.
    pub const fn exponential(
        timeout: Duration,
        initial: Duration,
        backoff: f64,
        max_interval: Duration,
    ) -> Self {
        Self {
            timeout,
            interval: initial,
            backoff,
            max_interval,
        }
    }

    /// Delay to sleep after the given (zero-based) probe attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.backoff <= 1.0 {
            return self.interval;
        }
        let factor = self.backoff.powi(attempt.min(32) as i32);
        let secs = self.interval.as_secs_f64() * factor;
        let capped = secs.min(self.max_interval.as_secs_f64());
        Duration::from_secs_f64(capped)
    }
}

/// What a status probe reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusProbe {
    pub status: String,
    /// Failure reason reported alongside a failed status
    pub reason: Option<String>,
}

impl StatusProbe {
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: Option<String>) -> Self {
        self.reason = reason;
        self
    }
}

impl From<String> for StatusProbe {
    fn from(status: String) -> Self {
        Self::new(status)
    }
}

impl From<&str> for StatusProbe {
    fn from(status: &str) -> Self {
        Self::new(status)
    }
}

/// Target of a status wait.
#[derive(Debug, Clone, Copy)]
pub struct StatusTarget<'a> {
    /// Human-readable resource kind used in logs and errors
    pub resource: &'a str,
    /// Resource identifier used in logs and errors
    pub id: &'a str,
    /// Status that ends the wait successfully
    pub target: &'a str,
    /// Statuses that end the wait with a failure
    pub failed: &'a [&'a str],
}

/// Statuses that are terminal failures for most resources.
pub const FAILED_STATUSES: &[&str] = &["FAILED", "DELETE_FAILED", "CREATE_FAILED"];

/// Status of a resource whose deletion is still in flight.
pub const DELETING: &str = "DELETING";

/// Poll `probe` until it reports `target.target`, a failed status, or the
/// policy's timeout elapses.
///
/// Control-plane errors raised by the probe abort the wait.
pub async fn wait_for_status<F, Fut, S>(
    target: StatusTarget<'_>,
    policy: &PollPolicy,
    mut probe: F,
) -> Result<(), ProvisionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<S, ApiError>>,
    S: Into<StatusProbe>,
{
    let started = Instant::now();
    let mut attempt = 0u32;

    loop {
        let observed: StatusProbe = probe().await?.into();

        if observed.status == target.target {
            debug!(
                resource = target.resource,
                id = target.id,
                status = %observed.status,
                "Reached target status"
            );
            return Ok(());
        }

        if target.failed.contains(&observed.status.as_str()) {
            return Err(ProvisionError::FailedState {
                resource: target.resource.to_string(),
                id: target.id.to_string(),
                status: observed.status,
                reason: observed.reason,
            });
        }

        let elapsed = started.elapsed();
        if elapsed >= policy.timeout {
            return Err(ProvisionError::Timeout {
                resource: target.resource.to_string(),
                id: target.id.to_string(),
                target: target.target.to_string(),
                elapsed,
            });
        }

        debug!(
            resource = target.resource,
            id = target.id,
            status = %observed.status,
            target = target.target,
            "Waiting for status"
        );

        let delay = policy
            .delay_for(attempt)
            .min(policy.timeout.saturating_sub(elapsed));
        tokio::time::sleep(delay).await;
        attempt = attempt.saturating_add(1);
    }
}

/// Wait for read-after-write consistency: poll `probe` until it yields a
/// value.
///
/// Used where a mutating call has no status to poll but the written state is
/// not immediately visible (freshly created roles, attached policies).
pub async fn await_consistency<F, Fut, T>(
    what: &str,
    policy: &PollPolicy,
    mut probe: F,
) -> Result<T, ProvisionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, ApiError>>,
{
    let started = Instant::now();
    let mut attempt = 0u32;

    loop {
        if let Some(value) = probe().await? {
            return Ok(value);
        }

        let elapsed = started.elapsed();
        if elapsed >= policy.timeout {
            return Err(ProvisionError::Timeout {
                resource: "consistency".to_string(),
                id: what.to_string(),
                target: "visible".to_string(),
                elapsed,
            });
        }

        debug!(what, attempt, "Waiting for consistency");
        let delay = policy
            .delay_for(attempt)
            .min(policy.timeout.saturating_sub(elapsed));
        tokio::time::sleep(delay).await;
        attempt = attempt.saturating_add(1);
    }
}

/// Poll `exists` until the resource is gone.
pub async fn wait_until_deleted<F, Fut>(
    resource: &str,
    id: &str,
    policy: &PollPolicy,
    mut exists: F,
) -> Result<(), ProvisionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, ApiError>>,
{
    let what = format!("{} {}", resource, id);
    let gone = await_consistency(&what, policy, || {
        let probe = exists();
        async move { Ok::<_, ApiError>((!probe.await?).then_some(())) }
    })
    .await;
    match gone {
        Err(ProvisionError::Timeout { elapsed, .. }) => Err(ProvisionError::Timeout {
            resource: resource.to_string(),
            id: id.to_string(),
            target: "deleted".to_string(),
            elapsed,
        }),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn quick() -> PollPolicy {
        PollPolicy::fixed(Duration::from_millis(200), Duration::from_millis(1))
    }

    #[test]
    fn exponential_delay_is_capped() {
        let policy = PollPolicy::exponential(
            Duration::from_secs(60),
            Duration::from_secs(1),
            2.0,
            Duration::from_secs(10),
        );
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(4), Duration::from_secs(10));
        assert_eq!(policy.delay_for(40), Duration::from_secs(10));
    }

    #[test]
    fn fixed_delay_never_changes() {
        let policy = PollPolicy::fixed(Duration::from_secs(300), Duration::from_secs(5));
        assert_eq!(policy.delay_for(0), Duration::from_secs(5));
        assert_eq!(policy.delay_for(9), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn reaches_target_after_transitions() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let target = StatusTarget {
            resource: "agent",
            id: "A1",
            target: "PREPARED",
            failed: FAILED_STATUSES,
        };

        wait_for_status(target, &quick(), || {
            let n = c.fetch_add(1, Ordering::SeqCst);
            async move {
                Ok::<_, ApiError>(if n < 2 { "PREPARING" } else { "PREPARED" })
            }
        })
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failed_status_aborts() {
        let target = StatusTarget {
            resource: "knowledge base",
            id: "KB1",
            target: "ACTIVE",
            failed: FAILED_STATUSES,
        };

        let err = wait_for_status(target, &quick(), || async {
            Ok::<_, ApiError>(StatusProbe::new("FAILED").with_reason(Some("quota".into())))
        })
        .await
        .unwrap_err();

        match err {
            ProvisionError::FailedState { status, reason, .. } => {
                assert_eq!(status, "FAILED");
                assert_eq!(reason.as_deref(), Some("quota"));
            }
            other => panic!("expected FailedState, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn never_reaching_target_times_out() {
        let target = StatusTarget {
            resource: "collection",
            id: "c1",
            target: "ACTIVE",
            failed: FAILED_STATUSES,
        };
        let policy = PollPolicy::fixed(Duration::from_millis(20), Duration::from_millis(2));

        let err = wait_for_status(target, &policy, || async {
            Ok::<_, ApiError>("CREATING")
        })
        .await
        .unwrap_err();

        assert!(matches!(err, ProvisionError::Timeout { .. }));
    }

    #[tokio::test]
    async fn probe_errors_propagate() {
        let target = StatusTarget {
            resource: "agent",
            id: "A1",
            target: "PREPARED",
            failed: FAILED_STATUSES,
        };

        let err = wait_for_status(target, &quick(), || async {
            Err::<String, _>(ApiError::not_found("get_agent", "gone"))
        })
        .await
        .unwrap_err();

        assert!(matches!(err, ProvisionError::Api(ref e) if e.is_not_found()));
    }

    #[tokio::test]
    async fn consistency_returns_first_visible_value() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let value = await_consistency("role visible", &quick(), || {
            let n = c.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, ApiError>(if n < 3 { None } else { Some(n) }) }
        })
        .await
        .unwrap();

        assert_eq!(value, 3);
    }

    #[tokio::test]
    async fn deletion_wait_ends_when_resource_disappears() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        wait_until_deleted("collection", "c1", &quick(), || {
            let n = c.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, ApiError>(n < 2) }
        })
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn lingering_resource_times_out_as_not_deleted() {
        let policy = PollPolicy::fixed(Duration::from_millis(20), Duration::from_millis(2));
        let err = wait_until_deleted("agent", "A1", &policy, || async { Ok::<_, ApiError>(true) })
            .await
            .unwrap_err();
        match err {
            ProvisionError::Timeout { resource, target, .. } => {
                assert_eq!(resource, "agent");
                assert_eq!(target, "deleted");
            }
            other => panic!("expected Timeout, got {other:?}"),
        }
    }
}
