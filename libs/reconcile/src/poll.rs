//! Bounded polling for eventually-consistent status.

use std::future::Future;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::ReconcileError;

/// Default number of polling attempts for volume state transitions.
pub const RETRY_COUNTS: u32 = 300;

/// Default delay between polling attempts.
pub const RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Attempts for backup and restore, which take longer than state changes.
pub const RETRY_BACKUP_COUNTS: u32 = 600;

/// Attempts for one-shot commands that may race with process startup.
pub const RETRY_COMMAND_COUNT: u32 = 3;

/// How long and how often to poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Number of checks before giving up.
    pub attempts: u32,

    /// Delay between checks.
    pub interval: Duration,
}

impl PollPolicy {
    pub const fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }

    /// Policy for backup and restore progress.
    pub const fn backup() -> Self {
        Self::new(RETRY_BACKUP_COUNTS, RETRY_INTERVAL)
    }

    /// Upper bound on the time this policy may wait.
    pub fn budget(&self) -> Duration {
        self.interval.saturating_mul(self.attempts)
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::new(RETRY_COUNTS, RETRY_INTERVAL)
    }
}

/// Probes until it yields `Some`, or fails after `policy.attempts` tries.
///
/// A check error aborts the wait immediately; `Ok(None)` means "not yet".
/// The check runs at least once even when `attempts` is zero.
pub async fn poll_until<T, E, F, Fut>(
    policy: &PollPolicy,
    resource: &str,
    mut check: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
    E: From<ReconcileError>,
{
    let started = Instant::now();
    let attempts = policy.attempts.max(1);

    for attempt in 1..=attempts {
        if let Some(value) = check().await? {
            return Ok(value);
        }
        if attempt < attempts {
            tokio::time::sleep(policy.interval).await;
        }
    }

    debug!(resource, attempts, "Polling gave up");
    Err(ReconcileError::Timeout {
        resource: resource.to_string(),
        attempts,
        elapsed: started.elapsed(),
    }
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_poll_until_returns_first_ready_value() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = PollPolicy::new(10, Duration::from_millis(1));

        let value: Result<u32, ReconcileError> = poll_until(&policy, "counter", move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok((n >= 3).then_some(n))
        })
        .await;

        assert_eq!(value.unwrap(), 3);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_poll_until_times_out() {
        let policy = PollPolicy::new(4, Duration::from_millis(1));
        let result: Result<(), ReconcileError> =
            poll_until(&policy, "never", || async { Ok(None) }).await;

        match result {
            Err(ReconcileError::Timeout {
                resource, attempts, ..
            }) => {
                assert_eq!(resource, "never");
                assert_eq!(attempts, 4);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_poll_until_check_error_aborts() {
        #[derive(Debug, PartialEq)]
        enum ProbeError {
            Boom,
            Reconcile(ReconcileError),
        }
        impl From<ReconcileError> for ProbeError {
            fn from(err: ReconcileError) -> Self {
                ProbeError::Reconcile(err)
            }
        }

        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = PollPolicy::new(10, Duration::from_millis(1));
        let result: Result<(), ProbeError> = poll_until(&policy, "boom", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ProbeError::Boom)
        })
        .await;

        assert_eq!(result, Err(ProbeError::Boom));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_default_policy_budget() {
        let policy = PollPolicy::default();
        assert_eq!(policy.attempts, RETRY_COUNTS);
        assert_eq!(policy.budget(), Duration::from_secs(150));
        assert_eq!(PollPolicy::backup().attempts, RETRY_BACKUP_COUNTS);
    }
}
