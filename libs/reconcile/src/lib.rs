//! Reconciliation loop primitives.
//!
//! Helpers shared by the manager's per-volume reconcilers and by the test
//! support library that observes them from outside:
//!
//! - **Convergence**: a coarse summary of whether a volume has settled.
//! - **Retry tracking**: bounded automatic retries per resource.
//! - **Polling**: bounded, advisory waits at the API boundary.
//! - **Progress monitoring**: progress values must never go backwards.
//!
//! # Invariants
//!
//! - All operations are idempotent
//! - Timeouts belong to the observer; nothing here aborts a transition

mod poll;
mod progress;

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use poll::{
    poll_until, PollPolicy, RETRY_BACKUP_COUNTS, RETRY_COMMAND_COUNT, RETRY_COUNTS,
    RETRY_INTERVAL,
};
pub use progress::ProgressMonitor;

/// Reconciliation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// Timeout waiting for convergence.
    #[error("timeout after {elapsed:?} ({attempts} attempts) waiting for {resource}")]
    Timeout {
        resource: String,
        attempts: u32,
        elapsed: Duration,
    },

    /// A progress value went backwards between two observations.
    #[error("progress for {key} regressed from {previous} to {current}")]
    ProgressRegressed {
        key: String,
        previous: u32,
        current: u32,
    },
}

/// Convergence status for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceStatus {
    /// Resource has converged (current matches desired).
    Converged,

    /// Resource is converging (work is in flight).
    Converging,

    /// Resource has diverged (requires intervention).
    Diverged,

    /// Status is unknown (insufficient data).
    #[default]
    Unknown,
}

impl ConvergenceStatus {
    /// Returns true if the resource has converged.
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }

    /// Returns true if the resource is still converging.
    pub fn is_converging(&self) -> bool {
        matches!(self, Self::Converging)
    }
}

/// Tracks bounded retries per resource key.
///
/// A resource is exhausted once it fails more than `max_retries` times inside
/// one `window`; the count resets when the window expires.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    /// Maximum retries per resource.
    max_retries: u32,

    /// Retry window duration.
    window: Duration,

    /// Tracked failures: resource_key -> (count, first_failure_time).
    failures: BTreeMap<String, (u32, Instant)>,
}

impl RetryTracker {
    /// Create a new retry tracker.
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure for a resource.
    ///
    /// Returns true if retries are exhausted.
    pub fn record_failure(&mut self, resource_key: &str) -> bool {
        let now = Instant::now();

        let (count, first) = self
            .failures
            .entry(resource_key.to_string())
            .or_insert((0, now));

        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count > self.max_retries
    }

    /// Check if retries are exhausted for a resource.
    pub fn is_exhausted(&self, resource_key: &str) -> bool {
        let Some((count, first)) = self.failures.get(resource_key) else {
            return false;
        };

        if Instant::now().duration_since(*first) > self.window {
            return false;
        }

        *count > self.max_retries
    }

    /// Number of failures recorded inside the current window.
    pub fn failures(&self, resource_key: &str) -> u32 {
        self.failures
            .get(resource_key)
            .map(|(count, _)| *count)
            .unwrap_or(0)
    }

    /// Clear failure tracking for a resource (on success).
    pub fn clear(&mut self, resource_key: &str) {
        self.failures.remove(resource_key);
    }

    /// Prune expired entries.
    pub fn prune(&mut self) {
        let now = Instant::now();
        self.failures
            .retain(|_, (_, first)| now.duration_since(*first) <= self.window);
    }
}

impl Default for RetryTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, DEFAULT_RETRY_WINDOW)
    }
}

/// Default reconciliation interval for volume actors.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_millis(500);

/// Default maximum automatic retries.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default retry window.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(600);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_tracker() {
        let mut tracker = RetryTracker::new(3, Duration::from_secs(60));

        assert!(!tracker.record_failure("vol-a/rebuild"));
        assert!(!tracker.record_failure("vol-a/rebuild"));
        assert!(!tracker.record_failure("vol-a/rebuild"));
        assert!(tracker.record_failure("vol-a/rebuild"));

        assert!(tracker.is_exhausted("vol-a/rebuild"));
        assert!(!tracker.is_exhausted("vol-b/rebuild"));
        assert_eq!(tracker.failures("vol-a/rebuild"), 4);

        tracker.clear("vol-a/rebuild");
        assert!(!tracker.is_exhausted("vol-a/rebuild"));
        assert_eq!(tracker.failures("vol-a/rebuild"), 0);
    }

    #[test]
    fn test_retry_tracker_window_expiry() {
        let mut tracker = RetryTracker::new(0, Duration::from_millis(0));
        assert!(tracker.record_failure("key"));
        std::thread::sleep(Duration::from_millis(2));
        assert!(!tracker.is_exhausted("key"));
        tracker.prune();
        assert_eq!(tracker.failures("key"), 0);
    }

    #[test]
    fn test_convergence_status_serde() {
        assert_eq!(
            serde_json::to_string(&ConvergenceStatus::Converging).unwrap_or_default(),
            "\"converging\""
        );
        assert!(ConvergenceStatus::Converged.is_converged());
        assert!(!ConvergenceStatus::Diverged.is_converging());
    }
}
