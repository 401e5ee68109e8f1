//! Monotonic progress observation.

use std::collections::BTreeMap;

use crate::ReconcileError;

/// Remembers the last progress seen per key and rejects regressions.
///
/// Keys are usually replica names: each replica reports its own rebuild,
/// restore or purge progress and those values must never decrease.
#[derive(Debug, Clone, Default)]
pub struct ProgressMonitor {
    last: BTreeMap<String, u32>,
}

impl ProgressMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an observation.
    pub fn observe(&mut self, key: &str, progress: u32) -> Result<(), ReconcileError> {
        match self.last.get_mut(key) {
            Some(previous) if progress < *previous => Err(ReconcileError::ProgressRegressed {
                key: key.to_string(),
                previous: *previous,
                current: progress,
            }),
            Some(previous) => {
                *previous = progress;
                Ok(())
            }
            None => {
                self.last.insert(key.to_string(), progress);
                Ok(())
            }
        }
    }

    /// Last progress observed for `key`.
    pub fn last(&self, key: &str) -> Option<u32> {
        self.last.get(key).copied()
    }

    /// Number of distinct keys observed.
    pub fn len(&self) -> usize {
        self.last.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case(&[0, 10, 10, 100], true)]
    #[case(&[5, 50, 40], false)]
    #[case(&[100, 0], false)]
    fn test_observe_sequence(#[case] sequence: &[u32], #[case] ok: bool) {
        let mut monitor = ProgressMonitor::new();
        let result = sequence
            .iter()
            .try_for_each(|p| monitor.observe("r-1", *p));
        assert_eq!(result.is_ok(), ok);
    }

    #[test]
    fn test_keys_are_independent() {
        let mut monitor = ProgressMonitor::new();
        monitor.observe("r-1", 80).unwrap();
        monitor.observe("r-2", 10).unwrap();
        assert_eq!(monitor.last("r-1"), Some(80));
        assert_eq!(monitor.last("r-2"), Some(10));
        assert_eq!(monitor.len(), 2);
    }

    proptest! {
        #[test]
        fn prop_sorted_sequences_never_regress(mut values in proptest::collection::vec(0u32..=100, 1..20)) {
            values.sort_unstable();
            let mut monitor = ProgressMonitor::new();
            for v in &values {
                prop_assert!(monitor.observe("r", *v).is_ok());
            }
            prop_assert_eq!(monitor.last("r"), values.last().copied());
        }
    }
}
