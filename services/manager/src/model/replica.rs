//! Replica record and failure detection.

use chrono::{DateTime, Utc};
use holdfast_events::ReplicaMode;
use holdfast_id::{NodeName, ReplicaId, VolumeName};
use serde::{Deserialize, Serialize};

/// One data copy of a volume on a specific node and disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Replica {
    pub name: ReplicaId,
    pub volume_name: VolumeName,
    pub host_id: NodeName,
    pub disk_name: String,
    pub disk_path: String,
    pub data_path: String,
    /// Volume size this replica was provisioned for.
    pub size: u64,
    /// Instance manager owning the process; kept after a crash so the
    /// failure can be cross-checked against that manager's live set.
    pub instance_manager_name: String,
    /// Mode reported by the engine; `None` while the volume is detached.
    pub mode: Option<ReplicaMode>,
    pub running: bool,
    pub failed_at: Option<DateTime<Utc>>,
    /// Last time the replica was in sync; never set for a replica that
    /// has not finished its first rebuild.
    pub healthy_at: Option<DateTime<Utc>>,
}

impl Replica {
    pub fn is_failed(&self) -> bool {
        self.failed_at.is_some()
    }

    /// Serving reads and writes right now.
    pub fn is_healthy_rw(&self) -> bool {
        !self.is_failed() && self.running && self.mode == Some(ReplicaMode::ReadWrite)
    }

    /// Whether this replica is definitively failed.
    ///
    /// A replica only counts as failed when it is not running and has a
    /// `failedAt` timestamp. If it still references an instance manager, that
    /// manager's live instance set (when known) must no longer contain it;
    /// with the set unknown the failure is not yet confirmed.
    pub fn is_definitively_failed(&self, live_instances: Option<&[String]>) -> bool {
        if self.running || self.failed_at.is_none() {
            return false;
        }
        if self.instance_manager_name.is_empty() {
            return true;
        }
        match live_instances {
            Some(live) => {
                let name = self.name.to_string();
                !live.iter().any(|instance| *instance == name)
            }
            None => false,
        }
    }

    /// Records a failure. The first failure time is kept.
    pub fn mark_failed(&mut self, now: DateTime<Utc>) {
        self.running = false;
        self.mode = Some(ReplicaMode::Error);
        if self.failed_at.is_none() {
            self.failed_at = Some(now);
        }
    }
}

#[cfg(test)]
pub(crate) fn test_replica(host: &str) -> Replica {
    Replica {
        name: ReplicaId::new(),
        volume_name: VolumeName::parse("vol-test").unwrap(),
        host_id: NodeName::parse(host).unwrap(),
        disk_name: "disk-1".to_string(),
        disk_path: "/var/lib/holdfast".to_string(),
        data_path: "/var/lib/holdfast/replicas/vol-test-r".to_string(),
        size: 16 << 20,
        instance_manager_name: format!("instance-manager-{host}"),
        mode: Some(ReplicaMode::ReadWrite),
        running: true,
        failed_at: None,
        healthy_at: Some(Utc::now()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_replica_is_never_failed() {
        let mut replica = test_replica("node-1");
        replica.failed_at = Some(Utc::now());
        assert!(!replica.is_definitively_failed(Some(&[][..])));
    }

    #[test]
    fn test_failure_requires_failed_at() {
        let mut replica = test_replica("node-1");
        replica.running = false;
        assert!(!replica.is_definitively_failed(Some(&[][..])));
    }

    #[test]
    fn test_failure_double_checks_instance_manager() {
        let mut replica = test_replica("node-1");
        replica.mark_failed(Utc::now());

        let still_listed = vec![replica.name.to_string()];
        assert!(!replica.is_definitively_failed(Some(still_listed.as_slice())));
        assert!(!replica.is_definitively_failed(None));
        assert!(replica.is_definitively_failed(Some(&["other".to_string()][..])));

        replica.instance_manager_name.clear();
        assert!(replica.is_definitively_failed(None));
    }

    #[test]
    fn test_mark_failed_keeps_first_timestamp() {
        let mut replica = test_replica("node-1");
        let first = Utc::now();
        replica.mark_failed(first);
        replica.mark_failed(first + chrono::Duration::seconds(5));
        assert_eq!(replica.failed_at, Some(first));
        assert_eq!(replica.mode, Some(ReplicaMode::Error));
        assert!(!replica.is_healthy_rw());
    }
}
