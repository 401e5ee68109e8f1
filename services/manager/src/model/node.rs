//! Nodes and their disks.

use std::collections::BTreeMap;

use holdfast_id::NodeName;
use serde::{Deserialize, Serialize};

/// Name of the disk registered from the node's data directory.
pub const DEFAULT_DISK_NAME: &str = "default-disk";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub name: NodeName,
    pub address: String,
    pub allow_scheduling: bool,
    pub tags: Vec<String>,
    pub disks: BTreeMap<String, Disk>,
    pub instance_manager_name: String,
}

impl Node {
    pub fn new(name: NodeName, address: impl Into<String>) -> Self {
        let instance_manager_name = instance_manager_name(&name);
        Self {
            name,
            address: address.into(),
            allow_scheduling: true,
            tags: Vec::new(),
            disks: BTreeMap::new(),
            instance_manager_name,
        }
    }

    pub fn with_disk(mut self, name: impl Into<String>, disk: Disk) -> Self {
        self.disks.insert(name.into(), disk);
        self
    }
}

pub fn instance_manager_name(node: &NodeName) -> String {
    format!("instance-manager-{node}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Disk {
    pub path: String,
    pub allow_scheduling: bool,
    pub storage_maximum: u64,
    pub storage_available: u64,
    pub storage_reserved: u64,
    pub storage_scheduled: u64,
    pub tags: Vec<String>,
    /// Replica name to scheduled bytes.
    pub scheduled_replica: BTreeMap<String, u64>,
}

/// `pct` percent of `bytes`, saturating at `u64::MAX`.
pub fn percent_of(bytes: u64, pct: u64) -> u64 {
    let scaled = u128::from(bytes) * u128::from(pct) / 100;
    u64::try_from(scaled).unwrap_or(u64::MAX)
}

impl Disk {
    pub fn new(path: impl Into<String>, storage_maximum: u64) -> Self {
        Self {
            path: path.into(),
            allow_scheduling: true,
            storage_maximum,
            storage_available: storage_maximum,
            storage_reserved: 0,
            storage_scheduled: 0,
            tags: Vec::new(),
            scheduled_replica: BTreeMap::new(),
        }
    }

    /// Bytes that may be scheduled on this disk in total.
    pub fn schedulable_capacity(&self, over_provisioning_pct: u64) -> u64 {
        percent_of(
            self.storage_maximum.saturating_sub(self.storage_reserved),
            over_provisioning_pct,
        )
    }

    /// Remaining schedulable bytes.
    pub fn free(&self, over_provisioning_pct: u64) -> u64 {
        self.schedulable_capacity(over_provisioning_pct)
            .saturating_sub(self.storage_scheduled)
    }

    /// Whether `size` more bytes fit under the over-provisioning and
    /// minimal-available limits.
    pub fn fits(&self, size: u64, over_provisioning_pct: u64, minimal_available_pct: u64) -> bool {
        let unreserved = self
            .storage_maximum
            .saturating_sub(self.storage_reserved)
            .saturating_sub(self.storage_scheduled);
        let minimal = percent_of(self.storage_maximum, minimal_available_pct);
        let Some(scheduled) = self.storage_scheduled.checked_add(size) else {
            return false;
        };
        unreserved >= minimal && scheduled <= self.schedulable_capacity(over_provisioning_pct)
    }
}

/// Request body for registering or updating a disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskSpec {
    pub path: String,
    pub storage_maximum: u64,
    #[serde(default)]
    pub storage_reserved: u64,
    #[serde(default = "default_true")]
    pub allow_scheduling: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl DiskSpec {
    /// Builds the disk record, keeping the scheduling ledger of the disk it
    /// replaces.
    pub fn into_disk(self, existing: Option<&Disk>) -> Disk {
        let mut disk = Disk::new(self.path, self.storage_maximum);
        disk.storage_reserved = self.storage_reserved;
        disk.allow_scheduling = self.allow_scheduling;
        disk.tags = self.tags;
        if let Some(existing) = existing {
            disk.storage_scheduled = existing.storage_scheduled;
            disk.scheduled_replica = existing.scheduled_replica.clone();
        }
        disk
    }
}

/// Request body for registering a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    pub name: NodeName,
    pub address: String,
    #[serde(default = "default_true")]
    pub allow_scheduling: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub disks: BTreeMap<String, DiskSpec>,
}

impl NodeSpec {
    pub fn into_node(self) -> Node {
        let mut node = Node::new(self.name, self.address);
        node.allow_scheduling = self.allow_scheduling;
        node.tags = self.tags;
        node.disks = self
            .disks
            .into_iter()
            .map(|(name, spec)| (name, spec.into_disk(None)))
            .collect();
        node
    }
}

/// Partial node update; absent fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeUpdate {
    #[serde(default)]
    pub allow_scheduling: Option<bool>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fit_respects_over_provisioning() {
        let mut disk = Disk::new("/data", 100);
        disk.storage_reserved = 30;
        assert_eq!(disk.schedulable_capacity(100), 70);
        assert!(disk.fits(70, 100, 0));
        assert!(!disk.fits(71, 100, 0));
        assert!(disk.fits(140, 200, 0));
    }

    #[test]
    fn test_fit_respects_minimal_available() {
        let mut disk = Disk::new("/data", 100);
        disk.storage_scheduled = 95;
        assert!(!disk.fits(1, 500, 10));
        assert!(disk.fits(1, 500, 5));
    }

    #[test]
    fn test_large_disks_do_not_overflow() {
        let disk = Disk::new("/data", 1 << 62);
        assert_eq!(disk.schedulable_capacity(500), u64::MAX);
        assert!(disk.fits(16 << 20, 500, 10));
        assert_eq!(u128::from(percent_of(u64::MAX, 30)), u128::from(u64::MAX) * 30 / 100);

        let mut full = Disk::new("/data", u64::MAX);
        full.storage_scheduled = u64::MAX - 1;
        assert!(!full.fits(2, 10_000, 0));
    }

    #[test]
    fn test_disk_spec_keeps_scheduling_ledger() {
        let mut old = Disk::new("/data", 100);
        old.storage_scheduled = 40;
        old.scheduled_replica.insert("r-1".to_string(), 40);

        let spec = DiskSpec {
            path: "/data".to_string(),
            storage_maximum: 200,
            storage_reserved: 20,
            allow_scheduling: false,
            tags: vec!["ssd".to_string()],
        };
        let disk = spec.into_disk(Some(&old));
        assert_eq!(disk.storage_maximum, 200);
        assert_eq!(disk.storage_scheduled, 40);
        assert_eq!(disk.scheduled_replica.len(), 1);
        assert!(!disk.allow_scheduling);
    }

    #[test]
    fn test_node_spec_defaults() {
        let spec: NodeSpec =
            serde_json::from_str(r#"{"name":"node-2","address":"10.0.0.2"}"#).unwrap();
        let node = spec.into_node();
        assert!(node.allow_scheduling);
        assert!(node.disks.is_empty());
        assert_eq!(node.instance_manager_name, "instance-manager-node-2");
    }

    #[test]
    fn test_instance_manager_name() {
        let node = Node::new(NodeName::parse("node-1").unwrap(), "10.0.0.1");
        assert_eq!(node.instance_manager_name, "instance-manager-node-1");
    }
}
