//! Replica placement and disk capacity accounting.
//!
//! Capacity is charged optimistically: the fit check and the charge happen
//! under the same registry write lock, so two volumes racing for the last
//! bytes of a disk cannot both win.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use holdfast_id::NodeName;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::model::{percent_of, Node, Replica, Volume};
use crate::settings::SharedSettings;

#[derive(Debug, Error)]
pub enum SchedulingError {
    #[error("no node or disk can hold a {size} byte replica of {volume}")]
    NoFit { volume: String, size: u64 },

    #[error("insufficient storage to expand {volume} by {delta} bytes on disk {disk} of {node}")]
    InsufficientForExpansion {
        volume: String,
        node: String,
        disk: String,
        delta: u64,
    },

    #[error("node '{0}' not found")]
    NodeNotFound(String),

    #[error("disk '{disk}' not found on node '{node}'")]
    DiskNotFound { node: String, disk: String },
}

pub type NodeRegistry = Arc<RwLock<BTreeMap<NodeName, Node>>>;

/// Where a replica was placed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub node: NodeName,
    pub address: String,
    pub instance_manager_name: String,
    pub disk_name: String,
    pub disk_path: String,
}

#[derive(Clone)]
pub struct ReplicaScheduler {
    nodes: NodeRegistry,
    settings: SharedSettings,
}

impl ReplicaScheduler {
    pub fn new(nodes: NodeRegistry, settings: SharedSettings) -> Self {
        Self { nodes, settings }
    }

    pub fn nodes(&self) -> &NodeRegistry {
        &self.nodes
    }

    /// Picks a disk for a new replica and charges `size` to it.
    ///
    /// `existing` are the volume's current replicas; nodes already holding a
    /// live one are skipped unless soft anti-affinity is enabled, in which
    /// case they are only used when nothing else fits.
    pub async fn place(
        &self,
        volume: &Volume,
        replica: &str,
        existing: &[Replica],
    ) -> Result<Placement, SchedulingError> {
        let (over_provisioning, minimal_available, soft) = {
            let settings = self.settings.read().await;
            (
                settings.storage_over_provisioning_percentage,
                settings.storage_minimal_available_percentage,
                settings.replica_soft_anti_affinity,
            )
        };
        let occupied: BTreeSet<&NodeName> = existing
            .iter()
            .filter(|r| !r.is_failed())
            .map(|r| &r.host_id)
            .collect();

        let mut nodes = self.nodes.write().await;

        let mut candidates = Vec::new();
        for node in nodes.values() {
            if !node.allow_scheduling || !has_tags(&node.tags, &volume.node_selector) {
                continue;
            }
            let shares_node = occupied.contains(&node.name);
            if shares_node && !soft {
                continue;
            }
            for (disk_name, disk) in &node.disks {
                if !disk.allow_scheduling
                    || !has_tags(&disk.tags, &volume.disk_selector)
                    || !disk.fits(volume.size, over_provisioning, minimal_available)
                {
                    continue;
                }
                candidates.push((
                    !shares_node,
                    disk.free(over_provisioning),
                    node.name.clone(),
                    disk_name.clone(),
                ));
            }
        }

        let (_, _, node_name, disk_name) = candidates
            .into_iter()
            .max_by_key(|(spread, free, node, disk)| {
                (*spread, *free, Reverse(node.clone()), Reverse(disk.clone()))
            })
            .ok_or_else(|| SchedulingError::NoFit {
                volume: volume.name.to_string(),
                size: volume.size,
            })?;

        let node = nodes
            .get_mut(&node_name)
            .ok_or_else(|| SchedulingError::NodeNotFound(node_name.to_string()))?;
        let disk = node
            .disks
            .get_mut(&disk_name)
            .ok_or_else(|| SchedulingError::DiskNotFound {
                node: node_name.to_string(),
                disk: disk_name.clone(),
            })?;
        disk.storage_scheduled = disk.storage_scheduled.saturating_add(volume.size);
        disk.scheduled_replica.insert(replica.to_string(), volume.size);

        info!(
            volume = %volume.name,
            replica = %replica,
            node = %node_name,
            disk = %disk_name,
            "Replica scheduled"
        );

        Ok(Placement {
            node: node_name,
            address: node.address.clone(),
            instance_manager_name: node.instance_manager_name.clone(),
            disk_name,
            disk_path: disk.path.clone(),
        })
    }

    /// Returns the capacity charged for a replica.
    pub async fn release(&self, replica: &Replica) {
        let mut nodes = self.nodes.write().await;
        let Some(disk) = nodes
            .get_mut(&replica.host_id)
            .and_then(|node| node.disks.get_mut(&replica.disk_name))
        else {
            return;
        };
        if let Some(size) = disk.scheduled_replica.remove(&replica.name.to_string()) {
            disk.storage_scheduled = disk.storage_scheduled.saturating_sub(size);
            debug!(replica = %replica.name, size, "Replica capacity released");
        }
    }

    /// Whether every replica's disk can take `delta` more bytes.
    pub async fn can_charge(&self, replicas: &[Replica], delta: u64) -> Result<(), SchedulingError> {
        let over_provisioning = self.settings.read().await.storage_over_provisioning_percentage;
        let nodes = self.nodes.read().await;
        check_expansion(&nodes, replicas, delta, over_provisioning)
    }

    /// Charges an expansion delta to every replica's disk, all or nothing.
    pub async fn charge_expansion(
        &self,
        replicas: &[Replica],
        delta: u64,
    ) -> Result<(), SchedulingError> {
        let over_provisioning = self.settings.read().await.storage_over_provisioning_percentage;
        let mut nodes = self.nodes.write().await;
        check_expansion(&nodes, replicas, delta, over_provisioning)?;

        for replica in replicas {
            if let Some(disk) = nodes
                .get_mut(&replica.host_id)
                .and_then(|node| node.disks.get_mut(&replica.disk_name))
            {
                disk.storage_scheduled = disk.storage_scheduled.saturating_add(delta);
                let entry = disk
                    .scheduled_replica
                    .entry(replica.name.to_string())
                    .or_insert(0);
                *entry = entry.saturating_add(delta);
            }
        }
        Ok(())
    }

    /// Applies the reserved percentage to every disk and clears disk tags.
    pub async fn reset_disks(&self) -> Vec<Node> {
        let pct = self
            .settings
            .read()
            .await
            .storage_reserved_percentage_for_default_disk;
        let mut nodes = self.nodes.write().await;
        for node in nodes.values_mut() {
            for disk in node.disks.values_mut() {
                disk.storage_reserved = percent_of(disk.storage_maximum, pct);
                disk.tags.clear();
                disk.allow_scheduling = true;
            }
        }
        info!(reserved_pct = pct, nodes = nodes.len(), "Disks reset");
        nodes.values().cloned().collect()
    }
}

fn check_expansion(
    nodes: &BTreeMap<NodeName, Node>,
    replicas: &[Replica],
    delta: u64,
    over_provisioning: u64,
) -> Result<(), SchedulingError> {
    for replica in replicas {
        let node = nodes
            .get(&replica.host_id)
            .ok_or_else(|| SchedulingError::NodeNotFound(replica.host_id.to_string()))?;
        let disk = node
            .disks
            .get(&replica.disk_name)
            .ok_or_else(|| SchedulingError::DiskNotFound {
                node: node.name.to_string(),
                disk: replica.disk_name.clone(),
            })?;
        let fits = disk
            .storage_scheduled
            .checked_add(delta)
            .is_some_and(|scheduled| scheduled <= disk.schedulable_capacity(over_provisioning));
        if !fits {
            return Err(SchedulingError::InsufficientForExpansion {
                volume: replica.volume_name.to_string(),
                node: node.name.to_string(),
                disk: replica.disk_name.clone(),
                delta,
            });
        }
    }
    Ok(())
}

fn has_tags(available: &[String], required: &[String]) -> bool {
    required.iter().all(|tag| available.contains(tag))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{test_replica, Disk, VolumeSpec};
    use crate::settings::Settings;
    use holdfast_id::VolumeName;

    const GIB: u64 = 1 << 30;

    fn registry(nodes: &[(&str, u64)]) -> NodeRegistry {
        let map = nodes
            .iter()
            .map(|(name, capacity)| {
                let name = NodeName::parse(name).unwrap();
                let node = Node::new(name.clone(), "127.0.0.1")
                    .with_disk("default-disk", Disk::new(format!("/data/{name}"), *capacity));
                (name, node)
            })
            .collect();
        Arc::new(RwLock::new(map))
    }

    fn volume(size: u64) -> Volume {
        VolumeSpec::new(VolumeName::parse("vol-test").unwrap(), size)
            .into_volume(3, "img")
            .unwrap()
    }

    fn scheduler(nodes: NodeRegistry) -> ReplicaScheduler {
        ReplicaScheduler::new(nodes, Settings::default().shared())
    }

    #[tokio::test]
    async fn test_place_prefers_most_free_capacity() {
        let scheduler = scheduler(registry(&[("node-1", GIB), ("node-2", 2 * GIB)]));
        let placement = scheduler.place(&volume(GIB / 4), "r-1", &[]).await.unwrap();
        assert_eq!(placement.node.as_str(), "node-2");
        assert_eq!(placement.instance_manager_name, "instance-manager-node-2");

        let nodes = scheduler.nodes().read().await;
        let disk = &nodes[&placement.node].disks["default-disk"];
        assert_eq!(disk.storage_scheduled, GIB / 4);
    }

    #[tokio::test]
    async fn test_hard_anti_affinity() {
        let scheduler = scheduler(registry(&[("node-1", GIB)]));
        let existing = vec![test_replica("node-1")];
        let err = scheduler
            .place(&volume(GIB / 4), "r-2", &existing)
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulingError::NoFit { .. }));

        scheduler.settings.write().await.replica_soft_anti_affinity = true;
        let placement = scheduler.place(&volume(GIB / 4), "r-2", &existing).await.unwrap();
        assert_eq!(placement.node.as_str(), "node-1");
    }

    #[tokio::test]
    async fn test_tags_must_match() {
        let scheduler = scheduler(registry(&[("node-1", GIB), ("node-2", GIB)]));
        {
            let mut nodes = scheduler.nodes().write().await;
            let node = nodes.get_mut(&NodeName::parse("node-1").unwrap()).unwrap();
            node.tags.push("ssd".to_string());
        }
        let mut vol = volume(GIB / 4);
        vol.node_selector = vec!["ssd".to_string()];
        let placement = scheduler.place(&vol, "r-1", &[]).await.unwrap();
        assert_eq!(placement.node.as_str(), "node-1");

        vol.disk_selector = vec!["nvme".to_string()];
        assert!(scheduler.place(&vol, "r-2", &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_release_and_expansion_charge() {
        let scheduler = scheduler(registry(&[("node-1", GIB)]));
        let placement = scheduler.place(&volume(GIB / 4), "r-1", &[]).await.unwrap();

        let mut replica = test_replica("node-1");
        replica.disk_name = placement.disk_name;

        // Default over-provisioning is 500%, so 5 GiB is schedulable.
        assert!(scheduler.can_charge(&[replica.clone()], GIB).await.is_ok());
        assert!(scheduler.can_charge(&[replica.clone()], 5 * GIB).await.is_err());

        scheduler.charge_expansion(&[replica.clone()], GIB).await.unwrap();
        {
            let nodes = scheduler.nodes().read().await;
            assert_eq!(
                nodes[&replica.host_id].disks["default-disk"].storage_scheduled,
                GIB + GIB / 4
            );
        }

        // The test replica has its own name; release only drops what it was charged.
        scheduler.release(&replica).await;
        let nodes = scheduler.nodes().read().await;
        assert_eq!(nodes[&replica.host_id].disks["default-disk"].storage_scheduled, GIB / 4);
    }

    #[tokio::test]
    async fn test_huge_disk_capacity_is_saturated() {
        let huge = 1u64 << 62;
        let scheduler = scheduler(registry(&[("node-1", huge)]));
        let placement = scheduler.place(&volume(16 << 20), "r-1", &[]).await.unwrap();

        let mut replica = test_replica("node-1");
        replica.disk_name = placement.disk_name;
        let err = scheduler
            .charge_expansion(&[replica.clone()], u64::MAX)
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulingError::InsufficientForExpansion { .. }));

        let nodes = scheduler.reset_disks().await;
        let disk = &nodes[0].disks["default-disk"];
        assert_eq!(u128::from(disk.storage_reserved), u128::from(huge) * 30 / 100);
        assert_eq!(disk.storage_scheduled, 16 << 20);
    }

    #[tokio::test]
    async fn test_reset_disks_applies_reserved_percentage() {
        let scheduler = scheduler(registry(&[("node-1", 100 * GIB)]));
        {
            let mut nodes = scheduler.nodes().write().await;
            for node in nodes.values_mut() {
                for disk in node.disks.values_mut() {
                    disk.tags.push("old".to_string());
                }
            }
        }
        let nodes = scheduler.reset_disks().await;
        let disk = &nodes[0].disks["default-disk"];
        assert_eq!(disk.storage_reserved, 30 * GIB);
        assert!(disk.tags.is_empty());
    }
}
