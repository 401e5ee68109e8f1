//! Engine (controller) record and device endpoints.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use holdfast_events::{Frontend, ReplicaMode};
use holdfast_id::{EngineId, NodeName};
use serde::{Deserialize, Serialize};

use super::progress::{BackupStatus, PurgeStatus, RebuildStatus, RestoreStatus};
use crate::error::{ManagerError, Result};

/// Directory block-device endpoints are created under.
pub const DEV_PATH: &str = "/dev/holdfast/";

/// Port iSCSI targets listen on.
pub const ISCSI_PORT: u16 = 3260;

/// Target IQN prefix; the volume name is appended.
pub const ISCSI_IQN_PREFIX: &str = "iqn.2019-10.io.holdfast:";

/// Per-volume frontend process aggregating replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Engine {
    pub name: EngineId,
    pub host_id: Option<NodeName>,
    pub instance_manager_name: String,
    pub running: bool,
    pub endpoint: String,
    pub size: u64,
    pub current_image: String,
    /// Replica name to the address the engine reaches it on.
    pub replica_address_map: BTreeMap<String, String>,
    pub replica_mode_map: BTreeMap<String, ReplicaMode>,
    pub last_restored_backup: String,
    pub requested_backup_restore: String,
    pub last_expansion_failed_at: Option<DateTime<Utc>>,
    pub last_expansion_error: String,
    pub rebuild_status: Vec<RebuildStatus>,
    pub restore_status: Vec<RestoreStatus>,
    pub purge_status: Vec<PurgeStatus>,
    pub backup_status: Vec<BackupStatus>,
}

impl Engine {
    pub fn new(size: u64, image: &str) -> Self {
        Self {
            name: EngineId::new(),
            host_id: None,
            instance_manager_name: String::new(),
            running: false,
            endpoint: String::new(),
            size,
            current_image: image.to_string(),
            replica_address_map: BTreeMap::new(),
            replica_mode_map: BTreeMap::new(),
            last_restored_backup: String::new(),
            requested_backup_restore: String::new(),
            last_expansion_failed_at: None,
            last_expansion_error: String::new(),
            rebuild_status: Vec::new(),
            restore_status: Vec::new(),
            purge_status: Vec::new(),
            backup_status: Vec::new(),
        }
    }

    pub fn is_rebuilding(&self) -> bool {
        self.rebuild_status.iter().any(|s| s.is_rebuilding)
    }

    pub fn is_restoring(&self) -> bool {
        self.restore_status.iter().any(|s| s.is_restoring)
    }

    pub fn is_purging(&self) -> bool {
        self.purge_status.iter().any(|s| s.is_purging)
    }

    /// Clears process state after the engine is stopped.
    pub fn mark_stopped(&mut self) {
        self.host_id = None;
        self.instance_manager_name.clear();
        self.running = false;
        self.endpoint.clear();
        self.replica_address_map.clear();
        self.replica_mode_map.clear();
        self.rebuild_status.clear();
        self.purge_status.clear();
    }
}

/// Device endpoint for a volume served from a node.
///
/// Empty when the frontend is disabled.
pub fn endpoint_for(frontend: Option<Frontend>, volume: &str, node_address: &str) -> String {
    match frontend {
        None => String::new(),
        Some(Frontend::Blockdev) => format!("{DEV_PATH}{volume}"),
        Some(Frontend::Iscsi) => {
            format!("iscsi://{node_address}:{ISCSI_PORT}/{ISCSI_IQN_PREFIX}{volume}/1")
        }
    }
}

/// Parts of an `iscsi://ip:port/target/lun` endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IscsiEndpoint {
    pub ip: String,
    pub port: u16,
    pub target: String,
    pub lun: u32,
}

impl IscsiEndpoint {
    pub fn parse(endpoint: &str) -> Result<Self> {
        let invalid = || ManagerError::invalid_argument(format!("invalid iSCSI endpoint '{endpoint}'"));

        let rest = endpoint.strip_prefix("iscsi://").ok_or_else(invalid)?;
        let mut parts = rest.split('/');
        let (Some(host), Some(target), Some(lun), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };
        let (ip, port) = host.rsplit_once(':').ok_or_else(invalid)?;
        if ip.is_empty() || target.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            ip: ip.to_string(),
            port: port.parse().map_err(|_| invalid())?,
            target: target.to_string(),
            lun: lun.parse().map_err(|_| invalid())?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blockdev_endpoint() {
        assert_eq!(
            endpoint_for(Some(Frontend::Blockdev), "vol-a", "10.0.0.5"),
            "/dev/holdfast/vol-a"
        );
        assert_eq!(endpoint_for(None, "vol-a", "10.0.0.5"), "");
    }

    #[test]
    fn test_iscsi_endpoint_roundtrip() {
        let endpoint = endpoint_for(Some(Frontend::Iscsi), "vol-a", "10.0.0.5");
        assert!(endpoint.starts_with("iscsi://"));

        let parsed = IscsiEndpoint::parse(&endpoint).unwrap();
        assert_eq!(parsed.ip, "10.0.0.5");
        assert_eq!(parsed.port, ISCSI_PORT);
        assert_eq!(parsed.target, "iqn.2019-10.io.holdfast:vol-a");
        assert_eq!(parsed.lun, 1);
    }

    #[test]
    fn test_iscsi_endpoint_rejects_garbage() {
        assert!(IscsiEndpoint::parse("/dev/holdfast/vol-a").is_err());
        assert!(IscsiEndpoint::parse("iscsi://10.0.0.5/target/1").is_err());
        assert!(IscsiEndpoint::parse("iscsi://10.0.0.5:3260/target").is_err());
        assert!(IscsiEndpoint::parse("iscsi://10.0.0.5:3260/target/1/extra").is_err());
    }

    #[test]
    fn test_mark_stopped_keeps_restore_bookkeeping() {
        let mut engine = Engine::new(16 << 20, "holdfast/engine:v1");
        engine.running = true;
        engine.endpoint = "/dev/holdfast/vol-a".into();
        engine.last_restored_backup = "backup-1".into();
        engine.mark_stopped();
        assert!(!engine.running);
        assert!(engine.endpoint.is_empty());
        assert_eq!(engine.last_restored_backup, "backup-1");
    }
}
