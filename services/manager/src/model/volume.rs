//! Volume record and creation request.

use chrono::{DateTime, Utc};
use holdfast_events::{Frontend, Robustness, VolumeState};
use holdfast_id::{NodeName, VolumeName};
use serde::{Deserialize, Serialize};

use crate::error::{ManagerError, Result};
use crate::image::BLOCK_SIZE;
use crate::settings::MAX_REPLICA_COUNT;

/// Largest volume the manager accepts: 1 PiB.
pub const MAX_VOLUME_SIZE: u64 = 1 << 50;

/// Reason recorded on the scheduled condition when no placement exists.
pub const REASON_REPLICA_SCHEDULING_FAILURE: &str = "ReplicaSchedulingFailure";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub name: VolumeName,
    pub size: u64,
    pub number_of_replicas: u32,
    pub frontend: Frontend,
    pub disable_frontend: bool,
    pub state: VolumeState,
    pub robustness: Robustness,
    /// Node the volume is attached, or being attached, to.
    pub node_id: Option<NodeName>,
    pub standby: bool,
    pub migratable: bool,
    /// Backup URL the volume was created from; empty for blank volumes.
    pub from_backup: String,
    pub initial_restoration_required: bool,
    pub base_image: String,
    pub current_image: String,
    pub node_selector: Vec<String>,
    pub disk_selector: Vec<String>,
    /// Name of the newest backup; for standby volumes, the newest backup in
    /// the backup volume being followed.
    pub last_backup: String,
    pub last_backup_at: Option<DateTime<Utc>>,
    pub kubernetes_status: KubernetesStatus,
    pub conditions: VolumeConditions,
    pub created: DateTime<Utc>,
}

impl Volume {
    /// Frontend the engine should expose, if any.
    pub fn effective_frontend(&self) -> Option<Frontend> {
        (!self.disable_frontend).then_some(self.frontend)
    }
}

/// Kubernetes binding metadata recorded for the volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesStatus {
    pub pv_name: String,
    /// `""`, `Available` or `Bound`.
    pub pv_status: String,
    pub namespace: String,
    pub pvc_name: String,
    #[serde(rename = "lastPVCRefAt")]
    pub last_pvc_ref_at: String,
    pub last_pod_ref_at: String,
    pub workloads_status: Vec<WorkloadStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadStatus {
    pub pod_name: String,
    pub pod_status: String,
    pub workload_name: String,
    pub workload_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct VolumeConditions {
    pub scheduled: Condition,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub status: bool,
    pub reason: String,
    pub message: String,
    pub last_transition_at: Option<DateTime<Utc>>,
}

impl Default for Condition {
    fn default() -> Self {
        Self {
            status: true,
            reason: String::new(),
            message: String::new(),
            last_transition_at: None,
        }
    }
}

impl Condition {
    /// Updates the condition, stamping the transition time only on change.
    pub fn set(&mut self, status: bool, reason: &str, message: &str) -> bool {
        if self.status == status && self.reason == reason && self.message == message {
            return false;
        }
        if self.status != status {
            self.last_transition_at = Some(Utc::now());
        }
        self.status = status;
        self.reason = reason.to_string();
        self.message = message.to_string();
        true
    }
}

/// Parameters accepted when creating a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {
    pub name: VolumeName,
    /// Bytes. Ignored for restores, which take the backup's size.
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub number_of_replicas: Option<u32>,
    #[serde(default)]
    pub frontend: Frontend,
    #[serde(default)]
    pub from_backup: String,
    #[serde(default)]
    pub standby: bool,
    #[serde(default)]
    pub migratable: bool,
    #[serde(default)]
    pub base_image: String,
    #[serde(default)]
    pub node_selector: Vec<String>,
    #[serde(default)]
    pub disk_selector: Vec<String>,
}

impl VolumeSpec {
    pub fn new(name: VolumeName, size: u64) -> Self {
        Self {
            name,
            size,
            number_of_replicas: None,
            frontend: Frontend::default(),
            from_backup: String::new(),
            standby: false,
            migratable: false,
            base_image: String::new(),
            node_selector: Vec::new(),
            disk_selector: Vec::new(),
        }
    }

    /// Builds the initial detached record.
    pub fn into_volume(self, default_replicas: u32, engine_image: &str) -> Result<Volume> {
        let number_of_replicas = self.number_of_replicas.unwrap_or(default_replicas);
        if number_of_replicas == 0 || number_of_replicas > MAX_REPLICA_COUNT {
            return Err(ManagerError::invalid_argument(format!(
                "numberOfReplicas must be between 1 and {MAX_REPLICA_COUNT}"
            )));
        }
        let size = validate_size(self.size)?;
        if self.standby && self.from_backup.is_empty() {
            return Err(ManagerError::invalid_argument(
                "standby volumes must be created from a backup",
            ));
        }

        let restoring = !self.from_backup.is_empty();
        Ok(Volume {
            name: self.name,
            size,
            number_of_replicas,
            frontend: self.frontend,
            disable_frontend: false,
            state: VolumeState::Detached,
            robustness: Robustness::Unknown,
            node_id: None,
            standby: self.standby,
            migratable: self.migratable,
            from_backup: self.from_backup,
            initial_restoration_required: restoring,
            base_image: self.base_image,
            current_image: engine_image.to_string(),
            node_selector: self.node_selector,
            disk_selector: self.disk_selector,
            last_backup: String::new(),
            last_backup_at: None,
            kubernetes_status: KubernetesStatus::default(),
            conditions: VolumeConditions::default(),
            created: Utc::now(),
        })
    }
}

/// Rounds a byte size up to a whole number of blocks.
pub fn round_up_to_block(size: u64) -> Option<u64> {
    size.div_ceil(BLOCK_SIZE).checked_mul(BLOCK_SIZE)
}

/// Checks a requested volume size and returns it rounded up to whole blocks.
pub fn validate_size(size: u64) -> Result<u64> {
    if size == 0 {
        return Err(ManagerError::invalid_argument("size must be greater than zero"));
    }
    round_up_to_block(size)
        .filter(|rounded| *rounded <= MAX_VOLUME_SIZE)
        .ok_or_else(|| {
            ManagerError::invalid_argument(format!(
                "size {size} exceeds the maximum volume size of {MAX_VOLUME_SIZE}"
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(size: u64) -> VolumeSpec {
        VolumeSpec::new(VolumeName::parse("vol-a").unwrap(), size)
    }

    #[test]
    fn test_into_volume_defaults() {
        let volume = spec(16 << 20).into_volume(3, "holdfast/engine:v1").unwrap();
        assert_eq!(volume.number_of_replicas, 3);
        assert_eq!(volume.state, VolumeState::Detached);
        assert_eq!(volume.robustness, Robustness::Unknown);
        assert!(!volume.initial_restoration_required);
        assert_eq!(volume.effective_frontend(), Some(Frontend::Blockdev));
    }

    #[test]
    fn test_into_volume_rejects_bad_input() {
        assert!(spec(0).into_volume(3, "img").is_err());

        let mut too_many = spec(4096);
        too_many.number_of_replicas = Some(MAX_REPLICA_COUNT + 1);
        assert!(too_many.into_volume(3, "img").is_err());

        let mut standby = spec(4096);
        standby.standby = true;
        assert!(standby.into_volume(3, "img").is_err());
    }

    #[test]
    fn test_restore_requires_initial_restoration() {
        let mut restore = spec(4096);
        restore.from_backup = "mem://store?backup=backup-1&volume=vol-src".into();
        let volume = restore.into_volume(2, "img").unwrap();
        assert!(volume.initial_restoration_required);
    }

    #[test]
    fn test_size_rounds_to_block() {
        assert_eq!(round_up_to_block(1), Some(BLOCK_SIZE));
        assert_eq!(round_up_to_block(BLOCK_SIZE), Some(BLOCK_SIZE));
        assert_eq!(round_up_to_block(BLOCK_SIZE + 1), Some(2 * BLOCK_SIZE));
        assert_eq!(round_up_to_block(u64::MAX), None);
    }

    #[test]
    fn test_size_limits() {
        assert_eq!(validate_size(1).unwrap(), BLOCK_SIZE);
        assert_eq!(validate_size(MAX_VOLUME_SIZE).unwrap(), MAX_VOLUME_SIZE);
        assert!(matches!(validate_size(0), Err(ManagerError::InvalidArgument(_))));
        assert!(matches!(
            validate_size(MAX_VOLUME_SIZE + 1),
            Err(ManagerError::InvalidArgument(_))
        ));
        assert!(matches!(validate_size(u64::MAX), Err(ManagerError::InvalidArgument(_))));
        assert!(spec(u64::MAX).into_volume(3, "img").is_err());
    }

    #[test]
    fn test_kubernetes_status_wire_names() {
        let status = KubernetesStatus {
            pvc_name: "data".into(),
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["pvcName"], "data");
        assert!(json.get("lastPVCRefAt").is_some());
        assert!(json.get("workloadsStatus").is_some());
    }

    #[test]
    fn test_condition_transition_time() {
        let mut condition = Condition::default();
        assert!(!condition.set(true, "", ""));
        assert!(condition.set(false, REASON_REPLICA_SCHEDULING_FAILURE, "no disk"));
        assert!(condition.last_transition_at.is_some());
    }
}
