//! Event type definitions and status enums for volume lifecycle events.
//!
//! The status enums are the wire vocabulary of the control API; the payload
//! structs are what the manager publishes on its event bus.

use holdfast_id::{EngineId, NodeName, ReplicaId, VolumeName};
use serde::{Deserialize, Serialize};

// =============================================================================
// Event Type Constants
// =============================================================================

/// All event type names as constants.
pub mod event_types {
    // Volume
    pub const VOLUME_CREATED: &str = "volume.created";
    pub const VOLUME_ATTACHING: &str = "volume.attaching";
    pub const VOLUME_ATTACHED: &str = "volume.attached";
    pub const VOLUME_DETACHED: &str = "volume.detached";
    pub const VOLUME_DELETED: &str = "volume.deleted";
    pub const VOLUME_ROBUSTNESS_CHANGED: &str = "volume.robustness_changed";
    pub const VOLUME_EXPANDED: &str = "volume.expanded";
    pub const VOLUME_EXPANSION_FAILED: &str = "volume.expansion_failed";
    pub const VOLUME_MIGRATION_STARTED: &str = "volume.migration_started";
    pub const VOLUME_MIGRATION_CONFIRMED: &str = "volume.migration_confirmed";
    pub const VOLUME_MIGRATION_ROLLED_BACK: &str = "volume.migration_rolled_back";
    pub const VOLUME_ACTIVATED: &str = "volume.activated";
    pub const VOLUME_SALVAGED: &str = "volume.salvaged";

    // Replica
    pub const REPLICA_FAILED: &str = "replica.failed";
    pub const REPLICA_REBUILD_STARTED: &str = "replica.rebuild_started";
    pub const REPLICA_REBUILD_COMPLETED: &str = "replica.rebuild_completed";
    pub const REPLICA_REBUILD_FAILED: &str = "replica.rebuild_failed";

    // Snapshot
    pub const SNAPSHOT_CREATED: &str = "snapshot.created";
    pub const SNAPSHOT_PURGED: &str = "snapshot.purged";

    // Backup / restore
    pub const BACKUP_COMPLETED: &str = "backup.completed";
    pub const BACKUP_FAILED: &str = "backup.failed";
    pub const RESTORE_COMPLETED: &str = "restore.completed";
}

// =============================================================================
// Status Enums
// =============================================================================

/// Volume attachment state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VolumeState {
    Creating,
    Attaching,
    Attached,
    Detaching,
    #[default]
    Detached,
    Deleting,
}

impl std::fmt::Display for VolumeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VolumeState::Creating => "creating",
            VolumeState::Attaching => "attaching",
            VolumeState::Attached => "attached",
            VolumeState::Detaching => "detaching",
            VolumeState::Detached => "detached",
            VolumeState::Deleting => "deleting",
        };
        f.write_str(s)
    }
}

/// Aggregate health of a volume's replica set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Robustness {
    Healthy,
    Degraded,
    Faulted,
    #[default]
    Unknown,
}

impl std::fmt::Display for Robustness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Robustness::Healthy => "healthy",
            Robustness::Degraded => "degraded",
            Robustness::Faulted => "faulted",
            Robustness::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Replica mode as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicaMode {
    /// Read-write, in sync with the engine.
    #[serde(rename = "RW")]
    ReadWrite,
    /// Write-only, receiving writes while it rebuilds.
    #[serde(rename = "WO")]
    WriteOnly,
    /// Failed; no longer part of the data path.
    #[serde(rename = "ERR")]
    Error,
}

impl std::fmt::Display for ReplicaMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReplicaMode::ReadWrite => "RW",
            ReplicaMode::WriteOnly => "WO",
            ReplicaMode::Error => "ERR",
        };
        f.write_str(s)
    }
}

/// Frontend kind exposed by an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Frontend {
    #[default]
    Blockdev,
    Iscsi,
}

impl std::fmt::Display for Frontend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Frontend::Blockdev => f.write_str("blockdev"),
            Frontend::Iscsi => f.write_str("iscsi"),
        }
    }
}

/// State of a rebuild/backup/restore/purge progress entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ProgressState {
    #[default]
    #[serde(rename = "")]
    Empty,
    #[serde(rename = "in_progress")]
    InProgress,
    #[serde(rename = "complete")]
    Complete,
    #[serde(rename = "error")]
    Error,
}

impl ProgressState {
    /// Returns true once the entry can no longer change.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressState::Complete | ProgressState::Error)
    }
}

impl std::fmt::Display for ProgressState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProgressState::Empty => "",
            ProgressState::InProgress => "in_progress",
            ProgressState::Complete => "complete",
            ProgressState::Error => "error",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Event Payloads
// =============================================================================

// -----------------------------------------------------------------------------
// Volume Events
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeCreatedPayload {
    pub volume: VolumeName,
    pub size: u64,
    pub number_of_replicas: u32,
    pub frontend: Frontend,
    pub standby: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_backup: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeAttachingPayload {
    pub volume: VolumeName,
    pub host_id: NodeName,
    pub disable_frontend: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeAttachedPayload {
    pub volume: VolumeName,
    pub host_id: NodeName,
    pub engine: EngineId,
    pub endpoint: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeDetachedPayload {
    pub volume: VolumeName,
    pub robustness: Robustness,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeDeletedPayload {
    pub volume: VolumeName,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobustnessChangedPayload {
    pub volume: VolumeName,
    pub from: Robustness,
    pub to: Robustness,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeExpandedPayload {
    pub volume: VolumeName,
    pub old_size: u64,
    pub new_size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpansionFailedPayload {
    pub volume: VolumeName,
    pub requested_size: u64,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationStartedPayload {
    pub volume: VolumeName,
    pub from_host: NodeName,
    pub to_host: NodeName,
    pub engine: EngineId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationFinishedPayload {
    pub volume: VolumeName,
    /// Host that keeps serving the volume.
    pub host_id: NodeName,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeActivatedPayload {
    pub volume: VolumeName,
    pub frontend: Frontend,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeSalvagedPayload {
    pub volume: VolumeName,
    pub replicas: Vec<ReplicaId>,
    pub automatic: bool,
}

// -----------------------------------------------------------------------------
// Replica Events
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaFailedPayload {
    pub volume: VolumeName,
    pub replica: ReplicaId,
    pub host_id: NodeName,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebuildStartedPayload {
    pub volume: VolumeName,
    pub replica: ReplicaId,
    pub from_replica: ReplicaId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebuildFinishedPayload {
    pub volume: VolumeName,
    pub replica: ReplicaId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// -----------------------------------------------------------------------------
// Snapshot / Backup Events
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotCreatedPayload {
    pub volume: VolumeName,
    pub snapshot: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotPurgedPayload {
    pub volume: VolumeName,
    pub removed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupCompletedPayload {
    pub volume: VolumeName,
    pub snapshot: String,
    pub backup: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupFailedPayload {
    pub volume: VolumeName,
    pub snapshot: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreCompletedPayload {
    pub volume: VolumeName,
    pub backup: String,
    pub incremental: bool,
}

// =============================================================================
// Volume Event
// =============================================================================

/// Every event a volume can publish, tagged with its event type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum VolumeEvent {
    #[serde(rename = "volume.created")]
    Created(VolumeCreatedPayload),
    #[serde(rename = "volume.attaching")]
    Attaching(VolumeAttachingPayload),
    #[serde(rename = "volume.attached")]
    Attached(VolumeAttachedPayload),
    #[serde(rename = "volume.detached")]
    Detached(VolumeDetachedPayload),
    #[serde(rename = "volume.deleted")]
    Deleted(VolumeDeletedPayload),
    #[serde(rename = "volume.robustness_changed")]
    RobustnessChanged(RobustnessChangedPayload),
    #[serde(rename = "volume.expanded")]
    Expanded(VolumeExpandedPayload),
    #[serde(rename = "volume.expansion_failed")]
    ExpansionFailed(ExpansionFailedPayload),
    #[serde(rename = "volume.migration_started")]
    MigrationStarted(MigrationStartedPayload),
    #[serde(rename = "volume.migration_confirmed")]
    MigrationConfirmed(MigrationFinishedPayload),
    #[serde(rename = "volume.migration_rolled_back")]
    MigrationRolledBack(MigrationFinishedPayload),
    #[serde(rename = "volume.activated")]
    Activated(VolumeActivatedPayload),
    #[serde(rename = "volume.salvaged")]
    Salvaged(VolumeSalvagedPayload),
    #[serde(rename = "replica.failed")]
    ReplicaFailed(ReplicaFailedPayload),
    #[serde(rename = "replica.rebuild_started")]
    RebuildStarted(RebuildStartedPayload),
    #[serde(rename = "replica.rebuild_completed")]
    RebuildCompleted(RebuildFinishedPayload),
    #[serde(rename = "replica.rebuild_failed")]
    RebuildFailed(RebuildFinishedPayload),
    #[serde(rename = "snapshot.created")]
    SnapshotCreated(SnapshotCreatedPayload),
    #[serde(rename = "snapshot.purged")]
    SnapshotPurged(SnapshotPurgedPayload),
    #[serde(rename = "backup.completed")]
    BackupCompleted(BackupCompletedPayload),
    #[serde(rename = "backup.failed")]
    BackupFailed(BackupFailedPayload),
    #[serde(rename = "restore.completed")]
    RestoreCompleted(RestoreCompletedPayload),
}

impl VolumeEvent {
    /// The event type string recorded on the envelope.
    pub fn event_type(&self) -> &'static str {
        use event_types::*;
        match self {
            VolumeEvent::Created(_) => VOLUME_CREATED,
            VolumeEvent::Attaching(_) => VOLUME_ATTACHING,
            VolumeEvent::Attached(_) => VOLUME_ATTACHED,
            VolumeEvent::Detached(_) => VOLUME_DETACHED,
            VolumeEvent::Deleted(_) => VOLUME_DELETED,
            VolumeEvent::RobustnessChanged(_) => VOLUME_ROBUSTNESS_CHANGED,
            VolumeEvent::Expanded(_) => VOLUME_EXPANDED,
            VolumeEvent::ExpansionFailed(_) => VOLUME_EXPANSION_FAILED,
            VolumeEvent::MigrationStarted(_) => VOLUME_MIGRATION_STARTED,
            VolumeEvent::MigrationConfirmed(_) => VOLUME_MIGRATION_CONFIRMED,
            VolumeEvent::MigrationRolledBack(_) => VOLUME_MIGRATION_ROLLED_BACK,
            VolumeEvent::Activated(_) => VOLUME_ACTIVATED,
            VolumeEvent::Salvaged(_) => VOLUME_SALVAGED,
            VolumeEvent::ReplicaFailed(_) => REPLICA_FAILED,
            VolumeEvent::RebuildStarted(_) => REPLICA_REBUILD_STARTED,
            VolumeEvent::RebuildCompleted(_) => REPLICA_REBUILD_COMPLETED,
            VolumeEvent::RebuildFailed(_) => REPLICA_REBUILD_FAILED,
            VolumeEvent::SnapshotCreated(_) => SNAPSHOT_CREATED,
            VolumeEvent::SnapshotPurged(_) => SNAPSHOT_PURGED,
            VolumeEvent::BackupCompleted(_) => BACKUP_COMPLETED,
            VolumeEvent::BackupFailed(_) => BACKUP_FAILED,
            VolumeEvent::RestoreCompleted(_) => RESTORE_COMPLETED,
        }
    }
}
