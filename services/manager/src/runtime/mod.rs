//! Instance runtime interface.
//!
//! The runtime abstracts the engine and replica processes hosted by each
//! node's instance manager:
//! - Starting/stopping engines and replicas
//! - Wiring replicas into an engine and tracking their modes
//! - Long-running data jobs (rebuild, backup, restore, purge)
//! - Block I/O through a running engine
//!
//! Jobs are started and return immediately; progress arrives as
//! [`JobReport`]s on the sink handed to the job.

mod mock;

pub use mock::MockRuntime;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use holdfast_events::{Frontend, ReplicaMode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::backupstore::{BackupStore, BackupTarget, NewBackup};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("{kind} instance '{name}' not found")]
    InstanceNotFound { kind: InstanceKind, name: String },

    #[error("instance '{0}' is not running")]
    NotRunning(String),

    #[error("replica '{replica}' is not part of engine '{engine}'")]
    NotInEngine { engine: String, replica: String },

    #[error("engine '{0}' has no readable replica")]
    NoReadableReplica(String),

    #[error("I/O range {offset}+{len} is outside the {size} byte volume")]
    OutOfRange { offset: u64, len: u64, size: u64 },

    #[error("snapshot '{0}' not found")]
    SnapshotNotFound(String),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceKind {
    Engine,
    Replica,
}

impl std::fmt::Display for InstanceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceKind::Engine => f.write_str("engine"),
            InstanceKind::Replica => f.write_str("replica"),
        }
    }
}

/// A live process inside an instance manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfo {
    pub name: String,
    pub kind: InstanceKind,
    pub volume: String,
    pub running: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaProcessSpec {
    pub name: String,
    pub volume: String,
    pub instance_manager: String,
    pub data_path: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineProcessSpec {
    pub name: String,
    pub volume: String,
    pub instance_manager: String,
    pub frontend: Option<Frontend>,
    pub endpoint: String,
    pub size: u64,
    /// Replicas wired in read-write on start.
    pub replicas: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobKind {
    Rebuild,
    Backup { backup: String },
    Restore { backup_url: String },
    Purge,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Progress(u32),
    Completed,
    Failed(String),
}

/// Progress report from a running job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub kind: JobKind,
    pub replica: String,
    pub event: JobEvent,
}

pub type ReportSink = mpsc::UnboundedSender<JobReport>;

pub struct RebuildJob {
    pub engine: String,
    pub replica: String,
    pub from_replica: String,
}

pub struct BackupJob {
    pub engine: String,
    /// Replica the snapshot data is read from.
    pub replica: String,
    pub snapshot: String,
    pub target: BackupTarget,
    pub backup: NewBackup,
    pub store: Arc<dyn BackupStore>,
}

pub struct RestoreJob {
    pub replica: String,
    pub backup_url: String,
    pub store: Arc<dyn BackupStore>,
}

pub struct PurgeJob {
    pub replica: String,
    pub snapshots: Vec<String>,
}

/// Engine and replica process control.
#[async_trait]
pub trait InstanceRuntime: Send + Sync {
    async fn start_replica(&self, spec: &ReplicaProcessSpec) -> Result<()>;

    async fn stop_replica(&self, name: &str) -> Result<()>;

    /// Drops a replica's data; the process must be stopped.
    async fn remove_replica_data(&self, name: &str) -> Result<()>;

    /// Starts an engine and returns its endpoint.
    async fn start_engine(&self, spec: &EngineProcessSpec) -> Result<String>;

    async fn stop_engine(&self, name: &str) -> Result<()>;

    /// Instances currently running in an instance manager.
    async fn list_instances(&self, instance_manager: &str) -> Result<Vec<InstanceInfo>>;

    /// Kills an instance as if its process crashed.
    async fn delete_instance(&self, instance_manager: &str, name: &str) -> Result<()>;

    async fn engine_replicas(&self, engine: &str) -> Result<BTreeMap<String, ReplicaMode>>;

    async fn add_replica(&self, engine: &str, replica: &str, mode: ReplicaMode) -> Result<()>;

    async fn remove_replica(&self, engine: &str, replica: &str) -> Result<()>;

    async fn set_replica_mode(&self, engine: &str, replica: &str, mode: ReplicaMode)
        -> Result<()>;

    /// Takes a snapshot on every replica of the engine.
    async fn snapshot(&self, engine: &str, name: &str) -> Result<()>;

    /// Resizes a stopped or running replica's image.
    async fn expand_replica(&self, replica: &str, size: u64) -> Result<()>;

    async fn start_rebuild(&self, job: RebuildJob, sink: ReportSink) -> Result<()>;

    async fn start_backup(&self, job: BackupJob, sink: ReportSink) -> Result<()>;

    async fn start_restore(&self, job: RestoreJob, sink: ReportSink) -> Result<()>;

    async fn start_purge(&self, job: PurgeJob, sink: ReportSink) -> Result<()>;

    async fn write_at(&self, engine: &str, offset: u64, data: &[u8]) -> Result<()>;

    async fn read_at(&self, engine: &str, offset: u64, len: usize) -> Result<Vec<u8>>;

    /// Hex SHA-512 of the whole device.
    async fn checksum(&self, engine: &str) -> Result<String>;
}
