//! Per-replica progress records for rebuild, restore, purge and backup.
//!
//! Every record embeds a [`Progress`] and exposes the shared transitions
//! through [`ProgressRecord`], so the record invariants hold by construction:
//!
//! - `complete` implies `progress == 100`, an empty error and no activity flag
//! - `error` implies a non-empty error and no activity flag
//! - `in_progress` implies the activity flag
//! - progress never decreases and terminal records never change

use holdfast_events::ProgressState;
use holdfast_id::ReplicaId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Progress {
    pub state: ProgressState,
    pub progress: u32,
    pub error: String,
}

impl Progress {
    pub fn started() -> Self {
        Self {
            state: ProgressState::InProgress,
            progress: 0,
            error: String::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == ProgressState::InProgress
    }

    fn advance(&mut self, progress: u32) -> bool {
        let progress = progress.min(100);
        if !self.is_active() || progress <= self.progress {
            return false;
        }
        self.progress = progress;
        true
    }

    fn complete(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = ProgressState::Complete;
        self.progress = 100;
        self.error.clear();
        true
    }

    fn fail(&mut self, error: &str) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = ProgressState::Error;
        self.error = if error.is_empty() {
            "unknown error".to_string()
        } else {
            error.to_string()
        };
        true
    }
}

/// Shared transitions for progress-carrying records.
pub trait ProgressRecord {
    fn progress(&self) -> &Progress;
    fn progress_mut(&mut self) -> &mut Progress;

    /// Keeps the record's activity flag in step with its state.
    fn sync_flag(&mut self) {}

    fn replica(&self) -> &ReplicaId;

    fn is_active(&self) -> bool {
        self.progress().is_active()
    }

    fn state(&self) -> ProgressState {
        self.progress().state
    }

    /// Raises progress; lower or repeated values are ignored.
    fn advance(&mut self, progress: u32) -> bool {
        let changed = self.progress_mut().advance(progress);
        self.sync_flag();
        changed
    }

    fn complete(&mut self) -> bool {
        let changed = self.progress_mut().complete();
        self.sync_flag();
        changed
    }

    fn fail(&mut self, error: &str) -> bool {
        let changed = self.progress_mut().fail(error);
        self.sync_flag();
        changed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebuildStatus {
    pub replica: ReplicaId,
    pub from_replica: ReplicaId,
    pub is_rebuilding: bool,
    #[serde(flatten)]
    pub progress: Progress,
}

impl RebuildStatus {
    pub fn started(replica: ReplicaId, from_replica: ReplicaId) -> Self {
        Self {
            replica,
            from_replica,
            is_rebuilding: true,
            progress: Progress::started(),
        }
    }
}

impl ProgressRecord for RebuildStatus {
    fn progress(&self) -> &Progress {
        &self.progress
    }
    fn progress_mut(&mut self) -> &mut Progress {
        &mut self.progress
    }
    fn sync_flag(&mut self) {
        self.is_rebuilding = self.progress.is_active();
    }
    fn replica(&self) -> &ReplicaId {
        &self.replica
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreStatus {
    pub replica: ReplicaId,
    /// Backup being restored.
    pub backup_url: String,
    /// Backup this replica held before the restore began.
    pub last_restored: String,
    pub is_restoring: bool,
    #[serde(flatten)]
    pub progress: Progress,
}

impl RestoreStatus {
    pub fn started(replica: ReplicaId, backup_url: String, last_restored: String) -> Self {
        Self {
            replica,
            backup_url,
            last_restored,
            is_restoring: true,
            progress: Progress::started(),
        }
    }
}

impl ProgressRecord for RestoreStatus {
    fn progress(&self) -> &Progress {
        &self.progress
    }
    fn progress_mut(&mut self) -> &mut Progress {
        &mut self.progress
    }
    fn sync_flag(&mut self) {
        self.is_restoring = self.progress.is_active();
    }
    fn replica(&self) -> &ReplicaId {
        &self.replica
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeStatus {
    pub replica: ReplicaId,
    pub is_purging: bool,
    #[serde(flatten)]
    pub progress: Progress,
}

impl PurgeStatus {
    pub fn started(replica: ReplicaId) -> Self {
        Self {
            replica,
            is_purging: true,
            progress: Progress::started(),
        }
    }
}

impl ProgressRecord for PurgeStatus {
    fn progress(&self) -> &Progress {
        &self.progress
    }
    fn progress_mut(&mut self) -> &mut Progress {
        &mut self.progress
    }
    fn sync_flag(&mut self) {
        self.is_purging = self.progress.is_active();
    }
    fn replica(&self) -> &ReplicaId {
        &self.replica
    }
}

/// Backup progress, one entry per snapshot being backed up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatus {
    /// Backup name.
    pub id: String,
    pub snapshot: String,
    /// Replica the data is read from.
    pub replica: ReplicaId,
    /// Set once the upload completes.
    #[serde(rename = "backupURL")]
    pub backup_url: String,
    #[serde(flatten)]
    pub progress: Progress,
}

impl BackupStatus {
    pub fn started(id: String, snapshot: String, replica: ReplicaId) -> Self {
        Self {
            id,
            snapshot,
            replica,
            backup_url: String::new(),
            progress: Progress::started(),
        }
    }
}

impl ProgressRecord for BackupStatus {
    fn progress(&self) -> &Progress {
        &self.progress
    }
    fn progress_mut(&mut self) -> &mut Progress {
        &mut self.progress
    }
    fn replica(&self) -> &ReplicaId {
        &self.replica
    }
}

/// Checks the record invariants; used by tests and debug assertions.
pub fn invariants_hold<R: ProgressRecord>(record: &R, activity_flag: bool) -> bool {
    let p = record.progress();
    match p.state {
        ProgressState::Complete => p.progress == 100 && p.error.is_empty() && !activity_flag,
        ProgressState::Error => !p.error.is_empty() && !activity_flag,
        ProgressState::InProgress => activity_flag && p.progress <= 100,
        ProgressState::Empty => !activity_flag,
    }
}
