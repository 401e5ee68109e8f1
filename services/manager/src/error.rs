//! Manager error type.
//!
//! Variants follow how a caller must react: `NotFound`/`InvalidArgument` are
//! caller bugs, `InvalidState` and `IncrementalRestoreInProgress` are rejected
//! transitions (re-check state, do not retry blindly), the rest are failures
//! of a collaborator.

use holdfast_id::IdError;
use thiserror::Error;

use crate::backupstore::BackupStoreError;
use crate::runtime::RuntimeError;
use crate::scheduler::SchedulingError;

pub type Result<T, E = ManagerError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error(
        "volume {volume} hasn't finished incremental restored: \
         last restored backup '{last_restored}', last backup '{last_backup}'"
    )]
    IncrementalRestoreInProgress {
        volume: String,
        last_restored: String,
        last_backup: String,
    },

    #[error("insufficient storage: {0}")]
    InsufficientStorage(String),

    #[error("backup target is not set")]
    BackupTargetNotSet,

    #[error("volume {0} is unavailable")]
    Unavailable(String),

    #[error(transparent)]
    Id(#[from] IdError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    BackupStore(#[from] BackupStoreError),

    #[error(transparent)]
    Scheduling(#[from] SchedulingError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ManagerError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Stable machine-readable code used in API problem documents.
    pub fn code(&self) -> &'static str {
        match self {
            ManagerError::NotFound { .. } => "not_found",
            ManagerError::AlreadyExists { .. } => "already_exists",
            ManagerError::InvalidArgument(_) | ManagerError::Id(_) => "invalid_argument",
            ManagerError::InvalidState(_) => "invalid_state",
            ManagerError::IncrementalRestoreInProgress { .. } => "incremental_restore_in_progress",
            ManagerError::InsufficientStorage(_) => "insufficient_storage",
            ManagerError::BackupTargetNotSet => "backup_target_not_set",
            ManagerError::Unavailable(_) => "unavailable",
            ManagerError::Runtime(_) => "runtime_error",
            ManagerError::BackupStore(_) => "backup_store_error",
            ManagerError::Scheduling(_) => "scheduling_error",
            ManagerError::Io(_) => "io_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_names_volume_once() {
        let err = ManagerError::Unavailable("vol-a (actor stopped)".to_string());
        assert_eq!(err.to_string(), "volume vol-a (actor stopped) is unavailable");
        assert_eq!(err.code(), "unavailable");
    }
}
