//! # holdfast-id
//!
//! Resource names and generated identifiers for holdfast.
//!
//! ## Names vs IDs
//!
//! - Names (`VolumeName`, `NodeName`) are chosen by the operator and validated
//!   against the same rules the block device path and instance managers use.
//! - IDs (`ReplicaId`, `EngineId`, `SnapshotId`, ...) are generated by the
//!   manager and never supplied by users.
//!
//! ## ID Format
//!
//! Generated IDs use a prefixed, lowercase format: `{prefix}-{ulid}`
//!
//! Examples:
//! - `r-01hv4z2wqxkjnm8gpqy6vbkc3d`
//! - `snap-01hv4z3mxnkpqr9hstz7wcld4e`
//!
//! Lowercase keeps every ID usable as a replica data directory name and as an
//! instance name inside an instance manager.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
