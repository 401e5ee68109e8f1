//! # holdfast-events
//!
//! Event envelope, lifecycle event payloads and the status enums shared by
//! the manager and its clients.
//!
//! ## Event Envelope
//!
//! All events share a common envelope with:
//! - Global ordering (`event_id`)
//! - Per-volume ordering (`aggregate_type`, `aggregate_id`, `aggregate_seq`)
//! - The emitting component (`actor_id`)
//!
//! ## Event Types
//!
//! - Volume lifecycle (`volume.*`)
//! - Replica health and rebuilds (`replica.*`)
//! - Snapshots (`snapshot.*`)
//! - Backups and restores (`backup.*`, `restore.*`)

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use types::*;
