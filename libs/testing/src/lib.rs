//! Support library for holdfast integration tests.
//!
//! Tests build a [`ManagerClient`] for a running manager (or start one
//! in-process with [`TestServer`]) and drive it through the wait, workflow
//! and data helpers. Every wait is bounded by the client's
//! [`PollPolicy`](holdfast_reconcile::PollPolicy).

pub mod client;
pub mod data;
pub mod error;
pub mod server;
pub mod wait;
pub mod workflow;

pub use client::{BackupAccepted, ManagerClient};
pub use data::{
    check_volume_data, generate_random_data, generate_random_pos, volume_checksum,
    write_volume_data, write_volume_random_data, VolumeData, DATA_SIZE,
};
pub use error::{ClientError, Result};
pub use server::{node_name, TestServer, TestServerConfig, DEFAULT_DISK};
pub use wait::*;
pub use workflow::*;
