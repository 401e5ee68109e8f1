//! holdfast storage manager library.
//!
//! The crate ships the `holdfast-manager` binary; the library surface exists
//! so integration tests and the test-support crate can run the real router.

pub mod actors;
pub mod api;
pub mod backupstore;
pub mod config;
pub mod error;
pub mod events;
pub mod expansion;
pub mod image;
pub mod machine;
pub mod manager;
pub mod model;
pub mod runtime;
pub mod scheduler;
pub mod settings;
pub mod state;
