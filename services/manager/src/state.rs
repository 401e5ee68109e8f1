//! Application state shared across request handlers.

use std::sync::Arc;

use crate::manager::VolumeManager;

/// Shared application state.
///
/// Handlers reach the volume manager through Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    manager: Arc<VolumeManager>,
}

impl AppState {
    pub fn new(manager: Arc<VolumeManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<VolumeManager> {
        &self.manager
    }
}
