//! API v1 routes.

mod backups;
mod instance_managers;
mod nodes;
mod settings;
mod snapshots;
mod volumes;

use axum::Router;
use holdfast_id::{NodeName, VolumeName};
use serde::Serialize;

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::error::ManagerError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .nest("/volumes", volumes::routes().merge(snapshots::routes()))
        .nest("/backupvolumes", backups::routes())
        .nest("/nodes", nodes::routes())
        .nest("/instancemanagers", instance_managers::routes())
        .nest("/settings", settings::routes())
}

#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub ok: bool,
}

fn volume_name(ctx: &RequestContext, name: &str) -> Result<VolumeName, ApiError> {
    VolumeName::parse(name).map_err(|e| ctx.error(ManagerError::from(e)))
}

fn node_name(ctx: &RequestContext, name: &str) -> Result<NodeName, ApiError> {
    NodeName::parse(name).map_err(|e| ctx.error(ManagerError::from(e)))
}
