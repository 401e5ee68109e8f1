//! Snapshot and backup-creation endpoints, nested under a volume.

use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use super::{volume_name, DeleteResponse, ListResponse};
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::model::Snapshot;
use crate::state::AppState;

/// /v1/volumes/{name}/snapshots
pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/{name}/snapshots",
            get(list_snapshots).post(create_snapshot),
        )
        .route("/{name}/snapshots/purge", post(purge_snapshots))
        .route("/{name}/snapshots/{snapshot}", delete(delete_snapshot))
        .route("/{name}/snapshots/{snapshot}/backup", post(backup_snapshot))
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct CreateSnapshotRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct BackupRequest {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct BackupAccepted {
    pub volume: String,
    pub snapshot: String,
    pub backup: String,
}

/// GET /v1/volumes/{name}/snapshots
async fn list_snapshots(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
) -> Result<Json<ListResponse<Snapshot>>, ApiError> {
    let name = volume_name(&ctx, &name)?;
    let items = state
        .manager()
        .snapshot_list(&name)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(ListResponse { items }))
}

/// POST /v1/volumes/{name}/snapshots
async fn create_snapshot(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
    Json(req): Json<CreateSnapshotRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let name = volume_name(&ctx, &name)?;
    let snapshot = state
        .manager()
        .snapshot_create(&name, req.name, req.labels)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok((StatusCode::CREATED, Json(snapshot)))
}

/// DELETE /v1/volumes/{name}/snapshots/{snapshot}
async fn delete_snapshot(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path((name, snapshot)): Path<(String, String)>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let name = volume_name(&ctx, &name)?;
    state
        .manager()
        .snapshot_delete(&name, snapshot)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(DeleteResponse { ok: true }))
}

/// POST /v1/volumes/{name}/snapshots/purge
async fn purge_snapshots(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let name = volume_name(&ctx, &name)?;
    let view = state
        .manager()
        .snapshot_purge(&name)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok((StatusCode::ACCEPTED, Json(view)))
}

/// POST /v1/volumes/{name}/snapshots/{snapshot}/backup
async fn backup_snapshot(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path((name, snapshot)): Path<(String, String)>,
    Json(req): Json<BackupRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let volume = volume_name(&ctx, &name)?;
    let backup = state
        .manager()
        .snapshot_backup(&volume, snapshot.clone(), req.labels)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok((
        StatusCode::ACCEPTED,
        Json(BackupAccepted {
            volume: name,
            snapshot,
            backup,
        }),
    ))
}
