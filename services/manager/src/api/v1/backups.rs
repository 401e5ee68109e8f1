//! Backup volume and backup endpoints against the configured backup target.

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};

use super::{DeleteResponse, ListResponse};
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::backupstore::{Backup, BackupVolume};
use crate::state::AppState;

/// /v1/backupvolumes
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_backup_volumes))
        .route(
            "/{volume}",
            get(get_backup_volume).delete(delete_backup_volume),
        )
        .route("/{volume}/backups", get(list_backups))
        .route(
            "/{volume}/backups/{backup}",
            get(get_backup).delete(delete_backup),
        )
}

async fn list_backup_volumes(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> Result<Json<ListResponse<BackupVolume>>, ApiError> {
    let items = state
        .manager()
        .backup_volume_list()
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(ListResponse { items }))
}

async fn get_backup_volume(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(volume): Path<String>,
) -> Result<Json<BackupVolume>, ApiError> {
    let backup_volume = state
        .manager()
        .backup_volume_get(&volume)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(backup_volume))
}

async fn delete_backup_volume(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(volume): Path<String>,
) -> Result<Json<DeleteResponse>, ApiError> {
    state
        .manager()
        .backup_volume_delete(&volume)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(DeleteResponse { ok: true }))
}

async fn list_backups(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(volume): Path<String>,
) -> Result<Json<ListResponse<Backup>>, ApiError> {
    let items = state
        .manager()
        .backup_list(&volume)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(ListResponse { items }))
}

async fn get_backup(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path((volume, backup)): Path<(String, String)>,
) -> Result<Json<Backup>, ApiError> {
    let backup = state
        .manager()
        .backup_get(&volume, &backup)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(backup))
}

async fn delete_backup(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path((volume, backup)): Path<(String, String)>,
) -> Result<Json<DeleteResponse>, ApiError> {
    state
        .manager()
        .backup_delete(&volume, &backup)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(DeleteResponse { ok: true }))
}
