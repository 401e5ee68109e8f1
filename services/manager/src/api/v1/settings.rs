//! Settings endpoints.

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use super::ListResponse;
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::settings::Setting;
use crate::state::AppState;

/// /v1/settings
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_settings))
        .route("/{name}", get(get_setting).put(update_setting))
}

#[derive(Debug, Deserialize, Serialize)]
pub struct UpdateSettingRequest {
    pub value: String,
}

async fn list_settings(State(state): State<AppState>) -> Json<ListResponse<Setting>> {
    Json(ListResponse {
        items: state.manager().setting_list().await,
    })
}

async fn get_setting(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
) -> Result<Json<Setting>, ApiError> {
    let setting = state
        .manager()
        .setting_get(&name)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(setting))
}

async fn update_setting(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
    Json(req): Json<UpdateSettingRequest>,
) -> Result<Json<Setting>, ApiError> {
    let setting = state
        .manager()
        .setting_update(&name, &req.value)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(setting))
}
