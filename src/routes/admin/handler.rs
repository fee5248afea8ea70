use axum::{
    Json,
    extract::State,
    http::HeaderMap,
};
use serde_json::{Value, json};

use crate::{
    AppState,
    error::{AppError, AppResult},
    utils::secrets_match,
};

pub const ADMIN_HEADER: &str = "x-admin-token";

fn require_admin(state: &AppState, headers: &HeaderMap) -> AppResult<()> {
    let expected = state
        .config
        .admin_token
        .as_deref()
        .ok_or_else(|| AppError::forbidden("Административный доступ отключён"))?;
    let provided = headers
        .get(ADMIN_HEADER)
        .and_then(|h| h.to_str().ok())
        .ok_or(AppError::Unauthorized)?;
    if !secrets_match(provided, expected) {
        tracing::warn!("admin token mismatch");
        return Err(AppError::forbidden("Неверный токен администратора"));
    }
    Ok(())
}

#[axum::debug_handler]
pub async fn data_cleanup(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Json<Value>> {
    require_admin(&state, &headers)?;
    let report = state.reaper.reap().await?;
    Ok(Json(json!({ "success": true, "deleted": report, "total": report.total() })))
}

#[axum::debug_handler]
pub async fn run_geofence_scan(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Json<Value>> {
    require_admin(&state, &headers)?;
    let report = state.geofences.scan_and_notify(&state.notifications).await?;
    Ok(Json(json!({ "success": true, "report": report })))
}
