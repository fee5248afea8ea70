use axum::{
    Json,
    extract::{Extension, Query, State},
    http::StatusCode,
};
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::{
    AppState,
    audit::{AuditCategory, AuditEntry, AuditFilter, AuditStatus},
    error::{AppError, AppResult},
    routes::RequestMeta,
    session::Identity,
};

#[derive(Debug, Deserialize)]
pub struct AuditRequest {
    pub user_id: Option<Uuid>,
    pub action_type: String,
    pub action_category: AuditCategory,
    pub details: Option<Value>,
    #[serde(default)]
    pub status: AuditStatus,
    pub error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    pub category: Option<AuditCategory>,
    pub limit: Option<i64>,
}

/// Records an entry for the caller. Entries can't be written on behalf of
/// another user.
#[axum::debug_handler]
pub async fn record_audit(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    meta: RequestMeta,
    Json(req): Json<AuditRequest>,
) -> AppResult<(StatusCode, Json<Value>)> {
    if req.user_id.is_some_and(|id| id != identity.user_id) {
        return Err(AppError::forbidden("Нельзя писать журнал за другого пользователя"));
    }
    if req.action_type.trim().is_empty() {
        return Err(AppError::bad_request("action_type обязателен"));
    }

    let mut entry = AuditEntry::new(identity.user_id, req.action_type.trim(), req.action_category)
        .with_details(req.details.unwrap_or_else(|| json!({})))
        .with_client(meta.ip, meta.user_agent);
    if req.status == AuditStatus::Failure {
        entry = entry.failed(req.error_message.unwrap_or_default());
    }

    let logged = state.audit.log(entry).await;
    Ok((StatusCode::CREATED, Json(json!({ "success": logged }))))
}

#[axum::debug_handler]
pub async fn list_audit(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<AuditQuery>,
) -> AppResult<Json<Value>> {
    let records = state
        .audit
        .list(&AuditFilter {
            user_id: Some(identity.user_id),
            category: query.category,
            limit: query.limit,
        })
        .await?;
    Ok(Json(json!({ "success": true, "logs": records })))
}
