use axum::{
    Json,
    extract::{Extension, State},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{AppState, error::AppResult, middleware::ClientIp, rate_limit::RateLimitAction};

#[derive(Debug, Deserialize)]
pub struct RateLimitRequest {
    pub action_type: RateLimitAction,
    #[serde(default = "default_log_attempt")]
    pub log_attempt: bool,
    pub user_id: Option<Uuid>,
}

fn default_log_attempt() -> bool {
    true
}

/// Explicit counter check for callers that gate their own actions. Unlike the
/// pipeline gate this surfaces store failures.
#[axum::debug_handler]
pub async fn check_rate_limit(
    State(state): State<AppState>,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    Json(req): Json<RateLimitRequest>,
) -> AppResult<Response> {
    let decision = state
        .rate_limiter
        .check(&ip, req.action_type, req.log_attempt, req.user_id)
        .await?;

    if !decision.allowed {
        return Err(decision.into_error());
    }

    let mut response = Json(&decision).into_response();
    decision.apply_headers(response.headers_mut());
    Ok(response)
}
