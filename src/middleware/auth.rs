use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::Response,
};

use crate::{AppState, error::AppError};

pub const AUTH_HEADER: &str = "x-auth-token";

/// The raw token of the current request, kept for logout and password change.
#[derive(Debug, Clone)]
pub struct SessionToken(pub String);

/// Resolves `X-Auth-Token` to an [`Identity`](crate::session::Identity) and
/// stores it in the request extensions for the handlers.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    let token = req
        .headers()
        .get(AUTH_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(AppError::Unauthorized)?
        .to_string();

    let identity = state.sessions.resolve(&token).await?;
    tracing::debug!(user_id = %identity.user_id, family_id = ?identity.family_id, "request authenticated");

    req.extensions_mut().insert(identity);
    req.extensions_mut().insert(SessionToken(token));
    Ok(next.run(req).await)
}
