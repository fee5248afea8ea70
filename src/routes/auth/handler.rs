use axum::{
    Json,
    extract::{Extension, State},
    http::StatusCode,
};
use serde_json::{Value, json};

use super::model::{
    ChangePasswordRequest, LoginRequest, RegisterRequest, SessionResponse, User, validate_password,
};
use crate::{
    AppState,
    audit::{AuditCategory, AuditEntry},
    error::{AppError, AppResult},
    middleware::SessionToken,
    routes::RequestMeta,
    session::Identity,
};

#[axum::debug_handler]
pub async fn register(
    State(state): State<AppState>,
    meta: RequestMeta,
    Json(req): Json<RegisterRequest>,
) -> AppResult<(StatusCode, Json<SessionResponse>)> {
    let (email, phone) = req.contacts()?;
    let user = User::create(&state.pool, &req, email, phone).await?;
    let session = state.sessions.issue(user.id, state.config.session_ttl()).await?;

    state.audit.spawn(
        AuditEntry::new(user.id, "register", AuditCategory::AccountManagement)
            .with_client(meta.ip, meta.user_agent),
    );
    tracing::info!(user_id = %user.id, "user registered");

    Ok((
        StatusCode::CREATED,
        Json(SessionResponse {
            success: true,
            user,
            token: session.token,
            expires_at: session.expires_at,
        }),
    ))
}

#[axum::debug_handler]
pub async fn login(
    State(state): State<AppState>,
    meta: RequestMeta,
    Json(req): Json<LoginRequest>,
) -> AppResult<Json<SessionResponse>> {
    let Some(user) = User::find_by_login(&state.pool, &req.login).await? else {
        tracing::info!("login for unknown account");
        return Err(AppError::Unauthorized);
    };

    if !user.verify_login(&req.password)? {
        state.audit.spawn(
            AuditEntry::new(user.id, "login", AuditCategory::Auth)
                .with_client(meta.ip, meta.user_agent)
                .failed("invalid password"),
        );
        return Err(AppError::Unauthorized);
    }

    let session = state.sessions.issue(user.id, state.config.session_ttl()).await?;
    User::touch_login(&state.pool, user.id).await?;
    state.audit.spawn(
        AuditEntry::new(user.id, "login", AuditCategory::Auth).with_client(meta.ip, meta.user_agent),
    );

    Ok(Json(SessionResponse {
        success: true,
        user,
        token: session.token,
        expires_at: session.expires_at,
    }))
}

#[axum::debug_handler]
pub async fn logout(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Extension(SessionToken(token)): Extension<SessionToken>,
    meta: RequestMeta,
) -> AppResult<Json<Value>> {
    state.sessions.revoke(&token).await?;
    state.audit.spawn(
        AuditEntry::new(identity.user_id, "logout", AuditCategory::Auth)
            .with_client(meta.ip, meta.user_agent),
    );
    Ok(Json(json!({ "success": true })))
}

/// Changes the password and signs out every other session of the user.
#[axum::debug_handler]
pub async fn change_password(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Extension(SessionToken(token)): Extension<SessionToken>,
    meta: RequestMeta,
    Json(req): Json<ChangePasswordRequest>,
) -> AppResult<Json<Value>> {
    validate_password(&req.new_password)?;
    let user = User::find_by_id(&state.pool, identity.user_id).await?;

    if !user.verify_login(&req.current_password)? {
        state.audit.spawn(
            AuditEntry::new(user.id, "password_change", AuditCategory::Auth)
                .with_client(meta.ip, meta.user_agent)
                .failed("current password mismatch"),
        );
        return Err(AppError::bad_request("Неверный текущий пароль"));
    }

    User::update_password(&state.pool, user.id, &req.new_password).await?;
    let revoked = state.sessions.revoke_others(user.id, &token).await?;
    state.audit.spawn(
        AuditEntry::new(user.id, "password_change", AuditCategory::Auth)
            .with_details(json!({ "revoked_sessions": revoked }))
            .with_client(meta.ip, meta.user_agent),
    );

    Ok(Json(json!({ "success": true, "revoked_sessions": revoked })))
}
