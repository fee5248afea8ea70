use axum::{
    Json,
    extract::{Extension, State},
    http::StatusCode,
};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::{
    AppState,
    error::{AppError, AppResult},
    session::Identity,
};

#[derive(Debug, Deserialize)]
pub struct SubscriptionKeys {
    pub p256dh: String,
    pub auth: String,
}

/// Shape of `PushSubscription.toJSON()` in the browser.
#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    pub endpoint: String,
    pub keys: SubscriptionKeys,
}

#[derive(Debug, Deserialize)]
pub struct UnsubscribeRequest {
    pub endpoint: String,
}

#[axum::debug_handler]
pub async fn subscribe(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<SubscribeRequest>,
) -> AppResult<(StatusCode, Json<Value>)> {
    if !req.endpoint.starts_with("https://") {
        return Err(AppError::bad_request("Некорректный endpoint подписки"));
    }
    if req.keys.p256dh.is_empty() || req.keys.auth.is_empty() {
        return Err(AppError::bad_request("Отсутствуют ключи подписки"));
    }

    let id = state
        .push_subscriptions
        .register(identity.user_id, &req.endpoint, &req.keys.p256dh, &req.keys.auth)
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "success": true, "id": id }))))
}

#[axum::debug_handler]
pub async fn unsubscribe(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<UnsubscribeRequest>,
) -> AppResult<Json<Value>> {
    let removed = state
        .push_subscriptions
        .unregister(identity.user_id, &req.endpoint)
        .await?;
    Ok(Json(json!({ "success": true, "removed": removed })))
}

pub async fn vapid_public_key(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let vapid = state
        .config
        .vapid
        .as_ref()
        .ok_or_else(|| AppError::not_found("Push-уведомления не настроены"))?;
    Ok(Json(json!({ "public_key": vapid.public_key })))
}
