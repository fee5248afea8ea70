use axum::{
    Json,
    extract::{Extension, Query, State},
};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::{
    AppState,
    billing::{FeatureSet, LimitKind},
    error::AppResult,
    session::Identity,
};

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    #[serde(rename = "type")]
    pub kind: LimitKind,
}

#[derive(Debug, Deserialize)]
pub struct IncrementRequest {
    #[serde(rename = "type")]
    pub kind: LimitKind,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SubscriptionCommand {
    CancelAutoRenew,
}

#[axum::debug_handler]
pub async fn check_limit(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<LimitQuery>,
) -> AppResult<Json<Value>> {
    let scope = identity.family()?;
    let today = state.clock.now().date_naive();
    let limit = state.limits.check(scope.family_id, query.kind, today).await?;
    Ok(Json(json!({ "success": true, "limit": limit })))
}

/// Consumes one unit of a free-plan counter; answers 402 once the cap is hit.
#[axum::debug_handler]
pub async fn increment_limit(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<IncrementRequest>,
) -> AppResult<Json<Value>> {
    let scope = identity.family()?;
    let today = state.clock.now().date_naive();
    let limit = state.limits.increment(scope.family_id, req.kind, today).await?;
    Ok(Json(json!({ "success": true, "limit": limit })))
}

#[axum::debug_handler]
pub async fn get_subscription(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> AppResult<Json<Value>> {
    let scope = identity.family()?;
    let subscription = state.subscriptions.current(scope.family_id).await?;
    let mut features = serde_json::Map::new();
    for (name, feature) in [
        ("premium", FeatureSet::Premium),
        ("ai", FeatureSet::Ai),
        ("family", FeatureSet::Family),
    ] {
        let entitled = state.subscriptions.is_entitled(scope.family_id, feature).await?;
        features.insert(name.to_string(), json!(entitled));
    }
    Ok(Json(json!({
        "success": true,
        "subscription": subscription,
        "is_premium": subscription.is_some(),
        "features": features,
    })))
}

#[axum::debug_handler]
pub async fn update_subscription(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(command): Json<SubscriptionCommand>,
) -> AppResult<Json<Value>> {
    let scope = identity.family()?;
    scope.require_manager()?;
    match command {
        SubscriptionCommand::CancelAutoRenew => {
            let updated = state.subscriptions.cancel_auto_renew(scope.family_id).await?;
            tracing::info!(family_id = %scope.family_id, updated, "auto renewal canceled");
            Ok(Json(json!({ "success": true, "updated": updated })))
        }
    }
}
