use axum::{
    Json,
    extract::{Extension, Query, State},
};
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use super::model::{HealthProfile, HealthProfileInput};
use crate::{
    AppState,
    error::AppResult,
    session::{FamilyScope, Identity},
};

#[derive(Debug, Deserialize)]
pub struct ProfileQuery {
    pub member_id: Option<Uuid>,
}

/// Members manage their own profile; owners and admins manage everyone's.
async fn target_member(state: &AppState, scope: &FamilyScope, requested: Option<Uuid>) -> AppResult<Uuid> {
    match requested {
        None => Ok(scope.member_id),
        Some(member_id) if member_id == scope.member_id => Ok(member_id),
        Some(member_id) => {
            scope.require_manager()?;
            HealthProfile::ensure_member(&state.pool, scope.family_id, member_id).await?;
            Ok(member_id)
        }
    }
}

#[axum::debug_handler]
pub async fn get_health_profile(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<ProfileQuery>,
) -> AppResult<Json<Value>> {
    let scope = identity.family()?;
    let member_id = target_member(&state, &scope, query.member_id).await?;
    let profile = HealthProfile::load(&state.pool, &state.vault, scope.family_id, member_id).await?;
    Ok(Json(json!({ "success": true, "profile": profile })))
}

#[axum::debug_handler]
pub async fn save_health_profile(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(input): Json<HealthProfileInput>,
) -> AppResult<Json<Value>> {
    let scope = identity.family()?;
    let member_id = target_member(&state, &scope, input.member_id).await?;
    let profile =
        HealthProfile::save(&state.pool, &state.vault, scope.family_id, member_id, &input).await?;
    tracing::info!(family_id = %scope.family_id, %member_id, "health profile saved");
    Ok(Json(json!({ "success": true, "profile": profile })))
}
