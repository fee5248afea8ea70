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
    audit::{AuditCategory, AuditEntry},
    error::AppResult,
    geofence::{FixInput, NewGeofence},
    routes::RequestMeta,
    session::Identity,
};

#[derive(Debug, Deserialize)]
pub struct GeofenceIdQuery {
    pub id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<i64>,
}

#[axum::debug_handler]
pub async fn list_geofences(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> AppResult<Json<Value>> {
    let scope = identity.family()?;
    let zones = state.geofences.list_zones(scope.family_id).await?;
    Ok(Json(json!({ "success": true, "geofences": zones })))
}

#[axum::debug_handler]
pub async fn create_geofence(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(zone): Json<NewGeofence>,
) -> AppResult<(StatusCode, Json<Value>)> {
    let scope = identity.family()?;
    zone.validate()?;
    let created = state.geofences.create_zone(scope.family_id, &zone).await?;
    tracing::info!(family_id = %scope.family_id, geofence_id = %created.id, "geofence created");
    Ok((StatusCode::CREATED, Json(json!({ "success": true, "geofence": created }))))
}

#[axum::debug_handler]
pub async fn delete_geofence(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<GeofenceIdQuery>,
) -> AppResult<Json<Value>> {
    let scope = identity.family()?;
    state.geofences.delete_zone(scope.family_id, query.id).await?;
    Ok(Json(json!({ "success": true })))
}

/// Stores a fix for the caller and evaluates it against the family's zones.
#[axum::debug_handler]
pub async fn report_location(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    meta: RequestMeta,
    Json(fix): Json<FixInput>,
) -> AppResult<(StatusCode, Json<Value>)> {
    let scope = identity.family()?;
    let outcome = state.geofences.ingest(&scope, fix).await?;

    state.audit.spawn(
        AuditEntry::new(scope.user_id, "location_update", AuditCategory::Location)
            .with_details(json!({
                "evaluated": outcome.evaluated,
                "events": outcome.events.len(),
            }))
            .with_client(meta.ip, meta.user_agent),
    );

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "location": outcome.fix,
            "evaluated": outcome.evaluated,
            "events": outcome.events,
        })),
    ))
}

#[axum::debug_handler]
pub async fn list_locations(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> AppResult<Json<Value>> {
    let scope = identity.family()?;
    let locations = state.geofences.latest_locations(scope.family_id).await?;
    Ok(Json(json!({ "success": true, "locations": locations })))
}

#[axum::debug_handler]
pub async fn list_geofence_events(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<EventsQuery>,
) -> AppResult<Json<Value>> {
    let scope = identity.family()?;
    let events = state
        .geofences
        .recent_events(scope.family_id, query.limit.unwrap_or(50).clamp(1, 100))
        .await?;
    Ok(Json(json!({ "success": true, "events": events })))
}
