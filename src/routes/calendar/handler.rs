use axum::{
    extract::{Extension, State},
    http::header,
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::{
    AppState,
    audit::{AuditCategory, AuditEntry},
    error::AppResult,
    ical,
    routes::RequestMeta,
    session::Identity,
};

#[axum::debug_handler]
pub async fn export_calendar(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    meta: RequestMeta,
) -> AppResult<Response> {
    let scope = identity.family()?;
    let events = ical::family_events(&state.pool, scope.family_id).await?;
    let now = state.clock.now();
    let body = ical::render(&events, now);

    state.audit.spawn(
        AuditEntry::new(scope.user_id, "calendar_export", AuditCategory::DataExport)
            .with_details(json!({ "events": events.len() }))
            .with_client(meta.ip, meta.user_agent),
    );

    Ok((
        [
            (header::CONTENT_TYPE, "text/calendar; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", ical::filename(now.date_naive())),
            ),
        ],
        body,
    )
        .into_response())
}
