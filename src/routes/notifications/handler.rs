use axum::{
    Json,
    extract::{Extension, Query, State},
};
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::{AppState, error::AppResult, session::Identity};

#[derive(Debug, Default, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListAction {
    #[default]
    List,
    Count,
}

#[derive(Debug, Deserialize)]
pub struct NotificationQuery {
    #[serde(default)]
    pub action: ListAction,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum NotificationCommand {
    MarkRead { id: Uuid },
    MarkAllRead,
}

#[axum::debug_handler]
pub async fn get_notifications(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<NotificationQuery>,
) -> AppResult<Json<Value>> {
    match query.action {
        ListAction::Count => {
            let unread_count = state.notifications.unread_count(identity.user_id).await?;
            Ok(Json(json!({ "success": true, "unread_count": unread_count })))
        }
        ListAction::List => {
            let page = state
                .notifications
                .list(identity.user_id, query.limit, query.offset, query.kind.as_deref())
                .await?;
            Ok(Json(json!({
                "success": true,
                "notifications": page.notifications,
                "unread_count": page.unread_count,
            })))
        }
    }
}

#[axum::debug_handler]
pub async fn update_notifications(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(command): Json<NotificationCommand>,
) -> AppResult<Json<Value>> {
    match command {
        NotificationCommand::MarkRead { id } => {
            let updated = state.notifications.mark_read(identity.user_id, id).await?;
            Ok(Json(json!({ "success": true, "updated": updated })))
        }
        NotificationCommand::MarkAllRead => {
            let updated = state.notifications.mark_all_read(identity.user_id).await?;
            Ok(Json(json!({ "success": true, "updated": updated })))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_are_tagged_by_action() {
        let id = Uuid::new_v4();
        let cmd: NotificationCommand =
            serde_json::from_value(json!({ "action": "mark_read", "id": id })).unwrap();
        assert!(matches!(cmd, NotificationCommand::MarkRead { id: got } if got == id));

        let cmd: NotificationCommand =
            serde_json::from_value(json!({ "action": "mark_all_read" })).unwrap();
        assert!(matches!(cmd, NotificationCommand::MarkAllRead));

        assert!(serde_json::from_value::<NotificationCommand>(json!({ "action": "mark_read" })).is_err());
    }
}
