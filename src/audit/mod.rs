//! Append-only audit trail for security-relevant actions.
//!
//! Writing is best effort: callers never see an audit failure, it is only logged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::AppResult;

pub const MAX_QUERY_ROWS: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum AuditCategory {
    Auth,
    Location,
    DataExport,
    AccountManagement,
    Payment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum AuditStatus {
    #[default]
    Success,
    Failure,
}

#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub user_id: Uuid,
    pub action_type: String,
    pub category: AuditCategory,
    pub details: Value,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub status: AuditStatus,
    pub error_message: Option<String>,
}

impl AuditEntry {
    pub fn new(user_id: Uuid, action_type: impl Into<String>, category: AuditCategory) -> Self {
        Self {
            user_id,
            action_type: action_type.into(),
            category,
            details: Value::Object(Default::default()),
            ip_address: None,
            user_agent: None,
            status: AuditStatus::Success,
            error_message: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_client(mut self, ip: Option<String>, user_agent: Option<String>) -> Self {
        self.ip_address = ip;
        self.user_agent = user_agent;
        self
    }

    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.status = AuditStatus::Failure;
        self.error_message = Some(error.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AuditRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub action_type: String,
    pub action_category: AuditCategory,
    pub details: Value,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub status: AuditStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct AuditFilter {
    pub user_id: Option<Uuid>,
    pub category: Option<AuditCategory>,
    pub limit: Option<i64>,
}

impl AuditFilter {
    fn effective_limit(&self) -> i64 {
        self.limit.unwrap_or(MAX_QUERY_ROWS).clamp(1, MAX_QUERY_ROWS)
    }
}

#[derive(Clone)]
pub struct AuditSink {
    pool: PgPool,
}

impl AuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Returns whether the row was written.
    pub async fn log(&self, entry: AuditEntry) -> bool {
        let result = sqlx::query(
            r#"
            INSERT INTO audit_logs (
                id, user_id, action_type, action_category, details,
                ip_address, user_agent, status, error_message, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(entry.user_id)
        .bind(&entry.action_type)
        .bind(entry.category)
        .bind(&entry.details)
        .bind(&entry.ip_address)
        .bind(&entry.user_agent)
        .bind(entry.status)
        .bind(&entry.error_message)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    user_id = %entry.user_id,
                    action = %entry.action_type,
                    "failed to write audit log"
                );
                false
            }
        }
    }

    /// Fire-and-forget variant for request handlers.
    pub fn spawn(&self, entry: AuditEntry) {
        let sink = self.clone();
        tokio::spawn(async move {
            sink.log(entry).await;
        });
    }

    pub async fn list(&self, filter: &AuditFilter) -> AppResult<Vec<AuditRecord>> {
        let records = sqlx::query_as::<_, AuditRecord>(
            r#"
            SELECT id, user_id, action_type, action_category, details,
                   ip_address, user_agent, status, error_message, created_at
            FROM audit_logs
            WHERE ($1::uuid IS NULL OR user_id = $1)
              AND ($2::text IS NULL OR action_category = $2)
            ORDER BY created_at DESC
            LIMIT $3
            "#,
        )
        .bind(filter.user_id)
        .bind(filter.category)
        .bind(filter.effective_limit())
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builder_marks_failures() {
        let user = Uuid::new_v4();
        let entry = AuditEntry::new(user, "login", AuditCategory::Auth)
            .with_details(json!({ "method": "password" }))
            .with_client(Some("10.0.0.1".into()), None)
            .failed("bad password");
        assert_eq!(entry.status, AuditStatus::Failure);
        assert_eq!(entry.error_message.as_deref(), Some("bad password"));
        assert_eq!(entry.details["method"], "password");
        assert_eq!(entry.ip_address.as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn query_limit_is_capped() {
        let filter = AuditFilter {
            limit: Some(5000),
            ..Default::default()
        };
        assert_eq!(filter.effective_limit(), 100);
        assert_eq!(AuditFilter::default().effective_limit(), 100);
        let filter = AuditFilter {
            limit: Some(0),
            ..Default::default()
        };
        assert_eq!(filter.effective_limit(), 1);
    }

    #[test]
    fn categories_use_snake_case() {
        assert_eq!(
            serde_json::to_value(AuditCategory::DataExport).unwrap(),
            json!("data_export")
        );
        let parsed: AuditCategory = serde_json::from_value(json!("account_management")).unwrap();
        assert_eq!(parsed, AuditCategory::AccountManagement);
    }
}
