//! Per-user notifications and their delivery over push, email and SMS.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppResult;

pub mod center;
pub mod digest;
pub mod email;
pub mod push;
pub mod sms;

pub use center::NotificationCenter;
pub use push::{PushSubscriptionStore, WebPushClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum Channel {
    Push,
    Email,
    Sms,
    InApp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Sent,
    Read,
    Failed,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(rename = "type")]
    #[sqlx(rename = "type")]
    pub kind: String,
    pub title: String,
    pub message: String,
    pub target_url: Option<String>,
    pub channel: Channel,
    pub status: NotificationStatus,
    pub sent_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A notification before it is persisted.
#[derive(Debug, Clone)]
pub struct NotificationDraft {
    pub kind: String,
    pub title: String,
    pub message: String,
    pub target_url: Option<String>,
    pub channels: Vec<Channel>,
}

impl NotificationDraft {
    pub fn new(kind: impl Into<String>, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            title: title.into(),
            message: message.into(),
            target_url: None,
            channels: vec![Channel::InApp],
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.target_url = Some(url.into());
        self
    }

    pub fn via(mut self, channels: &[Channel]) -> Self {
        self.channels = channels.to_vec();
        self
    }

    /// Channel recorded on the row: the first external one requested.
    pub fn primary_channel(&self) -> Channel {
        [Channel::Push, Channel::Email, Channel::Sms]
            .into_iter()
            .find(|c| self.channels.contains(c))
            .unwrap_or(Channel::InApp)
    }
}

/// Body of a Web Push message as the service worker expects it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PushPayload {
    pub title: String,
    pub body: String,
    pub url: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PushTarget {
    pub id: Uuid,
    pub endpoint: String,
    pub p256dh: String,
    pub auth: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Delivered,
    /// Vendor reported the subscription gone (404/410).
    Expired,
}

#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn send(&self, target: &PushTarget, payload: &PushPayload) -> AppResult<PushOutcome>;
}

#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> AppResult<()>;
}

#[async_trait]
pub trait SmsTransport: Send + Sync {
    async fn send(&self, phone: &str, text: &str) -> AppResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_channel_prefers_push() {
        let draft = NotificationDraft::new("task_assigned", "t", "m")
            .via(&[Channel::Sms, Channel::Email, Channel::Push]);
        assert_eq!(draft.primary_channel(), Channel::Push);

        let draft = NotificationDraft::new("x", "t", "m").via(&[Channel::InApp, Channel::Sms]);
        assert_eq!(draft.primary_channel(), Channel::Sms);

        assert_eq!(NotificationDraft::new("x", "t", "m").primary_channel(), Channel::InApp);
    }
}
