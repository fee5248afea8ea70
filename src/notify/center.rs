use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::{FutureExt, StreamExt, stream};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use super::push::PushSubscriptionStore;
use super::{
    Channel, EmailTransport, Notification, NotificationDraft, NotificationStatus, PushOutcome,
    PushPayload, PushTarget, PushTransport, SmsTransport,
};
use crate::error::AppResult;

pub const MAX_PAGE_SIZE: i64 = 100;

/// Parallel sends per notification towards the push vendor.
const PUSH_CONCURRENCY: usize = 8;

/// Contact points of one user, loaded before delivery.
#[derive(Debug, Clone, Default)]
pub struct Recipient {
    pub user_id: Uuid,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub push_targets: Vec<PushTarget>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub expired_subscriptions: Vec<Uuid>,
}

impl DeliveryReport {
    /// `None` when nothing external was attempted; the row stays pending.
    pub fn final_status(&self) -> Option<NotificationStatus> {
        if self.succeeded > 0 {
            Some(NotificationStatus::Sent)
        } else if self.attempted > 0 {
            Some(NotificationStatus::Failed)
        } else {
            None
        }
    }

    fn record(&mut self, ok: bool) {
        self.attempted += 1;
        if ok {
            self.succeeded += 1;
        }
    }
}

#[derive(Clone, Default)]
pub struct Transports {
    pub push: Option<Arc<dyn PushTransport>>,
    pub email: Option<Arc<dyn EmailTransport>>,
    pub sms: Option<Arc<dyn SmsTransport>>,
}

impl Transports {
    /// Sends on every requested channel the recipient can be reached on.
    /// A failing channel is logged and never stops the others.
    pub async fn deliver(&self, recipient: &Recipient, draft: &NotificationDraft) -> DeliveryReport {
        let wants = |channel| draft.channels.contains(&channel);

        let push = async {
            let mut report = DeliveryReport::default();
            let Some(transport) = self.push.as_ref().filter(|_| wants(Channel::Push)) else {
                return report;
            };
            let payload = PushPayload {
                title: draft.title.clone(),
                body: draft.message.clone(),
                url: draft.target_url.clone().unwrap_or_else(|| "/".into()),
            };
            let outcomes: Vec<(Uuid, AppResult<PushOutcome>)> =
                stream::iter(recipient.push_targets.iter())
                    .map(|target| {
                        let payload = &payload;
                        async move { (target.id, transport.send(target, payload).await) }
                    })
                    .buffer_unordered(PUSH_CONCURRENCY)
                    .collect::<Vec<_>>()
                    .boxed()
                    .await;

            for (subscription_id, outcome) in outcomes {
                match outcome {
                    Ok(PushOutcome::Delivered) => report.record(true),
                    Ok(PushOutcome::Expired) => {
                        report.record(false);
                        report.expired_subscriptions.push(subscription_id);
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, %subscription_id, "push delivery failed");
                        report.record(false);
                    }
                }
            }
            report
        };

        let email = async {
            let (Some(transport), Some(address)) = (
                self.email.as_ref().filter(|_| wants(Channel::Email)),
                recipient.email.as_deref(),
            ) else {
                return None;
            };
            let mut body = draft.message.clone();
            if let Some(url) = &draft.target_url {
                body.push_str("\n\n");
                body.push_str(url);
            }
            let result = transport.send(address, &draft.title, &body).await;
            if let Err(err) = &result {
                tracing::warn!(error = %err, user_id = %recipient.user_id, "email delivery failed");
            }
            Some(result.is_ok())
        };

        let sms = async {
            let (Some(transport), Some(phone)) = (
                self.sms.as_ref().filter(|_| wants(Channel::Sms)),
                recipient.phone.as_deref(),
            ) else {
                return None;
            };
            let text = format!("{}: {}", draft.title, draft.message);
            let result = transport.send(phone, &text).await;
            if let Err(err) = &result {
                tracing::warn!(error = %err, user_id = %recipient.user_id, "sms delivery failed");
            }
            Some(result.is_ok())
        };

        let (mut report, email_ok, sms_ok) = futures_util::join!(push, email, sms);
        for ok in [email_ok, sms_ok].into_iter().flatten() {
            report.record(ok);
        }
        report
    }
}

#[derive(Debug, Serialize)]
pub struct NotificationPage {
    pub notifications: Vec<Notification>,
    pub unread_count: i64,
}

#[derive(sqlx::FromRow)]
struct ContactRow {
    email: Option<String>,
    phone: Option<String>,
}

pub struct NotificationCenter {
    pool: PgPool,
    subscriptions: PushSubscriptionStore,
    transports: Transports,
}

impl NotificationCenter {
    pub fn new(pool: PgPool, transports: Transports) -> Self {
        Self {
            subscriptions: PushSubscriptionStore::new(pool.clone()),
            pool,
            transports,
        }
    }

    /// Persists the notification, then delivers it. The insert is committed
    /// before any vendor is contacted.
    pub async fn notify(&self, user_id: Uuid, draft: &NotificationDraft) -> AppResult<Notification> {
        let mut notification = self.persist(user_id, draft).await?;
        let recipient = self.recipient(user_id, draft).await?;
        let report = self.transports.deliver(&recipient, draft).await;

        for subscription_id in &report.expired_subscriptions {
            if let Err(err) = self.subscriptions.deactivate(*subscription_id).await {
                tracing::warn!(error = %err, %subscription_id, "failed to deactivate push subscription");
            }
        }

        if let Some(status) = report.final_status() {
            let sent_at = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
                r#"
                UPDATE notifications
                SET status = $2,
                    sent_at = CASE WHEN $2 = 'sent' THEN NOW() ELSE sent_at END
                WHERE id = $1 AND status <> 'read'
                RETURNING sent_at
                "#,
            )
            .bind(notification.id)
            .bind(status)
            .fetch_optional(&self.pool)
            .await?;
            if let Some(sent_at) = sent_at {
                notification.status = status;
                notification.sent_at = sent_at;
            }
        }

        tracing::debug!(
            notification_id = %notification.id,
            kind = %notification.kind,
            attempted = report.attempted,
            succeeded = report.succeeded,
            "notification processed"
        );
        Ok(notification)
    }

    /// Sends the same draft to several users; one failing user does not stop the rest.
    pub async fn notify_many(&self, user_ids: &[Uuid], draft: &NotificationDraft) -> usize {
        let mut delivered = 0;
        for user_id in user_ids {
            match self.notify(*user_id, draft).await {
                Ok(_) => delivered += 1,
                Err(err) => tracing::warn!(error = %err, %user_id, kind = %draft.kind, "notification failed"),
            }
        }
        delivered
    }

    pub async fn list(
        &self,
        user_id: Uuid,
        limit: Option<i64>,
        offset: Option<i64>,
        kind: Option<&str>,
    ) -> AppResult<NotificationPage> {
        let limit = limit.unwrap_or(20).clamp(1, MAX_PAGE_SIZE);
        let offset = offset.unwrap_or(0).max(0);

        let notifications = sqlx::query_as::<_, Notification>(
            r#"
            SELECT id, user_id, type, title, message, target_url, channel, status,
                   sent_at, read_at, created_at
            FROM notifications
            WHERE user_id = $1 AND ($2::text IS NULL OR type = $2)
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(user_id)
        .bind(kind)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(NotificationPage {
            notifications,
            unread_count: self.unread_count(user_id).await?,
        })
    }

    pub async fn unread_count(&self, user_id: Uuid) -> AppResult<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM notifications WHERE user_id = $1 AND status <> 'read'",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn mark_read(&self, user_id: Uuid, notification_id: Uuid) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET status = 'read', read_at = NOW()
            WHERE id = $1 AND user_id = $2 AND status <> 'read'
            "#,
        )
        .bind(notification_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_all_read(&self, user_id: Uuid) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET status = 'read', read_at = NOW()
            WHERE user_id = $1 AND status <> 'read'
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn persist(&self, user_id: Uuid, draft: &NotificationDraft) -> AppResult<Notification> {
        let notification = sqlx::query_as::<_, Notification>(
            r#"
            INSERT INTO notifications (id, user_id, type, title, message, target_url, channel, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', NOW())
            RETURNING id, user_id, type, title, message, target_url, channel, status,
                      sent_at, read_at, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(&draft.kind)
        .bind(&draft.title)
        .bind(&draft.message)
        .bind(&draft.target_url)
        .bind(draft.primary_channel())
        .fetch_one(&self.pool)
        .await?;
        Ok(notification)
    }

    async fn recipient(&self, user_id: Uuid, draft: &NotificationDraft) -> AppResult<Recipient> {
        let contact = sqlx::query_as::<_, ContactRow>("SELECT email, phone FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        let push_targets = if draft.channels.contains(&Channel::Push) {
            self.subscriptions.active_for_user(user_id).await?
        } else {
            Vec::new()
        };

        Ok(Recipient {
            user_id,
            email: contact.as_ref().and_then(|c| c.email.clone()),
            phone: contact.and_then(|c| c.phone),
            push_targets,
        })
    }
}
