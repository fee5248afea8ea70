//! Daily recurring charge of subscriptions close to their end date.
//!
//! Each (subscription, cycle date) owns one row in `subscription_payments`.
//! The row is claimed before the vendor is called and the vendor receives an
//! idempotency key derived from the same pair, so a cycle is charged at most
//! once no matter how often the job runs. Transport failures leave the row
//! pending for the next tick; charges are never retried inline.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use super::gateway::{ChargeOutcome, ChargeRequest, PaymentGateway};
use super::{SUBSCRIPTION_COLUMNS, Subscription};
use crate::audit::{AuditCategory, AuditEntry, AuditSink};
use crate::error::AppResult;
use crate::notify::{Channel, NotificationCenter, NotificationDraft};
use crate::session::MemberRole;
use crate::utils::sha256_hex;

/// Subscriptions ending within this many days of today are renewed.
pub const RENEWAL_LEAD_DAYS: i64 = 3;

pub fn idempotency_key(subscription_id: Uuid, cycle_date: NaiveDate) -> String {
    sha256_hex(format!("renewal:{subscription_id}:{cycle_date}"))
}

pub fn renewal_window(today: NaiveDate) -> (NaiveDate, NaiveDate) {
    (today, today + Duration::days(RENEWAL_LEAD_DAYS))
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RenewalReport {
    pub due: usize,
    pub charged: usize,
    pub pending: usize,
    pub declined: usize,
    pub skipped: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Charged,
    Pending,
    Declined,
    Skipped,
}

#[derive(sqlx::FromRow)]
struct LedgerRow {
    id: Uuid,
    status: String,
}

#[derive(sqlx::FromRow)]
struct Manager {
    user_id: Uuid,
    role: MemberRole,
}

pub struct Renewer {
    pool: PgPool,
    gateway: Arc<dyn PaymentGateway>,
    notifications: Arc<NotificationCenter>,
    audit: AuditSink,
}

impl Renewer {
    pub fn new(
        pool: PgPool,
        gateway: Arc<dyn PaymentGateway>,
        notifications: Arc<NotificationCenter>,
        audit: AuditSink,
    ) -> Self {
        Self {
            pool,
            gateway,
            notifications,
            audit,
        }
    }

    pub async fn run(&self, today: NaiveDate) -> AppResult<RenewalReport> {
        let (from, to) = renewal_window(today);
        let due = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS}
            FROM subscriptions
            WHERE status = 'active'
              AND auto_renew
              AND payment_token IS NOT NULL
              AND (end_date AT TIME ZONE 'UTC')::date BETWEEN $1 AND $2
            ORDER BY end_date
            "#
        ))
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        let mut report = RenewalReport {
            due: due.len(),
            ..Default::default()
        };
        for subscription in &due {
            match self.renew(subscription).await {
                Ok(Step::Charged) => report.charged += 1,
                Ok(Step::Pending) => report.pending += 1,
                Ok(Step::Declined) => report.declined += 1,
                Ok(Step::Skipped) => report.skipped += 1,
                Err(err) => {
                    report.errors += 1;
                    tracing::warn!(error = %err, subscription_id = %subscription.id, "renewal attempt failed, will retry next tick");
                }
            }
        }

        tracing::info!(?report, %today, "subscription renewal finished");
        Ok(report)
    }

    async fn renew(&self, subscription: &Subscription) -> AppResult<Step> {
        let Some(payment_token) = subscription.payment_token.clone() else {
            return Ok(Step::Skipped);
        };
        let Some(next_end) = subscription.next_end_date() else {
            return Ok(Step::Skipped);
        };
        let cycle_date = subscription.end_date.date_naive();
        let key = idempotency_key(subscription.id, cycle_date);

        let Some(ledger_id) = self.claim(subscription, cycle_date, &key).await? else {
            return Ok(Step::Skipped);
        };

        let request = ChargeRequest {
            idempotency_key: key,
            payment_token,
            amount_rub: subscription.amount,
            description: format!(
                "Продление подписки {} до {}",
                subscription.plan_type.as_str(),
                next_end.date_naive()
            ),
        };

        match self.gateway.charge(&request).await? {
            ChargeOutcome::Succeeded { payment_id } => {
                self.complete(subscription, ledger_id, &payment_id, next_end).await?;
                self.audit_charge(subscription, Some(&payment_id), None).await;
                Ok(Step::Charged)
            }
            ChargeOutcome::Pending { payment_id } => {
                sqlx::query(
                    "UPDATE subscription_payments SET vendor_payment_id = $2, updated_at = NOW() WHERE id = $1",
                )
                .bind(ledger_id)
                .bind(&payment_id)
                .execute(&self.pool)
                .await?;
                Ok(Step::Pending)
            }
            ChargeOutcome::Declined { reason } => {
                self.decline(subscription, ledger_id, &reason).await?;
                self.audit_charge(subscription, None, Some(&reason)).await;
                self.warn_managers(subscription).await?;
                Ok(Step::Declined)
            }
        }
    }

    /// Returns the ledger row id when this cycle is still open for charging.
    async fn claim(
        &self,
        subscription: &Subscription,
        cycle_date: NaiveDate,
        key: &str,
    ) -> AppResult<Option<Uuid>> {
        sqlx::query(
            r#"
            INSERT INTO subscription_payments
                (id, subscription_id, cycle_date, idempotency_key, amount, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, 'pending', NOW(), NOW())
            ON CONFLICT (subscription_id, cycle_date) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(subscription.id)
        .bind(cycle_date)
        .bind(key)
        .bind(subscription.amount)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query_as::<_, LedgerRow>(
            "SELECT id, status FROM subscription_payments WHERE subscription_id = $1 AND cycle_date = $2",
        )
        .bind(subscription.id)
        .bind(cycle_date)
        .fetch_one(&self.pool)
        .await?;

        Ok((row.status == "pending").then_some(row.id))
    }

    async fn complete(
        &self,
        subscription: &Subscription,
        ledger_id: Uuid,
        payment_id: &str,
        next_end: DateTime<Utc>,
    ) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        let settled = sqlx::query(
            r#"
            UPDATE subscription_payments
            SET status = 'succeeded', vendor_payment_id = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(ledger_id)
        .bind(payment_id)
        .execute(&mut *tx)
        .await?;

        if settled.rows_affected() == 1 {
            sqlx::query(
                r#"
                UPDATE subscriptions
                SET end_date = $2, last_payment_date = NOW(), last_payment_id = $3
                WHERE id = $1 AND end_date = $4
                "#,
            )
            .bind(subscription.id)
            .bind(next_end)
            .bind(payment_id)
            .bind(subscription.end_date)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        tracing::info!(subscription_id = %subscription.id, %next_end, "subscription renewed");
        Ok(())
    }

    async fn decline(&self, subscription: &Subscription, ledger_id: Uuid, reason: &str) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            UPDATE subscription_payments
            SET status = 'failed', failure_reason = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(ledger_id)
        .bind(reason)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE subscriptions SET auto_renew = FALSE WHERE id = $1")
            .bind(subscription.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::warn!(subscription_id = %subscription.id, reason, "renewal declined, auto-renew disabled");
        Ok(())
    }

    async fn managers(&self, family_id: Uuid) -> AppResult<Vec<Manager>> {
        Ok(sqlx::query_as::<_, Manager>(
            r#"
            SELECT user_id, role FROM family_members
            WHERE family_id = $1 AND status = 'active' AND role IN ('owner', 'admin')
            "#,
        )
        .bind(family_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn warn_managers(&self, subscription: &Subscription) -> AppResult<()> {
        let recipients: Vec<Uuid> = self
            .managers(subscription.family_id)
            .await?
            .into_iter()
            .map(|m| m.user_id)
            .collect();
        let draft = NotificationDraft::new(
            "subscription_expiring",
            "Подписка не продлена",
            format!(
                "Не удалось списать оплату. Подписка действует до {}, автопродление отключено",
                subscription.end_date.format("%d.%m.%Y")
            ),
        )
        .with_url("/subscription")
        .via(&[Channel::Push, Channel::Email]);
        self.notifications.notify_many(&recipients, &draft).await;
        Ok(())
    }

    async fn audit_charge(&self, subscription: &Subscription, payment_id: Option<&str>, failure: Option<&str>) {
        let owner = match self.managers(subscription.family_id).await {
            Ok(managers) => managers.into_iter().find(|m| m.role == MemberRole::Owner),
            Err(err) => {
                tracing::warn!(error = %err, "failed to resolve family owner for audit");
                None
            }
        };
        let Some(owner) = owner else { return };

        let mut entry = AuditEntry::new(owner.user_id, "subscription_renewal", AuditCategory::Payment)
            .with_details(json!({
                "subscription_id": subscription.id,
                "amount": subscription.amount,
                "payment_id": payment_id,
            }));
        if let Some(reason) = failure {
            entry = entry.failed(reason);
        }
        self.audit.log(entry).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_key_is_stable_per_cycle() {
        let id = Uuid::new_v4();
        let day = NaiveDate::from_ymd_opt(2025, 5, 10).unwrap();
        let key = idempotency_key(id, day);
        assert_eq!(key, idempotency_key(id, day));
        assert_eq!(key.len(), 64);
        assert_ne!(key, idempotency_key(id, day + Duration::days(30)));
        assert_ne!(key, idempotency_key(Uuid::new_v4(), day));
    }

    #[test]
    fn window_covers_three_days_ahead() {
        let today = NaiveDate::from_ymd_opt(2025, 12, 30).unwrap();
        let (from, to) = renewal_window(today);
        assert_eq!(from, today);
        assert_eq!(to, NaiveDate::from_ymd_opt(2026, 1, 2).unwrap());
    }
}
