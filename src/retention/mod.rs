//! Age-based deletion of sessions, logs, location history and dormant accounts.

use serde::Serialize;
use sqlx::PgPool;

use crate::error::AppResult;

pub const AUDIT_RETENTION_DAYS: i32 = 365;
pub const LOCATION_RETENTION_DAYS: i32 = 30;
pub const RATE_LIMIT_RETENTION_HOURS: i32 = 24;
pub const INACTIVE_USER_YEARS: i32 = 3;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    pub expired_sessions: u64,
    pub audit_logs: u64,
    pub location_fixes: u64,
    pub rate_limit_logs: u64,
    pub inactive_users: u64,
    pub lapsed_subscriptions: u64,
}

impl ReapReport {
    pub fn total(&self) -> u64 {
        self.expired_sessions
            + self.audit_logs
            + self.location_fixes
            + self.rate_limit_logs
            + self.inactive_users
            + self.lapsed_subscriptions
    }
}

#[derive(Clone)]
pub struct RetentionReaper {
    pool: PgPool,
}

impl RetentionReaper {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// One pass over every category. Running it again right away deletes nothing.
    pub async fn reap(&self) -> AppResult<ReapReport> {
        let mut report = ReapReport {
            inactive_users: self.reap_inactive_users().await?,
            ..Default::default()
        };

        report.expired_sessions = sqlx::query("DELETE FROM sessions WHERE expires_at < NOW()")
            .execute(&self.pool)
            .await?
            .rows_affected();

        report.audit_logs = sqlx::query(
            "DELETE FROM audit_logs WHERE created_at < NOW() - $1 * INTERVAL '1 day'",
        )
        .bind(AUDIT_RETENTION_DAYS)
        .execute(&self.pool)
        .await?
        .rows_affected();

        report.location_fixes = sqlx::query(
            "DELETE FROM location_fixes WHERE created_at < NOW() - $1 * INTERVAL '1 day'",
        )
        .bind(LOCATION_RETENTION_DAYS)
        .execute(&self.pool)
        .await?
        .rows_affected();

        report.rate_limit_logs = sqlx::query(
            "DELETE FROM rate_limit_log WHERE created_at < NOW() - $1 * INTERVAL '1 hour'",
        )
        .bind(RATE_LIMIT_RETENTION_HOURS)
        .execute(&self.pool)
        .await?
        .rows_affected();

        // frees the family's single active slot for the next purchase
        report.lapsed_subscriptions = sqlx::query(
            r#"
            UPDATE subscriptions SET status = 'expired'
            WHERE status = 'active' AND end_date < NOW() AND NOT auto_renew
            "#,
        )
        .execute(&self.pool)
        .await?
        .rows_affected();

        tracing::info!(?report, total = report.total(), "retention pass finished");
        Ok(report)
    }

    /// Users whose last sign-in (or registration, if they never signed in)
    /// is older than the cutoff and who hold no live session. Their dependent
    /// rows go in the same transaction.
    async fn reap_inactive_users(&self) -> AppResult<u64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TEMP TABLE reaped_users ON COMMIT DROP AS
            SELECT u.id
            FROM users u
            WHERE COALESCE(u.last_login_at, u.created_at) < NOW() - $1 * INTERVAL '1 year'
              AND NOT EXISTS (
                  SELECT 1 FROM sessions s
                  WHERE s.user_id = u.id
                    AND s.created_at >= NOW() - $1 * INTERVAL '1 year'
              )
            "#,
        )
        .bind(INACTIVE_USER_YEARS)
        .execute(&mut *tx)
        .await?;

        for statement in [
            "DELETE FROM sessions WHERE user_id IN (SELECT id FROM reaped_users)",
            "DELETE FROM family_members WHERE user_id IN (SELECT id FROM reaped_users)",
            "DELETE FROM location_fixes WHERE user_id IN (SELECT id FROM reaped_users)",
            "DELETE FROM audit_logs WHERE user_id IN (SELECT id FROM reaped_users)",
            "DELETE FROM push_subscriptions WHERE user_id IN (SELECT id FROM reaped_users)",
            "DELETE FROM notifications WHERE user_id IN (SELECT id FROM reaped_users)",
        ] {
            sqlx::query(statement).execute(&mut *tx).await?;
        }

        let users = sqlx::query("DELETE FROM users WHERE id IN (SELECT id FROM reaped_users)")
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;

        if users > 0 {
            tracing::info!(users, "inactive accounts removed");
        }
        Ok(users)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_total_sums_categories() {
        let report = ReapReport {
            expired_sessions: 3,
            audit_logs: 10,
            location_fixes: 100,
            rate_limit_logs: 7,
            inactive_users: 1,
            lapsed_subscriptions: 2,
        };
        assert_eq!(report.total(), 123);
        assert_eq!(ReapReport::default().total(), 0);
    }

    #[test]
    fn report_serializes_per_category() {
        let json = serde_json::to_value(ReapReport::default()).unwrap();
        for key in ["expired_sessions", "audit_logs", "location_fixes", "rate_limit_logs", "inactive_users", "lapsed_subscriptions"] {
            assert_eq!(json[key], 0, "{key}");
        }
    }
}
