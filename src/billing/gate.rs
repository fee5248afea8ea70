use sqlx::PgPool;
use uuid::Uuid;

use super::{FeatureSet, SUBSCRIPTION_COLUMNS, Subscription};
use crate::error::AppResult;

#[derive(Clone)]
pub struct SubscriptionGate {
    pool: PgPool,
}

impl SubscriptionGate {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn is_entitled(&self, family_id: Uuid, feature: FeatureSet) -> AppResult<bool> {
        let plans: Vec<&str> = feature.eligible_plans().iter().map(|p| p.as_str()).collect();
        let entitled = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM subscriptions
                WHERE family_id = $1
                  AND status = 'active'
                  AND end_date > NOW()
                  AND plan_type = ANY($2)
            )
            "#,
        )
        .bind(family_id)
        .bind(&plans)
        .fetch_one(&self.pool)
        .await?;
        Ok(entitled)
    }

    /// The family's current subscription, if any.
    pub async fn current(&self, family_id: Uuid) -> AppResult<Option<Subscription>> {
        let subscription = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS}
            FROM subscriptions
            WHERE family_id = $1 AND status = 'active' AND end_date > NOW()
            ORDER BY end_date DESC
            LIMIT 1
            "#
        ))
        .bind(family_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(subscription)
    }

    /// Stops future renewals; the paid period stays usable until `end_date`.
    pub async fn cancel_auto_renew(&self, family_id: Uuid) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET auto_renew = FALSE
            WHERE family_id = $1 AND status = 'active' AND auto_renew
            "#,
        )
        .bind(family_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
