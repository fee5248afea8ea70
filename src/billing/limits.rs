//! Free-plan usage counters.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use super::{FeatureSet, SubscriptionGate};
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    /// Resets every day.
    AiRequests,
    /// Lifetime until upgrade.
    Photos,
    FamilyMembers,
}

impl LimitKind {
    pub fn free_cap(self) -> i32 {
        match self {
            LimitKind::AiRequests => 5,
            LimitKind::Photos => 10,
            LimitKind::FamilyMembers => 2,
        }
    }

    pub fn feature(self) -> FeatureSet {
        match self {
            LimitKind::AiRequests => FeatureSet::Ai,
            LimitKind::Photos => FeatureSet::Premium,
            LimitKind::FamilyMembers => FeatureSet::Family,
        }
    }

    fn upgrade_hint(self) -> &'static str {
        match self {
            LimitKind::AiRequests => "Лимит AI-запросов на сегодня исчерпан. Оформите подписку",
            LimitKind::Photos => "Лимит фотографий бесплатного тарифа исчерпан. Оформите подписку",
            LimitKind::FamilyMembers => "На бесплатном тарифе доступно 2 участника. Оформите подписку",
        }
    }
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LimitKind::AiRequests => "ai_requests",
            LimitKind::Photos => "photos",
            LimitKind::FamilyMembers => "family_members",
        })
    }
}

impl FromStr for LimitKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ai_requests" | "ai" => Ok(LimitKind::AiRequests),
            "photos" => Ok(LimitKind::Photos),
            "family_members" | "members" => Ok(LimitKind::FamilyMembers),
            other => Err(AppError::bad_request(format!("Неизвестный тип лимита: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct UsageLimits {
    pub family_id: Uuid,
    pub ai_requests_used: i32,
    pub ai_reset_date: NaiveDate,
    pub photos_used: i32,
    pub family_members_count: i32,
}

impl UsageLimits {
    /// Applies the daily AI reset when the stored reset date is behind `today`.
    pub fn as_of(mut self, today: NaiveDate) -> Self {
        if self.ai_reset_date < today {
            self.ai_requests_used = 0;
            self.ai_reset_date = today;
        }
        self
    }

    pub fn used(&self, kind: LimitKind) -> i32 {
        match kind {
            LimitKind::AiRequests => self.ai_requests_used,
            LimitKind::Photos => self.photos_used,
            LimitKind::FamilyMembers => self.family_members_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimitState {
    #[serde(rename = "type")]
    pub kind: LimitKind,
    pub used: i32,
    /// `None` when the family's plan lifts the cap.
    pub limit: Option<i32>,
    pub remaining: Option<i32>,
    pub allowed: bool,
    pub is_premium: bool,
}

impl LimitState {
    pub fn evaluate(usage: &UsageLimits, kind: LimitKind, is_premium: bool) -> Self {
        let used = usage.used(kind);
        if is_premium {
            return Self {
                kind,
                used,
                limit: None,
                remaining: None,
                allowed: true,
                is_premium,
            };
        }
        let cap = kind.free_cap();
        Self {
            kind,
            used,
            limit: Some(cap),
            remaining: Some((cap - used).max(0)),
            allowed: used < cap,
            is_premium,
        }
    }
}

#[derive(Clone)]
pub struct UsageLimiter {
    pool: PgPool,
    gate: SubscriptionGate,
}

impl UsageLimiter {
    pub fn new(pool: PgPool) -> Self {
        Self {
            gate: SubscriptionGate::new(pool.clone()),
            pool,
        }
    }

    pub async fn check(&self, family_id: Uuid, kind: LimitKind, today: NaiveDate) -> AppResult<LimitState> {
        let is_premium = self.gate.is_entitled(family_id, kind.feature()).await?;
        sqlx::query(
            r#"
            INSERT INTO usage_limits (family_id, ai_reset_date, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (family_id) DO NOTHING
            "#,
        )
        .bind(family_id)
        .bind(today)
        .execute(&self.pool)
        .await?;

        let usage = sqlx::query_as::<_, UsageLimits>(
            r#"
            SELECT family_id, ai_requests_used, ai_reset_date, photos_used, family_members_count
            FROM usage_limits
            WHERE family_id = $1
            "#,
        )
        .bind(family_id)
        .fetch_one(&self.pool)
        .await?
        .as_of(today);

        Ok(LimitState::evaluate(&usage, kind, is_premium))
    }

    /// Bumps the counter by one unless the free cap is already reached, in
    /// which case the family is asked to upgrade.
    pub async fn increment(&self, family_id: Uuid, kind: LimitKind, today: NaiveDate) -> AppResult<LimitState> {
        let is_premium = self.gate.is_entitled(family_id, kind.feature()).await?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO usage_limits (family_id, ai_reset_date, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (family_id) DO NOTHING
            "#,
        )
        .bind(family_id)
        .bind(today)
        .execute(&mut *tx)
        .await?;

        let mut usage = sqlx::query_as::<_, UsageLimits>(
            r#"
            SELECT family_id, ai_requests_used, ai_reset_date, photos_used, family_members_count
            FROM usage_limits
            WHERE family_id = $1
            FOR UPDATE
            "#,
        )
        .bind(family_id)
        .fetch_one(&mut *tx)
        .await?
        .as_of(today);

        if !LimitState::evaluate(&usage, kind, is_premium).allowed {
            return Err(AppError::subscription_required(kind.upgrade_hint()));
        }

        match kind {
            LimitKind::AiRequests => usage.ai_requests_used += 1,
            LimitKind::Photos => usage.photos_used += 1,
            LimitKind::FamilyMembers => usage.family_members_count += 1,
        }

        sqlx::query(
            r#"
            UPDATE usage_limits
            SET ai_requests_used = $2, ai_reset_date = $3, photos_used = $4,
                family_members_count = $5, updated_at = NOW()
            WHERE family_id = $1
            "#,
        )
        .bind(family_id)
        .bind(usage.ai_requests_used)
        .bind(usage.ai_reset_date)
        .bind(usage.photos_used)
        .bind(usage.family_members_count)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        tracing::debug!(%family_id, kind = %kind, used = usage.used(kind), "usage counter incremented");
        Ok(LimitState::evaluate(&usage, kind, is_premium))
    }
}
