//! Sliding-window attempt counter keyed by (ip, action).
//!
//! Backends only have to count the attempts inside the window and, when the
//! caller asks for it and the cap is not reached, append the new attempt in the
//! same atomic step. The decision itself is computed here.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderValue};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::utils::{Clock, SystemClock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAction {
    Auth,
    PasswordReset,
    Api,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub max_attempts: u32,
    pub window: Duration,
}

impl RateLimitAction {
    pub fn policy(self) -> RateLimitPolicy {
        match self {
            RateLimitAction::Auth => RateLimitPolicy {
                max_attempts: 5,
                window: Duration::minutes(15),
            },
            RateLimitAction::PasswordReset => RateLimitPolicy {
                max_attempts: 3,
                window: Duration::minutes(30),
            },
            RateLimitAction::Api => RateLimitPolicy {
                max_attempts: 100,
                window: Duration::minutes(1),
            },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RateLimitAction::Auth => "auth",
            RateLimitAction::PasswordReset => "password_reset",
            RateLimitAction::Api => "api",
        }
    }
}

impl fmt::Display for RateLimitAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RateLimitAction {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auth" => Ok(RateLimitAction::Auth),
            "password_reset" => Ok(RateLimitAction::PasswordReset),
            "api" => Ok(RateLimitAction::Api),
            other => Err(AppError::bad_request(format!("Неизвестный тип действия: {other}"))),
        }
    }
}

/// Window contents observed by a store, before the current attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowStats {
    pub count: u32,
    pub oldest: Option<DateTime<Utc>>,
    pub recorded: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    pub current: u32,
    pub limit: u32,
}

impl RateLimitDecision {
    pub fn from_window(policy: RateLimitPolicy, stats: WindowStats, now: DateTime<Utc>) -> Self {
        let allowed = stats.count < policy.max_attempts;
        let reset_at = stats.oldest.unwrap_or(now) + policy.window;
        Self {
            allowed,
            remaining: if allowed {
                policy.max_attempts - stats.count - 1
            } else {
                0
            },
            reset_at,
            current: stats.count + u32::from(stats.recorded),
            limit: policy.max_attempts,
        }
    }

    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert("X-RateLimit-Limit", HeaderValue::from(self.limit));
        headers.insert("X-RateLimit-Remaining", HeaderValue::from(self.remaining));
        headers.insert("X-RateLimit-Reset", HeaderValue::from(self.reset_at.timestamp()));
    }

    pub fn into_error(self) -> AppError {
        AppError::RateLimited {
            limit: self.limit,
            reset_at: self.reset_at,
        }
    }
}

#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Counts attempts for `(ip, action)` newer than `now - policy.window`;
    /// when `log_attempt` is set and the count is under the cap, appends an
    /// attempt at `now` atomically with the count.
    async fn hit(
        &self,
        ip: &str,
        action: RateLimitAction,
        user_id: Option<Uuid>,
        now: DateTime<Utc>,
        log_attempt: bool,
    ) -> AppResult<WindowStats>;
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn RateLimitStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn check(
        &self,
        ip: &str,
        action: RateLimitAction,
        log_attempt: bool,
        user_id: Option<Uuid>,
    ) -> AppResult<RateLimitDecision> {
        let now = self.clock.now();
        let stats = self.store.hit(ip, action, user_id, now, log_attempt).await?;
        let decision = RateLimitDecision::from_window(action.policy(), stats, now);
        if !decision.allowed {
            tracing::warn!(ip, action = %action, current = decision.current, "rate limit exceeded");
        }
        Ok(decision)
    }
}

/// Attempts are rows in `rate_limit_log`; a transaction-scoped advisory lock
/// per (ip, action) keeps the count and the insert together.
pub struct PgRateLimitStore {
    pool: PgPool,
}

impl PgRateLimitStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct WindowRow {
    count: i64,
    oldest: Option<DateTime<Utc>>,
}

#[async_trait]
impl RateLimitStore for PgRateLimitStore {
    async fn hit(
        &self,
        ip: &str,
        action: RateLimitAction,
        user_id: Option<Uuid>,
        now: DateTime<Utc>,
        log_attempt: bool,
    ) -> AppResult<WindowStats> {
        let policy = action.policy();
        let since = now - policy.window;
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(format!("rate_limit:{ip}:{action}"))
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query_as::<_, WindowRow>(
            r#"
            SELECT COUNT(*) AS count, MIN(created_at) AS oldest
            FROM rate_limit_log
            WHERE ip_address = $1 AND action_type = $2 AND created_at > $3
            "#,
        )
        .bind(ip)
        .bind(action.as_str())
        .bind(since)
        .fetch_one(&mut *tx)
        .await?;

        let count = u32::try_from(row.count).unwrap_or(u32::MAX);
        let recorded = log_attempt && count < policy.max_attempts;
        if recorded {
            sqlx::query(
                r#"
                INSERT INTO rate_limit_log (id, ip_address, action_type, user_id, created_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(ip)
            .bind(action.as_str())
            .bind(user_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(WindowStats {
            count,
            oldest: row.oldest,
            recorded,
        })
    }
}

/// Process-local store; used by tests and single-node development setups.
#[derive(Default)]
pub struct MemoryRateLimitStore {
    attempts: Mutex<HashMap<(String, RateLimitAction), Vec<DateTime<Utc>>>>,
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn hit(
        &self,
        ip: &str,
        action: RateLimitAction,
        _user_id: Option<Uuid>,
        now: DateTime<Utc>,
        log_attempt: bool,
    ) -> AppResult<WindowStats> {
        let policy = action.policy();
        let since = now - policy.window;
        let mut attempts = self
            .attempts
            .lock()
            .map_err(|_| AppError::internal("rate limit store poisoned"))?;
        let entries = attempts.entry((ip.to_string(), action)).or_default();
        entries.retain(|at| *at > since);

        let count = entries.len() as u32;
        let oldest = entries.iter().min().copied();
        let recorded = log_attempt && count < policy.max_attempts;
        if recorded {
            entries.push(now);
        }
        Ok(WindowStats {
            count,
            oldest,
            recorded,
        })
    }
}
