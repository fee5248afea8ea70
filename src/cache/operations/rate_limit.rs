use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::{Client as RedisClient, Script};
use uuid::Uuid;

use crate::error::AppResult;
use crate::rate_limit::{RateLimitAction, RateLimitStore, WindowStats};

/// Trims the window, counts it, and appends the attempt in one round trip.
/// Scores are millisecond timestamps.
const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local max = tonumber(ARGV[3])
redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local recorded = 0
if ARGV[4] == '1' and count < max then
    redis.call('ZADD', key, now, ARGV[5])
    recorded = 1
end
redis.call('PEXPIRE', key, window)
local oldest_score = -1
if oldest[2] then
    oldest_score = tonumber(oldest[2])
end
return {count, oldest_score, recorded}
"#;

/// Sorted set per (ip, action)
pub struct RedisRateLimitStore {
    redis: Arc<RedisClient>,
    script: Script,
}

impl RedisRateLimitStore {
    pub fn new(redis: Arc<RedisClient>) -> Self {
        Self {
            redis,
            script: Script::new(SLIDING_WINDOW_SCRIPT),
        }
    }

    fn key(ip: &str, action: RateLimitAction) -> String {
        format!("rate_limit:{}:{}", action, ip)
    }
}

#[async_trait]
impl RateLimitStore for RedisRateLimitStore {
    async fn hit(
        &self,
        ip: &str,
        action: RateLimitAction,
        _user_id: Option<Uuid>,
        now: DateTime<Utc>,
        log_attempt: bool,
    ) -> AppResult<WindowStats> {
        let policy = action.policy();
        let mut conn = self.redis.get_multiplexed_async_connection().await?;

        let (count, oldest_ms, recorded): (i64, i64, i64) = self
            .script
            .key(Self::key(ip, action))
            .arg(now.timestamp_millis())
            .arg(policy.window.num_milliseconds())
            .arg(policy.max_attempts)
            .arg(if log_attempt { "1" } else { "0" })
            .arg(Uuid::new_v4().to_string())
            .invoke_async(&mut conn)
            .await?;

        let oldest = if oldest_ms >= 0 {
            Utc.timestamp_millis_opt(oldest_ms).single()
        } else {
            None
        };

        Ok(WindowStats {
            count: u32::try_from(count).unwrap_or(u32::MAX),
            oldest,
            recorded: recorded == 1,
        })
    }
}
