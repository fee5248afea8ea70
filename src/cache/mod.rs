// Redis-backed stores
// Used when REDIS_URL is configured; Postgres remains the source of truth otherwise.

pub mod operations;

pub use operations::rate_limit::RedisRateLimitStore;
