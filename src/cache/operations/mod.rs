/// Redis operations

// Sliding-window rate limit
pub mod rate_limit;

pub use rate_limit::RedisRateLimitStore;
