mod handler;

pub use handler::{RateLimitRequest, check_rate_limit};
