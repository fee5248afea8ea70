mod auth;
mod client_ip;
mod error_handler;
mod rate_limit;

pub use auth::{SessionToken, auth_middleware};
pub use client_ip::{ClientIp, client_ip};
pub use error_handler::log_errors;
pub use rate_limit::{classify, rate_gate};
