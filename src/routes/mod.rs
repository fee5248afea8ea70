pub mod admin;
pub mod audit;
pub mod auth;
pub mod billing;
pub mod calendar;
pub mod geofences;
pub mod health;
pub mod health_profile;
pub mod notifications;
pub mod push;
pub mod rate_limiter;
pub mod uploads;
pub mod wallet;

use axum::{extract::FromRequestParts, http::request::Parts};
use axum_extra::{TypedHeader, headers::UserAgent};

use crate::middleware::ClientIp;

/// Client details recorded with audit entries.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

impl<S> FromRequestParts<S> for RequestMeta
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let ip = parts.extensions.get::<ClientIp>().map(|ip| ip.0.clone());
        let user_agent = TypedHeader::<UserAgent>::from_request_parts(parts, state)
            .await
            .ok()
            .map(|TypedHeader(agent)| agent.as_str().to_string());
        Ok(Self { ip, user_agent })
    }
}
