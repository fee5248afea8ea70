use axum::{
    body::Body,
    extract::State,
    http::{Method, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::ClientIp;
use crate::{AppState, rate_limit::RateLimitAction};

/// Which counter a request is charged against, if any.
pub fn classify(method: &Method, path: &str) -> Option<RateLimitAction> {
    let path = path.trim_end_matches('/');
    if path.ends_with("/auth/login") || path.ends_with("/auth/register") {
        return Some(RateLimitAction::Auth);
    }
    if path.ends_with("/auth/password") {
        return Some(RateLimitAction::PasswordReset);
    }
    // the explicit counter endpoint does its own accounting
    if path.ends_with("/rate-limiter") {
        return None;
    }
    match *method {
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE => Some(RateLimitAction::Api),
        _ => None,
    }
}

/// Charges auth, password and mutating requests against the sliding window.
/// A store failure lets the request through.
pub async fn rate_gate(State(state): State<AppState>, req: Request<Body>, next: Next) -> Response {
    let Some(action) = classify(req.method(), req.uri().path()) else {
        return next.run(req).await;
    };
    let ip = req
        .extensions()
        .get::<ClientIp>()
        .map(|ip| ip.0.clone())
        .unwrap_or_else(|| "unknown".to_string());

    let decision = match state.rate_limiter.check(&ip, action, true, None).await {
        Ok(decision) => decision,
        Err(err) => {
            tracing::warn!(error = %err, %ip, %action, "rate limit store unavailable, letting request through");
            return next.run(req).await;
        }
    };

    if !decision.allowed {
        tracing::info!(%ip, %action, reset_at = %decision.reset_at, "rate limit exceeded");
        return decision.into_error().into_response();
    }

    let mut response = next.run(req).await;
    decision.apply_headers(response.headers_mut());
    response
}
