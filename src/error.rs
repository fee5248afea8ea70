use axum::Json;
use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use thiserror::Error;

/// Message returned whenever a request has no valid session.
pub const UNAUTHORIZED_MESSAGE: &str = "Требуется авторизация";

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error("Требуется авторизация")]
    Unauthorized,
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("Метод не поддерживается")]
    MethodNotAllowed,
    #[error("{0}")]
    Conflict(String),
    #[error("Слишком много запросов")]
    RateLimited {
        limit: u32,
        reset_at: DateTime<Utc>,
    },
    /// Free-plan cap reached; the client is expected to offer an upgrade.
    #[error("subscription_required")]
    PaymentRequired { hint: String },
    #[error("Недостаточно средств")]
    InsufficientFunds { balance: i64, required: i64 },
    #[error("upstream {service} failed: {message}")]
    UpstreamFailure {
        service: &'static str,
        message: String,
        timed_out: bool,
    },
    #[error("{0}")]
    Internal(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Cache(#[from] redis::RedisError),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn upstream(service: &'static str, err: impl std::fmt::Display) -> Self {
        Self::UpstreamFailure {
            service,
            message: err.to_string(),
            timed_out: false,
        }
    }

    pub fn subscription_required(hint: impl Into<String>) -> Self {
        Self::PaymentRequired { hint: hint.into() }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) | AppError::InsufficientFunds { .. } => StatusCode::BAD_REQUEST,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::PaymentRequired { .. } => StatusCode::PAYMENT_REQUIRED,
            AppError::UpstreamFailure { timed_out: true, .. } => StatusCode::GATEWAY_TIMEOUT,
            AppError::UpstreamFailure { .. } => StatusCode::BAD_GATEWAY,
            AppError::Internal(_) | AppError::Database(_) | AppError::Cache(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn body(&self) -> Value {
        match self {
            AppError::RateLimited { limit, reset_at } => json!({
                "error": self.to_string(),
                "limit": limit,
                "remaining": 0,
                "reset_at": reset_at,
            }),
            AppError::PaymentRequired { hint } => json!({
                "error": "subscription_required",
                "message": hint,
            }),
            AppError::InsufficientFunds { balance, required } => json!({
                "error": self.to_string(),
                "balance": balance,
                "required": required,
                "deficit": required - balance,
            }),
            AppError::UpstreamFailure { service, .. } => json!({
                "error": format!("Внешний сервис {service} недоступен"),
            }),
            AppError::Internal(message) => json!({ "error": message, "type": "internal" }),
            AppError::Database(_) => json!({ "error": "Ошибка базы данных", "type": "database" }),
            AppError::Cache(_) => json!({ "error": "Ошибка кэша", "type": "cache" }),
            _ => json!({ "error": self.to_string() }),
        }
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::UpstreamFailure {
            service: "http",
            timed_out: err.is_timeout(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let mut response = (status, Json(self.body())).into_response();
        if let AppError::RateLimited { limit, reset_at } = &self {
            let headers = response.headers_mut();
            headers.insert("X-RateLimit-Limit", HeaderValue::from(*limit));
            headers.insert("X-RateLimit-Remaining", HeaderValue::from(0u32));
            headers.insert("X-RateLimit-Reset", HeaderValue::from(reset_at.timestamp()));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_of(err: AppError) -> (StatusCode, Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn unauthorized_uses_russian_envelope() {
        let (status, body) = body_of(AppError::Unauthorized).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, json!({ "error": "Требуется авторизация" }));
    }

    #[tokio::test]
    async fn insufficient_funds_reports_deficit() {
        let (status, body) = body_of(AppError::InsufficientFunds {
            balance: 450,
            required: 500,
        })
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["balance"], 450);
        assert_eq!(body["required"], 500);
        assert_eq!(body["deficit"], 50);
    }

    #[tokio::test]
    async fn internal_errors_carry_type_but_no_trace() {
        let (status, body) = body_of(AppError::internal("boom")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "boom");
        assert_eq!(body["type"], "internal");
    }

    #[test]
    fn upstream_timeout_maps_to_gateway_timeout() {
        let err = AppError::UpstreamFailure {
            service: "payment",
            message: "deadline".into(),
            timed_out: true,
        };
        assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(AppError::upstream("push", "410").status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn rate_limited_sets_headers() {
        let reset_at = Utc::now();
        let response = AppError::RateLimited { limit: 5, reset_at }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["X-RateLimit-Limit"], "5");
        assert_eq!(response.headers()["X-RateLimit-Remaining"], "0");
    }

    #[tokio::test]
    async fn payment_required_names_subscription() {
        let (status, body) = body_of(AppError::subscription_required("Купите подписку")).await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(body["error"], "subscription_required");
    }
}
