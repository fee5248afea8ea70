//! Payment vendor client for recurring charges with a saved payment method.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::PaymentConfig;
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeRequest {
    /// Vendor-side dedupe key; the same key always yields the same payment.
    pub idempotency_key: String,
    pub payment_token: String,
    pub amount_rub: i64,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChargeOutcome {
    Succeeded { payment_id: String },
    /// Accepted but not final; the next tick asks again with the same key.
    Pending { payment_id: String },
    Declined { reason: String },
}

/// Transport errors are returned as `Err` and leave the cycle open for retry;
/// a vendor refusal is `Ok(Declined)`.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn charge(&self, request: &ChargeRequest) -> AppResult<ChargeOutcome>;
}

#[derive(Debug, Deserialize)]
struct PaymentResponse {
    id: String,
    status: String,
    #[serde(default)]
    cancellation_details: Option<CancellationDetails>,
}

#[derive(Debug, Deserialize)]
struct CancellationDetails {
    reason: String,
}

#[derive(Debug, Serialize)]
struct Amount {
    value: String,
    currency: &'static str,
}

impl PaymentResponse {
    fn into_outcome(self) -> ChargeOutcome {
        match self.status.as_str() {
            "succeeded" => ChargeOutcome::Succeeded {
                payment_id: self.id,
            },
            "canceled" => ChargeOutcome::Declined {
                reason: self
                    .cancellation_details
                    .map(|d| d.reason)
                    .unwrap_or_else(|| "canceled".into()),
            },
            _ => ChargeOutcome::Pending {
                payment_id: self.id,
            },
        }
    }
}

/// YooKassa-compatible `POST /payments` client.
pub struct YooKassaGateway {
    http: reqwest::Client,
    api_url: String,
    shop_id: String,
    secret_key: String,
}

impl YooKassaGateway {
    pub fn new(config: &PaymentConfig, timeout: Duration) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::internal(format!("failed to build payment client: {e}")))?;
        Ok(Self {
            http,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            shop_id: config.shop_id.clone(),
            secret_key: config.secret_key.clone(),
        })
    }
}

#[async_trait]
impl PaymentGateway for YooKassaGateway {
    async fn charge(&self, request: &ChargeRequest) -> AppResult<ChargeOutcome> {
        let body = json!({
            "amount": Amount {
                value: format!("{}.00", request.amount_rub),
                currency: "RUB",
            },
            "capture": true,
            "payment_method_id": request.payment_token,
            "description": request.description,
        });

        let response = self
            .http
            .post(format!("{}/payments", self.api_url))
            .basic_auth(&self.shop_id, Some(&self.secret_key))
            .header("Idempotence-Key", &request.idempotency_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AppError::upstream("payment", format!("vendor responded {status}")));
        }
        if status.is_client_error() {
            let text = response.text().await.unwrap_or_default();
            tracing::warn!(%status, body = %text, "payment rejected by vendor");
            return Ok(ChargeOutcome::Declined {
                reason: format!("vendor responded {status}"),
            });
        }

        let payment: PaymentResponse = response.json().await?;
        Ok(payment.into_outcome())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_vendor_statuses() {
        let ok: PaymentResponse =
            serde_json::from_str(r#"{"id":"2d1f","status":"succeeded","paid":true}"#).unwrap();
        assert_eq!(
            ok.into_outcome(),
            ChargeOutcome::Succeeded {
                payment_id: "2d1f".into()
            }
        );

        let canceled: PaymentResponse = serde_json::from_str(
            r#"{"id":"2d20","status":"canceled","cancellation_details":{"party":"payment_network","reason":"insufficient_funds"}}"#,
        )
        .unwrap();
        assert_eq!(
            canceled.into_outcome(),
            ChargeOutcome::Declined {
                reason: "insufficient_funds".into()
            }
        );

        let pending: PaymentResponse =
            serde_json::from_str(r#"{"id":"2d21","status":"pending"}"#).unwrap();
        assert!(matches!(pending.into_outcome(), ChargeOutcome::Pending { .. }));
    }
}
