use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::SmsTransport;
use crate::config::SmsConfig;
use crate::error::{AppError, AppResult};

/// SMS gateway speaking the sms.ru-style `send?api_id=..&to=..&msg=..&json=1` API.
pub struct SmsGateway {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    status: String,
    #[serde(default)]
    status_text: Option<String>,
}

impl SmsGateway {
    pub fn new(config: &SmsConfig, timeout: Duration) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::internal(format!("failed to build sms client: {e}")))?;
        Ok(Self {
            http,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }
}

/// Reduces a phone number to the bare international digits the gateway expects.
pub fn normalize_phone(phone: &str) -> Option<String> {
    let digits: String = phone.chars().filter(char::is_ascii_digit).collect();
    match digits.len() {
        // 8XXXXXXXXXX is the domestic form of +7XXXXXXXXXX
        11 if digits.starts_with('8') => Some(format!("7{}", &digits[1..])),
        10..=15 => Some(digits),
        _ => None,
    }
}

#[async_trait]
impl SmsTransport for SmsGateway {
    async fn send(&self, phone: &str, text: &str) -> AppResult<()> {
        let to = normalize_phone(phone)
            .ok_or_else(|| AppError::bad_request(format!("Некорректный номер телефона: {phone}")))?;

        let response: SendResponse = self
            .http
            .post(format!("{}/sms/send", self.api_url))
            .form(&[
                ("api_id", self.api_key.as_str()),
                ("to", to.as_str()),
                ("msg", text),
                ("json", "1"),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if response.status != "OK" {
            return Err(AppError::upstream(
                "sms",
                response.status_text.unwrap_or(response.status),
            ));
        }
        tracing::debug!(to = %to, "sms sent");
        Ok(())
    }
}
