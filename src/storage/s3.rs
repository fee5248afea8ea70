//! S3-compatible object store signed with AWS Signature Version 4.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use super::ObjectStore;
use crate::config::ObjectStorageConfig;
use crate::error::{AppError, AppResult};

type HmacSha256 = Hmac<Sha256>;

const SERVICE: &str = "s3";
const SIGNED_HEADERS: &str = "content-type;host;x-amz-content-sha256;x-amz-date";

fn hmac(key: &[u8], data: &[u8]) -> AppResult<Vec<u8>> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| AppError::internal(format!("hmac key rejected: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

pub fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> AppResult<Vec<u8>> {
    let k_date = hmac(format!("AWS4{secret}").as_bytes(), date.as_bytes())?;
    let k_region = hmac(&k_date, region.as_bytes())?;
    let k_service = hmac(&k_region, service.as_bytes())?;
    hmac(&k_service, b"aws4_request")
}

/// Percent-encodes a path, keeping `/` and the RFC 3986 unreserved set.
pub fn uri_encode_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for byte in path.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

pub struct S3Store {
    http: reqwest::Client,
    endpoint: String,
    host: String,
    region: String,
    bucket: String,
    access_key_id: String,
    secret_access_key: String,
    cdn_base_url: String,
}

impl S3Store {
    pub fn new(config: &ObjectStorageConfig, timeout: Duration) -> AppResult<Self> {
        let endpoint = config.endpoint.trim_end_matches('/').to_string();
        let host = reqwest::Url::parse(&endpoint)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
            .ok_or_else(|| AppError::internal(format!("invalid S3_ENDPOINT {endpoint}")))?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::internal(format!("failed to build storage client: {e}")))?;

        Ok(Self {
            http,
            endpoint,
            host,
            region: config.region.clone(),
            bucket: config.bucket.clone(),
            access_key_id: config.access_key_id.clone(),
            secret_access_key: config.secret_access_key.clone(),
            cdn_base_url: config.cdn_base_url.trim_end_matches('/').to_string(),
        })
    }

    fn authorization(
        &self,
        canonical_uri: &str,
        content_type: &str,
        payload_hash: &str,
        now: DateTime<Utc>,
    ) -> AppResult<(String, String)> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();

        let canonical_request = format!(
            "PUT\n{canonical_uri}\n\ncontent-type:{content_type}\nhost:{}\nx-amz-content-sha256:{payload_hash}\nx-amz-date:{amz_date}\n\n{SIGNED_HEADERS}\n{payload_hash}",
            self.host
        );
        let scope = format!("{date}/{}/{SERVICE}/aws4_request", self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );
        let signature = hex::encode(hmac(
            &signing_key(&self.secret_access_key, &date, &self.region, SERVICE)?,
            string_to_sign.as_bytes(),
        )?);

        Ok((
            format!(
                "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={SIGNED_HEADERS}, Signature={signature}",
                self.access_key_id
            ),
            amz_date,
        ))
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> AppResult<()> {
        let canonical_uri = uri_encode_path(&format!("/{}/{key}", self.bucket));
        let payload_hash = hex::encode(Sha256::digest(&body));
        let (authorization, amz_date) =
            self.authorization(&canonical_uri, content_type, &payload_hash, Utc::now())?;

        let response = self
            .http
            .put(format!("{}{canonical_uri}", self.endpoint))
            .header("Authorization", authorization)
            .header("Content-Type", content_type)
            .header("x-amz-content-sha256", payload_hash)
            .header("x-amz-date", amz_date)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            tracing::error!(%status, key, body = %text, "object upload failed");
            return Err(AppError::upstream("storage", format!("PUT responded {status}")));
        }
        Ok(())
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.cdn_base_url, uri_encode_path(key))
    }
}
