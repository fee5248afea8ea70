//! Web Push: subscription storage, VAPID signing and RFC 8291 payload encryption.

use std::time::Duration;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Nonce};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64_URL;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use rand::RngCore;
use rand::rngs::OsRng;
use reqwest::{StatusCode, Url};
use ring::agreement::{self, ECDH_P256, EphemeralPrivateKey, UnparsedPublicKey};
use ring::hkdf;
use ring::rand::SystemRandom;
use ring::signature::{ECDSA_P256_SHA256_FIXED_SIGNING, EcdsaKeyPair};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use super::{PushOutcome, PushPayload, PushTarget, PushTransport};
use crate::config::VapidConfig;
use crate::error::{AppError, AppResult};
use crate::utils::retry_with_backoff;

const RECORD_SIZE: u32 = 4096;
const PUSH_TTL_SECONDS: u32 = 24 * 60 * 60;
const VAPID_TOKEN_HOURS: i64 = 12;
const SEND_ATTEMPTS: u32 = 2;

// PKCS#8 v1 framing of a P-256 key: prefix, 32-byte scalar, infix, 65-byte point
const P256_PKCS8_PREFIX: [u8; 36] = [
    0x30, 0x81, 0x87, 0x02, 0x01, 0x00, 0x30, 0x13, 0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d,
    0x02, 0x01, 0x06, 0x08, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07, 0x04, 0x6d, 0x30,
    0x6b, 0x02, 0x01, 0x01, 0x04, 0x20,
];
const P256_PKCS8_INFIX: [u8; 5] = [0xa1, 0x44, 0x03, 0x42, 0x00];

#[derive(Clone)]
pub struct PushSubscriptionStore {
    pool: PgPool,
}

impl PushSubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Idempotent: re-registering an endpoint refreshes its keys and reactivates it.
    pub async fn register(
        &self,
        user_id: Uuid,
        endpoint: &str,
        p256dh: &str,
        auth: &str,
    ) -> AppResult<Uuid> {
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO push_subscriptions (id, user_id, endpoint, p256dh, auth, active, created_at)
            VALUES ($1, $2, $3, $4, $5, TRUE, NOW())
            ON CONFLICT (user_id, endpoint)
            DO UPDATE SET p256dh = EXCLUDED.p256dh, auth = EXCLUDED.auth, active = TRUE
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(endpoint)
        .bind(p256dh)
        .bind(auth)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn unregister(&self, user_id: Uuid, endpoint: &str) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE push_subscriptions SET active = FALSE WHERE user_id = $1 AND endpoint = $2",
        )
        .bind(user_id)
        .bind(endpoint)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn active_for_user(&self, user_id: Uuid) -> AppResult<Vec<PushTarget>> {
        let targets = sqlx::query_as::<_, PushTarget>(
            r#"
            SELECT id, endpoint, p256dh, auth
            FROM push_subscriptions
            WHERE user_id = $1 AND active = TRUE
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(targets)
    }

    pub async fn deactivate(&self, subscription_id: Uuid) -> AppResult<()> {
        sqlx::query("UPDATE push_subscriptions SET active = FALSE WHERE id = $1")
            .bind(subscription_id)
            .execute(&self.pool)
            .await?;
        tracing::info!(%subscription_id, "push subscription deactivated");
        Ok(())
    }
}

#[derive(Serialize)]
struct VapidClaims<'a> {
    aud: &'a str,
    exp: i64,
    sub: &'a str,
}

struct VapidSigner {
    key: EncodingKey,
    public_key: String,
    subject: String,
}

/// Wraps a raw VAPID key pair as PKCS#8 DER and checks that the halves match.
fn vapid_pkcs8(private_key: &[u8], public_key: &[u8]) -> AppResult<Vec<u8>> {
    if private_key.len() != 32 || public_key.len() != 65 {
        return Err(AppError::internal("VAPID keys must be a raw P-256 scalar and point"));
    }
    let mut der = Vec::with_capacity(138);
    der.extend_from_slice(&P256_PKCS8_PREFIX);
    der.extend_from_slice(private_key);
    der.extend_from_slice(&P256_PKCS8_INFIX);
    der.extend_from_slice(public_key);

    EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &der, &SystemRandom::new())
        .map_err(|e| AppError::internal(format!("invalid VAPID key pair: {e}")))?;
    Ok(der)
}

impl VapidSigner {
    fn new(config: &VapidConfig) -> AppResult<Self> {
        let decode = |value: &str| {
            BASE64_URL
                .decode(value.trim().trim_end_matches('='))
                .map_err(|e| AppError::internal(format!("invalid VAPID key: {e}")))
        };
        let der = vapid_pkcs8(&decode(&config.private_key)?, &decode(&config.public_key)?)?;

        Ok(Self {
            key: EncodingKey::from_ec_der(&der),
            public_key: config.public_key.trim().to_string(),
            subject: config.subject.clone(),
        })
    }

    /// `Authorization` header value for one push service origin.
    fn authorization(&self, endpoint: &str) -> AppResult<String> {
        let url = Url::parse(endpoint).map_err(|_| AppError::bad_request("Некорректный endpoint"))?;
        let audience = url.origin().ascii_serialization();
        let claims = VapidClaims {
            aud: &audience,
            exp: (Utc::now() + chrono::Duration::hours(VAPID_TOKEN_HOURS)).timestamp(),
            sub: &self.subject,
        };
        let token = jsonwebtoken::encode(&Header::new(Algorithm::ES256), &claims, &self.key)
            .map_err(|e| AppError::internal(format!("failed to sign VAPID token: {e}")))?;
        Ok(format!("vapid t={token}, k={}", self.public_key))
    }
}

/// Encrypts a push message body for the subscriber keys per RFC 8291
/// (`aes128gcm` content coding, single record).
pub fn encrypt_payload(p256dh: &str, auth: &str, plaintext: &[u8]) -> AppResult<Vec<u8>> {
    let invalid = || AppError::bad_request("Некорректные ключи подписки");
    let ua_public = BASE64_URL.decode(p256dh.trim_end_matches('=')).map_err(|_| invalid())?;
    let auth_secret = BASE64_URL.decode(auth.trim_end_matches('=')).map_err(|_| invalid())?;

    let mut salt = [0u8; 16];
    OsRng.fill_bytes(&mut salt);

    let rng = SystemRandom::new();
    let sender = EphemeralPrivateKey::generate(&ECDH_P256, &rng)
        .map_err(|_| AppError::internal("failed to generate push sender key"))?;
    let sender_public = sender
        .compute_public_key()
        .map_err(|_| AppError::internal("failed to derive push sender key"))?;

    let keys = agreement::agree_ephemeral(
        sender,
        &UnparsedPublicKey::new(&ECDH_P256, &ua_public),
        |shared| derive_keys(shared, &auth_secret, &ua_public, sender_public.as_ref(), &salt),
    )
    .map_err(|_| invalid())??;

    let mut record = Vec::with_capacity(plaintext.len() + 1);
    record.extend_from_slice(plaintext);
    record.push(0x02);

    let cipher = Aes128Gcm::new_from_slice(&keys.cek)
        .map_err(|_| AppError::internal("push content key has wrong length"))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&keys.nonce), record.as_slice())
        .map_err(|_| AppError::internal("push payload encryption failed"))?;

    let key_id = sender_public.as_ref();
    let mut body = Vec::with_capacity(16 + 4 + 1 + key_id.len() + ciphertext.len());
    body.extend_from_slice(&salt);
    body.extend_from_slice(&RECORD_SIZE.to_be_bytes());
    body.push(key_id.len() as u8);
    body.extend_from_slice(key_id);
    body.extend_from_slice(&ciphertext);
    Ok(body)
}

struct ContentKeys {
    cek: [u8; 16],
    nonce: [u8; 12],
}

/// HKDF output length for `ring::hkdf`.
struct OutputLen(usize);

impl hkdf::KeyType for OutputLen {
    fn len(&self) -> usize {
        self.0
    }
}

fn hkdf_expand(salt: &[u8], ikm: &[u8], info: &[u8], out: &mut [u8]) -> AppResult<()> {
    hkdf::Salt::new(hkdf::HKDF_SHA256, salt)
        .extract(ikm)
        .expand(&[info], OutputLen(out.len()))
        .and_then(|okm| okm.fill(out))
        .map_err(|_| AppError::internal("push key derivation failed"))
}

fn derive_keys(
    ecdh_secret: &[u8],
    auth_secret: &[u8],
    ua_public: &[u8],
    as_public: &[u8],
    salt: &[u8],
) -> AppResult<ContentKeys> {
    let mut key_info = Vec::with_capacity(14 + ua_public.len() + as_public.len());
    key_info.extend_from_slice(b"WebPush: info\0");
    key_info.extend_from_slice(ua_public);
    key_info.extend_from_slice(as_public);

    let mut ikm = [0u8; 32];
    hkdf_expand(auth_secret, ecdh_secret, &key_info, &mut ikm)?;

    let mut keys = ContentKeys {
        cek: [0u8; 16],
        nonce: [0u8; 12],
    };
    hkdf_expand(salt, &ikm, b"Content-Encoding: aes128gcm\0", &mut keys.cek)?;
    hkdf_expand(salt, &ikm, b"Content-Encoding: nonce\0", &mut keys.nonce)?;
    Ok(keys)
}

struct SendFailure {
    retryable: bool,
    error: AppError,
}

/// Push vendor client; one instance per process.
pub struct WebPushClient {
    http: reqwest::Client,
    signer: VapidSigner,
}

impl WebPushClient {
    pub fn new(config: &VapidConfig, timeout: Duration) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::internal(format!("failed to build push client: {e}")))?;
        Ok(Self {
            http,
            signer: VapidSigner::new(config)?,
        })
    }

    async fn attempt(&self, target: &PushTarget, body: &[u8]) -> Result<PushOutcome, SendFailure> {
        let fatal = |error| SendFailure {
            retryable: false,
            error,
        };
        let authorization = self.signer.authorization(&target.endpoint).map_err(fatal)?;

        let response = self
            .http
            .post(&target.endpoint)
            .header("Authorization", authorization)
            .header("TTL", PUSH_TTL_SECONDS)
            .header("Content-Encoding", "aes128gcm")
            .header("Content-Type", "application/octet-stream")
            .header("Urgency", "normal")
            .body(body.to_vec())
            .send()
            .await
            .map_err(|err| SendFailure {
                retryable: err.is_timeout() || err.is_connect(),
                error: AppError::from(err),
            })?;

        let status = response.status();
        match status {
            s if s.is_success() => Ok(PushOutcome::Delivered),
            StatusCode::NOT_FOUND | StatusCode::GONE => Ok(PushOutcome::Expired),
            s => Err(SendFailure {
                retryable: s == StatusCode::TOO_MANY_REQUESTS || s.is_server_error(),
                error: AppError::upstream("push", format!("vendor responded {s}")),
            }),
        }
    }
}

#[async_trait]
impl PushTransport for WebPushClient {
    async fn send(&self, target: &PushTarget, payload: &PushPayload) -> AppResult<PushOutcome> {
        let json = serde_json::to_vec(payload)
            .map_err(|e| AppError::internal(format!("failed to encode push payload: {e}")))?;
        let body = encrypt_payload(&target.p256dh, &target.auth, &json)?;

        retry_with_backoff(
            SEND_ATTEMPTS,
            Duration::from_millis(500),
            |failure: &SendFailure| failure.retryable,
            || self.attempt(target, &body),
        )
        .await
        .map_err(|failure| failure.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ring::signature::KeyPair;

    /// A subscriber key pair: the private half and the encoded public point.
    fn subscriber() -> (EphemeralPrivateKey, Vec<u8>) {
        let key = EphemeralPrivateKey::generate(&ECDH_P256, &SystemRandom::new()).unwrap();
        let public = key.compute_public_key().unwrap().as_ref().to_vec();
        (key, public)
    }

    /// Receiver side of RFC 8291, enough to check what we produce.
    fn decrypt(ua_key: EphemeralPrivateKey, ua_public: &[u8], auth_secret: &[u8], body: &[u8]) -> Vec<u8> {
        let salt = &body[..16];
        let rs = u32::from_be_bytes(body[16..20].try_into().unwrap());
        assert_eq!(rs, RECORD_SIZE);
        let id_len = body[20] as usize;
        let as_public = &body[21..21 + id_len];
        let ciphertext = &body[21 + id_len..];

        let keys = agreement::agree_ephemeral(
            ua_key,
            &UnparsedPublicKey::new(&ECDH_P256, as_public),
            |shared| derive_keys(shared, auth_secret, ua_public, as_public, salt),
        )
        .unwrap()
        .unwrap();

        let mut record = Aes128Gcm::new_from_slice(&keys.cek)
            .unwrap()
            .decrypt(Nonce::from_slice(&keys.nonce), ciphertext)
            .unwrap();
        assert_eq!(record.pop(), Some(0x02));
        record
    }

    #[test]
    fn payload_decrypts_with_subscriber_keys() {
        let (ua_key, ua_public) = subscriber();
        let p256dh = BASE64_URL.encode(&ua_public);
        let auth_secret = [7u8; 16];
        let auth = BASE64_URL.encode(auth_secret);

        let payload = serde_json::to_vec(&PushPayload {
            title: "Семья".into(),
            body: "⚠️ Аня вышла из зоны Школа".into(),
            url: "/family-tracker".into(),
        })
        .unwrap();

        let body = encrypt_payload(&p256dh, &auth, &payload).unwrap();
        assert_eq!(body[20], 65);
        assert_eq!(decrypt(ua_key, &ua_public, &auth_secret, &body), payload);
    }

    #[test]
    fn fresh_salt_and_sender_key_per_message() {
        let (_, ua_public) = subscriber();
        let p256dh = BASE64_URL.encode(&ua_public);
        let auth = BASE64_URL.encode([1u8; 16]);
        let a = encrypt_payload(&p256dh, &auth, b"hi").unwrap();
        let b = encrypt_payload(&p256dh, &auth, b"hi").unwrap();
        assert_ne!(a[..16], b[..16]);
        assert_ne!(a[21..86], b[21..86]);
    }

    #[test]
    fn rejects_malformed_subscription_keys() {
        let err = encrypt_payload("not-a-key", "AAAA", b"x").unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
        // decodes fine but is not a curve point
        let err = encrypt_payload(&BASE64_URL.encode([4u8; 65]), "AAAA", b"x").unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    fn vapid_config() -> VapidConfig {
        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng).unwrap();
        let pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8.as_ref(), &rng).unwrap();
        let private = &pkcs8.as_ref()[P256_PKCS8_PREFIX.len()..P256_PKCS8_PREFIX.len() + 32];
        VapidConfig {
            private_key: BASE64_URL.encode(private),
            public_key: BASE64_URL.encode(pair.public_key().as_ref()),
            subject: "mailto:ops@example.com".into(),
        }
    }

    #[test]
    fn vapid_header_targets_endpoint_origin() {
        let config = vapid_config();
        let signer = VapidSigner::new(&config).unwrap();
        let header = signer
            .authorization("https://fcm.googleapis.com/fcm/send/abc123")
            .unwrap();
        assert!(header.starts_with("vapid t="));
        assert!(header.ends_with(&format!(", k={}", config.public_key)));

        let token = header
            .trim_start_matches("vapid t=")
            .split(',')
            .next()
            .unwrap();
        let claims_b64 = token.split('.').nth(1).unwrap();
        let claims: serde_json::Value =
            serde_json::from_slice(&BASE64_URL.decode(claims_b64).unwrap()).unwrap();
        assert_eq!(claims["aud"], "https://fcm.googleapis.com");
        assert_eq!(claims["sub"], "mailto:ops@example.com");
    }

    #[test]
    fn mismatched_vapid_halves_are_rejected() {
        let mut config = vapid_config();
        config.public_key = vapid_config().public_key;
        assert!(VapidSigner::new(&config).is_err());
    }
}
