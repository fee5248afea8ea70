use std::env;
use std::str::FromStr;
use std::time::Duration;

use chrono::NaiveDate;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct VapidConfig {
    /// Base64url raw P-256 scalar, the format emitted by `web-push generate-vapid-keys`.
    pub private_key: String,
    pub public_key: String,
    pub subject: String,
}

#[derive(Debug, Clone)]
pub struct PaymentConfig {
    pub api_url: String,
    pub shop_id: String,
    pub secret_key: String,
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
}

#[derive(Debug, Clone)]
pub struct SmsConfig {
    pub api_url: String,
    pub api_key: String,
}

#[derive(Debug, Clone)]
pub struct ObjectStorageConfig {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub cdn_base_url: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub db_max_connections: u32,
    pub run_migrations: bool,
    pub redis_url: Option<String>,
    pub server_host: String,
    pub server_port: u16,
    pub api_base_uri: String,
    pub encryption_key: Option<String>,
    pub legacy_plaintext_cutoff: Option<NaiveDate>,
    pub admin_token: Option<String>,
    pub session_ttl_hours: i64,
    pub geofence_accuracy_threshold_m: f64,
    pub family_utc_offset_hours: i32,
    pub vapid: Option<VapidConfig>,
    pub payment: Option<PaymentConfig>,
    pub smtp: Option<SmtpConfig>,
    pub sms: Option<SmsConfig>,
    pub object_storage: Option<ObjectStorageConfig>,
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match optional(name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
        None => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let vapid = match (optional("VAPID_PRIVATE_KEY"), optional("VAPID_PUBLIC_KEY")) {
            (Some(private_key), Some(public_key)) => Some(VapidConfig {
                private_key,
                public_key,
                subject: optional("VAPID_SUBJECT")
                    .unwrap_or_else(|| "mailto:admin@family-organizer.ru".into()),
            }),
            _ => None,
        };

        let payment = match (
            optional("PAYMENT_SHOP_ID"),
            optional("PAYMENT_SECRET_KEY"),
        ) {
            (Some(shop_id), Some(secret_key)) => Some(PaymentConfig {
                api_url: optional("PAYMENT_API_URL")
                    .unwrap_or_else(|| "https://api.yookassa.ru/v3".into()),
                shop_id,
                secret_key,
            }),
            _ => None,
        };

        let smtp = match optional("SMTP_HOST") {
            Some(host) => Some(SmtpConfig {
                host,
                port: parsed("SMTP_PORT", 587)?,
                username: optional("SMTP_USERNAME").unwrap_or_default(),
                password: optional("SMTP_PASSWORD").unwrap_or_default(),
                from: optional("SMTP_FROM")
                    .unwrap_or_else(|| "Семейный органайзер <noreply@family-organizer.ru>".into()),
            }),
            None => None,
        };

        let sms = match (optional("SMS_API_URL"), optional("SMS_API_KEY")) {
            (Some(api_url), Some(api_key)) => Some(SmsConfig { api_url, api_key }),
            _ => None,
        };

        let object_storage = match (
            optional("S3_BUCKET"),
            optional("S3_ACCESS_KEY_ID"),
            optional("S3_SECRET_ACCESS_KEY"),
        ) {
            (Some(bucket), Some(access_key_id), Some(secret_access_key)) => {
                let endpoint = optional("S3_ENDPOINT")
                    .unwrap_or_else(|| "https://storage.yandexcloud.net".into());
                let cdn_base_url = optional("CDN_BASE_URL")
                    .unwrap_or_else(|| format!("{}/{}", endpoint.trim_end_matches('/'), bucket));
                Some(ObjectStorageConfig {
                    endpoint,
                    region: optional("S3_REGION").unwrap_or_else(|| "ru-central1".into()),
                    bucket,
                    access_key_id,
                    secret_access_key,
                    cdn_base_url,
                })
            }
            _ => None,
        };

        let legacy_plaintext_cutoff = match optional("LEGACY_PLAINTEXT_CUTOFF") {
            Some(value) => Some(
                NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").map_err(|_| {
                    ConfigError::Invalid {
                        name: "LEGACY_PLAINTEXT_CUTOFF",
                        value,
                    }
                })?,
            ),
            None => None,
        };

        Ok(Config {
            database_url: optional("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?,
            db_max_connections: parsed("DB_MAX_CONNECTIONS", 10)?,
            run_migrations: parsed("RUN_MIGRATIONS", true)?,
            redis_url: optional("REDIS_URL"),
            server_host: optional("SERVER_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            server_port: parsed("SERVER_PORT", 3000)?,
            api_base_uri: optional("API_BASE_URI").unwrap_or_else(|| "/api".into()),
            encryption_key: optional("ENCRYPTION_KEY"),
            legacy_plaintext_cutoff,
            admin_token: optional("ADMIN_TOKEN"),
            session_ttl_hours: parsed("SESSION_TTL_HOURS", 720)?,
            geofence_accuracy_threshold_m: parsed("GEOFENCE_ACCURACY_THRESHOLD_M", 200.0)?,
            family_utc_offset_hours: parsed("FAMILY_UTC_OFFSET_HOURS", 3)?,
            vapid,
            payment,
            smtp,
            sms,
            object_storage,
        })
    }

    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.session_ttl_hours)
    }

    pub fn push_timeout(&self) -> Duration {
        Duration::from_secs(10)
    }

    pub fn smtp_timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    pub fn payment_timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    pub fn helper_timeout(&self) -> Duration {
        Duration::from_secs(5)
    }

    /// Baseline config for unit tests; nothing here touches a live service.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Config {
            database_url: "postgres://localhost/family_test".into(),
            db_max_connections: 1,
            run_migrations: false,
            redis_url: None,
            server_host: "127.0.0.1".into(),
            server_port: 0,
            api_base_uri: "/api".into(),
            encryption_key: None,
            legacy_plaintext_cutoff: None,
            admin_token: Some("admin-secret".into()),
            session_ttl_hours: 24,
            geofence_accuracy_threshold_m: 200.0,
            family_utc_offset_hours: 3,
            vapid: None,
            payment: None,
            smtp: None,
            sms: None,
            object_storage: None,
        }
    }
}
