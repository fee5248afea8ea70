//! File uploads: type sniffing, key layout, quota and the object store seam.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::billing::{FeatureSet, SubscriptionGate};
use crate::error::{AppError, AppResult};
use crate::session::FamilyScope;

pub mod s3;

pub use s3::S3Store;

pub const MAX_OBJECT_BYTES: usize = 10 * 1024 * 1024;
/// Request body cap for upload routes: base64 of `MAX_OBJECT_BYTES` plus the JSON envelope.
pub const MAX_UPLOAD_BODY_BYTES: usize = MAX_OBJECT_BYTES.div_ceil(3) * 4 + 64 * 1024;
pub const FREE_STORAGE_BYTES: i64 = 500 * 1024 * 1024;
pub const FREE_PHOTO_LIMIT: i64 = 100;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> AppResult<()>;
    fn public_url(&self, key: &str) -> String;
}

/// Keeps objects in memory, for tests and local runs.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, (Vec<u8>, String)>>,
}

impl MemoryObjectStore {
    pub fn get(&self, key: &str) -> Option<(Vec<u8>, String)> {
        self.objects.lock().ok()?.get(key).cloned()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> AppResult<()> {
        self.objects
            .lock()
            .map_err(|_| AppError::internal("object store lock poisoned"))?
            .insert(key.to_string(), (body, content_type.to_string()));
        Ok(())
    }

    fn public_url(&self, key: &str) -> String {
        format!("memory://{key}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FileType {
    Jpeg,
    Png,
    Gif,
    Webp,
    Pdf,
}

impl FileType {
    pub fn extension(self) -> &'static str {
        match self {
            FileType::Jpeg => "jpg",
            FileType::Png => "png",
            FileType::Gif => "gif",
            FileType::Webp => "webp",
            FileType::Pdf => "pdf",
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            FileType::Jpeg => "image/jpeg",
            FileType::Png => "image/png",
            FileType::Gif => "image/gif",
            FileType::Webp => "image/webp",
            FileType::Pdf => "application/pdf",
        }
    }

    pub fn is_image(self) -> bool {
        !matches!(self, FileType::Pdf)
    }
}

/// Identifies the file from its leading bytes; the declared content type is not trusted.
pub fn sniff(bytes: &[u8]) -> Option<FileType> {
    match bytes {
        [0xFF, 0xD8, 0xFF, ..] => Some(FileType::Jpeg),
        [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, ..] => Some(FileType::Png),
        [b'G', b'I', b'F', b'8', b'7' | b'9', b'a', ..] => Some(FileType::Gif),
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => Some(FileType::Webp),
        [b'%', b'P', b'D', b'F', b'-', ..] => Some(FileType::Pdf),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadTarget {
    General { folder: String },
    Medical { child_id: Uuid, doc_type: String },
    TripPhoto { trip_id: Uuid },
    FamilyLogo,
}

impl UploadTarget {
    fn accepts(&self, file_type: FileType) -> bool {
        match self {
            UploadTarget::General { .. } => true,
            UploadTarget::Medical { .. } => {
                matches!(file_type, FileType::Jpeg | FileType::Png | FileType::Pdf)
            }
            UploadTarget::TripPhoto { .. } | UploadTarget::FamilyLogo => file_type.is_image(),
        }
    }
}

/// Lowercase `[a-z0-9_-]` path segment, falling back to `default` when nothing survives.
pub fn sanitize_segment(raw: &str, default: &str) -> String {
    let cleaned: String = raw
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(64)
        .collect();
    if cleaned.is_empty() {
        default.to_string()
    } else {
        cleaned
    }
}

pub fn object_key(
    target: &UploadTarget,
    scope: &FamilyScope,
    file_type: FileType,
    bytes: &[u8],
    now: DateTime<Utc>,
) -> String {
    let ext = file_type.extension();
    match target {
        UploadTarget::General { folder } => format!(
            "{}/{}/{}.{ext}",
            sanitize_segment(folder, "uploads"),
            now.format("%Y%m%d"),
            Uuid::new_v4()
        ),
        UploadTarget::Medical { child_id, doc_type } => {
            let mut suffix = [0u8; 4];
            OsRng.fill_bytes(&mut suffix);
            format!(
                "medical/{child_id}/{}/{}_{}.{ext}",
                sanitize_segment(doc_type, "other"),
                now.timestamp(),
                hex::encode(suffix)
            )
        }
        UploadTarget::TripPhoto { trip_id } => format!(
            "trips/trip_{trip_id}/{}_{}.{ext}",
            now.timestamp(),
            scope.user_id
        ),
        UploadTarget::FamilyLogo => format!(
            "family-logos/{}/{}.{ext}",
            scope.family_id,
            hex::encode(Md5::digest(bytes))
        ),
    }
}

/// Accepts raw base64 or a `data:<mime>;base64,` URL.
pub fn decode_body(data: &str) -> AppResult<Vec<u8>> {
    let encoded = match data.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => data,
    };
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|_| AppError::bad_request("Некорректные данные файла"))?;
    if bytes.is_empty() {
        return Err(AppError::bad_request("Пустой файл"));
    }
    if bytes.len() > MAX_OBJECT_BYTES {
        return Err(AppError::bad_request("Файл больше 10 МБ"));
    }
    Ok(bytes)
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadRequest {
    /// Base64 payload.
    pub file: String,
    pub filename: Option<String>,
    pub folder: Option<String>,
    pub content_type: Option<String>,
    pub child_id: Option<Uuid>,
    pub doc_type: Option<String>,
    pub trip_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadResult {
    pub url: String,
    pub filename: String,
    pub size: usize,
    pub content_type: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::FromRow)]
pub struct FamilyUsage {
    pub bytes: i64,
    pub photos: i64,
}

impl FamilyUsage {
    /// Free-plan quota check for one more object of `size` bytes.
    pub fn admits(&self, size: usize, is_photo: bool) -> bool {
        self.bytes + size as i64 <= FREE_STORAGE_BYTES
            && (!is_photo || self.photos < FREE_PHOTO_LIMIT)
    }
}

pub struct Uploader {
    pool: PgPool,
    store: Arc<dyn ObjectStore>,
    gate: SubscriptionGate,
}

impl Uploader {
    pub fn new(pool: PgPool, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            gate: SubscriptionGate::new(pool.clone()),
            pool,
            store,
        }
    }

    pub async fn upload(
        &self,
        scope: &FamilyScope,
        target: UploadTarget,
        request: &UploadRequest,
    ) -> AppResult<UploadResult> {
        let bytes = decode_body(&request.file)?;
        let file_type = sniff(&bytes)
            .filter(|t| target.accepts(*t))
            .ok_or_else(|| AppError::bad_request("Недопустимый тип файла"))?;
        if let Some(declared) = request.content_type.as_deref() {
            if declared != file_type.mime() {
                tracing::debug!(declared, sniffed = file_type.mime(), "declared content type ignored");
            }
        }

        if !self.gate.is_entitled(scope.family_id, FeatureSet::Premium).await? {
            let usage = self.usage(scope.family_id).await?;
            if !usage.admits(bytes.len(), file_type.is_image()) {
                return Err(AppError::subscription_required(
                    "Хранилище бесплатного тарифа заполнено. Оформите подписку",
                ));
            }
        }

        let key = object_key(&target, scope, file_type, &bytes, Utc::now());
        let size = bytes.len();
        self.store.put(&key, bytes, file_type.mime()).await?;
        let url = self.store.public_url(&key);

        sqlx::query(
            r#"
            INSERT INTO family_files (id, family_id, user_id, storage_key, size_bytes, content_type, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(scope.family_id)
        .bind(scope.user_id)
        .bind(&key)
        .bind(size as i64)
        .bind(file_type.mime())
        .execute(&self.pool)
        .await?;

        if target == UploadTarget::FamilyLogo {
            sqlx::query("UPDATE families SET logo_url = $2 WHERE id = $1")
                .bind(scope.family_id)
                .bind(&url)
                .execute(&self.pool)
                .await?;
        }

        tracing::info!(family_id = %scope.family_id, key, size, "file uploaded");
        Ok(UploadResult {
            url,
            filename: request
                .filename
                .clone()
                .unwrap_or_else(|| key.rsplit('/').next().unwrap_or(&key).to_string()),
            size,
            content_type: file_type.mime(),
        })
    }

    async fn usage(&self, family_id: Uuid) -> AppResult<FamilyUsage> {
        let usage = sqlx::query_as::<_, FamilyUsage>(
            r#"
            SELECT COALESCE(SUM(size_bytes), 0)::BIGINT AS bytes,
                   COUNT(*) FILTER (WHERE content_type LIKE 'image/%') AS photos
            FROM family_files
            WHERE family_id = $1
            "#,
        )
        .bind(family_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(usage)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::session::MemberRole;

    const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 13];
    const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0, 16];
    const PDF: &[u8] = b"%PDF-1.7\n";

    fn scope() -> FamilyScope {
        FamilyScope {
            user_id: Uuid::new_v4(),
            family_id: Uuid::new_v4(),
            member_id: Uuid::new_v4(),
            role: MemberRole::Owner,
        }
    }

    #[test]
    fn sniffs_magic_bytes() {
        assert_eq!(sniff(PNG), Some(FileType::Png));
        assert_eq!(sniff(JPEG), Some(FileType::Jpeg));
        assert_eq!(sniff(PDF), Some(FileType::Pdf));
        assert_eq!(sniff(b"GIF89a...."), Some(FileType::Gif));
        assert_eq!(sniff(b"RIFF\x10\0\0\0WEBPVP8 "), Some(FileType::Webp));
        assert_eq!(sniff(b"MZ\x90\0"), None);
        assert_eq!(sniff(&[]), None);
    }

    #[test]
    fn medical_allow_list() {
        let medical = UploadTarget::Medical {
            child_id: Uuid::new_v4(),
            doc_type: "analysis".into(),
        };
        assert!(medical.accepts(FileType::Pdf));
        assert!(medical.accepts(FileType::Jpeg));
        assert!(!medical.accepts(FileType::Gif));
        assert!(!UploadTarget::FamilyLogo.accepts(FileType::Pdf));
    }

    #[test]
    fn key_layouts() {
        let scope = scope();
        let now = Utc.with_ymd_and_hms(2025, 1, 15, 9, 30, 0).unwrap();

        let general = object_key(
            &UploadTarget::General {
                folder: "Recipes!".into(),
            },
            &scope,
            FileType::Png,
            PNG,
            now,
        );
        assert!(general.starts_with("recipes/20250115/"), "{general}");
        assert!(general.ends_with(".png"));

        let child_id = Uuid::new_v4();
        let medical = object_key(
            &UploadTarget::Medical {
                child_id,
                doc_type: "vaccination".into(),
            },
            &scope,
            FileType::Pdf,
            PDF,
            now,
        );
        let prefix = format!("medical/{child_id}/vaccination/{}_", now.timestamp());
        assert!(medical.starts_with(&prefix), "{medical}");
        assert_eq!(medical.len(), prefix.len() + 8 + ".pdf".len());

        let trip_id = Uuid::new_v4();
        let trip = object_key(&UploadTarget::TripPhoto { trip_id }, &scope, FileType::Jpeg, JPEG, now);
        assert_eq!(trip, format!("trips/trip_{trip_id}/{}_{}.jpg", now.timestamp(), scope.user_id));

        let logo = object_key(&UploadTarget::FamilyLogo, &scope, FileType::Png, PNG, now);
        assert_eq!(
            logo,
            format!("family-logos/{}/{}.png", scope.family_id, hex::encode(Md5::digest(PNG)))
        );
    }

    #[test]
    fn decodes_data_urls_and_enforces_size() {
        let encoded = BASE64.encode(PNG);
        assert_eq!(decode_body(&encoded).unwrap(), PNG);
        assert_eq!(decode_body(&format!("data:image/png;base64,{encoded}")).unwrap(), PNG);
        assert!(decode_body("@@@").is_err());
        assert!(decode_body("").is_err());

        let big = BASE64.encode(vec![0u8; MAX_OBJECT_BYTES + 1]);
        assert!(decode_body(&big).is_err());
    }

    #[test]
    fn free_quota() {
        let usage = FamilyUsage {
            bytes: FREE_STORAGE_BYTES - 10,
            photos: 99,
        };
        assert!(usage.admits(10, true));
        assert!(!usage.admits(11, false));
        let full = FamilyUsage {
            bytes: 0,
            photos: FREE_PHOTO_LIMIT,
        };
        assert!(!full.admits(1, true));
        assert!(full.admits(1, false));
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryObjectStore::default();
        store.put("a/b.png", PNG.to_vec(), "image/png").await.unwrap();
        assert_eq!(store.get("a/b.png"), Some((PNG.to_vec(), "image/png".to_string())));
        assert_eq!(store.public_url("a/b.png"), "memory://a/b.png");
    }
}
