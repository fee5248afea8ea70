//! Medical data of a family member. Every free-text field is stored through
//! the vault; only the blood type stays readable in the table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::crypto::Vault;
use crate::error::{AppError, AppResult};

#[derive(Debug, FromRow)]
struct HealthProfileRow {
    id: Uuid,
    member_id: Uuid,
    blood_type: Option<String>,
    allergies: Option<String>,
    chronic_diseases: Option<String>,
    medications: Option<String>,
    notes: Option<String>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthProfile {
    pub id: Uuid,
    pub member_id: Uuid,
    pub blood_type: Option<String>,
    pub allergies: Vec<String>,
    pub chronic_diseases: Vec<String>,
    pub medications: Vec<String>,
    pub notes: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthProfileInput {
    /// Defaults to the caller's own membership.
    pub member_id: Option<Uuid>,
    pub blood_type: Option<String>,
    #[serde(default)]
    pub allergies: Vec<String>,
    #[serde(default)]
    pub chronic_diseases: Vec<String>,
    #[serde(default)]
    pub medications: Vec<String>,
    pub notes: Option<String>,
}

fn decrypt_list(vault: &Vault, stored: Option<&str>) -> Vec<String> {
    stored.map(|s| vault.decrypt_list(s)).unwrap_or_default()
}

impl HealthProfile {
    fn from_row(row: HealthProfileRow, vault: &Vault) -> Self {
        Self {
            id: row.id,
            member_id: row.member_id,
            blood_type: row.blood_type,
            allergies: decrypt_list(vault, row.allergies.as_deref()),
            chronic_diseases: decrypt_list(vault, row.chronic_diseases.as_deref()),
            medications: decrypt_list(vault, row.medications.as_deref()),
            notes: row
                .notes
                .as_deref()
                .map(|n| vault.decrypt(n))
                .filter(|n| !n.is_empty()),
            updated_at: row.updated_at,
        }
    }

    pub async fn ensure_member(pool: &PgPool, family_id: Uuid, member_id: Uuid) -> AppResult<()> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM family_members WHERE id = $1 AND family_id = $2)",
        )
        .bind(member_id)
        .bind(family_id)
        .fetch_one(pool)
        .await?;
        if !exists {
            return Err(AppError::not_found("Участник семьи не найден"));
        }
        Ok(())
    }

    pub async fn load(
        pool: &PgPool,
        vault: &Vault,
        family_id: Uuid,
        member_id: Uuid,
    ) -> AppResult<Option<Self>> {
        let row = sqlx::query_as::<_, HealthProfileRow>(
            r#"
            SELECT id, member_id, blood_type, allergies, chronic_diseases, medications, notes, updated_at
            FROM health_profiles
            WHERE family_id = $1 AND member_id = $2
            "#,
        )
        .bind(family_id)
        .bind(member_id)
        .fetch_optional(pool)
        .await?;
        Ok(row.map(|row| Self::from_row(row, vault)))
    }

    pub async fn save(
        pool: &PgPool,
        vault: &Vault,
        family_id: Uuid,
        member_id: Uuid,
        input: &HealthProfileInput,
    ) -> AppResult<Self> {
        let notes = input.notes.as_deref().map(|n| vault.encrypt(n));
        let row = sqlx::query_as::<_, HealthProfileRow>(
            r#"
            INSERT INTO health_profiles (
                id, family_id, member_id, blood_type, allergies, chronic_diseases,
                medications, notes, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
            ON CONFLICT (member_id) DO UPDATE SET
                blood_type = EXCLUDED.blood_type,
                allergies = EXCLUDED.allergies,
                chronic_diseases = EXCLUDED.chronic_diseases,
                medications = EXCLUDED.medications,
                notes = EXCLUDED.notes,
                updated_at = NOW()
            RETURNING id, member_id, blood_type, allergies, chronic_diseases, medications, notes, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(family_id)
        .bind(member_id)
        .bind(input.blood_type.as_deref())
        .bind(vault.encrypt_list(&input.allergies))
        .bind(vault.encrypt_list(&input.chronic_diseases))
        .bind(vault.encrypt_list(&input.medications))
        .bind(notes)
        .fetch_one(pool)
        .await?;
        Ok(Self::from_row(row, vault))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> Vault {
        Vault::from_key(&[7u8; 32]).unwrap()
    }

    #[test]
    fn rows_decrypt_into_lists() {
        let vault = vault();
        let allergies = vec!["пенициллин".to_string(), "орехи".to_string()];
        let stored = vault.encrypt_list(&allergies);
        assert!(stored.contains(':'));
        assert!(!stored.contains("пенициллин"));

        let row = HealthProfileRow {
            id: Uuid::new_v4(),
            member_id: Uuid::new_v4(),
            blood_type: Some("A+".into()),
            allergies: Some(stored.clone()),
            chronic_diseases: None,
            medications: Some("аспирин".into()),
            notes: Some(vault.encrypt("после обеда")),
            updated_at: Utc::now(),
        };
        let profile = HealthProfile::from_row(row, &vault);
        assert_eq!(profile.allergies, allergies);
        assert!(profile.chronic_diseases.is_empty());
        // legacy plaintext rows still read back
        assert_eq!(profile.medications, vec!["аспирин".to_string()]);
        assert_eq!(profile.notes.as_deref(), Some("после обеда"));

        assert_ne!(vault.encrypt_list(&allergies), stored);
    }
}
