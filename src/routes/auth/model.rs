use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::utils::{hash_password, verify_password};

pub const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, Serialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub name: String,
    /// Absent for accounts that only sign in through an OAuth provider.
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub oauth_provider: Option<String>,
    pub is_verified: bool,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: Option<String>,
    pub phone: Option<String>,
    pub password: String,
    pub name: String,
    /// Creates a family with the new user as its owner.
    pub family_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    /// Email or phone.
    pub login: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub success: bool,
    pub user: User,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}

impl RegisterRequest {
    /// Normalized `(email, phone)`; at least one must be present.
    pub fn contacts(&self) -> AppResult<(Option<String>, Option<String>)> {
        let email = non_empty(self.email.as_deref()).map(|e| e.to_lowercase());
        let phone = non_empty(self.phone.as_deref());
        if email.is_none() && phone.is_none() {
            return Err(AppError::bad_request("Укажите email или телефон"));
        }
        if email.as_deref().is_some_and(|e| !e.contains('@')) {
            return Err(AppError::bad_request("Некорректный email"));
        }
        if self.name.trim().is_empty() {
            return Err(AppError::bad_request("Укажите имя"));
        }
        validate_password(&self.password)?;
        Ok((email, phone))
    }
}

pub fn validate_password(password: &str) -> AppResult<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AppError::bad_request(format!(
            "Пароль должен содержать не менее {MIN_PASSWORD_LEN} символов"
        )));
    }
    Ok(())
}

fn hashing_failed(err: bcrypt::BcryptError) -> AppError {
    AppError::internal(format!("password hashing failed: {err}"))
}

const USER_COLUMNS: &str =
    "id, email, phone, name, password_hash, oauth_provider, is_verified, last_login_at, created_at";

impl User {
    pub async fn create(
        pool: &PgPool,
        req: &RegisterRequest,
        email: Option<String>,
        phone: Option<String>,
    ) -> AppResult<Self> {
        let password_hash = hash_password(&req.password).map_err(hashing_failed)?;
        let mut tx = pool.begin().await?;

        let user = sqlx::query_as::<_, User>(&format!(
            r#"
            INSERT INTO users (id, email, phone, name, password_hash, created_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(email)
        .bind(phone)
        .bind(req.name.trim())
        .bind(password_hash)
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                AppError::Conflict("Пользователь уже существует".into())
            }
            _ => AppError::from(err),
        })?;

        if let Some(family_name) = non_empty(req.family_name.as_deref()) {
            let family_id = Uuid::new_v4();
            sqlx::query("INSERT INTO families (id, name, created_at) VALUES ($1, $2, NOW())")
                .bind(family_id)
                .bind(&family_name)
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                r#"
                INSERT INTO family_members (id, family_id, user_id, name, role, status, joined_at)
                VALUES ($1, $2, $3, $4, 'owner', 'active', NOW())
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(family_id)
            .bind(user.id)
            .bind(&user.name)
            .execute(&mut *tx)
            .await?;
            tracing::info!(user_id = %user.id, %family_id, "family created on registration");
        }

        tx.commit().await?;
        Ok(user)
    }

    pub async fn find_by_login(pool: &PgPool, login: &str) -> AppResult<Option<Self>> {
        let login = login.trim();
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email = LOWER($1) OR phone = $1 LIMIT 1"
        ))
        .bind(login)
        .fetch_optional(pool)
        .await?;
        Ok(user)
    }

    pub async fn find_by_id(pool: &PgPool, user_id: Uuid) -> AppResult<Self> {
        sqlx::query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
            .bind(user_id)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| AppError::not_found("Пользователь не найден"))
    }

    pub fn verify_login(&self, password: &str) -> AppResult<bool> {
        match self.password_hash.as_deref() {
            Some(hash) => verify_password(password, hash).map_err(hashing_failed),
            None => Ok(false),
        }
    }

    pub async fn touch_login(pool: &PgPool, user_id: Uuid) -> AppResult<()> {
        sqlx::query("UPDATE users SET last_login_at = NOW() WHERE id = $1")
            .bind(user_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn update_password(pool: &PgPool, user_id: Uuid, password: &str) -> AppResult<()> {
        let password_hash = hash_password(password).map_err(hashing_failed)?;
        sqlx::query("UPDATE users SET password_hash = $2 WHERE id = $1")
            .bind(user_id)
            .bind(password_hash)
            .execute(pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(email: Option<&str>, phone: Option<&str>, password: &str) -> RegisterRequest {
        RegisterRequest {
            email: email.map(str::to_string),
            phone: phone.map(str::to_string),
            password: password.into(),
            name: "Анна".into(),
            family_name: None,
        }
    }

    #[test]
    fn registration_needs_a_contact() {
        assert!(request(None, Some("  "), "password1").contacts().is_err());
        let (email, phone) = request(Some(" Anna@Example.com "), None, "password1")
            .contacts()
            .unwrap();
        assert_eq!(email.as_deref(), Some("anna@example.com"));
        assert!(phone.is_none());
    }

    #[test]
    fn oauth_only_accounts_never_match_a_password() {
        let user = User {
            id: Uuid::new_v4(),
            email: Some("anna@example.com".into()),
            phone: None,
            name: "Анна".into(),
            password_hash: None,
            oauth_provider: Some("yandex".into()),
            is_verified: true,
            last_login_at: None,
            created_at: Utc::now(),
        };
        assert!(!user.verify_login("password1").unwrap());
    }

    #[test]
    fn short_passwords_are_rejected() {
        assert!(matches!(
            request(None, Some("79001234567"), "short").contacts(),
            Err(AppError::BadRequest(_))
        ));
        assert!(validate_password("пароль12").is_ok());
    }
}
