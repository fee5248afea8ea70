//! Session token -> user -> family resolution.
//!
//! Sessions are only checked at pipeline entry; deleting the row revokes the
//! token for subsequent requests while in-flight ones complete.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::utils::generate_session_token;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum MemberRole {
    Owner,
    Admin,
    Member,
}

impl MemberRole {
    pub fn can_manage(self) -> bool {
        matches!(self, MemberRole::Owner | MemberRole::Admin)
    }
}

/// Who is calling. `family_id`/`member_id` are absent for users without an
/// active membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub user_id: Uuid,
    pub family_id: Option<Uuid>,
    pub member_id: Option<Uuid>,
    pub role: Option<MemberRole>,
}

/// Identity of a caller that belongs to a family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FamilyScope {
    pub user_id: Uuid,
    pub family_id: Uuid,
    pub member_id: Uuid,
    pub role: MemberRole,
}

impl Identity {
    pub fn family(&self) -> AppResult<FamilyScope> {
        match (self.family_id, self.member_id, self.role) {
            (Some(family_id), Some(member_id), Some(role)) => Ok(FamilyScope {
                user_id: self.user_id,
                family_id,
                member_id,
                role,
            }),
            _ => Err(AppError::forbidden("Пользователь не состоит в семье")),
        }
    }
}

impl FamilyScope {
    pub fn require_manager(&self) -> AppResult<()> {
        if self.role.can_manage() {
            Ok(())
        } else {
            Err(AppError::forbidden("Недостаточно прав"))
        }
    }
}

#[derive(sqlx::FromRow)]
struct IdentityRow {
    user_id: Uuid,
    family_id: Option<Uuid>,
    member_id: Option<Uuid>,
    role: Option<MemberRole>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IssuedSession {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct SessionResolver {
    pool: PgPool,
}

impl SessionResolver {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn resolve(&self, token: &str) -> AppResult<Identity> {
        if token.is_empty() {
            return Err(AppError::Unauthorized);
        }

        let row = sqlx::query_as::<_, IdentityRow>(
            r#"
            SELECT s.user_id, fm.family_id, fm.id AS member_id, fm.role
            FROM sessions s
            LEFT JOIN LATERAL (
                SELECT id, family_id, role
                FROM family_members
                WHERE user_id = s.user_id AND status = 'active'
                ORDER BY joined_at
                LIMIT 1
            ) fm ON TRUE
            WHERE s.token = $1 AND s.expires_at > NOW()
            "#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AppError::Unauthorized)?;

        Ok(Identity {
            user_id: row.user_id,
            family_id: row.family_id,
            member_id: row.member_id,
            role: row.role,
        })
    }

    pub async fn issue(&self, user_id: Uuid, ttl: Duration) -> AppResult<IssuedSession> {
        let token = generate_session_token();
        let expires_at = sqlx::query_scalar::<_, DateTime<Utc>>(
            r#"
            INSERT INTO sessions (token, user_id, created_at, expires_at)
            VALUES ($1, $2, NOW(), NOW() + $3 * INTERVAL '1 second')
            RETURNING expires_at
            "#,
        )
        .bind(&token)
        .bind(user_id)
        .bind(ttl.num_seconds() as f64)
        .fetch_one(&self.pool)
        .await?;

        tracing::debug!(%user_id, %expires_at, "session issued");
        Ok(IssuedSession { token, expires_at })
    }

    pub async fn revoke(&self, token: &str) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM sessions WHERE token = $1")
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Drops every session of the user except `keep`, used after a password change.
    pub async fn revoke_others(&self, user_id: Uuid, keep: &str) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM sessions WHERE user_id = $1 AND token <> $2")
            .bind(user_id)
            .bind(keep)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_scope_requires_membership() {
        let identity = Identity {
            user_id: Uuid::new_v4(),
            family_id: None,
            member_id: None,
            role: None,
        };
        assert!(matches!(identity.family(), Err(AppError::Forbidden(_))));

        let family_id = Uuid::new_v4();
        let member = Identity {
            family_id: Some(family_id),
            member_id: Some(Uuid::new_v4()),
            role: Some(MemberRole::Member),
            ..identity
        };
        let scope = member.family().unwrap();
        assert_eq!(scope.family_id, family_id);
        assert!(scope.require_manager().is_err());
    }

    #[test]
    fn owners_and_admins_manage() {
        assert!(MemberRole::Owner.can_manage());
        assert!(MemberRole::Admin.can_manage());
        assert!(!MemberRole::Member.can_manage());
    }
}
