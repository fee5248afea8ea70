//! Family wallet: one balance row per family plus an append-only ledger.
//!
//! Every mutation locks the wallet row for the length of its transaction, so
//! the balance always equals topups minus spends and never goes negative.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

pub const MAX_TOPUP_RUB: i64 = 100_000;
pub const MAX_HISTORY_ROWS: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum TransactionType {
    Topup,
    Spend,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Wallet {
    pub id: Uuid,
    pub family_id: Uuid,
    pub balance_rub: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct WalletTransaction {
    pub id: Uuid,
    pub wallet_id: Uuid,
    #[serde(rename = "type")]
    #[sqlx(rename = "type")]
    pub kind: TransactionType,
    pub amount_rub: i64,
    pub reason: String,
    pub description: Option<String>,
    pub user_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BalanceCheck {
    pub enough: bool,
    pub balance: i64,
    pub required: i64,
    pub deficit: i64,
}

impl BalanceCheck {
    pub fn new(balance: i64, required: i64) -> Self {
        Self {
            enough: balance >= required,
            balance,
            required,
            deficit: (required - balance).max(0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct ReasonTotal {
    pub reason: String,
    pub total: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WalletStats {
    pub balance: i64,
    pub total_topup: i64,
    pub total_spent: i64,
    pub spend_by_reason: Vec<ReasonTotal>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Mutation {
    pub balance: i64,
    pub transaction: WalletTransaction,
}

pub fn validate_topup(amount: i64) -> AppResult<()> {
    if amount <= 0 || amount > MAX_TOPUP_RUB {
        return Err(AppError::bad_request(format!(
            "Сумма пополнения должна быть от 1 до {MAX_TOPUP_RUB} ₽"
        )));
    }
    Ok(())
}

pub fn validate_spend(amount: i64, reason: &str) -> AppResult<()> {
    if amount <= 0 {
        return Err(AppError::bad_request("Сумма должна быть больше нуля"));
    }
    if reason.trim().is_empty() {
        return Err(AppError::bad_request("Укажите причину списания"));
    }
    Ok(())
}

#[derive(Clone)]
pub struct WalletLedger {
    pool: PgPool,
}

impl WalletLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn balance(&self, family_id: Uuid) -> AppResult<Wallet> {
        sqlx::query(
            r#"
            INSERT INTO wallets (id, family_id, balance_rub, updated_at)
            VALUES ($1, $2, 0, NOW())
            ON CONFLICT (family_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(family_id)
        .execute(&self.pool)
        .await?;

        let wallet = sqlx::query_as::<_, Wallet>(
            "SELECT id, family_id, balance_rub, updated_at FROM wallets WHERE family_id = $1",
        )
        .bind(family_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(wallet)
    }

    pub async fn topup(
        &self,
        family_id: Uuid,
        user_id: Uuid,
        amount: i64,
        description: Option<&str>,
    ) -> AppResult<Mutation> {
        validate_topup(amount)?;
        let mut tx = self.pool.begin().await?;
        let wallet = Self::lock(&mut tx, family_id).await?;

        let balance = wallet.balance_rub + amount;
        let transaction = Self::append(
            &mut tx,
            &wallet,
            balance,
            TransactionType::Topup,
            amount,
            "topup",
            description,
            user_id,
        )
        .await?;
        tx.commit().await?;

        tracing::info!(%family_id, %user_id, amount, balance, "wallet topped up");
        Ok(Mutation {
            balance,
            transaction,
        })
    }

    pub async fn spend(
        &self,
        family_id: Uuid,
        user_id: Uuid,
        amount: i64,
        reason: &str,
        description: Option<&str>,
    ) -> AppResult<Mutation> {
        validate_spend(amount, reason)?;
        let mut tx = self.pool.begin().await?;
        let wallet = Self::lock(&mut tx, family_id).await?;

        if wallet.balance_rub < amount {
            return Err(AppError::InsufficientFunds {
                balance: wallet.balance_rub,
                required: amount,
            });
        }

        let balance = wallet.balance_rub - amount;
        let transaction = Self::append(
            &mut tx,
            &wallet,
            balance,
            TransactionType::Spend,
            amount,
            reason.trim(),
            description,
            user_id,
        )
        .await?;
        tx.commit().await?;

        tracing::info!(%family_id, %user_id, amount, reason, balance, "wallet spend");
        Ok(Mutation {
            balance,
            transaction,
        })
    }

    pub async fn check_balance(&self, family_id: Uuid, required: i64) -> AppResult<BalanceCheck> {
        if required < 0 {
            return Err(AppError::bad_request("Сумма не может быть отрицательной"));
        }
        let wallet = self.balance(family_id).await?;
        Ok(BalanceCheck::new(wallet.balance_rub, required))
    }

    pub async fn history(&self, family_id: Uuid, limit: Option<i64>) -> AppResult<Vec<WalletTransaction>> {
        let wallet = self.balance(family_id).await?;
        let rows = sqlx::query_as::<_, WalletTransaction>(
            r#"
            SELECT id, wallet_id, type, amount_rub, reason, description, user_id, created_at
            FROM wallet_transactions
            WHERE wallet_id = $1
            ORDER BY created_at DESC, seq DESC
            LIMIT $2
            "#,
        )
        .bind(wallet.id)
        .bind(limit.unwrap_or(50).clamp(1, MAX_HISTORY_ROWS))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn stats(&self, family_id: Uuid) -> AppResult<WalletStats> {
        let wallet = self.balance(family_id).await?;
        let (total_topup, total_spent) = sqlx::query_as::<_, (i64, i64)>(
            r#"
            SELECT
                COALESCE(SUM(amount_rub) FILTER (WHERE type = 'topup'), 0)::BIGINT,
                COALESCE(SUM(amount_rub) FILTER (WHERE type = 'spend'), 0)::BIGINT
            FROM wallet_transactions
            WHERE wallet_id = $1
            "#,
        )
        .bind(wallet.id)
        .fetch_one(&self.pool)
        .await?;

        let spend_by_reason = sqlx::query_as::<_, ReasonTotal>(
            r#"
            SELECT reason, SUM(amount_rub)::BIGINT AS total
            FROM wallet_transactions
            WHERE wallet_id = $1 AND type = 'spend'
            GROUP BY reason
            ORDER BY total DESC, reason
            "#,
        )
        .bind(wallet.id)
        .fetch_all(&self.pool)
        .await?;

        Ok(WalletStats {
            balance: wallet.balance_rub,
            total_topup,
            total_spent,
            spend_by_reason,
        })
    }

    async fn lock(tx: &mut Transaction<'_, Postgres>, family_id: Uuid) -> AppResult<Wallet> {
        sqlx::query(
            r#"
            INSERT INTO wallets (id, family_id, balance_rub, updated_at)
            VALUES ($1, $2, 0, NOW())
            ON CONFLICT (family_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(family_id)
        .execute(&mut **tx)
        .await?;

        let wallet = sqlx::query_as::<_, Wallet>(
            r#"
            SELECT id, family_id, balance_rub, updated_at
            FROM wallets
            WHERE family_id = $1
            FOR UPDATE
            "#,
        )
        .bind(family_id)
        .fetch_one(&mut **tx)
        .await?;
        Ok(wallet)
    }

    #[allow(clippy::too_many_arguments)]
    async fn append(
        tx: &mut Transaction<'_, Postgres>,
        wallet: &Wallet,
        new_balance: i64,
        kind: TransactionType,
        amount: i64,
        reason: &str,
        description: Option<&str>,
        user_id: Uuid,
    ) -> AppResult<WalletTransaction> {
        sqlx::query("UPDATE wallets SET balance_rub = $2, updated_at = NOW() WHERE id = $1")
            .bind(wallet.id)
            .bind(new_balance)
            .execute(&mut **tx)
            .await?;

        let transaction = sqlx::query_as::<_, WalletTransaction>(
            r#"
            INSERT INTO wallet_transactions (id, wallet_id, type, amount_rub, reason, description, user_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            RETURNING id, wallet_id, type, amount_rub, reason, description, user_id, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(wallet.id)
        .bind(kind)
        .bind(amount)
        .bind(reason)
        .bind(description)
        .bind(user_id)
        .fetch_one(&mut **tx)
        .await?;
        Ok(transaction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topup_bounds() {
        assert!(validate_topup(0).is_err());
        assert!(validate_topup(-5).is_err());
        assert!(validate_topup(1).is_ok());
        assert!(validate_topup(MAX_TOPUP_RUB).is_ok());
        assert!(validate_topup(MAX_TOPUP_RUB + 1).is_err());
    }

    #[test]
    fn spend_requires_reason() {
        assert!(validate_spend(100, "school").is_ok());
        assert!(validate_spend(100, "  ").is_err());
        assert!(validate_spend(0, "school").is_err());
    }

    #[test]
    fn balance_check_reports_deficit() {
        assert_eq!(
            BalanceCheck::new(450, 500),
            BalanceCheck {
                enough: false,
                balance: 450,
                required: 500,
                deficit: 50
            }
        );
        let ok = BalanceCheck::new(450, 450);
        assert!(ok.enough);
        assert_eq!(ok.deficit, 0);
    }

    #[test]
    fn underflow_error_carries_amounts() {
        let err = AppError::InsufficientFunds {
            balance: 450,
            required: 500,
        };
        assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);
    }
}
