use axum::{
    Json,
    extract::{Extension, Query, State},
};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::{
    AppState,
    audit::{AuditCategory, AuditEntry},
    error::{AppError, AppResult},
    routes::RequestMeta,
    session::Identity,
};

const DEFAULT_SPEND_REASON: &str = "other";

#[derive(Debug, Default, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletView {
    #[default]
    Balance,
    History,
    Stats,
}

#[derive(Debug, Deserialize)]
pub struct WalletQuery {
    #[serde(default)]
    pub action: WalletView,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum WalletCommand {
    Topup {
        amount: i64,
        description: Option<String>,
    },
    Spend {
        amount: i64,
        reason: Option<String>,
        description: Option<String>,
    },
    CheckBalance {
        amount: i64,
    },
}

#[axum::debug_handler]
pub async fn query_wallet(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<WalletQuery>,
) -> AppResult<Json<Value>> {
    let scope = identity.family()?;
    let body = match query.action {
        WalletView::Balance => {
            let wallet = state.wallet.balance(scope.family_id).await?;
            json!({ "success": true, "balance": wallet.balance_rub, "updated_at": wallet.updated_at })
        }
        WalletView::History => {
            let transactions = state.wallet.history(scope.family_id, query.limit).await?;
            json!({ "success": true, "transactions": transactions })
        }
        WalletView::Stats => {
            let stats = state.wallet.stats(scope.family_id).await?;
            json!({ "success": true, "stats": stats })
        }
    };
    Ok(Json(body))
}

#[axum::debug_handler]
pub async fn update_wallet(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    meta: RequestMeta,
    Json(command): Json<WalletCommand>,
) -> AppResult<Json<Value>> {
    let scope = identity.family()?;

    let (action, amount, result) = match &command {
        WalletCommand::CheckBalance { amount } => {
            let check = state.wallet.check_balance(scope.family_id, *amount).await?;
            return Ok(Json(json!({ "success": true, "check": check })));
        }
        WalletCommand::Topup {
            amount,
            description,
        } => (
            "wallet_topup",
            *amount,
            state
                .wallet
                .topup(scope.family_id, scope.user_id, *amount, description.as_deref())
                .await,
        ),
        WalletCommand::Spend {
            amount,
            reason,
            description,
        } => (
            "wallet_spend",
            *amount,
            state
                .wallet
                .spend(
                    scope.family_id,
                    scope.user_id,
                    *amount,
                    reason.as_deref().unwrap_or(DEFAULT_SPEND_REASON),
                    description.as_deref(),
                )
                .await,
        ),
    };

    let entry = AuditEntry::new(scope.user_id, action, AuditCategory::Payment)
        .with_details(json!({ "family_id": scope.family_id, "amount": amount }))
        .with_client(meta.ip, meta.user_agent);

    match result {
        Ok(mutation) => {
            state.audit.spawn(entry);
            Ok(Json(json!({
                "success": true,
                "balance": mutation.balance,
                "transaction": mutation.transaction,
            })))
        }
        Err(err) => {
            if matches!(err, AppError::InsufficientFunds { .. }) {
                state.audit.spawn(entry.failed(err.to_string()));
            }
            Err(err)
        }
    }
}
