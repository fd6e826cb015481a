use axum::{
    extract::{Extension, Path, Query},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::billing::orchestrator::BillingOrchestrator;
use crate::error::AppResult;

use super::manager::CreditManager;
use super::models::{CreditAccount, CreditPool, GrantKind, LedgerEntry};

const DEFAULT_LEDGER_PAGE: i64 = 50;
const MAX_LEDGER_PAGE: i64 = 200;

pub async fn get_balance(
    Extension(manager): Extension<CreditManager>,
    Path(user_id): Path<i64>,
) -> AppResult<Json<BalanceEnvelope>> {
    let account = manager.get_or_create_account(user_id).await?;
    Ok(Json(account.into()))
}

pub async fn list_ledger(
    Extension(manager): Extension<CreditManager>,
    Path(user_id): Path<i64>,
    Query(query): Query<LedgerQuery>,
) -> AppResult<Json<Vec<LedgerEntry>>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LEDGER_PAGE)
        .clamp(1, MAX_LEDGER_PAGE);
    let entries = manager.ledger(user_id, limit).await?;
    Ok(Json(entries))
}

pub async fn debit_credits(
    Extension(manager): Extension<CreditManager>,
    Path(user_id): Path<i64>,
    Json(payload): Json<DebitRequest>,
) -> AppResult<Json<LedgerMutationEnvelope>> {
    let outcome = manager
        .debit(
            user_id,
            payload.amount,
            payload.reference_type.as_deref(),
            payload.reference_id.as_deref(),
            payload.description.as_deref(),
        )
        .await?;
    Ok(Json(LedgerMutationEnvelope {
        account: outcome.account.into(),
        entry: outcome.entry,
    }))
}

pub async fn grant_credits(
    Extension(manager): Extension<CreditManager>,
    Path(user_id): Path<i64>,
    Json(payload): Json<GrantRequest>,
) -> AppResult<Json<LedgerMutationEnvelope>> {
    let (account, entry) = manager
        .credit(
            user_id,
            payload.amount,
            payload.pool,
            payload.kind,
            payload.reference_type.as_deref(),
            payload.reference_id.as_deref(),
            payload.description.as_deref(),
        )
        .await?;
    Ok(Json(LedgerMutationEnvelope {
        account: account.into(),
        entry,
    }))
}

pub async fn refund_entry(
    Extension(manager): Extension<CreditManager>,
    Path(user_id): Path<i64>,
    Json(payload): Json<RefundRequest>,
) -> AppResult<Json<LedgerMutationEnvelope>> {
    let (account, entry) = manager
        .refund(user_id, payload.entry_id, payload.reason.as_deref())
        .await?;
    Ok(Json(LedgerMutationEnvelope {
        account: account.into(),
        entry,
    }))
}

pub async fn purchase_credits(
    Extension(orchestrator): Extension<BillingOrchestrator>,
    Path(user_id): Path<i64>,
    Json(payload): Json<PurchaseRequest>,
) -> AppResult<Json<PurchaseEnvelope>> {
    let outcome = orchestrator
        .purchase_credits(
            user_id,
            payload.credits,
            payload.amount_cents,
            &payload.payer_token,
            payload.memo.as_deref(),
        )
        .await?;
    Ok(Json(PurchaseEnvelope {
        account: outcome.account.into(),
        entry: outcome.entry,
        transaction_ref: outcome.transaction_ref,
    }))
}

#[derive(Debug, Serialize)]
pub struct BalanceEnvelope {
    pub user_id: i64,
    pub bonus_credits: i64,
    pub subscription_credits: i64,
    pub purchased_credits: i64,
    pub total_credits: i64,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl From<CreditAccount> for BalanceEnvelope {
    fn from(account: CreditAccount) -> Self {
        Self {
            user_id: account.user_id,
            bonus_credits: account.bonus_credits,
            subscription_credits: account.subscription_credits,
            purchased_credits: account.purchased_credits,
            total_credits: account.total_credits,
            last_used_at: account.last_used_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LedgerMutationEnvelope {
    pub account: BalanceEnvelope,
    pub entry: LedgerEntry,
}

#[derive(Debug, Serialize)]
pub struct PurchaseEnvelope {
    pub account: BalanceEnvelope,
    pub entry: LedgerEntry,
    pub transaction_ref: String,
}

#[derive(Debug, Deserialize)]
pub struct LedgerQuery {
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct DebitRequest {
    pub amount: i64,
    #[serde(default)]
    pub reference_type: Option<String>,
    #[serde(default)]
    pub reference_id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GrantRequest {
    pub amount: i64,
    pub pool: CreditPool,
    pub kind: GrantKind,
    #[serde(default)]
    pub reference_type: Option<String>,
    #[serde(default)]
    pub reference_id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RefundRequest {
    pub entry_id: i64,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PurchaseRequest {
    pub credits: i64,
    pub amount_cents: i64,
    pub payer_token: String,
    #[serde(default)]
    pub memo: Option<String>,
}
