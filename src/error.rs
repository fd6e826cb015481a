use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::billing::gateway::GatewayError;

/// Domain errors shared by the credit ledger, the subscription lifecycle and
/// the billing orchestrator.
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("insufficient credits: {available} available, {requested} requested")]
    InsufficientFunds { available: i64, requested: i64 },
    #[error("no active paid subscription")]
    NoActiveEntitlement,
    #[error("ledger entry {entry_id} has already been refunded")]
    AlreadyRefunded { entry_id: i64 },
    #[error("ledger entry {entry_id} is not refundable")]
    NotRefundable { entry_id: i64 },
    #[error("account was modified concurrently, retry the operation")]
    ConcurrencyConflict,
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("invalid plan transition: {0}")]
    InvalidPlanTransition(String),
    #[error("credit account not found")]
    AccountNotFound,
    #[error("no subscription on record")]
    SubscriptionNotFound,
    #[error("ledger entry not found")]
    LedgerEntryNotFound,
    #[error("subscription plan not found")]
    PlanNotFound,
    #[error("amount must be positive")]
    InvalidAmount,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Billing(#[from] BillingError),
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("not found")]
    NotFound,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Billing(inner) => billing_status(inner),
            AppError::Db(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound => StatusCode::NOT_FOUND,
        };
        tracing::error!(?self);
        (status, self.to_string()).into_response()
    }
}

fn billing_status(error: &BillingError) -> StatusCode {
    match error {
        BillingError::InsufficientFunds { .. } => StatusCode::PAYMENT_REQUIRED,
        BillingError::NoActiveEntitlement => StatusCode::FORBIDDEN,
        BillingError::AlreadyRefunded { .. } | BillingError::ConcurrencyConflict => {
            StatusCode::CONFLICT
        }
        BillingError::NotRefundable { .. }
        | BillingError::InvalidPlanTransition(_)
        | BillingError::InvalidAmount => StatusCode::BAD_REQUEST,
        BillingError::Gateway(GatewayError::Declined(_)) => StatusCode::PAYMENT_REQUIRED,
        BillingError::Gateway(GatewayError::Timeout) => StatusCode::GATEWAY_TIMEOUT,
        BillingError::Gateway(_) => StatusCode::BAD_GATEWAY,
        BillingError::AccountNotFound
        | BillingError::SubscriptionNotFound
        | BillingError::LedgerEntryNotFound
        | BillingError::PlanNotFound => StatusCode::NOT_FOUND,
        BillingError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Postgres unique_violation, the backstop behind idempotency probes.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .map(|code| code == "23505")
        .unwrap_or(false)
}
