use axum::extract::{Path, Query};
use axum::{Extension, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::billing::{BillingOrchestrator, SubscriptionCheckout};
use crate::error::AppResult;

use super::models::{Subscription, SubscriptionHistoryEntry, SubscriptionPlan, UpgradeQuote};
use super::service::SubscriptionService;

const DEFAULT_HISTORY_PAGE: i64 = 50;
const MAX_HISTORY_PAGE: i64 = 200;

#[derive(Debug, Serialize)]
pub struct SubscriptionEnvelope {
    pub subscription: Subscription,
    pub plan: SubscriptionPlan,
}

#[derive(Debug, Deserialize)]
pub struct StartSubscriptionRequest {
    pub plan_id: Uuid,
    #[serde(default)]
    pub trial: bool,
    #[serde(default)]
    pub payer_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpgradeSubscriptionRequest {
    pub plan_id: Uuid,
    #[serde(default)]
    pub payer_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpgradePriceQuery {
    pub plan_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub limit: Option<i64>,
}

pub async fn get_subscription(
    Extension(service): Extension<SubscriptionService>,
    Path(user_id): Path<i64>,
) -> AppResult<Json<Option<SubscriptionEnvelope>>> {
    let envelope = service
        .subscription_with_plan(user_id)
        .await?
        .map(|(subscription, plan)| SubscriptionEnvelope { subscription, plan });
    Ok(Json(envelope))
}

pub async fn start_subscription(
    Extension(orchestrator): Extension<BillingOrchestrator>,
    Path(user_id): Path<i64>,
    Json(payload): Json<StartSubscriptionRequest>,
) -> AppResult<Json<SubscriptionCheckout>> {
    let checkout = orchestrator
        .start_subscription(
            user_id,
            payload.plan_id,
            payload.trial,
            payload.payer_token.as_deref(),
            Utc::now(),
        )
        .await?;
    Ok(Json(checkout))
}

pub async fn cancel_subscription(
    Extension(service): Extension<SubscriptionService>,
    Path(user_id): Path<i64>,
) -> AppResult<Json<Subscription>> {
    let subscription = service.cancel_subscription(user_id, Utc::now()).await?;
    Ok(Json(subscription))
}

pub async fn reactivate_subscription(
    Extension(service): Extension<SubscriptionService>,
    Path(user_id): Path<i64>,
) -> AppResult<Json<Subscription>> {
    let subscription = service.reactivate_subscription(user_id, Utc::now()).await?;
    Ok(Json(subscription))
}

pub async fn upgrade_price(
    Extension(service): Extension<SubscriptionService>,
    Path(user_id): Path<i64>,
    Query(query): Query<UpgradePriceQuery>,
) -> AppResult<Json<UpgradeQuote>> {
    let quote = service
        .calculate_upgrade_price(user_id, query.plan_id, Utc::now())
        .await?;
    Ok(Json(quote))
}

pub async fn upgrade_subscription(
    Extension(orchestrator): Extension<BillingOrchestrator>,
    Path(user_id): Path<i64>,
    Json(payload): Json<UpgradeSubscriptionRequest>,
) -> AppResult<Json<SubscriptionCheckout>> {
    let checkout = orchestrator
        .upgrade_subscription(
            user_id,
            payload.plan_id,
            payload.payer_token.as_deref(),
            Utc::now(),
        )
        .await?;
    Ok(Json(checkout))
}

pub async fn subscription_history(
    Extension(service): Extension<SubscriptionService>,
    Path(user_id): Path<i64>,
    Query(query): Query<HistoryQuery>,
) -> AppResult<Json<Vec<SubscriptionHistoryEntry>>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_PAGE)
        .clamp(1, MAX_HISTORY_PAGE);
    let entries = service.history(user_id, limit).await?;
    Ok(Json(entries))
}

pub async fn list_plans(
    Extension(service): Extension<SubscriptionService>,
) -> AppResult<Json<Vec<SubscriptionPlan>>> {
    Ok(Json(service.plan_catalog().await?))
}
