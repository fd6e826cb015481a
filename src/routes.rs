use axum::{
    routing::{get, post},
    Router,
};

use crate::{credits, subscriptions};

pub fn api_routes() -> Router {
    Router::new()
        .route("/api/plans", get(subscriptions::api::list_plans))
        .route(
            "/api/users/:user_id/credits",
            get(credits::api::get_balance),
        )
        .route(
            "/api/users/:user_id/credits/ledger",
            get(credits::api::list_ledger),
        )
        .route(
            "/api/users/:user_id/credits/debit",
            post(credits::api::debit_credits),
        )
        .route(
            "/api/users/:user_id/credits/grant",
            post(credits::api::grant_credits),
        )
        .route(
            "/api/users/:user_id/credits/refund",
            post(credits::api::refund_entry),
        )
        .route(
            "/api/users/:user_id/credits/purchase",
            post(credits::api::purchase_credits),
        )
        .route(
            "/api/users/:user_id/subscription",
            get(subscriptions::api::get_subscription).post(subscriptions::api::start_subscription),
        )
        .route(
            "/api/users/:user_id/subscription/cancel",
            post(subscriptions::api::cancel_subscription),
        )
        .route(
            "/api/users/:user_id/subscription/reactivate",
            post(subscriptions::api::reactivate_subscription),
        )
        .route(
            "/api/users/:user_id/subscription/upgrade-price",
            get(subscriptions::api::upgrade_price),
        )
        .route(
            "/api/users/:user_id/subscription/upgrade",
            post(subscriptions::api::upgrade_subscription),
        )
        .route(
            "/api/users/:user_id/subscription/history",
            get(subscriptions::api::subscription_history),
        )
}
