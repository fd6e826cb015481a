use blogsmith_backend::credits::{CreditManager, CreditPool, GrantKind, LedgerEntryType};
use blogsmith_backend::error::BillingError;
use blogsmith_backend::subscriptions::store::{self as subscription_store, NewSubscription};
use blogsmith_backend::subscriptions::{SubscriptionPlan, SubscriptionStatus};
use chrono::{Duration, Utc};
use sqlx::PgPool;

// key: credit-tests -> pool-order,entitlement-gate,refund-once

async fn subscribe(pool: &PgPool, user_id: i64, plan_code: &str) -> SubscriptionPlan {
    let plan = subscription_store::plan_by_code(pool, plan_code)
        .await
        .unwrap()
        .expect("seeded plan");
    let now = Utc::now();
    subscription_store::insert_subscription(
        pool,
        NewSubscription {
            user_id,
            plan_id: plan.id,
            status: SubscriptionStatus::Active,
            started_at: now,
            expires_at: now + Duration::days(30),
            auto_renewal: true,
        },
    )
    .await
    .unwrap();
    plan
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn debit_drains_pools_in_order_and_attributes_first_pool(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let manager = CreditManager::new(pool.clone());
    let user_id = 101;
    subscribe(&pool, user_id, "pro").await;

    manager
        .credit(user_id, 5, CreditPool::Bonus, GrantKind::Bonus, None, None, None)
        .await
        .unwrap();
    manager
        .credit(
            user_id,
            10,
            CreditPool::Subscription,
            GrantKind::SubscriptionGrant,
            None,
            None,
            None,
        )
        .await
        .unwrap();
    manager
        .credit(
            user_id,
            100,
            CreditPool::Purchased,
            GrantKind::Purchase,
            None,
            None,
            None,
        )
        .await
        .unwrap();

    let outcome = manager
        .debit(user_id, 12, Some("generation"), Some("post-1"), None)
        .await
        .unwrap();

    assert_eq!(outcome.account.bonus_credits, 0);
    assert_eq!(outcome.account.subscription_credits, 3);
    assert_eq!(outcome.account.purchased_credits, 100);
    assert_eq!(outcome.account.total_credits, 103);

    assert_eq!(outcome.entry.entry_type, LedgerEntryType::Usage);
    assert_eq!(outcome.entry.amount, -12);
    assert_eq!(outcome.entry.pool, CreditPool::Bonus);
    assert_eq!(outcome.entry.balance_before, 115);
    assert_eq!(outcome.entry.balance_after, 103);
    assert_eq!(outcome.entry.reference_type.as_deref(), Some("generation"));

    let ledger = manager.ledger(user_id, 10).await.unwrap();
    assert_eq!(ledger.len(), 4);
    assert_eq!(ledger[0].id, outcome.entry.id);

    let account = manager.get_or_create_account(user_id).await.unwrap();
    assert!(account.last_used_at.is_some());
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn debit_attribution_skips_empty_pools(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let manager = CreditManager::new(pool.clone());
    let user_id = 102;
    subscribe(&pool, user_id, "starter").await;

    manager
        .credit(
            user_id,
            50,
            CreditPool::Purchased,
            GrantKind::Purchase,
            None,
            None,
            None,
        )
        .await
        .unwrap();

    let outcome = manager.debit(user_id, 7, None, None, None).await.unwrap();
    assert_eq!(outcome.entry.pool, CreditPool::Purchased);
    assert_eq!(outcome.account.purchased_credits, 43);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn debit_requires_a_paid_subscription(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let manager = CreditManager::new(pool.clone());

    let no_subscription = manager.debit(103, 1, None, None, None).await;
    assert!(matches!(
        no_subscription,
        Err(BillingError::NoActiveEntitlement)
    ));

    subscribe(&pool, 104, "free").await;
    let free_tier = manager.debit(104, 1, None, None, None).await;
    assert!(matches!(free_tier, Err(BillingError::NoActiveEntitlement)));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn overdraw_reports_available_and_requested(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let manager = CreditManager::new(pool.clone());
    let user_id = 105;
    subscribe(&pool, user_id, "pro").await;

    manager
        .credit(
            user_id,
            10,
            CreditPool::Purchased,
            GrantKind::Purchase,
            None,
            None,
            None,
        )
        .await
        .unwrap();

    let result = manager.debit(user_id, 25, None, None, None).await;
    match result {
        Err(BillingError::InsufficientFunds {
            available,
            requested,
        }) => {
            assert_eq!(available, 10);
            assert_eq!(requested, 25);
        }
        other => panic!("expected insufficient funds, got {other:?}"),
    }

    // Nothing was written.
    let account = manager.get_or_create_account(user_id).await.unwrap();
    assert_eq!(account.total_credits, 10);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn concurrent_debits_never_both_succeed(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let manager = CreditManager::new(pool.clone());
    let user_id = 112;
    subscribe(&pool, user_id, "pro").await;

    manager
        .credit(
            user_id,
            100,
            CreditPool::Purchased,
            GrantKind::Purchase,
            None,
            None,
            None,
        )
        .await
        .unwrap();

    // Funds cover one of the two, whichever commits first.
    let (first, second) = tokio::join!(
        manager.debit(user_id, 60, None, None, None),
        manager.debit(user_id, 60, None, None, None),
    );
    assert_eq!(
        [&first, &second].iter().filter(|out| out.is_ok()).count(),
        1
    );
    let loser = if first.is_err() { first } else { second };
    assert!(matches!(
        loser,
        Err(BillingError::InsufficientFunds {
            available: 40,
            requested: 60,
        })
    ));

    let account = manager.get_or_create_account(user_id).await.unwrap();
    assert_eq!(account.purchased_credits, 40);
    assert_eq!(account.total_credits, 40);

    let usage_entries: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM ledger_entries WHERE user_id = $1 AND entry_type = 'usage'",
    )
    .bind(user_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(usage_entries, 1);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn refunds_restore_the_debited_pool_once(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let manager = CreditManager::new(pool.clone());
    let user_id = 106;
    subscribe(&pool, user_id, "pro").await;

    manager
        .credit(
            user_id,
            20,
            CreditPool::Subscription,
            GrantKind::SubscriptionGrant,
            None,
            None,
            None,
        )
        .await
        .unwrap();
    let usage = manager
        .debit(user_id, 5, Some("generation"), Some("post-9"), None)
        .await
        .unwrap();
    assert_eq!(usage.entry.pool, CreditPool::Subscription);

    let (account, refund) = manager
        .refund(user_id, usage.entry.id, Some("generation failed"))
        .await
        .unwrap();
    assert_eq!(account.subscription_credits, 20);
    assert_eq!(refund.entry_type, LedgerEntryType::Refund);
    assert_eq!(refund.amount, 5);
    assert_eq!(refund.pool, CreditPool::Subscription);
    assert_eq!(refund.reference_type.as_deref(), Some("ledger_entry"));
    assert_eq!(
        refund.reference_id.as_deref(),
        Some(usage.entry.id.to_string().as_str())
    );

    let again = manager.refund(user_id, usage.entry.id, None).await;
    assert!(matches!(
        again,
        Err(BillingError::AlreadyRefunded { entry_id }) if entry_id == usage.entry.id
    ));

    // Only usage entries can be refunded.
    let refund_of_refund = manager.refund(user_id, refund.id, None).await;
    assert!(matches!(
        refund_of_refund,
        Err(BillingError::NotRefundable { .. })
    ));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn refunds_reject_foreign_and_unknown_entries(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let manager = CreditManager::new(pool.clone());
    subscribe(&pool, 107, "pro").await;

    manager
        .credit(
            107,
            10,
            CreditPool::Purchased,
            GrantKind::Purchase,
            None,
            None,
            None,
        )
        .await
        .unwrap();
    let usage = manager.debit(107, 2, None, None, None).await.unwrap();

    let unknown = manager.refund(107, 999_999, None).await;
    assert!(matches!(unknown, Err(BillingError::LedgerEntryNotFound)));

    // Another user cannot see, let alone refund, the entry.
    let foreign = manager.refund(108, usage.entry.id, None).await;
    assert!(matches!(foreign, Err(BillingError::LedgerEntryNotFound)));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn threshold_crossings_land_in_the_outbox(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let manager = CreditManager::new(pool.clone());
    let user_id = 109;
    // Pro grants 200 credits a month, so the notification lines sit at 40
    // and 20 remaining.
    subscribe(&pool, user_id, "pro").await;

    manager
        .credit(
            user_id,
            200,
            CreditPool::Subscription,
            GrantKind::SubscriptionGrant,
            None,
            None,
            None,
        )
        .await
        .unwrap();

    manager.debit(user_id, 165, None, None, None).await.unwrap(); // 35 left
    manager.debit(user_id, 20, None, None, None).await.unwrap(); // 15 left
    manager.debit(user_id, 15, None, None, None).await.unwrap(); // 0 left

    let events: Vec<String> = sqlx::query_scalar(
        "SELECT event_type FROM notification_outbox WHERE user_id = $1 ORDER BY id",
    )
    .bind(user_id)
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(
        events,
        vec![
            "low_balance".to_string(),
            "low_balance".to_string(),
            "limit_exceeded".to_string(),
        ]
    );

    let payload: serde_json::Value = sqlx::query_scalar(
        "SELECT payload FROM notification_outbox WHERE user_id = $1 ORDER BY id LIMIT 1",
    )
    .bind(user_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(payload["type"], "low_balance");
    assert_eq!(payload["percent_used"], 80);
    assert_eq!(payload["remaining_credits"], 35);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn amounts_must_be_positive(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let manager = CreditManager::new(pool.clone());
    subscribe(&pool, 110, "pro").await;

    assert!(matches!(
        manager.debit(110, 0, None, None, None).await,
        Err(BillingError::InvalidAmount)
    ));
    assert!(matches!(
        manager
            .credit(110, -3, CreditPool::Bonus, GrantKind::Bonus, None, None, None)
            .await,
        Err(BillingError::InvalidAmount)
    ));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn account_creation_is_idempotent(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let manager = CreditManager::new(pool.clone());

    let first = manager.get_or_create_account(111).await.unwrap();
    let second = manager.get_or_create_account(111).await.unwrap();
    assert_eq!(first.user_id, second.user_id);
    assert_eq!(first.version, second.version);
    assert_eq!(second.total_credits, 0);
}
