use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, Executor, Postgres, Row};
use uuid::Uuid;

use super::models::{
    Subscription, SubscriptionHistoryEntry, SubscriptionPlan, SubscriptionStatus,
};

#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub user_id: i64,
    pub plan_id: Uuid,
    pub status: SubscriptionStatus,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub auto_renewal: bool,
}

#[derive(Debug, Clone)]
pub struct NewHistoryEntry<'a> {
    pub subscription_id: Uuid,
    pub user_id: i64,
    pub action: &'a str,
    pub old_status: Option<SubscriptionStatus>,
    pub new_status: SubscriptionStatus,
    pub plan_id: Uuid,
    pub price_cents: i64,
    pub credits_granted: i64,
    pub payment_reference: Option<&'a str>,
    pub reason: Option<&'a str>,
}

/// The partial unique index on current rows guarantees at most one match.
pub async fn current_subscription<'c, E>(
    executor: E,
    user_id: i64,
) -> Result<Option<Subscription>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, Subscription>(
        r#"
        SELECT * FROM subscriptions
        WHERE user_id = $1
          AND status IN ('trial', 'active', 'past_due')
        "#,
    )
    .bind(user_id)
    .fetch_optional(executor)
    .await
}

pub async fn current_with_plan<'c, E>(
    executor: E,
    user_id: i64,
) -> Result<Option<(Subscription, SubscriptionPlan)>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(
        r#"
        SELECT
            s.*,
            p.id AS plan_row_id,
            p.code,
            p.name,
            p.price_cents,
            p.monthly_credit_grant,
            p.sort_order,
            p.is_active,
            p.created_at AS plan_created_at,
            p.updated_at AS plan_updated_at
        FROM subscriptions s
        JOIN subscription_plans p ON p.id = s.plan_id
        WHERE s.user_id = $1
          AND s.status IN ('trial', 'active', 'past_due')
        "#,
    )
    .bind(user_id)
    .fetch_optional(executor)
    .await?;

    Ok(row.map(|row| map_subscription_with_plan(&row)))
}

pub async fn subscription_with_plan_by_id<'c, E>(
    executor: E,
    subscription_id: Uuid,
) -> Result<Option<(Subscription, SubscriptionPlan)>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(
        r#"
        SELECT
            s.*,
            p.id AS plan_row_id,
            p.code,
            p.name,
            p.price_cents,
            p.monthly_credit_grant,
            p.sort_order,
            p.is_active,
            p.created_at AS plan_created_at,
            p.updated_at AS plan_updated_at
        FROM subscriptions s
        JOIN subscription_plans p ON p.id = s.plan_id
        WHERE s.id = $1
        "#,
    )
    .bind(subscription_id)
    .fetch_optional(executor)
    .await?;

    Ok(row.map(|row| map_subscription_with_plan(&row)))
}

pub async fn plan_by_id<'c, E>(
    executor: E,
    plan_id: Uuid,
) -> Result<Option<SubscriptionPlan>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, SubscriptionPlan>("SELECT * FROM subscription_plans WHERE id = $1")
        .bind(plan_id)
        .fetch_optional(executor)
        .await
}

pub async fn plan_by_code<'c, E>(
    executor: E,
    code: &str,
) -> Result<Option<SubscriptionPlan>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, SubscriptionPlan>("SELECT * FROM subscription_plans WHERE code = $1")
        .bind(code)
        .fetch_optional(executor)
        .await
}

pub async fn active_plans<'c, E>(executor: E) -> Result<Vec<SubscriptionPlan>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, SubscriptionPlan>(
        "SELECT * FROM subscription_plans WHERE is_active = TRUE ORDER BY sort_order ASC",
    )
    .fetch_all(executor)
    .await
}

/// The tier users land on when a paid subscription lapses.
pub async fn free_plan<'c, E>(executor: E) -> Result<Option<SubscriptionPlan>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, SubscriptionPlan>(
        r#"
        SELECT * FROM subscription_plans
        WHERE is_active = TRUE AND price_cents = 0
        ORDER BY sort_order ASC
        LIMIT 1
        "#,
    )
    .fetch_optional(executor)
    .await
}

pub async fn insert_subscription<'c, E>(
    executor: E,
    input: NewSubscription,
) -> Result<Subscription, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, Subscription>(
        r#"
        INSERT INTO subscriptions (
            id, user_id, plan_id, status, started_at, expires_at, auto_renewal
        ) VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(input.user_id)
    .bind(input.plan_id)
    .bind(input.status)
    .bind(input.started_at)
    .bind(input.expires_at)
    .bind(input.auto_renewal)
    .fetch_one(executor)
    .await
}

/// Moves a current row into a terminal status. Returns `None` when the row
/// was already superseded by someone else.
pub async fn supersede<'c, E>(
    executor: E,
    subscription_id: Uuid,
    new_status: SubscriptionStatus,
) -> Result<Option<Subscription>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, Subscription>(
        r#"
        UPDATE subscriptions
        SET status = $2, updated_at = NOW()
        WHERE id = $1 AND status IN ('trial', 'active', 'past_due')
        RETURNING *
        "#,
    )
    .bind(subscription_id)
    .bind(new_status)
    .fetch_optional(executor)
    .await
}

pub async fn set_auto_renewal<'c, E>(
    executor: E,
    subscription_id: Uuid,
    enabled: bool,
    canceled_at: Option<DateTime<Utc>>,
) -> Result<Option<Subscription>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, Subscription>(
        r#"
        UPDATE subscriptions
        SET auto_renewal = $2, canceled_at = $3, updated_at = NOW()
        WHERE id = $1 AND status IN ('trial', 'active', 'past_due')
        RETURNING *
        "#,
    )
    .bind(subscription_id)
    .bind(enabled)
    .bind(canceled_at)
    .fetch_optional(executor)
    .await
}

pub async fn record_renewal_attempt<'c, E>(
    executor: E,
    subscription_id: Uuid,
) -> Result<Option<Subscription>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, Subscription>(
        r#"
        UPDATE subscriptions
        SET renewal_attempts = renewal_attempts + 1, updated_at = NOW()
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(subscription_id)
    .fetch_optional(executor)
    .await
}

pub async fn mark_past_due<'c, E>(
    executor: E,
    subscription_id: Uuid,
    grace_period_ends_at: DateTime<Utc>,
) -> Result<Option<Subscription>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, Subscription>(
        r#"
        UPDATE subscriptions
        SET status = 'past_due', grace_period_ends_at = $2, updated_at = NOW()
        WHERE id = $1 AND status IN ('trial', 'active')
        RETURNING *
        "#,
    )
    .bind(subscription_id)
    .bind(grace_period_ends_at)
    .fetch_optional(executor)
    .await
}

/// Stamps the claim marker so concurrent workers skip the row. The stamp
/// doubles as the last-attempt time used to space grace period retries.
pub async fn claim_for_renewal<'c, E>(
    executor: E,
    subscription_id: Uuid,
    now: DateTime<Utc>,
    reclaim_before: DateTime<Utc>,
) -> Result<bool, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(
        r#"
        UPDATE subscriptions
        SET renewal_claimed_at = $2, updated_at = NOW()
        WHERE id = $1
          AND (renewal_claimed_at IS NULL OR renewal_claimed_at < $3)
        RETURNING id
        "#,
    )
    .bind(subscription_id)
    .bind(now)
    .bind(reclaim_before)
    .fetch_optional(executor)
    .await?;

    Ok(row.is_some())
}

pub async fn renewal_candidates<'c, E>(
    executor: E,
    now: DateTime<Utc>,
    due_reclaim_before: DateTime<Utc>,
    past_due_retry_before: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<Subscription>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, Subscription>(
        r#"
        SELECT s.* FROM subscriptions s
        WHERE s.auto_renewal
          AND (
                (s.status IN ('trial', 'active')
                    AND s.expires_at <= $1
                    AND (s.renewal_claimed_at IS NULL OR s.renewal_claimed_at < $2))
             OR (s.status = 'past_due'
                    AND s.grace_period_ends_at > $1
                    AND (s.renewal_claimed_at IS NULL OR s.renewal_claimed_at < $3))
          )
        ORDER BY s.expires_at ASC
        LIMIT $4
        "#,
    )
    .bind(now)
    .bind(due_reclaim_before)
    .bind(past_due_retry_before)
    .bind(limit)
    .fetch_all(executor)
    .await
}

/// Paid rows whose entitlement has run out: grace periods that elapsed,
/// and periods that ended with renewal turned off. Free tier rows never
/// expire, they sit until the user upgrades.
pub async fn expiry_candidates<'c, E>(
    executor: E,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<Subscription>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, Subscription>(
        r#"
        SELECT s.* FROM subscriptions s
        JOIN subscription_plans p ON p.id = s.plan_id
        WHERE p.price_cents > 0
          AND (
                (s.status = 'past_due'
                    AND s.grace_period_ends_at IS NOT NULL
                    AND s.grace_period_ends_at <= $1)
             OR (s.status IN ('trial', 'active')
                    AND s.expires_at <= $1
                    AND s.auto_renewal = FALSE)
          )
        ORDER BY s.expires_at ASC
        LIMIT $2
        "#,
    )
    .bind(now)
    .bind(limit)
    .fetch_all(executor)
    .await
}

pub async fn insert_history<'c, E>(
    executor: E,
    input: NewHistoryEntry<'_>,
) -> Result<SubscriptionHistoryEntry, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, SubscriptionHistoryEntry>(
        r#"
        INSERT INTO subscription_history (
            subscription_id,
            user_id,
            action,
            old_status,
            new_status,
            plan_id,
            price_cents,
            credits_granted,
            payment_reference,
            reason
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        RETURNING *
        "#,
    )
    .bind(input.subscription_id)
    .bind(input.user_id)
    .bind(input.action)
    .bind(input.old_status)
    .bind(input.new_status)
    .bind(input.plan_id)
    .bind(input.price_cents)
    .bind(input.credits_granted)
    .bind(input.payment_reference)
    .bind(input.reason)
    .fetch_one(executor)
    .await
}

pub async fn history_for_user<'c, E>(
    executor: E,
    user_id: i64,
    limit: i64,
) -> Result<Vec<SubscriptionHistoryEntry>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, SubscriptionHistoryEntry>(
        r#"
        SELECT * FROM subscription_history
        WHERE user_id = $1
        ORDER BY id DESC
        LIMIT $2
        "#,
    )
    .bind(user_id)
    .bind(limit)
    .fetch_all(executor)
    .await
}

fn map_subscription_with_plan(row: &PgRow) -> (Subscription, SubscriptionPlan) {
    let subscription = Subscription {
        id: row.get("id"),
        user_id: row.get("user_id"),
        plan_id: row.get("plan_id"),
        status: row.get("status"),
        started_at: row.get("started_at"),
        expires_at: row.get("expires_at"),
        auto_renewal: row.get("auto_renewal"),
        renewal_attempts: row.get("renewal_attempts"),
        grace_period_ends_at: row.try_get("grace_period_ends_at").ok().flatten(),
        canceled_at: row.try_get("canceled_at").ok().flatten(),
        renewal_claimed_at: row.try_get("renewal_claimed_at").ok().flatten(),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    };
    let plan = SubscriptionPlan {
        id: row.get("plan_row_id"),
        code: row.get("code"),
        name: row.get("name"),
        price_cents: row.get("price_cents"),
        monthly_credit_grant: row.get("monthly_credit_grant"),
        sort_order: row.get("sort_order"),
        is_active: row.get("is_active"),
        created_at: row.get("plan_created_at"),
        updated_at: row.get("plan_updated_at"),
    };
    (subscription, plan)
}
