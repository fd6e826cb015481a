use chrono::{DateTime, Duration, Months, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::config;
use crate::error::{BillingError, BillingResult};
use crate::notifications::{self, NotificationEvent};

use super::models::{
    Subscription, SubscriptionHistoryEntry, SubscriptionPlan, SubscriptionStatus, UpgradeQuote,
};
use super::store::{self, NewHistoryEntry, NewSubscription};

/// Failed charges tolerated before a subscription drops to past_due.
pub(crate) const RENEWAL_ATTEMPT_CAP: i32 = 3;

/// Days a past_due subscription keeps its entitlement while charges retry.
pub(crate) const GRACE_PERIOD_DAYS: i64 = 7;

/// A renewal claim older than this is considered abandoned and may be
/// taken over by another worker.
pub(crate) const RENEWAL_CLAIM_TTL_MINUTES: i64 = 15;

const EXPIRY_SWEEP_BATCH: i64 = 100;

/// Subscription lifecycle transitions that never touch the payment gateway.
/// Charge-bearing flows live on the orchestrator.
#[derive(Clone)]
pub struct SubscriptionService {
    pool: PgPool,
}

impl SubscriptionService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn current_subscription(&self, user_id: i64) -> BillingResult<Option<Subscription>> {
        Ok(store::current_subscription(&self.pool, user_id).await?)
    }

    pub async fn subscription_with_plan(
        &self,
        user_id: i64,
    ) -> BillingResult<Option<(Subscription, SubscriptionPlan)>> {
        Ok(store::current_with_plan(&self.pool, user_id).await?)
    }

    pub async fn plan_catalog(&self) -> BillingResult<Vec<SubscriptionPlan>> {
        Ok(store::active_plans(&self.pool).await?)
    }

    pub async fn history(
        &self,
        user_id: i64,
        limit: i64,
    ) -> BillingResult<Vec<SubscriptionHistoryEntry>> {
        Ok(store::history_for_user(&self.pool, user_id, limit).await?)
    }

    /// Spending credits requires a current subscription on a paid plan.
    pub async fn assert_entitlement(
        &self,
        user_id: i64,
    ) -> BillingResult<(Subscription, SubscriptionPlan)> {
        match store::current_with_plan(&self.pool, user_id).await? {
            Some((subscription, plan)) if !plan.is_free() => Ok((subscription, plan)),
            _ => Err(BillingError::NoActiveEntitlement),
        }
    }

    /// Soft cancel: the subscription keeps its entitlement until the paid
    /// period runs out, it just stops renewing. Calling this twice is a
    /// no-op.
    pub async fn cancel_subscription(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> BillingResult<Subscription> {
        let mut tx = self.pool.begin().await?;
        let current = store::current_subscription(&mut *tx, user_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound)?;
        if !current.auto_renewal {
            return Ok(current);
        }

        let updated = store::set_auto_renewal(&mut *tx, current.id, false, Some(now))
            .await?
            .ok_or(BillingError::ConcurrencyConflict)?;
        store::insert_history(
            &mut *tx,
            NewHistoryEntry {
                subscription_id: updated.id,
                user_id,
                action: "canceled",
                old_status: Some(current.status),
                new_status: updated.status,
                plan_id: updated.plan_id,
                price_cents: 0,
                credits_granted: 0,
                payment_reference: None,
                reason: None,
            },
        )
        .await?;
        tx.commit().await?;

        tracing::info!(%user_id, subscription = %updated.id, "subscription cancellation scheduled");
        Ok(updated)
    }

    /// Undoes a pending cancellation while the paid period is still running.
    pub async fn reactivate_subscription(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> BillingResult<Subscription> {
        let mut tx = self.pool.begin().await?;
        let current = store::current_subscription(&mut *tx, user_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound)?;
        if current.auto_renewal {
            return Ok(current);
        }
        if current.expires_at <= now {
            return Err(BillingError::InvalidPlanTransition(
                "subscription period already ended".to_string(),
            ));
        }

        let updated = store::set_auto_renewal(&mut *tx, current.id, true, None)
            .await?
            .ok_or(BillingError::ConcurrencyConflict)?;
        store::insert_history(
            &mut *tx,
            NewHistoryEntry {
                subscription_id: updated.id,
                user_id,
                action: "reactivated",
                old_status: Some(current.status),
                new_status: updated.status,
                plan_id: updated.plan_id,
                price_cents: 0,
                credits_granted: 0,
                payment_reference: None,
                reason: None,
            },
        )
        .await?;
        tx.commit().await?;

        tracing::info!(%user_id, subscription = %updated.id, "subscription reactivated");
        Ok(updated)
    }

    pub async fn calculate_upgrade_price(
        &self,
        user_id: i64,
        target_plan_id: Uuid,
        now: DateTime<Utc>,
    ) -> BillingResult<UpgradeQuote> {
        let (current, current_plan) = store::current_with_plan(&self.pool, user_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound)?;
        let target = store::plan_by_id(&self.pool, target_plan_id)
            .await?
            .filter(|plan| plan.is_active)
            .ok_or(BillingError::PlanNotFound)?;
        upgrade_quote_for(&current, &current_plan, &target, now)
    }

    /// Due paid subscriptions plus past_due rows inside their grace period
    /// whose last charge attempt is old enough to retry.
    pub async fn find_subscriptions_to_renew(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>> {
        let due_reclaim_before = now - Duration::minutes(RENEWAL_CLAIM_TTL_MINUTES);
        let past_due_retry_before = now - Duration::hours(*config::BILLING_GRACE_RETRY_HOURS);
        Ok(store::renewal_candidates(
            &self.pool,
            now,
            due_reclaim_before,
            past_due_retry_before,
            limit,
        )
        .await?)
    }

    /// Flips lapsed rows to expired and parks each affected user on the
    /// free tier in the same transaction, so nobody is left without a
    /// current subscription.
    pub async fn handle_expired_subscriptions(&self, now: DateTime<Utc>) -> BillingResult<usize> {
        let candidates = store::expiry_candidates(&self.pool, now, EXPIRY_SWEEP_BATCH).await?;
        let mut expired = 0;
        for candidate in candidates {
            match self.expire_one(&candidate, now).await {
                Ok(true) => expired += 1,
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(?err, subscription = %candidate.id, "failed to expire subscription");
                }
            }
        }
        Ok(expired)
    }

    async fn expire_one(&self, candidate: &Subscription, now: DateTime<Utc>) -> BillingResult<bool> {
        let mut tx = self.pool.begin().await?;
        let Some(expired) =
            store::supersede(&mut *tx, candidate.id, SubscriptionStatus::Expired).await?
        else {
            // Renewed or expired by someone else since the scan.
            return Ok(false);
        };
        store::insert_history(
            &mut *tx,
            NewHistoryEntry {
                subscription_id: expired.id,
                user_id: expired.user_id,
                action: "expired",
                old_status: Some(candidate.status),
                new_status: SubscriptionStatus::Expired,
                plan_id: expired.plan_id,
                price_cents: 0,
                credits_granted: 0,
                payment_reference: None,
                reason: None,
            },
        )
        .await?;

        let free = store::free_plan(&mut *tx)
            .await?
            .ok_or(BillingError::PlanNotFound)?;
        let replacement = store::insert_subscription(
            &mut *tx,
            NewSubscription {
                user_id: expired.user_id,
                plan_id: free.id,
                status: SubscriptionStatus::Active,
                started_at: now,
                expires_at: next_period_end(now),
                auto_renewal: false,
            },
        )
        .await?;
        store::insert_history(
            &mut *tx,
            NewHistoryEntry {
                subscription_id: replacement.id,
                user_id: replacement.user_id,
                action: "downgraded_to_free",
                old_status: Some(SubscriptionStatus::Expired),
                new_status: SubscriptionStatus::Active,
                plan_id: free.id,
                price_cents: 0,
                credits_granted: 0,
                payment_reference: None,
                reason: None,
            },
        )
        .await?;

        let lapsed_plan = store::plan_by_id(&mut *tx, expired.plan_id).await?;
        notifications::enqueue(
            &mut *tx,
            expired.user_id,
            &NotificationEvent::SubscriptionExpired {
                plan_code: lapsed_plan.map(|plan| plan.code).unwrap_or_default(),
            },
        )
        .await?;
        tx.commit().await?;

        tracing::info!(
            user_id = expired.user_id,
            subscription = %expired.id,
            "subscription expired, user moved to the free tier"
        );
        Ok(true)
    }
}

/// Validates the transition and prices the move to a higher tier. The
/// unused share of the current period is credited against the target
/// plan's price, floored at zero.
pub(crate) fn upgrade_quote_for(
    current: &Subscription,
    current_plan: &SubscriptionPlan,
    target: &SubscriptionPlan,
    now: DateTime<Utc>,
) -> BillingResult<UpgradeQuote> {
    if current.status != SubscriptionStatus::Active {
        return Err(BillingError::InvalidPlanTransition(
            "upgrades require an active subscription".to_string(),
        ));
    }
    if target.id == current_plan.id {
        return Err(BillingError::InvalidPlanTransition(
            "already subscribed to this plan".to_string(),
        ));
    }
    if target.sort_order <= current_plan.sort_order {
        return Err(BillingError::InvalidPlanTransition(
            "target plan is not a higher tier".to_string(),
        ));
    }

    let total_period_days = (current.expires_at - current.started_at).num_days().max(1);
    let remaining_days = (current.expires_at - now)
        .num_days()
        .clamp(0, total_period_days);
    let credit = rounded_div(
        current_plan.price_cents * remaining_days,
        total_period_days,
    );
    let prorated = (target.price_cents - credit).max(0);

    Ok(UpgradeQuote {
        current_plan_id: current_plan.id,
        target_plan_id: target.id,
        remaining_days,
        total_period_days,
        current_period_credit_cents: credit,
        prorated_amount_cents: prorated,
    })
}

/// One billing period from `start`, clamped to month ends the way chrono
/// clamps (Jan 31 + 1 month = Feb 28).
pub(crate) fn next_period_end(start: DateTime<Utc>) -> DateTime<Utc> {
    start.checked_add_months(Months::new(1)).unwrap_or(start)
}

pub(crate) fn grace_period_end(now: DateTime<Utc>) -> DateTime<Utc> {
    now + Duration::days(GRACE_PERIOD_DAYS)
}

fn rounded_div(numerator: i64, denominator: i64) -> i64 {
    (numerator + denominator / 2) / denominator
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn plan(price_cents: i64, sort_order: i32) -> SubscriptionPlan {
        SubscriptionPlan {
            id: Uuid::new_v4(),
            code: "plan".to_string(),
            name: "Plan".to_string(),
            price_cents,
            monthly_credit_grant: 0,
            sort_order,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn subscription(
        status: SubscriptionStatus,
        started_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Subscription {
        Subscription {
            id: Uuid::new_v4(),
            user_id: 1,
            plan_id: Uuid::new_v4(),
            status,
            started_at,
            expires_at,
            auto_renewal: true,
            renewal_attempts: 0,
            grace_period_ends_at: None,
            canceled_at: None,
            renewal_claimed_at: None,
            created_at: started_at,
            updated_at: started_at,
        }
    }

    #[test]
    fn upgrade_price_credits_unused_period() {
        let started = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let expires = Utc.with_ymd_and_hms(2026, 3, 31, 0, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 21, 0, 0, 0).unwrap();
        let current = subscription(SubscriptionStatus::Active, started, expires);
        let current_plan = plan(10_000, 10);
        let target = plan(20_000, 20);

        let quote = upgrade_quote_for(&current, &current_plan, &target, now).unwrap();
        assert_eq!(quote.remaining_days, 10);
        assert_eq!(quote.total_period_days, 30);
        assert_eq!(quote.current_period_credit_cents, 3_333);
        assert_eq!(quote.prorated_amount_cents, 16_667);
    }

    #[test]
    fn upgrade_price_floors_at_zero() {
        let started = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let expires = Utc.with_ymd_and_hms(2026, 3, 31, 0, 0, 0).unwrap();
        let now = started;
        let current = subscription(SubscriptionStatus::Active, started, expires);
        // Cheap upgrade against a nearly full period credit.
        let current_plan = plan(10_000, 10);
        let target = plan(9_999, 20);

        let quote = upgrade_quote_for(&current, &current_plan, &target, now).unwrap();
        assert_eq!(quote.current_period_credit_cents, 10_000);
        assert_eq!(quote.prorated_amount_cents, 0);
    }

    #[test]
    fn expired_period_earns_no_credit() {
        let started = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let expires = Utc.with_ymd_and_hms(2026, 3, 31, 0, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 4, 10, 0, 0, 0).unwrap();
        let current = subscription(SubscriptionStatus::Active, started, expires);

        let quote = upgrade_quote_for(&current, &plan(10_000, 10), &plan(20_000, 20), now).unwrap();
        assert_eq!(quote.remaining_days, 0);
        assert_eq!(quote.prorated_amount_cents, 20_000);
    }

    #[test]
    fn upgrades_require_active_status() {
        let started = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let expires = Utc.with_ymd_and_hms(2026, 3, 31, 0, 0, 0).unwrap();
        let current = subscription(SubscriptionStatus::PastDue, started, expires);

        let result = upgrade_quote_for(&current, &plan(10_000, 10), &plan(20_000, 20), started);
        assert!(matches!(
            result,
            Err(BillingError::InvalidPlanTransition(_))
        ));
    }

    #[test]
    fn upgrades_reject_same_plan_and_lower_tiers() {
        let started = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let expires = Utc.with_ymd_and_hms(2026, 3, 31, 0, 0, 0).unwrap();
        let current = subscription(SubscriptionStatus::Active, started, expires);
        let current_plan = plan(10_000, 10);

        let same = upgrade_quote_for(&current, &current_plan, &current_plan.clone(), started);
        assert!(matches!(same, Err(BillingError::InvalidPlanTransition(_))));

        let lower = upgrade_quote_for(&current, &current_plan, &plan(5_000, 5), started);
        assert!(matches!(lower, Err(BillingError::InvalidPlanTransition(_))));
    }

    #[test]
    fn period_end_clamps_to_month_end() {
        let jan_31 = Utc.with_ymd_and_hms(2026, 1, 31, 12, 0, 0).unwrap();
        let end = next_period_end(jan_31);
        assert_eq!(end, Utc.with_ymd_and_hms(2026, 2, 28, 12, 0, 0).unwrap());

        let mid_month = Utc.with_ymd_and_hms(2026, 4, 15, 9, 30, 0).unwrap();
        assert_eq!(
            next_period_end(mid_month),
            Utc.with_ymd_and_hms(2026, 5, 15, 9, 30, 0).unwrap()
        );
    }
}
