use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::{Executor, PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::credits::manager::credit_within;
use crate::credits::models::{
    CreditAccount, CreditPool, LedgerEntry, LedgerEntryType, NewLedgerEntry,
};
use crate::error::{is_unique_violation, BillingError, BillingResult};
use crate::notifications::{self, NotificationEvent};
use crate::subscriptions::models::{Subscription, SubscriptionPlan, SubscriptionStatus};
use crate::subscriptions::service::{
    grace_period_end, next_period_end, upgrade_quote_for, RENEWAL_ATTEMPT_CAP,
    RENEWAL_CLAIM_TTL_MINUTES,
};
use crate::subscriptions::store::{self as subscriptions_store, NewHistoryEntry, NewSubscription};

use super::gateway::{ChargeRequest, GatewayError, PaymentGateway};

#[derive(Debug, Serialize)]
pub struct SubscriptionCheckout {
    pub subscription: Subscription,
    pub plan: SubscriptionPlan,
    pub amount_charged_cents: i64,
    pub transaction_ref: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PurchaseOutcome {
    pub account: CreditAccount,
    pub entry: LedgerEntry,
    pub transaction_ref: String,
}

#[derive(Debug)]
pub enum RenewalOutcome {
    Renewed { subscription: Subscription },
    Failed { reason: String },
    Skipped,
}

/// Coordinates the payment gateway with local billing state. The gateway
/// is charged outside any transaction, then the result is recorded in a
/// single local transaction. A charge that succeeds but fails to record
/// is logged with its transaction reference for manual follow up.
#[derive(Clone)]
pub struct BillingOrchestrator {
    pool: PgPool,
    gateway: Arc<dyn PaymentGateway>,
}

impl BillingOrchestrator {
    pub fn new(pool: PgPool, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self { pool, gateway }
    }

    /// Charges `amount_cents` and adds `credits` to the purchased pool.
    pub async fn purchase_credits(
        &self,
        user_id: i64,
        credits: i64,
        amount_cents: i64,
        payer_token: &str,
        memo: Option<&str>,
    ) -> BillingResult<PurchaseOutcome> {
        if credits <= 0 || amount_cents <= 0 {
            return Err(BillingError::InvalidAmount);
        }
        let payer_token = payer_token.trim();
        if payer_token.is_empty() {
            return Err(GatewayError::Declined("no payment method on file".to_string()).into());
        }

        let receipt = self
            .gateway
            .charge(&ChargeRequest {
                user_id,
                amount_cents,
                payer_token: payer_token.to_string(),
                memo: memo.unwrap_or("credit purchase").to_string(),
                idempotency_key: Uuid::new_v4(),
            })
            .await?;

        let recorded = self
            .record_purchase(user_id, credits, payer_token, memo, &receipt.transaction_ref)
            .await;
        if let Err(err) = &recorded {
            tracing::error!(
                ?err,
                %user_id,
                transaction_ref = %receipt.transaction_ref,
                "charge succeeded but recording the purchase failed"
            );
        }
        recorded
    }

    async fn record_purchase(
        &self,
        user_id: i64,
        credits: i64,
        payer_token: &str,
        memo: Option<&str>,
        transaction_ref: &str,
    ) -> BillingResult<PurchaseOutcome> {
        let mut tx = self.pool.begin().await?;
        upsert_payer_token(&mut *tx, user_id, payer_token).await?;
        let (account, entry) = credit_within(
            &mut tx,
            user_id,
            NewLedgerEntry {
                entry_type: LedgerEntryType::Purchase,
                amount: credits,
                pool: CreditPool::Purchased,
                reference_type: Some("payment"),
                reference_id: Some(transaction_ref),
                description: memo,
            },
        )
        .await?;
        tx.commit().await?;

        tracing::info!(%user_id, credits, transaction_ref, "credit purchase recorded");
        Ok(PurchaseOutcome {
            account,
            entry,
            transaction_ref: transaction_ref.to_string(),
        })
    }

    /// Creates the user's first subscription. Paid plans are charged up
    /// front unless `trial` is set; free plans never renew.
    pub async fn start_subscription(
        &self,
        user_id: i64,
        plan_id: Uuid,
        trial: bool,
        payer_token: Option<&str>,
        now: DateTime<Utc>,
    ) -> BillingResult<SubscriptionCheckout> {
        let plan = subscriptions_store::plan_by_id(&self.pool, plan_id)
            .await?
            .filter(|plan| plan.is_active)
            .ok_or(BillingError::PlanNotFound)?;
        if subscriptions_store::current_subscription(&self.pool, user_id)
            .await?
            .is_some()
        {
            return Err(BillingError::InvalidPlanTransition(
                "user already has a subscription, upgrade instead".to_string(),
            ));
        }

        let mut receipt_ref = None;
        let mut charged_token = None;
        if !trial && !plan.is_free() {
            let token = self.resolve_payer_token(user_id, payer_token).await?;
            let receipt = self
                .gateway
                .charge(&ChargeRequest {
                    user_id,
                    amount_cents: plan.price_cents,
                    payer_token: token.clone(),
                    memo: format!("subscription: {}", plan.code),
                    idempotency_key: Uuid::new_v4(),
                })
                .await?;
            receipt_ref = Some(receipt.transaction_ref);
            charged_token = Some(token);
        }

        let recorded = self
            .record_start(
                user_id,
                &plan,
                trial,
                charged_token.as_deref(),
                receipt_ref.as_deref(),
                now,
            )
            .await;
        if let (Err(err), Some(transaction_ref)) = (&recorded, receipt_ref.as_deref()) {
            tracing::error!(
                ?err,
                %user_id,
                transaction_ref,
                "charge succeeded but recording the subscription failed"
            );
        }
        recorded
    }

    async fn record_start(
        &self,
        user_id: i64,
        plan: &SubscriptionPlan,
        trial: bool,
        payer_token: Option<&str>,
        transaction_ref: Option<&str>,
        now: DateTime<Utc>,
    ) -> BillingResult<SubscriptionCheckout> {
        let status = if trial && !plan.is_free() {
            SubscriptionStatus::Trial
        } else {
            SubscriptionStatus::Active
        };
        let charged_cents = if transaction_ref.is_some() {
            plan.price_cents
        } else {
            0
        };

        let mut tx = self.pool.begin().await?;
        if subscriptions_store::current_subscription(&mut *tx, user_id)
            .await?
            .is_some()
        {
            return Err(BillingError::InvalidPlanTransition(
                "user already has a subscription, upgrade instead".to_string(),
            ));
        }
        let subscription = match subscriptions_store::insert_subscription(
            &mut *tx,
            NewSubscription {
                user_id,
                plan_id: plan.id,
                status,
                started_at: now,
                expires_at: next_period_end(now),
                auto_renewal: !plan.is_free(),
            },
        )
        .await
        {
            Ok(row) => row,
            Err(err) if is_unique_violation(&err) => {
                return Err(BillingError::InvalidPlanTransition(
                    "user already has a subscription, upgrade instead".to_string(),
                ));
            }
            Err(err) => return Err(err.into()),
        };

        let granted = grant_plan_credits(&mut tx, &subscription, plan).await?;
        let action = if status == SubscriptionStatus::Trial {
            "trial_started"
        } else {
            "started"
        };
        subscriptions_store::insert_history(
            &mut *tx,
            NewHistoryEntry {
                subscription_id: subscription.id,
                user_id,
                action,
                old_status: None,
                new_status: status,
                plan_id: plan.id,
                price_cents: charged_cents,
                credits_granted: granted,
                payment_reference: transaction_ref,
                reason: None,
            },
        )
        .await?;
        if let Some(token) = payer_token {
            upsert_payer_token(&mut *tx, user_id, token).await?;
        }
        tx.commit().await?;

        tracing::info!(%user_id, plan = %plan.code, action, "subscription started");
        Ok(SubscriptionCheckout {
            subscription,
            plan: plan.clone(),
            amount_charged_cents: charged_cents,
            transaction_ref: transaction_ref.map(str::to_string),
        })
    }

    /// Moves the user to a higher tier. The old row is superseded, the new
    /// period starts now and the target plan's monthly credits are granted
    /// in full.
    pub async fn upgrade_subscription(
        &self,
        user_id: i64,
        target_plan_id: Uuid,
        payer_token: Option<&str>,
        now: DateTime<Utc>,
    ) -> BillingResult<SubscriptionCheckout> {
        let (current, current_plan) = subscriptions_store::current_with_plan(&self.pool, user_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound)?;
        let target = subscriptions_store::plan_by_id(&self.pool, target_plan_id)
            .await?
            .filter(|plan| plan.is_active)
            .ok_or(BillingError::PlanNotFound)?;
        let quote = upgrade_quote_for(&current, &current_plan, &target, now)?;

        let mut receipt_ref = None;
        let mut charged_token = None;
        if quote.prorated_amount_cents > 0 {
            let token = self.resolve_payer_token(user_id, payer_token).await?;
            let receipt = self
                .gateway
                .charge(&ChargeRequest {
                    user_id,
                    amount_cents: quote.prorated_amount_cents,
                    payer_token: token.clone(),
                    memo: format!("upgrade: {} to {}", current_plan.code, target.code),
                    idempotency_key: Uuid::new_v4(),
                })
                .await?;
            receipt_ref = Some(receipt.transaction_ref);
            charged_token = Some(token);
        }

        let recorded = self
            .record_upgrade(
                &current,
                &current_plan,
                &target,
                quote.prorated_amount_cents,
                charged_token.as_deref(),
                receipt_ref.as_deref(),
                now,
            )
            .await;
        if let (Err(err), Some(transaction_ref)) = (&recorded, receipt_ref.as_deref()) {
            tracing::error!(
                ?err,
                %user_id,
                transaction_ref,
                "charge succeeded but recording the upgrade failed"
            );
        }
        recorded
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_upgrade(
        &self,
        current: &Subscription,
        current_plan: &SubscriptionPlan,
        target: &SubscriptionPlan,
        charged_cents: i64,
        payer_token: Option<&str>,
        transaction_ref: Option<&str>,
        now: DateTime<Utc>,
    ) -> BillingResult<SubscriptionCheckout> {
        let mut tx = self.pool.begin().await?;
        if subscriptions_store::supersede(&mut *tx, current.id, SubscriptionStatus::Canceled)
            .await?
            .is_none()
        {
            return Err(BillingError::ConcurrencyConflict);
        }
        let subscription = subscriptions_store::insert_subscription(
            &mut *tx,
            NewSubscription {
                user_id: current.user_id,
                plan_id: target.id,
                status: SubscriptionStatus::Active,
                started_at: now,
                expires_at: next_period_end(now),
                auto_renewal: true,
            },
        )
        .await?;
        let granted = grant_plan_credits(&mut tx, &subscription, target).await?;
        let reason = format!("upgraded from {}", current_plan.code);
        subscriptions_store::insert_history(
            &mut *tx,
            NewHistoryEntry {
                subscription_id: subscription.id,
                user_id: current.user_id,
                action: "upgraded",
                old_status: Some(current.status),
                new_status: SubscriptionStatus::Active,
                plan_id: target.id,
                price_cents: charged_cents,
                credits_granted: granted,
                payment_reference: transaction_ref,
                reason: Some(reason.as_str()),
            },
        )
        .await?;
        if let Some(token) = payer_token {
            upsert_payer_token(&mut *tx, current.user_id, token).await?;
        }
        tx.commit().await?;

        tracing::info!(
            user_id = current.user_id,
            from = %current_plan.code,
            to = %target.code,
            charged_cents,
            "subscription upgraded"
        );
        Ok(SubscriptionCheckout {
            subscription,
            plan: target.clone(),
            amount_charged_cents: charged_cents,
            transaction_ref: transaction_ref.map(str::to_string),
        })
    }

    /// Renews one claimed subscription. `Skipped` means the row no longer
    /// needs a charge, `Failed` means the charge did not go through.
    pub async fn renew_subscription(
        &self,
        subscription_id: Uuid,
        now: DateTime<Utc>,
    ) -> BillingResult<RenewalOutcome> {
        let reclaim_before = now - Duration::minutes(RENEWAL_CLAIM_TTL_MINUTES);
        if !subscriptions_store::claim_for_renewal(&self.pool, subscription_id, now, reclaim_before)
            .await?
        {
            return Ok(RenewalOutcome::Skipped);
        }

        let Some((subscription, plan)) =
            subscriptions_store::subscription_with_plan_by_id(&self.pool, subscription_id).await?
        else {
            return Ok(RenewalOutcome::Skipped);
        };
        if !renewal_still_due(&subscription, &plan, now) {
            return Ok(RenewalOutcome::Skipped);
        }

        let Some(payer_token) = stored_payer_token(&self.pool, subscription.user_id).await? else {
            // Nothing to charge against, the row goes straight into grace.
            return self
                .record_renewal_failure(
                    &subscription,
                    &plan,
                    "no payment method on file",
                    now,
                    false,
                )
                .await;
        };

        let charge = self
            .gateway
            .charge(&ChargeRequest {
                user_id: subscription.user_id,
                amount_cents: plan.price_cents,
                payer_token,
                memo: format!("renewal: {}", plan.code),
                idempotency_key: Uuid::new_v4(),
            })
            .await;

        match charge {
            Ok(receipt) => {
                let recorded = self
                    .record_renewal(&subscription, &plan, &receipt.transaction_ref)
                    .await;
                if let Err(err) = &recorded {
                    tracing::error!(
                        ?err,
                        subscription = %subscription.id,
                        transaction_ref = %receipt.transaction_ref,
                        "charge succeeded but recording the renewal failed"
                    );
                }
                recorded
            }
            Err(err) => {
                // Declines, timeouts and outages all count as one failed
                // attempt, the variant only shapes the recorded reason.
                let reason = match err {
                    GatewayError::Declined(reason) => reason,
                    other => other.to_string(),
                };
                self.record_renewal_failure(&subscription, &plan, &reason, now, true)
                    .await
            }
        }
    }

    async fn record_renewal(
        &self,
        subscription: &Subscription,
        plan: &SubscriptionPlan,
        transaction_ref: &str,
    ) -> BillingResult<RenewalOutcome> {
        let mut tx = self.pool.begin().await?;
        if subscriptions_store::supersede(&mut *tx, subscription.id, SubscriptionStatus::Canceled)
            .await?
            .is_none()
        {
            return Err(BillingError::ConcurrencyConflict);
        }
        // The new period starts where the old one ended, so days spent in
        // grace are not lost.
        let started_at = subscription.expires_at;
        let renewed = subscriptions_store::insert_subscription(
            &mut *tx,
            NewSubscription {
                user_id: subscription.user_id,
                plan_id: plan.id,
                status: SubscriptionStatus::Active,
                started_at,
                expires_at: next_period_end(started_at),
                auto_renewal: true,
            },
        )
        .await?;
        let granted = grant_plan_credits(&mut tx, &renewed, plan).await?;
        subscriptions_store::insert_history(
            &mut *tx,
            NewHistoryEntry {
                subscription_id: renewed.id,
                user_id: renewed.user_id,
                action: "renewed",
                old_status: Some(subscription.status),
                new_status: SubscriptionStatus::Active,
                plan_id: plan.id,
                price_cents: plan.price_cents,
                credits_granted: granted,
                payment_reference: Some(transaction_ref),
                reason: None,
            },
        )
        .await?;
        notifications::enqueue(
            &mut *tx,
            renewed.user_id,
            &NotificationEvent::SubscriptionRenewed {
                plan_code: plan.code.clone(),
            },
        )
        .await?;
        tx.commit().await?;

        tracing::info!(
            user_id = renewed.user_id,
            plan = %plan.code,
            subscription = %renewed.id,
            "subscription renewed"
        );
        Ok(RenewalOutcome::Renewed {
            subscription: renewed,
        })
    }

    /// Bumps the attempt counter and demotes the row to past due once the
    /// cap is reached. A failure that a retry cannot fix demotes right away.
    async fn record_renewal_failure(
        &self,
        subscription: &Subscription,
        plan: &SubscriptionPlan,
        reason: &str,
        now: DateTime<Utc>,
        retryable: bool,
    ) -> BillingResult<RenewalOutcome> {
        let mut tx = self.pool.begin().await?;
        let Some(attempted) =
            subscriptions_store::record_renewal_attempt(&mut *tx, subscription.id).await?
        else {
            return Ok(RenewalOutcome::Skipped);
        };

        let mut new_status = attempted.status;
        let demote = matches!(
            attempted.status,
            SubscriptionStatus::Trial | SubscriptionStatus::Active
        ) && (!retryable || attempted.renewal_attempts >= RENEWAL_ATTEMPT_CAP);
        if demote {
            let Some(demoted) =
                subscriptions_store::mark_past_due(&mut *tx, subscription.id, grace_period_end(now))
                    .await?
            else {
                return Ok(RenewalOutcome::Skipped);
            };
            new_status = demoted.status;
        }

        subscriptions_store::insert_history(
            &mut *tx,
            NewHistoryEntry {
                subscription_id: subscription.id,
                user_id: subscription.user_id,
                action: "renewal_failed",
                old_status: Some(subscription.status),
                new_status,
                plan_id: plan.id,
                price_cents: plan.price_cents,
                credits_granted: 0,
                payment_reference: None,
                reason: Some(reason),
            },
        )
        .await?;
        notifications::enqueue(
            &mut *tx,
            subscription.user_id,
            &NotificationEvent::PaymentFailed {
                reason: reason.to_string(),
            },
        )
        .await?;
        tx.commit().await?;

        tracing::warn!(
            user_id = subscription.user_id,
            subscription = %subscription.id,
            attempts = attempted.renewal_attempts,
            %reason,
            past_due = demote,
            "subscription renewal failed"
        );
        Ok(RenewalOutcome::Failed {
            reason: reason.to_string(),
        })
    }

    async fn resolve_payer_token(
        &self,
        user_id: i64,
        provided: Option<&str>,
    ) -> BillingResult<String> {
        if let Some(token) = provided {
            let trimmed = token.trim();
            if !trimmed.is_empty() {
                return Ok(trimmed.to_string());
            }
        }
        match stored_payer_token(&self.pool, user_id).await? {
            Some(token) => Ok(token),
            None => Err(GatewayError::Declined("no payment method on file".to_string()).into()),
        }
    }
}

/// Grants the plan's monthly credits into the subscription pool on the
/// caller's transaction. Returns the granted amount.
async fn grant_plan_credits(
    tx: &mut Transaction<'_, Postgres>,
    subscription: &Subscription,
    plan: &SubscriptionPlan,
) -> BillingResult<i64> {
    if plan.monthly_credit_grant <= 0 {
        return Ok(0);
    }
    let reference_id = subscription.id.to_string();
    let description = format!("monthly credits ({})", plan.code);
    credit_within(
        tx,
        subscription.user_id,
        NewLedgerEntry {
            entry_type: LedgerEntryType::SubscriptionGrant,
            amount: plan.monthly_credit_grant,
            pool: CreditPool::Subscription,
            reference_type: Some("subscription"),
            reference_id: Some(reference_id.as_str()),
            description: Some(description.as_str()),
        },
    )
    .await?;
    Ok(plan.monthly_credit_grant)
}

/// Whether a claimed row still needs a renewal charge. Rows already rolled
/// into the next period, superseded rows, free rows and rows whose grace
/// ran out are all skipped.
fn renewal_still_due(
    subscription: &Subscription,
    plan: &SubscriptionPlan,
    now: DateTime<Utc>,
) -> bool {
    if !subscription.auto_renewal || plan.is_free() {
        return false;
    }
    match subscription.status {
        SubscriptionStatus::Trial | SubscriptionStatus::Active => subscription.expires_at <= now,
        SubscriptionStatus::PastDue => subscription
            .grace_period_ends_at
            .map(|ends| ends > now)
            .unwrap_or(false),
        SubscriptionStatus::Canceled | SubscriptionStatus::Expired => false,
    }
}

async fn stored_payer_token<'c, E>(executor: E, user_id: i64) -> Result<Option<String>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query("SELECT payer_token FROM payment_profiles WHERE user_id = $1")
        .bind(user_id)
        .fetch_optional(executor)
        .await?;
    Ok(row.map(|row| row.get("payer_token")))
}

async fn upsert_payer_token<'c, E>(
    executor: E,
    user_id: i64,
    payer_token: &str,
) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO payment_profiles (user_id, payer_token)
        VALUES ($1, $2)
        ON CONFLICT (user_id) DO UPDATE
        SET payer_token = EXCLUDED.payer_token, updated_at = NOW()
        "#,
    )
    .bind(user_id)
    .bind(payer_token)
    .execute(executor)
    .await?;
    Ok(())
}
