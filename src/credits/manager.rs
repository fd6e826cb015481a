use sqlx::{PgPool, Postgres, Transaction};

use crate::error::{is_unique_violation, BillingError, BillingResult};
use crate::notifications::{self, NotificationEvent};
use crate::subscriptions;

use super::models::{
    CreditAccount, CreditPool, GrantKind, LedgerEntry, LedgerEntryType, NewLedgerEntry, PoolDeltas,
};
use super::store;

/// How many times a guarded account update is retried after losing a
/// version race before the conflict is surfaced to the caller.
const MAX_CONFLICT_RETRIES: usize = 3;

/// Percent-consumed lines that trigger a low balance notification, measured
/// against the plan's monthly credit grant.
const LOW_BALANCE_THRESHOLDS: [i64; 2] = [80, 90];

#[derive(Debug, Clone, serde::Serialize)]
pub struct DebitOutcome {
    pub account: CreditAccount,
    pub entry: LedgerEntry,
}

/// Credit account operations. Spending requires a current paid subscription;
/// every balance change lands in the append-only ledger.
#[derive(Clone)]
pub struct CreditManager {
    pool: PgPool,
}

impl CreditManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_or_create_account(&self, user_id: i64) -> BillingResult<CreditAccount> {
        Ok(store::get_or_create_account(&self.pool, user_id).await?)
    }

    pub async fn ledger(&self, user_id: i64, limit: i64) -> BillingResult<Vec<LedgerEntry>> {
        Ok(store::list_entries(&self.pool, user_id, limit).await?)
    }

    /// Consumes `amount` credits across the pools in their fixed order and
    /// records a single usage entry attributed to the first pool touched.
    /// Threshold notifications are queued on the same transaction.
    pub async fn debit(
        &self,
        user_id: i64,
        amount: i64,
        reference_type: Option<&str>,
        reference_id: Option<&str>,
        description: Option<&str>,
    ) -> BillingResult<DebitOutcome> {
        if amount <= 0 {
            return Err(BillingError::InvalidAmount);
        }

        let mut tx = self.pool.begin().await?;

        let entitlement = subscriptions::store::current_with_plan(&mut *tx, user_id).await?;
        let plan = match entitlement {
            Some((_, plan)) if plan.price_cents > 0 => plan,
            _ => return Err(BillingError::NoActiveEntitlement),
        };

        for attempt in 0..MAX_CONFLICT_RETRIES {
            if attempt > 0 {
                tracing::warn!(%user_id, attempt, "retrying debit after concurrent account update");
            }
            let account = store::get_or_create_account(&mut *tx, user_id).await?;
            let split =
                plan_debit(&account, amount).ok_or_else(|| BillingError::InsufficientFunds {
                    available: account.total_credits,
                    requested: amount,
                })?;
            let entry = NewLedgerEntry {
                entry_type: LedgerEntryType::Usage,
                amount: -amount,
                pool: split.first_pool,
                reference_type,
                reference_id,
                description,
            };
            match store::apply_mutation(&mut tx, &account, split.deltas, entry, true).await? {
                Some((updated, recorded)) => {
                    let events = threshold_events(
                        plan.monthly_credit_grant,
                        account.total_credits,
                        updated.total_credits,
                    );
                    for event in &events {
                        notifications::enqueue(&mut *tx, user_id, event).await?;
                    }
                    tx.commit().await?;
                    return Ok(DebitOutcome {
                        account: updated,
                        entry: recorded,
                    });
                }
                None => continue,
            }
        }

        Err(BillingError::ConcurrencyConflict)
    }

    /// Adds credits to one pool. Grant-shaped entries only; refunds go
    /// through [`CreditManager::refund`].
    pub async fn credit(
        &self,
        user_id: i64,
        amount: i64,
        pool: CreditPool,
        kind: GrantKind,
        reference_type: Option<&str>,
        reference_id: Option<&str>,
        description: Option<&str>,
    ) -> BillingResult<(CreditAccount, LedgerEntry)> {
        if amount <= 0 {
            return Err(BillingError::InvalidAmount);
        }

        let mut tx = self.pool.begin().await?;
        let entry = NewLedgerEntry {
            entry_type: kind.entry_type(),
            amount,
            pool,
            reference_type,
            reference_id,
            description,
        };
        let outcome = credit_within(&mut tx, user_id, entry).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Returns the full amount of a usage entry to the pool it was drawn
    /// from. At most one refund per entry; the partial unique index on the
    /// ledger backstops the idempotency probe under races.
    pub async fn refund(
        &self,
        user_id: i64,
        entry_id: i64,
        reason: Option<&str>,
    ) -> BillingResult<(CreditAccount, LedgerEntry)> {
        let mut tx = self.pool.begin().await?;

        let original = store::get_entry(&mut *tx, entry_id)
            .await?
            .ok_or(BillingError::LedgerEntryNotFound)?;
        if original.user_id != user_id {
            return Err(BillingError::LedgerEntryNotFound);
        }
        if original.entry_type != LedgerEntryType::Usage {
            return Err(BillingError::NotRefundable { entry_id });
        }
        if store::find_refund_of(&mut *tx, entry_id).await?.is_some() {
            return Err(BillingError::AlreadyRefunded { entry_id });
        }

        let reference_id = entry_id.to_string();
        let entry = NewLedgerEntry {
            entry_type: LedgerEntryType::Refund,
            amount: original.amount.abs(),
            pool: original.pool,
            reference_type: Some(store::REFUND_REFERENCE_TYPE),
            reference_id: Some(reference_id.as_str()),
            description: reason,
        };

        match credit_within(&mut tx, user_id, entry).await {
            Ok(outcome) => {
                tx.commit().await?;
                Ok(outcome)
            }
            Err(BillingError::Database(err)) if is_unique_violation(&err) => {
                Err(BillingError::AlreadyRefunded { entry_id })
            }
            Err(err) => Err(err),
        }
    }
}

/// Credits one pool on the caller's transaction, retrying the version guard
/// a bounded number of times. Shared with the orchestrator so charge-backed
/// grants land in the same transaction as their subscription writes.
pub(crate) async fn credit_within(
    tx: &mut Transaction<'_, Postgres>,
    user_id: i64,
    entry: NewLedgerEntry<'_>,
) -> BillingResult<(CreditAccount, LedgerEntry)> {
    let deltas = PoolDeltas::credit(entry.pool, entry.amount);
    for _ in 0..MAX_CONFLICT_RETRIES {
        let account = store::get_or_create_account(&mut *tx, user_id).await?;
        match store::apply_mutation(tx, &account, deltas, entry.clone(), false).await? {
            Some(outcome) => return Ok(outcome),
            None => continue,
        }
    }
    Err(BillingError::ConcurrencyConflict)
}

struct DebitSplit {
    deltas: PoolDeltas,
    first_pool: CreditPool,
}

/// Plans a debit against the fixed pool order bonus, subscription,
/// purchased. Returns `None` when the account cannot cover the amount.
/// Empty pools are skipped, so the first pool is the first one that
/// actually loses credits.
fn plan_debit(account: &CreditAccount, amount: i64) -> Option<DebitSplit> {
    if amount <= 0 || account.total_credits < amount {
        return None;
    }

    let mut remaining = amount;
    let mut deltas = PoolDeltas::default();
    let mut first_pool = None;
    let order = [
        (CreditPool::Bonus, account.bonus_credits),
        (CreditPool::Subscription, account.subscription_credits),
        (CreditPool::Purchased, account.purchased_credits),
    ];
    for (pool, available) in order {
        if remaining == 0 {
            break;
        }
        if available <= 0 {
            continue;
        }
        let take = available.min(remaining);
        match pool {
            CreditPool::Bonus => deltas.bonus = -take,
            CreditPool::Subscription => deltas.subscription = -take,
            CreditPool::Purchased => deltas.purchased = -take,
        }
        if first_pool.is_none() {
            first_pool = Some(pool);
        }
        remaining -= take;
    }

    first_pool.map(|pool| DebitSplit {
        deltas,
        first_pool: pool,
    })
}

/// Notifications owed after a successful debit. Crossing a threshold means
/// the balance was above the line before and at or under it afterwards;
/// plans without a monthly grant never notify.
fn threshold_events(
    monthly_grant: i64,
    total_before: i64,
    total_after: i64,
) -> Vec<NotificationEvent> {
    if monthly_grant <= 0 {
        return Vec::new();
    }

    let mut events = Vec::new();
    if total_after > 0 {
        for percent_used in LOW_BALANCE_THRESHOLDS {
            let remaining_line = monthly_grant * (100 - percent_used) / 100;
            if total_before > remaining_line && total_after <= remaining_line {
                events.push(NotificationEvent::LowBalance {
                    remaining_credits: total_after,
                    percent_used,
                });
            }
        }
    } else if total_before > 0 {
        events.push(NotificationEvent::LimitExceeded);
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn account(bonus: i64, subscription: i64, purchased: i64) -> CreditAccount {
        CreditAccount {
            user_id: 1,
            bonus_credits: bonus,
            subscription_credits: subscription,
            purchased_credits: purchased,
            total_credits: bonus + subscription + purchased,
            version: 0,
            last_used_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn debit_drains_pools_in_order() {
        let split = plan_debit(&account(5, 10, 100), 12).unwrap();
        assert_eq!(split.first_pool, CreditPool::Bonus);
        assert_eq!(split.deltas.bonus, -5);
        assert_eq!(split.deltas.subscription, -7);
        assert_eq!(split.deltas.purchased, 0);
        assert_eq!(split.deltas.total(), -12);
    }

    #[test]
    fn debit_skips_empty_pools_for_attribution() {
        let split = plan_debit(&account(0, 10, 100), 3).unwrap();
        assert_eq!(split.first_pool, CreditPool::Subscription);
        assert_eq!(split.deltas.bonus, 0);
        assert_eq!(split.deltas.subscription, -3);
    }

    #[test]
    fn debit_can_drain_the_whole_account() {
        let split = plan_debit(&account(5, 10, 100), 115).unwrap();
        assert_eq!(split.deltas.total(), -115);
        assert_eq!(split.deltas.purchased, -100);
    }

    #[test]
    fn debit_rejects_overdraw_and_non_positive_amounts() {
        assert!(plan_debit(&account(5, 10, 100), 116).is_none());
        assert!(plan_debit(&account(0, 0, 0), 1).is_none());
        assert!(plan_debit(&account(5, 10, 100), 0).is_none());
    }

    #[test]
    fn threshold_crossing_emits_low_balance() {
        let events = threshold_events(100, 25, 20);
        assert_eq!(events.len(), 1);
        match &events[0] {
            NotificationEvent::LowBalance {
                remaining_credits,
                percent_used,
            } => {
                assert_eq!(*remaining_credits, 20);
                assert_eq!(*percent_used, 80);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn one_debit_can_cross_both_thresholds() {
        let events = threshold_events(100, 25, 5);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn exhaustion_reports_limit_exceeded_only() {
        let events = threshold_events(100, 15, 0);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], NotificationEvent::LimitExceeded));
    }

    #[test]
    fn thresholds_do_not_refire_below_the_line() {
        assert!(threshold_events(100, 20, 15).is_empty());
        assert!(threshold_events(100, 0, 0).is_empty());
    }

    #[test]
    fn zero_grant_plans_never_notify() {
        assert!(threshold_events(0, 100, 0).is_empty());
    }
}
