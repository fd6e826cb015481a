use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One of the three buckets a user's credits live in. Debits drain them in
/// the fixed order bonus, subscription, purchased.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "credit_pool", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CreditPool {
    Bonus,
    Subscription,
    Purchased,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "ledger_entry_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryType {
    Purchase,
    Usage,
    Refund,
    Bonus,
    SubscriptionGrant,
    AdminAdjustment,
}

impl LedgerEntryType {
    /// Entry types that add credits to an account.
    pub fn grants_credits(self) -> bool {
        matches!(
            self,
            LedgerEntryType::Purchase
                | LedgerEntryType::Refund
                | LedgerEntryType::Bonus
                | LedgerEntryType::SubscriptionGrant
                | LedgerEntryType::AdminAdjustment
        )
    }
}

/// The grant-shaped subset of [`LedgerEntryType`]. Taking this at the API
/// seam keeps usage and refund entries out of the plain credit path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantKind {
    Purchase,
    Bonus,
    SubscriptionGrant,
    AdminAdjustment,
}

impl GrantKind {
    pub fn entry_type(self) -> LedgerEntryType {
        match self {
            GrantKind::Purchase => LedgerEntryType::Purchase,
            GrantKind::Bonus => LedgerEntryType::Bonus,
            GrantKind::SubscriptionGrant => LedgerEntryType::SubscriptionGrant,
            GrantKind::AdminAdjustment => LedgerEntryType::AdminAdjustment,
        }
    }
}

/// Per-user credit balances. `total_credits` always equals the sum of the
/// three pools; the table carries a CHECK for the same invariant.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CreditAccount {
    pub user_id: i64,
    pub bonus_credits: i64,
    pub subscription_credits: i64,
    pub purchased_credits: i64,
    pub total_credits: i64,
    pub version: i64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CreditAccount {
    pub fn pool_balance(&self, pool: CreditPool) -> i64 {
        match pool {
            CreditPool::Bonus => self.bonus_credits,
            CreditPool::Subscription => self.subscription_credits,
            CreditPool::Purchased => self.purchased_credits,
        }
    }
}

/// Append-only record of a single balance change. `amount` is positive for
/// credits and negative for debits; `pool` is the first pool the entry
/// touched.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub user_id: i64,
    pub entry_type: LedgerEntryType,
    pub amount: i64,
    pub pool: CreditPool,
    pub balance_before: i64,
    pub balance_after: i64,
    pub reference_type: Option<String>,
    pub reference_id: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Signed per-pool balance changes applied in one account mutation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolDeltas {
    pub bonus: i64,
    pub subscription: i64,
    pub purchased: i64,
}

impl PoolDeltas {
    pub fn credit(pool: CreditPool, amount: i64) -> Self {
        let mut deltas = Self::default();
        match pool {
            CreditPool::Bonus => deltas.bonus = amount,
            CreditPool::Subscription => deltas.subscription = amount,
            CreditPool::Purchased => deltas.purchased = amount,
        }
        deltas
    }

    pub fn total(&self) -> i64 {
        self.bonus + self.subscription + self.purchased
    }
}

#[derive(Debug, Clone)]
pub struct NewLedgerEntry<'a> {
    pub entry_type: LedgerEntryType,
    pub amount: i64,
    pub pool: CreditPool,
    pub reference_type: Option<&'a str>,
    pub reference_id: Option<&'a str>,
    pub description: Option<&'a str>,
}
