use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "subscription_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    PastDue,
    Canceled,
    Expired,
}

impl SubscriptionStatus {
    /// Whether a row in this status is the user's current subscription.
    /// `canceled` marks rows superseded by an upgrade or renewal; `expired`
    /// marks rows that lapsed by time.
    pub fn is_current(self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Trial | SubscriptionStatus::Active | SubscriptionStatus::PastDue
        )
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SubscriptionPlan {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub price_cents: i64,
    pub monthly_credit_grant: i64,
    pub sort_order: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SubscriptionPlan {
    pub fn is_free(&self) -> bool {
        self.price_cents == 0
    }
}

/// One row per subscription period. Renewals and upgrades supersede the row
/// with a fresh one instead of mutating it in place, so period boundaries
/// stay auditable.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: i64,
    pub plan_id: Uuid,
    pub status: SubscriptionStatus,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub auto_renewal: bool,
    pub renewal_attempts: i32,
    pub grace_period_ends_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub renewal_claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SubscriptionHistoryEntry {
    pub id: i64,
    pub subscription_id: Uuid,
    pub user_id: i64,
    pub action: String,
    pub old_status: Option<SubscriptionStatus>,
    pub new_status: SubscriptionStatus,
    pub plan_id: Uuid,
    pub price_cents: i64,
    pub credits_granted: i64,
    pub payment_reference: Option<String>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Price breakdown for moving to a higher tier mid-period.
#[derive(Debug, Clone, Serialize)]
pub struct UpgradeQuote {
    pub current_plan_id: Uuid,
    pub target_plan_id: Uuid,
    pub remaining_days: i64,
    pub total_period_days: i64,
    pub current_period_credit_cents: i64,
    pub prorated_amount_cents: i64,
}
