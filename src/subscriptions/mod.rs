pub mod api;
pub mod models;
pub mod renewals;
pub mod service;
pub mod store;

pub use models::{
    Subscription, SubscriptionHistoryEntry, SubscriptionPlan, SubscriptionStatus, UpgradeQuote,
};
pub use renewals::RenewalTickSummary;
pub use service::SubscriptionService;
