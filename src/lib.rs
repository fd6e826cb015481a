pub mod billing;
pub mod config;
pub mod credits;
pub mod error;
pub mod notifications;
pub mod routes;
pub mod subscriptions;

pub use billing::BillingOrchestrator;
pub use credits::CreditManager;
pub use error::{AppError, BillingError};
pub use subscriptions::SubscriptionService;
