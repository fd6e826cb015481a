pub mod gateway;
pub mod orchestrator;

pub use gateway::{ChargeReceipt, ChargeRequest, GatewayError, HttpPaymentGateway, PaymentGateway};
pub use orchestrator::{BillingOrchestrator, PurchaseOutcome, RenewalOutcome, SubscriptionCheckout};
