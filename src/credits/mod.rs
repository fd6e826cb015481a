pub mod api;
pub mod manager;
pub mod models;
pub mod store;

pub use manager::{CreditManager, DebitOutcome};
pub use models::{
    CreditAccount, CreditPool, GrantKind, LedgerEntry, LedgerEntryType, NewLedgerEntry, PoolDeltas,
};
