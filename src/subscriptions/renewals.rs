use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::time;

use crate::billing::{BillingOrchestrator, RenewalOutcome};
use crate::config;
use crate::error::BillingResult;

use super::service::SubscriptionService;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RenewalTickSummary {
    pub renewed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub expired: usize,
}

impl RenewalTickSummary {
    fn is_quiet(&self) -> bool {
        self.renewed == 0 && self.failed == 0 && self.skipped == 0 && self.expired == 0
    }
}

/// Background loop that renews due subscriptions and expires the ones
/// that ran out of grace. Interval and batch size come from the
/// environment.
pub fn spawn(pool: PgPool, orchestrator: BillingOrchestrator) {
    tokio::spawn(async move {
        let service = SubscriptionService::new(pool);
        let mut ticker = time::interval(Duration::from_secs(
            *config::BILLING_RENEWAL_SCAN_INTERVAL_SECS,
        ));
        loop {
            ticker.tick().await;
            match process_tick(
                &service,
                &orchestrator,
                Utc::now(),
                *config::BILLING_RENEWAL_BATCH_SIZE,
            )
            .await
            {
                Ok(summary) if summary.is_quiet() => {}
                Ok(summary) => {
                    tracing::info!(
                        renewed = summary.renewed,
                        failed = summary.failed,
                        skipped = summary.skipped,
                        expired = summary.expired,
                        "renewal tick finished"
                    );
                }
                Err(err) => {
                    tracing::error!(?err, "renewal tick failed");
                }
            }
        }
    });
}

/// One scan over the renewal queue followed by the expiry sweep. A
/// failure on one subscription never blocks the rest of the batch.
pub async fn process_tick(
    service: &SubscriptionService,
    orchestrator: &BillingOrchestrator,
    now: DateTime<Utc>,
    batch_size: i64,
) -> BillingResult<RenewalTickSummary> {
    let mut summary = RenewalTickSummary::default();

    let candidates = service.find_subscriptions_to_renew(now, batch_size).await?;
    for candidate in candidates {
        match orchestrator.renew_subscription(candidate.id, now).await {
            Ok(RenewalOutcome::Renewed { .. }) => summary.renewed += 1,
            Ok(RenewalOutcome::Failed { reason }) => {
                summary.failed += 1;
                tracing::warn!(subscription = %candidate.id, %reason, "renewal charge failed");
            }
            Ok(RenewalOutcome::Skipped) => summary.skipped += 1,
            Err(err) => {
                summary.failed += 1;
                tracing::error!(?err, subscription = %candidate.id, "renewal errored");
            }
        }
    }

    summary.expired = service.handle_expired_subscriptions(now).await?;
    Ok(summary)
}
