use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Executor, PgPool, Postgres};
use tokio::time;

use crate::config;

pub const MAX_DELIVERY_ATTEMPTS: i32 = 5;

const DISPATCH_BATCH: i64 = 20;

/// Billing events users get notified about. Stored as the outbox payload,
/// so variants must stay stable across deploys.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationEvent {
    LowBalance {
        remaining_credits: i64,
        percent_used: i64,
    },
    LimitExceeded,
    SubscriptionRenewed {
        plan_code: String,
    },
    PaymentFailed {
        reason: String,
    },
    SubscriptionExpired {
        plan_code: String,
    },
}

impl NotificationEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            NotificationEvent::LowBalance { .. } => "low_balance",
            NotificationEvent::LimitExceeded => "limit_exceeded",
            NotificationEvent::SubscriptionRenewed { .. } => "subscription_renewed",
            NotificationEvent::PaymentFailed { .. } => "payment_failed",
            NotificationEvent::SubscriptionExpired { .. } => "subscription_expired",
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueuedNotification {
    pub id: i64,
    pub user_id: i64,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
}

/// Queues an event inside the caller's transaction so the notification
/// commits or rolls back together with the billing change it describes.
pub async fn enqueue<'c, E>(
    executor: E,
    user_id: i64,
    event: &NotificationEvent,
) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let payload = serde_json::to_value(event).unwrap_or_else(|_| serde_json::json!({}));
    sqlx::query(
        "INSERT INTO notification_outbox (user_id, event_type, payload) VALUES ($1, $2, $3)",
    )
    .bind(user_id)
    .bind(event.kind())
    .bind(payload)
    .execute(executor)
    .await?;
    Ok(())
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: &QueuedNotification) -> anyhow::Result<()>;
}

/// Default sink until a real email or push channel is wired up.
pub struct LoggingSink;

#[async_trait]
impl NotificationSink for LoggingSink {
    async fn deliver(&self, notification: &QueuedNotification) -> anyhow::Result<()> {
        tracing::info!(
            user_id = notification.user_id,
            event = %notification.event_type,
            payload = %notification.payload,
            "user notification"
        );
        Ok(())
    }
}

pub fn start_dispatch_worker(pool: PgPool, sink: Arc<dyn NotificationSink>) {
    tokio::spawn(async move {
        let mut ticker = time::interval(Duration::from_secs(
            *config::NOTIFICATION_DISPATCH_INTERVAL_SECS,
        ));
        loop {
            ticker.tick().await;
            match dispatch_batch(&pool, sink.as_ref(), DISPATCH_BATCH).await {
                Ok(0) => {}
                Ok(delivered) => tracing::debug!(delivered, "notifications dispatched"),
                Err(err) => tracing::error!(?err, "notification dispatch failed"),
            }
        }
    });
}

/// Delivers one batch of queued notifications. Delivered rows are deleted,
/// failing rows accumulate attempts until they are parked as failed.
pub async fn dispatch_batch(
    pool: &PgPool,
    sink: &dyn NotificationSink,
    limit: i64,
) -> Result<usize, sqlx::Error> {
    let batch = sqlx::query_as::<_, QueuedNotification>(
        r#"
        SELECT * FROM notification_outbox
        WHERE status = 'queued'
        ORDER BY id ASC
        LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut delivered = 0;
    for notification in batch {
        match sink.deliver(&notification).await {
            Ok(()) => {
                sqlx::query("DELETE FROM notification_outbox WHERE id = $1")
                    .bind(notification.id)
                    .execute(pool)
                    .await?;
                delivered += 1;
            }
            Err(err) => {
                tracing::warn!(
                    ?err,
                    notification = notification.id,
                    "notification delivery failed"
                );
                sqlx::query(
                    r#"
                    UPDATE notification_outbox
                    SET attempts = attempts + 1,
                        status = CASE WHEN attempts + 1 >= $2 THEN 'failed' ELSE status END
                    WHERE id = $1
                    "#,
                )
                .bind(notification.id)
                .bind(MAX_DELIVERY_ATTEMPTS)
                .execute(pool)
                .await?;
            }
        }
    }
    Ok(delivered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_tag_their_payload() {
        let event = NotificationEvent::LowBalance {
            remaining_credits: 40,
            percent_used: 80,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "low_balance");
        assert_eq!(json["remaining_credits"], 40);
        assert_eq!(event.kind(), "low_balance");
    }

    #[test]
    fn kinds_match_serde_tags() {
        let events = [
            NotificationEvent::LimitExceeded,
            NotificationEvent::SubscriptionRenewed {
                plan_code: "pro".to_string(),
            },
            NotificationEvent::PaymentFailed {
                reason: "card expired".to_string(),
            },
            NotificationEvent::SubscriptionExpired {
                plan_code: "starter".to_string(),
            },
        ];
        for event in events {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["type"], event.kind());
        }
    }
}
