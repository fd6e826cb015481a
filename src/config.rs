use once_cell::sync::Lazy;
use url::Url;

/// Address the HTTP server should bind to. Defaults to `0.0.0.0`.
pub static BIND_ADDRESS: Lazy<String> =
    Lazy::new(|| std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string()));

/// Port the HTTP server should listen on. Defaults to `3000`.
pub static BIND_PORT: Lazy<u16> = Lazy::new(|| {
    std::env::var("BIND_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(3000)
});

/// When set to a truthy value, allows the application to continue running even if database
/// migrations fail. Defaults to `false`.
pub static ALLOW_MIGRATION_FAILURE: Lazy<bool> = Lazy::new(|| {
    std::env::var("ALLOW_MIGRATION_FAILURE")
        .ok()
        .map(|value| {
            let normalized = value.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "1" | "true" | "yes")
        })
        .unwrap_or(false)
});

/// How often the renewal worker scans for due subscriptions, in seconds.
pub static BILLING_RENEWAL_SCAN_INTERVAL_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("BILLING_RENEWAL_SCAN_INTERVAL_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(300)
});

/// Maximum number of subscriptions processed per renewal tick.
pub static BILLING_RENEWAL_BATCH_SIZE: Lazy<i64> = Lazy::new(|| {
    std::env::var("BILLING_RENEWAL_BATCH_SIZE")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(50)
});

/// Hours between charge retries while a subscription sits in its grace period.
pub static BILLING_GRACE_RETRY_HOURS: Lazy<i64> = Lazy::new(|| {
    std::env::var("BILLING_GRACE_RETRY_HOURS")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(24)
});

/// Base URL of the external payment gateway.
pub static PAYMENT_GATEWAY_ENDPOINT: Lazy<String> = Lazy::new(|| {
    let raw = std::env::var("PAYMENT_GATEWAY_ENDPOINT")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| "http://127.0.0.1:8787".to_string());
    let trimmed = raw.trim().to_string();
    if let Err(err) = Url::parse(&trimmed) {
        panic!("PAYMENT_GATEWAY_ENDPOINT is not a valid URL: {err}");
    }
    trimmed
});

/// Optional bearer token presented to the payment gateway.
pub static PAYMENT_GATEWAY_TOKEN: Lazy<Option<String>> =
    Lazy::new(|| read_optional_env("PAYMENT_GATEWAY_TOKEN"));

/// Request timeout for payment gateway calls, in seconds.
pub static PAYMENT_GATEWAY_TIMEOUT_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("PAYMENT_GATEWAY_TIMEOUT_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(30)
});

/// Poll interval of the notification dispatch worker, in seconds.
pub static NOTIFICATION_DISPATCH_INTERVAL_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("NOTIFICATION_DISPATCH_INTERVAL_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(5)
});

fn read_optional_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
