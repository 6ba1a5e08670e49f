use once_cell::sync::Lazy;

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

/// key: billing-config -> daily batch scan cadence
pub static BILLING_SCAN_INTERVAL_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("BILLING_SCAN_INTERVAL_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(3600)
});

/// key: billing-config -> how far ahead deliveries are materialized
pub static BILLING_SYNC_HORIZON_DAYS: Lazy<i64> = Lazy::new(|| {
    std::env::var("BILLING_SYNC_HORIZON_DAYS")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(7)
});

/// key: billing-config -> per-subscription order cap for one sync pass
pub static BILLING_MAX_ORDERS_PER_SYNC: Lazy<i64> = Lazy::new(|| {
    std::env::var("BILLING_MAX_ORDERS_PER_SYNC")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .map(|value| value.clamp(1, 4))
        .unwrap_or(4)
});

/// key: billing-config -> how many days behind the delivery date failed payments stay retryable
pub static BILLING_RETRY_LOOKBACK_DAYS: Lazy<i64> = Lazy::new(|| {
    std::env::var("BILLING_RETRY_LOOKBACK_DAYS")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|value| *value >= 0)
        .unwrap_or(30)
});

/// key: billing-config -> how many days ahead of the delivery date failed payments stay retryable
pub static BILLING_RETRY_LOOKAHEAD_DAYS: Lazy<i64> = Lazy::new(|| {
    std::env::var("BILLING_RETRY_LOOKAHEAD_DAYS")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|value| *value >= 0)
        .unwrap_or(14)
});

/// key: billing-config -> hour before which the once-per-day retry gate is waived
pub static BILLING_RETRY_CUTOFF_HOUR: Lazy<u32> = Lazy::new(|| {
    std::env::var("BILLING_RETRY_CUTOFF_HOUR")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .filter(|value| *value < 24)
        .unwrap_or(6)
});

/// key: billing-config -> hard deadline for a single processor call
pub static BILLING_PROCESSOR_TIMEOUT_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("BILLING_PROCESSOR_TIMEOUT_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(30)
});
