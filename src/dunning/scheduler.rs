use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::time::{self, Duration as TokioDuration};
use tracing::{info, warn};

use crate::adapters::Collaborators;
use crate::config;
use crate::error::EngineResult;
use crate::merchants;

use super::service::run_daily_billing;

/// key: billing-cron -> daily batch coordination
pub fn spawn(pool: PgPool, collaborators: Collaborators) {
    let interval = TokioDuration::from_secs(*config::BILLING_SCAN_INTERVAL_SECS);

    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            let now = Utc::now();
            if let Err(err) = process_tick(&pool, &collaborators, now).await {
                warn!(?err, "billing sweep tick failed");
            }
        }
    });
}

/// Runs every merchant's daily billing once. One merchant failing is logged
/// and the sweep moves on; their rows are picked up again on the next tick.
pub async fn process_tick(
    pool: &PgPool,
    collaborators: &Collaborators,
    now: DateTime<Utc>,
) -> EngineResult<()> {
    let merchant_ids = merchants::list_merchant_ids(pool).await?;
    info!(merchants = merchant_ids.len(), "billing sweep started");

    for merchant_id in merchant_ids {
        if let Err(err) = run_daily_billing(pool, collaborators, merchant_id, now).await {
            warn!(?err, merchant = %merchant_id, "daily billing failed for merchant");
        }
    }
    Ok(())
}
