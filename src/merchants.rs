use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::models::Merchant;
use crate::synchronizer::DeliverySchedule;

/// Loads one tenant's billing configuration.
pub async fn fetch_merchant(pool: &PgPool, merchant_id: Uuid) -> EngineResult<Merchant> {
    let merchant = sqlx::query_as::<_, Merchant>(
        r#"
        SELECT id, name, currency, joinable_window_days, lead_time_days,
               first_delivery_weekdays, recurring_delivery_weekdays,
               max_settling_attempts, failed_payment_cancel_days,
               created_at, updated_at
        FROM merchants
        WHERE id = $1
        "#,
    )
    .bind(merchant_id)
    .fetch_optional(pool)
    .await?;

    merchant.ok_or(EngineError::NotFound("merchant"))
}

/// All tenants, in onboarding order; the batch coordinator sweeps these.
pub async fn list_merchant_ids(pool: &PgPool) -> EngineResult<Vec<Uuid>> {
    Ok(
        sqlx::query_scalar("SELECT id FROM merchants ORDER BY created_at, id")
            .fetch_all(pool)
            .await?,
    )
}

impl Merchant {
    /// Weekday schedule for a subscription's very first order.
    pub fn first_order_schedule(&self) -> EngineResult<DeliverySchedule> {
        DeliverySchedule::from_iso_weekdays(
            &self.first_delivery_weekdays,
            i64::from(self.lead_time_days),
        )
    }

    /// Recurring schedule; a subscription-level weekday override replaces
    /// the merchant-wide set when present.
    pub fn recurring_schedule(
        &self,
        override_weekdays: Option<&[i32]>,
    ) -> EngineResult<DeliverySchedule> {
        let weekdays = override_weekdays.unwrap_or(&self.recurring_delivery_weekdays);
        DeliverySchedule::from_iso_weekdays(weekdays, i64::from(self.lead_time_days))
    }
}
