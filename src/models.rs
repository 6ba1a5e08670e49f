use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::EngineResult;
use crate::frequency::{Frequency, FrequencyUnit};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "subscription_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Incomplete,
    Active,
    PastDue,
    OnHold,
    Error,
    Expired,
    Cancelled,
}

impl SubscriptionStatus {
    /// Expired and cancelled absorb every further lifecycle event.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubscriptionStatus::Expired | SubscriptionStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::OnHold => "on_hold",
            SubscriptionStatus::Error => "error",
            SubscriptionStatus::Expired => "expired",
            SubscriptionStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "payment_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Authorized,
    Settled,
    Failed,
    Cancelled,
    Refunded,
}

impl PaymentStatus {
    /// A resolved payment is never touched by the orchestrator again.
    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Settled | PaymentStatus::Cancelled | PaymentStatus::Refunded
        )
    }
}

/// One tenant of the platform; carries all per-tenant billing knobs.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Merchant {
    pub id: Uuid,
    pub name: String,
    pub currency: String,
    pub joinable_window_days: i32,
    pub lead_time_days: i32,
    /// ISO weekday numbers (1 = Monday .. 7 = Sunday) allowed for a
    /// subscription's very first delivery.
    pub first_delivery_weekdays: Vec<i32>,
    /// ISO weekday numbers allowed for recurring deliveries.
    pub recurring_delivery_weekdays: Vec<i32>,
    pub max_settling_attempts: i32,
    pub failed_payment_cancel_days: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub merchant_id: Uuid,
    pub customer_id: Uuid,
    pub receiver_id: Option<Uuid>,
    pub status: SubscriptionStatus,
    /// Opaque processor reference for the stored payment method.
    pub payment_token: Option<String>,
    /// Optional per-subscription narrowing of the merchant's recurring
    /// weekday set.
    pub allowed_weekdays: Option<Vec<i32>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One line of a subscription's recurring recipe.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RecipeItem {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub product_id: Uuid,
    pub quantity: i32,
    pub unit_price_cents: i32,
    pub frequency_count: i32,
    pub frequency_unit: FrequencyUnit,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RecipeItem {
    pub fn frequency(&self) -> EngineResult<Frequency> {
        Frequency::new(self.frequency_count, self.frequency_unit)
    }
}

/// How far one (subscription, product) pair is fulfilled. Advanced only by
/// the materializer, and only forward.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FulfillmentCursor {
    pub subscription_id: Uuid,
    pub product_id: Uuid,
    pub fulfilled_until: NaiveDate,
    pub version: i32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Order {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub merchant_id: Uuid,
    pub fulfilled_until: NaiveDate,
    /// Recipe items and frequencies exactly as they were when the order was
    /// written; later edits never reach into history.
    pub recipe_snapshot: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OrderItem {
    pub id: Uuid,
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub quantity: i32,
    pub unit_price_cents: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Delivery {
    pub id: Uuid,
    pub order_id: Uuid,
    pub subscription_id: Uuid,
    /// Scheduled hand-off date; doubles as the charge date.
    pub delivery_date: NaiveDate,
    pub delivered: bool,
    pub packed: bool,
    pub cancelled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Payment {
    pub id: Uuid,
    pub order_id: Uuid,
    pub subscription_id: Uuid,
    pub status: PaymentStatus,
    pub amount_cents: i64,
    pub currency: String,
    pub settling_attempts: i32,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_error_code: Option<String>,
    pub processor_response: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
