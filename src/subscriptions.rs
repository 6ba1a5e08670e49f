use chrono::{Duration, NaiveDate};
use serde::Deserialize;
use serde_json::json;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use crate::adapters::Collaborators;
use crate::config;
use crate::error::{EngineError, EngineResult};
use crate::frequency::{Frequency, FrequencyUnit};
use crate::lifecycle::{self, SubscriptionEvent, TransitionOutcome};
use crate::materializer::{self, MaterializedOrder};
use crate::merchants;
use crate::models::{Delivery, Order, OrderItem, RecipeItem, Subscription, SubscriptionStatus};
use crate::synchronizer::{DeliverySchedule, SyncItem, SyncPlan};

#[derive(Debug, Clone, Deserialize)]
pub struct NewSubscription {
    pub merchant_id: Uuid,
    pub customer_id: Uuid,
    pub receiver_id: Option<Uuid>,
    pub payment_token: Option<String>,
    pub allowed_weekdays: Option<Vec<i32>>,
    pub items: Vec<NewRecipeItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewRecipeItem {
    pub product_id: Uuid,
    pub quantity: i32,
    #[serde(default)]
    pub unit_price_cents: i32,
    pub frequency_count: i32,
    pub frequency_unit: FrequencyUnit,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecipeItemUpdate {
    pub quantity: Option<i32>,
    pub unit_price_cents: Option<i32>,
    pub frequency_count: Option<i32>,
    pub frequency_unit: Option<FrequencyUnit>,
}

/// Options for one synchronization pass.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub reference: NaiveDate,
    /// Orders materialized per pass, clamped to 1..=4.
    pub max_orders: i64,
    /// Only orders delivering within this many days are materialized; once
    /// coverage reaches this bound, further passes for the same reference
    /// date find nothing new.
    pub horizon_days: i64,
    /// Treat the next batch like a first order (first-order weekday set).
    pub resume_from_today: bool,
}

impl SyncOptions {
    /// Cron defaults from engine config.
    pub fn daily(reference: NaiveDate) -> Self {
        Self {
            reference,
            max_orders: *config::BILLING_MAX_ORDERS_PER_SYNC,
            horizon_days: *config::BILLING_SYNC_HORIZON_DAYS,
            resume_from_today: false,
        }
    }

    pub fn resume(reference: NaiveDate) -> Self {
        Self {
            resume_from_today: true,
            ..Self::daily(reference)
        }
    }
}

pub async fn fetch_subscription(pool: &PgPool, subscription_id: Uuid) -> EngineResult<Subscription> {
    let subscription = sqlx::query_as::<_, Subscription>(
        r#"
        SELECT id, merchant_id, customer_id, receiver_id, status, payment_token,
               allowed_weekdays, created_at, updated_at
        FROM subscriptions
        WHERE id = $1
        "#,
    )
    .bind(subscription_id)
    .fetch_optional(pool)
    .await?;

    subscription.ok_or(EngineError::NotFound("subscription"))
}

/// key: subscription-service -> customer-facing lifecycle operations
#[derive(Clone)]
pub struct SubscriptionService {
    pool: PgPool,
    collaborators: Collaborators,
}

impl SubscriptionService {
    pub fn new(pool: PgPool, collaborators: Collaborators) -> Self {
        Self {
            pool,
            collaborators,
        }
    }

    /// Creates an `incomplete` subscription together with its recipe. The
    /// recipe must hold at least one item, and every frequency and weekday
    /// override is validated here rather than surfacing later from a batch
    /// run.
    pub async fn create_subscription(&self, input: NewSubscription) -> EngineResult<Subscription> {
        if input.items.is_empty() {
            return Err(EngineError::Config(
                "a subscription needs at least one recipe item".into(),
            ));
        }
        for item in &input.items {
            validate_item(item.quantity, item.frequency_count, item.frequency_unit)?;
        }
        if let Some(weekdays) = &input.allowed_weekdays {
            DeliverySchedule::from_iso_weekdays(weekdays, 0)?;
        }
        merchants::fetch_merchant(&self.pool, input.merchant_id).await?;

        let mut tx: Transaction<'_, Postgres> = self.pool.begin().await?;

        let subscription = sqlx::query_as::<_, Subscription>(
            r#"
            INSERT INTO subscriptions
                (id, merchant_id, customer_id, receiver_id, status, payment_token, allowed_weekdays)
            VALUES ($1, $2, $3, $4, 'incomplete', $5, $6)
            RETURNING id, merchant_id, customer_id, receiver_id, status, payment_token,
                      allowed_weekdays, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(input.merchant_id)
        .bind(input.customer_id)
        .bind(input.receiver_id)
        .bind(&input.payment_token)
        .bind(&input.allowed_weekdays)
        .fetch_one(&mut *tx)
        .await?;

        for item in &input.items {
            sqlx::query(
                r#"
                INSERT INTO recipe_items
                    (id, subscription_id, product_id, quantity, unit_price_cents,
                     frequency_count, frequency_unit)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(subscription.id)
            .bind(item.product_id)
            .bind(item.quantity)
            .bind(item.unit_price_cents)
            .bind(item.frequency_count)
            .bind(item.frequency_unit)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        info!(
            subscription = %subscription.id,
            merchant = %subscription.merchant_id,
            items = input.items.len(),
            "subscription created"
        );
        Ok(subscription)
    }

    pub async fn add_recipe_item(
        &self,
        subscription_id: Uuid,
        item: NewRecipeItem,
    ) -> EngineResult<RecipeItem> {
        validate_item(item.quantity, item.frequency_count, item.frequency_unit)?;

        let row = sqlx::query_as::<_, RecipeItem>(
            r#"
            INSERT INTO recipe_items
                (id, subscription_id, product_id, quantity, unit_price_cents,
                 frequency_count, frequency_unit)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, subscription_id, product_id, quantity, unit_price_cents,
                      frequency_count, frequency_unit, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(subscription_id)
        .bind(item.product_id)
        .bind(item.quantity)
        .bind(item.unit_price_cents)
        .bind(item.frequency_count)
        .bind(item.frequency_unit)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    /// Edits one recipe line. A frequency change only affects due dates
    /// computed from now on; orders already written and the dates already
    /// covered by the fulfillment cursor stay as they are.
    pub async fn update_recipe_item(
        &self,
        subscription_id: Uuid,
        recipe_item_id: Uuid,
        update: RecipeItemUpdate,
    ) -> EngineResult<RecipeItem> {
        if let Some(quantity) = update.quantity {
            if quantity <= 0 {
                return Err(EngineError::Config(format!(
                    "quantity must be positive, got {quantity}"
                )));
            }
        }
        if let Some(count) = update.frequency_count {
            if count <= 0 {
                return Err(EngineError::Config(format!(
                    "frequency count must be positive, got {count}"
                )));
            }
        }

        let row = sqlx::query_as::<_, RecipeItem>(
            r#"
            UPDATE recipe_items
            SET quantity = COALESCE($3, quantity),
                unit_price_cents = COALESCE($4, unit_price_cents),
                frequency_count = COALESCE($5, frequency_count),
                frequency_unit = COALESCE($6, frequency_unit),
                updated_at = NOW()
            WHERE subscription_id = $1 AND id = $2
            RETURNING id, subscription_id, product_id, quantity, unit_price_cents,
                      frequency_count, frequency_unit, created_at, updated_at
            "#,
        )
        .bind(subscription_id)
        .bind(recipe_item_id)
        .bind(update.quantity)
        .bind(update.unit_price_cents)
        .bind(update.frequency_count)
        .bind(update.frequency_unit)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or(EngineError::NotFound("recipe item"))
    }

    /// Removes one recipe line; the last line cannot be removed.
    pub async fn remove_recipe_item(
        &self,
        subscription_id: Uuid,
        recipe_item_id: Uuid,
    ) -> EngineResult<()> {
        let mut tx: Transaction<'_, Postgres> = self.pool.begin().await?;

        let removed = sqlx::query("DELETE FROM recipe_items WHERE subscription_id = $1 AND id = $2")
            .bind(subscription_id)
            .bind(recipe_item_id)
            .execute(&mut *tx)
            .await?;
        if removed.rows_affected() == 0 {
            return Err(EngineError::NotFound("recipe item"));
        }

        let remaining: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM recipe_items WHERE subscription_id = $1")
                .bind(subscription_id)
                .fetch_one(&mut *tx)
                .await?;
        if remaining == 0 {
            return Err(EngineError::Config(
                "a subscription must keep at least one recipe item".into(),
            ));
        }

        tx.commit().await?;
        Ok(())
    }

    /// Pauses billing and delivery. Upcoming deliveries that were never
    /// charged are cancelled outright; charged ones keep their payments and
    /// stay in the dunning flow.
    pub async fn pause(&self, subscription_id: Uuid) -> EngineResult<TransitionOutcome> {
        let outcome = lifecycle::apply_event(
            &self.pool,
            self.collaborators.notifier.as_ref(),
            subscription_id,
            SubscriptionEvent::Paused,
            json!({}),
        )
        .await?;

        if outcome.changed {
            let cancelled = sqlx::query(
                r#"
                UPDATE deliveries d
                SET cancelled = TRUE, updated_at = NOW()
                WHERE d.subscription_id = $1
                  AND NOT d.delivered
                  AND NOT d.cancelled
                  AND NOT EXISTS (SELECT 1 FROM payments p WHERE p.order_id = d.order_id)
                "#,
            )
            .bind(subscription_id)
            .execute(&self.pool)
            .await?;
            info!(
                subscription = %subscription_id,
                cancelled_deliveries = cancelled.rows_affected(),
                "subscription paused"
            );
        }

        Ok(outcome)
    }

    /// Resumes a paused subscription. Nothing is backfilled: the next
    /// synchronize pass re-anchors every item to today, deliberately
    /// dropping the cycles missed while paused.
    pub async fn resume(&self, subscription_id: Uuid) -> EngineResult<TransitionOutcome> {
        lifecycle::apply_event(
            &self.pool,
            self.collaborators.notifier.as_ref(),
            subscription_id,
            SubscriptionEvent::Resumed,
            json!({}),
        )
        .await
    }

    /// Cancels the subscription for good: undelivered deliveries and their
    /// unresolved payments are cancelled, and no further billing happens.
    /// Only a live subscription (active, past due, or on hold) can be
    /// cancelled; when the event is a no-op the open rows are left alone.
    /// An order already delivered but unpaid is left for manual collection.
    pub async fn cancel(&self, subscription_id: Uuid) -> EngineResult<TransitionOutcome> {
        let outcome = lifecycle::apply_event(
            &self.pool,
            self.collaborators.notifier.as_ref(),
            subscription_id,
            SubscriptionEvent::Cancelled,
            json!({}),
        )
        .await?;

        if outcome.changed {
            sqlx::query(
                r#"
                UPDATE payments p
                SET status = 'cancelled', updated_at = NOW()
                FROM deliveries d
                WHERE d.order_id = p.order_id
                  AND p.subscription_id = $1
                  AND p.status IN ('pending', 'failed')
                  AND NOT d.delivered
                "#,
            )
            .bind(subscription_id)
            .execute(&self.pool)
            .await?;

            let cancelled = sqlx::query(
                r#"
                UPDATE deliveries
                SET cancelled = TRUE, updated_at = NOW()
                WHERE subscription_id = $1 AND NOT delivered AND NOT cancelled
                "#,
            )
            .bind(subscription_id)
            .execute(&self.pool)
            .await?;
            info!(
                subscription = %subscription_id,
                cancelled_deliveries = cancelled.rows_affected(),
                "subscription cancelled"
            );
        }

        Ok(outcome)
    }

    /// key: subscription-sync -> order generation entry point
    ///
    /// Plans and materializes upcoming orders for one subscription, at most
    /// `max_orders` of them and none delivering past the horizon. The
    /// persisted cursors advance with every written order, so no period is
    /// ever covered twice; a repeat call picks up after the last written
    /// order and finds nothing once coverage reaches the horizon.
    pub async fn synchronize(
        &self,
        subscription_id: Uuid,
        options: SyncOptions,
    ) -> EngineResult<Vec<MaterializedOrder>> {
        let subscription = fetch_subscription(&self.pool, subscription_id).await?;
        if subscription.status.is_terminal() || subscription.status == SubscriptionStatus::OnHold {
            debug!(
                subscription = %subscription_id,
                status = subscription.status.as_str(),
                "skipping sync for inactive subscription"
            );
            return Ok(Vec::new());
        }

        let merchant = merchants::fetch_merchant(&self.pool, subscription.merchant_id).await?;
        let items = self.load_sync_items(subscription_id).await?;
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let cursors = materializer::load_cursors(&self.pool, subscription_id).await?;

        let recurring = merchant.recurring_schedule(subscription.allowed_weekdays.as_deref())?;
        let has_orders: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM orders WHERE subscription_id = $1)")
                .bind(subscription_id)
                .fetch_one(&self.pool)
                .await?;
        let first_order = if options.resume_from_today || !has_orders {
            Some(merchant.first_order_schedule()?)
        } else {
            None
        };

        let horizon = options.reference + Duration::days(options.horizon_days.max(0));
        let plan = SyncPlan::new(
            items,
            &cursors,
            options.reference,
            i64::from(merchant.joinable_window_days),
            recurring,
            first_order,
        );

        let mut materialized = Vec::new();
        for preliminary in plan.take(options.max_orders.clamp(1, 4) as usize) {
            if preliminary.delivery_date > horizon {
                break;
            }
            if let Some(order) = materializer::materialize(
                &self.pool,
                self.collaborators.inventory.as_ref(),
                &subscription,
                &preliminary,
            )
            .await?
            {
                materialized.push(order);
            }
        }

        if materialized.is_empty() {
            debug!(subscription = %subscription_id, "nothing new to materialize");
        } else {
            info!(
                subscription = %subscription_id,
                orders = materialized.len(),
                "synchronized subscription"
            );
        }
        Ok(materialized)
    }

    /// Orders written for a subscription so far, oldest first.
    pub async fn orders(&self, subscription_id: Uuid) -> EngineResult<Vec<Order>> {
        let rows = sqlx::query_as::<_, Order>(
            r#"
            SELECT id, subscription_id, merchant_id, fulfilled_until, recipe_snapshot, created_at
            FROM orders
            WHERE subscription_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn order_items(&self, order_id: Uuid) -> EngineResult<Vec<OrderItem>> {
        let rows = sqlx::query_as::<_, OrderItem>(
            r#"
            SELECT id, order_id, product_id, quantity, unit_price_cents
            FROM order_items
            WHERE order_id = $1
            ORDER BY product_id
            "#,
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Deliveries still on the calendar (neither delivered nor cancelled),
    /// soonest first.
    pub async fn open_deliveries(&self, subscription_id: Uuid) -> EngineResult<Vec<Delivery>> {
        let rows = sqlx::query_as::<_, Delivery>(
            r#"
            SELECT id, order_id, subscription_id, delivery_date, delivered, packed, cancelled,
                   created_at, updated_at
            FROM deliveries
            WHERE subscription_id = $1 AND NOT delivered AND NOT cancelled
            ORDER BY delivery_date, id
            "#,
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn load_sync_items(&self, subscription_id: Uuid) -> EngineResult<Vec<SyncItem>> {
        let rows = sqlx::query_as::<_, RecipeItem>(
            r#"
            SELECT id, subscription_id, product_id, quantity, unit_price_cents,
                   frequency_count, frequency_unit, created_at, updated_at
            FROM recipe_items
            WHERE subscription_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            items.push(SyncItem {
                recipe_item_id: row.id,
                product_id: row.product_id,
                quantity: row.quantity,
                unit_price_cents: row.unit_price_cents,
                frequency: row.frequency()?,
            });
        }
        Ok(items)
    }
}

fn validate_item(quantity: i32, frequency_count: i32, unit: FrequencyUnit) -> EngineResult<()> {
    if quantity <= 0 {
        return Err(EngineError::Config(format!(
            "quantity must be positive, got {quantity}"
        )));
    }
    Frequency::new(frequency_count, unit)?;
    Ok(())
}
