use std::collections::HashMap;

use chrono::NaiveDate;
use serde_json::json;
use sqlx::{Executor, PgPool, Postgres, Transaction};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::adapters::Inventory;
use crate::error::EngineResult;
use crate::models::{FulfillmentCursor, Subscription};
use crate::synchronizer::{PreliminaryOrder, SyncItem};

/// Result of materializing one preliminary order.
#[derive(Debug, Clone)]
pub struct MaterializedOrder {
    pub order_id: Uuid,
    pub delivery_id: Uuid,
    pub delivery_date: NaiveDate,
    pub item_count: usize,
}

/// key: order-materializer -> preliminary orders become rows
///
/// Writes the order, its items, exactly one delivery, and the cursor
/// advances in a single transaction; a failure anywhere rolls the whole
/// batch back. A plan whose cursors another worker has since carried
/// forward fails the monotonic guard and is dropped whole rather than
/// billed twice. Items the inventory cannot fulfill are left out with
/// their cursors untouched, so they are offered again on the next pass.
/// Payment rows are not created here; they appear when the delivery first
/// comes due.
pub async fn materialize(
    pool: &PgPool,
    inventory: &dyn Inventory,
    subscription: &Subscription,
    preliminary: &PreliminaryOrder,
) -> EngineResult<Option<MaterializedOrder>> {
    let mut fulfillable: Vec<&SyncItem> = Vec::with_capacity(preliminary.items.len());
    let mut deferred = 0usize;
    for item in &preliminary.items {
        match inventory.can_fulfill(item.product_id, item.quantity).await {
            Ok(true) => fulfillable.push(item),
            Ok(false) => deferred += 1,
            Err(err) => {
                warn!(?err, product = %item.product_id, "inventory check failed, deferring item");
                deferred += 1;
            }
        }
    }

    if fulfillable.is_empty() {
        debug!(
            subscription = %subscription.id,
            date = %preliminary.delivery_date,
            deferred,
            "no fulfillable items, nothing materialized"
        );
        return Ok(None);
    }

    let snapshot = json!({
        "anchor_date": preliminary.anchor_date,
        "items": fulfillable
            .iter()
            .map(|item| json!({
                "recipe_item_id": item.recipe_item_id,
                "product_id": item.product_id,
                "quantity": item.quantity,
                "unit_price_cents": item.unit_price_cents,
                "frequency": item.frequency,
            }))
            .collect::<Vec<_>>(),
    });

    let mut tx: Transaction<'_, Postgres> = pool.begin().await?;

    let order_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO orders (id, subscription_id, merchant_id, fulfilled_until, recipe_snapshot)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(order_id)
    .bind(subscription.id)
    .bind(subscription.merchant_id)
    .bind(preliminary.delivery_date)
    .bind(&snapshot)
    .execute(&mut *tx)
    .await?;

    for item in &fulfillable {
        sqlx::query(
            r#"
            INSERT INTO order_items (id, order_id, product_id, quantity, unit_price_cents)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(order_id)
        .bind(item.product_id)
        .bind(item.quantity)
        .bind(item.unit_price_cents)
        .execute(&mut *tx)
        .await?;
    }

    let delivery_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO deliveries (id, order_id, subscription_id, delivery_date)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(delivery_id)
    .bind(order_id)
    .bind(subscription.id)
    .bind(preliminary.delivery_date)
    .execute(&mut *tx)
    .await?;

    for item in &fulfillable {
        let advanced = advance_cursor(
            &mut *tx,
            subscription.id,
            item.product_id,
            preliminary.delivery_date,
        )
        .await?;
        if advanced == 0 {
            // another writer covered this date while the plan was in flight;
            // committing would bill the period twice
            tx.rollback().await?;
            warn!(
                subscription = %subscription.id,
                product = %item.product_id,
                date = %preliminary.delivery_date,
                "cursor already past the planned date, batch dropped"
            );
            return Ok(None);
        }
    }

    tx.commit().await?;

    debug!(
        subscription = %subscription.id,
        order = %order_id,
        date = %preliminary.delivery_date,
        items = fulfillable.len(),
        deferred,
        "materialized order"
    );

    Ok(Some(MaterializedOrder {
        order_id,
        delivery_id,
        delivery_date: preliminary.delivery_date,
        item_count: fulfillable.len(),
    }))
}

/// Monotonic cursor upsert: the fulfilled-until date never moves backward,
/// and every forward move bumps the row version. Returns the number of rows
/// written; zero means another writer already carried the cursor to this
/// date or past it.
pub async fn advance_cursor<'c, E>(
    executor: E,
    subscription_id: Uuid,
    product_id: Uuid,
    fulfilled_until: NaiveDate,
) -> Result<u64, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO fulfillment_cursors (subscription_id, product_id, fulfilled_until, version)
        VALUES ($1, $2, $3, 1)
        ON CONFLICT (subscription_id, product_id) DO UPDATE
        SET
            fulfilled_until = EXCLUDED.fulfilled_until,
            version = fulfillment_cursors.version + 1,
            updated_at = NOW()
        WHERE fulfillment_cursors.fulfilled_until < EXCLUDED.fulfilled_until
        "#,
    )
    .bind(subscription_id)
    .bind(product_id)
    .bind(fulfilled_until)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

/// Cursor map for one subscription, keyed by product.
pub async fn load_cursors(
    pool: &PgPool,
    subscription_id: Uuid,
) -> Result<HashMap<Uuid, NaiveDate>, sqlx::Error> {
    let rows = sqlx::query_as::<_, FulfillmentCursor>(
        r#"
        SELECT subscription_id, product_id, fulfilled_until, version, updated_at
        FROM fulfillment_cursors
        WHERE subscription_id = $1
        "#,
    )
    .bind(subscription_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|cursor| (cursor.product_id, cursor.fulfilled_until))
        .collect())
}
