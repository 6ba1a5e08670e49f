use billing_engine::adapters::{Collaborators, UnlimitedInventory};
use billing_engine::dunning::{run_daily_billing, DailyBillingReport};
use billing_engine::error::EngineError;
use billing_engine::frequency::{Frequency, FrequencyUnit};
use billing_engine::materializer;
use billing_engine::subscriptions::{
    fetch_subscription, NewRecipeItem, NewSubscription, RecipeItemUpdate, SubscriptionService,
    SyncOptions,
};
use billing_engine::synchronizer::{PreliminaryOrder, SyncItem};
use chrono::{NaiveDate, TimeZone, Utc};
use sqlx::PgPool;
use uuid::Uuid;

// key: billing-flow-tests -> planning and materialization end to end

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn options(reference: NaiveDate, max_orders: i64, horizon_days: i64) -> SyncOptions {
    SyncOptions {
        reference,
        max_orders,
        horizon_days,
        resume_from_today: false,
    }
}

/// Delivers any weekday with no packing lead, so delivery dates equal due
/// dates and assertions stay readable.
async fn seed_any_day_merchant(pool: &PgPool) -> Uuid {
    let merchant_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO merchants
            (id, name, currency, joinable_window_days, lead_time_days,
             first_delivery_weekdays, recurring_delivery_weekdays,
             max_settling_attempts, failed_payment_cancel_days)
        VALUES ($1, $2, 'EUR', 5, 0, '{1,2,3,4,5,6,7}', '{1,2,3,4,5,6,7}', 3, 20)
        "#,
    )
    .bind(merchant_id)
    .bind("Green Grocer")
    .execute(pool)
    .await
    .unwrap();
    merchant_id
}

fn weekly_item(product_id: Uuid) -> NewRecipeItem {
    NewRecipeItem {
        product_id,
        quantity: 1,
        unit_price_cents: 500,
        frequency_count: 1,
        frequency_unit: FrequencyUnit::Weeks,
    }
}

async fn create_subscription(
    service: &SubscriptionService,
    merchant_id: Uuid,
    items: Vec<NewRecipeItem>,
) -> Uuid {
    let subscription = service
        .create_subscription(NewSubscription {
            merchant_id,
            customer_id: Uuid::new_v4(),
            receiver_id: None,
            payment_token: Some("tok_test".into()),
            allowed_weekdays: None,
            items,
        })
        .await
        .unwrap();
    subscription.id
}

async fn subscription_status(pool: &PgPool, subscription_id: Uuid) -> String {
    sqlx::query_scalar("SELECT status::TEXT FROM subscriptions WHERE id = $1")
        .bind(subscription_id)
        .fetch_one(pool)
        .await
        .unwrap()
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn synchronize_materializes_order_delivery_and_cursor(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let merchant_id = seed_any_day_merchant(&pool).await;
    let service = SubscriptionService::new(pool.clone(), Collaborators::stubbed());
    let product_id = Uuid::new_v4();
    let subscription_id = create_subscription(
        &service,
        merchant_id,
        vec![NewRecipeItem {
            product_id,
            quantity: 2,
            unit_price_cents: 450,
            frequency_count: 1,
            frequency_unit: FrequencyUnit::Months,
        }],
    )
    .await;

    let orders = service
        .synchronize(subscription_id, options(date(2026, 10, 1), 4, 7))
        .await
        .unwrap();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].delivery_date, date(2026, 10, 1));
    assert_eq!(orders[0].item_count, 1);

    let items = service.order_items(orders[0].order_id).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!((items[0].quantity, items[0].unit_price_cents), (2, 450));

    let open = service.open_deliveries(subscription_id).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].id, orders[0].delivery_id);
    assert_eq!(open[0].delivery_date, date(2026, 10, 1));

    let written = service.orders(subscription_id).await.unwrap();
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].fulfilled_until, date(2026, 10, 1));
    let snapshot_items = written[0].recipe_snapshot["items"].as_array().unwrap();
    assert_eq!(snapshot_items.len(), 1);

    let cursor: NaiveDate = sqlx::query_scalar(
        "SELECT fulfilled_until FROM fulfillment_cursors WHERE subscription_id = $1 AND product_id = $2",
    )
    .bind(subscription_id)
    .bind(product_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(cursor, date(2026, 10, 1));

    // the cursor advanced, so the same pass finds nothing new
    let again = service
        .synchronize(subscription_id, options(date(2026, 10, 1), 4, 7))
        .await
        .unwrap();
    assert!(again.is_empty());
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn items_due_within_window_ship_as_one_order(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let merchant_id = seed_any_day_merchant(&pool).await;
    let service = SubscriptionService::new(pool.clone(), Collaborators::stubbed());
    let product_a = Uuid::new_v4();
    let product_b = Uuid::new_v4();
    let subscription_id = create_subscription(
        &service,
        merchant_id,
        vec![weekly_item(product_a), weekly_item(product_b)],
    )
    .await;

    // due Oct 1 and Oct 3; the 2-day gap is inside the 5-day window
    for (product_id, fulfilled) in [
        (product_a, date(2026, 9, 24)),
        (product_b, date(2026, 9, 26)),
    ] {
        sqlx::query(
            "INSERT INTO fulfillment_cursors (subscription_id, product_id, fulfilled_until) VALUES ($1, $2, $3)",
        )
        .bind(subscription_id)
        .bind(product_id)
        .bind(fulfilled)
        .execute(&pool)
        .await
        .unwrap();
    }

    let orders = service
        .synchronize(subscription_id, options(date(2026, 10, 1), 1, 7))
        .await
        .unwrap();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].item_count, 2);
    assert_eq!(orders[0].delivery_date, date(2026, 10, 1));

    let cursors: Vec<NaiveDate> = sqlx::query_scalar(
        "SELECT fulfilled_until FROM fulfillment_cursors WHERE subscription_id = $1",
    )
    .bind(subscription_id)
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(cursors, vec![date(2026, 10, 1), date(2026, 10, 1)]);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn mixed_cadence_items_merge_and_split_over_the_cycle(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let merchant_id = seed_any_day_merchant(&pool).await;
    let service = SubscriptionService::new(pool.clone(), Collaborators::stubbed());
    let coffee = Uuid::new_v4();
    let milk = Uuid::new_v4();
    let eggs = Uuid::new_v4();
    let subscription_id = create_subscription(
        &service,
        merchant_id,
        vec![
            weekly_item(coffee),
            NewRecipeItem {
                product_id: milk,
                quantity: 1,
                unit_price_cents: 250,
                frequency_count: 2,
                frequency_unit: FrequencyUnit::Weeks,
            },
            NewRecipeItem {
                product_id: eggs,
                quantity: 1,
                unit_price_cents: 320,
                frequency_count: 1,
                frequency_unit: FrequencyUnit::Months,
            },
        ],
    )
    .await;

    // everything ships together on day one, then each item follows its own
    // cadence: the weekly coffee is alone on Oct 8 and the biweekly milk
    // re-joins it on Oct 15
    let orders = service
        .synchronize(subscription_id, options(date(2026, 10, 1), 4, 30))
        .await
        .unwrap();
    let plan: Vec<_> = orders
        .iter()
        .map(|o| (o.delivery_date, o.item_count))
        .collect();
    assert_eq!(
        plan,
        vec![
            (date(2026, 10, 1), 3),
            (date(2026, 10, 8), 1),
            (date(2026, 10, 15), 2),
            (date(2026, 10, 22), 1),
        ]
    );

    let mut rejoined: Vec<Uuid> = service
        .order_items(orders[2].order_id)
        .await
        .unwrap()
        .iter()
        .map(|item| item.product_id)
        .collect();
    rejoined.sort();
    let mut expected = vec![coffee, milk];
    expected.sort();
    assert_eq!(rejoined, expected);

    // by Oct 29 the monthly eggs are due within the joinable window again,
    // so the next pass pulls them a few days early into one order
    let next = service
        .synchronize(subscription_id, options(date(2026, 10, 1), 4, 30))
        .await
        .unwrap();
    let plan: Vec<_> = next
        .iter()
        .map(|o| (o.delivery_date, o.item_count))
        .collect();
    assert_eq!(plan, vec![(date(2026, 10, 29), 3)]);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn order_cap_and_horizon_bound_each_pass(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let merchant_id = seed_any_day_merchant(&pool).await;
    let service = SubscriptionService::new(pool.clone(), Collaborators::stubbed());
    let subscription_id =
        create_subscription(&service, merchant_id, vec![weekly_item(Uuid::new_v4())]).await;

    let first_pass = service
        .synchronize(subscription_id, options(date(2026, 10, 1), 2, 30))
        .await
        .unwrap();
    let dates: Vec<_> = first_pass.iter().map(|o| o.delivery_date).collect();
    assert_eq!(dates, vec![date(2026, 10, 1), date(2026, 10, 8)]);

    // the next pass picks up where the cursors left off
    let second_pass = service
        .synchronize(subscription_id, options(date(2026, 10, 1), 2, 30))
        .await
        .unwrap();
    let dates: Vec<_> = second_pass.iter().map(|o| o.delivery_date).collect();
    assert_eq!(dates, vec![date(2026, 10, 15), date(2026, 10, 22)]);

    // a short horizon stops materialization even with budget left
    let third_pass = service
        .synchronize(subscription_id, options(date(2026, 10, 1), 4, 3))
        .await
        .unwrap();
    assert!(third_pass.is_empty());
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn plan_built_from_stale_cursors_is_dropped_whole(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let merchant_id = seed_any_day_merchant(&pool).await;
    let service = SubscriptionService::new(pool.clone(), Collaborators::stubbed());
    let product_id = Uuid::new_v4();
    let subscription_id =
        create_subscription(&service, merchant_id, vec![weekly_item(product_id)]).await;

    let orders = service
        .synchronize(subscription_id, options(date(2026, 10, 1), 1, 0))
        .await
        .unwrap();
    assert_eq!(orders.len(), 1);

    // a second planner that read the cursors before that write would offer
    // the same Oct 1 batch again; the cursor guard has to throw it out
    let subscription = fetch_subscription(&pool, subscription_id).await.unwrap();
    let recipe_item_id: Uuid =
        sqlx::query_scalar("SELECT id FROM recipe_items WHERE subscription_id = $1")
            .bind(subscription_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    let stale_plan = PreliminaryOrder {
        anchor_date: date(2026, 10, 1),
        delivery_date: date(2026, 10, 1),
        items: vec![SyncItem {
            recipe_item_id,
            product_id,
            quantity: 1,
            unit_price_cents: 500,
            frequency: Frequency::new(1, FrequencyUnit::Weeks).unwrap(),
        }],
    };
    let outcome = materializer::materialize(&pool, &UnlimitedInventory, &subscription, &stale_plan)
        .await
        .unwrap();
    assert!(outcome.is_none());

    // nothing from the losing batch survives, not even part of it
    let order_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM orders WHERE subscription_id = $1")
            .bind(subscription_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(order_count, 1);
    let delivery_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM deliveries WHERE subscription_id = $1")
            .bind(subscription_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(delivery_count, 1);

    let (fulfilled, version): (NaiveDate, i32) = sqlx::query_as(
        "SELECT fulfilled_until, version FROM fulfillment_cursors WHERE subscription_id = $1 AND product_id = $2",
    )
    .bind(subscription_id)
    .bind(product_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!((fulfilled, version), (date(2026, 10, 1), 1));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn delivery_dates_follow_merchant_weekday_rules(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    // first deliveries on Saturday, recurring on Tuesday or Friday, packed
    // three days ahead
    let merchant_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO merchants
            (id, name, currency, joinable_window_days, lead_time_days,
             first_delivery_weekdays, recurring_delivery_weekdays,
             max_settling_attempts, failed_payment_cancel_days)
        VALUES ($1, $2, 'EUR', 5, 3, '{6}', '{2,5}', 3, 20)
        "#,
    )
    .bind(merchant_id)
    .bind("Weekday Grocer")
    .execute(&pool)
    .await
    .unwrap();

    let service = SubscriptionService::new(pool.clone(), Collaborators::stubbed());
    let subscription_id =
        create_subscription(&service, merchant_id, vec![weekly_item(Uuid::new_v4())]).await;

    // Thu Oct 1 + 3 lead days = Sun Oct 4, first Saturday after is Oct 10;
    // the follow-up is due Sat Oct 17, lands Tue Oct 20
    let orders = service
        .synchronize(subscription_id, options(date(2026, 10, 1), 2, 30))
        .await
        .unwrap();
    let dates: Vec<_> = orders.iter().map(|o| o.delivery_date).collect();
    assert_eq!(dates, vec![date(2026, 10, 10), date(2026, 10, 20)]);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn pause_cancels_unpaid_deliveries_and_resume_reanchors(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let merchant_id = seed_any_day_merchant(&pool).await;
    let service = SubscriptionService::new(pool.clone(), Collaborators::stubbed());
    let subscription_id =
        create_subscription(&service, merchant_id, vec![weekly_item(Uuid::new_v4())]).await;

    let orders = service
        .synchronize(subscription_id, options(date(2026, 10, 1), 1, 0))
        .await
        .unwrap();
    assert_eq!(orders.len(), 1);

    sqlx::query("UPDATE subscriptions SET status = 'active' WHERE id = $1")
        .bind(subscription_id)
        .execute(&pool)
        .await
        .unwrap();

    let outcome = service.pause(subscription_id).await.unwrap();
    assert!(outcome.changed);
    assert_eq!(subscription_status(&pool, subscription_id).await, "on_hold");

    let cancelled: bool = sqlx::query_scalar("SELECT cancelled FROM deliveries WHERE id = $1")
        .bind(orders[0].delivery_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert!(cancelled);

    // a held subscription plans nothing
    let held = service
        .synchronize(subscription_id, options(date(2026, 10, 10), 1, 0))
        .await
        .unwrap();
    assert!(held.is_empty());

    service.resume(subscription_id).await.unwrap();
    assert_eq!(subscription_status(&pool, subscription_id).await, "active");

    // resuming re-anchors to the requested day instead of backfilling the
    // cycles missed while on hold, then plans ahead through the default
    // horizon
    let resumed = service
        .synchronize(subscription_id, SyncOptions::resume(date(2026, 10, 20)))
        .await
        .unwrap();
    let dates: Vec<_> = resumed.iter().map(|o| o.delivery_date).collect();
    assert_eq!(dates, vec![date(2026, 10, 20), date(2026, 10, 27)]);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn cancel_closes_open_deliveries_and_payments(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let merchant_id = seed_any_day_merchant(&pool).await;
    let service = SubscriptionService::new(pool.clone(), Collaborators::stubbed());
    let subscription_id =
        create_subscription(&service, merchant_id, vec![weekly_item(Uuid::new_v4())]).await;

    let orders = service
        .synchronize(subscription_id, options(date(2026, 10, 1), 1, 0))
        .await
        .unwrap();
    sqlx::query("UPDATE subscriptions SET status = 'active' WHERE id = $1")
        .bind(subscription_id)
        .execute(&pool)
        .await
        .unwrap();

    let payment_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO payments (id, order_id, subscription_id, status, amount_cents, currency, settling_attempts)
        VALUES ($1, $2, $3, 'failed', 500, 'EUR', 1)
        "#,
    )
    .bind(payment_id)
    .bind(orders[0].order_id)
    .bind(subscription_id)
    .execute(&pool)
    .await
    .unwrap();

    let outcome = service.cancel(subscription_id).await.unwrap();
    assert!(outcome.changed);
    assert_eq!(subscription_status(&pool, subscription_id).await, "cancelled");

    let payment_status: String =
        sqlx::query_scalar("SELECT status::TEXT FROM payments WHERE id = $1")
            .bind(payment_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(payment_status, "cancelled");

    let delivery_cancelled: bool =
        sqlx::query_scalar("SELECT cancelled FROM deliveries WHERE id = $1")
            .bind(orders[0].delivery_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert!(delivery_cancelled);

    // cancellation is terminal; a second cancel changes nothing
    let again = service.cancel(subscription_id).await.unwrap();
    assert!(!again.changed);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn recipe_edits_are_validated_and_last_item_is_kept(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let merchant_id = seed_any_day_merchant(&pool).await;
    let service = SubscriptionService::new(pool.clone(), Collaborators::stubbed());
    let first_product = Uuid::new_v4();
    let subscription_id =
        create_subscription(&service, merchant_id, vec![weekly_item(first_product)]).await;

    let added = service
        .add_recipe_item(subscription_id, weekly_item(Uuid::new_v4()))
        .await
        .unwrap();

    let updated = service
        .update_recipe_item(
            subscription_id,
            added.id,
            RecipeItemUpdate {
                quantity: Some(3),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.quantity, 3);

    let err = service
        .update_recipe_item(
            subscription_id,
            added.id,
            RecipeItemUpdate {
                quantity: Some(0),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Config(_)));

    service
        .remove_recipe_item(subscription_id, added.id)
        .await
        .unwrap();

    let first_item_id: Uuid =
        sqlx::query_scalar("SELECT id FROM recipe_items WHERE subscription_id = $1")
            .bind(subscription_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    let err = service
        .remove_recipe_item(subscription_id, first_item_id)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Config(_)));

    let remaining: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM recipe_items WHERE subscription_id = $1")
            .bind(subscription_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(remaining, 1);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn daily_run_charges_due_delivery_and_activates(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let merchant_id = seed_any_day_merchant(&pool).await;
    let collaborators = Collaborators::stubbed();
    let service = SubscriptionService::new(pool.clone(), collaborators.clone());
    let subscription_id = create_subscription(
        &service,
        merchant_id,
        vec![
            NewRecipeItem {
                product_id: Uuid::new_v4(),
                quantity: 2,
                unit_price_cents: 450,
                frequency_count: 1,
                frequency_unit: FrequencyUnit::Months,
            },
            NewRecipeItem {
                product_id: Uuid::new_v4(),
                quantity: 1,
                unit_price_cents: 300,
                frequency_count: 1,
                frequency_unit: FrequencyUnit::Months,
            },
        ],
    )
    .await;

    // the checkout flow materializes the first order up front
    let orders = service
        .synchronize(subscription_id, options(date(2026, 10, 1), 4, 7))
        .await
        .unwrap();
    assert_eq!(orders.len(), 1);
    assert_eq!(subscription_status(&pool, subscription_id).await, "incomplete");

    let now = Utc.with_ymd_and_hms(2026, 10, 1, 5, 0, 0).unwrap();
    let report = run_daily_billing(&pool, &collaborators, merchant_id, now)
        .await
        .unwrap();
    assert_eq!(report.charges_attempted, 1);
    assert_eq!(report.charges_settled, 1);
    assert_eq!(report.charges_failed, 0);

    // the first settled payment activates the subscription
    assert_eq!(subscription_status(&pool, subscription_id).await, "active");

    let (payment_status, amount, attempts): (String, i64, i32) = sqlx::query_as(
        "SELECT status::TEXT, amount_cents, settling_attempts FROM payments WHERE order_id = $1",
    )
    .bind(orders[0].order_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(payment_status, "settled");
    assert_eq!(amount, 2 * 450 + 300);
    assert_eq!(attempts, 1);

    // repeating the run for the same day is a no-op
    let repeat = run_daily_billing(&pool, &collaborators, merchant_id, now)
        .await
        .unwrap();
    assert_eq!(
        repeat,
        DailyBillingReport {
            merchant_id,
            ..Default::default()
        }
    );
}
