use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, NaiveDate, Timelike, Utc};
use serde::Serialize;
use serde_json::json;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapters::{ChargeRequest, ChargeResponse, Collaborators};
use crate::config;
use crate::error::{EngineError, EngineResult};
use crate::lifecycle::{self, SubscriptionEvent};
use crate::merchants;
use crate::models::{Merchant, Payment, PaymentStatus, SubscriptionStatus};
use crate::subscriptions::{fetch_subscription, SubscriptionService, SyncOptions};

use super::classify::{classify, ChargeClass};

/// What one daily run did for one merchant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DailyBillingReport {
    pub merchant_id: Uuid,
    pub orders_materialized: usize,
    /// First charges against newly due deliveries.
    pub charges_attempted: usize,
    /// Settled outcomes across first charges and retries.
    pub charges_settled: usize,
    /// Failed outcomes across first charges and retries.
    pub charges_failed: usize,
    pub retries_attempted: usize,
    pub deliveries_rescheduled: usize,
    pub retries_exhausted: usize,
    pub payments_expired: usize,
}

/// key: dunning-orchestrator -> one tenant's daily run
///
/// Four phases in a fixed order: materialize upcoming orders, charge newly
/// due deliveries, work failed payments (reschedule, retry, give up), and
/// write off payments that outlived the grace period. Each phase only acts
/// on rows that still need it, so repeating the run for the same day after
/// a crash does not double-charge or double-count.
pub async fn run_daily_billing(
    pool: &PgPool,
    collaborators: &Collaborators,
    merchant_id: Uuid,
    now: DateTime<Utc>,
) -> EngineResult<DailyBillingReport> {
    let merchant = merchants::fetch_merchant(pool, merchant_id).await?;
    let today = now.date_naive();
    let mut report = DailyBillingReport {
        merchant_id,
        ..Default::default()
    };

    materialize_phase(pool, collaborators, &merchant, today, &mut report).await?;
    charge_new_phase(pool, collaborators, &merchant, now, &mut report).await?;
    retry_phase(pool, collaborators, &merchant, now, &mut report).await?;
    expire_phase(pool, collaborators, &merchant, now, &mut report).await?;

    info!(
        merchant = %merchant.id,
        orders_materialized = report.orders_materialized,
        charges_attempted = report.charges_attempted,
        charges_settled = report.charges_settled,
        charges_failed = report.charges_failed,
        retries_attempted = report.retries_attempted,
        deliveries_rescheduled = report.deliveries_rescheduled,
        retries_exhausted = report.retries_exhausted,
        payments_expired = report.payments_expired,
        "daily billing run finished"
    );
    Ok(report)
}

/// Phase 1: plan and write upcoming orders for every active subscription.
/// A failure for one subscription is logged and the sweep moves on.
async fn materialize_phase(
    pool: &PgPool,
    collaborators: &Collaborators,
    merchant: &Merchant,
    today: NaiveDate,
    report: &mut DailyBillingReport,
) -> EngineResult<()> {
    let subscription_ids: Vec<Uuid> = sqlx::query_scalar(
        r#"
        SELECT id FROM subscriptions
        WHERE merchant_id = $1 AND status = 'active'
        ORDER BY created_at, id
        "#,
    )
    .bind(merchant.id)
    .fetch_all(pool)
    .await?;

    let service = SubscriptionService::new(pool.clone(), collaborators.clone());
    for subscription_id in subscription_ids {
        match service
            .synchronize(subscription_id, SyncOptions::daily(today))
            .await
        {
            Ok(orders) => report.orders_materialized += orders.len(),
            Err(err) => {
                warn!(?err, subscription = %subscription_id, "sync failed; run continues");
            }
        }
    }
    Ok(())
}

#[derive(Debug, FromRow)]
struct DueDelivery {
    order_id: Uuid,
    subscription_id: Uuid,
}

/// Phase 2: every delivery due today or earlier gets a payment row and a
/// first charge. A delivery already handed out or cancelled is out of
/// scope here; delivered orders are only ever charged through the retry
/// phase, off their existing payment.
async fn charge_new_phase(
    pool: &PgPool,
    collaborators: &Collaborators,
    merchant: &Merchant,
    now: DateTime<Utc>,
    report: &mut DailyBillingReport,
) -> EngineResult<()> {
    let today = now.date_naive();
    let due = sqlx::query_as::<_, DueDelivery>(
        r#"
        SELECT d.order_id, d.subscription_id
        FROM deliveries d
        JOIN subscriptions s ON s.id = d.subscription_id
        LEFT JOIN payments p ON p.order_id = d.order_id
        WHERE s.merchant_id = $1
          AND d.delivery_date <= $2
          AND NOT d.delivered
          AND NOT d.cancelled
          AND s.status IN ('incomplete', 'active', 'past_due')
          AND (p.id IS NULL OR p.status = 'pending')
        ORDER BY d.delivery_date, d.id
        "#,
    )
    .bind(merchant.id)
    .bind(today)
    .fetch_all(pool)
    .await?;

    for row in due {
        let payment =
            ensure_payment(pool, merchant, row.order_id, row.subscription_id, now).await?;
        if payment.status != PaymentStatus::Pending {
            continue;
        }
        if let Some(class) = attempt_charge(pool, collaborators, &payment, now).await? {
            report.charges_attempted += 1;
            match class {
                ChargeClass::Settled => report.charges_settled += 1,
                _ => report.charges_failed += 1,
            }
        }
    }
    Ok(())
}

/// Creates the pending payment for an order if it does not exist yet. The
/// amount is the sum of the order's line totals at materialization prices.
/// The row is stamped with the run's clock so a backdated run ages its
/// payments from that day, not from the wall clock.
async fn ensure_payment(
    pool: &PgPool,
    merchant: &Merchant,
    order_id: Uuid,
    subscription_id: Uuid,
    now: DateTime<Utc>,
) -> EngineResult<Payment> {
    sqlx::query(
        r#"
        INSERT INTO payments (id, order_id, subscription_id, status, amount_cents, currency, created_at)
        SELECT $1, $2, $3, 'pending',
               COALESCE(SUM(quantity::BIGINT * unit_price_cents), 0), $4, $5
        FROM order_items
        WHERE order_id = $2
        ON CONFLICT (order_id) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(order_id)
    .bind(subscription_id)
    .bind(&merchant.currency)
    .bind(now)
    .execute(pool)
    .await?;

    let payment = sqlx::query_as::<_, Payment>(
        r#"
        SELECT id, order_id, subscription_id, status, amount_cents, currency,
               settling_attempts, last_attempt, last_error_code, processor_response,
               created_at, updated_at
        FROM payments
        WHERE order_id = $1
        "#,
    )
    .bind(order_id)
    .fetch_optional(pool)
    .await?;

    payment.ok_or(EngineError::NotFound("payment"))
}

/// Runs one charge against the processor and folds the outcome back into
/// the payment row and the subscription lifecycle. Returns `None` when the
/// payment is already resolved or the subscription left a billable state
/// after the batch was selected.
async fn attempt_charge(
    pool: &PgPool,
    collaborators: &Collaborators,
    payment: &Payment,
    now: DateTime<Utc>,
) -> EngineResult<Option<ChargeClass>> {
    if payment.status.is_resolved() {
        debug!(payment = %payment.id, "payment already resolved, nothing to charge");
        return Ok(None);
    }

    let subscription = fetch_subscription(pool, payment.subscription_id).await?;
    if !matches!(
        subscription.status,
        SubscriptionStatus::Incomplete | SubscriptionStatus::Active | SubscriptionStatus::PastDue
    ) {
        debug!(
            payment = %payment.id,
            status = subscription.status.as_str(),
            "charge suppressed for non-billable subscription"
        );
        return Ok(None);
    }

    let attempt_number = payment.settling_attempts + 1;
    let request = ChargeRequest {
        payment_id: payment.id,
        amount_cents: payment.amount_cents,
        currency: payment.currency.clone(),
        reference: format!("{}:{}", payment.id, attempt_number),
        payment_token: subscription.payment_token.clone(),
    };

    let timeout = StdDuration::from_secs(*config::BILLING_PROCESSOR_TIMEOUT_SECS);
    let response =
        match tokio::time::timeout(timeout, collaborators.processor.charge(request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                warn!(?err, payment = %payment.id, "processor rejected the charge call");
                ChargeResponse {
                    success: false,
                    error_code: Some("processor_unreachable".into()),
                    raw: json!({ "transport_error": err.to_string() }),
                }
            }
            Err(_) => {
                warn!(payment = %payment.id, "processor call timed out");
                ChargeResponse {
                    success: false,
                    error_code: Some("processor_timeout".into()),
                    raw: json!({ "timed_out": true }),
                }
            }
        };

    let class = classify(response.success, response.error_code.as_deref());
    let status = match class {
        ChargeClass::Settled => PaymentStatus::Settled,
        ChargeClass::Retryable | ChargeClass::Terminal => PaymentStatus::Failed,
    };

    sqlx::query(
        r#"
        UPDATE payments
        SET status = $2,
            settling_attempts = settling_attempts + 1,
            last_attempt = $3,
            last_error_code = $4,
            processor_response = $5,
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(payment.id)
    .bind(status)
    .bind(now)
    .bind(&response.error_code)
    .bind(&response.raw)
    .execute(pool)
    .await?;

    let event = match class {
        ChargeClass::Settled => SubscriptionEvent::PaymentSettled,
        ChargeClass::Retryable => SubscriptionEvent::PaymentFailedRetryable,
        ChargeClass::Terminal => SubscriptionEvent::PaymentFailedTerminal,
    };
    lifecycle::apply_event(
        pool,
        collaborators.notifier.as_ref(),
        subscription.id,
        event,
        json!({
            "payment_id": payment.id,
            "order_id": payment.order_id,
            "amount_cents": payment.amount_cents,
            "currency": payment.currency,
            "attempt": attempt_number,
            "error_code": response.error_code,
        }),
    )
    .await?;

    if class == ChargeClass::Settled {
        info!(payment = %payment.id, attempt = attempt_number, "payment settled");
    } else {
        info!(
            payment = %payment.id,
            attempt = attempt_number,
            error_code = response.error_code.as_deref().unwrap_or("none"),
            "payment failed"
        );
    }
    Ok(Some(class))
}

#[derive(Debug, FromRow)]
struct RetryCandidate {
    payment_id: Uuid,
    subscription_id: Uuid,
    delivery_id: Uuid,
    delivery_date: NaiveDate,
    delivered: bool,
    settling_attempts: i32,
    last_attempt: Option<DateTime<Utc>>,
}

/// Phase 3: work the failed payments. Undelivered orders past the attempt
/// budget give up, overdue undelivered orders are pushed to a fresh
/// delivery date instead of being charged again, and everything else gets
/// at most one attempt per day. A delivered order is charged regardless of
/// the budget; the goods are gone.
async fn retry_phase(
    pool: &PgPool,
    collaborators: &Collaborators,
    merchant: &Merchant,
    now: DateTime<Utc>,
    report: &mut DailyBillingReport,
) -> EngineResult<()> {
    let today = now.date_naive();
    let window_start = today - Duration::days(*config::BILLING_RETRY_LOOKBACK_DAYS);
    let window_end = today + Duration::days(*config::BILLING_RETRY_LOOKAHEAD_DAYS);

    let candidates = sqlx::query_as::<_, RetryCandidate>(
        r#"
        SELECT p.id AS payment_id, p.subscription_id, d.id AS delivery_id,
               d.delivery_date, d.delivered, p.settling_attempts, p.last_attempt
        FROM payments p
        JOIN deliveries d ON d.order_id = p.order_id
        JOIN subscriptions s ON s.id = p.subscription_id
        WHERE s.merchant_id = $1
          AND p.status = 'failed'
          AND NOT d.cancelled
          AND d.delivery_date BETWEEN $2 AND $3
          AND s.status IN ('active', 'past_due')
        ORDER BY d.delivery_date, p.id
        "#,
    )
    .bind(merchant.id)
    .bind(window_start)
    .bind(window_end)
    .fetch_all(pool)
    .await?;

    for candidate in candidates {
        if !candidate.delivered && candidate.settling_attempts >= merchant.max_settling_attempts {
            let outcome = lifecycle::apply_event(
                pool,
                collaborators.notifier.as_ref(),
                candidate.subscription_id,
                SubscriptionEvent::RetriesExhausted,
                json!({ "payment_id": candidate.payment_id }),
            )
            .await?;
            if outcome.changed {
                report.retries_exhausted += 1;
            }
            continue;
        }

        if !candidate.delivered && candidate.delivery_date < today {
            let new_date = reschedule_delivery(pool, merchant, &candidate, today).await?;
            report.deliveries_rescheduled += 1;
            if new_date > today {
                continue;
            }
            // zero lead time lands the delivery on today; charge it now
        }

        if !retry_permitted(
            candidate.last_attempt,
            now,
            *config::BILLING_RETRY_CUTOFF_HOUR,
        ) {
            debug!(payment = %candidate.payment_id, "retry already spent for today");
            continue;
        }

        let payment = sqlx::query_as::<_, Payment>(
            r#"
            SELECT id, order_id, subscription_id, status, amount_cents, currency,
                   settling_attempts, last_attempt, last_error_code, processor_response,
                   created_at, updated_at
            FROM payments
            WHERE id = $1
            "#,
        )
        .bind(candidate.payment_id)
        .fetch_optional(pool)
        .await?;
        let Some(payment) = payment else {
            continue;
        };
        if payment.status != PaymentStatus::Failed {
            continue;
        }

        let Some(class) = attempt_charge(pool, collaborators, &payment, now).await? else {
            continue;
        };
        report.retries_attempted += 1;
        match class {
            ChargeClass::Settled => report.charges_settled += 1,
            _ => {
                report.charges_failed += 1;
                if !candidate.delivered
                    && payment.settling_attempts + 1 >= merchant.max_settling_attempts
                {
                    let outcome = lifecycle::apply_event(
                        pool,
                        collaborators.notifier.as_ref(),
                        candidate.subscription_id,
                        SubscriptionEvent::RetriesExhausted,
                        json!({ "payment_id": candidate.payment_id }),
                    )
                    .await?;
                    if outcome.changed {
                        report.retries_exhausted += 1;
                    }
                }
            }
        }
    }
    Ok(())
}

/// key: dunning-retry-gate -> at most one attempt per payment per day
///
/// A payment never attempted may always be tried, as may one last tried on
/// an earlier day. Within the same day a further attempt is allowed only
/// while the run's own clock is before the cutoff hour, which keeps manual
/// afternoon re-runs from burning the daily attempt twice.
pub fn retry_permitted(
    last_attempt: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    cutoff_hour: u32,
) -> bool {
    let Some(last) = last_attempt else {
        return true;
    };
    if last.date_naive() < now.date_naive() {
        return true;
    }
    now.hour() < cutoff_hour
}

/// Moves an unpaid, undelivered delivery off its past date onto the next
/// allowed one, so settling later does not promise a hand-off in the past.
/// Returns the new date.
async fn reschedule_delivery(
    pool: &PgPool,
    merchant: &Merchant,
    candidate: &RetryCandidate,
    today: NaiveDate,
) -> EngineResult<NaiveDate> {
    let allowed: Option<Vec<i32>> =
        sqlx::query_scalar("SELECT allowed_weekdays FROM subscriptions WHERE id = $1")
            .bind(candidate.subscription_id)
            .fetch_one(pool)
            .await?;
    let schedule = merchant.recurring_schedule(allowed.as_deref())?;
    let next_date = schedule.align(today);

    sqlx::query("UPDATE deliveries SET delivery_date = $2, updated_at = NOW() WHERE id = $1")
        .bind(candidate.delivery_id)
        .bind(next_date)
        .execute(pool)
        .await?;

    info!(
        delivery = %candidate.delivery_id,
        from = %candidate.delivery_date,
        to = %next_date,
        "unpaid delivery pushed forward"
    );
    Ok(next_date)
}

#[derive(Debug, FromRow)]
struct StalePayment {
    payment_id: Uuid,
    order_id: Uuid,
    subscription_id: Uuid,
    delivery_id: Uuid,
    delivered: bool,
}

/// Phase 4: payments still open after the merchant's grace period are
/// written off. The undelivered order is cancelled and its stock released;
/// a delivered order keeps its delivery record and only loses the claim.
async fn expire_phase(
    pool: &PgPool,
    collaborators: &Collaborators,
    merchant: &Merchant,
    now: DateTime<Utc>,
    report: &mut DailyBillingReport,
) -> EngineResult<()> {
    let deadline = now - Duration::days(i64::from(merchant.failed_payment_cancel_days));
    let stale = sqlx::query_as::<_, StalePayment>(
        r#"
        SELECT p.id AS payment_id, p.order_id, p.subscription_id,
               d.id AS delivery_id, d.delivered
        FROM payments p
        JOIN deliveries d ON d.order_id = p.order_id
        JOIN subscriptions s ON s.id = p.subscription_id
        WHERE s.merchant_id = $1
          AND p.status IN ('pending', 'failed')
          AND p.created_at < $2
        ORDER BY p.created_at, p.id
        "#,
    )
    .bind(merchant.id)
    .bind(deadline)
    .fetch_all(pool)
    .await?;

    for row in stale {
        let mut tx: Transaction<'_, Postgres> = pool.begin().await?;
        let written_off = sqlx::query(
            r#"
            UPDATE payments
            SET status = 'cancelled', updated_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'failed')
            "#,
        )
        .bind(row.payment_id)
        .execute(&mut *tx)
        .await?;
        if written_off.rows_affected() == 0 {
            continue;
        }
        if !row.delivered {
            sqlx::query(
                r#"
                UPDATE deliveries
                SET cancelled = TRUE, updated_at = NOW()
                WHERE id = $1 AND NOT delivered AND NOT cancelled
                "#,
            )
            .bind(row.delivery_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        if !row.delivered {
            if let Err(err) = collaborators.inventory.release(row.order_id).await {
                warn!(?err, order = %row.order_id, "inventory release failed");
            }
        }

        lifecycle::apply_event(
            pool,
            collaborators.notifier.as_ref(),
            row.subscription_id,
            SubscriptionEvent::GraceExpired,
            json!({ "payment_id": row.payment_id, "order_id": row.order_id }),
        )
        .await?;

        report.payments_expired += 1;
        info!(
            payment = %row.payment_id,
            subscription = %row.subscription_id,
            delivered = row.delivered,
            "grace period over; payment written off"
        );
    }
    Ok(())
}
