use serde_json::{json, Value};
use sqlx::PgPool;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::adapters::NotificationSink;
use crate::error::{EngineError, EngineResult};
use crate::models::SubscriptionStatus;

/// key: subscription-lifecycle -> events driving status transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionEvent {
    PaymentSettled,
    PaymentFailedRetryable,
    PaymentFailedTerminal,
    RetriesExhausted,
    GraceExpired,
    Paused,
    Resumed,
    Cancelled,
}

impl SubscriptionEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionEvent::PaymentSettled => "payment_settled",
            SubscriptionEvent::PaymentFailedRetryable => "payment_failed_retryable",
            SubscriptionEvent::PaymentFailedTerminal => "payment_failed_terminal",
            SubscriptionEvent::RetriesExhausted => "retries_exhausted",
            SubscriptionEvent::GraceExpired => "grace_expired",
            SubscriptionEvent::Paused => "paused",
            SubscriptionEvent::Resumed => "resumed",
            SubscriptionEvent::Cancelled => "cancelled",
        }
    }
}

/// Pure transition table. Pairs not listed keep the current status, and the
/// terminal statuses absorb every event, so the function is total and can
/// never resurrect a cancelled or expired subscription.
pub fn next_status(current: SubscriptionStatus, event: SubscriptionEvent) -> SubscriptionStatus {
    use SubscriptionEvent as Ev;
    use SubscriptionStatus::*;

    if current.is_terminal() {
        return current;
    }

    match (current, event) {
        (Incomplete | PastDue, Ev::PaymentSettled) => Active,
        // recovery path: a later successful charge (forced charge of
        // delivered goods, or an operator retry) reinstates billing
        (Error, Ev::PaymentSettled) => Active,

        (Active, Ev::PaymentFailedRetryable) => PastDue,
        (Active | PastDue, Ev::PaymentFailedTerminal) => Error,
        (Active | PastDue, Ev::RetriesExhausted) => Error,

        (Active | PastDue, Ev::Paused) => OnHold,
        (OnHold, Ev::Resumed) => Active,

        (Active | PastDue | OnHold, Ev::Cancelled) => Cancelled,
        (_, Ev::GraceExpired) => Expired,

        (current, _) => current,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub previous: SubscriptionStatus,
    pub status: SubscriptionStatus,
    pub changed: bool,
}

/// Notification event emitted when a subscription enters a status.
pub fn status_event_name(status: SubscriptionStatus) -> &'static str {
    match status {
        SubscriptionStatus::Incomplete => "subscription.incomplete",
        SubscriptionStatus::Active => "subscription.activated",
        SubscriptionStatus::PastDue => "subscription.past_due",
        SubscriptionStatus::OnHold => "subscription.paused",
        SubscriptionStatus::Error => "subscription.payment_error",
        SubscriptionStatus::Expired => "subscription.expired",
        SubscriptionStatus::Cancelled => "subscription.cancelled",
    }
}

/// key: subscription-lifecycle -> atomic transition
///
/// Reads the current status, computes the next one, and applies it with a
/// single UPDATE guarded on the status the decision was made from. Two
/// racing writers cannot both win; the loser re-reads and re-decides. The
/// status notification fires exactly once, from the writer that changed the
/// row, and a failing sink is logged but never fails the transition.
pub async fn apply_event(
    pool: &PgPool,
    notifier: &dyn NotificationSink,
    subscription_id: Uuid,
    event: SubscriptionEvent,
    context: Value,
) -> EngineResult<TransitionOutcome> {
    loop {
        let current: Option<SubscriptionStatus> =
            sqlx::query_scalar("SELECT status FROM subscriptions WHERE id = $1")
                .bind(subscription_id)
                .fetch_optional(pool)
                .await?;
        let Some(current) = current else {
            return Err(EngineError::NotFound("subscription"));
        };

        let next = next_status(current, event);
        if next == current {
            debug!(
                subscription = %subscription_id,
                status = current.as_str(),
                event = event.as_str(),
                "lifecycle event left status unchanged"
            );
            return Ok(TransitionOutcome {
                previous: current,
                status: next,
                changed: false,
            });
        }

        let updated = sqlx::query(
            "UPDATE subscriptions SET status = $1, updated_at = NOW() WHERE id = $2 AND status = $3",
        )
        .bind(next)
        .bind(subscription_id)
        .bind(current)
        .execute(pool)
        .await?;

        if updated.rows_affected() == 0 {
            // lost a race; re-read and re-decide
            continue;
        }

        let mut payload = json!({
            "subscription_id": subscription_id,
            "previous_status": current,
            "status": next,
            "trigger": event.as_str(),
        });
        if let (Value::Object(base), Value::Object(extra)) = (&mut payload, context.clone()) {
            base.extend(extra);
        }
        if let Err(err) = notifier.emit(status_event_name(next), payload).await {
            warn!(?err, subscription = %subscription_id, "status notification failed");
        }

        return Ok(TransitionOutcome {
            previous: current,
            status: next,
            changed: true,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::SubscriptionEvent as Ev;
    use super::*;
    use SubscriptionStatus::*;

    #[test]
    fn first_settled_payment_activates() {
        assert_eq!(next_status(Incomplete, Ev::PaymentSettled), Active);
    }

    #[test]
    fn dunning_escalation_path() {
        assert_eq!(next_status(Active, Ev::PaymentFailedRetryable), PastDue);
        assert_eq!(next_status(PastDue, Ev::PaymentSettled), Active);
        assert_eq!(next_status(PastDue, Ev::RetriesExhausted), Error);
        assert_eq!(next_status(PastDue, Ev::PaymentFailedTerminal), Error);
        assert_eq!(next_status(Active, Ev::PaymentFailedTerminal), Error);
    }

    #[test]
    fn error_recovers_on_settlement() {
        assert_eq!(next_status(Error, Ev::PaymentSettled), Active);
    }

    #[test]
    fn pause_and_resume_round_trip() {
        assert_eq!(next_status(Active, Ev::Paused), OnHold);
        assert_eq!(next_status(PastDue, Ev::Paused), OnHold);
        assert_eq!(next_status(OnHold, Ev::Resumed), Active);
        // resuming anything else is a no-op
        assert_eq!(next_status(Active, Ev::Resumed), Active);
        assert_eq!(next_status(Incomplete, Ev::Resumed), Incomplete);
    }

    #[test]
    fn expiry_reaches_every_non_terminal_status() {
        for status in [Incomplete, Active, PastDue, OnHold, Error] {
            assert_eq!(next_status(status, Ev::GraceExpired), Expired);
        }
    }

    #[test]
    fn cancellation_applies_to_live_statuses_only() {
        for status in [Active, PastDue, OnHold] {
            assert_eq!(next_status(status, Ev::Cancelled), Cancelled);
        }
        // an abandoned checkout or a dunning dead-end keeps its status; only
        // grace expiry closes those out
        assert_eq!(next_status(Incomplete, Ev::Cancelled), Incomplete);
        assert_eq!(next_status(Error, Ev::Cancelled), Error);
    }

    #[test]
    fn terminal_statuses_absorb_every_event() {
        let events = [
            Ev::PaymentSettled,
            Ev::PaymentFailedRetryable,
            Ev::PaymentFailedTerminal,
            Ev::RetriesExhausted,
            Ev::GraceExpired,
            Ev::Paused,
            Ev::Resumed,
            Ev::Cancelled,
        ];
        for status in [Expired, Cancelled] {
            for event in events {
                assert_eq!(next_status(status, event), status);
            }
        }
    }

    #[test]
    fn repeated_retryable_failures_stay_past_due() {
        assert_eq!(next_status(PastDue, Ev::PaymentFailedRetryable), PastDue);
    }

    #[test]
    fn incomplete_failures_stay_incomplete() {
        // a failed first charge keeps checkout state; dunning only escalates
        // subscriptions that settled at least once
        assert_eq!(next_status(Incomplete, Ev::PaymentFailedRetryable), Incomplete);
        assert_eq!(next_status(Incomplete, Ev::PaymentFailedTerminal), Incomplete);
    }

    #[test]
    fn paused_subscriptions_ignore_payment_outcomes() {
        assert_eq!(next_status(OnHold, Ev::PaymentFailedRetryable), OnHold);
        assert_eq!(next_status(OnHold, Ev::PaymentSettled), OnHold);
    }

    #[test]
    fn every_status_is_reachable_from_incomplete() {
        let active = next_status(Incomplete, Ev::PaymentSettled);
        assert_eq!(active, Active);
        let past_due = next_status(active, Ev::PaymentFailedRetryable);
        assert_eq!(past_due, PastDue);
        let on_hold = next_status(active, Ev::Paused);
        assert_eq!(on_hold, OnHold);
        let error = next_status(past_due, Ev::RetriesExhausted);
        assert_eq!(error, Error);
        assert_eq!(next_status(error, Ev::GraceExpired), Expired);
        assert_eq!(next_status(on_hold, Ev::Cancelled), Cancelled);
    }
}
