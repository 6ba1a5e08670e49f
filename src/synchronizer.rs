use std::collections::HashMap;

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::frequency::{next_due, Frequency};

/// key: delivery-schedule -> weekday alignment with packing lead time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliverySchedule {
    weekdays: Vec<Weekday>,
    lead_time_days: i64,
}

impl DeliverySchedule {
    pub fn new(weekdays: Vec<Weekday>, lead_time_days: i64) -> EngineResult<Self> {
        if weekdays.is_empty() {
            return Err(EngineError::Config(
                "delivery schedule has no allowed weekdays".into(),
            ));
        }
        if lead_time_days < 0 {
            return Err(EngineError::Config(format!(
                "lead time must not be negative, got {lead_time_days}"
            )));
        }
        Ok(Self {
            weekdays,
            lead_time_days,
        })
    }

    /// Builds a schedule from ISO weekday numbers (1 = Monday .. 7 = Sunday),
    /// the representation stored on merchant and subscription rows.
    pub fn from_iso_weekdays(weekdays: &[i32], lead_time_days: i64) -> EngineResult<Self> {
        let mut converted = Vec::with_capacity(weekdays.len());
        for &number in weekdays {
            converted.push(weekday_from_iso(number)?);
        }
        Self::new(converted, lead_time_days)
    }

    /// Earliest allowed delivery date when packing starts at `anchor`: the
    /// lead time is added first, then the date moves forward to an allowed
    /// weekday, wrapping into the next week when none is left in the current
    /// one.
    pub fn align(&self, anchor: NaiveDate) -> NaiveDate {
        let earliest = anchor + Duration::days(self.lead_time_days);
        let mut candidate = earliest;
        for _ in 0..7 {
            if self.weekdays.contains(&candidate.weekday()) {
                return candidate;
            }
            candidate += Duration::days(1);
        }
        // constructor guarantees at least one allowed weekday
        earliest
    }
}

pub fn weekday_from_iso(number: i32) -> EngineResult<Weekday> {
    match number {
        1 => Ok(Weekday::Mon),
        2 => Ok(Weekday::Tue),
        3 => Ok(Weekday::Wed),
        4 => Ok(Weekday::Thu),
        5 => Ok(Weekday::Fri),
        6 => Ok(Weekday::Sat),
        7 => Ok(Weekday::Sun),
        other => Err(EngineError::Config(format!(
            "invalid ISO weekday {other}, expected 1-7"
        ))),
    }
}

/// One recipe item projected into the planner.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncItem {
    pub recipe_item_id: Uuid,
    pub product_id: Uuid,
    pub quantity: i32,
    pub unit_price_cents: i32,
    pub frequency: Frequency,
}

/// A not-yet-materialized order: which items ship together and when.
#[derive(Debug, Clone, PartialEq)]
pub struct PreliminaryOrder {
    /// Earliest due date in the batch, before weekday alignment.
    pub anchor_date: NaiveDate,
    /// Aligned date the order is handed to the customer; also the charge
    /// date.
    pub delivery_date: NaiveDate,
    pub items: Vec<SyncItem>,
}

#[derive(Debug, Clone)]
struct PlannedItem {
    item: SyncItem,
    fulfilled_until: Option<NaiveDate>,
}

/// key: delivery-synchronizer -> greedy window merge
///
/// Lazily yields upcoming orders for one subscription. Each step takes the
/// earliest due item as the anchor, batches every item due strictly within
/// the joinable window of that anchor, aligns the batch onto an allowed
/// weekday, and advances the in-memory cursors of the batched items to the
/// aligned date. The walk never ends for a non-empty recipe; callers bound
/// it by order count and horizon.
pub struct SyncPlan {
    items: Vec<PlannedItem>,
    reference: NaiveDate,
    joinable_window_days: i64,
    first_order: Option<DeliverySchedule>,
    recurring: DeliverySchedule,
}

impl SyncPlan {
    /// `cursors` maps product ids to their persisted fulfilled-until dates;
    /// items without a cursor are due immediately. When `first_order` is
    /// given it replaces the recurring schedule for the first emitted batch
    /// only.
    pub fn new(
        items: Vec<SyncItem>,
        cursors: &HashMap<Uuid, NaiveDate>,
        reference: NaiveDate,
        joinable_window_days: i64,
        recurring: DeliverySchedule,
        first_order: Option<DeliverySchedule>,
    ) -> Self {
        let items = items
            .into_iter()
            .map(|item| PlannedItem {
                fulfilled_until: cursors.get(&item.product_id).copied(),
                item,
            })
            .collect();
        Self {
            items,
            reference,
            joinable_window_days,
            first_order,
            recurring,
        }
    }
}

impl Iterator for SyncPlan {
    type Item = PreliminaryOrder;

    fn next(&mut self) -> Option<PreliminaryOrder> {
        if self.items.is_empty() {
            return None;
        }

        let due_dates: Vec<NaiveDate> = self
            .items
            .iter()
            .map(|planned| {
                next_due(
                    planned.fulfilled_until,
                    &planned.item.frequency,
                    self.reference,
                )
            })
            .collect();
        let anchor = *due_dates.iter().min()?;

        let delivery_date = match self.first_order.take() {
            Some(first) => first.align(anchor),
            None => self.recurring.align(anchor),
        };

        let mut items = Vec::new();
        for (planned, due) in self.items.iter_mut().zip(due_dates) {
            if (due - anchor).num_days() < self.joinable_window_days {
                items.push(planned.item.clone());
                planned.fulfilled_until = Some(delivery_date);
            }
        }

        Some(PreliminaryOrder {
            anchor_date: anchor,
            delivery_date,
            items,
        })
    }
}
