use chrono::{Duration, Months, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// key: billing-frequency -> per-item cadence unit
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "frequency_unit", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FrequencyUnit {
    Days,
    Weeks,
    Months,
}

/// How often a recipe item recurs, e.g. every 2 weeks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Frequency {
    pub count: i32,
    pub unit: FrequencyUnit,
}

impl Frequency {
    pub fn new(count: i32, unit: FrequencyUnit) -> EngineResult<Self> {
        if count <= 0 {
            return Err(EngineError::Config(format!(
                "frequency count must be positive, got {count}"
            )));
        }
        Ok(Self { count, unit })
    }
}

/// Advances a fulfillment date by one frequency interval. Month arithmetic
/// clamps to the last day of shorter months, so Jan 31 + 1 month lands on
/// Feb 28 (or 29), never in March.
pub fn add_frequency(last: NaiveDate, frequency: &Frequency) -> NaiveDate {
    match frequency.unit {
        FrequencyUnit::Days => last + Duration::days(i64::from(frequency.count)),
        FrequencyUnit::Weeks => last + Duration::days(i64::from(frequency.count) * 7),
        FrequencyUnit::Months => last
            .checked_add_months(Months::new(frequency.count as u32))
            .unwrap_or(last),
    }
}

/// Next date an item should be fulfilled. An item never fulfilled before is
/// due at the reference date; an overdue item is due now rather than in the
/// past, which is also what re-anchors a resumed subscription to today.
pub fn next_due(
    fulfilled_until: Option<NaiveDate>,
    frequency: &Frequency,
    reference: NaiveDate,
) -> NaiveDate {
    match fulfilled_until {
        None => reference,
        Some(last) => add_frequency(last, frequency).max(reference),
    }
}
