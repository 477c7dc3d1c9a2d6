//! Recurrence calculation — pure and deterministic.
//!
//! The state machine calls this to place the successor of a published
//! recurring task. No wall clock: the result depends only on the last
//! occurrence and the rule, so retrying "schedule next occurrence" is
//! idempotent.

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, Utc};

use crate::tasks::{Recurrence, RecurrencePattern};

/// Compute the next occurrence after `last`, stamped with the rule's
/// time of day.
pub fn next_occurrence(last: DateTime<Utc>, recurrence: &Recurrence) -> DateTime<Utc> {
    let last_date = last.date_naive();

    let next_date = match recurrence.pattern {
        RecurrencePattern::Daily => last_date + Duration::days(1),
        RecurrencePattern::Weekly => {
            let mut date = last_date + Duration::days(7);
            if let Some(target) = recurrence.day_of_week {
                // 0 = Sunday. Shift forward to the target weekday,
                // never backward.
                let current = date.weekday().num_days_from_sunday();
                let shift = (7 + target - current) % 7;
                date += Duration::days(shift as i64);
            }
            date
        }
        RecurrencePattern::Monthly => {
            // checked_add_months already clamps to the end of shorter
            // months (Jan 31 + 1 month = Feb 28/29).
            let mut date = last_date
                .checked_add_months(Months::new(1))
                .unwrap_or(last_date);
            if let Some(dom) = recurrence.day_of_month {
                let clamped = dom.min(days_in_month(date.year(), date.month()));
                date = date.with_day(clamped).unwrap_or(date);
            }
            date
        }
    };

    next_date.and_time(recurrence.time_of_day).and_utc()
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .unwrap_or(28)
}
