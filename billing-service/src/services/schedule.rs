//! Recurrence date math for recurring invoice schedules.
//!
//! The single entry point is [`next_occurrence`], which always returns a
//! date strictly after the date it was given. The sweep relies on that to
//! guarantee forward progress: advancing a due schedule can never leave its
//! `next_send_date` due again in the same run.

use chrono::{Datelike, Duration, Months, NaiveDate};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("Invalid recurrence interval: {0}")]
    InvalidInterval(String),

    #[error("Invalid day of week: {0}")]
    InvalidDayOfWeek(i32),

    #[error("Invalid day of month: {0}")]
    InvalidDayOfMonth(i32),

    #[error("Date arithmetic out of range advancing from {0}")]
    DateOutOfRange(NaiveDate),
}

/// Supported recurrence intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecurrenceInterval {
    Day,
    Week,
    Month,
    Year,
}

impl RecurrenceInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecurrenceInterval::Day => "day",
            RecurrenceInterval::Week => "week",
            RecurrenceInterval::Month => "month",
            RecurrenceInterval::Year => "year",
        }
    }

    /// Unlike status strings, an unknown interval is an error rather than a
    /// default. A schedule with a bad interval must fail loudly instead of
    /// silently issuing invoices on the wrong cadence.
    pub fn parse(s: &str) -> Result<Self, ScheduleError> {
        match s {
            "day" => Ok(RecurrenceInterval::Day),
            "week" => Ok(RecurrenceInterval::Week),
            "month" => Ok(RecurrenceInterval::Month),
            "year" => Ok(RecurrenceInterval::Year),
            other => Err(ScheduleError::InvalidInterval(other.to_string())),
        }
    }
}

/// Compute the next send date strictly after `from`.
///
/// Rules per interval:
/// - `day`: the following day.
/// - `week`: the next strictly-future occurrence of `day_of_week`
///   (0 = Sunday .. 6 = Saturday); without an anchor, seven days out.
///   An anchor equal to today's weekday means next week, never today.
/// - `month`: one calendar month ahead. With a `day_of_month` anchor the
///   result lands on that day of the next month, clamped to its last day
///   (anchor 31 from January yields February 28th or 29th).
/// - `year`: one calendar year ahead, February 29th clamping to the 28th.
pub fn next_occurrence(
    from: NaiveDate,
    interval: &str,
    day_of_month: Option<i32>,
    day_of_week: Option<i32>,
) -> Result<NaiveDate, ScheduleError> {
    match RecurrenceInterval::parse(interval)? {
        RecurrenceInterval::Day => from
            .checked_add_signed(Duration::days(1))
            .ok_or(ScheduleError::DateOutOfRange(from)),

        RecurrenceInterval::Week => {
            let days_ahead = match day_of_week {
                Some(target) => {
                    if !(0..=6).contains(&target) {
                        return Err(ScheduleError::InvalidDayOfWeek(target));
                    }
                    let current = from.weekday().num_days_from_sunday() as i32;
                    let mut delta = target - current;
                    if delta <= 0 {
                        delta += 7;
                    }
                    delta as i64
                }
                None => 7,
            };
            from.checked_add_signed(Duration::days(days_ahead))
                .ok_or(ScheduleError::DateOutOfRange(from))
        }

        RecurrenceInterval::Month => {
            let base = from
                .checked_add_months(Months::new(1))
                .ok_or(ScheduleError::DateOutOfRange(from))?;
            match day_of_month {
                Some(anchor) => {
                    if !(1..=31).contains(&anchor) {
                        return Err(ScheduleError::InvalidDayOfMonth(anchor));
                    }
                    let day = (anchor as u32).min(last_day_of_month(base.year(), base.month()));
                    base.with_day(day).ok_or(ScheduleError::DateOutOfRange(from))
                }
                None => Ok(base),
            }
        }

        RecurrenceInterval::Year => from
            .checked_add_months(Months::new(12))
            .ok_or(ScheduleError::DateOutOfRange(from)),
    }
}

fn last_day_of_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn day_interval_advances_one_day() {
        assert_eq!(
            next_occurrence(date(2025, 6, 4), "day", None, None).unwrap(),
            date(2025, 6, 5)
        );
        // Across a leap day
        assert_eq!(
            next_occurrence(date(2024, 2, 28), "day", None, None).unwrap(),
            date(2024, 2, 29)
        );
    }

    #[test]
    fn week_without_anchor_advances_seven_days() {
        assert_eq!(
            next_occurrence(date(2025, 6, 4), "week", None, None).unwrap(),
            date(2025, 6, 11)
        );
    }

    #[test]
    fn week_anchor_lands_on_next_future_weekday() {
        // 2025-06-04 is a Wednesday; anchor Monday (1) lands five days later.
        let next = next_occurrence(date(2025, 6, 4), "week", None, Some(1)).unwrap();
        assert_eq!(next, date(2025, 6, 9));
        assert_eq!(next.weekday(), chrono::Weekday::Mon);
    }

    #[test]
    fn week_anchor_on_same_weekday_waits_a_full_week() {
        // Wednesday with anchor Wednesday (3) must not return the same day.
        assert_eq!(
            next_occurrence(date(2025, 6, 4), "week", None, Some(3)).unwrap(),
            date(2025, 6, 11)
        );
    }

    #[test]
    fn week_anchor_earlier_in_week_wraps_forward() {
        // Wednesday with anchor Tuesday (2) lands six days later.
        assert_eq!(
            next_occurrence(date(2025, 6, 4), "week", None, Some(2)).unwrap(),
            date(2025, 6, 10)
        );
    }

    #[test]
    fn month_anchor_clamps_to_short_months() {
        assert_eq!(
            next_occurrence(date(2025, 1, 31), "month", Some(31), None).unwrap(),
            date(2025, 2, 28)
        );
        // Leap year February keeps the 29th.
        assert_eq!(
            next_occurrence(date(2024, 1, 31), "month", Some(31), None).unwrap(),
            date(2024, 2, 29)
        );
    }

    #[test]
    fn month_anchor_lands_on_requested_day() {
        assert_eq!(
            next_occurrence(date(2025, 6, 4), "month", Some(15), None).unwrap(),
            date(2025, 7, 15)
        );
    }

    #[test]
    fn month_without_anchor_clamps_to_month_end() {
        assert_eq!(
            next_occurrence(date(2025, 8, 31), "month", None, None).unwrap(),
            date(2025, 9, 30)
        );
    }

    #[test]
    fn year_interval_clamps_leap_day() {
        assert_eq!(
            next_occurrence(date(2024, 2, 29), "year", None, None).unwrap(),
            date(2025, 2, 28)
        );
        assert_eq!(
            next_occurrence(date(2025, 6, 4), "year", None, None).unwrap(),
            date(2026, 6, 4)
        );
    }

    #[test]
    fn unknown_interval_is_rejected() {
        let err = next_occurrence(date(2025, 6, 4), "fortnight", None, None).unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidInterval(ref s) if s == "fortnight"));
    }

    #[test]
    fn out_of_range_anchors_are_rejected() {
        assert!(matches!(
            next_occurrence(date(2025, 6, 4), "week", None, Some(7)),
            Err(ScheduleError::InvalidDayOfWeek(7))
        ));
        assert!(matches!(
            next_occurrence(date(2025, 6, 4), "month", Some(0), None),
            Err(ScheduleError::InvalidDayOfMonth(0))
        ));
        assert!(matches!(
            next_occurrence(date(2025, 6, 4), "month", Some(32), None),
            Err(ScheduleError::InvalidDayOfMonth(32))
        ));
    }

    #[test]
    fn next_occurrence_is_strictly_in_the_future() {
        let dates = [
            date(2024, 2, 28),
            date(2024, 2, 29),
            date(2024, 12, 31),
            date(2025, 1, 1),
            date(2025, 1, 31),
            date(2025, 6, 4),
            date(2025, 7, 31),
        ];

        for from in dates {
            for interval in ["day", "week", "month", "year"] {
                let plain = next_occurrence(from, interval, None, None).unwrap();
                assert!(plain > from, "{} {} -> {}", from, interval, plain);
            }
            for dow in 0..=6 {
                let next = next_occurrence(from, "week", None, Some(dow)).unwrap();
                assert!(next > from, "{} week dow={} -> {}", from, dow, next);
            }
            for dom in [1, 15, 28, 29, 30, 31] {
                let next = next_occurrence(from, "month", Some(dom), None).unwrap();
                assert!(next > from, "{} month dom={} -> {}", from, dom, next);
            }
        }
    }
}
