//! Occurrence calculator for time-based triggers.
//! Supports: "every N minutes/days/weeks/months" and "daily/weekly/monthly at HH:MM".
//! All arithmetic is UTC; tenant display timezones live outside this layer.
//!
//! Pure functions only. The caller supplies `now` and the last fire time.

use std::sync::LazyLock;

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, NaiveTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const MIN_EVERY_VALUE: u32 = 1;
pub const MAX_EVERY_VALUE: u32 = 10_000;

static HHMM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([01]?\d|2[0-3]):([0-5]\d)$").expect("valid HH:MM regex"));

/// Unit for recurring "every N" schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EveryUnit {
    Minutes,
    Days,
    Weeks,
    Months,
}

/// Calendar slot for "specific time" schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum SpecificKind {
    Daily,
    /// 0 = Sunday .. 6 = Saturday.
    Weekly { weekday: u32 },
    /// 1..=31, clamped to the month's length.
    Monthly { day_of_month: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecificSchedule {
    pub kind: SpecificKind,
    pub at: NaiveTime,
}

/// Normalized schedule for a `scheduled_time` trigger node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "mode")]
pub enum ScheduleConfig {
    Every { value: u32, unit: EveryUnit },
    Specific(SpecificSchedule),
}

impl ScheduleConfig {
    pub fn every(value: i64, unit: EveryUnit) -> Self {
        ScheduleConfig::Every {
            value: clamp_every_value(value),
            unit,
        }
    }

    pub fn daily(at: NaiveTime) -> Self {
        ScheduleConfig::Specific(SpecificSchedule {
            kind: SpecificKind::Daily,
            at,
        })
    }

    pub fn weekly(weekday: i64, at: NaiveTime) -> Self {
        ScheduleConfig::Specific(SpecificSchedule {
            kind: SpecificKind::Weekly {
                weekday: weekday.clamp(0, 6) as u32,
            },
            at,
        })
    }

    pub fn monthly(day_of_month: i64, at: NaiveTime) -> Self {
        ScheduleConfig::Specific(SpecificSchedule {
            kind: SpecificKind::Monthly {
                day_of_month: day_of_month.clamp(1, 31) as u32,
            },
            at,
        })
    }
}

pub fn clamp_every_value(value: i64) -> u32 {
    value.clamp(MIN_EVERY_VALUE as i64, MAX_EVERY_VALUE as i64) as u32
}

/// Default slot time when "HH:MM" is missing or malformed.
pub fn default_time_of_day() -> NaiveTime {
    NaiveTime::from_hms_opt(9, 0, 0).unwrap_or(NaiveTime::MIN)
}

/// Strict 24h "HH:MM" parse. Falls back to 09:00.
pub fn parse_time_of_day(raw: &str) -> NaiveTime {
    let Some(caps) = HHMM.captures(raw.trim()) else {
        if !raw.trim().is_empty() {
            tracing::warn!("Invalid trigger time '{}', using 09:00", raw);
        }
        return default_time_of_day();
    };
    let hour: u32 = caps[1].parse().unwrap_or(9);
    let minute: u32 = caps[2].parse().unwrap_or(0);
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or_else(default_time_of_day)
}

/// Calendar-month addition. The day is clamped to the destination month
/// (Jan 31 + 1 month = Feb 28/29).
pub fn add_months(at: DateTime<Utc>, months: u32) -> DateTime<Utc> {
    at.checked_add_months(Months::new(months))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn every_step(value: u32, unit: EveryUnit) -> Duration {
    match unit {
        EveryUnit::Minutes => Duration::minutes(value as i64),
        EveryUnit::Days => Duration::days(value as i64),
        EveryUnit::Weeks => Duration::weeks(value as i64),
        // Handled separately by add_months.
        EveryUnit::Months => Duration::zero(),
    }
}

fn every_next(value: u32, unit: EveryUnit, last: DateTime<Utc>) -> DateTime<Utc> {
    match unit {
        EveryUnit::Months => add_months(last, value),
        _ => last
            .checked_add_signed(every_step(value, unit))
            .unwrap_or(DateTime::<Utc>::MAX_UTC),
    }
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}

fn monthly_slot(year: i32, month: u32, day_of_month: u32, at: NaiveTime) -> Option<DateTime<Utc>> {
    let day = day_of_month.clamp(1, days_in_month(year, month));
    NaiveDate::from_ymd_opt(year, month, day).map(|d| d.and_time(at).and_utc())
}

fn previous_month(year: i32, month: u32) -> (i32, u32) {
    if month == 1 { (year - 1, 12) } else { (year, month - 1) }
}

fn following_month(year: i32, month: u32) -> (i32, u32) {
    if month == 12 { (year + 1, 1) } else { (year, month + 1) }
}

/// Most recent calendar slot at or before `now`.
pub fn most_recent_occurrence(schedule: &SpecificSchedule, now: DateTime<Utc>) -> DateTime<Utc> {
    let today = now.date_naive();
    match schedule.kind {
        SpecificKind::Daily => {
            let slot = today.and_time(schedule.at).and_utc();
            if slot > now { slot - Duration::days(1) } else { slot }
        }
        SpecificKind::Weekly { weekday } => {
            let current = now.weekday().num_days_from_sunday();
            let back = (current + 7 - weekday.min(6)) % 7;
            let slot = (today - Duration::days(back as i64)).and_time(schedule.at).and_utc();
            if slot > now { slot - Duration::weeks(1) } else { slot }
        }
        SpecificKind::Monthly { day_of_month } => {
            let (year, month) = (now.year(), now.month());
            match monthly_slot(year, month, day_of_month, schedule.at) {
                Some(slot) if slot <= now => slot,
                _ => {
                    let (py, pm) = previous_month(year, month);
                    monthly_slot(py, pm, day_of_month, schedule.at).unwrap_or(now)
                }
            }
        }
    }
}

/// The slot immediately after `occurrence`.
pub fn following_occurrence(schedule: &SpecificSchedule, occurrence: DateTime<Utc>) -> DateTime<Utc> {
    match schedule.kind {
        SpecificKind::Daily => occurrence + Duration::days(1),
        SpecificKind::Weekly { .. } => occurrence + Duration::weeks(1),
        SpecificKind::Monthly { day_of_month } => {
            let (ny, nm) = following_month(occurrence.year(), occurrence.month());
            monthly_slot(ny, nm, day_of_month, schedule.at).unwrap_or(DateTime::<Utc>::MAX_UTC)
        }
    }
}

/// When the trigger is (or was) next due.
///
/// `every`: never fired means due right now, otherwise `last + N*unit`.
/// `specific`: the most recent slot if it has not been credited yet, otherwise
/// the slot after it.
pub fn next_due_at(
    config: &ScheduleConfig,
    last_fired_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    match config {
        ScheduleConfig::Every { value, unit } => match last_fired_at {
            None => now,
            Some(last) => every_next(*value, *unit, last),
        },
        ScheduleConfig::Specific(schedule) => {
            let occurrence = most_recent_occurrence(schedule, now);
            match last_fired_at {
                Some(last) if last >= occurrence => following_occurrence(schedule, occurrence),
                _ => occurrence,
            }
        }
    }
}

/// Whether the trigger should fire at `now`.
pub fn is_due(
    config: &ScheduleConfig,
    last_fired_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    match config {
        ScheduleConfig::Every { .. } => now >= next_due_at(config, last_fired_at, now),
        ScheduleConfig::Specific(schedule) => {
            let occurrence = most_recent_occurrence(schedule, now);
            now >= occurrence && last_fired_at.is_none_or(|last| last < occurrence)
        }
    }
}
