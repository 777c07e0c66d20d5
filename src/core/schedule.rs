//! Due-time evaluation for scheduled jobs.
//!
//! A job is due when the current weekday is one of its scheduled days and
//! the current wall-clock time, truncated to the minute, equals its
//! scheduled time. There is no catch-up: a minute the scheduler does not
//! observe is a missed trigger.

use chrono::{Datelike, NaiveTime, Timelike, Weekday};
use tracing::warn;

use super::error::ScheduleParseError;
use super::models::BackupJob;

const WEEKDAYS: [(&str, Weekday); 7] = [
    ("monday", Weekday::Mon),
    ("tuesday", Weekday::Tue),
    ("wednesday", Weekday::Wed),
    ("thursday", Weekday::Thu),
    ("friday", Weekday::Fri),
    ("saturday", Weekday::Sat),
    ("sunday", Weekday::Sun),
];

/// Parsed form of a job's `schedule_time` and `schedule_days`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    pub time: NaiveTime,
    pub days: Vec<Weekday>,
}

impl Schedule {
    pub fn parse<S: AsRef<str>>(time: &str, days: &[S]) -> Result<Self, ScheduleParseError> {
        let time = NaiveTime::parse_from_str(time.trim(), "%H:%M")
            .map_err(|_| ScheduleParseError::InvalidTime(time.to_string()))?;

        let mut parsed = Vec::with_capacity(days.len());
        for day in days {
            let day = day.as_ref().trim();
            if day.is_empty() {
                continue;
            }
            let weekday =
                parse_weekday(day).ok_or_else(|| ScheduleParseError::InvalidDay(day.to_string()))?;
            if !parsed.contains(&weekday) {
                parsed.push(weekday);
            }
        }

        Ok(Self { time, days: parsed })
    }

    /// Exact-minute match on a scheduled weekday.
    pub fn matches<T: Datelike + Timelike>(&self, now: &T) -> bool {
        self.days.contains(&now.weekday())
            && now.hour() == self.time.hour()
            && now.minute() == self.time.minute()
    }
}

/// Full English weekday name, case-insensitive.
pub fn parse_weekday(name: &str) -> Option<Weekday> {
    let name = name.trim().to_lowercase();
    WEEKDAYS
        .iter()
        .find(|(candidate, _)| *candidate == name)
        .map(|(_, weekday)| *weekday)
}

/// Canonical display name ("Monday", ...).
pub fn weekday_name(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

/// Like [`is_due`] but surfaces schedule parse failures to the caller.
pub fn evaluate<T: Datelike + Timelike>(
    job: &BackupJob,
    now: &T,
) -> Result<bool, ScheduleParseError> {
    if job.sources.is_empty() {
        return Ok(false);
    }
    let schedule = Schedule::parse(&job.schedule_time, &job.schedule_days)?;
    Ok(schedule.matches(now))
}

/// Whether `job` should be dispatched at `now`.
///
/// Jobs without sources, without days, or with an unparsable schedule are
/// never due; parse failures are logged as warnings.
pub fn is_due<T: Datelike + Timelike>(job: &BackupJob, now: &T) -> bool {
    match evaluate(job, now) {
        Ok(due) => due,
        Err(e) => {
            warn!(job_id = %job.id, job = %job.name, error = %e, "Skipping job with invalid schedule");
            false
        }
    }
}
