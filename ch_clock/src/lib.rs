//! ABOUTME: Cron expression parsing and next-fire computation
//! ABOUTME: Seven fields (sec min hour dom month dow year), 0=Sunday

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc};
use std::fmt;
use std::str::FromStr;

pub mod field;

pub use field::{FieldPart, FieldSpec};

/// Probe bound for `next`; expressions that cannot match within this many
/// field advances are reported as unreachable.
const MAX_PROBES: u32 = 10_000;

/// Errors from parsing or probing a cron expression
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ClockError {
    #[error("Invalid cron expression: {0}")]
    Parse(String),

    #[error("No matching instant within the probe bound")]
    Unreachable,
}

impl From<ClockError> for ch_core::Error {
    fn from(err: ClockError) -> Self {
        ch_core::Error::BadRequest(err.to_string())
    }
}

/// A parsed seven-field cron expression
///
/// Field order: second, minute, hour, day-of-month, month, day-of-week
/// (0-6, 0 = Sunday), year. Day-of-month and day-of-week must both match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    second: FieldSpec,
    minute: FieldSpec,
    hour: FieldSpec,
    day: FieldSpec,
    month: FieldSpec,
    weekday: FieldSpec,
    year: FieldSpec,
}

pub const YEAR_MIN: u32 = 1970;
pub const YEAR_MAX: u32 = 2099;

impl FromStr for CronExpr {
    type Err = ClockError;

    fn from_str(expr: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 7 {
            return Err(ClockError::Parse(format!(
                "expected 7 fields, got {}",
                fields.len()
            )));
        }

        Ok(Self {
            second: FieldSpec::parse(fields[0], "second", 0, 59)?,
            minute: FieldSpec::parse(fields[1], "minute", 0, 59)?,
            hour: FieldSpec::parse(fields[2], "hour", 0, 23)?,
            day: FieldSpec::parse(fields[3], "day", 1, 31)?,
            month: FieldSpec::parse(fields[4], "month", 1, 12)?,
            weekday: FieldSpec::parse(fields[5], "weekday", 0, 6)?,
            year: FieldSpec::parse(fields[6], "year", YEAR_MIN, YEAR_MAX)?,
        })
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {} {}",
            self.second, self.minute, self.hour, self.day, self.month, self.weekday, self.year
        )
    }
}

impl CronExpr {
    /// Whether an instant matches every field
    pub fn matches(&self, t: DateTime<Utc>) -> bool {
        self.year.contains(t.year() as u32)
            && self.month.contains(t.month())
            && self.day.contains(t.day())
            && self.weekday.contains(t.weekday().num_days_from_sunday())
            && self.hour.contains(t.hour())
            && self.minute.contains(t.minute())
            && self.second.contains(t.second())
    }

    /// Smallest instant strictly greater than `from` matching every field.
    ///
    /// Advances field by field from the year down, resetting lower fields on
    /// each carry; every advance consumes one probe.
    pub fn next(&self, from: DateTime<Utc>) -> Result<DateTime<Utc>, ClockError> {
        let mut t = from
            .with_nanosecond(0)
            .unwrap_or(from)
            + chrono::Duration::seconds(1);

        for _ in 0..MAX_PROBES {
            let year = t.year() as u32;
            if !self.year.contains(year) {
                match self.year.next_after(year) {
                    Some(next_year) => {
                        t = start_of_year(next_year)?;
                        continue;
                    }
                    None => return Err(ClockError::Unreachable),
                }
            }

            if !self.month.contains(t.month()) {
                t = match self.month.next_after(t.month()) {
                    Some(m) => start_of_month(t.year(), m)?,
                    None => start_of_year(year + 1)?,
                };
                continue;
            }

            if !self.day.contains(t.day())
                || !self.weekday.contains(t.weekday().num_days_from_sunday())
            {
                t = next_day(t)?;
                continue;
            }

            if !self.hour.contains(t.hour()) {
                t = match self.hour.next_after(t.hour()) {
                    Some(h) => with_hms(t, h, self.minute.first(), self.second.first())?,
                    None => next_day(t)?,
                };
                continue;
            }

            if !self.minute.contains(t.minute()) {
                match self.minute.next_after(t.minute()) {
                    Some(m) => return Ok(with_hms(t, t.hour(), m, self.second.first())?),
                    None => {
                        t = match self.hour.next_after(t.hour()) {
                            Some(h) => with_hms(t, h, self.minute.first(), self.second.first())?,
                            None => next_day(t)?,
                        };
                        continue;
                    }
                }
            }

            if !self.second.contains(t.second()) {
                match self.second.next_after(t.second()) {
                    Some(s) => return Ok(with_hms(t, t.hour(), t.minute(), s)?),
                    None => {
                        match self.minute.next_after(t.minute()) {
                            Some(m) => {
                                return Ok(with_hms(t, t.hour(), m, self.second.first())?)
                            }
                            None => {
                                t = match self.hour.next_after(t.hour()) {
                                    Some(h) => {
                                        with_hms(t, h, self.minute.first(), self.second.first())?
                                    }
                                    None => next_day(t)?,
                                };
                                continue;
                            }
                        }
                    }
                }
            }

            return Ok(t);
        }

        Err(ClockError::Unreachable)
    }
}

fn start_of_year(year: u32) -> Result<DateTime<Utc>, ClockError> {
    if year > YEAR_MAX {
        return Err(ClockError::Unreachable);
    }
    Utc.with_ymd_and_hms(year as i32, 1, 1, 0, 0, 0)
        .single()
        .ok_or(ClockError::Unreachable)
}

fn start_of_month(year: i32, month: u32) -> Result<DateTime<Utc>, ClockError> {
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .ok_or(ClockError::Unreachable)
}

fn next_day(t: DateTime<Utc>) -> Result<DateTime<Utc>, ClockError> {
    let date = NaiveDate::from_ymd_opt(t.year(), t.month(), t.day())
        .and_then(|d| d.succ_opt())
        .ok_or(ClockError::Unreachable)?;
    Utc.with_ymd_and_hms(date.year(), date.month(), date.day(), 0, 0, 0)
        .single()
        .ok_or(ClockError::Unreachable)
}

fn with_hms(t: DateTime<Utc>, hour: u32, minute: u32, second: u32) -> Result<DateTime<Utc>, ClockError> {
    Utc.with_ymd_and_hms(t.year(), t.month(), t.day(), hour, minute, second)
        .single()
        .ok_or(ClockError::Unreachable)
}

/// Parse-only validation for authoring surfaces
pub fn validate(expr: &str) -> bool {
    expr.parse::<CronExpr>().is_ok()
}
