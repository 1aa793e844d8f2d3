//! Civil-day arithmetic. A collection "day" is a calendar date in the
//! configured timezone; snapshots are taken as of that day's closing instant.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimeError {
    #[error("invalid date '{0}', expected YYYY-MM-DD")]
    InvalidDate(String),
    #[error("invalid date range: start {start} is after end {end}")]
    InvalidRange { start: NaiveDate, end: NaiveDate },
    #[error("unknown timezone '{0}'")]
    UnknownTimezone(String),
    #[error("no local midnight on {date} in {timezone}")]
    NoLocalMidnight { date: NaiveDate, timezone: String },
    #[error("date {0} is out of range")]
    OutOfRange(NaiveDate),
}

pub fn parse_date(value: &str) -> Result<NaiveDate, TimeError> {
    NaiveDate::parse_from_str(value.trim(), DATE_FORMAT)
        .map_err(|_| TimeError::InvalidDate(value.to_string()))
}

pub fn parse_timezone(name: &str) -> Result<Tz, TimeError> {
    name.parse::<Tz>()
        .map_err(|_| TimeError::UnknownTimezone(name.to_string()))
}

/// Inclusive range of calendar dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    start: NaiveDate,
    end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, TimeError> {
        if start > end {
            return Err(TimeError::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn parse(start: &str, end: &str) -> Result<Self, TimeError> {
        Self::new(parse_date(start)?, parse_date(end)?)
    }

    pub fn single(date: NaiveDate) -> Self {
        Self { start: date, end: date }
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }

    pub fn len(&self) -> usize {
        (self.end - self.start).num_days() as usize + 1
    }

    /// A valid range always holds at least one date.
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn dates(&self) -> Vec<NaiveDate> {
        self.start
            .iter_days()
            .take_while(|d| *d <= self.end)
            .collect()
    }
}

/// UTC bounds of one civil day: `[start_utc, end_utc)` in Unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayWindow {
    pub start_utc: i64,
    pub end_utc: i64,
}

impl DayWindow {
    /// Last second that still belongs to the day. A block stamped exactly at
    /// the next local midnight is attributed to the next day.
    pub fn closing_instant(&self) -> i64 {
        self.end_utc - 1
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start_utc && timestamp < self.end_utc
    }
}

/// Local midnight at the start of `date`. Zones that skip midnight for a DST
/// transition start the day at the first existing local time after it.
fn local_midnight(date: NaiveDate, tz: &Tz) -> Result<DateTime<Tz>, TimeError> {
    let midnight: NaiveDateTime = date
        .and_hms_opt(0, 0, 0)
        .ok_or(TimeError::OutOfRange(date))?;

    for shift_minutes in [0i64, 30, 60, 90, 120] {
        let candidate = midnight + Duration::minutes(shift_minutes);
        if let Some(local) = tz.from_local_datetime(&candidate).earliest() {
            return Ok(local);
        }
    }

    Err(TimeError::NoLocalMidnight {
        date,
        timezone: tz.name().to_string(),
    })
}

pub fn day_window(date: NaiveDate, tz: &Tz) -> Result<DayWindow, TimeError> {
    let next = date.succ_opt().ok_or(TimeError::OutOfRange(date))?;
    let start = local_midnight(date, tz)?;
    let end = local_midnight(next, tz)?;

    Ok(DayWindow {
        start_utc: start.timestamp(),
        end_utc: end.timestamp(),
    })
}

/// Civil date of a Unix timestamp in `tz`.
pub fn date_of_timestamp(timestamp: i64, tz: &Tz) -> Option<NaiveDate> {
    DateTime::<Utc>::from_timestamp(timestamp, 0).map(|utc| utc.with_timezone(tz).date_naive())
}
