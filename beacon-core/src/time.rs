//! Clock source and timestamp parsing.

use std::sync::Mutex;

use anyhow::Result;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;

/// Wall-clock source. Injected everywhere so tests can drive time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Parse a host-supplied RFC3339 timestamp into UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let dt = DateTime::parse_from_rfc3339(raw.trim())
        .map_err(|e| anyhow::anyhow!("invalid timestamp '{raw}': {e}"))?;
    Ok(dt.with_timezone(&Utc))
}

/// Parse an "HH:MM" wall-clock target.
pub fn parse_archive_time(raw: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .map_err(|e| anyhow::anyhow!("invalid time of day '{raw}' (expected HH:MM): {e}"))
}

pub fn parse_timezone(raw: &str) -> Result<Tz> {
    raw.parse()
        .map_err(|_| anyhow::anyhow!("invalid timezone: {raw}"))
}

/// Calendar date of `now` in `tz`.
pub fn local_date(now: DateTime<Utc>, tz: Tz) -> NaiveDate {
    now.with_timezone(&tz).date_naive()
}
