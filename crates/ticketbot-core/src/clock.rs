//! Wall-clock access and the timestamp formats shared by every snapshot.
//!
//! Snapshot file names and the timestamps stored inside them must stay
//! readable by earlier deployments, so the formats here are fixed:
//!
//! ```text
//! {prefix}/{YYYYMMDD_HHMM}.csv      snapshot key
//! YYYY-MM-DD HH:MM:SS               uploaded_at, notified_at, normalized dates
//! YYYY-MM-DD                        dates rendered into messages
//! ```

use std::sync::Mutex;

use chrono::{DateTime, Days, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const FILE_NAME_FORMAT: &str = "%Y%m%d_%H%M";

/// Source of "now" for a tick.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to. Used by tests and dry runs.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    #[must_use]
    pub const fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward by `by`.
    pub fn advance(&self, by: chrono::Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map_or_else(|poisoned| *poisoned.into_inner(), |now| *now)
    }
}

/// Build the snapshot key for a write happening at `at`.
#[must_use]
pub fn snapshot_key(prefix: &str, at: DateTime<Utc>, tz: Tz) -> String {
    format!(
        "{prefix}/{}.csv",
        at.with_timezone(&tz).format(FILE_NAME_FORMAT)
    )
}

/// Render `at` in the canonical `YYYY-MM-DD HH:MM:SS` form in `tz`.
#[must_use]
pub fn format_datetime(at: DateTime<Utc>, tz: Tz) -> String {
    at.with_timezone(&tz).format(DATETIME_FORMAT).to_string()
}

/// Midnight in `tz` of the day `days` before `now`'s local date.
///
/// Files whose last-modified time falls strictly before this instant are
/// eligible for retention pruning.
#[must_use]
pub fn retention_threshold(now: DateTime<Utc>, tz: Tz, days: u32) -> DateTime<Utc> {
    let today = now.with_timezone(&tz).date_naive();
    let day = today
        .checked_sub_days(Days::new(u64::from(days)))
        .unwrap_or(today);
    day.and_hms_opt(0, 0, 0)
        .and_then(|midnight| tz.from_local_datetime(&midnight).earliest())
        .map_or(now, |local| local.with_timezone(&Utc))
}

/// True when `value` starts with `YYYY-MM-DD` or `YYYY/MM/DD`.
#[must_use]
pub fn looks_like_date(value: &str) -> bool {
    let bytes = value.as_bytes();
    if bytes.len() < 10 {
        return false;
    }
    let digits = |range: std::ops::Range<usize>| bytes[range].iter().all(u8::is_ascii_digit);
    let sep = |b: u8| b == b'-' || b == b'/';
    digits(0..4) && sep(bytes[4]) && digits(5..7) && sep(bytes[7]) && digits(8..10)
}

/// Re-express a UTC ISO-8601 date or datetime in `tz` using the canonical
/// datetime format. Returns `None` when the value does not parse.
///
/// Values carrying an explicit offset are honored; naive values and bare
/// dates are taken to be UTC.
#[must_use]
pub fn utc_iso_to_local(value: &str, tz: Tz) -> Option<String> {
    let value = value.trim().replace('/', "-");
    let utc = if let Ok(parsed) = DateTime::parse_from_rfc3339(&value) {
        parsed.with_timezone(&Utc)
    } else if let Ok(naive) =
        NaiveDateTime::parse_from_str(value.trim_end_matches('Z'), "%Y-%m-%dT%H:%M:%S%.f")
    {
        Utc.from_utc_datetime(&naive)
    } else if let Ok(naive) =
        NaiveDateTime::parse_from_str(value.trim_end_matches('Z'), "%Y-%m-%dT%H:%M")
    {
        Utc.from_utc_datetime(&naive)
    } else if let Ok(naive) = NaiveDateTime::parse_from_str(&value, DATETIME_FORMAT) {
        Utc.from_utc_datetime(&naive)
    } else {
        let date = NaiveDate::parse_from_str(&value, DATE_FORMAT).ok()?;
        Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?)
    };
    Some(format_datetime(utc, tz))
}
