//! Extraction window identity.
//!
//! A window is identified by its start instant truncated to the hour. The
//! canonical string form `YYYY-MM-DD-HH` is the blob prefix shared by every
//! stage, so it is produced (and parsed) in exactly one place. Earlier
//! iterations of the pipeline disagreed between a daily `YYYY/MM/DD` prefix
//! and the hourly form; only the hourly form survives.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};

const KEY_FORMAT: &str = "%Y-%m-%d-%H";

/// Canonical identifier for one extraction interval.
///
/// Uniqueness and monotonicity follow from the truncated start instant;
/// disjointness between adjacent windows is the scheduler's contract, not
/// something this type can enforce on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowKey {
    start: DateTime<Utc>,
    key: String,
}

impl WindowKey {
    /// Window covering the `window_hours` before `now`.
    ///
    /// The start is truncated to the hour so that the string form and the
    /// interval it denotes always agree, and so that runs scheduled at fixed
    /// clock hours produce deterministic, non-overlapping boundaries.
    pub fn compute(now: DateTime<Utc>, window_hours: u32) -> Self {
        Self::starting_at(now - Duration::hours(window_hours as i64))
    }

    /// Window starting at `start`, truncated down to the hour.
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        let sub_hour = start.timestamp().rem_euclid(3600);
        let start = start
            - Duration::seconds(sub_hour)
            - Duration::nanoseconds(start.timestamp_subsec_nanos() as i64);
        let key = start.format(KEY_FORMAT).to_string();
        Self { start, key }
    }

    /// Parse a canonical `YYYY-MM-DD-HH` key, rejecting non-canonical
    /// spellings (missing zero padding, trailing garbage).
    pub fn parse(key: &str) -> Result<Self> {
        let parts: Vec<&str> = key.splitn(4, '-').collect();
        if parts.len() != 4 {
            bail!("Invalid window key '{}': expected YYYY-MM-DD-HH", key);
        }
        let year: i32 = parts[0].parse().context("Invalid year in window key")?;
        let month: u32 = parts[1].parse().context("Invalid month in window key")?;
        let day: u32 = parts[2].parse().context("Invalid day in window key")?;
        let hour: u32 = parts[3].parse().context("Invalid hour in window key")?;

        let naive = NaiveDate::from_ymd_opt(year, month, day)
            .and_then(|d| d.and_hms_opt(hour, 0, 0))
            .with_context(|| format!("Window key '{}' is not a valid instant", key))?;
        let window = Self::starting_at(Utc.from_utc_datetime(&naive));
        if window.key != key {
            bail!(
                "Window key '{}' is not canonical (expected '{}')",
                key,
                window.key
            );
        }
        Ok(window)
    }

    /// Start of the interval.
    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    /// Upstream `after` watermark in epoch milliseconds.
    pub fn after_ms(&self) -> i64 {
        self.start.timestamp_millis()
    }

    /// Canonical string form, used as the blob prefix.
    pub fn as_str(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Display for WindowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key)
    }
}
