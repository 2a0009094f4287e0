//! Snapshot row models shared by the pipeline stages.

use serde::{Deserialize, Serialize};

/// One raw play as written to `raw/{window}/recently_played.json`.
///
/// Every field is optional: the raw snapshot mirrors whatever the upstream
/// payload carried, nulls included, and is immutable once written. The
/// transformer decides what is load-critical.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawPlayRecord {
    pub song_id: Option<String>,
    pub song_title: Option<String>,
    pub artist_id: Option<String>,
    pub artist_name: Option<String>,
    pub played_at: Option<String>,
    pub song_duration_ms: Option<i64>,
}

impl RawPlayRecord {
    /// A fully-empty row, the kind the upstream occasionally pads pages
    /// with. The transformer drops these before required-field checks.
    pub fn is_empty(&self) -> bool {
        self.song_id.is_none()
            && self.song_title.is_none()
            && self.artist_id.is_none()
            && self.artist_name.is_none()
            && self.played_at.is_none()
            && self.song_duration_ms.is_none()
    }
}

/// Calendar fields derived from `played_at` in the reference time zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarFields {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour_of_day: u32,
    pub day_of_week: String,
}

/// One cleaned play as written to `processed/{window}/recently_played.json`.
///
/// `played_at` stays a string on purpose: the transformer normalizes it to
/// RFC 3339 UTC when it parses, but an unparsable timestamp travels through
/// unchanged (with `calendar: None`) so the loader can count the skip
/// instead of the whole batch failing here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedPlay {
    pub song_id: Option<String>,
    pub song_title: String,
    pub artist_id: Option<String>,
    pub artist_name: String,
    pub played_at: String,
    pub song_duration_ms: i64,
    pub calendar: Option<CalendarFields>,
}
