//! Transform stage: validate, deduplicate and enrich a raw snapshot.

use super::{processed_snapshot_key, raw_snapshot_key, EtlError};
use super::{CalendarFields, EnrichedPlay, RawPlayRecord};
use crate::blob_store::BlobStore;
use crate::guard::{Stage, StageGuard};
use anyhow::Context;
use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, warn};

const NA_FILL: &str = "N/A";

pub struct Transformer {
    blobs: Arc<dyn BlobStore>,
    guard: StageGuard,
    reference_zone: FixedOffset,
}

impl Transformer {
    /// `reference_zone` is the fixed offset the calendar fields are derived
    /// in; play timestamps themselves stay UTC.
    pub fn new(blobs: Arc<dyn BlobStore>, reference_zone: FixedOffset) -> Self {
        let guard = StageGuard::new(blobs.clone());
        Self {
            blobs,
            guard,
            reference_zone,
        }
    }

    /// No-op (returning Ok) when the stage already completed for this window.
    pub fn run(&self, window_key: &str) -> Result<(), EtlError> {
        if !self.guard.try_begin(Stage::Transform, window_key)? {
            return Ok(());
        }

        match self.transform_window(window_key) {
            Ok(count) => {
                self.guard.complete(Stage::Transform, window_key)?;
                info!(
                    "Transform complete for window {}: {} processed rows",
                    window_key, count
                );
                Ok(())
            }
            Err(e) => {
                error!("Transform failed for window {}: {}", window_key, e);
                if let Err(abort_err) = self.guard.abort(Stage::Transform, window_key) {
                    error!("Failed to release transform marker: {}", abort_err);
                }
                Err(e)
            }
        }
    }

    fn transform_window(&self, window_key: &str) -> Result<usize, EtlError> {
        let bytes = self.blobs.get(&raw_snapshot_key(window_key))?;
        let raw: Vec<RawPlayRecord> =
            serde_json::from_slice(&bytes).context("Failed to parse raw snapshot")?;
        let input_count = raw.len();

        let cleaned = self.validate_and_clean(raw);
        if cleaned.is_empty() && input_count > 0 {
            // Nothing survived required-field filtering: a data-quality
            // failure, not an empty window.
            return Err(EtlError::Validation(format!(
                "All {} raw rows dropped by required-field filtering for window {}",
                input_count, window_key
            )));
        }
        info!(
            "Validation kept {} of {} rows for window {}",
            cleaned.len(),
            input_count,
            window_key
        );

        let deduped = dedupe(cleaned);
        let enriched: Vec<EnrichedPlay> = deduped
            .into_iter()
            .map(|row| self.enrich(row))
            .collect();

        let bytes = serde_json::to_vec_pretty(&enriched)
            .context("Failed to serialize processed snapshot")?;
        self.blobs
            .put(&processed_snapshot_key(window_key), &bytes)?;
        Ok(enriched.len())
    }

    /// Drop fully-empty rows and rows missing the load-critical fields
    /// (`song_duration_ms`, `played_at`). Missing titles and names are
    /// cosmetic and filled instead.
    fn validate_and_clean(&self, raw: Vec<RawPlayRecord>) -> Vec<RawPlayRecord> {
        raw.into_iter()
            .filter(|row| !row.is_empty())
            .filter(|row| row.song_duration_ms.is_some() && row.played_at.is_some())
            .collect()
    }

    fn enrich(&self, row: RawPlayRecord) -> EnrichedPlay {
        // Presence guaranteed by validate_and_clean.
        let played_at_raw = row.played_at.unwrap_or_default();
        let song_duration_ms = row.song_duration_ms.unwrap_or_default();

        // An unparsable timestamp travels through with no calendar fields;
        // the loader skips and counts it so the rest of the batch survives.
        let (played_at, calendar) = match DateTime::parse_from_rfc3339(&played_at_raw) {
            Ok(parsed) => {
                let utc = parsed.with_timezone(&Utc);
                let local = utc.with_timezone(&self.reference_zone);
                (
                    utc.to_rfc3339_opts(SecondsFormat::Millis, true),
                    Some(calendar_fields(&local)),
                )
            }
            Err(e) => {
                warn!("Unparsable played_at '{}': {}", played_at_raw, e);
                (played_at_raw, None)
            }
        };

        EnrichedPlay {
            song_id: row.song_id,
            song_title: row.song_title.unwrap_or_else(|| NA_FILL.to_string()),
            artist_id: row.artist_id,
            artist_name: row.artist_name.unwrap_or_else(|| NA_FILL.to_string()),
            played_at,
            song_duration_ms,
            calendar,
        }
    }
}

/// Collapse rows sharing an identical `(song_id, played_at)` pair, keeping
/// the first occurrence. This protects against upstream pagination overlap
/// within one window, not against plays repeated across windows.
fn dedupe(rows: Vec<RawPlayRecord>) -> Vec<RawPlayRecord> {
    let before = rows.len();
    let mut seen: HashSet<(Option<String>, Option<String>)> = HashSet::new();
    let deduped: Vec<RawPlayRecord> = rows
        .into_iter()
        .filter(|row| seen.insert((row.song_id.clone(), row.played_at.clone())))
        .collect();
    if deduped.len() < before {
        info!("Removed {} duplicate rows", before - deduped.len());
    }
    deduped
}

fn calendar_fields(local: &DateTime<FixedOffset>) -> CalendarFields {
    use chrono::{Datelike, Timelike};
    CalendarFields {
        year: local.year(),
        month: local.month(),
        day: local.day(),
        hour_of_day: local.hour(),
        day_of_week: local.format("%A").to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::FsBlobStore;
    use tempfile::TempDir;

    const WK: &str = "2025-01-01-00";

    fn reference_zone() -> FixedOffset {
        FixedOffset::east_opt(7 * 3600).unwrap()
    }

    fn setup() -> (Transformer, Arc<dyn BlobStore>, TempDir) {
        let tmp = TempDir::new().unwrap();
        let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(tmp.path()).unwrap());
        let transformer = Transformer::new(blobs.clone(), reference_zone());
        (transformer, blobs, tmp)
    }

    fn write_raw(blobs: &Arc<dyn BlobStore>, rows: &[RawPlayRecord]) {
        blobs
            .put(
                &raw_snapshot_key(WK),
                &serde_json::to_vec(rows).unwrap(),
            )
            .unwrap();
    }

    fn read_processed(blobs: &Arc<dyn BlobStore>) -> Vec<EnrichedPlay> {
        let bytes = blobs.get(&processed_snapshot_key(WK)).unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn make_record(song_id: &str, played_at: &str) -> RawPlayRecord {
        RawPlayRecord {
            song_id: Some(song_id.to_string()),
            song_title: Some("Song".to_string()),
            artist_id: Some("A1".to_string()),
            artist_name: Some("Artist".to_string()),
            played_at: Some(played_at.to_string()),
            song_duration_ms: Some(200000),
        }
    }

    #[test]
    fn test_transform_enriches_calendar_fields_in_reference_zone() {
        let (transformer, blobs, _tmp) = setup();
        // 23:30 UTC on Dec 31 is 06:30 Jan 1 at +07:00.
        write_raw(&blobs, &[make_record("S1", "2024-12-31T23:30:00Z")]);

        transformer.run(WK).unwrap();

        let rows = read_processed(&blobs);
        assert_eq!(rows.len(), 1);
        let cal = rows[0].calendar.as_ref().unwrap();
        assert_eq!(cal.year, 2025);
        assert_eq!(cal.month, 1);
        assert_eq!(cal.day, 1);
        assert_eq!(cal.hour_of_day, 6);
        assert_eq!(cal.day_of_week, "Wednesday");
        assert_eq!(rows[0].played_at, "2024-12-31T23:30:00.000Z");
    }

    #[test]
    fn test_duplicate_song_and_timestamp_pairs_collapse() {
        let (transformer, blobs, _tmp) = setup();
        write_raw(
            &blobs,
            &[
                make_record("S1", "2025-01-01T00:00:00Z"),
                make_record("S1", "2025-01-01T00:00:00Z"),
                make_record("S1", "2025-01-01T01:00:00Z"),
                make_record("S2", "2025-01-01T00:00:00Z"),
            ],
        );

        transformer.run(WK).unwrap();
        assert_eq!(read_processed(&blobs).len(), 3);
    }

    #[test]
    fn test_rows_missing_required_fields_are_dropped() {
        let (transformer, blobs, _tmp) = setup();
        let mut no_duration = make_record("S2", "2025-01-01T00:00:00Z");
        no_duration.song_duration_ms = None;
        let mut no_played_at = make_record("S3", "2025-01-01T00:00:00Z");
        no_played_at.played_at = None;
        write_raw(
            &blobs,
            &[
                make_record("S1", "2025-01-01T00:00:00Z"),
                no_duration,
                no_played_at,
                RawPlayRecord::default(),
            ],
        );

        transformer.run(WK).unwrap();

        let rows = read_processed(&blobs);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].song_id.as_deref(), Some("S1"));
    }

    #[test]
    fn test_all_rows_invalid_is_validation_error() {
        let (transformer, blobs, _tmp) = setup();
        let mut no_played_at = make_record("S1", "x");
        no_played_at.played_at = None;
        write_raw(&blobs, &[no_played_at, RawPlayRecord::default()]);

        let err = transformer.run(WK).unwrap_err();
        assert!(matches!(err, EtlError::Validation(_)));
        // No processed snapshot and no success marker were written.
        assert!(!blobs.exists(&processed_snapshot_key(WK)).unwrap());
        assert!(!blobs
            .exists(&format!("processed/{}/_SUCCESS", WK))
            .unwrap());
    }

    #[test]
    fn test_empty_input_yields_empty_processed_snapshot() {
        let (transformer, blobs, _tmp) = setup();
        write_raw(&blobs, &[]);

        transformer.run(WK).unwrap();

        assert!(read_processed(&blobs).is_empty());
        assert!(blobs
            .exists(&format!("processed/{}/_SUCCESS", WK))
            .unwrap());
    }

    #[test]
    fn test_missing_title_and_name_are_filled() {
        let (transformer, blobs, _tmp) = setup();
        let mut row = make_record("S1", "2025-01-01T00:00:00Z");
        row.song_title = None;
        row.artist_name = None;
        write_raw(&blobs, &[row]);

        transformer.run(WK).unwrap();

        let rows = read_processed(&blobs);
        assert_eq!(rows[0].song_title, "N/A");
        assert_eq!(rows[0].artist_name, "N/A");
    }

    #[test]
    fn test_unparsable_timestamp_travels_through_without_calendar() {
        let (transformer, blobs, _tmp) = setup();
        write_raw(&blobs, &[make_record("S1", "not-a-timestamp")]);

        transformer.run(WK).unwrap();

        let rows = read_processed(&blobs);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].played_at, "not-a-timestamp");
        assert!(rows[0].calendar.is_none());
    }

    #[test]
    fn test_completed_window_is_not_reprocessed() {
        let (transformer, blobs, _tmp) = setup();
        write_raw(&blobs, &[make_record("S1", "2025-01-01T00:00:00Z")]);
        transformer.run(WK).unwrap();

        // Replace the raw snapshot; a rerun must not pick it up.
        write_raw(
            &blobs,
            &[
                make_record("S1", "2025-01-01T00:00:00Z"),
                make_record("S2", "2025-01-01T01:00:00Z"),
            ],
        );
        transformer.run(WK).unwrap();

        assert_eq!(read_processed(&blobs).len(), 1);
    }
}
