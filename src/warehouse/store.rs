//! SQLite-backed star-schema warehouse.
//!
//! One `load_window` call is one transaction. Dimension upserts are
//! last-write-wins on mutable fields; the fact merge is additive and is the
//! reason the whole pipeline is guarded: a play contribution merged twice is
//! double-counted forever. As defense in depth each fact row carries the
//! window that last contributed to it, and a merge arriving under that same
//! window is rejected as a replay.

use super::schema::migrate_if_needed;
use crate::pipeline::{CalendarFields, EnrichedPlay};
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{info, warn};

/// Row-level load failure. Contained: the row is skipped and counted, the
/// batch continues.
#[derive(Debug, Error)]
pub enum RowError {
    #[error("missing {0}")]
    MissingField(&'static str),

    #[error("unparsable played_at '{0}'")]
    BadTimestamp(String),
}

/// Outcome of one committed load run.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Rows inserted or merged into the fact table.
    pub loaded: usize,
    /// Rows skipped for row-level errors.
    pub skipped: usize,
    /// Merges rejected because the fact row already recorded this window.
    pub replayed: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub struct WarehouseStats {
    pub artists: usize,
    pub songs: usize,
    pub dates: usize,
    pub facts: usize,
}

#[derive(Clone)]
pub struct SqliteWarehouse {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteWarehouse {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let mut conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open warehouse database {:?}", db_path.as_ref()))?;

        migrate_if_needed(&mut conn)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("Failed to set WAL mode on warehouse connection")?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("Failed to enable foreign keys on warehouse connection")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        let stats = store.stats()?;
        info!(
            "Warehouse ready: {} artists, {} songs, {} dates, {} fact rows",
            stats.artists, stats.songs, stats.dates, stats.facts
        );
        Ok(store)
    }

    /// Load one window's processed rows inside a single transaction.
    ///
    /// Row-level errors skip the row and continue; any storage error aborts
    /// and rolls back the whole run, leaving the warehouse untouched.
    pub fn load_window(&self, window_key: &str, rows: &[EnrichedPlay]) -> Result<LoadReport> {
        let conn = self.conn.lock().unwrap();
        let tx = conn
            .unchecked_transaction()
            .context("Failed to begin warehouse transaction")?;

        let mut report = LoadReport::default();
        for (index, row) in rows.iter().enumerate() {
            let prepared = match prepare_row(row) {
                Ok(prepared) => prepared,
                Err(e) => {
                    warn!("Skipping row {} for window {}: {}", index, window_key, e);
                    report.skipped += 1;
                    continue;
                }
            };

            let artist_key = upsert_artist(&tx, prepared.artist_id, prepared.artist_name)?;
            let song_key = upsert_song(
                &tx,
                prepared.song_id,
                prepared.song_title,
                prepared.duration_ms,
            )?;
            let date_key = get_or_create_date(&tx, prepared.calendar)?;

            let merged = merge_fact(
                &tx,
                song_key,
                artist_key,
                date_key,
                &prepared.played_at,
                prepared.duration_ms,
                window_key,
            )?;
            if merged {
                report.loaded += 1;
            } else {
                warn!(
                    "Rejected replayed contribution from window {} for song {} at {}",
                    window_key, prepared.song_id, prepared.played_at
                );
                report.replayed += 1;
            }
        }

        tx.commit().context("Failed to commit warehouse load")?;
        info!(
            "Loaded window {}: {} rows merged, {} skipped, {} replays rejected",
            window_key, report.loaded, report.skipped, report.replayed
        );
        Ok(report)
    }

    pub fn stats(&self) -> Result<WarehouseStats> {
        let conn = self.conn.lock().unwrap();
        let count = |table: &str| -> Result<usize> {
            conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))
                .with_context(|| format!("Failed to count rows in {}", table))
        };
        Ok(WarehouseStats {
            artists: count("dim_artist")?,
            songs: count("dim_song")?,
            dates: count("dim_date")?,
            facts: count("fact_play_summary")?,
        })
    }
}

/// A fully-validated row, ready for the dimension and fact statements.
struct LoadRow<'a> {
    song_id: &'a str,
    song_title: &'a str,
    artist_id: &'a str,
    artist_name: &'a str,
    duration_ms: i64,
    played_at: String,
    calendar: &'a CalendarFields,
}

fn prepare_row(row: &EnrichedPlay) -> Result<LoadRow<'_>, RowError> {
    let song_id = row
        .song_id
        .as_deref()
        .ok_or(RowError::MissingField("song_id"))?;
    let artist_id = row
        .artist_id
        .as_deref()
        .ok_or(RowError::MissingField("artist_id"))?;
    let calendar = row
        .calendar
        .as_ref()
        .ok_or(RowError::MissingField("calendar fields"))?;
    let played_at = DateTime::parse_from_rfc3339(&row.played_at)
        .map_err(|_| RowError::BadTimestamp(row.played_at.clone()))?
        .with_timezone(&Utc)
        .to_rfc3339_opts(SecondsFormat::Millis, true);

    Ok(LoadRow {
        song_id,
        song_title: &row.song_title,
        artist_id,
        artist_name: &row.artist_name,
        duration_ms: row.song_duration_ms,
        played_at,
        calendar,
    })
}

/// Insert or update the artist dimension (name is last-write-wins) and
/// return its surrogate key.
fn upsert_artist(tx: &Transaction<'_>, artist_id: &str, artist_name: &str) -> Result<i64> {
    let mut stmt = tx.prepare_cached(
        "INSERT INTO dim_artist (artist_id, artist_name) VALUES (?1, ?2)
         ON CONFLICT (artist_id) DO UPDATE SET artist_name = excluded.artist_name
         RETURNING artist_key",
    )?;
    let key = stmt.query_row(params![artist_id, artist_name], |r| r.get(0))?;
    Ok(key)
}

fn upsert_song(
    tx: &Transaction<'_>,
    song_id: &str,
    song_title: &str,
    song_duration_ms: i64,
) -> Result<i64> {
    let mut stmt = tx.prepare_cached(
        "INSERT INTO dim_song (song_id, song_title, song_duration_ms) VALUES (?1, ?2, ?3)
         ON CONFLICT (song_id) DO UPDATE
         SET song_title = excluded.song_title,
             song_duration_ms = excluded.song_duration_ms
         RETURNING song_key",
    )?;
    let key = stmt.query_row(params![song_id, song_title, song_duration_ms], |r| r.get(0))?;
    Ok(key)
}

/// Date dimension rows are immutable: insert on first reference, look up
/// thereafter.
fn get_or_create_date(tx: &Transaction<'_>, cal: &CalendarFields) -> Result<i64> {
    let mut insert = tx.prepare_cached(
        "INSERT INTO dim_date (year, month, day, hour_of_day, day_of_week)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (year, month, day, hour_of_day, day_of_week) DO NOTHING
         RETURNING date_key",
    )?;
    let inserted: Option<i64> = insert
        .query_row(
            params![cal.year, cal.month, cal.day, cal.hour_of_day, cal.day_of_week],
            |r| r.get(0),
        )
        .optional()?;
    if let Some(key) = inserted {
        return Ok(key);
    }

    let mut select = tx.prepare_cached(
        "SELECT date_key FROM dim_date
         WHERE year = ?1 AND month = ?2 AND day = ?3 AND hour_of_day = ?4 AND day_of_week = ?5",
    )?;
    let key = select.query_row(
        params![cal.year, cal.month, cal.day, cal.hour_of_day, cal.day_of_week],
        |r| r.get(0),
    )?;
    Ok(key)
}

/// Additively merge one play contribution into the fact table.
///
/// Returns false when the existing row already recorded `window_key` as its
/// last contributor, i.e. the merge is a same-window replay and was
/// rejected. Contributions from *different* windows always accumulate; the
/// disjoint-window invariant upheld by the scheduler is what keeps that
/// correct.
fn merge_fact(
    tx: &Transaction<'_>,
    song_key: i64,
    artist_key: i64,
    date_key: i64,
    played_at: &str,
    duration_ms: i64,
    window_key: &str,
) -> Result<bool> {
    let mut stmt = tx.prepare_cached(
        "INSERT INTO fact_play_summary
         (song_key, artist_key, date_key, played_at, play_count, total_duration_ms, last_window_key)
         VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6)
         ON CONFLICT (song_key, artist_key, played_at) DO UPDATE
         SET play_count = play_count + excluded.play_count,
             total_duration_ms = total_duration_ms + excluded.total_duration_ms,
             last_window_key = excluded.last_window_key
         WHERE fact_play_summary.last_window_key <> excluded.last_window_key",
    )?;
    let changed = stmt.execute(params![
        song_key,
        artist_key,
        date_key,
        played_at,
        duration_ms,
        window_key,
    ])?;
    Ok(changed > 0)
}
