//! Star schema DDL for the play-summary warehouse.

use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

/// One schema version: the DDL that creates it from scratch, plus the
/// migration that brings the previous version up to it.
pub struct SchemaVersion {
    pub version: i64,
    pub create_sql: &'static [&'static str],
    pub migration: Option<fn(&Connection) -> Result<()>>,
}

const DIM_ARTIST: &str = "
CREATE TABLE dim_artist (
    artist_key INTEGER PRIMARY KEY,
    artist_id TEXT NOT NULL UNIQUE,
    artist_name TEXT NOT NULL
)";

const DIM_SONG: &str = "
CREATE TABLE dim_song (
    song_key INTEGER PRIMARY KEY,
    song_id TEXT NOT NULL UNIQUE,
    song_title TEXT NOT NULL,
    song_duration_ms INTEGER NOT NULL
)";

const DIM_DATE: &str = "
CREATE TABLE dim_date (
    date_key INTEGER PRIMARY KEY,
    year INTEGER NOT NULL,
    month INTEGER NOT NULL,
    day INTEGER NOT NULL,
    hour_of_day INTEGER NOT NULL,
    day_of_week TEXT NOT NULL,
    UNIQUE (year, month, day, hour_of_day, day_of_week)
)";

// play_count and total_duration_ms are additive accumulators, merged and
// never overwritten. last_window_key records which window last contributed
// to the row so a replayed contribution from the same window can be
// rejected at merge time.
const FACT_PLAY_SUMMARY: &str = "
CREATE TABLE fact_play_summary (
    play_id INTEGER PRIMARY KEY,
    song_key INTEGER NOT NULL REFERENCES dim_song(song_key),
    artist_key INTEGER NOT NULL REFERENCES dim_artist(artist_key),
    date_key INTEGER NOT NULL REFERENCES dim_date(date_key),
    played_at TEXT NOT NULL,
    play_count INTEGER NOT NULL,
    total_duration_ms INTEGER NOT NULL,
    last_window_key TEXT NOT NULL,
    UNIQUE (song_key, artist_key, played_at)
)";

pub const WAREHOUSE_SCHEMAS: &[SchemaVersion] = &[SchemaVersion {
    version: 1,
    create_sql: &[DIM_ARTIST, DIM_SONG, DIM_DATE, FACT_PLAY_SUMMARY],
    migration: None,
}];

/// Create the schema on a fresh database, or walk migrations forward on an
/// existing one. Tracks the applied version in `PRAGMA user_version`.
pub fn migrate_if_needed(conn: &mut Connection) -> Result<()> {
    let db_version: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    let latest = WAREHOUSE_SCHEMAS
        .last()
        .expect("at least one schema version");

    if db_version == 0 {
        info!("Creating warehouse schema at version {}", latest.version);
        let tx = conn.transaction()?;
        for sql in latest.create_sql {
            tx.execute(sql, [])?;
        }
        tx.pragma_update(None, "user_version", latest.version)?;
        tx.commit()?;
        return Ok(());
    }

    if db_version >= latest.version {
        return Ok(());
    }

    let tx = conn.transaction()?;
    let mut current = db_version;
    for schema in WAREHOUSE_SCHEMAS.iter().filter(|s| s.version > db_version) {
        if let Some(migration) = schema.migration {
            info!(
                "Migrating warehouse from version {} to {}",
                current, schema.version
            );
            migration(&tx)?;
        }
        current = schema.version;
    }
    tx.pragma_update(None, "user_version", current)?;
    tx.commit()?;
    Ok(())
}
