//! The extract → transform → load pipeline.
//!
//! Stages never talk to each other directly: each one reads its input
//! snapshot from the blob store, claims its (stage, window) slot through the
//! idempotency guard, writes its output, and only then records completion.
//! Ordering between stages is enforced by those markers, not by any handoff
//! channel.

mod extract;
mod load;
mod models;
mod transform;

pub use extract::Extractor;
pub use load::Loader;
pub use models::{CalendarFields, EnrichedPlay, RawPlayRecord};
pub use transform::Transformer;

use crate::upstream::UpstreamError;
use thiserror::Error;

/// Run-fatal pipeline errors. Row-level load failures are not here: the
/// loader contains those (skip, count, continue) rather than aborting the
/// batch.
#[derive(Debug, Error)]
pub enum EtlError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    /// A non-empty raw snapshot filtered down to nothing. Distinct from an
    /// empty upstream window, which is acceptable.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Blob or database I/O failure.
    #[error("Persistence error: {0}")]
    Persistence(#[from] anyhow::Error),
}

pub fn raw_snapshot_key(window_key: &str) -> String {
    format!("raw/{}/recently_played.json", window_key)
}

pub fn processed_snapshot_key(window_key: &str) -> String {
    format!("processed/{}/recently_played.json", window_key)
}
