//! Stage idempotency guard.
//!
//! Each (stage, window) pair gets two sentinels in the blob store: an
//! in-flight marker created atomically by `try_begin` and the `_SUCCESS`
//! completion marker written by `complete`. The atomic create-if-absent
//! closes the check-then-act race that separate stat + write calls leave
//! open: of two concurrent runs for the same window, exactly one acquires
//! the stage.
//!
//! Failing to acquire is not an error. Callers skip the stage and report
//! success, which is what makes orchestrator retries safe.

use crate::blob_store::BlobStore;
use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, info};

/// Pipeline stages, in execution order. The prefix doubles as the blob
/// namespace the stage's sentinels live under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Extract,
    Transform,
    Load,
}

impl Stage {
    pub fn prefix(&self) -> &'static str {
        match self {
            Stage::Extract => "raw",
            Stage::Transform => "processed",
            Stage::Load => "warehouse",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Extract => "extract",
            Stage::Transform => "transform",
            Stage::Load => "load",
        }
    }
}

fn success_key(stage: Stage, window_key: &str) -> String {
    format!("{}/{}/_SUCCESS", stage.prefix(), window_key)
}

fn running_key(stage: Stage, window_key: &str) -> String {
    format!("{}/{}/_RUNNING", stage.prefix(), window_key)
}

#[derive(Clone)]
pub struct StageGuard {
    blobs: Arc<dyn BlobStore>,
}

impl StageGuard {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    /// Whether `complete` has been called for this (stage, window).
    pub fn is_complete(&self, stage: Stage, window_key: &str) -> Result<bool> {
        self.blobs.exists(&success_key(stage, window_key))
    }

    /// Atomically claim the stage for this window. Returns false when the
    /// stage is already completed or another run holds the in-flight marker.
    pub fn try_begin(&self, stage: Stage, window_key: &str) -> Result<bool> {
        if self.is_complete(stage, window_key)? {
            info!(
                "Stage {} already completed for window {}, skipping",
                stage.name(),
                window_key
            );
            return Ok(false);
        }
        let acquired = self.blobs.put_if_absent(&running_key(stage, window_key), b"")?;
        if acquired {
            debug!("Acquired {} stage for window {}", stage.name(), window_key);
        } else {
            info!(
                "Stage {} already in flight for window {}, skipping",
                stage.name(),
                window_key
            );
        }
        Ok(acquired)
    }

    /// Record completion. Must only be called once every downstream write
    /// for the stage is durably committed.
    pub fn complete(&self, stage: Stage, window_key: &str) -> Result<()> {
        self.blobs.put(&success_key(stage, window_key), b"")?;
        self.blobs.delete(&running_key(stage, window_key))?;
        info!(
            "Success marker written for {} stage, window {}",
            stage.name(),
            window_key
        );
        Ok(())
    }

    /// Release the in-flight marker after a failed attempt so an
    /// orchestrator retry can re-run the stage from scratch.
    pub fn abort(&self, stage: Stage, window_key: &str) -> Result<()> {
        self.blobs.delete(&running_key(stage, window_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::FsBlobStore;
    use tempfile::TempDir;

    fn create_test_guard() -> (StageGuard, Arc<dyn BlobStore>, TempDir) {
        let tmp = TempDir::new().unwrap();
        let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(tmp.path()).unwrap());
        (StageGuard::new(blobs.clone()), blobs, tmp)
    }

    #[test]
    fn test_begin_complete_lifecycle() {
        let (guard, blobs, _tmp) = create_test_guard();
        let wk = "2025-01-01-00";

        assert!(!guard.is_complete(Stage::Extract, wk).unwrap());
        assert!(guard.try_begin(Stage::Extract, wk).unwrap());
        guard.complete(Stage::Extract, wk).unwrap();

        assert!(guard.is_complete(Stage::Extract, wk).unwrap());
        assert!(blobs.exists("raw/2025-01-01-00/_SUCCESS").unwrap());
        // In-flight marker is cleared on completion.
        assert!(!blobs.exists("raw/2025-01-01-00/_RUNNING").unwrap());
    }

    #[test]
    fn test_try_begin_rejects_completed_stage() {
        let (guard, _blobs, _tmp) = create_test_guard();
        let wk = "2025-01-01-00";
        assert!(guard.try_begin(Stage::Transform, wk).unwrap());
        guard.complete(Stage::Transform, wk).unwrap();
        assert!(!guard.try_begin(Stage::Transform, wk).unwrap());
    }

    #[test]
    fn test_try_begin_rejects_in_flight_stage() {
        let (guard, _blobs, _tmp) = create_test_guard();
        let wk = "2025-01-01-00";
        assert!(guard.try_begin(Stage::Load, wk).unwrap());
        // Second claimant for the same window loses.
        assert!(!guard.try_begin(Stage::Load, wk).unwrap());
    }

    #[test]
    fn test_abort_releases_stage_for_retry() {
        let (guard, _blobs, _tmp) = create_test_guard();
        let wk = "2025-01-01-00";
        assert!(guard.try_begin(Stage::Extract, wk).unwrap());
        guard.abort(Stage::Extract, wk).unwrap();
        assert!(guard.try_begin(Stage::Extract, wk).unwrap());
    }

    #[test]
    fn test_stages_are_independent() {
        let (guard, _blobs, _tmp) = create_test_guard();
        let wk = "2025-01-01-00";
        assert!(guard.try_begin(Stage::Extract, wk).unwrap());
        guard.complete(Stage::Extract, wk).unwrap();
        // Completing extract does not claim transform or load.
        assert!(guard.try_begin(Stage::Transform, wk).unwrap());
        assert!(guard.try_begin(Stage::Load, wk).unwrap());
    }

    #[test]
    fn test_windows_are_independent() {
        let (guard, _blobs, _tmp) = create_test_guard();
        assert!(guard.try_begin(Stage::Extract, "2025-01-01-00").unwrap());
        assert!(guard.try_begin(Stage::Extract, "2025-01-01-12").unwrap());
    }
}
