//! Load stage: merge a processed snapshot into the warehouse.

use super::{processed_snapshot_key, EnrichedPlay, EtlError};
use crate::blob_store::BlobStore;
use crate::guard::{Stage, StageGuard};
use crate::warehouse::{LoadReport, SqliteWarehouse};
use anyhow::Context;
use std::sync::Arc;
use tracing::{error, info};

pub struct Loader {
    blobs: Arc<dyn BlobStore>,
    guard: StageGuard,
    warehouse: Arc<SqliteWarehouse>,
}

impl Loader {
    pub fn new(blobs: Arc<dyn BlobStore>, warehouse: Arc<SqliteWarehouse>) -> Self {
        let guard = StageGuard::new(blobs.clone());
        Self {
            blobs,
            guard,
            warehouse,
        }
    }

    /// Returns None when the stage already completed (or is in flight) for
    /// this window and nothing was loaded.
    pub fn run(&self, window_key: &str) -> Result<Option<LoadReport>, EtlError> {
        if !self.guard.try_begin(Stage::Load, window_key)? {
            return Ok(None);
        }

        match self.load_window(window_key) {
            Ok(report) => {
                self.guard.complete(Stage::Load, window_key)?;
                info!(
                    "Load complete for window {}: {} merged, {} skipped",
                    window_key, report.loaded, report.skipped
                );
                Ok(Some(report))
            }
            Err(e) => {
                error!("Load failed for window {}: {}", window_key, e);
                if let Err(abort_err) = self.guard.abort(Stage::Load, window_key) {
                    error!("Failed to release load marker: {}", abort_err);
                }
                Err(e)
            }
        }
    }

    fn load_window(&self, window_key: &str) -> Result<LoadReport, EtlError> {
        let bytes = self.blobs.get(&processed_snapshot_key(window_key))?;
        let rows: Vec<EnrichedPlay> =
            serde_json::from_slice(&bytes).context("Failed to parse processed snapshot")?;
        let report = self.warehouse.load_window(window_key, &rows)?;
        Ok(report)
    }
}
