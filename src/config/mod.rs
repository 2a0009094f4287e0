mod file_config;

pub use file_config::FileConfig;

use anyhow::{bail, Result};
use chrono::FixedOffset;
use std::path::PathBuf;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub data_dir: Option<PathBuf>,
    pub upstream_url: String,
    pub page_limit: u32,
    pub window_hours: u32,
    pub utc_offset_hours: i32,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            upstream_url: "https://api.spotify.com/v1".to_string(),
            page_limit: 50,
            window_hours: 12,
            utc_offset_hours: 7,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub upstream_url: String,
    pub page_limit: u32,
    pub window_hours: u32,
    /// Fixed offset the calendar dimension is derived in. Play timestamps
    /// themselves stay UTC everywhere.
    pub reference_zone: FixedOffset,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let data_dir = file
            .data_dir
            .map(PathBuf::from)
            .or_else(|| cli.data_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("data_dir must be specified via --data-dir or in config file")
            })?;

        if !data_dir.exists() {
            bail!("Data directory does not exist: {:?}", data_dir);
        }
        if !data_dir.is_dir() {
            bail!("data_dir is not a directory: {:?}", data_dir);
        }

        let upstream_url = file
            .upstream_url
            .unwrap_or_else(|| cli.upstream_url.clone());

        let page_limit = file.page_limit.unwrap_or(cli.page_limit);
        if page_limit == 0 || page_limit > 50 {
            bail!("page_limit must be between 1 and 50, got {}", page_limit);
        }

        let window_hours = file.window_hours.unwrap_or(cli.window_hours);
        if window_hours == 0 {
            bail!("window_hours must be at least 1");
        }

        let utc_offset_hours = file.utc_offset_hours.unwrap_or(cli.utc_offset_hours);
        let reference_zone = FixedOffset::east_opt(utc_offset_hours * 3600)
            .ok_or_else(|| {
                anyhow::anyhow!("utc_offset_hours out of range: {}", utc_offset_hours)
            })?;

        Ok(Self {
            data_dir,
            upstream_url,
            page_limit,
            window_hours,
            reference_zone,
        })
    }

    /// Root of the local blob bucket holding raw/processed snapshots and
    /// stage markers.
    pub fn bucket_dir(&self) -> PathBuf {
        self.data_dir.join("bucket")
    }

    pub fn warehouse_db_path(&self) -> PathBuf {
        self.data_dir.join("warehouse.db")
    }
}
