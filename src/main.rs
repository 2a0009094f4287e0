use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use playstream_etl::blob_store::{BlobStore, FsBlobStore};
use playstream_etl::config::{self, AppConfig};
use playstream_etl::pipeline::{Extractor, Loader, Transformer};
use playstream_etl::upstream::{AccessToken, RecentlyPlayedClient};
use playstream_etl::warehouse::SqliteWarehouse;
use playstream_etl::window::WindowKey;

const ACCESS_TOKEN_ENV: &str = "SPOTIFY_ACCESS_TOKEN";

fn parse_path(s: &str) -> Result<PathBuf, String> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(format!("Error resolving path '{}': {}", s, msg));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir().map_err(|e| format!("Failed to get current dir: {}", e))?;
    Ok(cwd.join(original_path))
}

fn parse_dir(s: &str) -> Result<PathBuf, String> {
    let path = parse_path(s)?;
    if !path.exists() {
        return Err(format!("Directory does not exist: {}", s));
    }
    if !path.is_dir() {
        return Err(format!("Path is not a directory: {}", s));
    }
    Ok(path)
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to TOML configuration file. Values in the file override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Directory holding the blob bucket and the warehouse database.
    /// Can also be specified in config file.
    #[clap(long, value_parser = parse_dir)]
    pub data_dir: Option<PathBuf>,

    /// Base URL of the recently-played API.
    #[clap(long, default_value = "https://api.spotify.com/v1")]
    pub upstream_url: String,

    /// Page size for upstream requests (the API caps this at 50).
    #[clap(long, default_value_t = 50)]
    pub page_limit: u32,

    /// Length of the extraction window in hours.
    #[clap(long, default_value_t = 12)]
    pub window_hours: u32,

    /// UTC offset (in hours) the calendar dimension is derived in.
    #[clap(long, default_value_t = 7, allow_hyphen_values = true)]
    pub utc_offset_hours: i32,

    /// Bearer token for the upstream API. Falls back to the
    /// SPOTIFY_ACCESS_TOKEN environment variable.
    #[clap(long)]
    pub access_token: Option<String>,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Pull new plays from upstream into a raw snapshot for the current window.
    Extract,
    /// Validate, deduplicate and enrich the raw snapshot of a window.
    Transform {
        /// Window to process, in YYYY-MM-DD-HH form.
        #[clap(long)]
        window_key: String,
    },
    /// Merge the processed snapshot of a window into the warehouse.
    Load {
        /// Window to load, in YYYY-MM-DD-HH form.
        #[clap(long)]
        window_key: String,
    },
    /// Run extract, transform and load back to back for the current window.
    Run,
    /// Print warehouse row counts.
    Stats,
}

/// Convert CLI args to CliConfig for config resolution
impl From<&CliArgs> for config::CliConfig {
    fn from(args: &CliArgs) -> Self {
        config::CliConfig {
            data_dir: args.data_dir.clone(),
            upstream_url: args.upstream_url.clone(),
            page_limit: args.page_limit,
            window_hours: args.window_hours,
            utc_offset_hours: args.utc_offset_hours,
        }
    }
}

fn resolve_access_token(cli_args: &CliArgs) -> Result<AccessToken> {
    let token = match &cli_args.access_token {
        Some(token) => token.clone(),
        None => match std::env::var(ACCESS_TOKEN_ENV) {
            Ok(token) => token,
            Err(_) => bail!(
                "No access token: pass --access-token or set {}",
                ACCESS_TOKEN_ENV
            ),
        },
    };
    if token.trim().is_empty() {
        bail!("Access token is empty");
    }
    Ok(AccessToken::new(token))
}

fn build_extractor(
    cli_args: &CliArgs,
    app_config: &AppConfig,
    blobs: Arc<dyn BlobStore>,
) -> Result<Extractor> {
    let token = resolve_access_token(cli_args)?;
    let client = RecentlyPlayedClient::new(&app_config.upstream_url, token, app_config.page_limit)?;
    Ok(Extractor::new(Box::new(client), blobs))
}

fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .unwrap();

    // Load TOML config if provided
    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            Some(config::FileConfig::load(path)?)
        }
        None => None,
    };

    let app_config = AppConfig::resolve(&config::CliConfig::from(&cli_args), file_config)?;
    info!("Resolved configuration: {:?}", app_config);

    let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(app_config.bucket_dir())?);

    match &cli_args.command {
        Command::Extract => {
            let extractor = build_extractor(&cli_args, &app_config, blobs)?;
            let window = extractor.run(app_config.window_hours)?;
            println!("{}", window);
        }
        Command::Transform { window_key } => {
            let window = WindowKey::parse(window_key)?;
            let transformer = Transformer::new(blobs, app_config.reference_zone);
            transformer.run(window.as_str())?;
        }
        Command::Load { window_key } => {
            let window = WindowKey::parse(window_key)?;
            let warehouse = Arc::new(SqliteWarehouse::new(app_config.warehouse_db_path())?);
            let loader = Loader::new(blobs, warehouse);
            loader.run(window.as_str())?;
        }
        Command::Run => {
            let extractor = build_extractor(&cli_args, &app_config, blobs.clone())?;
            let window = extractor.run(app_config.window_hours)?;

            let transformer = Transformer::new(blobs.clone(), app_config.reference_zone);
            transformer.run(window.as_str())?;

            let warehouse = Arc::new(SqliteWarehouse::new(app_config.warehouse_db_path())?);
            let loader = Loader::new(blobs, warehouse);
            loader.run(window.as_str())?;
            println!("{}", window);
        }
        Command::Stats => {
            let warehouse = SqliteWarehouse::new(app_config.warehouse_db_path())?;
            let stats = warehouse.stats()?;
            println!(
                "artists: {}\nsongs: {}\ndates: {}\nfact rows: {}",
                stats.artists, stats.songs, stats.dates, stats.facts
            );
        }
    }

    Ok(())
}
