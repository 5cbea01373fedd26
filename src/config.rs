use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::{env, path::PathBuf, str::FromStr};

use crate::{client::client::DEFAULT_CHUNK_SIZE, services::url_store::DEFAULT_URL_STORE_PATH};

/// Default PATCH body limit: 64 MiB.
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 64 * 1024 * 1024;

/// Centralized server configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub base_path: String,
    /// Largest accepted `Upload-Length`; 0 means unlimited.
    pub max_size: u64,
    pub max_chunk_size: usize,
}

/// What the binary was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Serve,
    Migrate,
    Upload(UploadArgs),
    Info(InfoArgs),
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "TUS 1.0.0 resumable upload server and client")]
pub struct Args {
    /// Host to bind to (overrides TUS_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides TUS_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where upload payloads are stored (overrides TUS_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides TUS_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// URL path uploads are created under (overrides TUS_BASE_PATH)
    #[arg(long)]
    pub base_path: Option<String>,

    /// Maximum upload size in bytes, 0 for unlimited (overrides TUS_MAX_SIZE)
    #[arg(long)]
    pub max_size: Option<u64>,

    /// Maximum PATCH body in bytes (overrides TUS_MAX_CHUNK_SIZE)
    #[arg(long)]
    pub max_chunk_size: Option<usize>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Upload a file to a TUS server
    Upload(UploadArgs),
    /// Show the state of an existing upload
    Info(InfoArgs),
}

#[derive(ClapArgs, Debug, Clone, PartialEq, Eq)]
pub struct UploadArgs {
    /// File to upload
    pub file: PathBuf,

    /// Creation endpoint, e.g. http://localhost:8080/files
    #[arg(long)]
    pub endpoint: String,

    /// Bytes per PATCH request
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,

    /// Retries per chunk after the first attempt
    #[arg(long, default_value_t = 0)]
    pub max_retries: u32,

    /// Delay before the first retry, doubled for each one after
    #[arg(long, default_value_t = 1000)]
    pub retry_delay_ms: u64,

    /// JSON file remembering upload URLs for resuming; bare flag uses .tus_urls.json
    #[arg(long, num_args = 0..=1, default_missing_value = DEFAULT_URL_STORE_PATH)]
    pub url_store: Option<PathBuf>,

    /// Do not send Upload-Checksum headers
    #[arg(long)]
    pub no_checksum: bool,
}

#[derive(ClapArgs, Debug, Clone, PartialEq, Eq)]
pub struct InfoArgs {
    /// Upload URL returned at creation
    pub upload_url: String,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and the run mode.
    pub fn from_env_and_args() -> Result<(Self, Mode)> {
        // Parse CLI once
        let args = Args::parse();
        Self::resolve(args, |key| env::var(key).ok())
    }

    /// Merge parsed args over values from `lookup` (normally the process env).
    pub fn resolve(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<(Self, Mode)> {
        // --- Environment fallback ---
        let env_host = lookup("TUS_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let env_port = parse_env(&lookup, "TUS_PORT", 8080u16)?;
        let env_storage = lookup("TUS_STORAGE_DIR").unwrap_or_else(|| "./data/uploads".into());
        let env_db = lookup("TUS_DATABASE_URL")
            .unwrap_or_else(|| "sqlite://./data/meta/uploads.db".into());
        let env_base = lookup("TUS_BASE_PATH").unwrap_or_else(|| "/files".into());
        let env_max_size = parse_env(&lookup, "TUS_MAX_SIZE", 0u64)?;
        let env_chunk = parse_env(&lookup, "TUS_MAX_CHUNK_SIZE", DEFAULT_MAX_CHUNK_SIZE)?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            base_path: args.base_path.unwrap_or(env_base),
            max_size: args.max_size.unwrap_or(env_max_size),
            max_chunk_size: args.max_chunk_size.unwrap_or(env_chunk),
        };

        let mode = match args.command {
            Some(Command::Upload(upload)) => Mode::Upload(upload),
            Some(Command::Info(info)) => Mode::Info(info),
            None if args.migrate => Mode::Migrate,
            None => Mode::Serve,
        };

        Ok((cfg, mode))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_env<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        None => Ok(default),
    }
}
