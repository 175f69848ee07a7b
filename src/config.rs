use crate::services::{
    engine::{MIB, TransferConfig},
    retry::RetryPolicy,
};
use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub staging_dir: String,
    pub database_url: String,

    pub chunk_size: u64,
    pub rotation_threshold: u64,
    pub queue_capacity: usize,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,

    pub api_base_url: String,
    pub git_base_url: String,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Chunked file store backed by rotating git repositories")]
pub struct Args {
    /// Host to bind to (overrides CHUNK_VAULT_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides CHUNK_VAULT_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Parent of per-transfer staging directories (overrides CHUNK_VAULT_STAGING_DIR)
    #[arg(long)]
    pub staging_dir: Option<String>,

    /// Database URL (overrides CHUNK_VAULT_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Chunk size in bytes (overrides CHUNK_VAULT_CHUNK_SIZE)
    #[arg(long)]
    pub chunk_size: Option<u64>,

    /// Shard rotation threshold in bytes (overrides CHUNK_VAULT_ROTATION_THRESHOLD)
    #[arg(long)]
    pub rotation_threshold: Option<u64>,

    /// Ready chunks buffered per upload (overrides CHUNK_VAULT_QUEUE_CAPACITY)
    #[arg(long)]
    pub queue_capacity: Option<usize>,

    /// Attempts per remote operation (overrides CHUNK_VAULT_RETRY_ATTEMPTS)
    #[arg(long)]
    pub retry_attempts: Option<u32>,

    /// Delay between attempts (overrides CHUNK_VAULT_RETRY_DELAY_MS)
    #[arg(long)]
    pub retry_delay_ms: Option<u64>,

    /// REST API base of the blob host (overrides CHUNK_VAULT_API_BASE_URL)
    #[arg(long)]
    pub api_base_url: Option<String>,

    /// Git base URL of the blob host (overrides CHUNK_VAULT_GIT_BASE_URL)
    #[arg(long)]
    pub git_base_url: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::merge(args)?, migrate))
    }

    fn merge(args: Args) -> Result<Self> {
        let defaults = TransferConfig::default();

        let cfg = Self {
            host: pick(args.host, "CHUNK_VAULT_HOST", "0.0.0.0".to_string())?,
            port: pick(args.port, "CHUNK_VAULT_PORT", 3000)?,
            staging_dir: pick(args.staging_dir, "CHUNK_VAULT_STAGING_DIR", "./data/staging".to_string())?,
            database_url: pick(
                args.database_url,
                "CHUNK_VAULT_DATABASE_URL",
                "sqlite://./data/meta/chunk_vault.db".to_string(),
            )?,
            chunk_size: pick(args.chunk_size, "CHUNK_VAULT_CHUNK_SIZE", defaults.chunk_size)?,
            rotation_threshold: pick(
                args.rotation_threshold,
                "CHUNK_VAULT_ROTATION_THRESHOLD",
                defaults.rotation_threshold,
            )?,
            queue_capacity: pick(args.queue_capacity, "CHUNK_VAULT_QUEUE_CAPACITY", defaults.queue_capacity)?,
            retry_attempts: pick(
                args.retry_attempts,
                "CHUNK_VAULT_RETRY_ATTEMPTS",
                defaults.retry.max_attempts,
            )?,
            retry_delay_ms: pick(
                args.retry_delay_ms,
                "CHUNK_VAULT_RETRY_DELAY_MS",
                defaults.retry.delay.as_millis() as u64,
            )?,
            api_base_url: pick(
                args.api_base_url,
                "CHUNK_VAULT_API_BASE_URL",
                "https://api.github.com".to_string(),
            )?,
            git_base_url: pick(args.git_base_url, "CHUNK_VAULT_GIT_BASE_URL", "https://github.com".to_string())?,
        };

        if cfg.chunk_size == 0 {
            anyhow::bail!("chunk size must be at least one byte");
        }
        if cfg.chunk_size < MIB {
            tracing::warn!(chunk_size = cfg.chunk_size, "chunk size below 1 MiB, expect many small commits");
        }
        Ok(cfg)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Knobs handed to the transfer engine.
    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            chunk_size: self.chunk_size,
            rotation_threshold: self.rotation_threshold,
            queue_capacity: self.queue_capacity.max(1),
            retry: RetryPolicy::new(self.retry_attempts, Duration::from_millis(self.retry_delay_ms)),
        }
    }
}

/// CLI value if given, else the parsed environment variable, else `default`.
fn pick<T>(cli: Option<T>, var: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Some(value) = cli {
        return Ok(value);
    }
    match env::var(var) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {var} value `{value}`")),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {var}")),
    }
}
