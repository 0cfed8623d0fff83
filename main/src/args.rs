use std::{path::PathBuf, str::FromStr};

use clap::{Args, Parser, Subcommand};
use common::{storage::types::FileStatus, utils::config::AppConfig};

#[derive(Debug, Parser)]
#[command(
    name = "eless",
    version,
    about = "Resumable document-to-vector ingestion"
)]
pub struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override cache.directory
    #[arg(long, global = true)]
    pub cache_dir: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Ingest a file or directory
    Process(ProcessArgs),
    /// Load files whose vectors are cached but not yet stored
    Resume,
    /// Show manifest records and statistics
    Status(StatusArgs),
    /// Move records back to PENDING
    Reset(ResetArgs),
    /// Reset records whose cached artifacts are missing
    Recover,
    /// Inspect or maintain the chunk/vector cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Debug, Args)]
pub struct ProcessArgs {
    /// File or directory to ingest
    pub path: PathBuf,

    /// Override chunking.chunk_size
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Override embedding.batch_size
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Override parallel.file_workers
    #[arg(long)]
    pub workers: Option<usize>,
}

impl ProcessArgs {
    pub fn apply(&self, config: &mut AppConfig) {
        if let Some(chunk_size) = self.chunk_size {
            config.chunking.chunk_size = chunk_size;
        }
        if let Some(batch_size) = self.batch_size {
            config.embedding.batch_size = batch_size;
        }
        if let Some(workers) = self.workers {
            config.parallel.file_workers = workers;
        }
    }
}

fn parse_status(raw: &str) -> Result<FileStatus, String> {
    FileStatus::from_str(raw).map_err(|err| err.to_string())
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Show a single record
    pub hash: Option<String>,

    /// Only list records with this status
    #[arg(long, value_parser = parse_status, conflicts_with = "hash")]
    pub status: Option<FileStatus>,
}

#[derive(Debug, Args)]
pub struct ResetArgs {
    /// Content hash to reset
    #[arg(required_unless_present = "errors")]
    pub hash: Option<String>,

    /// Reset every record that has failed
    #[arg(long, conflicts_with = "hash")]
    pub errors: bool,

    /// With --errors, only reset records that failed at least this often
    #[arg(long, default_value_t = 1, requires = "errors")]
    pub min_errors: u32,
}

#[derive(Debug, Clone, Copy, Subcommand)]
pub enum CacheAction {
    /// Artifact counts, size and limits
    Stats,
    /// Delete artifacts that fail to decode
    Cleanup,
    /// Evict the oldest artifacts until the configured limits hold
    Evict,
    /// Delete every cached artifact
    Clear,
}
