use std::{collections::HashMap, path::PathBuf};

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use tracing::warn;

use crate::error::AppError;

#[derive(Clone, Deserialize, Debug)]
pub struct CacheConfig {
    #[serde(default = "default_cache_dir")]
    pub directory: PathBuf,
    #[serde(default = "default_manifest_file")]
    pub manifest_file: String,
    #[serde(default = "default_cache_max_size_mb")]
    pub max_size_mb: u64,
    #[serde(default = "default_cache_max_files")]
    pub max_files: usize,
}

#[derive(Clone, Deserialize, Debug)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

#[derive(Clone, Deserialize, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackendKind {
    #[default]
    Hashed,
    FastEmbed,
    OpenAI,
}

#[derive(Clone, Deserialize, Debug)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub backend: EmbeddingBackendKind,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,
    #[serde(default = "default_embedding_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub openai_api_key: Option<String>,
    #[serde(default = "default_base_url")]
    pub openai_base_url: String,
}

#[derive(Clone, Deserialize, Debug)]
pub struct ResourceLimits {
    #[serde(default = "default_memory_warning_percent")]
    pub memory_warning_percent: f32,
    #[serde(default = "default_memory_critical_percent")]
    pub memory_critical_percent: f32,
    #[serde(default = "default_cpu_high_percent")]
    pub cpu_high_percent: f32,
    #[serde(default = "default_min_memory_mb")]
    pub min_memory_mb: u64,
    #[serde(default = "default_min_batch_size")]
    pub min_batch_size: usize,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_wait_budget_ms")]
    pub wait_budget_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_true")]
    pub enable_adaptive_batching: bool,
}

#[derive(Clone, Deserialize, Debug)]
pub struct ParallelConfig {
    #[serde(default = "default_file_workers")]
    pub file_workers: usize,
}

#[derive(Clone, Deserialize, Debug)]
pub struct StreamingConfig {
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,
}

/// A named vector sink connection, selected by its `type` key.
#[derive(Clone, Deserialize, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SinkConnection {
    Memory,
    Flat {
        #[serde(default = "default_flat_index_path")]
        path: String,
    },
    SurrealDb {
        address: String,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
        #[serde(default = "default_surreal_namespace")]
        namespace: String,
        #[serde(default = "default_surreal_database")]
        database: String,
        #[serde(default = "default_surreal_table")]
        table: String,
    },
}

impl SinkConnection {
    pub fn type_key(&self) -> &'static str {
        match self {
            SinkConnection::Memory => "memory",
            SinkConnection::Flat { .. } => "flat",
            SinkConnection::SurrealDb { .. } => "surrealdb",
        }
    }
}

#[derive(Clone, Deserialize, Debug)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_db_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_db_retry_attempts")]
    pub retry_attempts: usize,
    #[serde(default = "default_targets")]
    pub targets: Vec<String>,
    #[serde(default = "default_connections")]
    pub connections: HashMap<String, SinkConnection>,
}

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    #[serde(default = "CacheConfig::default")]
    pub cache: CacheConfig,
    #[serde(default = "ChunkingConfig::default")]
    pub chunking: ChunkingConfig,
    #[serde(default = "EmbeddingConfig::default")]
    pub embedding: EmbeddingConfig,
    #[serde(default = "ResourceLimits::default")]
    pub resource_limits: ResourceLimits,
    #[serde(default = "ParallelConfig::default")]
    pub parallel: ParallelConfig,
    #[serde(default = "StreamingConfig::default")]
    pub streaming: StreamingConfig,
    #[serde(default = "DatabaseConfig::default")]
    pub databases: DatabaseConfig,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".eless_cache")
}

fn default_manifest_file() -> String {
    "manifest.json".to_string()
}

fn default_cache_max_size_mb() -> u64 {
    1024
}

fn default_cache_max_files() -> usize {
    10_000
}

fn default_chunk_size() -> usize {
    500
}

fn default_chunk_overlap() -> usize {
    50
}

fn default_embedding_dimension() -> usize {
    384
}

fn default_embedding_batch_size() -> usize {
    32
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_memory_warning_percent() -> f32 {
    80.0
}

fn default_memory_critical_percent() -> f32 {
    90.0
}

fn default_cpu_high_percent() -> f32 {
    85.0
}

fn default_min_memory_mb() -> u64 {
    256
}

fn default_min_batch_size() -> usize {
    1
}

fn default_max_batch_size() -> usize {
    256
}

fn default_wait_budget_ms() -> u64 {
    5_000
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_true() -> bool {
    true
}

fn default_file_workers() -> usize {
    1
}

fn default_max_file_size_mb() -> u64 {
    100
}

fn default_flat_index_path() -> String {
    "flat_index/index.json".to_string()
}

fn default_surreal_namespace() -> String {
    "eless".to_string()
}

fn default_surreal_database() -> String {
    "eless".to_string()
}

fn default_surreal_table() -> String {
    "eless_embedding".to_string()
}

fn default_db_batch_size() -> usize {
    64
}

fn default_db_timeout_secs() -> u64 {
    30
}

fn default_db_retry_attempts() -> usize {
    3
}

fn default_targets() -> Vec<String> {
    vec!["flat".to_string()]
}

fn default_connections() -> HashMap<String, SinkConnection> {
    let mut connections = HashMap::new();
    connections.insert("memory".to_string(), SinkConnection::Memory);
    connections.insert(
        "flat".to_string(),
        SinkConnection::Flat {
            path: default_flat_index_path(),
        },
    );
    connections
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: default_cache_dir(),
            manifest_file: default_manifest_file(),
            max_size_mb: default_cache_max_size_mb(),
            max_files: default_cache_max_files(),
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackendKind::default(),
            model: None,
            dimension: default_embedding_dimension(),
            batch_size: default_embedding_batch_size(),
            openai_api_key: None,
            openai_base_url: default_base_url(),
        }
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_warning_percent: default_memory_warning_percent(),
            memory_critical_percent: default_memory_critical_percent(),
            cpu_high_percent: default_cpu_high_percent(),
            min_memory_mb: default_min_memory_mb(),
            min_batch_size: default_min_batch_size(),
            max_batch_size: default_max_batch_size(),
            wait_budget_ms: default_wait_budget_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            enable_adaptive_batching: true,
        }
    }
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            file_workers: default_file_workers(),
        }
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            max_file_size_mb: default_max_file_size_mb(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            batch_size: default_db_batch_size(),
            timeout_secs: default_db_timeout_secs(),
            retry_attempts: default_db_retry_attempts(),
            targets: default_targets(),
            connections: default_connections(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            resource_limits: ResourceLimits::default(),
            parallel: ParallelConfig::default(),
            streaming: StreamingConfig::default(),
            databases: DatabaseConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn manifest_path(&self) -> PathBuf {
        self.cache.directory.join(&self.cache.manifest_file)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.chunking.chunk_size == 0 {
            return Err(AppError::Validation(
                "chunking.chunk_size must be greater than zero".into(),
            ));
        }
        if self.chunking.chunk_overlap >= self.chunking.chunk_size {
            return Err(AppError::Validation(format!(
                "chunking.chunk_overlap ({}) must be smaller than chunking.chunk_size ({})",
                self.chunking.chunk_overlap, self.chunking.chunk_size
            )));
        }
        if self.embedding.dimension == 0 {
            return Err(AppError::Validation(
                "embedding.dimension must be greater than zero".into(),
            ));
        }
        let limits = &self.resource_limits;
        if limits.min_batch_size == 0 || limits.min_batch_size > limits.max_batch_size {
            return Err(AppError::Validation(format!(
                "resource_limits batch bounds are invalid; ensure 0 < min ({}) <= max ({})",
                limits.min_batch_size, limits.max_batch_size
            )));
        }
        if self.databases.batch_size == 0 {
            return Err(AppError::Validation(
                "databases.batch_size must be greater than zero".into(),
            ));
        }
        for target in &self.databases.targets {
            if !self.databases.connections.contains_key(target) {
                return Err(AppError::Validation(format!(
                    "database target '{target}' has no entry under databases.connections"
                )));
            }
        }
        if self.chunking.chunk_size < self.databases.batch_size {
            warn!(
                chunk_size = self.chunking.chunk_size,
                batch_size = self.databases.batch_size,
                "chunk size is smaller than the database batch size"
            );
        }
        Ok(())
    }
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    load_config(None)
}

/// Loads `eless.*` (or the given file) layered under `ELESS_SECTION__FIELD` env vars.
pub fn load_config(path: Option<&std::path::Path>) -> Result<AppConfig, ConfigError> {
    let file_source = match path {
        Some(path) => File::from(path).required(true),
        None => File::with_name("eless").required(false),
    };

    let config = Config::builder()
        .add_source(file_source)
        .add_source(
            Environment::with_prefix("ELESS")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    config.try_deserialize()
}
