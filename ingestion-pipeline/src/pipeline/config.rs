use std::path::PathBuf;

use common::utils::config::AppConfig;

#[derive(Debug, Clone)]
pub struct IngestionTuning {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub embed_batch_size: usize,
    pub max_file_bytes: u64,
    pub file_workers: usize,
}

impl Default for IngestionTuning {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            chunk_overlap: 50,
            embed_batch_size: 32,
            max_file_bytes: 100 * 1024 * 1024,
            file_workers: 1,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct IngestionConfig {
    pub tuning: IngestionTuning,
    /// Directories never descended into during discovery, such as the cache itself.
    pub skip_dirs: Vec<PathBuf>,
}

impl IngestionConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            tuning: IngestionTuning {
                chunk_size: config.chunking.chunk_size,
                chunk_overlap: config.chunking.chunk_overlap,
                embed_batch_size: config.embedding.batch_size.max(1),
                max_file_bytes: config
                    .streaming
                    .max_file_size_mb
                    .saturating_mul(1024 * 1024),
                file_workers: config.parallel.file_workers.max(1),
            },
            skip_dirs: vec![config.cache.directory.clone()],
        }
    }
}
