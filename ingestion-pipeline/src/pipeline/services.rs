use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use common::{
    error::AppError, storage::types::TextChunk, utils::embedding::EmbeddingProvider,
};
use tracing::debug;

use super::config::IngestionTuning;
use crate::utils::{
    chunking::Chunker, file_text_extraction::ExtractorRegistry, resource_gate::ResourceGate,
};

const HEALTH_CHECK_TEXT: &str = "eless embedding health check";

/// Stage adapters the orchestrator drives. Everything behind this trait may be swapped
/// out without touching the manifest or cache logic.
#[async_trait]
pub trait PipelineServices: Send + Sync {
    /// Whether directory discovery should pick up `path`.
    fn supports(&self, path: &Path) -> bool;

    /// Width of every vector `embed` returns.
    fn dimension(&self) -> usize;

    /// Fails with [`AppError::ModelUnavailable`] when the embedder cannot serve at all.
    async fn health_check(&self) -> Result<(), AppError>;

    async fn extract(&self, path: &Path, mime_type: &str) -> Result<String, AppError>;

    async fn chunk(
        &self,
        file_hash: &str,
        text: &str,
        mime_type: &str,
        path: Option<&str>,
    ) -> Result<Vec<TextChunk>, AppError>;

    /// Embeds `texts`, returning one vector per input in the same order.
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, AppError>;
}

pub struct DefaultPipelineServices {
    registry: ExtractorRegistry,
    chunker: Chunker,
    embedding_provider: Arc<EmbeddingProvider>,
    resource_gate: ResourceGate,
    batch_size: usize,
}

impl DefaultPipelineServices {
    pub fn new(
        tuning: &IngestionTuning,
        resource_gate: ResourceGate,
        embedding_provider: Arc<EmbeddingProvider>,
    ) -> Result<Self, AppError> {
        Ok(Self {
            registry: ExtractorRegistry::with_defaults(tuning.max_file_bytes),
            chunker: Chunker::new(tuning.chunk_size, tuning.chunk_overlap)?,
            embedding_provider,
            resource_gate,
            batch_size: tuning.embed_batch_size.max(1),
        })
    }

    fn check_width(&self, vector: &[f32]) -> Result<(), AppError> {
        if vector.len() != self.dimension() {
            return Err(AppError::Model(format!(
                "{} returned a {}-dimensional vector, expected {}",
                self.embedding_provider.backend_label(),
                vector.len(),
                self.dimension()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl PipelineServices for DefaultPipelineServices {
    fn supports(&self, path: &Path) -> bool {
        self.registry.supports(path)
    }

    fn dimension(&self) -> usize {
        self.embedding_provider.dimension()
    }

    async fn health_check(&self) -> Result<(), AppError> {
        let vector = self
            .embedding_provider
            .embed(HEALTH_CHECK_TEXT)
            .await
            .map_err(|err| {
                AppError::ModelUnavailable(format!(
                    "{} backend failed its health check: {err:#}",
                    self.embedding_provider.backend_label()
                ))
            })?;
        self.check_width(&vector)
            .map_err(|err| AppError::ModelUnavailable(err.to_string()))
    }

    async fn extract(&self, path: &Path, mime_type: &str) -> Result<String, AppError> {
        self.registry.extract(path, mime_type).await
    }

    async fn chunk(
        &self,
        file_hash: &str,
        text: &str,
        mime_type: &str,
        path: Option<&str>,
    ) -> Result<Vec<TextChunk>, AppError> {
        self.chunker.chunk(file_hash, text, mime_type, path)
    }

    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, AppError> {
        let total = texts.len();
        let mut rows = Vec::with_capacity(total);
        let mut remaining = texts.into_iter();

        loop {
            let batch_size = self
                .resource_gate
                .recommend_batch_size(self.batch_size)
                .await
                .max(1);
            let batch: Vec<String> = remaining.by_ref().take(batch_size).collect();
            if batch.is_empty() {
                break;
            }
            let requested = batch.len();

            let vectors = self
                .embedding_provider
                .embed_batch(batch)
                .await
                .map_err(|err| AppError::Model(format!("{err:#}")))?;
            if vectors.len() != requested {
                return Err(AppError::Model(format!(
                    "embedder returned {} vectors for {requested} texts",
                    vectors.len()
                )));
            }
            for vector in &vectors {
                self.check_width(vector)?;
            }
            debug!(batch_size, embedded = vectors.len(), total, "embedded batch");
            rows.extend(vectors);
        }

        Ok(rows)
    }
}
