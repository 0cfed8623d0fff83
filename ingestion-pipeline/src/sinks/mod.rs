mod flat;
mod loader;
mod memory;
mod surreal;

pub use flat::FlatSink;
pub use loader::DatabaseLoader;
pub use memory::MemorySink;
pub use surreal::SurrealSink;

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use common::{
    error::AppError,
    storage::{store::StorageManager, types::TextChunk},
    utils::config::SinkConnection,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// One vector as handed to a sink. `id` is stable per `(hash, chunk_index)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VectorRecord {
    pub id: String,
    pub vector: Vec<f32>,
    pub metadata: Value,
}

impl VectorRecord {
    pub fn from_chunk(chunk: &TextChunk, vector: &[f32]) -> Self {
        Self {
            id: chunk.vector_id(),
            vector: vector.to_vec(),
            metadata: json!({
                "text": chunk.text,
                "file_hash": chunk.metadata.file_hash,
                "chunk_index": chunk.metadata.chunk_index,
                "byte_offset": chunk.metadata.byte_offset,
                "char_len": chunk.metadata.char_len,
                "path": chunk.metadata.path,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub id: String,
    pub score: f32,
    pub metadata: Value,
}

#[async_trait]
pub trait VectorSink: Send + Sync {
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<(), AppError>;

    /// Insert or replace every record in `batch`.
    async fn upsert(&self, batch: &[VectorRecord]) -> Result<(), AppError>;

    async fn search(&self, vector: &[f32], limit: usize) -> Result<Vec<SearchHit>, AppError>;

    async fn close(&self) -> Result<(), AppError>;
}

/// Shared handles sinks may need when they are built.
#[derive(Clone)]
pub struct SinkContext {
    pub storage: StorageManager,
}

pub type SinkFactory =
    fn(&str, &SinkConnection, &SinkContext) -> Result<Arc<dyn VectorSink>, AppError>;

/// Sink constructors keyed by the connection `type`.
pub struct SinkRegistry {
    factories: HashMap<&'static str, SinkFactory>,
}

impl SinkRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("memory", |name, _, _| Ok(Arc::new(MemorySink::new(name))));
        registry.register("flat", |name, connection, ctx| match connection {
            SinkConnection::Flat { path } => Ok(Arc::new(FlatSink::new(
                name,
                ctx.storage.clone(),
                path.clone(),
            ))),
            other => Err(mismatched(name, other)),
        });
        registry.register("surrealdb", |name, connection, _| {
            SurrealSink::from_connection(name, connection)
                .map(|sink| Arc::new(sink) as Arc<dyn VectorSink>)
        });
        registry
    }

    pub fn register(&mut self, type_key: &'static str, factory: SinkFactory) {
        self.factories.insert(type_key, factory);
    }

    pub fn build(
        &self,
        name: &str,
        connection: &SinkConnection,
        ctx: &SinkContext,
    ) -> Result<Arc<dyn VectorSink>, AppError> {
        let factory = self.factories.get(connection.type_key()).ok_or_else(|| {
            AppError::Validation(format!(
                "no sink registered for type '{}' (target '{name}')",
                connection.type_key()
            ))
        })?;
        factory(name, connection, ctx)
    }
}

impl Default for SinkRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn mismatched(name: &str, connection: &SinkConnection) -> AppError {
    AppError::Validation(format!(
        "target '{name}' was routed to the wrong sink for type '{}'",
        connection.type_key()
    ))
}

pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Ranks `records` against `query`, best first.
pub(crate) fn rank<'a>(
    records: impl Iterator<Item = &'a VectorRecord>,
    query: &[f32],
    limit: usize,
) -> Vec<SearchHit> {
    let mut hits: Vec<SearchHit> = records
        .map(|record| SearchHit {
            id: record.id.clone(),
            score: cosine_similarity(&record.vector, query),
            metadata: record.metadata.clone(),
        })
        .collect();
    hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
    hits.truncate(limit);
    hits
}
