use std::collections::HashMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    error::AppError,
    storage::{
        store::StorageManager,
        types::{TextChunk, VectorBatch},
    },
    utils::config::CacheConfig,
};

const BYTES_PER_MB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Chunks,
    Vectors,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 2] = [ArtifactKind::Chunks, ArtifactKind::Vectors];

    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactKind::Chunks => "chunks",
            ArtifactKind::Vectors => "vectors",
        }
    }

    fn extension(self) -> &'static str {
        match self {
            ArtifactKind::Chunks => "json",
            ArtifactKind::Vectors => "bin",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Artifact {
    Chunks(Vec<TextChunk>),
    Vectors(VectorBatch),
}

impl Artifact {
    pub fn kind(&self) -> ArtifactKind {
        match self {
            Artifact::Chunks(_) => ArtifactKind::Chunks,
            Artifact::Vectors(_) => ArtifactKind::Vectors,
        }
    }

    fn encode(&self) -> Result<Bytes, AppError> {
        match self {
            Artifact::Chunks(chunks) => Ok(Bytes::from(serde_json::to_vec(chunks)?)),
            Artifact::Vectors(batch) => batch.encode(),
        }
    }

    fn decode(kind: ArtifactKind, raw: &[u8]) -> Result<Self, AppError> {
        match kind {
            ArtifactKind::Chunks => Ok(Artifact::Chunks(serde_json::from_slice(raw)?)),
            ArtifactKind::Vectors => VectorBatch::decode(raw).map(Artifact::Vectors),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CacheStats {
    pub artifacts: usize,
    pub chunk_artifacts: usize,
    pub vector_artifacts: usize,
    pub cached_files: usize,
    pub total_bytes: u64,
    pub max_bytes: u64,
    pub max_files: usize,
    pub utilisation_percent: f64,
}

#[derive(Debug, Clone)]
struct CachedEntry {
    hash: String,
    bytes: u64,
    objects: usize,
    last_modified: DateTime<Utc>,
}

/// Chunk and vector cache keyed by content hash.
///
/// Artifacts are always rewritten whole. A stored artifact that fails to decode is
/// reported as absent so callers regenerate it from the source file.
#[derive(Clone)]
pub struct Archiver {
    storage: StorageManager,
    max_bytes: u64,
    max_files: usize,
}

impl Archiver {
    pub fn new(storage: StorageManager, config: &CacheConfig) -> Self {
        Self {
            storage,
            max_bytes: config.max_size_mb.saturating_mul(BYTES_PER_MB),
            max_files: config.max_files,
        }
    }

    pub fn storage(&self) -> &StorageManager {
        &self.storage
    }

    fn location(hash: &str, kind: ArtifactKind) -> Result<String, AppError> {
        if hash.is_empty() || !hash.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(AppError::Validation(format!(
                "'{hash}' is not a valid content hash"
            )));
        }
        let shard = hash.get(..2).unwrap_or(hash);
        Ok(format!(
            "{}/{shard}/{hash}.{}",
            kind.as_str(),
            kind.extension()
        ))
    }

    pub async fn save(&self, hash: &str, artifact: &Artifact) -> Result<(), AppError> {
        let location = Self::location(hash, artifact.kind())?;
        let payload = artifact.encode()?;
        let size = payload.len();
        self.storage.put(&location, payload).await?;
        debug!(file_hash = %hash, kind = artifact.kind().as_str(), bytes = size, "artifact cached");
        Ok(())
    }

    /// `Ok(None)` when the artifact was never saved or no longer decodes.
    pub async fn load(&self, hash: &str, kind: ArtifactKind) -> Result<Option<Artifact>, AppError> {
        let location = Self::location(hash, kind)?;
        let Some(raw) = self.storage.get_opt(&location).await? else {
            return Ok(None);
        };
        match Artifact::decode(kind, &raw) {
            Ok(artifact) => Ok(Some(artifact)),
            Err(err) => {
                warn!(
                    file_hash = %hash,
                    kind = kind.as_str(),
                    error = %err,
                    "cached artifact is corrupt; treating as absent"
                );
                Ok(None)
            }
        }
    }

    pub async fn save_chunks(&self, hash: &str, chunks: &[TextChunk]) -> Result<(), AppError> {
        self.save(hash, &Artifact::Chunks(chunks.to_vec())).await
    }

    pub async fn load_chunks(&self, hash: &str) -> Result<Option<Vec<TextChunk>>, AppError> {
        Ok(match self.load(hash, ArtifactKind::Chunks).await? {
            Some(Artifact::Chunks(chunks)) => Some(chunks),
            _ => None,
        })
    }

    pub async fn save_vectors(&self, hash: &str, vectors: &VectorBatch) -> Result<(), AppError> {
        self.save(hash, &Artifact::Vectors(vectors.clone())).await
    }

    pub async fn load_vectors(&self, hash: &str) -> Result<Option<VectorBatch>, AppError> {
        Ok(match self.load(hash, ArtifactKind::Vectors).await? {
            Some(Artifact::Vectors(vectors)) => Some(vectors),
            _ => None,
        })
    }

    pub async fn exists(&self, hash: &str, kind: ArtifactKind) -> Result<bool, AppError> {
        let location = Self::location(hash, kind)?;
        Ok(self.storage.exists(&location).await?)
    }

    /// Removes every artifact stored for `hash`.
    pub async fn delete(&self, hash: &str) -> Result<(), AppError> {
        for kind in ArtifactKind::ALL {
            let location = Self::location(hash, kind)?;
            self.storage.delete(&location).await?;
        }
        Ok(())
    }

    async fn entries(&self) -> Result<(Vec<CachedEntry>, usize, usize), AppError> {
        let mut by_hash: HashMap<String, CachedEntry> = HashMap::new();
        let mut counts = [0usize; 2];

        for (slot, kind) in ArtifactKind::ALL.into_iter().enumerate() {
            for meta in self.storage.list(Some(kind.as_str())).await? {
                let Some(hash) = meta
                    .location
                    .filename()
                    .and_then(|name| name.split('.').next())
                    .map(str::to_owned)
                else {
                    continue;
                };
                if let Some(count) = counts.get_mut(slot) {
                    *count = count.saturating_add(1);
                }
                let entry = by_hash.entry(hash.clone()).or_insert(CachedEntry {
                    hash,
                    bytes: 0,
                    objects: 0,
                    last_modified: meta.last_modified,
                });
                entry.bytes = entry.bytes.saturating_add(meta.size as u64);
                entry.objects = entry.objects.saturating_add(1);
                entry.last_modified = entry.last_modified.max(meta.last_modified);
            }
        }

        let [chunks, vectors] = counts;
        Ok((by_hash.into_values().collect(), chunks, vectors))
    }

    pub async fn stats(&self) -> Result<CacheStats, AppError> {
        let (entries, chunk_artifacts, vector_artifacts) = self.entries().await?;
        let total_bytes: u64 = entries.iter().map(|e| e.bytes).sum();
        let utilisation_percent = if self.max_bytes == 0 {
            0.0
        } else {
            total_bytes as f64 / self.max_bytes as f64 * 100.0
        };
        Ok(CacheStats {
            artifacts: chunk_artifacts.saturating_add(vector_artifacts),
            chunk_artifacts,
            vector_artifacts,
            cached_files: entries.len(),
            total_bytes,
            max_bytes: self.max_bytes,
            max_files: self.max_files,
            utilisation_percent,
        })
    }

    /// Deletes artifacts that no longer decode. Returns the affected hashes.
    pub async fn cleanup_corrupted(&self) -> Result<Vec<String>, AppError> {
        let mut removed = Vec::new();
        for kind in ArtifactKind::ALL {
            for meta in self.storage.list(Some(kind.as_str())).await? {
                let location = meta.location.to_string();
                let Some(raw) = self.storage.get_opt(&location).await? else {
                    continue;
                };
                if Artifact::decode(kind, &raw).is_err() {
                    warn!(location = %location, "removing corrupt cache artifact");
                    self.storage.delete(&location).await?;
                    if let Some(hash) = meta.location.filename().and_then(|n| n.split('.').next())
                    {
                        removed.push(hash.to_owned());
                    }
                }
            }
        }
        removed.sort();
        removed.dedup();
        Ok(removed)
    }

    /// Drops the least recently written files' artifacts until the cache holds at most
    /// `max_bytes` and `max_files` files. Returns the evicted hashes.
    pub async fn evict(&self, max_bytes: u64, max_files: usize) -> Result<Vec<String>, AppError> {
        let (mut entries, _, _) = self.entries().await?;
        entries.sort_by(|a, b| a.last_modified.cmp(&b.last_modified));

        let mut total_bytes: u64 = entries.iter().map(|e| e.bytes).sum();
        let mut files = entries.len();
        let mut evicted = Vec::new();

        for entry in entries {
            if total_bytes <= max_bytes && files <= max_files {
                break;
            }
            self.delete(&entry.hash).await?;
            total_bytes = total_bytes.saturating_sub(entry.bytes);
            files = files.saturating_sub(1);
            debug!(file_hash = %entry.hash, objects = entry.objects, "evicted cache entry");
            evicted.push(entry.hash);
        }

        if !evicted.is_empty() {
            info!(evicted = evicted.len(), total_bytes, "cache eviction finished");
        }
        Ok(evicted)
    }

    /// Eviction against the configured limits.
    pub async fn enforce_limits(&self) -> Result<Vec<String>, AppError> {
        self.evict(self.max_bytes, self.max_files).await
    }

    pub async fn clear(&self) -> Result<(), AppError> {
        for kind in ArtifactKind::ALL {
            self.storage.delete_prefix(kind.as_str()).await?;
        }
        Ok(())
    }
}
