use std::{collections::BTreeMap, path::Path, sync::Arc};

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    error::AppError,
    storage::{
        archiver::Archiver,
        manifest::{InMemoryManifestStore, JsonFileManifestStore, ManifestDocument, ManifestStore},
        types::{
            file_record::{ERROR_AT_KEY, FAILED_STAGE_KEY},
            FileRecord, FileStatus,
        },
    },
};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ManifestStats {
    pub total_files: usize,
    pub by_status: BTreeMap<String, usize>,
    pub total_errors: u64,
    pub files_with_errors: usize,
}

/// Owner of the manifest. Every mutation is serialized through one lock and committed to
/// the backing [`ManifestStore`] before the call returns.
pub struct StateManager {
    document: Mutex<ManifestDocument>,
    store: Arc<dyn ManifestStore>,
}

impl StateManager {
    pub fn open(store: Arc<dyn ManifestStore>) -> Result<Self, AppError> {
        let document = store.load()?;
        info!(
            manifest = %store.describe(),
            files = document.files.len(),
            "manifest loaded"
        );
        Ok(Self {
            document: Mutex::new(document),
            store,
        })
    }

    pub fn open_file(path: &Path) -> Result<Self, AppError> {
        Self::open(Arc::new(JsonFileManifestStore::new(path)))
    }

    pub fn in_memory() -> Self {
        Self {
            document: Mutex::new(ManifestDocument::default()),
            store: Arc::new(InMemoryManifestStore::new()),
        }
    }

    async fn commit(&self, document: &ManifestDocument) -> Result<(), AppError> {
        let store = Arc::clone(&self.store);
        let snapshot = document.clone();
        tokio::task::spawn_blocking(move || store.commit(&snapshot))
            .await
            .map_err(|err| AppError::Manifest(format!("manifest commit task failed: {err}")))?
    }

    /// Applies `mutate` to the record for `hash` and commits. The in-memory view is
    /// rolled back when the commit fails.
    async fn mutate<F>(&self, hash: &str, create: bool, mutate: F) -> Result<FileRecord, AppError>
    where
        F: FnOnce(&mut FileRecord) -> Result<(), AppError>,
    {
        if hash.is_empty() {
            return Err(AppError::Validation("content hash must not be empty".into()));
        }

        let mut document = self.document.lock().await;
        let previous = document.files.get(hash).cloned();
        let mut record = match (&previous, create) {
            (Some(existing), _) => existing.clone(),
            (None, true) => FileRecord::new(hash, None),
            (None, false) => return Err(AppError::NotFound(format!("no record for {hash}"))),
        };

        mutate(&mut record)?;
        document.files.insert(hash.to_owned(), record.clone());

        if let Err(err) = self.commit(&document).await {
            match previous {
                Some(previous) => {
                    document.files.insert(hash.to_owned(), previous);
                }
                None => {
                    document.files.remove(hash);
                }
            }
            return Err(err);
        }

        Ok(record)
    }

    /// Current status; unknown hashes are `PENDING`.
    pub async fn get_status(&self, hash: &str) -> FileStatus {
        self.document
            .lock()
            .await
            .files
            .get(hash)
            .map(|record| record.status)
            .unwrap_or_default()
    }

    pub async fn get(&self, hash: &str) -> Option<FileRecord> {
        self.document.lock().await.files.get(hash).cloned()
    }

    pub async fn is_known(&self, hash: &str) -> bool {
        self.document.lock().await.files.contains_key(hash)
    }

    /// Upserts the record for `hash`. A `None` path keeps the stored path.
    pub async fn record(
        &self,
        hash: &str,
        status: FileStatus,
        path: Option<String>,
        metadata: Option<Map<String, Value>>,
    ) -> Result<FileRecord, AppError> {
        let record = self
            .mutate(hash, true, |record| {
                record.apply_update(status, path, metadata)
            })
            .await?;
        debug!(file_hash = %hash, status = %record.status, "file status recorded");
        Ok(record)
    }

    /// Updates only the last known path, leaving status and error fields untouched.
    pub async fn record_path(&self, hash: &str, path: String) -> Result<FileRecord, AppError> {
        self.mutate(hash, true, |record| {
            record.path = Some(path);
            record.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    /// Records a stage failure as `ERROR` with the message, stage and time in metadata.
    pub async fn record_error(
        &self,
        hash: &str,
        stage: &str,
        message: &str,
        path: Option<String>,
    ) -> Result<FileRecord, AppError> {
        let mut metadata = Map::new();
        metadata.insert("error".into(), json!(message));
        metadata.insert(FAILED_STAGE_KEY.into(), json!(stage));
        metadata.insert(ERROR_AT_KEY.into(), json!(Utc::now().to_rfc3339()));
        self.record(hash, FileStatus::Error, path, Some(metadata))
            .await
    }

    /// Snapshot of all records, optionally filtered by status.
    pub async fn list(&self, status: Option<FileStatus>) -> Vec<FileRecord> {
        self.document
            .lock()
            .await
            .files
            .values()
            .filter(|record| status.is_none_or(|wanted| record.status == wanted))
            .cloned()
            .collect()
    }

    /// Operator reset back to `PENDING`, clearing error information.
    pub async fn reset(&self, hash: &str) -> Result<FileRecord, AppError> {
        let record = self.mutate(hash, false, FileRecord::reset).await?;
        info!(file_hash = %hash, "file reset to PENDING");
        Ok(record)
    }

    pub async fn stats(&self) -> ManifestStats {
        let document = self.document.lock().await;
        let mut by_status: BTreeMap<String, usize> = FileStatus::ALL
            .iter()
            .map(|status| (status.as_str().to_string(), 0))
            .collect();
        let mut total_errors = 0u64;
        let mut files_with_errors = 0usize;

        for record in document.files.values() {
            if let Some(count) = by_status.get_mut(record.status.as_str()) {
                *count = count.saturating_add(1);
            }
            total_errors = total_errors.saturating_add(u64::from(record.error_count));
            if record.error_count > 0 {
                files_with_errors = files_with_errors.saturating_add(1);
            }
        }

        ManifestStats {
            total_files: document.files.len(),
            by_status,
            total_errors,
            files_with_errors,
        }
    }

    /// Records whose error count reached `min_error_count`.
    pub async fn error_files(&self, min_error_count: u32) -> Vec<FileRecord> {
        self.document
            .lock()
            .await
            .files
            .values()
            .filter(|record| record.error_count > 0 && record.error_count >= min_error_count)
            .cloned()
            .collect()
    }

    /// Hashes whose status promises cache artifacts that are missing or unreadable.
    pub async fn find_inconsistent(&self, archiver: &Archiver) -> Result<Vec<String>, AppError> {
        let candidates: Vec<FileRecord> = self
            .list(None)
            .await
            .into_iter()
            .filter(|record| record.status.has_chunks())
            .collect();

        let mut inconsistent = Vec::new();
        for record in candidates {
            let Some(chunks) = archiver.load_chunks(&record.hash).await? else {
                inconsistent.push(record.hash);
                continue;
            };
            if record.status.has_vectors() {
                let consistent = archiver
                    .load_vectors(&record.hash)
                    .await?
                    .is_some_and(|vectors| vectors.rows() == chunks.len());
                if !consistent {
                    inconsistent.push(record.hash);
                }
            }
        }
        Ok(inconsistent)
    }

    /// Resets every inconsistent record to `PENDING` so the next run regenerates it.
    pub async fn recover(&self, archiver: &Archiver) -> Result<Vec<String>, AppError> {
        let inconsistent = self.find_inconsistent(archiver).await?;
        for hash in &inconsistent {
            warn!(file_hash = %hash, "cached artifacts missing; resetting record");
            self.reset(hash).await?;
        }
        Ok(inconsistent)
    }
}
