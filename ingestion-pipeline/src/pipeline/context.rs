use std::path::PathBuf;

use common::{
    error::AppError,
    storage::{
        archiver::Archiver,
        state_manager::StateManager,
        types::{FileRecord, FileStatus, TextChunk, VectorBatch},
    },
};
use serde_json::{Map, Value};
use tracing::error;

use super::services::PipelineServices;
use crate::sinks::DatabaseLoader;

pub struct PipelineContext<'a> {
    pub file_hash: String,
    pub path: Option<PathBuf>,
    pub mime_type: Option<String>,
    /// Status currently stored in the manifest.
    pub status: FileStatus,
    /// Furthest stage whose cached artifacts may be reused.
    pub completed: FileStatus,
    /// True once the bytes at `path` are known to hash to `file_hash`.
    pub source_verified: bool,
    pub stage: &'static str,
    pub services: &'a dyn PipelineServices,
    pub state: &'a StateManager,
    pub archiver: &'a Archiver,
    pub loader: &'a DatabaseLoader,
    pub chunks: Option<Vec<TextChunk>>,
    pub chunks_regenerated: bool,
    pub vectors: Option<VectorBatch>,
}

/// Stage an `ERROR` record can restart after, based on where it failed.
pub fn completed_stage(record: Option<&FileRecord>) -> FileStatus {
    match record {
        None => FileStatus::Pending,
        Some(record) if record.status == FileStatus::Error => match record.failed_stage() {
            Some("load") => FileStatus::Embedded,
            Some("embed") => FileStatus::Chunked,
            _ => FileStatus::Pending,
        },
        Some(record) => record.status,
    }
}

impl<'a> PipelineContext<'a> {
    pub fn new(
        file_hash: String,
        record: Option<&FileRecord>,
        services: &'a dyn PipelineServices,
        state: &'a StateManager,
        archiver: &'a Archiver,
        loader: &'a DatabaseLoader,
    ) -> Self {
        Self {
            file_hash,
            path: record.and_then(|r| r.path.as_ref()).map(PathBuf::from),
            mime_type: record
                .and_then(|r| r.metadata.get("mime_type"))
                .and_then(Value::as_str)
                .map(str::to_owned),
            status: record.map(|r| r.status).unwrap_or_default(),
            completed: completed_stage(record),
            source_verified: false,
            stage: super::stages::STAGE_SCAN,
            services,
            state,
            archiver,
            loader,
            chunks: None,
            chunks_regenerated: false,
            vectors: None,
        }
    }

    /// Binds a freshly hashed file to this context.
    pub fn with_source(mut self, path: PathBuf, mime_type: String) -> Self {
        self.path = Some(path);
        self.mime_type = Some(mime_type);
        self.source_verified = true;
        self
    }

    pub fn path_label(&self) -> Option<String> {
        self.path.as_ref().map(|p| p.display().to_string())
    }

    /// Path to record alongside a status, only when it verifiably holds this content.
    pub fn verified_path(&self) -> Option<String> {
        if self.source_verified {
            self.path_label()
        } else {
            None
        }
    }

    pub fn chunks(&self) -> Result<&[TextChunk], AppError> {
        self.chunks
            .as_deref()
            .ok_or_else(|| AppError::InternalError("chunks expected to be available".into()))
    }

    pub fn vectors(&self) -> Result<&VectorBatch, AppError> {
        self.vectors
            .as_ref()
            .ok_or_else(|| AppError::InternalError("vectors expected to be available".into()))
    }

    /// Moves the manifest record forward and keeps `status` in step.
    pub async fn advance(
        &mut self,
        status: FileStatus,
        path: Option<String>,
        metadata: Map<String, Value>,
    ) -> Result<(), AppError> {
        let record = self
            .state
            .record(&self.file_hash, status, path, Some(metadata))
            .await?;
        self.status = record.status;
        Ok(())
    }

    pub fn abort(&self, err: AppError) -> AppError {
        error!(
            file_hash = %self.file_hash,
            path = ?self.path,
            stage = self.stage,
            error = %err,
            "file ingestion aborted"
        );
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn error_records_restart_after_the_last_good_stage() {
        let mut record = FileRecord::new("h", None);
        assert_eq!(completed_stage(None), FileStatus::Pending);

        record.status = FileStatus::Embedded;
        assert_eq!(completed_stage(Some(&record)), FileStatus::Embedded);

        record.status = FileStatus::Error;
        record.metadata.insert("failed_stage".into(), json!("load"));
        assert_eq!(completed_stage(Some(&record)), FileStatus::Embedded);

        record.metadata.insert("failed_stage".into(), json!("embed"));
        assert_eq!(completed_stage(Some(&record)), FileStatus::Chunked);

        record.metadata.insert("failed_stage".into(), json!("chunk"));
        assert_eq!(completed_stage(Some(&record)), FileStatus::Pending);
    }
}
