use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use state_machines::state_machine;

use crate::error::AppError;

/// Metadata key holding the stage that last failed for a record.
pub const FAILED_STAGE_KEY: &str = "failed_stage";
/// Metadata key holding the RFC 3339 timestamp of the last failure.
pub const ERROR_AT_KEY: &str = "error_at";

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum FileStatus {
    #[serde(rename = "PENDING")]
    #[default]
    Pending,
    #[serde(rename = "SCANNED")]
    Scanned,
    #[serde(rename = "CHUNKED")]
    Chunked,
    #[serde(rename = "EMBEDDED")]
    Embedded,
    #[serde(rename = "LOADED")]
    Loaded,
    #[serde(rename = "ERROR")]
    Error,
}

impl FileStatus {
    pub const ALL: [FileStatus; 6] = [
        FileStatus::Pending,
        FileStatus::Scanned,
        FileStatus::Chunked,
        FileStatus::Embedded,
        FileStatus::Loaded,
        FileStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Pending => "PENDING",
            FileStatus::Scanned => "SCANNED",
            FileStatus::Chunked => "CHUNKED",
            FileStatus::Embedded => "EMBEDDED",
            FileStatus::Loaded => "LOADED",
            FileStatus::Error => "ERROR",
        }
    }

    /// Position along the forward path. `ERROR` sits outside it.
    pub fn rank(&self) -> Option<u8> {
        match self {
            FileStatus::Pending => Some(0),
            FileStatus::Scanned => Some(1),
            FileStatus::Chunked => Some(2),
            FileStatus::Embedded => Some(3),
            FileStatus::Loaded => Some(4),
            FileStatus::Error => None,
        }
    }

    /// True when this status is at or beyond `stage` on the forward path.
    pub fn reached(&self, stage: FileStatus) -> bool {
        match (self.rank(), stage.rank()) {
            (Some(current), Some(target)) => current >= target,
            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FileStatus::Loaded)
    }

    pub fn has_chunks(&self) -> bool {
        self.reached(FileStatus::Chunked)
    }

    pub fn has_vectors(&self) -> bool {
        self.reached(FileStatus::Embedded)
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileStatus {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        FileStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(raw.trim()))
            .ok_or_else(|| AppError::Validation(format!("unrecognized file status '{raw}'")))
    }
}

mod lifecycle {
    use super::state_machine;
    use state_machines::core::GuardError;

    use crate::error::AppError;

    state_machine! {
        name: FileLifecycleMachine,
        state: FileLifecycleState,
        initial: Pending,
        states: [Pending, Scanned, Chunked, Embedded, Loaded, Errored],
        events {
            scan {
                transition: { from: Pending, to: Scanned }
                transition: { from: Errored, to: Scanned }
            }
            chunk {
                transition: { from: Scanned, to: Chunked }
                transition: { from: Errored, to: Chunked }
            }
            embed {
                transition: { from: Chunked, to: Embedded }
                transition: { from: Errored, to: Embedded }
            }
            load {
                transition: { from: Embedded, to: Loaded }
                transition: { from: Errored, to: Loaded }
            }
            fail {
                transition: { from: Pending, to: Errored }
                transition: { from: Scanned, to: Errored }
                transition: { from: Chunked, to: Errored }
                transition: { from: Embedded, to: Errored }
            }
            reset {
                transition: { from: Scanned, to: Pending }
                transition: { from: Chunked, to: Pending }
                transition: { from: Embedded, to: Pending }
                transition: { from: Loaded, to: Pending }
                transition: { from: Errored, to: Pending }
            }
        }
    }

    pub(super) fn guard(event: &str, guard: &GuardError) -> AppError {
        AppError::InvalidTransition(format!("file lifecycle rejected {event}: {guard:?}"))
    }

    pub(super) fn pending() -> FileLifecycleMachine<(), Pending> {
        FileLifecycleMachine::new(())
    }

    pub(super) fn scanned() -> Result<FileLifecycleMachine<(), Scanned>, AppError> {
        pending().scan().map_err(|(_, g)| guard("scan", &g))
    }

    pub(super) fn chunked() -> Result<FileLifecycleMachine<(), Chunked>, AppError> {
        scanned()?.chunk().map_err(|(_, g)| guard("chunk", &g))
    }

    pub(super) fn embedded() -> Result<FileLifecycleMachine<(), Embedded>, AppError> {
        chunked()?.embed().map_err(|(_, g)| guard("embed", &g))
    }

    pub(super) fn loaded() -> Result<FileLifecycleMachine<(), Loaded>, AppError> {
        embedded()?.load().map_err(|(_, g)| guard("load", &g))
    }

    pub(super) fn errored() -> Result<FileLifecycleMachine<(), Errored>, AppError> {
        pending().fail().map_err(|(_, g)| guard("fail", &g))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileTransition {
    Scan,
    Chunk,
    Embed,
    Load,
    Fail,
    Reset,
}

impl FileTransition {
    fn as_str(self) -> &'static str {
        match self {
            FileTransition::Scan => "scan",
            FileTransition::Chunk => "chunk",
            FileTransition::Embed => "embed",
            FileTransition::Load => "load",
            FileTransition::Fail => "fail",
            FileTransition::Reset => "reset",
        }
    }

    fn towards(target: FileStatus) -> Self {
        match target {
            FileStatus::Pending => FileTransition::Reset,
            FileStatus::Scanned => FileTransition::Scan,
            FileStatus::Chunked => FileTransition::Chunk,
            FileStatus::Embedded => FileTransition::Embed,
            FileStatus::Loaded => FileTransition::Load,
            FileStatus::Error => FileTransition::Fail,
        }
    }
}

fn invalid_transition(from: FileStatus, to: FileStatus) -> AppError {
    AppError::InvalidTransition(format!(
        "{} -> {} is not a forward transition",
        from.as_str(),
        to.as_str()
    ))
}

fn apply(from: FileStatus, event: FileTransition) -> Result<FileStatus, AppError> {
    use lifecycle::*;
    let to = match event {
        FileTransition::Scan => FileStatus::Scanned,
        FileTransition::Chunk => FileStatus::Chunked,
        FileTransition::Embed => FileStatus::Embedded,
        FileTransition::Load => FileStatus::Loaded,
        FileTransition::Fail => FileStatus::Error,
        FileTransition::Reset => FileStatus::Pending,
    };
    let ev = event.as_str();
    let checked = match (from, event) {
        (FileStatus::Pending, FileTransition::Scan) => {
            pending().scan().map(|_| ()).map_err(|(_, g)| guard(ev, &g))
        }
        (FileStatus::Scanned, FileTransition::Chunk) => {
            scanned()?.chunk().map(|_| ()).map_err(|(_, g)| guard(ev, &g))
        }
        (FileStatus::Chunked, FileTransition::Embed) => {
            chunked()?.embed().map(|_| ()).map_err(|(_, g)| guard(ev, &g))
        }
        (FileStatus::Embedded, FileTransition::Load) => {
            embedded()?.load().map(|_| ()).map_err(|(_, g)| guard(ev, &g))
        }
        (FileStatus::Error, FileTransition::Scan) => {
            errored()?.scan().map(|_| ()).map_err(|(_, g)| guard(ev, &g))
        }
        (FileStatus::Error, FileTransition::Chunk) => {
            errored()?.chunk().map(|_| ()).map_err(|(_, g)| guard(ev, &g))
        }
        (FileStatus::Error, FileTransition::Embed) => {
            errored()?.embed().map(|_| ()).map_err(|(_, g)| guard(ev, &g))
        }
        (FileStatus::Error, FileTransition::Load) => {
            errored()?.load().map(|_| ()).map_err(|(_, g)| guard(ev, &g))
        }
        (FileStatus::Pending, FileTransition::Fail) => {
            pending().fail().map(|_| ()).map_err(|(_, g)| guard(ev, &g))
        }
        (FileStatus::Scanned, FileTransition::Fail) => {
            scanned()?.fail().map(|_| ()).map_err(|(_, g)| guard(ev, &g))
        }
        (FileStatus::Chunked, FileTransition::Fail) => {
            chunked()?.fail().map(|_| ()).map_err(|(_, g)| guard(ev, &g))
        }
        (FileStatus::Embedded, FileTransition::Fail) => {
            embedded()?.fail().map(|_| ()).map_err(|(_, g)| guard(ev, &g))
        }
        (FileStatus::Scanned, FileTransition::Reset) => {
            scanned()?.reset().map(|_| ()).map_err(|(_, g)| guard(ev, &g))
        }
        (FileStatus::Chunked, FileTransition::Reset) => {
            chunked()?.reset().map(|_| ()).map_err(|(_, g)| guard(ev, &g))
        }
        (FileStatus::Embedded, FileTransition::Reset) => {
            embedded()?.reset().map(|_| ()).map_err(|(_, g)| guard(ev, &g))
        }
        (FileStatus::Loaded, FileTransition::Reset) => {
            loaded()?.reset().map(|_| ()).map_err(|(_, g)| guard(ev, &g))
        }
        (FileStatus::Error, FileTransition::Reset) => {
            errored()?.reset().map(|_| ()).map_err(|(_, g)| guard(ev, &g))
        }
        _ => Err(invalid_transition(from, to)),
    };
    checked.map(|()| to)
}

/// Resolves a status update requested through the normal `record` path.
///
/// Re-recording the current status is accepted as a no-op, as is `ERROR -> ERROR`
/// (a repeated failure). Anything moving backwards is rejected; only [`reset_status`]
/// may move a record back to `PENDING`.
pub fn next_status(current: FileStatus, requested: FileStatus) -> Result<FileStatus, AppError> {
    if current == requested {
        return Ok(current);
    }
    if requested == FileStatus::Pending {
        return Err(invalid_transition(current, requested));
    }
    apply(current, FileTransition::towards(requested))
}

/// Operator-driven move back to `PENDING`.
pub fn reset_status(current: FileStatus) -> Result<FileStatus, AppError> {
    if current == FileStatus::Pending {
        return Ok(current);
    }
    apply(current, FileTransition::Reset)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileRecord {
    pub hash: String,
    #[serde(default)]
    pub path: Option<String>,
    pub status: FileStatus,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub error_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FileRecord {
    pub fn new(hash: impl Into<String>, path: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            hash: hash.into(),
            path,
            status: FileStatus::Pending,
            metadata: Map::new(),
            error_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn failed_stage(&self) -> Option<&str> {
        self.metadata.get(FAILED_STAGE_KEY).and_then(Value::as_str)
    }

    pub fn chunk_count(&self) -> Option<u64> {
        self.metadata.get("chunk_count").and_then(Value::as_u64)
    }

    pub fn vector_count(&self) -> Option<u64> {
        self.metadata.get("vector_count").and_then(Value::as_u64)
    }

    /// Moves the record to `status`, merging `metadata` and keeping the stored path
    /// unless a new one is supplied.
    pub fn apply_update(
        &mut self,
        status: FileStatus,
        path: Option<String>,
        metadata: Option<Map<String, Value>>,
    ) -> Result<(), AppError> {
        let next = next_status(self.status, status)?;

        if let Some(path) = path {
            self.path = Some(path);
        }
        if let Some(metadata) = metadata {
            self.metadata.extend(metadata);
        }

        match next {
            FileStatus::Error => {
                self.error_count = self.error_count.saturating_add(1);
                let message = self
                    .metadata
                    .get("error")
                    .and_then(Value::as_str)
                    .map(str::to_owned);
                if message.is_some() {
                    self.last_error = message;
                }
            }
            FileStatus::Embedded | FileStatus::Loaded => {
                self.error_count = 0;
                self.last_error = None;
                self.metadata.remove(FAILED_STAGE_KEY);
                self.metadata.remove(ERROR_AT_KEY);
                self.metadata.remove("error");
            }
            _ => {}
        }

        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn reset(&mut self) -> Result<(), AppError> {
        self.status = reset_status(self.status)?;
        self.error_count = 0;
        self.last_error = None;
        self.metadata.remove(FAILED_STAGE_KEY);
        self.metadata.remove(ERROR_AT_KEY);
        self.metadata.remove("error");
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn forward_path_is_single_step() {
        assert_eq!(
            next_status(FileStatus::Pending, FileStatus::Scanned).expect("scan"),
            FileStatus::Scanned
        );
        assert_eq!(
            next_status(FileStatus::Embedded, FileStatus::Loaded).expect("load"),
            FileStatus::Loaded
        );
        assert!(matches!(
            next_status(FileStatus::Pending, FileStatus::Embedded),
            Err(AppError::InvalidTransition(_))
        ));
    }

    #[test]
    fn backward_moves_are_rejected_outside_reset() {
        assert!(next_status(FileStatus::Embedded, FileStatus::Chunked).is_err());
        assert!(next_status(FileStatus::Loaded, FileStatus::Pending).is_err());
        assert!(next_status(FileStatus::Loaded, FileStatus::Error).is_err());
        assert_eq!(
            reset_status(FileStatus::Loaded).expect("reset"),
            FileStatus::Pending
        );
    }

    #[test]
    fn error_is_reachable_and_recoverable() {
        for status in [
            FileStatus::Pending,
            FileStatus::Scanned,
            FileStatus::Chunked,
            FileStatus::Embedded,
        ] {
            assert_eq!(
                next_status(status, FileStatus::Error).expect("fail"),
                FileStatus::Error
            );
        }
        assert_eq!(
            next_status(FileStatus::Error, FileStatus::Loaded).expect("retry load"),
            FileStatus::Loaded
        );
        assert_eq!(
            next_status(FileStatus::Error, FileStatus::Error).expect("repeat"),
            FileStatus::Error
        );
    }

    #[test]
    fn unknown_status_strings_fail_closed() {
        assert_eq!(
            "embedded".parse::<FileStatus>().expect("parse"),
            FileStatus::Embedded
        );
        assert!(matches!(
            "DONE".parse::<FileStatus>(),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn update_preserves_path_and_tracks_errors() {
        let mut record = FileRecord::new("abc", Some("/a/doc.txt".into()));
        record
            .apply_update(FileStatus::Scanned, None, None)
            .expect("scan");

        let mut failure = Map::new();
        failure.insert("error".into(), json!("model exploded"));
        failure.insert(FAILED_STAGE_KEY.into(), json!("embed"));
        record
            .apply_update(FileStatus::Error, None, Some(failure.clone()))
            .expect("fail");
        record
            .apply_update(FileStatus::Error, None, Some(failure))
            .expect("fail again");

        assert_eq!(record.path.as_deref(), Some("/a/doc.txt"));
        assert_eq!(record.error_count, 2);
        assert_eq!(record.last_error.as_deref(), Some("model exploded"));
        assert_eq!(record.failed_stage(), Some("embed"));

        record
            .apply_update(FileStatus::Chunked, None, None)
            .expect("retry chunk");
        record
            .apply_update(FileStatus::Embedded, None, None)
            .expect("embed");
        assert_eq!(record.error_count, 0);
        assert!(record.last_error.is_none());
        assert!(record.failed_stage().is_none());
    }

    #[test]
    fn reached_ignores_error_state() {
        assert!(FileStatus::Loaded.reached(FileStatus::Embedded));
        assert!(!FileStatus::Chunked.reached(FileStatus::Embedded));
        assert!(!FileStatus::Error.reached(FileStatus::Pending));
    }
}
