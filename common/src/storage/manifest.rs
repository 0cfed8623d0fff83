use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::{error::AppError, storage::types::FileRecord};

pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManifestDocument {
    pub version: u32,
    #[serde(default)]
    pub files: BTreeMap<String, FileRecord>,
}

impl Default for ManifestDocument {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            files: BTreeMap::new(),
        }
    }
}

/// Durable backend for the manifest. Implementations must make `commit` atomic: after a
/// crash the next `load` sees either the previous or the new document, never a mix.
pub trait ManifestStore: Send + Sync {
    fn load(&self) -> Result<ManifestDocument, AppError>;
    fn commit(&self, document: &ManifestDocument) -> Result<(), AppError>;
    fn describe(&self) -> String;
}

/// JSON manifest on disk.
///
/// `commit` writes `<file>.tmp` and fsyncs it, moves a copy of the current manifest to
/// `<file>.bak`, renames the temp file over the manifest and fsyncs the directory.
/// `load` falls back to the backup when the primary does not parse, and starts empty
/// (logged at error level) when neither does.
pub struct JsonFileManifestStore {
    path: PathBuf,
}

impl JsonFileManifestStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn temp_path(&self) -> PathBuf {
        sibling(&self.path, "tmp")
    }

    pub fn backup_path(&self) -> PathBuf {
        sibling(&self.path, "bak")
    }

    fn read_document(path: &Path) -> Result<Option<ManifestDocument>, ReadFailure> {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(ReadFailure::Io(err)),
        };
        let document: ManifestDocument =
            serde_json::from_slice(&raw).map_err(ReadFailure::Parse)?;
        if document.version != MANIFEST_VERSION {
            return Err(ReadFailure::Version(document.version));
        }
        Ok(Some(document))
    }

    fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        let mut file = File::create(path)?;
        file.write_all(bytes)?;
        file.sync_all()
    }

    fn sync_parent(&self) {
        let Some(parent) = self.path.parent() else {
            return;
        };
        let parent = if parent.as_os_str().is_empty() {
            Path::new(".")
        } else {
            parent
        };
        if let Err(err) = File::open(parent).and_then(|dir| dir.sync_all()) {
            debug!(error = %err, dir = %parent.display(), "directory fsync not supported");
        }
    }

    fn manifest_error(&self, action: &str, err: impl std::fmt::Display) -> AppError {
        AppError::Manifest(format!(
            "failed to {action} manifest {}: {err}",
            self.path.display()
        ))
    }
}

enum ReadFailure {
    Io(std::io::Error),
    Parse(serde_json::Error),
    Version(u32),
}

impl std::fmt::Display for ReadFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadFailure::Io(err) => write!(f, "{err}"),
            ReadFailure::Parse(err) => write!(f, "{err}"),
            ReadFailure::Version(version) => write!(f, "unsupported manifest version {version}"),
        }
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(std::ffi::OsStr::to_os_string)
        .unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

impl ManifestStore for JsonFileManifestStore {
    fn load(&self) -> Result<ManifestDocument, AppError> {
        let primary_failure = match Self::read_document(&self.path) {
            Ok(Some(document)) => return Ok(document),
            Ok(None) => None,
            Err(ReadFailure::Io(err)) => return Err(self.manifest_error("read", err)),
            Err(failure) => {
                warn!(
                    manifest = %self.path.display(),
                    error = %failure,
                    "manifest is unreadable, trying backup"
                );
                Some(failure)
            }
        };

        let backup = self.backup_path();
        match Self::read_document(&backup) {
            Ok(Some(document)) => {
                warn!(
                    backup = %backup.display(),
                    files = document.files.len(),
                    "restored manifest from backup"
                );
                Ok(document)
            }
            Ok(None) => {
                if let Some(failure) = primary_failure {
                    error!(
                        manifest = %self.path.display(),
                        error = %failure,
                        "manifest is corrupt and no backup exists; starting with an empty manifest"
                    );
                }
                Ok(ManifestDocument::default())
            }
            Err(failure) => {
                error!(
                    manifest = %self.path.display(),
                    backup = %backup.display(),
                    error = %failure,
                    "manifest and backup are both unreadable; starting with an empty manifest"
                );
                Ok(ManifestDocument::default())
            }
        }
    }

    fn commit(&self, document: &ManifestDocument) -> Result<(), AppError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| self.manifest_error("prepare", err))?;
        }

        let bytes = serde_json::to_vec_pretty(document)
            .map_err(|err| self.manifest_error("serialize", err))?;

        let temp = self.temp_path();
        Self::write_synced(&temp, &bytes).map_err(|err| self.manifest_error("stage", err))?;

        if self.path.exists() {
            let backup = self.backup_path();
            let backup_temp = sibling(&backup, "tmp");
            fs::copy(&self.path, &backup_temp)
                .and_then(|_| File::open(&backup_temp)?.sync_all())
                .and_then(|()| fs::rename(&backup_temp, &backup))
                .map_err(|err| self.manifest_error("back up", err))?;
        }

        fs::rename(&temp, &self.path).map_err(|err| self.manifest_error("replace", err))?;
        self.sync_parent();
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Process-local manifest, used by tests and dry runs.
#[derive(Default)]
pub struct InMemoryManifestStore {
    document: Mutex<ManifestDocument>,
    fail_commits: std::sync::atomic::AtomicBool,
}

impl InMemoryManifestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following commit fail, as a full disk would.
    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> ManifestDocument {
        self.document
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

impl ManifestStore for InMemoryManifestStore {
    fn load(&self) -> Result<ManifestDocument, AppError> {
        Ok(self.snapshot())
    }

    fn commit(&self, document: &ManifestDocument) -> Result<(), AppError> {
        if self.fail_commits.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(AppError::Manifest("in-memory manifest rejected commit".into()));
        }
        let mut guard = self
            .document
            .lock()
            .map_err(|_| AppError::Manifest("in-memory manifest lock poisoned".into()))?;
        *guard = document.clone();
        Ok(())
    }

    fn describe(&self) -> String {
        "in-memory".to_string()
    }
}
