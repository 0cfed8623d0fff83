use std::path::{Path, PathBuf};

use common::error::AppError;
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use super::file_text_extraction::ExtractorRegistry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    pub path: PathBuf,
    pub mime_type: String,
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with('.'))
}

/// Lists the files to ingest below `root`, sorted by path.
///
/// A file given directly is always returned, so an unsupported type is reported as an
/// extraction failure instead of vanishing. Inside directories hidden entries, anything
/// under `skip` and files rejected by `supports` are left out.
pub fn discover_files<F>(
    root: &Path,
    supports: F,
    skip: &[PathBuf],
) -> Result<Vec<DiscoveredFile>, AppError>
where
    F: Fn(&Path) -> bool,
{
    let metadata = std::fs::metadata(root)
        .map_err(|err| AppError::NotFound(format!("{}: {err}", root.display())))?;

    if metadata.is_file() {
        return Ok(vec![DiscoveredFile {
            path: root.to_path_buf(),
            mime_type: ExtractorRegistry::detect_mime(root),
        }]);
    }

    let skip: Vec<PathBuf> = skip
        .iter()
        .map(|p| p.canonicalize().unwrap_or_else(|_| p.clone()))
        .collect();

    let mut files: Vec<DiscoveredFile> = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            if is_hidden(entry) {
                return false;
            }
            let canonical = entry
                .path()
                .canonicalize()
                .unwrap_or_else(|_| entry.path().to_path_buf());
            !skip.iter().any(|skipped| canonical.starts_with(skipped))
        })
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!(error = %err, "skipping unreadable directory entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            let supported = supports(entry.path());
            if !supported {
                debug!(path = %entry.path().display(), "no extractor for file; skipping");
            }
            supported
        })
        .map(|entry| DiscoveredFile {
            mime_type: ExtractorRegistry::detect_mime(entry.path()),
            path: entry.into_path(),
        })
        .collect();

    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}
