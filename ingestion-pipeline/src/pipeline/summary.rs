use std::collections::BTreeMap;

use common::storage::types::FileStatus;
use serde::Serialize;

/// Final state of one file in a run.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FileOutcome {
    /// Missing when the file could not even be hashed.
    pub hash: Option<String>,
    pub path: Option<String>,
    pub status: FileStatus,
    pub error: Option<String>,
}

impl FileOutcome {
    pub fn new(hash: &str, path: Option<String>, status: FileStatus) -> Self {
        Self {
            hash: Some(hash.to_owned()),
            path,
            status,
            error: None,
        }
    }

    pub fn failed(hash: Option<&str>, path: Option<String>, error: String) -> Self {
        Self {
            hash: hash.map(str::to_owned),
            path,
            status: FileStatus::Error,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub outcomes: Vec<FileOutcome>,
}

impl RunSummary {
    pub fn push(&mut self, outcome: FileOutcome) {
        self.outcomes.push(outcome);
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Number of files per final status.
    pub fn counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for outcome in &self.outcomes {
            let count = counts.entry(outcome.status.as_str()).or_insert(0usize);
            *count = count.saturating_add(1);
        }
        counts
    }

    pub fn has_errors(&self) -> bool {
        self.outcomes
            .iter()
            .any(|outcome| outcome.status == FileStatus::Error)
    }

    pub fn exit_code(&self) -> i32 {
        i32::from(self.has_errors())
    }

    pub fn outcome_for(&self, hash: &str) -> Option<&FileOutcome> {
        self.outcomes
            .iter()
            .find(|outcome| outcome.hash.as_deref() == Some(hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_error_makes_the_run_fail() {
        let mut summary = RunSummary::default();
        summary.push(FileOutcome::new("a", None, FileStatus::Loaded));
        assert_eq!(summary.exit_code(), 0);

        summary.push(FileOutcome::failed(Some("b"), None, "bad".into()));
        summary.push(FileOutcome::new("c", None, FileStatus::Loaded));

        assert!(summary.has_errors());
        assert_eq!(summary.exit_code(), 1);
        assert_eq!(summary.counts().get("LOADED"), Some(&2));
        assert_eq!(summary.counts().get("ERROR"), Some(&1));
        assert_eq!(
            summary.outcome_for("b").and_then(|o| o.error.as_deref()),
            Some("bad")
        );
    }
}
