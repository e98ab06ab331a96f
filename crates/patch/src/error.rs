use reaper_source_index::SourceIndexError;
use thiserror::Error;

/// Result type for patch generation and diff handling
pub type Result<T> = std::result::Result<T, PatchError>;

#[derive(Error, Debug)]
pub enum PatchError {
    /// Nothing to remove: empty selection, unknown ids, or every candidate filtered out
    #[error("No candidates: {0}")]
    NoCandidates(String),

    /// Candidates were computed against another revision of the file
    #[error("Stale candidates for {file}: expected revision {expected}, found {actual}")]
    StaleCandidates {
        file: String,
        expected: String,
        actual: String,
    },

    #[error("Source text missing for {0}")]
    MissingSource(String),

    /// Post-removal text no longer parses; the whole patch is rejected
    #[error("Patched {file} failed to re-parse: {reason}")]
    ReparseFailed { file: String, reason: String },

    /// Diff context or removed lines do not match the file
    #[error("Conflict in {file}: {reason}")]
    Conflict { file: String, reason: String },

    #[error("Malformed diff: {0}")]
    MalformedDiff(String),

    #[error("Source index error: {0}")]
    SourceIndex(#[from] SourceIndexError),
}

impl PatchError {
    pub fn no_candidates(msg: impl Into<String>) -> Self {
        Self::NoCandidates(msg.into())
    }

    pub fn conflict(file: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Conflict {
            file: file.into(),
            reason: reason.into(),
        }
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedDiff(msg.into())
    }
}
