use crate::state::PatchState;
use reaper_patch::PatchError;
use thiserror::Error;

/// Result type for patch lifecycle operations
pub type Result<T> = std::result::Result<T, LifecycleError>;

#[derive(Error, Debug)]
pub enum LifecycleError {
    /// Source drifted since the patch was generated; nothing was written
    #[error("Conflict in {file}: {reason}")]
    Conflict { file: String, reason: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Patch {patch_id} cannot {action} from state {from}")]
    InvalidTransition {
        patch_id: String,
        from: PatchState,
        action: &'static str,
    },

    #[error("Patch {0} was never applied")]
    NotApplied(String),

    /// Replay exceeded its time bound
    #[error("Replay for patch {patch_id} timed out after {secs}s")]
    ReplayTimeout { patch_id: String, secs: u64 },

    #[error("Verification of patch {0} was cancelled")]
    Cancelled(String),

    #[error("Replay failed: {0}")]
    Replay(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Storage error: {0}")]
    Storage(String),

    /// Patch paths must stay inside the project root
    #[error("Invalid path in patch: {0}")]
    InvalidPath(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Patch error: {0}")]
    Patch(PatchError),
}

impl From<PatchError> for LifecycleError {
    fn from(err: PatchError) -> Self {
        match err {
            PatchError::Conflict { file, reason } => Self::Conflict { file, reason },
            other => Self::Patch(other),
        }
    }
}

impl LifecycleError {
    pub fn conflict(file: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Conflict {
            file: file.into(),
            reason: reason.into(),
        }
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn replay(msg: impl Into<String>) -> Self {
        Self::Replay(msg.into())
    }
}
