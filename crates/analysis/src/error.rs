use thiserror::Error;

/// Result type for coverage mapping and classification
pub type Result<T> = std::result::Result<T, AnalysisError>;

#[derive(Error, Debug)]
pub enum AnalysisError {
    /// Coverage or candidates were computed against a different file revision
    #[error("Stale index for {file}: expected revision {expected}, found {actual}")]
    StaleIndex {
        file: String,
        expected: String,
        actual: String,
    },

    /// A sample was offered to the index of another file
    #[error("Coverage sample for {sample} cannot be mapped onto {index}")]
    FileMismatch { sample: String, index: String },

    /// Coverage payload could not be understood
    #[error("Coverage error: {0}")]
    Coverage(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AnalysisError {
    pub fn stale(file: impl Into<String>, expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::StaleIndex {
            file: file.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub fn coverage(msg: impl Into<String>) -> Self {
        Self::Coverage(msg.into())
    }
}
