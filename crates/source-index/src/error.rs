use thiserror::Error;

/// Result type for source indexing operations
pub type Result<T> = std::result::Result<T, SourceIndexError>;

/// Errors that can occur while building a source index
#[derive(Error, Debug)]
pub enum SourceIndexError {
    /// The parser gave up before producing a tree
    #[error("Parse error: {0}")]
    ParseError(String),

    /// File extension does not map to JavaScript or TypeScript
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    /// Tree-sitter error
    #[error("Tree-sitter error: {0}")]
    TreeSitterError(String),

    /// IO error occurred
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl SourceIndexError {
    /// Create a parse error
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::ParseError(msg.into())
    }

    /// Create an unsupported language error
    pub fn unsupported_language(lang: impl Into<String>) -> Self {
        Self::UnsupportedLanguage(lang.into())
    }

    /// Create a tree-sitter error
    pub fn tree_sitter(msg: impl Into<String>) -> Self {
        Self::TreeSitterError(msg.into())
    }
}
