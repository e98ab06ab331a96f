//! # Reaper Source Index
//!
//! Flat tables of every function-like construct in a JavaScript or TypeScript file.
//!
//! ## Pipeline
//!
//! ```text
//! Source text
//!     │
//!     ├──> Language Detection (from extension)
//!     │
//!     ├──> Tree-sitter Parsing → AST
//!     │      └─> syntax errors → UnparsableFile (reported, excluded)
//!     │
//!     ├──> Function Enumeration
//!     │    ├─> declarations, expressions, arrows, methods, accessors
//!     │    ├─> binding names or synthetic lexical labels (`parent>index`)
//!     │    └─> removal units (statement / class member / object member)
//!     │
//!     └──> Dynamic-Reference Signals
//!          ├─> computed member access, eval text, string literals, Reflect
//!          └─> exports without local call sites
//! ```
//!
//! ## Example
//!
//! ```rust
//! use reaper_source_index::{index_source, FunctionKind};
//!
//! let code = "function used(){return 1;} function unused(){return 2;} used();";
//! let index = index_source("app.js", code).unwrap().into_index().unwrap();
//!
//! assert_eq!(index.len(), 2);
//! assert!(index.functions().iter().all(|f| f.kind == FunctionKind::Declaration));
//! ```

mod error;
mod indexer;
mod language;
mod signals;
mod types;

pub use error::{Result, SourceIndexError};
pub use indexer::{index_source, revision_of, SourceIndexer, MODULE_SCOPE};
pub use language::Language;
pub use types::{
    DynamicSignal, FunctionId, FunctionKind, FunctionRange, IndexOutcome, RemovalUnit,
    SourceIndex, UnitKind, UnparsableFile,
};
