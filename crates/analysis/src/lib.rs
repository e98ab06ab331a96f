//! # Reaper Analysis
//!
//! Runtime coverage mapped onto static source structure, then classified.
//!
//! ## Architecture
//!
//! ```text
//! V8 precise coverage JSON
//!     │
//!     ├──> Ingestion (script filter, URL → project path)
//!     │      └─> CoverageSample per (session, file)
//!     │
//!     ├──> CoverageMapper (innermost-first attribution)
//!     │      ├─ boundary tolerance for off-by-one captures
//!     │      ├─ commutative merge across sessions
//!     │      └─ misaligned ranges recorded, never fatal
//!     │
//!     └──> DeadCodeClassifier
//!            ├─ dead / live / uncertain
//!            └─ deterministic risk score with auditable reasons
//! ```
//!
//! ## Example
//!
//! ```rust
//! use reaper_analysis::{CoverageMapper, CoverageRange, CoverageSample, DeadCodeClassifier, Verdict};
//! use reaper_source_index::index_source;
//!
//! let code = "function used(){return 1;} function unused(){return 2;} used();";
//! let index = index_source("app.js", code).unwrap().into_index().unwrap();
//! let sample = CoverageSample {
//!     session_id: "s1".into(),
//!     file: "app.js".into(),
//!     ranges: vec![CoverageRange { start_offset: 0, end_offset: 26, count: 1 }],
//! };
//!
//! let mapping = CoverageMapper::default().map(&index, &[sample]).unwrap();
//! let candidates = DeadCodeClassifier::default().classify(&index, &mapping).unwrap();
//!
//! assert_eq!(candidates[0].verdict, Verdict::Live);
//! assert_eq!(candidates[1].verdict, Verdict::Dead);
//! ```

mod classifier;
mod coverage;
mod error;
pub mod v8;

pub use classifier::{is_handler_name, DeadCodeCandidate, DeadCodeClassifier, RiskWeights, Verdict};
pub use coverage::{
    CoverageAlignmentError, CoverageLedger, CoverageMapper, CoverageMapping, CoverageRange,
    CoverageSample, ExecutionVerdict, DEFAULT_BOUNDARY_TOLERANCE,
};
pub use error::{AnalysisError, Result};
pub use v8::{samples_from_v8, script_path, ScriptFilter};
