//! # Reaper Patch
//!
//! Removal patches for dead functions, under a named safety profile.
//!
//! ## Generation
//!
//! ```text
//! DeadCodeCandidate[] + original sources
//!     │
//!     ├──> Stale check (candidate revision == current source revision)
//!     │
//!     ├──> Profile selection
//!     │      ├─ conservative: dead, low risk, unambiguous brackets
//!     │      ├─ balanced:     dead, nothing touching uncertain
//!     │      └─ aggressive:   + weakly-signalled uncertain (flagged)
//!     │
//!     ├──> Span widening (whole lines or trailing blanks, ASI hazard check)
//!     │
//!     ├──> Re-parse of the post-removal text (failure rejects the patch)
//!     │
//!     └──> Unified diff per file + combined diff in path order
//! ```

mod diff;
mod error;
mod generator;
mod profile;
mod span;

pub use diff::{apply_file_diff, parse_unified_diff, render_file_diff, FileDiff, Hunk, HunkLine};
pub use error::{PatchError, Result};
pub use generator::{
    FilePatch, Patch, PatchGenerator, PatchRequest, RemovedUnit, SkippedCandidate,
};
pub use profile::{PatchConfig, SafetyProfile};
pub use span::{asi_hazard, brackets_balanced, merge_spans, remove_spans, widen, Span};
