//! # Reaper Service
//!
//! The command surface of the pipeline: scan-and-analyze, generate-patch,
//! apply-patch, verify-patch and rollback-patch, plus read access to stored records.
//!
//! ```text
//! ScanRequest ──> scan_and_analyze ──> ScanRecord (stored)
//!                                        │
//!                       generate_patch <─┘──> Patch (stored)
//!                                               │
//!        apply_patch ──> verify_patch ──> rollback_patch
//! ```
//!
//! Typed errors a caller may need to branch on ([`LifecycleError::Conflict`],
//! [`LifecycleError::ReplayTimeout`], [`PatchError::StaleCandidates`]) survive inside the
//! returned `anyhow::Error` and can be recovered with `downcast_ref`.

mod config;
mod records;
mod service;

pub use config::{CoverageConfig, ReaperConfig, RiskConfig, VerifyConfig};
pub use records::{
    CoverageInput, ScanListing, ScanRecord, ScanRequest, ScanSummary, ScannedFile,
};
pub use service::ReaperService;

pub use reaper_lifecycle::{
    CancelHandle, CancelToken, LifecycleError, PatchApplication, PatchState, RecordKind,
    VerificationResult, VerifyOutcome,
};
pub use reaper_patch::{Patch, PatchError, SafetyProfile};
