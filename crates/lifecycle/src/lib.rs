//! # Reaper Lifecycle
//!
//! Applying, verifying and rolling back removal patches on disk.
//!
//! ## States
//!
//! ```text
//! generated ──apply──> applied ──verify──> verified
//!                         │          └───> regressed
//!                         │                    │
//!                         └──────rollback──────┴──> rolledback
//! ```
//!
//! - `apply` is all-or-nothing across files and stores the pre-patch snapshot first
//! - `verify` replays the recorded interaction plan; timeouts and cancellation
//!   leave the patch `applied`
//! - `rollback` restores the snapshot byte for byte and is idempotent
//!
//! Every state change runs under a per-scan file lock. Records go through the
//! [`Store`] trait ([`FileStore`] on disk, [`MemoryStore`] in process).

mod error;
mod file_io;
mod lifecycle;
mod lock;
mod replay;
mod state;
mod store;
mod verify;

pub use error::{LifecycleError, Result};
pub use file_io::{resolve_in_root, unix_now_ms, write_atomic};
pub use lifecycle::{LifecycleConfig, PatchLifecycle};
pub use lock::{acquire_scan_lock, ScanLock};
pub use replay::{
    CancelHandle, CancelToken, CommandReplayer, ReplayOutcome, ReplayRequest, Replayer,
};
pub use state::{PatchApplication, PatchState, StateChange, Transition};
pub use store::{get_typed, put_typed, require_typed, FileStore, MemoryStore, RecordKind, Store};
pub use verify::{
    CoverageComparison, LiveFunction, VerificationResult, VerifyOutcome, VerifyRequest,
};
