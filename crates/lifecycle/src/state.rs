use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Where a patch stands in its lifecycle.
///
/// ```text
/// generated ─apply─> applied ─verify─> verified | regressed
///                       │                  │          │
///                       └──────rollback────┴──────────┴──> rolledback
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchState {
    Generated,
    Applied,
    Verified,
    Regressed,
    #[serde(rename = "rolledback")]
    RolledBack,
}

/// Lifecycle operations that move a patch between states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Apply,
    Pass,
    Regress,
    Rollback,
}

impl Transition {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Apply => "apply",
            Self::Pass => "pass verification",
            Self::Regress => "record a regression",
            Self::Rollback => "rollback",
        }
    }
}

impl PatchState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Generated => "generated",
            Self::Applied => "applied",
            Self::Verified => "verified",
            Self::Regressed => "regressed",
            Self::RolledBack => "rolledback",
        }
    }

    /// Target state, or `None` when the table has no such edge
    pub const fn next(self, transition: Transition) -> Option<PatchState> {
        match (self, transition) {
            (Self::Generated, Transition::Apply) => Some(Self::Applied),
            (Self::Applied, Transition::Pass) => Some(Self::Verified),
            (Self::Applied, Transition::Regress) => Some(Self::Regressed),
            (Self::Applied | Self::Verified | Self::Regressed, Transition::Rollback) => {
                Some(Self::RolledBack)
            }
            _ => None,
        }
    }

    /// Patched text is on disk
    pub const fn is_on_disk(self) -> bool {
        matches!(self, Self::Applied | Self::Verified | Self::Regressed)
    }
}

impl fmt::Display for PatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChange {
    pub state: PatchState,
    pub at_ms: u64,
}

/// Record of a patch written to disk, holding everything rollback needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchApplication {
    pub patch_id: String,
    pub scan_id: String,

    /// Project root the patch paths are relative to
    pub root: String,

    /// Full pre-patch content of every touched file, captured before any write.
    /// Never modified after the record is first stored.
    pub snapshot: BTreeMap<String, String>,

    pub applied_at_ms: u64,
    pub state: PatchState,

    #[serde(default)]
    pub history: Vec<StateChange>,
}

impl PatchApplication {
    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.snapshot.keys().map(String::as_str)
    }

    pub(crate) fn record(&mut self, state: PatchState, at_ms: u64) {
        self.state = state;
        self.history.push(StateChange { state, at_ms });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        use PatchState::*;
        use Transition::*;

        assert_eq!(Generated.next(Apply), Some(Applied));
        assert_eq!(Applied.next(Pass), Some(Verified));
        assert_eq!(Applied.next(Regress), Some(Regressed));
        for state in [Applied, Verified, Regressed] {
            assert_eq!(state.next(Rollback), Some(RolledBack));
        }

        assert_eq!(Applied.next(Apply), None);
        assert_eq!(Verified.next(Regress), None);
        assert_eq!(Regressed.next(Pass), None);
        assert_eq!(Generated.next(Rollback), None);
        assert_eq!(RolledBack.next(Apply), None);
    }

    #[test]
    fn test_state_serializes_lowercase() {
        let json = serde_json::to_string(&PatchState::RolledBack).expect("serialize");
        assert_eq!(json, "\"rolledback\"");
        let back: PatchState = serde_json::from_str("\"regressed\"").expect("deserialize");
        assert_eq!(back, PatchState::Regressed);
    }
}
