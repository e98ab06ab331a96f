use crate::error::{LifecycleError, Result};
use crate::file_io::unix_now_ms;
use crate::replay::ReplayOutcome;
use reaper_analysis::{CoverageMapper, CoverageSample};
use reaper_patch::{apply_file_diff, parse_unified_diff, Patch, PatchError, Span};
use reaper_source_index::{index_source, FunctionId, FunctionRange, IndexOutcome};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// A function observed executing before the patch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveFunction {
    pub id: FunctionId,
    pub file: String,
    pub start_offset: usize,
    pub end_offset: usize,
    pub label: String,
}

impl From<&FunctionRange> for LiveFunction {
    fn from(range: &FunctionRange) -> Self {
        Self {
            id: range.id.clone(),
            file: range.file.clone(),
            start_offset: range.start_offset,
            end_offset: range.end_offset,
            label: range.label.clone(),
        }
    }
}

/// Baseline a patch is verified against
#[derive(Debug, Clone, Copy)]
pub struct VerifyRequest<'a> {
    pub patch: &'a Patch,

    /// Opaque interaction plan handed to the replayer
    pub plan: &'a str,

    pub live_before: &'a [LiveFunction],

    /// Script coverage per file at scan time
    pub coverage_before: &'a BTreeMap<String, f64>,

    /// Scan-time text of files the patch does not touch, for live functions living there
    pub unpatched_sources: &'a BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageComparison {
    pub file: String,
    pub before_pct: f64,
    pub after_pct: f64,
    pub delta_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub patch_id: String,
    pub newly_dead_that_were_live: BTreeSet<FunctionId>,
    pub replay_failures: Vec<String>,
    pub passed: bool,

    #[serde(default)]
    pub coverage: Vec<CoverageComparison>,

    /// Informational only; never affects `passed`
    #[serde(default)]
    pub warnings: Vec<String>,

    pub verified_at_ms: u64,
}

/// How a verification run ended
#[derive(Debug, Clone, PartialEq)]
pub enum VerifyOutcome {
    Passed(VerificationResult),
    Regressed(VerificationResult),
    /// Replay exceeded its bound; the patch stays applied
    TimedOut { after: Duration },
    /// Caller cancelled; the patch stays applied
    Cancelled,
}

impl VerifyOutcome {
    pub fn result(&self) -> Option<&VerificationResult> {
        match self {
            Self::Passed(result) | Self::Regressed(result) => Some(result),
            Self::TimedOut { .. } | Self::Cancelled => None,
        }
    }

    /// Interrupted runs as errors, for callers that only handle finished verifications
    pub fn into_result(self, patch_id: &str) -> Result<VerificationResult> {
        match self {
            Self::Passed(result) | Self::Regressed(result) => Ok(result),
            Self::TimedOut { after } => Err(LifecycleError::ReplayTimeout {
                patch_id: patch_id.to_string(),
                secs: after.as_secs(),
            }),
            Self::Cancelled => Err(LifecycleError::Cancelled(patch_id.to_string())),
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Passed(_) => "passed",
            Self::Regressed(_) => "regressed",
            Self::TimedOut { .. } => "timed-out",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Where `offset` in the original text lands once `removed` (sorted, disjoint) is cut out
fn shifted(offset: usize, removed: &[Span]) -> usize {
    let mut shift = 0;
    for span in removed {
        if span.end <= offset {
            shift += span.len();
        } else if span.start < offset {
            shift += offset - span.start;
        } else {
            break;
        }
    }
    offset - shift
}

struct FileCheck<'a> {
    path: &'a str,
    text: String,
    removed: Vec<Span>,
}

/// Compare replayed coverage against the pre-patch baseline.
///
/// Every live function that survived the patch is located in the post-patch text and must
/// still execute. Functions that can no longer be located, and files that no longer parse,
/// are reported as failures.
pub(crate) fn evaluate(
    request: &VerifyRequest<'_>,
    snapshot: &BTreeMap<String, String>,
    replay: &ReplayOutcome,
    mapper: CoverageMapper,
    coverage_drop_threshold_pct: f64,
) -> Result<VerificationResult> {
    let patch = request.patch;
    let removed_ids = patch.removed_ids();
    let mut failures = replay.failures.clone();
    let mut newly_dead = BTreeSet::new();
    let mut coverage = Vec::new();
    let mut warnings = Vec::new();

    let mut checks: Vec<FileCheck<'_>> = Vec::new();
    for file in &patch.files {
        let original = snapshot
            .get(&file.path)
            .ok_or_else(|| PatchError::MissingSource(file.path.clone()))?;
        let diff = parse_unified_diff(&file.diff)?
            .into_iter()
            .find(|d| d.path == file.path)
            .ok_or_else(|| PatchError::malformed(format!("no hunks for {}", file.path)))?;
        checks.push(FileCheck {
            path: &file.path,
            text: apply_file_diff(original, &diff)?,
            removed: file.removed_spans(),
        });
    }
    for (path, text) in request.unpatched_sources {
        if patch.file(path).is_none() && request.live_before.iter().any(|f| &f.file == path) {
            checks.push(FileCheck {
                path,
                text: text.clone(),
                removed: Vec::new(),
            });
        }
    }

    for check in &checks {
        let index = match index_source(check.path, &check.text) {
            Ok(IndexOutcome::Indexed(index)) => index,
            Ok(IndexOutcome::Unparsable(file)) => {
                failures.push(format!("{} no longer parses: {}", check.path, file.reason));
                continue;
            }
            Err(err) => {
                failures.push(format!("{} could not be indexed: {err}", check.path));
                continue;
            }
        };

        let samples: Vec<CoverageSample> = replay
            .samples
            .iter()
            .filter(|s| s.file == check.path)
            .cloned()
            .collect();
        let mapping = match mapper.map(&index, &samples) {
            Ok(mapping) => mapping,
            Err(err) => {
                failures.push(format!("replay coverage for {} unusable: {err}", check.path));
                continue;
            }
        };
        for dropped in &mapping.dropped {
            log::warn!(
                "{}: dropped replay range {}..{} ({})",
                check.path,
                dropped.start_offset,
                dropped.end_offset,
                dropped.reason
            );
        }

        for live in request
            .live_before
            .iter()
            .filter(|f| f.file == check.path && !removed_ids.contains(&f.id))
        {
            let start = shifted(live.start_offset, &check.removed);
            let end = shifted(live.end_offset, &check.removed);
            match index.find_range(start, end) {
                Some(function) => {
                    let executed = mapping.verdict(&function.id).is_some_and(|v| v.executed);
                    if !executed {
                        newly_dead.insert(live.id.clone());
                    }
                }
                None => failures.push(format!(
                    "`{}` from {} could not be located after patching",
                    live.label, live.id
                )),
            }
        }

        let after_pct = mapping.script_coverage_pct(&index);
        if let Some(&before_pct) = request.coverage_before.get(check.path) {
            let delta_pct = after_pct - before_pct;
            if delta_pct < -coverage_drop_threshold_pct {
                warnings.push(format!(
                    "coverage for {} dropped by {:.1}pp ({:.1}% -> {:.1}%)",
                    check.path, -delta_pct, before_pct, after_pct
                ));
            }
            coverage.push(CoverageComparison {
                file: check.path.to_string(),
                before_pct,
                after_pct,
                delta_pct,
            });
        }
    }

    let passed = newly_dead.is_empty() && failures.is_empty();
    Ok(VerificationResult {
        patch_id: patch.id.clone(),
        newly_dead_that_were_live: newly_dead,
        replay_failures: failures,
        passed,
        coverage,
        warnings,
        verified_at_ms: unix_now_ms(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shifted_offsets() {
        let removed = [Span::new(10, 20), Span::new(30, 35)];
        assert_eq!(shifted(5, &removed), 5);
        assert_eq!(shifted(10, &removed), 10);
        assert_eq!(shifted(20, &removed), 10);
        assert_eq!(shifted(25, &removed), 15);
        assert_eq!(shifted(40, &removed), 25);
        // inside a removed span collapses onto its start
        assert_eq!(shifted(15, &removed), 10);
    }
}
