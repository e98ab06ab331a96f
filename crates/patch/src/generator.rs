use crate::diff::render_file_diff;
use crate::error::{PatchError, Result};
use crate::profile::{PatchConfig, SafetyProfile};
use crate::span::{asi_hazard, brackets_balanced, merge_spans, remove_spans, widen, Span};
use reaper_analysis::{DeadCodeCandidate, Verdict};
use reaper_source_index::{
    index_source, revision_of, DynamicSignal, FunctionId, FunctionRange, IndexOutcome,
    SourceIndex, UnitKind,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static PATCH_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// One function removed by a patch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovedUnit {
    pub function_range_id: FunctionId,
    pub label: String,
    pub verdict: Verdict,
    pub risk_score: f64,

    /// Widened removal span in the original text
    pub start_offset: usize,
    pub end_offset: usize,

    pub line_start: usize,
    pub line_end: usize,

    /// Uncertain function admitted by the aggressive profile
    #[serde(default)]
    pub higher_risk: bool,
}

/// Everything a patch does to one file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePatch {
    pub path: String,

    /// Revision the diff applies to
    pub base_revision: String,

    /// Revision of the text after the diff
    pub patched_revision: String,

    pub diff: String,
    pub removals: Vec<RemovedUnit>,
    pub bytes_removed: usize,
    pub max_risk: f64,
    pub rationale: Vec<String>,
    pub verification_plan: Vec<String>,
}

impl FilePatch {
    /// Removed spans, sorted and disjoint
    pub fn removed_spans(&self) -> Vec<Span> {
        merge_spans(
            self.removals
                .iter()
                .map(|r| Span::new(r.start_offset, r.end_offset))
                .collect(),
        )
    }
}

/// A candidate the profile or the source structure kept out of the patch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedCandidate {
    pub function_range_id: FunctionId,
    pub file: String,
    pub label: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patch {
    pub id: String,
    pub scan_id: String,
    pub profile: SafetyProfile,
    pub created_at_ms: u64,

    /// Sorted by path
    pub files: Vec<FilePatch>,

    /// Dead functions removed
    pub included_function_ids: BTreeSet<FunctionId>,

    /// Uncertain functions removed under the aggressive profile
    #[serde(default)]
    pub higher_risk_function_ids: BTreeSet<FunctionId>,

    /// File diffs concatenated in path order
    pub combined_diff: String,

    #[serde(default)]
    pub skipped: Vec<SkippedCandidate>,

    pub bytes_removed: usize,
    pub max_risk: f64,
}

impl Patch {
    pub fn files_touched(&self) -> usize {
        self.files.len()
    }

    pub fn file(&self, path: &str) -> Option<&FilePatch> {
        self.files.iter().find(|f| f.path == path)
    }

    pub fn file_diffs(&self) -> BTreeMap<&str, &str> {
        self.files
            .iter()
            .map(|f| (f.path.as_str(), f.diff.as_str()))
            .collect()
    }

    /// Every removed function, dead or higher-risk
    pub fn removed_ids(&self) -> BTreeSet<&FunctionId> {
        self.included_function_ids
            .iter()
            .chain(&self.higher_risk_function_ids)
            .collect()
    }
}

/// Inputs of one generation run
pub struct PatchRequest<'a> {
    pub scan_id: &'a str,
    pub profile: SafetyProfile,
    pub candidates: &'a [DeadCodeCandidate],

    /// Original text of every scanned file, keyed by path
    pub sources: &'a BTreeMap<String, String>,

    /// Consider only these candidates
    pub selection: Option<&'a BTreeSet<FunctionId>>,
}

struct Chosen<'a> {
    candidate: &'a DeadCodeCandidate,
    span: Span,
    higher_risk: bool,
}

/// Selects removable candidates under a safety profile and renders them as a patch
#[derive(Debug, Clone, Default)]
pub struct PatchGenerator {
    config: PatchConfig,
}

impl PatchGenerator {
    pub fn new(config: PatchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PatchConfig {
        &self.config
    }

    /// Build a patch, or fail without emitting anything.
    ///
    /// Fails with [`PatchError::ReparseFailed`] when any file would no longer parse
    /// after its removals, and with [`PatchError::NoCandidates`] when nothing is left
    /// to remove.
    pub fn generate(&self, request: &PatchRequest<'_>) -> Result<Patch> {
        if let Some(selection) = request.selection {
            if selection.is_empty() {
                return Err(PatchError::no_candidates("empty candidate selection"));
            }
            let known: BTreeSet<&FunctionId> = request
                .candidates
                .iter()
                .map(|c| &c.function_range_id)
                .collect();
            let unknown: Vec<&str> = selection
                .iter()
                .filter(|id| !known.contains(id))
                .map(FunctionId::as_str)
                .collect();
            if !unknown.is_empty() {
                return Err(PatchError::no_candidates(format!(
                    "unknown candidate id(s): {}",
                    unknown.join(", ")
                )));
            }
        }

        let mut by_file: BTreeMap<&str, Vec<&DeadCodeCandidate>> = BTreeMap::new();
        for candidate in request.candidates {
            by_file
                .entry(candidate.file.as_str())
                .or_default()
                .push(candidate);
        }

        let mut files = Vec::new();
        let mut skipped = Vec::new();
        let mut stale: Option<PatchError> = None;

        for (path, candidates) in by_file {
            let considered: Vec<&DeadCodeCandidate> = candidates
                .iter()
                .copied()
                .filter(|c| match request.selection {
                    Some(selection) => selection.contains(&c.function_range_id),
                    None => c.verdict != Verdict::Live,
                })
                .collect();
            if considered.is_empty() {
                continue;
            }

            let source = request
                .sources
                .get(path)
                .ok_or_else(|| PatchError::MissingSource(path.to_string()))?;
            let revision = revision_of(source);
            if let Some(old) = considered.iter().find(|c| c.revision != revision) {
                log::warn!("{path}: source changed since scan; discarding its candidates");
                for candidate in &considered {
                    skipped.push(skip(candidate, "stale: source changed since the scan"));
                }
                stale.get_or_insert(PatchError::StaleCandidates {
                    file: path.to_string(),
                    expected: old.revision.clone(),
                    actual: revision,
                });
                continue;
            }

            let index = match index_source(path, source)? {
                IndexOutcome::Indexed(index) => index,
                IndexOutcome::Unparsable(file) => {
                    return Err(PatchError::ReparseFailed {
                        file: path.to_string(),
                        reason: file.reason,
                    })
                }
            };

            if let Some(file_patch) = self.patch_file(
                request,
                path,
                source,
                &index,
                &candidates,
                &considered,
                &mut skipped,
            )? {
                files.push(file_patch);
            }
        }

        if files.is_empty() {
            if let Some(error) = stale {
                return Err(error);
            }
            return Err(PatchError::no_candidates(format!(
                "no candidate survives the {} profile ({} skipped)",
                request.profile,
                skipped.len()
            )));
        }

        let patch = assemble(request, files, skipped);
        log::info!(
            "generated patch {} for scan {}: {} file(s), {} bytes removed",
            patch.id,
            patch.scan_id,
            patch.files_touched(),
            patch.bytes_removed
        );
        Ok(patch)
    }

    #[allow(clippy::too_many_arguments)]
    fn patch_file<'c>(
        &self,
        request: &PatchRequest<'_>,
        path: &str,
        source: &str,
        index: &SourceIndex,
        all: &[&'c DeadCodeCandidate],
        considered: &[&'c DeadCodeCandidate],
        skipped: &mut Vec<SkippedCandidate>,
    ) -> Result<Option<FilePatch>> {
        let verdicts: HashMap<&FunctionId, Verdict> = all
            .iter()
            .map(|c| (&c.function_range_id, c.verdict))
            .collect();
        let verdict_of = |id: &FunctionId| verdicts.get(id).copied().unwrap_or(Verdict::Live);

        let mut chosen: Vec<Chosen<'c>> = Vec::new();
        for &candidate in considered {
            let Some(function) = index.get(&candidate.function_range_id) else {
                skipped.push(skip(candidate, "function not found in the indexed source"));
                continue;
            };

            let higher_risk = match (candidate.verdict, request.profile) {
                (Verdict::Live, _) => {
                    skipped.push(skip(candidate, "live: executed during exploration"));
                    continue;
                }
                (Verdict::Dead, profile) => {
                    if let Some(reason) = self.risk_blocker(candidate, profile) {
                        skipped.push(skip(candidate, reason));
                        continue;
                    }
                    false
                }
                (Verdict::Uncertain, SafetyProfile::Aggressive) => {
                    if let Some(reason) = aggressive_blocker(function, request.sources, path) {
                        skipped.push(skip(candidate, reason));
                        continue;
                    }
                    true
                }
                (Verdict::Uncertain, profile) => {
                    skipped.push(skip(
                        candidate,
                        format!("uncertain functions are never removed under the {profile} profile"),
                    ));
                    continue;
                }
            };

            let Some(unit) = function.removal else {
                skipped.push(skip(
                    candidate,
                    "no standalone removal unit: function is embedded in an expression",
                ));
                continue;
            };
            let span = widen(source, Span::new(unit.start, unit.end));

            if request.profile != SafetyProfile::Aggressive {
                if let Some(outer) = uncertain_ancestor(index, function, &verdict_of) {
                    skipped.push(skip(
                        candidate,
                        format!("nested inside uncertain function `{}`", outer.label),
                    ));
                    continue;
                }
            }

            if request.profile == SafetyProfile::Conservative
                && !brackets_balanced(&source[unit.start..unit.end])
            {
                skipped.push(skip(candidate, "removal text has ambiguous bracket balance"));
                continue;
            }

            if unit.kind == UnitKind::Statement && asi_hazard(source, span) {
                skipped.push(skip(
                    candidate,
                    "removal could join neighbouring statements through automatic semicolon insertion",
                ));
                continue;
            }

            chosen.push(Chosen {
                candidate,
                span,
                higher_risk,
            });
        }

        let folded = self.fold_contained(request.profile, index, all, &mut chosen, skipped);
        if chosen.is_empty() {
            return Ok(None);
        }
        skipped.retain(|s| !folded.iter().any(|f| f.inner.function_range_id == s.function_range_id));

        let spans = merge_spans(chosen.iter().map(|c| c.span).collect());
        let patched = remove_spans(source, &spans);
        if let IndexOutcome::Unparsable(file) = index_source(path, &patched)? {
            log::warn!("{path}: rejecting patch, removal breaks parsing ({})", file.reason);
            return Err(PatchError::ReparseFailed {
                file: path.to_string(),
                reason: file.reason,
            });
        }

        let diff = render_file_diff(path, source, &spans, self.config.context_lines);
        let bytes_removed = spans.iter().map(Span::len).sum();
        let max_risk = chosen
            .iter()
            .map(|c| c.candidate)
            .chain(folded.iter().map(|f| f.inner))
            .map(|c| c.risk_score)
            .fold(0.0, f64::max);

        let units = chosen.len() + folded.len();
        let mut rationale = Vec::with_capacity(units);
        let mut verification_plan = Vec::with_capacity(units);
        let mut removals = Vec::with_capacity(units);
        for Chosen {
            candidate,
            span,
            higher_risk,
        } in chosen
        {
            let flag = if higher_risk { "[higher risk] " } else { "" };
            rationale.push(format!(
                "- {flag}{} (L{}-L{}): {}",
                candidate.label,
                candidate.line_start,
                candidate.line_end,
                candidate.reasons.join("; ")
            ));
            verification_plan.push(format!(
                "replay the interaction plan and confirm nothing live in {path} depended on `{}`",
                candidate.label
            ));
            removals.push(RemovedUnit {
                function_range_id: candidate.function_range_id.clone(),
                label: candidate.label.clone(),
                verdict: candidate.verdict,
                risk_score: candidate.risk_score,
                start_offset: span.start,
                end_offset: span.end,
                line_start: candidate.line_start,
                line_end: candidate.line_end,
                higher_risk,
            });
        }
        for Folded { inner, outer, span } in folded {
            rationale.push(format!(
                "- {} (L{}-L{}, inside `{outer}`): {}",
                inner.label,
                inner.line_start,
                inner.line_end,
                inner.reasons.join("; ")
            ));
            verification_plan.push(format!(
                "replay the interaction plan and confirm nothing live in {path} depended on `{}`",
                inner.label
            ));
            removals.push(RemovedUnit {
                function_range_id: inner.function_range_id.clone(),
                label: inner.label.clone(),
                verdict: inner.verdict,
                risk_score: inner.risk_score,
                start_offset: span.start,
                end_offset: span.end,
                line_start: inner.line_start,
                line_end: inner.line_end,
                higher_risk: false,
            });
        }

        Ok(Some(FilePatch {
            path: path.to_string(),
            base_revision: index.revision.clone(),
            patched_revision: revision_of(&patched),
            diff,
            removals,
            bytes_removed,
            max_risk,
            rationale,
            verification_plan,
        }))
    }

    fn risk_blocker(&self, candidate: &DeadCodeCandidate, profile: SafetyProfile) -> Option<String> {
        (profile == SafetyProfile::Conservative
            && candidate.risk_score >= self.config.conservative_max_risk)
            .then(|| {
                format!(
                    "risk {:.3} is not below the conservative limit {:.3}",
                    candidate.risk_score, self.config.conservative_max_risk
                )
            })
    }

    /// Every function inside a chosen span goes with it, so each one must pass the
    /// profile on its own. A chosen unit holding a function that fails is dropped,
    /// which can expose further functions, so this runs until nothing changes.
    /// Returns the contained functions that are removed without being chosen.
    fn fold_contained<'a>(
        &self,
        profile: SafetyProfile,
        index: &SourceIndex,
        all: &[&'a DeadCodeCandidate],
        chosen: &mut Vec<Chosen<'a>>,
        skipped: &mut Vec<SkippedCandidate>,
    ) -> Vec<Folded<'a>> {
        let by_id: HashMap<&FunctionId, &'a DeadCodeCandidate> = all
            .iter()
            .map(|c| (&c.function_range_id, *c))
            .collect();

        loop {
            let chosen_ids: HashSet<&FunctionId> = chosen
                .iter()
                .map(|c| &c.candidate.function_range_id)
                .collect();
            let mut folded: BTreeMap<&FunctionId, Folded<'a>> = BTreeMap::new();
            let mut blocked = None;

            'outer: for (pos, unit) in chosen.iter().enumerate() {
                let contained = index.functions().iter().filter(|f| {
                    f.id != unit.candidate.function_range_id
                        && !chosen_ids.contains(&f.id)
                        && unit.span.contains_range(f.start_offset, f.end_offset)
                });
                for function in contained {
                    let reason = match by_id.get(&function.id).copied() {
                        Some(inner) if inner.verdict == Verdict::Dead => {
                            match self.risk_blocker(inner, profile) {
                                Some(reason) => reason,
                                None => {
                                    folded.entry(&inner.function_range_id).or_insert(Folded {
                                        inner,
                                        outer: unit.candidate.label.clone(),
                                        span: Span::new(function.start_offset, function.end_offset),
                                    });
                                    continue;
                                }
                            }
                        }
                        Some(inner) => inner.verdict.as_str().to_string(),
                        None => Verdict::Live.as_str().to_string(),
                    };
                    blocked = Some((pos, function.label.clone(), reason));
                    break 'outer;
                }
            }

            match blocked {
                Some((pos, label, reason)) => {
                    let unit = chosen.remove(pos);
                    skipped.push(skip(
                        unit.candidate,
                        format!("removal would take `{label}` with it ({reason})"),
                    ));
                }
                None => return folded.into_values().collect(),
            }
        }
    }
}

/// A dead function removed because it sits inside a chosen unit
struct Folded<'a> {
    inner: &'a DeadCodeCandidate,
    outer: String,
    span: Span,
}

fn skip(candidate: &DeadCodeCandidate, reason: impl Into<String>) -> SkippedCandidate {
    SkippedCandidate {
        function_range_id: candidate.function_range_id.clone(),
        file: candidate.file.clone(),
        label: candidate.label.clone(),
        reason: reason.into(),
    }
}

fn uncertain_ancestor<'a>(
    index: &'a SourceIndex,
    function: &FunctionRange,
    verdict_of: &impl Fn(&FunctionId) -> Verdict,
) -> Option<&'a FunctionRange> {
    let mut parent = function.parent.as_ref();
    while let Some(id) = parent {
        let outer = index.get(id)?;
        if verdict_of(id) == Verdict::Uncertain {
            return Some(outer);
        }
        parent = outer.parent.as_ref();
    }
    None
}

/// Aggressive removal tolerates exports without local calls and unresolved computed
/// lookups, as long as no other scanned file names the function in a string.
fn aggressive_blocker(
    function: &FunctionRange,
    sources: &BTreeMap<String, String>,
    file: &str,
) -> Option<String> {
    if let Some(signal) = function.signals.iter().find(|signal| {
        !matches!(
            signal,
            DynamicSignal::ExportedWithoutLocalCalls | DynamicSignal::ComputedAccess { .. }
        )
    }) {
        return Some(format!("uncertain: {}", signal.describe()));
    }

    let name = function.name.as_deref()?;
    sources
        .iter()
        .filter(|(path, _)| path.as_str() != file)
        .find(|(_, text)| named_in_string(text, name))
        .map(|(path, _)| format!("`{name}` is named in a string in {path}"))
}

fn named_in_string(text: &str, name: &str) -> bool {
    ['\'', '"', '`']
        .iter()
        .any(|quote| text.contains(&format!("{quote}{name}{quote}")))
}

fn assemble(
    request: &PatchRequest<'_>,
    files: Vec<FilePatch>,
    skipped: Vec<SkippedCandidate>,
) -> Patch {
    let combined_diff: String = files.iter().map(|f| f.diff.as_str()).collect();
    let created_at_ms = unix_now_ms();
    let sequence = PATCH_SEQUENCE.fetch_add(1, Ordering::Relaxed);

    let mut hasher = Sha256::new();
    hasher.update(request.scan_id.as_bytes());
    hasher.update(request.profile.as_str().as_bytes());
    hasher.update(combined_diff.as_bytes());
    hasher.update(created_at_ms.to_le_bytes());
    hasher.update(sequence.to_le_bytes());
    hasher.update(std::process::id().to_le_bytes());
    let digest = format!("{:x}", hasher.finalize());

    let mut included_function_ids = BTreeSet::new();
    let mut higher_risk_function_ids = BTreeSet::new();
    for removal in files.iter().flat_map(|f| &f.removals) {
        if removal.higher_risk {
            higher_risk_function_ids.insert(removal.function_range_id.clone());
        } else {
            included_function_ids.insert(removal.function_range_id.clone());
        }
    }

    Patch {
        id: format!("patch-{}", &digest[..16]),
        scan_id: request.scan_id.to_string(),
        profile: request.profile,
        created_at_ms,
        bytes_removed: files.iter().map(|f| f.bytes_removed).sum(),
        max_risk: files.iter().map(|f| f.max_risk).fold(0.0, f64::max),
        included_function_ids,
        higher_risk_function_ids,
        combined_diff,
        skipped,
        files,
    }
}

fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use reaper_analysis::{CoverageMapper, CoverageRange, CoverageSample, DeadCodeClassifier};

    fn candidates_for(path: &str, code: &str, executed: &[&str]) -> Vec<DeadCodeCandidate> {
        let index = index_source(path, code)
            .expect("index")
            .into_index()
            .expect("parsable");
        let ranges = index
            .functions()
            .iter()
            .filter(|f| executed.contains(&f.label.as_str()))
            .map(|f| CoverageRange {
                start_offset: f.start_offset,
                end_offset: f.end_offset,
                count: 1,
            })
            .collect();
        let sample = CoverageSample {
            session_id: "s1".into(),
            file: path.into(),
            ranges,
        };
        let mapping = CoverageMapper::default().map(&index, &[sample]).expect("map");
        DeadCodeClassifier::default()
            .classify(&index, &mapping)
            .expect("classify")
    }

    fn generate(
        profile: SafetyProfile,
        candidates: &[DeadCodeCandidate],
        sources: &BTreeMap<String, String>,
    ) -> Result<Patch> {
        PatchGenerator::default().generate(&PatchRequest {
            scan_id: "scan-1",
            profile,
            candidates,
            sources,
            selection: None,
        })
    }

    fn sources(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(path, text)| (path.to_string(), text.to_string()))
            .collect()
    }

    fn removed_labels(patch: &Patch) -> Vec<&str> {
        patch
            .files
            .iter()
            .flat_map(|f| &f.removals)
            .map(|r| r.label.as_str())
            .collect()
    }

    #[test]
    fn test_balanced_removes_dead_keeps_live() {
        let code = "function a() {}\nfunction b() {}\na();\n";
        let candidates = candidates_for("app.js", code, &["a"]);
        let patch = generate(SafetyProfile::Balanced, &candidates, &sources(&[("app.js", code)]))
            .expect("patch");
        assert_eq!(removed_labels(&patch), vec!["b"]);
        assert_eq!(patch.bytes_removed, "function b() {}\n".len());
        assert!(patch.combined_diff.contains("-function b() {}\n"));
    }

    #[test]
    fn test_conservative_threshold() {
        let body = "x++;".repeat(1000);
        let code = format!("function onSubmit() {{ {body} }}\nfunction tiny() {{}}\n");
        let candidates = candidates_for("app.js", &code, &[]);
        let source_map = sources(&[("app.js", &code)]);

        let conservative = generate(SafetyProfile::Conservative, &candidates, &source_map)
            .expect("patch");
        assert_eq!(removed_labels(&conservative), vec!["tiny"]);
        assert!(conservative.skipped.iter().any(|s| s.label == "onSubmit"
            && s.reason.starts_with("risk")));

        let balanced = generate(SafetyProfile::Balanced, &candidates, &source_map).expect("patch");
        assert_eq!(removed_labels(&balanced), vec!["onSubmit", "tiny"]);
    }

    #[test]
    fn test_nested_dead_functions_fold_into_parent() {
        let code = "function outer() {\n  function inner() {}\n}\nfoo();\n";
        let candidates = candidates_for("app.js", code, &[]);
        let patch = generate(SafetyProfile::Balanced, &candidates, &sources(&[("app.js", code)]))
            .expect("patch");
        assert_eq!(removed_labels(&patch), vec!["outer", "inner"]);
        assert_eq!(patch.files[0].removed_spans().len(), 1);
        assert_eq!(patch.bytes_removed, "function outer() {\n  function inner() {}\n}\n".len());
    }

    #[test]
    fn test_selected_parent_records_contained_functions() {
        let code = "function outer() {\n  function inner() {}\n}\nfoo();\n";
        let candidates = candidates_for("app.js", code, &[]);
        let id_of = |label: &str| {
            candidates
                .iter()
                .find(|c| c.label == label)
                .map(|c| c.function_range_id.clone())
                .expect("candidate")
        };
        let only_outer = BTreeSet::from([id_of("outer")]);
        let source_map = sources(&[("app.js", code)]);

        let patch = PatchGenerator::default()
            .generate(&PatchRequest {
                scan_id: "scan-1",
                profile: SafetyProfile::Balanced,
                candidates: &candidates,
                sources: &source_map,
                selection: Some(&only_outer),
            })
            .expect("patch");

        assert_eq!(
            patch.included_function_ids,
            BTreeSet::from([id_of("outer"), id_of("inner")])
        );
        assert_eq!(removed_labels(&patch), vec!["outer", "inner"]);
        assert_eq!(patch.files[0].removed_spans().len(), 1);
        assert!(patch.files[0]
            .rationale
            .iter()
            .any(|line| line.starts_with("- inner (L2-L2, inside `outer`)")));
        assert_eq!(patch.files[0].verification_plan.len(), 2);
        assert!(patch.skipped.is_empty());
    }

    #[test]
    fn test_contained_function_faces_the_conservative_limit() {
        let code = "function _outer() {\n  function handleClick() {}\n}\nfoo();\n";
        let candidates = candidates_for("app.js", code, &[]);
        let source_map = sources(&[("app.js", code)]);
        let risk = |label: &str| {
            candidates
                .iter()
                .find(|c| c.label == label)
                .map(|c| c.risk_score)
                .expect("candidate")
        };
        assert!(risk("_outer") < 0.35);
        assert!(risk("handleClick") >= 0.35);

        let err = generate(SafetyProfile::Conservative, &candidates, &source_map)
            .expect_err("inner blocks outer");
        assert!(matches!(err, PatchError::NoCandidates(_)));

        let balanced = generate(SafetyProfile::Balanced, &candidates, &source_map).expect("patch");
        assert_eq!(removed_labels(&balanced), vec!["_outer", "handleClick"]);
    }

    #[test]
    fn test_embedded_dead_callback_is_recorded_with_parent() {
        let code = "function outer() {\n  return [1].map(function () { return 2; });\n}\n";
        let candidates = candidates_for("app.js", code, &[]);
        let patch = generate(SafetyProfile::Balanced, &candidates, &sources(&[("app.js", code)]))
            .expect("patch");
        assert_eq!(removed_labels(&patch), vec!["outer", "outer>0"]);
        assert!(patch.skipped.is_empty());
    }

    #[test]
    fn test_live_child_protects_dead_parent() {
        let code = "function outer() {\n  return function () {};\n}\n";
        let candidates = candidates_for("app.js", code, &["outer>0"]);
        let err = generate(SafetyProfile::Balanced, &candidates, &sources(&[("app.js", code)]))
            .expect_err("nothing removable");
        assert!(matches!(err, PatchError::NoCandidates(_)));
    }

    #[test]
    fn test_computed_lookup_only_under_aggressive() {
        let code = "function hidden() {}\nconst api = { dead() {} };\nwindow[name]();\n";
        let candidates = candidates_for("app.js", code, &[]);
        let hidden = candidates.iter().find(|c| c.label == "hidden").expect("hidden");
        assert_eq!(hidden.verdict, Verdict::Uncertain);
        let source_map = sources(&[("app.js", code)]);

        for profile in [SafetyProfile::Conservative, SafetyProfile::Balanced] {
            let patch = generate(profile, &candidates, &source_map).expect("patch");
            assert_eq!(removed_labels(&patch), vec!["dead"]);
            assert!(!patch.removed_ids().contains(&hidden.function_range_id));
        }

        let aggressive = generate(SafetyProfile::Aggressive, &candidates, &source_map)
            .expect("patch");
        assert!(aggressive
            .higher_risk_function_ids
            .contains(&hidden.function_range_id));
        assert!(!aggressive
            .included_function_ids
            .contains(&hidden.function_range_id));
        assert!(aggressive.files[0]
            .rationale
            .iter()
            .any(|line| line.starts_with("- [higher risk] hidden")));
    }

    #[test]
    fn test_aggressive_respects_corpus_string_mentions() {
        let lib = "export function helper() {}\n";
        let app = "import * as lib from './lib.mjs';\nlib['helper']();\n";
        let candidates = candidates_for("lib.mjs", lib, &[]);
        let err = generate(
            SafetyProfile::Aggressive,
            &candidates,
            &sources(&[("lib.mjs", lib), ("app.mjs", app)]),
        )
        .expect_err("helper is named dynamically");
        assert!(matches!(err, PatchError::NoCandidates(_)));

        let patch = generate(
            SafetyProfile::Aggressive,
            &candidates,
            &sources(&[("lib.mjs", lib), ("app.mjs", "import './lib.mjs';\n")]),
        )
        .expect("patch");
        assert_eq!(removed_labels(&patch), vec!["helper"]);
    }

    #[test]
    fn test_embedded_function_is_skipped_with_reason() {
        let code = "register(function () {});\n";
        let candidates = candidates_for("app.js", code, &[]);
        let err = generate(SafetyProfile::Balanced, &candidates, &sources(&[("app.js", code)]))
            .expect_err("nothing removable");
        assert!(matches!(err, PatchError::NoCandidates(_)));
    }

    #[test]
    fn test_asi_hazard_is_skipped() {
        let code = "a()\nfunction dead() {}\n(b)\n";
        let candidates = candidates_for("app.js", code, &[]);
        let err = generate(SafetyProfile::Balanced, &candidates, &sources(&[("app.js", code)]))
            .expect_err("hazard");
        assert!(matches!(err, PatchError::NoCandidates(_)));
    }

    #[test]
    fn test_stale_candidates_are_discarded() {
        let code = "function a() {}\n";
        let candidates = candidates_for("app.js", code, &[]);
        let err = generate(
            SafetyProfile::Balanced,
            &candidates,
            &sources(&[("app.js", "function a() { return 1; }\n")]),
        )
        .expect_err("stale");
        assert!(matches!(err, PatchError::StaleCandidates { .. }));
    }

    #[test]
    fn test_selection_rules() {
        let code = "function a() {}\nfunction b() {}\n";
        let candidates = candidates_for("app.js", code, &[]);
        let source_map = sources(&[("app.js", code)]);
        let generator = PatchGenerator::default();

        let empty = BTreeSet::new();
        let err = generator
            .generate(&PatchRequest {
                scan_id: "scan-1",
                profile: SafetyProfile::Balanced,
                candidates: &candidates,
                sources: &source_map,
                selection: Some(&empty),
            })
            .expect_err("empty selection");
        assert!(matches!(err, PatchError::NoCandidates(_)));

        let only_b: BTreeSet<FunctionId> = candidates
            .iter()
            .filter(|c| c.label == "b")
            .map(|c| c.function_range_id.clone())
            .collect();
        let patch = generator
            .generate(&PatchRequest {
                scan_id: "scan-1",
                profile: SafetyProfile::Balanced,
                candidates: &candidates,
                sources: &source_map,
                selection: Some(&only_b),
            })
            .expect("patch");
        assert_eq!(removed_labels(&patch), vec!["b"]);

        let unknown = BTreeSet::from([FunctionId::from("app.js:1:2")]);
        assert!(generator
            .generate(&PatchRequest {
                scan_id: "scan-1",
                profile: SafetyProfile::Balanced,
                candidates: &candidates,
                sources: &source_map,
                selection: Some(&unknown),
            })
            .is_err());
    }

    #[test]
    fn test_regeneration_yields_new_id() {
        let code = "function a() {}\n";
        let candidates = candidates_for("app.js", code, &[]);
        let source_map = sources(&[("app.js", code)]);
        let first = generate(SafetyProfile::Balanced, &candidates, &source_map).expect("patch");
        let second = generate(SafetyProfile::Balanced, &candidates, &source_map).expect("patch");
        assert_ne!(first.id, second.id);
        assert_eq!(first.combined_diff, second.combined_diff);
    }
}
