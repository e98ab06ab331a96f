use crate::error::{AnalysisError, Result};
use reaper_source_index::{FunctionId, FunctionRange, SourceIndex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Slack in bytes when matching coverage ranges to function boundaries
pub const DEFAULT_BOUNDARY_TOLERANCE: usize = 1;

/// One byte range reported by a runtime coverage capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageRange {
    pub start_offset: usize,
    pub end_offset: usize,
    pub count: u64,
}

/// Coverage observed for one file during one exploration session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageSample {
    pub session_id: String,
    pub file: String,
    pub ranges: Vec<CoverageRange>,
}

/// Merged execution status of one function
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionVerdict {
    pub executed: bool,
    pub total_call_count: u64,
    pub sessions_covering: BTreeSet<String>,
}

impl ExecutionVerdict {
    /// Union of executed flags, sum of counts, union of sessions
    pub fn merge(&mut self, other: &Self) {
        self.executed |= other.executed;
        self.total_call_count = self.total_call_count.saturating_add(other.total_call_count);
        self.sessions_covering
            .extend(other.sessions_covering.iter().cloned());
    }
}

/// A coverage range that could not be aligned with the indexed source.
///
/// Recorded in the mapping and logged; never fatal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageAlignmentError {
    pub session_id: String,
    pub start_offset: usize,
    pub end_offset: usize,
    pub reason: String,
}

/// Execution verdicts for every function of one file revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageMapping {
    pub file: String,

    /// Revision of the index the verdicts were computed against
    pub revision: String,

    /// Every session that contributed a sample, executed or not
    pub sessions: BTreeSet<String>,

    pub verdicts: BTreeMap<FunctionId, ExecutionVerdict>,

    #[serde(default)]
    pub dropped: Vec<CoverageAlignmentError>,
}

impl CoverageMapping {
    /// Mapping with a not-executed verdict for each function and no sessions
    pub fn empty(index: &SourceIndex) -> Self {
        Self {
            file: index.file.clone(),
            revision: index.revision.clone(),
            sessions: BTreeSet::new(),
            verdicts: index
                .functions()
                .iter()
                .map(|f| (f.id.clone(), ExecutionVerdict::default()))
                .collect(),
            dropped: Vec::new(),
        }
    }

    pub fn verdict(&self, id: &FunctionId) -> Option<&ExecutionVerdict> {
        self.verdicts.get(id)
    }

    /// Fail unless the mapping was computed against exactly this index
    pub fn ensure_matches(&self, index: &SourceIndex) -> Result<()> {
        if self.file != index.file {
            return Err(AnalysisError::FileMismatch {
                sample: self.file.clone(),
                index: index.file.clone(),
            });
        }
        if self.revision != index.revision {
            return Err(AnalysisError::stale(
                &self.file,
                &index.revision,
                &self.revision,
            ));
        }
        Ok(())
    }

    /// Fold `other` into `self`. The result does not depend on merge order.
    pub fn merge(&mut self, other: &CoverageMapping) -> Result<()> {
        if other.file != self.file {
            return Err(AnalysisError::FileMismatch {
                sample: other.file.clone(),
                index: self.file.clone(),
            });
        }
        if other.revision != self.revision {
            return Err(AnalysisError::stale(
                &self.file,
                &self.revision,
                &other.revision,
            ));
        }

        self.sessions.extend(other.sessions.iter().cloned());
        for (id, verdict) in &other.verdicts {
            self.verdicts.entry(id.clone()).or_default().merge(verdict);
        }
        self.dropped.extend(other.dropped.iter().cloned());
        self.dropped.sort();
        self.dropped.dedup();
        Ok(())
    }

    pub fn executed_count(&self) -> usize {
        self.verdicts.values().filter(|v| v.executed).count()
    }

    /// Executed function bytes as a percentage of all function bytes
    pub fn script_coverage_pct(&self, index: &SourceIndex) -> f64 {
        let mut total = 0usize;
        let mut covered = 0usize;
        for function in index.functions() {
            total += function.len();
            if self.verdict(&function.id).is_some_and(|v| v.executed) {
                covered += function.len();
            }
        }
        if total == 0 {
            0.0
        } else {
            covered as f64 * 100.0 / total as f64
        }
    }
}

/// Attributes coverage ranges to the functions of a [`SourceIndex`].
///
/// A positive range marks the innermost function that encloses it (within the boundary
/// tolerance) and any function it only partially overlaps. A range that wholly contains a
/// function, such as a script's top-level range, says nothing about that function.
#[derive(Debug, Clone, Copy)]
pub struct CoverageMapper {
    tolerance: usize,
}

impl Default for CoverageMapper {
    fn default() -> Self {
        Self::new(DEFAULT_BOUNDARY_TOLERANCE)
    }
}

impl CoverageMapper {
    pub fn new(tolerance: usize) -> Self {
        Self { tolerance }
    }

    pub fn tolerance(&self) -> usize {
        self.tolerance
    }

    /// Map every sample and merge the results
    pub fn map(&self, index: &SourceIndex, samples: &[CoverageSample]) -> Result<CoverageMapping> {
        let mut mapping = CoverageMapping::empty(index);
        for sample in samples {
            mapping.merge(&self.map_sample(index, sample)?)?;
        }
        Ok(mapping)
    }

    /// Verdicts contributed by a single sample
    pub fn map_sample(&self, index: &SourceIndex, sample: &CoverageSample) -> Result<CoverageMapping> {
        if sample.file != index.file {
            return Err(AnalysisError::FileMismatch {
                sample: sample.file.clone(),
                index: index.file.clone(),
            });
        }

        let functions = index.functions();
        let mut executed = vec![false; functions.len()];
        let mut boundary_calls = vec![0u64; functions.len()];
        let mut block_peak = vec![0u64; functions.len()];
        let mut dropped = Vec::new();

        for range in &sample.ranges {
            if range.start_offset > range.end_offset || range.end_offset > index.source_len {
                log::warn!(
                    "{}: dropping coverage range {}..{} from session {} (source is {} bytes)",
                    index.file,
                    range.start_offset,
                    range.end_offset,
                    sample.session_id,
                    index.source_len
                );
                dropped.push(CoverageAlignmentError {
                    session_id: sample.session_id.clone(),
                    start_offset: range.start_offset,
                    end_offset: range.end_offset,
                    reason: format!("outside source of {} bytes", index.source_len),
                });
                continue;
            }
            if range.count == 0 {
                continue;
            }

            if let Some(owner) = self.innermost_owner(functions, range) {
                executed[owner] = true;
                if self.matches_boundaries(&functions[owner], range) {
                    boundary_calls[owner] = boundary_calls[owner].saturating_add(range.count);
                } else {
                    block_peak[owner] = block_peak[owner].max(range.count);
                }
            }

            let reach = functions.partition_point(|f| f.start_offset < range.end_offset);
            for (idx, function) in functions[..reach].iter().enumerate() {
                if function.end_offset <= range.start_offset
                    || self.encloses(function, range)
                    || self.enclosed_by(function, range)
                {
                    continue;
                }
                executed[idx] = true;
                block_peak[idx] = block_peak[idx].max(range.count);
            }
        }

        let verdicts = functions
            .iter()
            .enumerate()
            .map(|(idx, function)| {
                let total_call_count = if boundary_calls[idx] > 0 {
                    boundary_calls[idx]
                } else if executed[idx] {
                    block_peak[idx].max(1)
                } else {
                    0
                };
                let sessions_covering = if executed[idx] {
                    BTreeSet::from([sample.session_id.clone()])
                } else {
                    BTreeSet::new()
                };
                (
                    function.id.clone(),
                    ExecutionVerdict {
                        executed: executed[idx],
                        total_call_count,
                        sessions_covering,
                    },
                )
            })
            .collect();

        Ok(CoverageMapping {
            file: index.file.clone(),
            revision: index.revision.clone(),
            sessions: BTreeSet::from([sample.session_id.clone()]),
            verdicts,
            dropped,
        })
    }

    /// Functions are sorted outer-first, and enclosing functions nest, so the last
    /// encloser that starts at or before the range is the innermost one.
    fn innermost_owner(&self, functions: &[FunctionRange], range: &CoverageRange) -> Option<usize> {
        let reach =
            functions.partition_point(|f| f.start_offset <= range.start_offset + self.tolerance);
        functions[..reach]
            .iter()
            .rposition(|f| self.encloses(f, range))
    }

    fn encloses(&self, function: &FunctionRange, range: &CoverageRange) -> bool {
        function.start_offset <= range.start_offset + self.tolerance
            && range.end_offset <= function.end_offset + self.tolerance
    }

    fn enclosed_by(&self, function: &FunctionRange, range: &CoverageRange) -> bool {
        range.start_offset <= function.start_offset + self.tolerance
            && function.end_offset <= range.end_offset + self.tolerance
    }

    fn matches_boundaries(&self, function: &FunctionRange, range: &CoverageRange) -> bool {
        function.start_offset.abs_diff(range.start_offset) <= self.tolerance
            && function.end_offset.abs_diff(range.end_offset) <= self.tolerance
    }
}

/// Append-only coverage accumulation for one file revision.
///
/// Each batch is folded in completely or not at all; a session already recorded is
/// never counted twice.
#[derive(Debug, Clone)]
pub struct CoverageLedger {
    mapper: CoverageMapper,
    mapping: CoverageMapping,
}

impl CoverageLedger {
    pub fn new(mapper: CoverageMapper, index: &SourceIndex) -> Self {
        Self {
            mapper,
            mapping: CoverageMapping::empty(index),
        }
    }

    /// Resume from a previously stored mapping
    pub fn from_mapping(mapper: CoverageMapper, mapping: CoverageMapping) -> Self {
        Self { mapper, mapping }
    }

    /// Returns the number of samples folded in
    pub fn ingest(&mut self, index: &SourceIndex, samples: &[CoverageSample]) -> Result<usize> {
        self.mapping.ensure_matches(index)?;

        let mut staged = self.mapping.clone();
        let mut accepted = 0;
        for sample in samples {
            if staged.sessions.contains(&sample.session_id) {
                log::debug!(
                    "{}: session {} already ingested; skipping",
                    index.file,
                    sample.session_id
                );
                continue;
            }
            staged.merge(&self.mapper.map_sample(index, sample)?)?;
            accepted += 1;
        }

        self.mapping = staged;
        Ok(accepted)
    }

    pub fn mapping(&self) -> &CoverageMapping {
        &self.mapping
    }

    pub fn into_mapping(self) -> CoverageMapping {
        self.mapping
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use reaper_source_index::index_source;

    const SCENARIO: &str = "function used(){return 1;} function unused(){return 2;} used();";

    fn index(code: &str) -> SourceIndex {
        index_source("app.js", code)
            .expect("index")
            .into_index()
            .expect("parsable")
    }

    fn sample(session: &str, ranges: &[(usize, usize, u64)]) -> CoverageSample {
        CoverageSample {
            session_id: session.to_string(),
            file: "app.js".to_string(),
            ranges: ranges
                .iter()
                .map(|&(start_offset, end_offset, count)| CoverageRange {
                    start_offset,
                    end_offset,
                    count,
                })
                .collect(),
        }
    }

    fn verdict<'a>(mapping: &'a CoverageMapping, index: &SourceIndex, name: &str) -> &'a ExecutionVerdict {
        let function = index.by_name(name).next().expect("function");
        mapping.verdict(&function.id).expect("verdict")
    }

    #[test]
    fn test_scenario_marks_only_called_function() {
        let index = index(SCENARIO);
        let mapping = CoverageMapper::default()
            .map(
                &index,
                &[sample("s1", &[(0, 63, 1), (0, 26, 1), (27, 55, 0)])],
            )
            .expect("map");

        let used = verdict(&mapping, &index, "used");
        assert!(used.executed);
        assert_eq!(used.total_call_count, 1);
        assert_eq!(used.sessions_covering, BTreeSet::from(["s1".to_string()]));

        let unused = verdict(&mapping, &index, "unused");
        assert!(!unused.executed);
        assert_eq!(unused.total_call_count, 0);
    }

    #[test]
    fn test_inner_execution_does_not_mark_outer() {
        let code = "function outer(){ function inner(){} return 1; }";
        let index = index(code);
        let inner = index.by_name("inner").next().expect("inner");
        let mapping = CoverageMapper::default()
            .map(
                &index,
                &[sample("s1", &[(inner.start_offset, inner.end_offset, 2)])],
            )
            .expect("map");

        assert!(verdict(&mapping, &index, "inner").executed);
        assert!(!verdict(&mapping, &index, "outer").executed);
    }

    #[test]
    fn test_outer_execution_does_not_mark_inner() {
        let code = "function outer(){ function inner(){} return 1; }";
        let index = index(code);
        let mapping = CoverageMapper::default()
            .map(&index, &[sample("s1", &[(0, code.len(), 1)])])
            .expect("map");

        assert!(verdict(&mapping, &index, "outer").executed);
        assert!(!verdict(&mapping, &index, "inner").executed);
    }

    #[test]
    fn test_boundary_tolerance() {
        let index = index(SCENARIO);
        let mapping = CoverageMapper::new(1)
            .map(&index, &[sample("s1", &[(28, 54, 3)])])
            .expect("map");
        let unused = verdict(&mapping, &index, "unused");
        assert!(unused.executed);
        assert_eq!(unused.total_call_count, 3);
    }

    #[test]
    fn test_partial_overlap_marks_both() {
        let index = index(SCENARIO);
        let mapping = CoverageMapper::default()
            .map(&index, &[sample("s1", &[(5, 40, 1)])])
            .expect("map");
        assert!(verdict(&mapping, &index, "used").executed);
        assert!(verdict(&mapping, &index, "unused").executed);
    }

    #[test]
    fn test_out_of_bounds_range_is_dropped() {
        let index = index(SCENARIO);
        let mapping = CoverageMapper::default()
            .map(&index, &[sample("s1", &[(0, 26, 1), (50, 900, 1)])])
            .expect("map");
        assert_eq!(mapping.dropped.len(), 1);
        assert_eq!(mapping.dropped[0].start_offset, 50);
        assert!(verdict(&mapping, &index, "used").executed);
        assert!(!verdict(&mapping, &index, "unused").executed);
    }

    #[test]
    fn test_merge_across_sessions() {
        let index = index(SCENARIO);
        let mapping = CoverageMapper::default()
            .map(
                &index,
                &[
                    sample("s1", &[(0, 26, 2)]),
                    sample("s2", &[(0, 26, 1)]),
                    sample("s3", &[]),
                ],
            )
            .expect("map");
        let used = verdict(&mapping, &index, "used");
        assert_eq!(used.total_call_count, 3);
        assert_eq!(used.sessions_covering.len(), 2);
        assert_eq!(mapping.sessions.len(), 3);
        assert_eq!(mapping.executed_count(), 1);
    }

    #[test]
    fn test_script_coverage_pct() {
        let index = index(SCENARIO);
        let mapping = CoverageMapper::default()
            .map(&index, &[sample("s1", &[(0, 26, 1)])])
            .expect("map");
        let pct = mapping.script_coverage_pct(&index);
        assert!((pct - 26.0 * 100.0 / 54.0).abs() < 1e-9);
    }

    #[test]
    fn test_foreign_file_rejected() {
        let index = index(SCENARIO);
        let mut foreign = sample("s1", &[(0, 26, 1)]);
        foreign.file = "other.js".to_string();
        assert!(matches!(
            CoverageMapper::default().map_sample(&index, &foreign),
            Err(AnalysisError::FileMismatch { .. })
        ));
    }

    #[test]
    fn test_stale_revision_rejected() {
        let old = index(SCENARIO);
        let new = index("function used(){return 3;} used();");
        let mapping = CoverageMapper::default()
            .map(&old, &[sample("s1", &[(0, 26, 1)])])
            .expect("map");
        assert!(matches!(
            mapping.ensure_matches(&new),
            Err(AnalysisError::StaleIndex { .. })
        ));
    }

    #[test]
    fn test_ledger_skips_known_sessions() {
        let index = index(SCENARIO);
        let mut ledger = CoverageLedger::new(CoverageMapper::default(), &index);

        let first = ledger
            .ingest(&index, &[sample("s1", &[(0, 26, 1)])])
            .expect("ingest");
        assert_eq!(first, 1);

        let again = ledger
            .ingest(
                &index,
                &[sample("s1", &[(0, 26, 1)]), sample("s2", &[(27, 55, 1)])],
            )
            .expect("ingest");
        assert_eq!(again, 1);

        let mapping = ledger.into_mapping();
        assert_eq!(verdict(&mapping, &index, "used").total_call_count, 1);
        assert!(verdict(&mapping, &index, "unused").executed);
    }

    #[test]
    fn test_ledger_skips_session_repeated_in_batch() {
        let index = index(SCENARIO);
        let mut ledger = CoverageLedger::new(CoverageMapper::default(), &index);

        let accepted = ledger
            .ingest(
                &index,
                &[sample("s1", &[(0, 26, 1)]), sample("s1", &[(0, 26, 1)])],
            )
            .expect("ingest");
        assert_eq!(accepted, 1);

        let mapping = ledger.into_mapping();
        assert_eq!(verdict(&mapping, &index, "used").total_call_count, 1);
        assert_eq!(mapping.sessions.len(), 1);
    }

    #[test]
    fn test_ledger_batch_is_atomic() {
        let index = index(SCENARIO);
        let mut ledger = CoverageLedger::new(CoverageMapper::default(), &index);
        let mut foreign = sample("s2", &[(0, 26, 1)]);
        foreign.file = "other.js".to_string();

        assert!(ledger
            .ingest(&index, &[sample("s1", &[(0, 26, 1)]), foreign])
            .is_err());
        assert!(ledger.mapping().sessions.is_empty());
        assert_eq!(ledger.mapping().executed_count(), 0);
    }

    fn arb_range() -> impl Strategy<Value = (usize, usize, u64)> {
        (0usize..70, 0usize..70, 0u64..4).prop_map(|(a, b, count)| (a.min(b), a.max(b), count))
    }

    fn arb_sample() -> impl Strategy<Value = CoverageSample> {
        (
            prop::sample::select(vec!["s1", "s2", "s3"]),
            prop::collection::vec(arb_range(), 0..6),
        )
            .prop_map(|(session, ranges)| sample(session, &ranges))
    }

    proptest! {
        #[test]
        fn prop_merge_is_order_independent(samples in prop::collection::vec(arb_sample(), 1..6)) {
            let index = index(SCENARIO);
            let mapper = CoverageMapper::default();

            let forward = mapper.map(&index, &samples).expect("map");
            let mut reversed = samples.clone();
            reversed.reverse();
            let backward = mapper.map(&index, &reversed).expect("map");

            prop_assert_eq!(forward, backward);
        }
    }
}
