use reaper_analysis::{CoverageAlignmentError, CoverageSample, DeadCodeCandidate, Verdict};
use reaper_lifecycle::{LiveFunction, PatchApplication, VerificationResult};
use reaper_patch::Patch;
use reaper_source_index::UnparsableFile;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// Runtime coverage handed to a scan
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "camelCase")]
pub enum CoverageInput {
    /// Raw `Profiler.takePreciseCoverage` JSON from one exploration session
    #[serde(rename_all = "camelCase")]
    V8 { session_id: String, payload: String },
    /// Samples already resolved to project files
    Samples { samples: Vec<CoverageSample> },
}

#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub root: PathBuf,

    /// Files to analyse, relative to `root`; empty means every file the coverage names
    pub files: Vec<String>,

    pub coverage: Vec<CoverageInput>,

    /// Opaque interaction plan, replayed at verification time
    pub plan: String,
}

/// Analysis of one file at one revision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScannedFile {
    pub path: String,
    pub revision: String,

    /// Text the candidates were computed against
    pub source: String,

    pub candidates: Vec<DeadCodeCandidate>,
    pub live: Vec<LiveFunction>,
    pub coverage_pct: f64,
    pub sessions: BTreeSet<String>,

    #[serde(default)]
    pub dropped_ranges: Vec<CoverageAlignmentError>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSummary {
    pub files: usize,
    pub unparsable: usize,
    pub functions: usize,
    pub dead: usize,
    pub live: usize,
    pub uncertain: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRecord {
    pub id: String,
    pub root: PathBuf,
    pub created_at_ms: u64,
    pub plan: String,
    pub sessions: BTreeSet<String>,
    pub files: Vec<ScannedFile>,

    #[serde(default)]
    pub unparsable: Vec<UnparsableFile>,

    pub summary: ScanSummary,
}

impl ScanRecord {
    pub fn candidates(&self) -> impl Iterator<Item = &DeadCodeCandidate> {
        self.files.iter().flat_map(|f| f.candidates.iter())
    }

    pub fn live_functions(&self) -> Vec<LiveFunction> {
        self.files.iter().flat_map(|f| f.live.iter().cloned()).collect()
    }

    pub fn coverage_by_file(&self) -> BTreeMap<String, f64> {
        self.files
            .iter()
            .map(|f| (f.path.clone(), f.coverage_pct))
            .collect()
    }

    pub fn sources(&self) -> BTreeMap<String, String> {
        self.files
            .iter()
            .map(|f| (f.path.clone(), f.source.clone()))
            .collect()
    }

    pub(crate) fn summarize(files: &[ScannedFile], unparsable: usize) -> ScanSummary {
        let mut summary = ScanSummary {
            files: files.len(),
            unparsable,
            ..ScanSummary::default()
        };
        for candidate in files.iter().flat_map(|f| f.candidates.iter()) {
            summary.functions += 1;
            match candidate.verdict {
                Verdict::Dead => summary.dead += 1,
                Verdict::Live => summary.live += 1,
                Verdict::Uncertain => summary.uncertain += 1,
            }
        }
        summary
    }
}

/// Every record stored for one scan
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanListing {
    pub scan_id: String,
    pub patches: Vec<Patch>,
    pub applications: Vec<PatchApplication>,
    pub verifications: Vec<VerificationResult>,
}
