use pretty_assertions::assert_eq;
use reaper_analysis::{CoverageMapper, CoverageRange, CoverageSample, DeadCodeClassifier, Verdict};
use reaper_patch::{
    apply_file_diff, parse_unified_diff, PatchGenerator, PatchRequest, SafetyProfile,
};
use reaper_source_index::{index_source, revision_of};
use std::collections::BTreeMap;

const SOURCE: &str = "function used(){return 1;} function unused(){return 2;} used();";

#[test]
fn test_conservative_patch_removes_unused_statement() {
    let index = index_source("app.js", SOURCE)
        .expect("index")
        .into_index()
        .expect("parsable");
    let sample = CoverageSample {
        session_id: "s1".into(),
        file: "app.js".into(),
        ranges: vec![
            CoverageRange { start_offset: 0, end_offset: 63, count: 1 },
            CoverageRange { start_offset: 0, end_offset: 26, count: 1 },
            CoverageRange { start_offset: 27, end_offset: 55, count: 0 },
        ],
    };
    let mapping = CoverageMapper::default().map(&index, &[sample]).expect("map");
    let candidates = DeadCodeClassifier::default()
        .classify(&index, &mapping)
        .expect("classify");
    assert_eq!(candidates[0].verdict, Verdict::Live);
    assert_eq!(candidates[1].verdict, Verdict::Dead);

    let sources = BTreeMap::from([("app.js".to_string(), SOURCE.to_string())]);
    let patch = PatchGenerator::default()
        .generate(&PatchRequest {
            scan_id: "scan-1",
            profile: SafetyProfile::Conservative,
            candidates: &candidates,
            sources: &sources,
            selection: None,
        })
        .expect("patch");

    assert_eq!(patch.files_touched(), 1);
    assert_eq!(patch.included_function_ids.len(), 1);
    assert!(patch
        .included_function_ids
        .contains(&candidates[1].function_range_id));
    assert!(patch.higher_risk_function_ids.is_empty());

    let file = &patch.files[0];
    assert_eq!(file.base_revision, revision_of(SOURCE));
    assert_eq!(file.diff.matches("\n@@ ").count(), 1);
    assert_eq!(file.diff, patch.combined_diff);
    assert_eq!(
        file.rationale,
        vec![format!("- unused (L1-L1): {}", candidates[1].reasons.join("; "))]
    );

    let parsed = parse_unified_diff(&patch.combined_diff).expect("parse");
    let patched = apply_file_diff(SOURCE, &parsed[0]).expect("apply");
    assert_eq!(patched, "function used(){return 1;} used();");
    assert_eq!(revision_of(&patched), file.patched_revision);
    assert!(index_source("app.js", &patched)
        .expect("index")
        .is_parsable());
}

#[test]
fn test_combined_diff_is_path_ordered() {
    let mut sources = BTreeMap::new();
    let mut candidates = Vec::new();
    for path in ["zeta.js", "alpha.js", "mid.js"] {
        let code = "function gone() {}\nkeep();\n";
        let index = index_source(path, code)
            .expect("index")
            .into_index()
            .expect("parsable");
        let mapping = CoverageMapper::default().map(&index, &[]).expect("map");
        candidates.extend(
            DeadCodeClassifier::default()
                .classify(&index, &mapping)
                .expect("classify"),
        );
        sources.insert(path.to_string(), code.to_string());
    }

    let patch = PatchGenerator::default()
        .generate(&PatchRequest {
            scan_id: "scan-1",
            profile: SafetyProfile::Balanced,
            candidates: &candidates,
            sources: &sources,
            selection: None,
        })
        .expect("patch");

    let headers: Vec<_> = patch
        .combined_diff
        .lines()
        .filter(|l| l.starts_with("--- "))
        .collect();
    assert_eq!(headers, vec!["--- a/alpha.js", "--- a/mid.js", "--- a/zeta.js"]);
    assert_eq!(parse_unified_diff(&patch.combined_diff).expect("parse").len(), 3);
}
