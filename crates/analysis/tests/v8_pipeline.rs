use pretty_assertions::assert_eq;
use reaper_analysis::{
    samples_from_v8, CoverageLedger, CoverageMapper, DeadCodeClassifier, ScriptFilter, Verdict,
};
use reaper_source_index::index_source;

const SOURCE: &str = "function used(){return 1;} function unused(){return 2;} used();";

fn payload(used_count: u64, unused_count: u64) -> String {
    format!(
        r#"{{"result":[{{"scriptId":"7","url":"https://shop.example/app.js","functions":[
            {{"functionName":"","isBlockCoverage":true,"ranges":[{{"startOffset":0,"endOffset":63,"count":1}}]}},
            {{"functionName":"used","isBlockCoverage":true,"ranges":[{{"startOffset":0,"endOffset":26,"count":{used_count}}}]}},
            {{"functionName":"unused","isBlockCoverage":true,"ranges":[{{"startOffset":27,"endOffset":55,"count":{unused_count}}}]}}
        ]}}]}}"#
    )
}

#[test]
fn test_sessions_accumulate_into_classification() {
    let index = index_source("app.js", SOURCE)
        .expect("index")
        .into_index()
        .expect("parsable");
    let filter = ScriptFilter::new(vec!["https://".into()]);
    let mut ledger = CoverageLedger::new(CoverageMapper::default(), &index);

    for session in ["s1", "s2", "s3"] {
        let samples = samples_from_v8(&payload(2, 0), session, &filter).expect("samples");
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].file, "app.js");
        ledger.ingest(&index, &samples).expect("ingest");
    }

    let mapping = ledger.into_mapping();
    assert_eq!(mapping.sessions.len(), 3);

    let candidates = DeadCodeClassifier::default()
        .classify(&index, &mapping)
        .expect("classify");
    let verdicts: Vec<_> = candidates
        .iter()
        .map(|c| (c.label.as_str(), c.verdict))
        .collect();
    assert_eq!(verdicts, vec![("used", Verdict::Live), ("unused", Verdict::Dead)]);
    assert_eq!(candidates[0].execution_count, 6);
    assert_eq!(candidates[1].reasons[0], "zero executions across 3 session(s)");
}

#[test]
fn test_any_session_executing_makes_function_live() {
    let index = index_source("app.js", SOURCE)
        .expect("index")
        .into_index()
        .expect("parsable");
    let filter = ScriptFilter::default();
    let mut samples = samples_from_v8(&payload(1, 0), "s1", &filter).expect("samples");
    samples.extend(samples_from_v8(&payload(1, 1), "s2", &filter).expect("samples"));

    let mapping = CoverageMapper::default().map(&index, &samples).expect("map");
    let candidates = DeadCodeClassifier::default()
        .classify(&index, &mapping)
        .expect("classify");
    assert!(candidates.iter().all(|c| c.verdict == Verdict::Live));
}

#[test]
fn test_classify_rejects_stale_mapping() {
    let old = index_source("app.js", SOURCE)
        .expect("index")
        .into_index()
        .expect("parsable");
    let mapping = CoverageMapper::default()
        .map(
            &old,
            &samples_from_v8(&payload(1, 0), "s1", &ScriptFilter::default()).expect("samples"),
        )
        .expect("map");

    let edited = index_source("app.js", "function used(){return 1;} used();")
        .expect("index")
        .into_index()
        .expect("parsable");
    assert!(DeadCodeClassifier::default()
        .classify(&edited, &mapping)
        .is_err());
}
