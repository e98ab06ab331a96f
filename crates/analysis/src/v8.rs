//! Ingestion of `Profiler.takePreciseCoverage` payloads.

use crate::coverage::{CoverageRange, CoverageSample};
use crate::error::{AnalysisError, Result};
use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Payload {
    Wrapped { result: Vec<ScriptCoverage> },
    Bare(Vec<ScriptCoverage>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptCoverage {
    #[serde(default)]
    pub script_id: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub functions: Vec<FunctionCoverage>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionCoverage {
    #[serde(default)]
    pub function_name: String,
    #[serde(default)]
    pub is_block_coverage: bool,
    #[serde(default)]
    pub ranges: Vec<V8Range>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct V8Range {
    pub start_offset: usize,
    pub end_offset: usize,
    pub count: u64,
}

/// Decides which script URLs are analysed
#[derive(Debug, Clone, Default)]
pub struct ScriptFilter {
    include_prefixes: Vec<String>,
}

impl ScriptFilter {
    /// Plain paths are always accepted; an empty prefix list accepts every non-inline URL
    pub fn new(include_prefixes: Vec<String>) -> Self {
        Self { include_prefixes }
    }

    pub fn accepts(&self, url: &str) -> bool {
        if url.is_empty() || url.starts_with("data:") {
            return false;
        }
        if !url.contains(':') {
            return true;
        }
        self.include_prefixes.is_empty()
            || self
                .include_prefixes
                .iter()
                .any(|prefix| url.starts_with(prefix.as_str()))
    }
}

/// Project-relative path a script URL refers to.
///
/// `chrome-extension://<id>/js/app.js` and `https://host/js/app.js` both give
/// `js/app.js`; `file:///abs/app.js` gives `/abs/app.js`; plain paths are kept.
pub fn script_path(url: &str) -> String {
    let url = url.split(['?', '#']).next().unwrap_or(url);
    if let Some(path) = url.strip_prefix("file://") {
        return path.to_string();
    }
    match url.split_once("://") {
        Some((_, rest)) => rest
            .split_once('/')
            .map(|(_, path)| path.to_string())
            .unwrap_or_default(),
        None => url.to_string(),
    }
}

/// Parse a precise-coverage payload, with or without the `result` wrapper
pub fn parse_precise_coverage(json: &str) -> Result<Vec<ScriptCoverage>> {
    let payload: Payload = serde_json::from_str(json)
        .map_err(|e| AnalysisError::coverage(format!("not a precise-coverage payload: {e}")))?;
    Ok(match payload {
        Payload::Wrapped { result } => result,
        Payload::Bare(scripts) => scripts,
    })
}

/// One sample per accepted script path, every function's ranges flattened in order.
///
/// Scripts that resolve to the same path (reloads, duplicate script ids) share a sample.
pub fn samples_from_v8(
    json: &str,
    session_id: &str,
    filter: &ScriptFilter,
) -> Result<Vec<CoverageSample>> {
    let mut by_file: BTreeMap<String, Vec<CoverageRange>> = BTreeMap::new();

    for script in parse_precise_coverage(json)? {
        if !filter.accepts(&script.url) {
            log::debug!("skipping script {:?} ({})", script.url, script.script_id);
            continue;
        }
        let file = script_path(&script.url);
        if file.is_empty() {
            log::debug!("script {} has no path component", script.url);
            continue;
        }

        let ranges = by_file.entry(file).or_default();
        for function in &script.functions {
            ranges.extend(function.ranges.iter().map(|r| CoverageRange {
                start_offset: r.start_offset,
                end_offset: r.end_offset,
                count: r.count,
            }));
        }
    }

    Ok(by_file
        .into_iter()
        .map(|(file, ranges)| CoverageSample {
            session_id: session_id.to_string(),
            file,
            ranges,
        })
        .collect())
}
