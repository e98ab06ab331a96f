use crate::coverage::CoverageMapping;
use crate::error::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use reaper_source_index::{DynamicSignal, FunctionId, FunctionRange, SourceIndex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Event handlers and lifecycle hooks: the paths an exploration most often misses
static HANDLER_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(on[A-Z]|handle[A-Z]|_on[A-Z]|init|setup|destroy|cleanup|componentDid|componentWill|use[A-Z])|(Listener|Callback)$",
    )
    .expect("handler name pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Dead,
    Live,
    Uncertain,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dead => "dead",
            Self::Live => "live",
            Self::Uncertain => "uncertain",
        }
    }
}

/// Classification of one function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadCodeCandidate {
    pub function_range_id: FunctionId,
    pub file: String,

    /// Revision of the file the candidate was computed against
    pub revision: String,

    pub label: String,
    pub verdict: Verdict,

    /// In `[0, 1]`; always `0.0` for live functions
    pub risk_score: f64,

    /// Every contributing signal, in the order it was considered
    pub reasons: Vec<String>,

    pub byte_size: usize,
    pub line_start: usize,
    pub line_end: usize,
    pub execution_count: u64,
}

impl DeadCodeCandidate {
    pub fn is_dead(&self) -> bool {
        self.verdict == Verdict::Dead
    }
}

/// Weights of the deterministic risk score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskWeights {
    /// Floor for any non-live function
    pub base: f64,
    /// Size at which the size contribution saturates
    pub size_ceiling_bytes: usize,
    pub size_weight: f64,
    pub handler_name_weight: f64,
    pub public_name_weight: f64,
    /// Added per uncertain sibling in the same lexical scope
    pub uncertain_neighbor_weight: f64,
    pub uncertain_neighbor_cap: f64,
    /// Added on top for uncertain functions
    pub uncertain_penalty: f64,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            base: 0.1,
            size_ceiling_bytes: 4000,
            size_weight: 0.2,
            handler_name_weight: 0.25,
            public_name_weight: 0.1,
            uncertain_neighbor_weight: 0.15,
            uncertain_neighbor_cap: 0.3,
            uncertain_penalty: 0.4,
        }
    }
}

/// Turns execution verdicts and static signals into [`DeadCodeCandidate`]s
#[derive(Debug, Clone, Default)]
pub struct DeadCodeClassifier {
    weights: RiskWeights,
}

impl DeadCodeClassifier {
    pub fn new(weights: RiskWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &RiskWeights {
        &self.weights
    }

    /// One candidate per indexed function, in index order.
    ///
    /// Fails when `mapping` was computed against another revision of the file.
    pub fn classify(
        &self,
        index: &SourceIndex,
        mapping: &CoverageMapping,
    ) -> Result<Vec<DeadCodeCandidate>> {
        mapping.ensure_matches(index)?;

        let functions = index.functions();
        let verdicts: Vec<Verdict> = functions
            .iter()
            .map(|f| {
                let executed = mapping.verdict(&f.id).is_some_and(|v| v.executed);
                verdict_for(f, executed)
            })
            .collect();

        let mut uncertain_by_scope: HashMap<Option<&FunctionId>, usize> = HashMap::new();
        for (function, verdict) in functions.iter().zip(&verdicts) {
            if *verdict == Verdict::Uncertain {
                *uncertain_by_scope.entry(function.parent.as_ref()).or_default() += 1;
            }
        }

        let sessions = mapping.sessions.len();
        let script_pct = mapping.script_coverage_pct(index);

        let candidates = functions
            .iter()
            .zip(verdicts)
            .map(|(function, verdict)| {
                let execution = mapping.verdict(&function.id).cloned().unwrap_or_default();
                let mut reasons = Vec::new();

                let risk_score = match verdict {
                    Verdict::Live => {
                        reasons.push(format!(
                            "executed {} time(s) in {} of {} session(s)",
                            execution.total_call_count,
                            execution.sessions_covering.len(),
                            sessions
                        ));
                        0.0
                    }
                    Verdict::Dead | Verdict::Uncertain => {
                        reasons.push(format!("zero executions across {sessions} session(s)"));
                        if verdict == Verdict::Uncertain {
                            reasons.extend(function.signals.iter().map(DynamicSignal::describe));
                        }

                        let scope_uncertain = uncertain_by_scope
                            .get(&function.parent.as_ref())
                            .copied()
                            .unwrap_or(0);
                        let siblings = if verdict == Verdict::Uncertain {
                            scope_uncertain.saturating_sub(1)
                        } else {
                            scope_uncertain
                        };

                        let mut score = self.structural_risk(function, siblings, &mut reasons);
                        if verdict == Verdict::Uncertain {
                            score += self.weights.uncertain_penalty;
                        }
                        reasons.push(format!("script coverage: {script_pct:.1}%"));
                        round_score(score)
                    }
                };

                DeadCodeCandidate {
                    function_range_id: function.id.clone(),
                    file: function.file.clone(),
                    revision: index.revision.clone(),
                    label: function.label.clone(),
                    verdict,
                    risk_score,
                    reasons,
                    byte_size: function.len(),
                    line_start: function.start_line,
                    line_end: function.end_line,
                    execution_count: execution.total_call_count,
                }
            })
            .collect();

        Ok(candidates)
    }

    fn structural_risk(
        &self,
        function: &FunctionRange,
        uncertain_siblings: usize,
        reasons: &mut Vec<String>,
    ) -> f64 {
        let weights = &self.weights;
        let mut score = weights.base;

        let ceiling = weights.size_ceiling_bytes.max(1) as f64;
        let size_ratio = (function.len() as f64 / ceiling).min(1.0);
        score += weights.size_weight * size_ratio;
        reasons.push(format!("size: {} bytes", function.len()));

        if let Some(name) = function.name.as_deref() {
            if is_handler_name(name) {
                score += weights.handler_name_weight;
                reasons.push(format!("`{name}` follows handler/lifecycle naming"));
            }
            if function.exported || (function.depth == 0 && !name.starts_with('_')) {
                score += weights.public_name_weight;
                reasons.push(format!("`{name}` is public API by naming or export"));
            }
        }

        if uncertain_siblings > 0 {
            let coupling = (weights.uncertain_neighbor_weight * uncertain_siblings as f64)
                .min(weights.uncertain_neighbor_cap);
            score += coupling;
            reasons.push(format!(
                "{uncertain_siblings} uncertain function(s) share the enclosing scope"
            ));
        }

        score
    }
}

/// Dynamic-reference signals force `uncertain` even when nothing executed
fn verdict_for(function: &FunctionRange, executed: bool) -> Verdict {
    if executed {
        Verdict::Live
    } else if function.has_dynamic_reference_signal() {
        Verdict::Uncertain
    } else {
        Verdict::Dead
    }
}

pub fn is_handler_name(name: &str) -> bool {
    HANDLER_NAME.is_match(name)
}

fn round_score(score: f64) -> f64 {
    (score.clamp(0.0, 1.0) * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::{CoverageMapper, CoverageRange, CoverageSample};
    use pretty_assertions::assert_eq;
    use reaper_source_index::index_source;

    const SCENARIO: &str = "function used(){return 1;} function unused(){return 2;} used();";

    fn classify(code: &str, ranges: &[(usize, usize, u64)]) -> Vec<DeadCodeCandidate> {
        let index = index_source("app.js", code)
            .expect("index")
            .into_index()
            .expect("parsable");
        let sample = CoverageSample {
            session_id: "s1".into(),
            file: "app.js".into(),
            ranges: ranges
                .iter()
                .map(|&(start_offset, end_offset, count)| CoverageRange {
                    start_offset,
                    end_offset,
                    count,
                })
                .collect(),
        };
        let mapping = CoverageMapper::default().map(&index, &[sample]).expect("map");
        DeadCodeClassifier::default()
            .classify(&index, &mapping)
            .expect("classify")
    }

    fn find<'a>(candidates: &'a [DeadCodeCandidate], label: &str) -> &'a DeadCodeCandidate {
        candidates
            .iter()
            .find(|c| c.label == label)
            .expect("candidate")
    }

    #[test]
    fn test_scenario_used_live_unused_dead() {
        let candidates = classify(SCENARIO, &[(0, 63, 1), (0, 26, 1), (27, 55, 0)]);

        let used = find(&candidates, "used");
        assert_eq!(used.verdict, Verdict::Live);
        assert_eq!(used.risk_score, 0.0);
        assert_eq!(used.execution_count, 1);

        let unused = find(&candidates, "unused");
        assert_eq!(unused.verdict, Verdict::Dead);
        assert!(unused.risk_score >= 0.1 && unused.risk_score <= 0.3);
        assert_eq!(unused.reasons[0], "zero executions across 1 session(s)");
        assert_eq!(unused.reasons.last().map(String::as_str), Some("script coverage: 48.1%"));
        assert_eq!(unused.line_start, 1);
        assert_eq!(unused.byte_size, 28);
    }

    #[test]
    fn test_dynamic_signal_forces_uncertain_even_when_unexecuted() {
        let code = "function hidden(){}\nconst name = 'hidden';\nwindow[name]();";
        let candidates = classify(code, &[]);
        let hidden = find(&candidates, "hidden");
        assert_eq!(hidden.verdict, Verdict::Uncertain);
        assert!(hidden.reasons.iter().any(|r| r.contains("string literal")));
        assert!(hidden.risk_score >= 0.5);
    }

    #[test]
    fn test_executed_with_signal_is_live() {
        let code = "function hidden(){}\nwindow['hidden']();";
        let candidates = classify(code, &[(0, 19, 1)]);
        assert_eq!(find(&candidates, "hidden").verdict, Verdict::Live);
    }

    #[test]
    fn test_handler_naming_raises_risk() {
        let plain = classify("function _render(){return 1;}", &[]);
        let handler = classify("function _onClick(){return 1;}", &[]);
        let plain = find(&plain, "_render");
        let handler = find(&handler, "_onClick");
        assert_eq!(plain.verdict, Verdict::Dead);
        let weight = RiskWeights::default().handler_name_weight;
        assert!((handler.risk_score - plain.risk_score - weight).abs() < 0.002);
        assert!(handler.reasons.iter().any(|r| r.contains("handler/lifecycle")));
        assert!(!plain.reasons.iter().any(|r| r.contains("handler/lifecycle")));
    }

    #[test]
    fn test_uncertain_neighbours_raise_risk() {
        let code = "function box(){ function a(){} function b(){} function c(){} run('a'); run('b'); }";
        let candidates = classify(code, &[]);
        let a = find(&candidates, "a");
        let c = find(&candidates, "c");
        assert_eq!(find(&candidates, "box").verdict, Verdict::Dead);
        assert_eq!(a.verdict, Verdict::Uncertain);
        assert_eq!(c.verdict, Verdict::Dead);
        assert!(a
            .reasons
            .iter()
            .any(|r| r == "1 uncertain function(s) share the enclosing scope"));
        assert!(c
            .reasons
            .iter()
            .any(|r| r == "2 uncertain function(s) share the enclosing scope"));
        assert!(c.risk_score >= 0.4);
    }

    #[test]
    fn test_size_raises_risk_and_scores_are_bounded() {
        let body = "x++;".repeat(2000);
        let code = format!("function small(){{}}\nfunction large(){{ {body} }}");
        let candidates = classify(&code, &[]);
        let small = find(&candidates, "small");
        let large = find(&candidates, "large");
        assert!(large.risk_score > small.risk_score);
        assert!(candidates
            .iter()
            .all(|c| (0.0..=1.0).contains(&c.risk_score)));
    }

    #[test]
    fn test_deterministic() {
        let code = "function a(){}\nfunction onLoad(){}\nexport function b(){}";
        assert_eq!(classify(code, &[]), classify(code, &[]));
    }

    #[test]
    fn test_handler_patterns() {
        for name in ["onClick", "handleSubmit", "_onResize", "keyListener", "doneCallback", "initApp", "useStore"] {
            assert!(is_handler_name(name), "{name}");
        }
        for name in ["online", "render", "user", "handler"] {
            assert!(!is_handler_name(name), "{name}");
        }
    }
}
