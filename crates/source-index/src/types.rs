use crate::language::Language;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identity of a function range: `file:start:end`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FunctionId(String);

impl FunctionId {
    #[must_use]
    pub fn new(file: &str, start_offset: usize, end_offset: usize) -> Self {
        Self(format!("{file}:{start_offset}:{end_offset}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FunctionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Syntactic shape of a function-like construct
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FunctionKind {
    Declaration,
    Expression,
    Method,
    Getter,
    Setter,
    Arrow,
}

impl FunctionKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Declaration => "declaration",
            Self::Expression => "expression",
            Self::Method => "method",
            Self::Getter => "getter",
            Self::Setter => "setter",
            Self::Arrow => "arrow",
        }
    }

    /// Class/object members are reachable through their receiver
    #[must_use]
    pub const fn is_member(self) -> bool {
        matches!(self, Self::Method | Self::Getter | Self::Setter)
    }
}

/// A way the function may be reached without a statically visible call site.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum DynamicSignal {
    /// `obj[expr]` that may resolve to this function
    ComputedAccess { offset: usize },
    /// Text handed to `eval`, `Function` or a string timer mentions the function
    EvalText { offset: usize },
    /// The function name appears as a plain string literal
    StringReference { offset: usize },
    /// `Reflect.*` receives the function
    Reflection { offset: usize },
    /// Exported across the module boundary with no call site in this file
    ExportedWithoutLocalCalls,
}

impl DynamicSignal {
    #[must_use]
    pub const fn is_export_only(&self) -> bool {
        matches!(self, Self::ExportedWithoutLocalCalls)
    }

    /// Human-auditable description used in classifier reasons
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::ComputedAccess { offset } => {
                format!("computed member access detected at offset {offset}")
            }
            Self::EvalText { offset } => format!("eval/Function text reference at offset {offset}"),
            Self::StringReference { offset } => {
                format!("name referenced as string literal at offset {offset}")
            }
            Self::Reflection { offset } => format!("reflection-style invocation at offset {offset}"),
            Self::ExportedWithoutLocalCalls => {
                "exported from module boundary with no local call sites".to_string()
            }
        }
    }
}

/// How a removal unit sits inside its container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    /// A whole statement in a statement list
    Statement,
    /// A class body member
    ClassMember,
    /// An object literal member, including its separating comma
    ObjectMember,
}

/// Byte span of the smallest syntactic unit that can be deleted to remove a function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovalUnit {
    pub start: usize,
    pub end: usize,
    pub kind: UnitKind,
}

/// A function-like range inside one file revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionRange {
    pub id: FunctionId,

    /// Source file path
    pub file: String,

    /// Byte offset of the first character (inclusive)
    pub start_offset: usize,

    /// Byte offset past the last character (exclusive)
    pub end_offset: usize,

    /// 1-based line of `start_offset`
    pub start_line: usize,

    pub end_line: usize,

    /// Binding name when the source gives one
    pub name: Option<String>,

    /// `name`, or a synthetic lexical path such as `init>0` for anonymous functions
    pub label: String,

    pub kind: FunctionKind,

    /// Enclosing function, `None` at module scope
    pub parent: Option<FunctionId>,

    /// Number of enclosing functions
    pub depth: usize,

    /// Reachable through an export (ESM or CommonJS)
    pub exported: bool,

    /// Deletable unit; `None` when the function is embedded in an expression
    pub removal: Option<RemovalUnit>,

    #[serde(default)]
    pub signals: Vec<DynamicSignal>,
}

impl FunctionRange {
    #[must_use]
    pub fn has_dynamic_reference_signal(&self) -> bool {
        !self.signals.is_empty()
    }

    /// Every signal is an export with no local call site
    #[must_use]
    pub fn is_export_only_signal(&self) -> bool {
        !self.signals.is_empty() && self.signals.iter().all(DynamicSignal::is_export_only)
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.end_offset.saturating_sub(self.start_offset)
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn overlaps(&self, start: usize, end: usize) -> bool {
        start < self.end_offset && self.start_offset < end
    }

    #[must_use]
    pub const fn contains_range(&self, start: usize, end: usize) -> bool {
        self.start_offset <= start && end <= self.end_offset
    }
}

/// Flat, offset-sorted table of every function in one file revision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceIndex {
    pub file: String,

    /// SHA-256 of the indexed text
    pub revision: String,

    pub language: Language,

    pub source_len: usize,

    functions: Vec<FunctionRange>,
}

impl SourceIndex {
    pub(crate) fn new(
        file: String,
        revision: String,
        language: Language,
        source_len: usize,
        mut functions: Vec<FunctionRange>,
    ) -> Self {
        functions.sort_by(|a, b| {
            a.start_offset
                .cmp(&b.start_offset)
                .then(b.end_offset.cmp(&a.end_offset))
        });
        Self {
            file,
            revision,
            language,
            source_len,
            functions,
        }
    }

    /// Functions ordered by start offset, outer before inner on ties
    #[must_use]
    pub fn functions(&self) -> &[FunctionRange] {
        &self.functions
    }

    #[must_use]
    pub fn get(&self, id: &FunctionId) -> Option<&FunctionRange> {
        self.functions.iter().find(|f| &f.id == id)
    }

    #[must_use]
    pub fn find_range(&self, start: usize, end: usize) -> Option<&FunctionRange> {
        let idx = self
            .functions
            .partition_point(|f| f.start_offset < start);
        self.functions[idx..]
            .iter()
            .take_while(|f| f.start_offset == start)
            .find(|f| f.end_offset == end)
    }

    pub fn by_name<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a FunctionRange> + 'a {
        self.functions
            .iter()
            .filter(move |f| f.name.as_deref() == Some(name))
    }

    pub fn children_of<'a>(
        &'a self,
        parent: Option<&'a FunctionId>,
    ) -> impl Iterator<Item = &'a FunctionRange> + 'a {
        self.functions
            .iter()
            .filter(move |f| f.parent.as_ref() == parent)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

/// A file the parser could not make sense of; excluded from analysis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnparsableFile {
    pub file: String,
    pub revision: String,
    pub reason: String,
    pub error_offset: Option<usize>,
}

/// Result of indexing a single file
#[derive(Debug, Clone)]
pub enum IndexOutcome {
    Indexed(SourceIndex),
    Unparsable(UnparsableFile),
}

impl IndexOutcome {
    #[must_use]
    pub fn into_index(self) -> Option<SourceIndex> {
        match self {
            Self::Indexed(index) => Some(index),
            Self::Unparsable(_) => None,
        }
    }

    #[must_use]
    pub fn is_parsable(&self) -> bool {
        matches!(self, Self::Indexed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: usize, end: usize, signals: Vec<DynamicSignal>) -> FunctionRange {
        FunctionRange {
            id: FunctionId::new("a.js", start, end),
            file: "a.js".to_string(),
            start_offset: start,
            end_offset: end,
            start_line: 1,
            end_line: 1,
            name: None,
            label: "<module>>0".to_string(),
            kind: FunctionKind::Arrow,
            parent: None,
            depth: 0,
            exported: false,
            removal: None,
            signals,
        }
    }

    #[test]
    fn test_function_id_format() {
        assert_eq!(FunctionId::new("dist/app.js", 3, 40).as_str(), "dist/app.js:3:40");
    }

    #[test]
    fn test_overlap_is_half_open() {
        let f = range(10, 20, Vec::new());
        assert!(f.overlaps(19, 25));
        assert!(!f.overlaps(20, 25));
        assert!(!f.overlaps(0, 10));
        assert!(f.contains_range(10, 20));
    }

    #[test]
    fn test_export_only_signal() {
        let exported = range(0, 5, vec![DynamicSignal::ExportedWithoutLocalCalls]);
        assert!(exported.is_export_only_signal());

        let mixed = range(
            0,
            5,
            vec![
                DynamicSignal::ExportedWithoutLocalCalls,
                DynamicSignal::StringReference { offset: 9 },
            ],
        );
        assert!(mixed.has_dynamic_reference_signal());
        assert!(!mixed.is_export_only_signal());
        assert!(!range(0, 5, Vec::new()).is_export_only_signal());
    }

    #[test]
    fn test_index_sorted_outer_first() {
        let index = SourceIndex::new(
            "a.js".into(),
            "rev".into(),
            Language::JavaScript,
            100,
            vec![range(10, 20, Vec::new()), range(0, 50, Vec::new()), range(10, 40, Vec::new())],
        );
        let spans: Vec<_> = index
            .functions()
            .iter()
            .map(|f| (f.start_offset, f.end_offset))
            .collect();
        assert_eq!(spans, vec![(0, 50), (10, 40), (10, 20)]);
        assert!(index.find_range(10, 20).is_some());
        assert!(index.find_range(10, 21).is_none());
    }
}
