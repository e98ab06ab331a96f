use crate::error::{Result, SourceIndexError};
use crate::language::Language;
use crate::signals::attach_signals;
use crate::types::{
    FunctionId, FunctionKind, FunctionRange, IndexOutcome, RemovalUnit, SourceIndex, UnitKind,
    UnparsableFile,
};
use sha2::{Digest, Sha256};
use tree_sitter::{Node, Parser};

/// Label of the implicit scope that owns top-level functions
pub const MODULE_SCOPE: &str = "<module>";

/// Node kinds whose children are statements that may be deleted one by one
const STATEMENT_CONTAINERS: &[&str] = &["program", "statement_block", "switch_case", "switch_default"];

/// Builds [`SourceIndex`] tables for one script dialect.
///
/// A parser is not shareable between threads; create one indexer per worker.
pub struct SourceIndexer {
    parser: Parser,
    language: Language,
}

impl SourceIndexer {
    /// Create a new indexer for a language
    pub fn new(language: Language) -> Result<Self> {
        let ts_language = language.tree_sitter_language()?;
        let mut parser = Parser::new();
        parser
            .set_language(&ts_language)
            .map_err(|e| SourceIndexError::tree_sitter(format!("Failed to set language: {e}")))?;

        Ok(Self { parser, language })
    }

    /// Create an indexer for the dialect implied by `path`
    pub fn for_path(path: &str) -> Result<Self> {
        Self::new(Language::from_path(path))
    }

    pub fn language(&self) -> Language {
        self.language
    }

    /// Parse `content` and enumerate every function-like construct in it.
    ///
    /// Syntax errors do not fail the call: they produce [`IndexOutcome::Unparsable`] so the
    /// caller can report the file and keep scanning the rest.
    pub fn index(&mut self, file: &str, content: &str) -> Result<IndexOutcome> {
        let revision = revision_of(content);
        let tree = self
            .parser
            .parse(content, None)
            .ok_or_else(|| SourceIndexError::parse("Failed to parse source code"))?;

        let root = tree.root_node();
        if root.has_error() {
            let error_offset = first_error_offset(root);
            let reason = match error_offset {
                Some(offset) => format!("syntax error at offset {offset}"),
                None => "syntax error".to_string(),
            };
            log::warn!("{file}: unparsable ({reason}); excluded from analysis");
            return Ok(IndexOutcome::Unparsable(UnparsableFile {
                file: file.to_string(),
                revision,
                reason,
                error_offset,
            }));
        }

        let mut functions = collect_functions(file, content, root);
        attach_signals(content, root, &mut functions);

        log::debug!("{file}: indexed {} functions", functions.len());

        Ok(IndexOutcome::Indexed(SourceIndex::new(
            file.to_string(),
            revision,
            self.language,
            content.len(),
            functions,
        )))
    }
}

/// Index a single file, choosing the dialect from its extension
pub fn index_source(file: &str, content: &str) -> Result<IndexOutcome> {
    SourceIndexer::for_path(file)?.index(file, content)
}

/// Content revision used to detect stale indexes and drifted sources
pub fn revision_of(content: &str) -> String {
    format!("{:x}", Sha256::digest(content.as_bytes()))
}

/// Pre-order walk with an explicit stack; minified bundles nest deeper than the call stack allows.
fn collect_functions(file: &str, content: &str, root: Node) -> Vec<FunctionRange> {
    let mut functions: Vec<FunctionRange> = Vec::new();
    let mut child_counts: Vec<usize> = Vec::new();
    let mut module_children = 0usize;
    let mut stack: Vec<(Node, Option<usize>)> = vec![(root, None)];

    while let Some((node, parent)) = stack.pop() {
        let mut scope = parent;

        if let Some(kind) = function_kind(node) {
            let ordinal = match parent {
                Some(idx) => {
                    child_counts[idx] += 1;
                    child_counts[idx] - 1
                }
                None => {
                    module_children += 1;
                    module_children - 1
                }
            };
            let name = binding_name(node, content);
            let label = match (&name, parent) {
                (Some(name), _) => name.clone(),
                (None, Some(idx)) => format!("{}>{ordinal}", functions[idx].label),
                (None, None) => format!("{MODULE_SCOPE}>{ordinal}"),
            };
            let parent_id = parent.map(|idx| functions[idx].id.clone());
            let depth = parent.map_or(0, |idx| functions[idx].depth + 1);
            let (start, end) = (node.start_byte(), node.end_byte());

            functions.push(FunctionRange {
                id: FunctionId::new(file, start, end),
                file: file.to_string(),
                start_offset: start,
                end_offset: end,
                start_line: node.start_position().row + 1,
                end_line: node.end_position().row + 1,
                name,
                label,
                kind,
                parent: parent_id,
                depth,
                exported: false,
                removal: removal_unit(node),
                signals: Vec::new(),
            });
            child_counts.push(0);
            scope = Some(functions.len() - 1);
        }

        let mut cursor = node.walk();
        let children: Vec<_> = node.named_children(&mut cursor).collect();
        for child in children.into_iter().rev() {
            stack.push((child, scope));
        }
    }

    functions
}

fn function_kind(node: Node) -> Option<FunctionKind> {
    if !node.is_named() {
        return None;
    }
    match node.kind() {
        "function_declaration" | "generator_function_declaration" => {
            Some(FunctionKind::Declaration)
        }
        "function_expression" | "function" | "generator_function" => {
            Some(FunctionKind::Expression)
        }
        "arrow_function" => Some(FunctionKind::Arrow),
        "method_definition" => Some(accessor_kind(node)),
        _ => None,
    }
}

/// `get`/`set` keywords precede the name; a method merely *named* `get` has none.
fn accessor_kind(node: Node) -> FunctionKind {
    let name = node.child_by_field_name("name");
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if Some(child) == name {
            break;
        }
        match child.kind() {
            "get" => return FunctionKind::Getter,
            "set" => return FunctionKind::Setter,
            _ => {}
        }
    }
    FunctionKind::Method
}

pub(crate) fn node_text<'a>(node: Node, content: &'a str) -> &'a str {
    content.get(node.byte_range()).unwrap_or("")
}

pub(crate) fn is_field(parent: Node, field: &str, node: Node) -> bool {
    parent.child_by_field_name(field) == Some(node)
}

/// Property keys may be quoted: `{ "save": function () {} }`
pub(crate) fn property_name(node: Node, content: &str) -> String {
    let text = node_text(node, content);
    match node.kind() {
        "string" => strip_quotes(text).to_string(),
        _ => text.to_string(),
    }
}

pub(crate) fn strip_quotes(text: &str) -> &str {
    let trimmed = text
        .strip_prefix(['"', '\'', '`'])
        .unwrap_or(text);
    trimmed.strip_suffix(['"', '\'', '`']).unwrap_or(trimmed)
}

fn binding_name(node: Node, content: &str) -> Option<String> {
    if let Some(name) = node.child_by_field_name("name") {
        return Some(property_name(name, content));
    }

    let parent = node.parent()?;
    match parent.kind() {
        "variable_declarator" if is_field(parent, "value", node) => parent
            .child_by_field_name("name")
            .filter(|name| name.kind() == "identifier")
            .map(|name| node_text(name, content).to_string()),
        "assignment_expression" if is_field(parent, "right", node) => parent
            .child_by_field_name("left")
            .and_then(|left| assignment_target_name(left, content)),
        "pair" if is_field(parent, "value", node) => parent
            .child_by_field_name("key")
            .map(|key| property_name(key, content)),
        "field_definition" | "public_field_definition" => parent
            .child_by_field_name("property")
            .or_else(|| parent.child_by_field_name("name"))
            .map(|key| property_name(key, content)),
        _ => None,
    }
}

fn assignment_target_name(left: Node, content: &str) -> Option<String> {
    match left.kind() {
        "identifier" => Some(node_text(left, content).to_string()),
        "member_expression" => left
            .child_by_field_name("property")
            .map(|prop| node_text(prop, content).to_string()),
        _ => None,
    }
}

fn removal_unit(node: Node) -> Option<RemovalUnit> {
    match node.kind() {
        "function_declaration" | "generator_function_declaration" => statement_unit(node),
        "method_definition" => member_unit(node),
        _ => {
            let parent = node.parent()?;
            match parent.kind() {
                "variable_declarator" if is_field(parent, "value", node) => {
                    let declaration = parent.parent()?;
                    if !matches!(
                        declaration.kind(),
                        "lexical_declaration" | "variable_declaration"
                    ) {
                        return None;
                    }
                    let mut cursor = declaration.walk();
                    let declarators = declaration
                        .named_children(&mut cursor)
                        .filter(|child| child.kind() == "variable_declarator")
                        .count();
                    if declarators != 1 {
                        return None;
                    }
                    statement_unit(declaration)
                }
                "assignment_expression" if is_field(parent, "right", node) => {
                    let statement = parent.parent()?;
                    if statement.kind() != "expression_statement" {
                        return None;
                    }
                    statement_unit(statement)
                }
                "export_statement" => statement_unit(node),
                "pair" if is_field(parent, "value", node) => member_unit(parent),
                "field_definition" | "public_field_definition" => member_unit(parent),
                _ => None,
            }
        }
    }
}

fn statement_unit(statement: Node) -> Option<RemovalUnit> {
    let target = match statement.parent() {
        Some(parent) if parent.kind() == "export_statement" => parent,
        _ => statement,
    };
    let container = target.parent()?;
    if !STATEMENT_CONTAINERS.contains(&container.kind()) {
        return None;
    }
    Some(RemovalUnit {
        start: target.start_byte(),
        end: target.end_byte(),
        kind: UnitKind::Statement,
    })
}

fn member_unit(member: Node) -> Option<RemovalUnit> {
    let container = member.parent()?;
    let (mut start, mut end) = (member.start_byte(), member.end_byte());
    let kind = match container.kind() {
        "class_body" => {
            if let Some(next) = member.next_sibling().filter(|n| n.kind() == ";") {
                end = next.end_byte();
            }
            UnitKind::ClassMember
        }
        "object" => {
            if let Some(next) = member.next_sibling().filter(|n| n.kind() == ",") {
                end = next.end_byte();
            } else if let Some(prev) = member.prev_sibling().filter(|n| n.kind() == ",") {
                start = prev.start_byte();
            }
            UnitKind::ObjectMember
        }
        _ => return None,
    };
    Some(RemovalUnit { start, end, kind })
}

fn first_error_offset(root: Node) -> Option<usize> {
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        if node.is_error() || node.is_missing() {
            return Some(node.start_byte());
        }
        if !node.has_error() {
            continue;
        }
        let mut cursor = node.walk();
        let children: Vec<_> = node.children(&mut cursor).collect();
        stack.extend(children.into_iter().rev());
    }
    None
}
