//! Static detection of dynamic-reference signals.
//!
//! A single walk gathers the reference facts of a file (call sites, string literals,
//! computed member access, eval text, exports); each function then receives the
//! signals that could let it run without a visible call site.

use crate::indexer::{is_field, node_text, property_name, strip_quotes};
use crate::types::{DynamicSignal, FunctionKind, FunctionRange, UnitKind};
use std::collections::{HashMap, HashSet};
use tree_sitter::Node;

/// Receivers whose computed members resolve to module-scope bindings
const GLOBAL_RECEIVERS: &[&str] = &["window", "globalThis", "self", "global"];

/// Callees that evaluate their string argument as code
const EVAL_CALLEES: &[&str] = &["eval", "Function", "execScript"];

/// Timers that evaluate a string first argument as code
const STRING_TIMERS: &[&str] = &["setTimeout", "setInterval"];

/// Node kinds through which a bare identifier is a use of the binding
const REFERENCE_PARENTS: &[&str] = &[
    "arguments",
    "array",
    "return_statement",
    "spread_element",
    "ternary_expression",
    "binary_expression",
    "parenthesized_expression",
    "await_expression",
    "sequence_expression",
];

#[derive(Debug, Default)]
struct Facts {
    /// Binding name -> number of local uses (calls, callbacks, assignments)
    uses: HashMap<String, usize>,
    string_literals: Vec<(String, usize)>,
    computed_literals: Vec<(String, usize)>,
    global_computed: Vec<usize>,
    receiver_computed: Vec<(String, usize)>,
    this_computed: Vec<usize>,
    eval_texts: Vec<(String, usize)>,
    eval_opaque: Vec<usize>,
    reflect_refs: Vec<(String, usize)>,
    exported_names: HashSet<String>,
    exported_spans: Vec<(usize, usize)>,
    /// `module.exports = { ... }` objects; names inside are exports, not uses
    export_objects: Vec<(usize, usize)>,
    /// `const handlers = { ... }` and `app.handlers = { ... }`
    object_bindings: HashMap<String, Vec<(usize, usize)>>,
    class_bodies: Vec<(usize, usize)>,
    /// `import` or `export` statements make top-level bindings module-local
    es_module: bool,
}

impl Facts {
    fn collect(content: &str, root: Node) -> Self {
        let mut facts = Self::default();
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            facts.visit(node, content);
            let mut cursor = node.walk();
            let children: Vec<_> = node.named_children(&mut cursor).collect();
            stack.extend(children.into_iter().rev());
        }
        facts
    }

    fn visit(&mut self, node: Node, content: &str) {
        match node.kind() {
            "call_expression" => self.visit_call(node, content),
            "new_expression" => {
                if let Some(constructor) = node.child_by_field_name("constructor") {
                    let name = node_text(constructor, content);
                    if EVAL_CALLEES.contains(&name) {
                        self.visit_eval_arguments(node, content, false);
                    } else if constructor.kind() == "identifier" {
                        self.add_use(name);
                    }
                }
            }
            "identifier" => self.visit_identifier(node, content),
            "shorthand_property_identifier" => {
                if !self.in_exported_span(node.start_byte()) {
                    self.add_use(node_text(node, content));
                }
            }
            "string" => self.visit_string(node, content),
            "subscript_expression" => self.visit_subscript(node, content),
            "import_statement" => self.es_module = true,
            "export_statement" => {
                self.es_module = true;
                self.visit_export(node, content);
            }
            "assignment_expression" => self.visit_assignment(node, content),
            "variable_declarator" => {
                if let (Some(name), Some(value)) = (
                    node.child_by_field_name("name"),
                    node.child_by_field_name("value"),
                ) {
                    if value.kind() == "object" {
                        self.bind_object(node_text(name, content), value);
                    }
                }
            }
            "class_body" => self.class_bodies.push((node.start_byte(), node.end_byte())),
            _ => {}
        }
    }

    fn add_use(&mut self, name: &str) {
        if !name.is_empty() {
            *self.uses.entry(name.to_string()).or_insert(0) += 1;
        }
    }

    fn bind_object(&mut self, name: &str, object: Node) {
        self.object_bindings
            .entry(name.to_string())
            .or_default()
            .push((object.start_byte(), object.end_byte()));
    }

    fn in_exported_span(&self, offset: usize) -> bool {
        self.export_objects
            .iter()
            .any(|&(start, end)| start <= offset && offset < end)
    }

    fn visit_call(&mut self, node: Node, content: &str) {
        let Some(callee) = node.child_by_field_name("function") else {
            return;
        };
        match callee.kind() {
            "identifier" => {
                let name = node_text(callee, content);
                if EVAL_CALLEES.contains(&name) {
                    self.visit_eval_arguments(node, content, false);
                } else if STRING_TIMERS.contains(&name) {
                    self.visit_eval_arguments(node, content, true);
                }
            }
            "member_expression" => {
                let object = callee.child_by_field_name("object");
                let property = callee.child_by_field_name("property");
                if let Some(property) = property {
                    self.add_use(node_text(property, content));
                }
                if object.is_some_and(|o| node_text(o, content) == "Reflect") {
                    self.visit_reflect_arguments(node, content);
                }
            }
            _ => {}
        }
    }

    fn visit_eval_arguments(&mut self, call: Node, content: &str, first_only: bool) {
        let Some(arguments) = call.child_by_field_name("arguments") else {
            return;
        };
        let mut cursor = arguments.walk();
        let args: Vec<_> = arguments.named_children(&mut cursor).collect();
        let args = if first_only { &args[..args.len().min(1)] } else { &args[..] };
        for arg in args {
            match arg.kind() {
                "string" | "template_string" => self
                    .eval_texts
                    .push((strip_quotes(node_text(*arg, content)).to_string(), arg.start_byte())),
                // a function handed to a timer is a plain callback
                "arrow_function" | "function_expression" | "function" | "identifier" | "member_expression"
                    if first_only => {}
                "comment" => {}
                _ => self.eval_opaque.push(arg.start_byte()),
            }
        }
    }

    fn visit_reflect_arguments(&mut self, call: Node, content: &str) {
        let Some(arguments) = call.child_by_field_name("arguments") else {
            return;
        };
        let mut cursor = arguments.walk();
        for arg in arguments.named_children(&mut cursor) {
            match arg.kind() {
                "identifier" => self
                    .reflect_refs
                    .push((node_text(arg, content).to_string(), arg.start_byte())),
                "string" => self
                    .reflect_refs
                    .push((property_name(arg, content), arg.start_byte())),
                _ => {}
            }
        }
    }

    fn visit_identifier(&mut self, node: Node, content: &str) {
        let Some(parent) = node.parent() else {
            return;
        };
        let is_use = match parent.kind() {
            "call_expression" => is_field(parent, "function", node),
            "assignment_expression" => is_field(parent, "right", node),
            "variable_declarator" => is_field(parent, "value", node),
            "pair" => is_field(parent, "value", node),
            "member_expression" => is_field(parent, "object", node),
            kind => REFERENCE_PARENTS.contains(&kind),
        };
        if is_use && !self.in_exported_span(node.start_byte()) {
            self.add_use(node_text(node, content));
        }
    }

    fn visit_string(&mut self, node: Node, content: &str) {
        let Some(parent) = node.parent() else {
            return;
        };
        let skip = match parent.kind() {
            "import_statement" | "export_statement" => true,
            "pair" => is_field(parent, "key", node),
            "subscript_expression" => is_field(parent, "index", node),
            "arguments" => parent
                .parent()
                .and_then(|call| call.child_by_field_name("function"))
                .is_some_and(|callee| {
                    matches!(
                        node_text(callee, content),
                        "require" | "import" | "Reflect.get" | "Reflect.apply" | "Reflect.has"
                    ) || EVAL_CALLEES.contains(&node_text(callee, content))
                        || STRING_TIMERS.contains(&node_text(callee, content))
                }),
            _ => false,
        };
        if !skip {
            self.string_literals
                .push((property_name(node, content), node.start_byte()));
        }
    }

    fn visit_subscript(&mut self, node: Node, content: &str) {
        let (Some(object), Some(index)) = (
            node.child_by_field_name("object"),
            node.child_by_field_name("index"),
        ) else {
            return;
        };
        let offset = node.start_byte();
        match index.kind() {
            "string" => self
                .computed_literals
                .push((property_name(index, content), offset)),
            "number" => {}
            _ => match object.kind() {
                "this" => self.this_computed.push(offset),
                "identifier" if GLOBAL_RECEIVERS.contains(&node_text(object, content)) => {
                    self.global_computed.push(offset);
                }
                "identifier" => self
                    .receiver_computed
                    .push((node_text(object, content).to_string(), offset)),
                "member_expression" => {
                    if let Some(property) = object.child_by_field_name("property") {
                        self.receiver_computed
                            .push((node_text(property, content).to_string(), offset));
                    }
                }
                _ => {}
            },
        }
    }

    fn visit_export(&mut self, node: Node, content: &str) {
        if let Some(declaration) = node.child_by_field_name("declaration") {
            self.exported_spans
                .push((declaration.start_byte(), declaration.end_byte()));
            return;
        }
        if let Some(value) = node.child_by_field_name("value") {
            if value.kind() == "identifier" {
                self.exported_names
                    .insert(node_text(value, content).to_string());
            } else {
                self.exported_spans.push((value.start_byte(), value.end_byte()));
            }
            return;
        }
        let mut cursor = node.walk();
        for child in node.named_children(&mut cursor) {
            if child.kind() != "export_clause" {
                continue;
            }
            let mut clause_cursor = child.walk();
            for specifier in child.named_children(&mut clause_cursor) {
                if let Some(name) = specifier.child_by_field_name("name") {
                    self.exported_names
                        .insert(node_text(name, content).to_string());
                }
            }
        }
    }

    /// CommonJS exports and object bindings through assignment
    fn visit_assignment(&mut self, node: Node, content: &str) {
        let (Some(left), Some(right)) = (
            node.child_by_field_name("left"),
            node.child_by_field_name("right"),
        ) else {
            return;
        };
        let target = node_text(left, content);
        let is_export = target == "module.exports"
            || target.starts_with("module.exports.")
            || target.starts_with("exports.");

        if right.kind() == "object" {
            if let Some(property) = left.child_by_field_name("property") {
                self.bind_object(node_text(property, content), right);
            }
        }
        if !is_export {
            return;
        }
        match right.kind() {
            "identifier" => {
                self.exported_names
                    .insert(node_text(right, content).to_string());
            }
            "object" => {
                self.exported_spans.push((right.start_byte(), right.end_byte()));
                self.export_objects.push((right.start_byte(), right.end_byte()));
                let mut cursor = right.walk();
                for member in right.named_children(&mut cursor) {
                    let value = match member.kind() {
                        "shorthand_property_identifier" => Some(member),
                        "pair" => member
                            .child_by_field_name("value")
                            .filter(|v| v.kind() == "identifier"),
                        _ => None,
                    };
                    if let Some(value) = value {
                        self.exported_names
                            .insert(node_text(value, content).to_string());
                    }
                }
            }
            _ => self.exported_spans.push((right.start_byte(), right.end_byte())),
        }
    }

    fn enclosing_class_body(&self, offset: usize) -> Option<(usize, usize)> {
        self.class_bodies
            .iter()
            .filter(|&&(start, end)| start <= offset && offset < end)
            .min_by_key(|&&(start, end)| end - start)
            .copied()
    }
}

/// Names bound at module scope: declarations and single-declarator statements
fn is_module_binding(function: &FunctionRange) -> bool {
    if function.parent.is_some() {
        return false;
    }
    match function.removal {
        Some(unit) => unit.kind == UnitKind::Statement,
        None => function.kind == FunctionKind::Declaration,
    }
}

/// Top-level names a global-object lookup can reach in a classic script: function
/// declarations, `var` bindings, implicit globals and `window.name = ...`
fn is_global_binding(function: &FunctionRange, content: &str, es_module: bool) -> bool {
    if es_module || !is_module_binding(function) {
        return false;
    }
    if function.kind == FunctionKind::Declaration {
        return true;
    }
    let Some(text) = function
        .removal
        .and_then(|unit| content.get(unit.start..unit.end))
    else {
        return false;
    };
    let text = text.trim_start();
    if text.starts_with("var ") {
        return true;
    }
    let target = text.split('=').next().unwrap_or_default().trim();
    let target = GLOBAL_RECEIVERS
        .iter()
        .find_map(|receiver| target.strip_prefix(receiver)?.strip_prefix('.'))
        .unwrap_or(target);
    !target.is_empty()
        && target
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '$')
}

fn within(function: &FunctionRange, (start, end): (usize, usize)) -> bool {
    start <= function.start_offset && function.end_offset <= end
}

/// Whole-word occurrence of an identifier inside evaluated text
fn mentions_identifier(text: &str, name: &str) -> bool {
    let is_ident = |c: char| c.is_alphanumeric() || c == '_' || c == '$';
    text.match_indices(name).any(|(idx, _)| {
        let before = text[..idx].chars().next_back();
        let after = text[idx + name.len()..].chars().next();
        !before.is_some_and(is_ident) && !after.is_some_and(is_ident)
    })
}

fn first_offset<'a>(
    entries: impl IntoIterator<Item = &'a (String, usize)>,
    name: &str,
) -> Option<usize> {
    entries
        .into_iter()
        .find(|(text, _)| text == name)
        .map(|&(_, offset)| offset)
}

pub(crate) fn attach_signals(content: &str, root: Node, functions: &mut [FunctionRange]) {
    let facts = Facts::collect(content, root);

    for function in functions.iter_mut() {
        let mut signals = Vec::new();
        let module_binding = is_module_binding(function);
        let global_binding = is_global_binding(function, content, facts.es_module);
        let member_like = function.kind.is_member()
            || matches!(
                function.removal.map(|unit| unit.kind),
                Some(UnitKind::ObjectMember | UnitKind::ClassMember)
            );

        // computed access: literal key, global receiver, bound object or `this`
        let mut computed = function
            .name
            .as_deref()
            .and_then(|name| first_offset(&facts.computed_literals, name));
        if computed.is_none() && global_binding {
            computed = facts.global_computed.first().copied();
        }
        if computed.is_none() && member_like {
            computed = facts.receiver_computed.iter().find_map(|(receiver, offset)| {
                facts
                    .object_bindings
                    .get(receiver)
                    .is_some_and(|spans| spans.iter().any(|&span| within(function, span)))
                    .then_some(*offset)
            });
        }
        if computed.is_none() {
            computed = facts.this_computed.iter().copied().find(|&offset| {
                match facts.enclosing_class_body(offset) {
                    Some(body) => member_like && within(function, body),
                    None => global_binding,
                }
            });
        }
        if let Some(offset) = computed {
            signals.push(DynamicSignal::ComputedAccess { offset });
        }

        if let Some(name) = function.name.as_deref() {
            let eval = facts
                .eval_texts
                .iter()
                .find(|(text, _)| mentions_identifier(text, name))
                .map(|&(_, offset)| offset)
                .or_else(|| {
                    module_binding
                        .then(|| facts.eval_opaque.first().copied())
                        .flatten()
                });
            if let Some(offset) = eval {
                signals.push(DynamicSignal::EvalText { offset });
            }
            if let Some(offset) = first_offset(&facts.string_literals, name) {
                signals.push(DynamicSignal::StringReference { offset });
            }
            if let Some(offset) = first_offset(&facts.reflect_refs, name) {
                signals.push(DynamicSignal::Reflection { offset });
            }
        } else if module_binding {
            if let Some(&offset) = facts.eval_opaque.first() {
                signals.push(DynamicSignal::EvalText { offset });
            }
        }

        function.exported = function.parent.is_none()
            && (facts
                .exported_spans
                .iter()
                .any(|&span| within(function, span))
                || function
                    .name
                    .as_deref()
                    .is_some_and(|name| facts.exported_names.contains(name)));
        let locally_used = function
            .name
            .as_deref()
            .is_some_and(|name| facts.uses.get(name).copied().unwrap_or(0) > 0);
        if function.exported && !locally_used {
            signals.push(DynamicSignal::ExportedWithoutLocalCalls);
        }

        function.signals = signals;
    }
}
