// Partial evaluation of a template's action nodes against only the
// statically-known context (spec.md §4.1): used to decide a step's `if`
// condition before execution, without waiting on a container to produce
// `outputs`/`previous_step` values. Node-level static/dynamic
// classification is "all-or-nothing": if any operand is a runtime value,
// the whole node is preserved unevaluated.

use crate::ast::{Expr, Literal, Node, PathSegment, Template};
use crate::render;
use serde_json::Value;
use std::panic::{self, AssertUnwindSafe};

/// Context roots considered known at planning time. `outputs`, `step`,
/// `steps` and `previous_step` all depend on a container having already
/// run, so any path rooted there is dynamic.
const STATIC_ROOTS: &[&str] = &["repository", "batch_change"];

/// Rewrite every action node of `template` whose operands are entirely
/// static into a text node, leaving dynamic nodes untouched.
pub fn partial_eval(template: &Template, static_context: &Value) -> Template {
    let nodes = template
        .nodes
        .iter()
        .map(|node| match node {
            Node::Text(_) => node.clone(),
            Node::Action(expr) => {
                if !is_static(expr) {
                    return node.clone();
                }
                match panic::catch_unwind(AssertUnwindSafe(|| render::eval(expr, static_context))) {
                    Ok(Ok(value)) => Node::Text(render::display(&value)),
                    _ => node.clone(),
                }
            }
        })
        .collect();
    Template { nodes }
}

/// Partially evaluate `template` and, if it reduces entirely to text,
/// compare that text against the literal string `"true"` (spec.md §4.1:
/// "If after rewriting the template contains only text, it is 'static' and
/// is compared against `\"true\"`"). Returns `None` when the template still
/// contains unresolved dynamic nodes.
pub fn evaluate_static_bool(template: &Template, static_context: &Value) -> Option<bool> {
    let rewritten = partial_eval(template, static_context);
    rewritten.as_static_text().map(|text| text == "true")
}

fn is_static(expr: &Expr) -> bool {
    match expr {
        Expr::Literal(Literal::Number(_)) => false,
        Expr::Literal(_) => true,
        Expr::Path(segments) => is_static_path(segments),
        Expr::Unary(_, inner) => is_static(inner),
        Expr::Binary(left, _, right) => is_static(left) && is_static(right),
        // `join_if` is variadic; per spec.md §4.1 variadic calls abort
        // static evaluation rather than being partially folded.
        Expr::Call(name, _) if name == "join_if" => false,
        Expr::Call(_, args) => args.iter().all(is_static),
    }
}

fn is_static_path(segments: &[PathSegment]) -> bool {
    match segments.first() {
        Some(PathSegment::Field(root)) => STATIC_ROOTS.contains(&root.as_str()),
        _ => false,
    }
}
