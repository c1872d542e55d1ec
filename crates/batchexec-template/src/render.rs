// Full rendering: evaluate every action node against a known context
// (spec.md §4.1 "used when the full context is known"). Built-ins
// (`join`, `split`, `replace`, `join_if`, `matches`, `eq`) and path
// resolution are grounded on `expressions/mod.rs`'s `resolve_value` /
// `contains`/`startsWith` built-in set, generalized into proper functions
// operating on typed `Value`s instead of pre-stringified operands.

use crate::ast::{BinOp, Expr, Literal, Node, PathSegment, Template, UnaryOp};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum RenderError {
    #[error("unknown built-in function '{0}'")]
    UnknownFunction(String),
    #[error("'{func}' expects {expected} but got {got} argument(s)")]
    Arity {
        func: String,
        expected: &'static str,
        got: usize,
    },
    #[error("'{func}' expects a {expected} argument at position {position}")]
    WrongType {
        func: String,
        expected: &'static str,
        position: usize,
    },
    #[error("invalid glob pattern '{0}'")]
    BadGlob(String),
}

/// Render every node of `template` to a single string, fully evaluating
/// every action node against `context`.
pub fn render(template: &Template, context: &Value) -> Result<String, RenderError> {
    let mut out = String::new();
    for node in &template.nodes {
        match node {
            Node::Text(t) => out.push_str(t),
            Node::Action(expr) => {
                let value = eval(expr, context)?;
                out.push_str(&display(&value));
            }
        }
    }
    Ok(out)
}

/// Render and interpret the result as a boolean, used for a step's `if`
/// (spec.md §4.1). A single boolean-valued action node is coerced via
/// truthiness; anything else is rendered to text and compared against the
/// literal string `"true"`.
pub fn render_bool(template: &Template, context: &Value) -> Result<bool, RenderError> {
    if let [Node::Action(expr)] = template.nodes.as_slice() {
        let value = eval(expr, context)?;
        return Ok(truthy(&value));
    }
    let rendered = render(template, context)?;
    Ok(rendered == "true")
}

pub fn eval(expr: &Expr, context: &Value) -> Result<Value, RenderError> {
    match expr {
        Expr::Literal(Literal::String(s)) => Ok(Value::String(s.clone())),
        Expr::Literal(Literal::Number(n)) => Ok(serde_json::json!(n)),
        Expr::Literal(Literal::Bool(b)) => Ok(Value::Bool(*b)),
        Expr::Path(segments) => Ok(resolve_path(segments, context)?.unwrap_or(Value::Null)),
        Expr::Unary(UnaryOp::Not, inner) => Ok(Value::Bool(!truthy(&eval(inner, context)?))),
        Expr::Binary(left, op, right) => {
            let l = eval(left, context)?;
            match op {
                BinOp::And => {
                    if !truthy(&l) {
                        return Ok(Value::Bool(false));
                    }
                    Ok(Value::Bool(truthy(&eval(right, context)?)))
                }
                BinOp::Or => {
                    if truthy(&l) {
                        return Ok(Value::Bool(true));
                    }
                    Ok(Value::Bool(truthy(&eval(right, context)?)))
                }
                BinOp::Eq => Ok(Value::Bool(values_equal(&l, &eval(right, context)?))),
                BinOp::Ne => Ok(Value::Bool(!values_equal(&l, &eval(right, context)?))),
            }
        }
        Expr::Call(name, args) => {
            let values: Result<Vec<Value>, RenderError> =
                args.iter().map(|a| eval(a, context)).collect();
            call_builtin(name, &values?)
        }
    }
}

pub fn resolve_path(
    segments: &[PathSegment],
    context: &Value,
) -> Result<Option<Value>, RenderError> {
    let mut current = context.clone();
    for segment in segments {
        let key = match segment {
            PathSegment::Field(name) => name.clone(),
            PathSegment::Index(expr) => display(&eval(expr, context)?),
        };
        match current.get(&key) {
            Some(v) => current = v.clone(),
            None => return Ok(None),
        }
    }
    Ok(Some(current))
}

fn call_builtin(name: &str, args: &[Value]) -> Result<Value, RenderError> {
    match name {
        "join" => {
            if args.len() != 2 {
                return Err(RenderError::Arity { func: "join".into(), expected: "2", got: args.len() });
            }
            let items = as_string_list(&args[0]);
            let sep = display(&args[1]);
            Ok(Value::String(items.join(&sep)))
        }
        "split" => {
            if args.len() != 2 {
                return Err(RenderError::Arity { func: "split".into(), expected: "2", got: args.len() });
            }
            let s = display(&args[0]);
            let sep = display(&args[1]);
            let parts: Vec<Value> = if sep.is_empty() {
                vec![Value::String(s)]
            } else {
                s.split(sep.as_str()).map(|p| Value::String(p.to_string())).collect()
            };
            Ok(Value::Array(parts))
        }
        "replace" => {
            if args.len() != 3 {
                return Err(RenderError::Arity { func: "replace".into(), expected: "3", got: args.len() });
            }
            let s = display(&args[0]);
            let from = display(&args[1]);
            let to = display(&args[2]);
            Ok(Value::String(s.replace(from.as_str(), &to)))
        }
        "join_if" => {
            if args.len() < 2 {
                return Err(RenderError::Arity { func: "join_if".into(), expected: "2+", got: args.len() });
            }
            let sep = display(&args[0]);
            let joined: Vec<String> = args[1..]
                .iter()
                .map(display)
                .filter(|s| !s.is_empty())
                .collect();
            Ok(Value::String(joined.join(&sep)))
        }
        "matches" => {
            if args.len() != 2 {
                return Err(RenderError::Arity { func: "matches".into(), expected: "2", got: args.len() });
            }
            let s = display(&args[0]);
            let pattern_str = display(&args[1]);
            let pattern = glob::Pattern::new(&pattern_str)
                .map_err(|_| RenderError::BadGlob(pattern_str.clone()))?;
            Ok(Value::Bool(pattern.matches(&s)))
        }
        "eq" => {
            if args.len() != 2 {
                return Err(RenderError::Arity { func: "eq".into(), expected: "2", got: args.len() });
            }
            Ok(Value::Bool(values_equal(&args[0], &args[1])))
        }
        other => Err(RenderError::UnknownFunction(other.to_string())),
    }
}

fn as_string_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().map(display).collect(),
        other => vec![display(other)],
    }
}

pub fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        Value::Array(items) => items.iter().map(display).collect::<Vec<_>>().join(","),
        Value::Object(_) => value.to_string(),
    }
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty() && s != "false" && s != "0",
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    if std::mem::discriminant(a) == std::mem::discriminant(b) {
        a == b
    } else {
        display(a) == display(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_template;
    use serde_json::json;

    #[test]
    fn renders_plain_text() {
        let t = parse_template("hello").unwrap();
        assert_eq!(render(&t, &json!({})).unwrap(), "hello");
    }

    #[test]
    fn renders_path_accessor() {
        let t = parse_template("repo: ${{ repository.name }}").unwrap();
        let ctx = json!({"repository": {"name": "acme"}});
        assert_eq!(render(&t, &ctx).unwrap(), "repo: acme");
    }

    #[test]
    fn renders_join_builtin() {
        let t = parse_template("${{ join(steps.path, ', ') }}").unwrap();
        let ctx = json!({"steps": {"path": ["a", "b", "c"]}});
        assert_eq!(render(&t, &ctx).unwrap(), "a, b, c");
    }

    #[test]
    fn renders_join_if_drops_empty() {
        let t = parse_template("${{ join_if('-', outputs.a, outputs.b, outputs.c) }}").unwrap();
        let ctx = json!({"outputs": {"a": "x", "b": "", "c": "z"}});
        assert_eq!(render(&t, &ctx).unwrap(), "x-z");
    }

    #[test]
    fn renders_matches_builtin() {
        let t = parse_template("${{ matches(repository.name, 'acme-*') }}").unwrap();
        let ctx = json!({"repository": {"name": "acme-widgets"}});
        assert_eq!(render(&t, &ctx).unwrap(), "true");
    }

    #[test]
    fn missing_path_resolves_to_empty() {
        let t = parse_template("${{ outputs.missing }}").unwrap();
        assert_eq!(render(&t, &json!({})).unwrap(), "");
    }

    #[test]
    fn render_bool_evaluates_condition() {
        let t = parse_template("${{ repository.name == 'acme' }}").unwrap();
        assert!(render_bool(&t, &json!({"repository": {"name": "acme"}})).unwrap());
        assert!(!render_bool(&t, &json!({"repository": {"name": "other"}})).unwrap());
    }

    #[test]
    fn render_bool_handles_negation_and_and() {
        let t = parse_template("${{ !outputs.skip && outputs.ready }}").unwrap();
        let ctx = json!({"outputs": {"skip": false, "ready": true}});
        assert!(render_bool(&t, &ctx).unwrap());
    }
}
