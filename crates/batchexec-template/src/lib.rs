// batchexec-template: the Template Evaluator (spec.md §4.1). Renders
// `${{ ... }}` template strings against a `StepContext` or
// `ChangesetTemplateContext`, and partially evaluates boolean conditions
// ahead of execution when every operand is statically known.

pub mod ast;
pub mod context;
pub mod lexer;
pub mod parser;
pub mod partial;
pub mod render;

pub use ast::{Expr, Node, Template};
pub use context::{ChangesetTemplateContext, StepContext};
pub use parser::{parse_expr_str, parse_template, TemplateError};
pub use partial::{evaluate_static_bool, partial_eval};
pub use render::{render, render_bool, RenderError};
