// Context model for template rendering, grounded on spec.md §4.1's
// `StepContext { batch-change, outputs, previous-step, step-result, steps,
// repository }` / `ChangesetTemplateContext` (which omits per-step fields),
// and on the context-accessor surface of `expressions/mod.rs`
// (`resolve_value`, dotted/bracket paths) — rebuilt here over a typed
// struct rather than an ad-hoc `serde_json::Value` tree.

use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Default, Serialize)]
pub struct RepositoryContext {
    pub name: String,
    pub search_result_paths: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchChangeContext {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PreviousStepContext {
    pub modified_files: Vec<String>,
    pub added_files: Vec<String>,
    pub deleted_files: Vec<String>,
    pub renamed_files: Vec<String>,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StepSummary {
    pub path: String,
    pub modified_files: Vec<String>,
    pub added_files: Vec<String>,
    pub deleted_files: Vec<String>,
    pub renamed_files: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StepResultContext {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

/// Context available while rendering a step's `run`/`if`/`outputs`
/// templates (spec.md §4.1).
#[derive(Debug, Clone, Default, Serialize)]
pub struct StepContext {
    pub batch_change: BatchChangeContext,
    pub outputs: serde_json::Map<String, Value>,
    pub previous_step: Option<PreviousStepContext>,
    pub step: Option<StepResultContext>,
    pub steps: Vec<StepSummary>,
    pub repository: RepositoryContext,
}

impl StepContext {
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Context available while rendering a changeset's title/body/branch/commit
/// templates — the same shape minus the current (not-yet-existing) step
/// (spec.md §4.1: "which omits per-step fields").
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChangesetTemplateContext {
    pub batch_change: BatchChangeContext,
    pub outputs: serde_json::Map<String, Value>,
    pub previous_step: Option<PreviousStepContext>,
    pub steps: Vec<StepSummary>,
    pub repository: RepositoryContext,
}

impl ChangesetTemplateContext {
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
