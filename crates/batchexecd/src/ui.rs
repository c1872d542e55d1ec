// Console `TaskExecutionUI` (spec.md §1: "the core emits events through a
// TaskExecutionUI interface"; UI rendering itself is out of scope). This
// implementation just logs through `tracing`, mirroring how the teacher's
// `TraceWriter` implementations turn lifecycle events into structured log
// lines rather than drawing a TTY progress bar.

use batchexec_common::model::Task;
use batchexec_engine::TaskExecutionUI;

pub struct ConsoleUi;

impl TaskExecutionUI for ConsoleUi {
    fn start(&self, total_tasks: usize) {
        tracing::info!(total_tasks, "starting batch run");
    }

    fn task_started(&self, task: &Task) {
        tracing::info!(task = %task.slug(), "task started");
    }

    fn task_currently_executing(&self, task: &Task, message: &str) {
        tracing::info!(task = %task.slug(), message, "task progress");
    }

    fn task_finished(&self, task: &Task, error: Option<&str>) {
        match error {
            Some(summary) => tracing::warn!(task = %task.slug(), error = summary, "task failed"),
            None => tracing::info!(task = %task.slug(), "task finished"),
        }
    }

    fn task_changeset_specs_built(&self, task: &Task, spec_count: usize) {
        tracing::info!(task = %task.slug(), spec_count, "changeset specs built");
    }
}
