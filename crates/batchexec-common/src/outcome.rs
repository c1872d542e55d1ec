// Task/step outcome kind and severity-ordered merging, grounded on
// `util/task_result_util.rs`'s `TaskResult` enum and `merge_task_results`
// but narrowed to this engine's own taxonomy (spec.md §4.5, §4.6, §7, and
// the "terminal skipped step still counts as completion" decision in
// spec.md's Open Questions).

use serde::{Deserialize, Serialize};

/// Outcome of a single task run (one repository through the full step
/// chain), or of a single step within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TaskOutcome {
    /// Every step ran (or was condition-skipped) and the chain completed.
    Succeeded,
    /// Completed, but at least one step was condition-skipped along the way.
    /// Still a completion (spec.md's terminal-skip Open Question).
    SucceededWithIssues,
    /// A step exited non-zero, timed out, or a resource error occurred.
    Failed,
    /// The root context was cancelled before the task finished.
    Cancelled,
}

impl TaskOutcome {
    /// Worst-first ordering used by [`merge`]: `Cancelled` > `Failed` >
    /// `SucceededWithIssues` > `Succeeded`.
    fn severity(self) -> u8 {
        match self {
            TaskOutcome::Succeeded => 0,
            TaskOutcome::SucceededWithIssues => 1,
            TaskOutcome::Failed => 2,
            TaskOutcome::Cancelled => 3,
        }
    }

    /// Combine an accumulated outcome with a newly observed one, keeping
    /// whichever is worse. Used by the Coordinator to fold per-task
    /// outcomes into a run-level summary (spec.md §4.6, §7 "task errors
    /// aggregate into a single multi-error").
    pub fn merge(current: Option<TaskOutcome>, coming: TaskOutcome) -> TaskOutcome {
        match current {
            None => coming,
            Some(current) => {
                if coming.severity() >= current.severity() {
                    coming
                } else {
                    current
                }
            }
        }
    }

    /// Exit code for a wrapping CLI (spec.md §4.6 "Exit codes ... `0`
    /// success; non-zero on any task error not suppressed by
    /// `skip-errors`"). The specific non-zero value is not contractual.
    pub fn exit_code(self) -> i32 {
        match self {
            TaskOutcome::Succeeded | TaskOutcome::SucceededWithIssues => 0,
            TaskOutcome::Failed => 1,
            TaskOutcome::Cancelled => 2,
        }
    }
}

impl std::fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskOutcome::Succeeded => write!(f, "succeeded"),
            TaskOutcome::SucceededWithIssues => write!(f, "succeeded with issues"),
            TaskOutcome::Failed => write!(f, "failed"),
            TaskOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_with_none_returns_coming() {
        assert_eq!(TaskOutcome::merge(None, TaskOutcome::Succeeded), TaskOutcome::Succeeded);
    }

    #[test]
    fn merge_keeps_worse_result() {
        assert_eq!(
            TaskOutcome::merge(Some(TaskOutcome::Succeeded), TaskOutcome::Failed),
            TaskOutcome::Failed
        );
        assert_eq!(
            TaskOutcome::merge(Some(TaskOutcome::Failed), TaskOutcome::Succeeded),
            TaskOutcome::Failed
        );
    }

    #[test]
    fn merge_keeps_cancelled_over_failed() {
        assert_eq!(
            TaskOutcome::merge(Some(TaskOutcome::Cancelled), TaskOutcome::Failed),
            TaskOutcome::Cancelled
        );
    }

    #[test]
    fn exit_codes_match_spec_contract() {
        assert_eq!(TaskOutcome::Succeeded.exit_code(), 0);
        assert_eq!(TaskOutcome::SucceededWithIssues.exit_code(), 0);
        assert_ne!(TaskOutcome::Failed.exit_code(), 0);
        assert_ne!(TaskOutcome::Cancelled.exit_code(), 0);
    }
}
