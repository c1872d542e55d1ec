// Error taxonomy mapping spec.md §7. Each variant is a structured,
// inspectable error type; the Coordinator and binary entry point wrap these
// in `anyhow::Error` at the orchestration boundary, following the teacher's
// anyhow-for-application / thiserror-for-library-errors split.

use std::time::Duration;
use thiserror::Error;

/// Specification errors: malformed templates, unknown output references,
/// duplicate head-refs. Fatal before or after execution; never retried.
#[derive(Debug, Error)]
pub enum SpecificationError {
    #[error("template error in {location}: {message}")]
    Template { location: String, message: String },

    #[error("output '{name}' referenced in template but never produced")]
    UnknownOutput { name: String },

    #[error(
        "duplicate changeset head ref '{head_ref}' on base repository '{base_repo}' (offending tasks: {offenders:?})"
    )]
    DuplicateHeadRef {
        base_repo: String,
        head_ref: String,
        offenders: Vec<String>,
    },

    #[error(
        "transform-changes group branch '{branch}' collides with the default changeset branch"
    )]
    GroupBranchCollidesWithDefault { branch: String },

    #[error("invalid mount for step {step_index}: {message}")]
    Mount { step_index: usize, message: String },
}

/// Resource errors: image pull failed, archive fetch failed, workspace
/// setup failed. Surfaced as task-level errors.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("failed to ensure image '{image}' is present: {message}")]
    ImagePull { image: String, message: String },

    #[error("failed to fetch archive for repository '{repo}': {message}")]
    ArchiveFetch { repo: String, message: String },

    #[error("failed to prepare workspace at '{path}': {message}")]
    WorkspaceSetup { path: String, message: String },

    #[error("diff extraction failed: {0}")]
    DiffExtraction(#[from] DiffExtractionError),
}

/// Step execution errors: non-zero exit, with captured stderr.
///
/// Carries both a one-line summary (for UI/console consumption) and the
/// full payload (for the per-task log).
#[derive(Debug, Error)]
#[error("step {step_index} ({container_image}) failed: {summary}")]
pub struct StepExecutionError {
    pub step_index: usize,
    pub container_image: String,
    pub command: String,
    pub exit_code: Option<i32>,
    pub stderr_tail: String,
    pub tmp_filename: Option<String>,
    pub summary: String,
}

impl StepExecutionError {
    pub fn new(
        step_index: usize,
        container_image: impl Into<String>,
        command: impl Into<String>,
        exit_code: Option<i32>,
        stderr_tail: impl Into<String>,
    ) -> Self {
        let container_image = container_image.into();
        let stderr_tail = stderr_tail.into();
        let summary = match exit_code {
            Some(code) => format!("exit code {code}"),
            None => "terminated by signal".to_string(),
        };
        Self {
            step_index,
            container_image,
            command: command.into(),
            exit_code,
            stderr_tail,
            tmp_filename: None,
            summary,
        }
    }

    /// Full payload suitable for a log file, as opposed to `summary` which is
    /// suitable for a single UI line (spec.md §4.3/§7.3).
    pub fn full_payload(&self) -> String {
        format!(
            "step {} image={} exit_code={:?}\ncommand: {}\nstderr (tail):\n{}",
            self.step_index, self.container_image, self.exit_code, self.command, self.stderr_tail
        )
    }
}

/// Timeout errors: wall-clock exceeded. Distinct from cancellation; carries
/// the configured duration (spec.md §4.3.8, §7.4).
#[derive(Debug, Error)]
#[error("timeout reached after {duration:?}")]
pub struct TimeoutError {
    pub duration: Duration,
}

impl TimeoutError {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

/// Cancellation: the root context was cancelled externally. Propagates
/// unmodified up the call stack (spec.md §7.5).
#[derive(Debug, Error)]
#[error("operation cancelled")]
pub struct CancellationError;

/// Cache corruption: JSON decode failure. Local recovery is to delete the
/// offending file and treat as a miss (spec.md §7.6).
#[derive(Debug, Error)]
#[error("cache entry at '{path}' is corrupt and was discarded: {message}")]
pub struct CacheCorruptionError {
    pub path: String,
    pub message: String,
}

/// Diff extraction errors: empty diff where non-empty was expected, or an
/// apparent truncation (spec.md §4.2, §7.7).
#[derive(Debug, Error)]
pub enum DiffExtractionError {
    #[error("expected a non-empty diff for '{context}' but got none")]
    UnexpectedlyEmpty { context: String },

    #[error("diff output for '{context}' appears truncated: {reason}")]
    Truncated { context: String, reason: String },
}

/// Top-level engine error, aggregating every kind in spec.md §7's taxonomy.
/// The Coordinator collects these per task into a single multi-error.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Specification(#[from] SpecificationError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    StepExecution(#[from] StepExecutionError),
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
    #[error(transparent)]
    Cancellation(#[from] CancellationError),
    #[error(transparent)]
    CacheCorruption(#[from] CacheCorruptionError),
    #[error(transparent)]
    DiffExtraction(#[from] DiffExtractionError),
}

impl EngineError {
    /// One-line summary suitable for UI/console output (spec.md §7
    /// "User-visible: the CLI prints the one-line summaries").
    pub fn summary(&self) -> String {
        match self {
            EngineError::StepExecution(e) => e.summary.clone(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_execution_error_summary() {
        let err = StepExecutionError::new(1, "alpine:3", "exit 1", Some(1), "boom\n");
        assert_eq!(err.summary, "exit code 1");
        assert!(err.full_payload().contains("boom"));
    }

    #[test]
    fn timeout_error_carries_duration() {
        let err = TimeoutError::new(Duration::from_millis(100));
        assert_eq!(format!("{err}"), "timeout reached after 100ms");
    }

    #[test]
    fn engine_error_summary_delegates_to_step_execution() {
        let inner = StepExecutionError::new(0, "img", "cmd", Some(2), "stderr");
        let err: EngineError = inner.into();
        assert_eq!(err.summary(), "exit code 2");
    }
}
