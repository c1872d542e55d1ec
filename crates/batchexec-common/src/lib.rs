// batchexec-common: shared infrastructure for the batch change execution
// engine — configuration, error taxonomy, logging, cache-key hashing and
// outcome merging. Depends on `batchexec-sdk`.

pub mod config;
pub mod constants;
pub mod errors;
pub mod hashing;
pub mod logging;
pub mod model;
pub mod outcome;

pub use config::{EngineConfig, FailurePolicy};
pub use constants::{OsPlatform, CURRENT_PLATFORM};
pub use errors::{
    CacheCorruptionError, CancellationError, DiffExtractionError, EngineError, ResourceError,
    SpecificationError, StepExecutionError, TimeoutError,
};
pub use logging::TaskLogSink;
pub use model::{
    AfterStepResult, BatchChangeAttrs, ChangedFiles, ChangesetTemplate, CommitAuthor,
    ImportChangeset, Mount, OutputFormat, OutputSpec, Repository, Step, Task, TaskResult,
    TransformChanges, TransformChangesGroup,
};
pub use outcome::TaskOutcome;
