// batchexec-engine: Step Runner, Execution Cache and Task Executor — the
// three collaborators spec.md §4.3/§4.4/§4.5 place below the Coordinator.
// Depends on `batchexec-template` and `batchexec-workspace`; has no
// knowledge of changeset building or cache-aware task splitting, which
// live one layer up in `batchexec-coordinator`.

pub mod cache;
pub mod container;
pub mod executor;
pub mod step_runner;

pub use cache::{cache_key_for_prefix, DiskCache, ExecutionCache, NoopCache, StreamSink, StreamingCache};
pub use container::{ContainerLauncher, ContainerRunOutcome, ContainerSpec, DockerClient, ImageRegistry};
pub use executor::{DefaultWorkspaceCreator, TaskExecutionUI, TaskExecutor, WorkspaceCreator};
pub use step_runner::{RunningContext, StepRunner};
