// Task Executor (spec.md §4.5): a bounded worker pool over `tokio::sync::
// Semaphore`, generalized from `runner-listener/src/job_dispatcher.rs`'s
// shape (one cancellation token per unit of work, tracked until it
// completes) from out-of-process job dispatch to in-process bounded
// concurrency.

use crate::cache::{cache_key_for_prefix, ExecutionCache};
use crate::step_runner::{RunningContext, StepRunner};
use async_trait::async_trait;
use batchexec_common::errors::{EngineError, ResourceError};
use batchexec_common::model::{AfterStepResult, Task, TaskResult};
use batchexec_common::{EngineConfig, TaskLogSink, TaskOutcome};
use batchexec_template::context::{BatchChangeContext, RepositoryContext};
use batchexec_workspace::{select_variant, ArchiveRegistry, BindMountWorkspace, NamedVolumeWorkspace, Workspace};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// UI events the executor emits from worker tasks (spec.md §4.5
/// "Implementations must be thread-safe; the executor calls them from
/// worker goroutines"). Every method has a no-op default so implementers
/// only override what they care about, the same shape as
/// `TraceWriter::warning`/`error`'s defaults.
pub trait TaskExecutionUI: Send + Sync {
    fn start(&self, _total_tasks: usize) {}
    fn task_started(&self, _task: &Task) {}
    fn task_currently_executing(&self, _task: &Task, _message: &str) {}
    fn task_finished(&self, _task: &Task, _error: Option<&str>) {}
    fn task_changeset_specs_built(&self, _task: &Task, _spec_count: usize) {}
}

/// Builds the working directory for one task (spec.md §4.5's
/// `workspaceCreator.Create(repo, steps, archive)`). A narrow seam so the
/// executor doesn't need to know about bind-mount/named-volume selection.
#[async_trait]
pub trait WorkspaceCreator: Send + Sync {
    async fn create(&self, task: &Task) -> Result<Box<dyn Workspace>, ResourceError>;
}

/// Default creator: applies spec.md §4.2's selection policy, then unpacks
/// the task's archive into the chosen variant.
pub struct DefaultWorkspaceCreator {
    pub archive_registry: Arc<dyn ArchiveRegistry>,
    pub container_dir: String,
}

#[async_trait]
impl WorkspaceCreator for DefaultWorkspaceCreator {
    async fn create(&self, task: &Task) -> Result<Box<dyn Workspace>, ResourceError> {
        let archive_bytes = self
            .archive_registry
            .fetch(&task.repository.id, &task.repository.commit, task.only_fetch_workspace.then(|| task.path.as_str()))
            .await
            .map_err(|e| ResourceError::ArchiveFetch { repo: task.repository.name.clone(), message: e.to_string() })?;

        let variant = select_variant(batchexec_common::CURRENT_PLATFORM, &task.step_images()).await;
        let mut workspace: Box<dyn Workspace> = match variant {
            batchexec_workspace::WorkspaceVariant::BindMount => Box::new(BindMountWorkspace::new(self.container_dir.clone())?),
            batchexec_workspace::WorkspaceVariant::NamedVolume => {
                let volume_name = format!("batchexec-{}", task.slug());
                Box::new(NamedVolumeWorkspace::new(volume_name, self.container_dir.clone())?)
            }
        };
        workspace.prepare(&archive_bytes, task.only_fetch_workspace).await?;
        Ok(workspace)
    }
}

struct ExecutorInner {
    step_runner: StepRunner,
    cache: Arc<dyn ExecutionCache>,
    workspace_creator: Arc<dyn WorkspaceCreator>,
    config: EngineConfig,
    process_env: HashMap<String, String>,
}

impl ExecutorInner {
    fn fail_fast(&self) -> bool {
        matches!(self.config.failure_policy, batchexec_common::FailurePolicy::FailFast)
    }
}

#[derive(Clone)]
pub struct TaskExecutor {
    inner: Arc<ExecutorInner>,
}

impl TaskExecutor {
    pub fn new(
        step_runner: StepRunner,
        cache: Arc<dyn ExecutionCache>,
        workspace_creator: Arc<dyn WorkspaceCreator>,
        config: EngineConfig,
        process_env: HashMap<String, String>,
    ) -> Self {
        Self { inner: Arc::new(ExecutorInner { step_runner, cache, workspace_creator, config, process_env }) }
    }

    /// Lets the Coordinator resolve a step's env ahead of execution for its
    /// own cache probe (spec.md §4.6's `CheckCache`), without duplicating
    /// the Task Executor's env-resolution state.
    pub fn step_runner(&self) -> &StepRunner {
        &self.inner.step_runner
    }

    pub fn process_env(&self) -> &HashMap<String, String> {
        &self.inner.process_env
    }

    /// Run every task in `tasks` across at most `parallelism` concurrent
    /// workers (spec.md §4.5). Returns the ordered per-task results plus
    /// the first error seen, if any.
    pub async fn run(
        &self,
        tasks: Vec<Task>,
        ui: Arc<dyn TaskExecutionUI>,
        root_cancel: CancellationToken,
    ) -> (Vec<TaskResult>, Option<EngineError>) {
        ui.start(tasks.len());
        let run_cancel = root_cancel.child_token();
        let semaphore = Arc::new(Semaphore::new(self.inner.config.parallelism.max(1)));
        let mut handles = Vec::with_capacity(tasks.len());

        for task in tasks {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            let task_cancel = run_cancel.child_token();
            let fail_fast_trigger = run_cancel.clone();
            let ui = ui.clone();
            let inner = self.inner.clone();
            let fail_fast = self.inner.fail_fast();

            let handle = tokio::spawn(async move {
                let _permit = permit;
                ui.task_started(&task);
                let result = run_single_task(&inner, &task, task_cancel, ui.as_ref()).await;
                match &result {
                    Ok(_) => ui.task_finished(&task, None),
                    Err(e) => {
                        ui.task_finished(&task, Some(&e.summary()));
                        if fail_fast {
                            fail_fast_trigger.cancel();
                        }
                    }
                }
                (task, result)
            });
            handles.push(handle);
        }

        let mut results = Vec::with_capacity(handles.len());
        let mut first_error = None;
        for handle in handles {
            match handle.await {
                Ok((task, Ok(task_result))) => results.push(task_result),
                Ok((task, Err(e))) => {
                    let outcome = match &e {
                        EngineError::Cancellation(_) => TaskOutcome::Cancelled,
                        _ => TaskOutcome::Failed,
                    };
                    results.push(TaskResult { task_slug: task.slug(), step_results: vec![], error_summary: Some(e.summary()), outcome });
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(join_err) => {
                    tracing::error!("task worker panicked: {join_err}");
                }
            }
        }
        (results, first_error)
    }
}

/// Per-task lifecycle inside a worker (spec.md §4.5's pseudocode): acquire
/// a log sink and workspace, seed from any cached step result, run the
/// remaining steps in order, checkpoint each to the cache.
async fn run_single_task(
    inner: &ExecutorInner,
    task: &Task,
    cancel: CancellationToken,
    ui: &dyn TaskExecutionUI,
) -> Result<TaskResult, EngineError> {
    let slug = task.slug();
    let mut log = TaskLogSink::create(&inner.config.logs_dir(), &slug)
        .map_err(|e| EngineError::Resource(ResourceError::WorkspaceSetup { path: slug.clone(), message: e.to_string() }))?;

    let mut workspace = inner.workspace_creator.create(task).await.map_err(EngineError::Resource)?;

    let mut ctx = RunningContext {
        repository: RepositoryContext { name: task.repository.name.clone(), search_result_paths: vec![task.path.clone()] },
        batch_change: BatchChangeContext { name: task.batch_change.name.clone(), description: task.batch_change.description.clone() },
        ..Default::default()
    };

    let mut resolved_envs: Vec<HashMap<String, String>> = Vec::with_capacity(task.steps.len());
    let mut step_results: Vec<AfterStepResult> = Vec::new();
    let mut start_index = 0usize;

    // Walk prefixes forward, from the first step (spec.md §4.4's key
    // depends on "resolved-envs-per-included-step", and a step's resolved
    // env can reference `${{ outputs.* }}`/`${{ previous_step.* }}` from
    // steps before it — so it can only be computed once those steps'
    // effect on the running context is known). Remember the largest prefix
    // that hits; stop probing at the first miss, since a longer prefix's
    // resolved env can't be derived without that miss's step having run.
    for step in &task.steps {
        let resolved_env = inner
            .step_runner
            .resolve_env(step, &ctx, &inner.process_env, &batchexec_sdk::build_constants::EngineVersion::identifier())?;
        resolved_envs.push(resolved_env);

        let key = cache_key_for_prefix(
            &task.repository.id,
            &task.repository.commit,
            &task.path,
            &workspace.container_working_dir(),
            &task.steps[..=step.index],
            &resolved_envs,
        )
        .map_err(|e| EngineError::Resource(ResourceError::WorkspaceSetup { path: slug.clone(), message: e.to_string() }))?;

        match inner.cache.get_step_result(&slug, &key).await {
            Ok(Some(cached)) => {
                workspace.apply_diff(&cached.diff).await.ok();
                ctx.absorb_cached_result(workspace.container_working_dir(), &cached);
                start_index = cached.step_index + 1;
                step_results.push(cached);
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(slug = %slug, key = %key, error = %e, "discarding corrupt cache entry");
                break;
            }
        }
    }

    let error: Option<EngineError> = 'outer: loop {
        for step in task.steps.iter().skip(start_index) {
            if cancel.is_cancelled() {
                break 'outer Some(EngineError::Cancellation(batchexec_common::errors::CancellationError));
            }
            ui.task_currently_executing(task, &format!("running step {}", step.index));

            let result = inner
                .step_runner
                .run_step(
                    step,
                    &task.repository.name,
                    &batchexec_sdk::build_constants::EngineVersion::identifier(),
                    &inner.process_env,
                    workspace.as_mut(),
                    &mut log,
                    &mut ctx,
                    inner.config.default_step_timeout,
                    cancel.clone(),
                    &inner.config.batch_spec_dir,
                    inner.config.remote_execution,
                )
                .await;

            match result {
                Ok(after_step) => {
                    // The probe loop above already resolved this step's env
                    // if it was the one that missed; steps beyond that need
                    // their actually-produced resolved env recorded now.
                    if resolved_envs.len() <= step.index {
                        resolved_envs.push(after_step.resolved_env.clone());
                    }
                    let key = cache_key_for_prefix(
                        &task.repository.id,
                        &task.repository.commit,
                        &task.path,
                        workspace.container_working_dir().as_str(),
                        &task.steps[..=step.index],
                        &resolved_envs[..=step.index],
                    );
                    if let Ok(key) = key {
                        let _ = inner.cache.set_step_result(&slug, &key, &after_step).await;
                    }
                    step_results.push(after_step);
                }
                Err(e) => break 'outer Some(e),
            }
        }
        break None;
    };

    let _ = workspace.close().await;
    log.flush();

    if let Some(e) = error {
        return Err(e);
    }

    let outcome = if step_results.iter().any(|r| r.skipped) {
        TaskOutcome::SucceededWithIssues
    } else {
        TaskOutcome::Succeeded
    };

    Ok(TaskResult { task_slug: slug, step_results, error_summary: None, outcome })
}
