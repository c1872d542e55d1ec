// Coordinator (spec.md §4.6, C6): cache-aware task splitting ahead of
// execution, driving the Task Executor, and assembling the final
// ChangesetSpec list. Grounded on `runner-listener/src/job_dispatcher.rs`'s
// shape of a long-lived orchestrator holding shared, mutex-guarded state
// across many in-flight units of work — generalized here from a
// `HashMap<Uuid, WorkerDispatchInfo>` of live processes to a pair of
// mutexes serializing cache reads/writes and changeset-spec assembly
// (spec.md §5: "a single cache mutex ... a second mutex guards
// changeset-spec building").

use crate::changeset::{self, ChangesetSpec};
use batchexec_common::errors::EngineError;
use batchexec_common::model::{ImportChangeset, Task};
use batchexec_common::TaskOutcome;
use batchexec_engine::{cache_key_for_prefix, ExecutionCache, RunningContext, TaskExecutionUI, TaskExecutor};
use batchexec_template::context::{BatchChangeContext, RepositoryContext};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub struct Coordinator {
    cache: Arc<dyn ExecutionCache>,
    cache_lock: Mutex<()>,
    spec_lock: Mutex<()>,
    executor: TaskExecutor,
    /// Every workspace variant (`BindMountWorkspace`, `NamedVolumeWorkspace`)
    /// reports this same fixed path back from `container_working_dir()`, so
    /// the cache key for an uncreated workspace can be derived without
    /// fetching the archive (spec.md §4.6's `CheckCache` runs ahead of any
    /// workspace setup).
    container_dir: String,
}

impl Coordinator {
    pub fn new(cache: Arc<dyn ExecutionCache>, executor: TaskExecutor, container_dir: impl Into<String>) -> Self {
        Self { cache, cache_lock: Mutex::new(()), spec_lock: Mutex::new(()), executor, container_dir: container_dir.into() }
    }

    /// `CheckCache(tasks) -> (uncached tasks, partial ChangesetSpec list)`
    /// (spec.md §4.6). A task is fully cached when every one of its steps
    /// has a hit; its changeset specs are built immediately and it is
    /// dropped from the returned task list. A task with any miss is
    /// returned unmodified for the caller to hand to `execute_and_build_specs`.
    pub async fn check_cache(&self, tasks: Vec<Task>) -> anyhow::Result<(Vec<Task>, Vec<ChangesetSpec>)> {
        let _guard = self.cache_lock.lock().await;
        let mut uncached = Vec::with_capacity(tasks.len());
        let mut specs = Vec::new();

        for task in tasks {
            match self.fully_cached_results(&task).await? {
                Some(step_results) => {
                    specs.extend(changeset::build_changeset_specs(&task, &step_results)?);
                }
                None => uncached.push(task),
            }
        }

        Ok((uncached, specs))
    }

    async fn fully_cached_results(
        &self,
        task: &Task,
    ) -> anyhow::Result<Option<Vec<batchexec_common::model::AfterStepResult>>> {
        if task.steps.is_empty() {
            return Ok(None);
        }
        let slug = task.slug();
        let step_runner = self.executor.step_runner();
        let process_env = self.executor.process_env();
        let engine_version = batchexec_sdk::build_constants::EngineVersion::identifier();

        let mut ctx = RunningContext {
            repository: RepositoryContext { name: task.repository.name.clone(), search_result_paths: vec![task.path.clone()] },
            batch_change: BatchChangeContext { name: task.batch_change.name.clone(), description: task.batch_change.description.clone() },
            ..Default::default()
        };
        let mut resolved_envs = Vec::with_capacity(task.steps.len());
        let mut step_results = Vec::with_capacity(task.steps.len());

        for (i, step) in task.steps.iter().enumerate() {
            let resolved_env = step_runner.resolve_env(step, &ctx, process_env, &engine_version)?;
            resolved_envs.push(resolved_env);

            let key = cache_key_for_prefix(
                &task.repository.id,
                &task.repository.commit,
                &task.path,
                &self.container_dir,
                &task.steps[..=i],
                &resolved_envs,
            )?;
            match self.cache.get_step_result(&slug, &key).await {
                Ok(Some(result)) => {
                    ctx.absorb_cached_result(self.container_dir.clone(), &result);
                    step_results.push(result);
                }
                Ok(None) => return Ok(None),
                Err(e) => {
                    tracing::warn!(slug = %slug, key = %key, error = %e, "discarding corrupt cache entry");
                    return Ok(None);
                }
            }
        }
        Ok(Some(step_results))
    }

    /// `ClearCache(tasks)` (spec.md §4.6): drops every cache entry for the
    /// given tasks' slugs.
    pub async fn clear_cache(&self, tasks: &[Task]) -> anyhow::Result<()> {
        let _guard = self.cache_lock.lock().await;
        for task in tasks {
            self.cache.clear(&task.slug()).await?;
        }
        Ok(())
    }

    /// `ExecuteAndBuildSpecs(tasks, import_changesets, ui) -> (specs, outcome, err)`
    /// (spec.md §4.6). Runs every task through the Task Executor, builds a
    /// changeset spec per non-empty final diff, appends one spec per
    /// `importChangesets` external ID, and validates head-ref uniqueness
    /// across the combined list before returning. `outcome` is the
    /// worst-case roll-up of every task's own outcome (spec.md §7: task
    /// errors aggregate into a single run-level result), via
    /// [`TaskOutcome::merge`].
    pub async fn execute_and_build_specs(
        &self,
        tasks: Vec<Task>,
        import_changesets: &[ImportChangeset],
        ui: Arc<dyn TaskExecutionUI>,
        cancel: CancellationToken,
    ) -> (Vec<ChangesetSpec>, TaskOutcome, Option<EngineError>) {
        let task_by_slug: HashMap<String, Task> = tasks.iter().map(|t| (t.slug(), t.clone())).collect();
        let (results, error) = self.executor.run(tasks, ui, cancel).await;

        let mut outcome = None;
        for result in &results {
            outcome = Some(TaskOutcome::merge(outcome, result.outcome));
        }
        let mut outcome = outcome.unwrap_or(TaskOutcome::Succeeded);

        let _guard = self.spec_lock.lock().await;
        let mut specs = Vec::new();
        for result in &results {
            if result.error_summary.is_some() {
                continue;
            }
            let Some(task) = task_by_slug.get(&result.task_slug) else {
                continue;
            };
            match changeset::build_changeset_specs(task, &result.step_results) {
                Ok(built) => specs.extend(built),
                Err(e) => return (specs, TaskOutcome::Failed, Some(error.unwrap_or(EngineError::Specification(e)))),
            }
        }

        for imported in import_changesets {
            let attrs = task_by_slug
                .values()
                .next()
                .map(|t| t.batch_change.clone())
                .unwrap_or_else(|| batchexec_common::model::BatchChangeAttrs { name: String::new(), description: String::new() });
            specs.extend(changeset::import_changeset_specs(&attrs, imported));
        }

        if let Err(e) = changeset::validate_no_duplicate_head_refs(&specs) {
            outcome = TaskOutcome::merge(Some(outcome), TaskOutcome::Failed);
            let err = error.unwrap_or(EngineError::Specification(e));
            return (specs, outcome, Some(err));
        }

        (specs, outcome, error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchexec_common::config::EngineConfig;
    use batchexec_common::model::{
        AfterStepResult, BatchChangeAttrs, ChangedFiles, ChangesetTemplate, CommitAuthor, Repository, Step, TransformChanges,
    };
    use batchexec_common::errors::ResourceError;
    use batchexec_common::TaskLogSink;
    use batchexec_engine::{ContainerLauncher, ContainerRunOutcome, ContainerSpec, DiskCache, ImageRegistry};
    use batchexec_engine::{DefaultWorkspaceCreator, StepRunner};
    use batchexec_workspace::ArchiveRegistry;
    use std::collections::HashMap as StdHashMap;

    struct NullUi;
    impl TaskExecutionUI for NullUi {}

    struct EchoLauncher;
    #[async_trait::async_trait]
    impl ContainerLauncher for EchoLauncher {
        async fn run(&self, _spec: &ContainerSpec, _log: &mut TaskLogSink, _cancel: CancellationToken) -> Result<ContainerRunOutcome, ResourceError> {
            Ok(ContainerRunOutcome { exit_code: 0, stdout: String::new(), stderr: String::new() })
        }
    }

    /// Never completes, so the step runner's `tokio::select!` always settles
    /// on its cancellation arm (`step_runner.rs`) instead of racing a real
    /// container.
    struct HangingLauncher;
    #[async_trait::async_trait]
    impl ContainerLauncher for HangingLauncher {
        async fn run(&self, _spec: &ContainerSpec, _log: &mut TaskLogSink, _cancel: CancellationToken) -> Result<ContainerRunOutcome, ResourceError> {
            std::future::pending().await
        }
    }

    struct FixedRegistry;
    #[async_trait::async_trait]
    impl ImageRegistry for FixedRegistry {
        async fn ensure_image(&self, image: &str) -> Result<String, ResourceError> {
            Ok(format!("sha256:{image}"))
        }
    }

    struct EmptyArchiveRegistry;
    #[async_trait::async_trait]
    impl ArchiveRegistry for EmptyArchiveRegistry {
        async fn fetch(&self, _repo_id: &str, _commit: &str, _only_path: Option<&str>) -> anyhow::Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    fn sample_task(path: &str) -> Task {
        Task {
            repository: Repository { id: "1".into(), name: "org/repo".into(), default_branch: "main".into(), commit: "abc".into() },
            path: path.into(),
            only_fetch_workspace: false,
            steps: vec![Step {
                index: 0,
                image: "alpine:3".into(),
                run: "echo hi".into(),
                if_condition: None,
                env: StdHashMap::new(),
                in_glob: None,
                mounts: vec![],
                outputs: StdHashMap::new(),
            }],
            batch_change: BatchChangeAttrs { name: "bc".into(), description: "d".into() },
            changeset_template: ChangesetTemplate {
                title: "t".into(),
                body: "b".into(),
                branch: "batch/bc".into(),
                commit_message: "m".into(),
                author: CommitAuthor { name: "n".into(), email: "e@example.com".into() },
                published: "false".into(),
            },
            transform_changes: TransformChanges::default(),
        }
    }

    #[tokio::test]
    async fn check_cache_returns_task_uncached_on_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(DiskCache::new(dir.path().to_path_buf()));
        let step_runner = StepRunner::new(Arc::new(EchoLauncher), Arc::new(FixedRegistry));
        let workspace_creator =
            Arc::new(DefaultWorkspaceCreator { archive_registry: Arc::new(EmptyArchiveRegistry), container_dir: "/work".into() });
        let config = EngineConfig::new(dir.path().join("cache"), dir.path().join("tmp"));
        let executor = TaskExecutor::new(step_runner, cache.clone(), workspace_creator, config, StdHashMap::new());
        let coordinator = Coordinator::new(cache, executor, "/work");

        let (uncached, specs) = coordinator.check_cache(vec![sample_task("a")]).await.unwrap();
        assert_eq!(uncached.len(), 1);
        assert!(specs.is_empty());
    }

    #[tokio::test]
    async fn check_cache_builds_specs_for_fully_cached_task() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(DiskCache::new(dir.path().to_path_buf()));
        let task = sample_task("a");
        // No step declares its own env and process_env is empty, so the
        // only thing `resolve_env` produces is the injected version sentinel.
        let sentinel_env: StdHashMap<String, String> = [(
            "SRC_CLI_VERSION".to_string(),
            batchexec_sdk::build_constants::EngineVersion::identifier(),
        )]
        .into_iter()
        .collect();
        let resolved_envs: Vec<_> = task.steps.iter().map(|_| sentinel_env.clone()).collect();
        let key = cache_key_for_prefix(&task.repository.id, &task.repository.commit, &task.path, "/work", &task.steps, &resolved_envs)
            .unwrap();
        let result = AfterStepResult {
            step_index: 0,
            diff: b"diff --git a/a.go b/a.go\n+x\n".to_vec(),
            changed_files: ChangedFiles::default(),
            outputs: StdHashMap::new(),
            stdout: String::new(),
            stderr: String::new(),
            skipped: false,
            exit_code: Some(0),
            resolved_env: StdHashMap::new(),
        };
        cache.set_step_result(&task.slug(), &key, &result).await.unwrap();

        let step_runner = StepRunner::new(Arc::new(EchoLauncher), Arc::new(FixedRegistry));
        let workspace_creator =
            Arc::new(DefaultWorkspaceCreator { archive_registry: Arc::new(EmptyArchiveRegistry), container_dir: "/work".into() });
        let config = EngineConfig::new(dir.path().join("cache2"), dir.path().join("tmp2"));
        let executor = TaskExecutor::new(step_runner, cache.clone(), workspace_creator, config, StdHashMap::new());
        let coordinator = Coordinator::new(cache, executor, "/work");

        let (uncached, specs) = coordinator.check_cache(vec![task]).await.unwrap();
        assert!(uncached.is_empty());
        assert_eq!(specs.len(), 1);
    }

    #[tokio::test]
    async fn execute_and_build_specs_runs_uncached_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(DiskCache::new(dir.path().to_path_buf()));
        let step_runner = StepRunner::new(Arc::new(EchoLauncher), Arc::new(FixedRegistry));
        let workspace_creator =
            Arc::new(DefaultWorkspaceCreator { archive_registry: Arc::new(EmptyArchiveRegistry), container_dir: "/work".into() });
        let config = EngineConfig::new(dir.path().join("cache3"), dir.path().join("tmp3"));
        let executor = TaskExecutor::new(step_runner, cache.clone(), workspace_creator, config, StdHashMap::new());
        let coordinator = Coordinator::new(cache, executor, "/work");

        let (specs, outcome, error) = coordinator
            .execute_and_build_specs(vec![sample_task("a")], &[], Arc::new(NullUi), CancellationToken::new())
            .await;
        assert!(error.is_none());
        assert_eq!(outcome, TaskOutcome::Succeeded);
        // EchoLauncher never touches the workspace, so the diff stays empty
        // and no changeset spec is produced — that's fine, this test only
        // asserts the task ran without error.
        let _ = specs;
    }

    #[tokio::test]
    async fn clear_cache_removes_entries_for_given_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(DiskCache::new(dir.path().to_path_buf()));
        let task = sample_task("a");
        let resolved_envs: Vec<_> = task.steps.iter().map(|s| s.env.clone()).collect();
        let key = cache_key_for_prefix(&task.repository.id, &task.repository.commit, &task.path, "/work", &task.steps, &resolved_envs)
            .unwrap();
        let result = AfterStepResult {
            step_index: 0,
            diff: b"diff --git a/a.go b/a.go\n+x\n".to_vec(),
            changed_files: ChangedFiles::default(),
            outputs: StdHashMap::new(),
            stdout: String::new(),
            stderr: String::new(),
            skipped: false,
            exit_code: Some(0),
            resolved_env: StdHashMap::new(),
        };
        cache.set_step_result(&task.slug(), &key, &result).await.unwrap();

        let step_runner = StepRunner::new(Arc::new(EchoLauncher), Arc::new(FixedRegistry));
        let workspace_creator =
            Arc::new(DefaultWorkspaceCreator { archive_registry: Arc::new(EmptyArchiveRegistry), container_dir: "/work".into() });
        let config = EngineConfig::new(dir.path().join("cache5"), dir.path().join("tmp5"));
        let executor = TaskExecutor::new(step_runner, cache.clone(), workspace_creator, config, StdHashMap::new());
        let coordinator = Coordinator::new(cache.clone(), executor, "/work");

        coordinator.clear_cache(&[task.clone()]).await.unwrap();

        assert!(cache.get_step_result(&task.slug(), &key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn execute_and_build_specs_reports_cancelled_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(DiskCache::new(dir.path().to_path_buf()));
        let step_runner = StepRunner::new(Arc::new(HangingLauncher), Arc::new(FixedRegistry));
        let workspace_creator =
            Arc::new(DefaultWorkspaceCreator { archive_registry: Arc::new(EmptyArchiveRegistry), container_dir: "/work".into() });
        let config = EngineConfig::new(dir.path().join("cache6"), dir.path().join("tmp6"));
        let executor = TaskExecutor::new(step_runner, cache.clone(), workspace_creator, config, StdHashMap::new());
        let coordinator = Coordinator::new(cache, executor, "/work");

        let cancel = CancellationToken::new();
        cancel.cancel();

        let (specs, outcome, error) = coordinator
            .execute_and_build_specs(vec![sample_task("a")], &[], Arc::new(NullUi), cancel)
            .await;

        assert!(specs.is_empty());
        assert_eq!(outcome, TaskOutcome::Cancelled);
        assert!(error.is_some());
    }

    #[test]
    fn import_changesets_are_appended_and_validated() {
        let imported = ImportChangeset { repository: "org/repo".into(), external_ids: vec!["42".into()] };
        let attrs = BatchChangeAttrs { name: "bc".into(), description: "d".into() };
        let specs = changeset::import_changeset_specs(&attrs, &imported);
        changeset::validate_no_duplicate_head_refs(&specs).unwrap();
        assert_eq!(specs.len(), 1);
    }
}
