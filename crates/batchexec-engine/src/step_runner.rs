// Step Runner (spec.md §4.3): runs one step end to end. Grounded on
// `runner-worker/src/steps_runner.rs`'s pipeline shape (condition
// evaluation, timeout-guarded execution via `tokio::select!`, outcome
// bookkeeping) generalized from a fixed GitHub-Actions step model to
// spec.md's eligibility → condition → env → image → render → launch →
// timeout → diff → outputs → checkpoint sequence.

use crate::container::{ContainerLauncher, ContainerSpec, ImageRegistry};
use batchexec_common::errors::{EngineError, SpecificationError, StepExecutionError, TimeoutError};
use batchexec_common::model::{AfterStepResult, ChangedFiles, Mount, OutputFormat, Step};
use batchexec_common::TaskLogSink;
use batchexec_template::context::{
    BatchChangeContext, PreviousStepContext, RepositoryContext, StepContext, StepResultContext,
    StepSummary,
};
use batchexec_template::{parse_template, partial_eval, render, render_bool};
use batchexec_workspace::{MountSpec, Workspace};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Everything the runner needs to know about prior steps and the current
/// cumulative outputs map, threaded through the whole task (spec.md §3's
/// `Task`/`AfterStepResult` fields modeled as a running context rather than
/// re-derived each step).
#[derive(Debug, Clone, Default)]
pub struct RunningContext {
    pub repository: RepositoryContext,
    pub batch_change: BatchChangeContext,
    pub outputs: serde_json::Map<String, serde_json::Value>,
    pub previous_step: Option<PreviousStepContext>,
    pub steps: Vec<StepSummary>,
}

impl RunningContext {
    fn step_context(&self, current: Option<StepResultContext>) -> StepContext {
        StepContext {
            batch_change: self.batch_change.clone(),
            outputs: self.outputs.clone(),
            previous_step: self.previous_step.clone(),
            step: current,
            steps: self.steps.clone(),
            repository: self.repository.clone(),
        }
    }

    fn static_context(&self) -> serde_json::Value {
        // Only `repository` and `batch_change` are static roots (spec.md
        // §4.1); everything else is zeroed so the partial evaluator never
        // accidentally treats a stale previous run's value as known.
        serde_json::json!({
            "repository": self.repository,
            "batch_change": self.batch_change,
        })
    }

    /// Replay a previously cached step's effect on the running context.
    /// Used when probing the cache ahead of execution: a later step's
    /// resolved env can depend on `${{ outputs.* }}`/`${{ previous_step.* }}`
    /// references, so those need to carry forward exactly as they would
    /// after actually running the cached step.
    pub fn absorb_cached_result(&mut self, workspace_dir: String, result: &AfterStepResult) {
        let cf = &result.changed_files;
        self.previous_step = Some(PreviousStepContext {
            modified_files: cf.modified.clone(),
            added_files: cf.added.clone(),
            deleted_files: cf.deleted.clone(),
            renamed_files: cf.renamed.clone(),
            stdout: result.stdout.clone(),
            stderr: result.stderr.clone(),
        });
        self.steps.push(StepSummary {
            path: workspace_dir,
            modified_files: cf.modified.clone(),
            added_files: cf.added.clone(),
            deleted_files: cf.deleted.clone(),
            renamed_files: cf.renamed.clone(),
        });
        for (key, value) in &result.outputs {
            self.outputs.insert(key.clone(), value.clone());
        }
    }
}

pub struct StepRunner {
    launcher: Arc<dyn ContainerLauncher>,
    images: Arc<dyn ImageRegistry>,
}

impl StepRunner {
    pub fn new(launcher: Arc<dyn ContainerLauncher>, images: Arc<dyn ImageRegistry>) -> Self {
        Self { launcher, images }
    }

    /// Run one step against `workspace`, per spec.md §4.3's numbered
    /// pipeline. `process_env` is the engine's ambient environment, merged
    /// under the step's own declared env (spec.md §4.3.3). `batch_spec_dir`
    /// and `remote_execution` bound step 6's mount validation.
    #[allow(clippy::too_many_arguments)]
    pub async fn run_step(
        &self,
        step: &Step,
        repo_name: &str,
        engine_version: &str,
        process_env: &HashMap<String, String>,
        workspace: &mut dyn Workspace,
        log: &mut TaskLogSink,
        ctx: &mut RunningContext,
        timeout: Duration,
        cancel: CancellationToken,
        batch_spec_dir: &Path,
        remote_execution: bool,
    ) -> Result<AfterStepResult, EngineError> {
        // 1. Eligibility.
        if let Some(glob) = &step.in_glob {
            let pattern = glob::Pattern::new(glob).map_err(|e| {
                SpecificationError::Template { location: format!("step[{}].in", step.index), message: e.to_string() }
            })?;
            if !pattern.matches(repo_name) {
                return Ok(self.skipped_result(step, workspace, ctx, process_env, engine_version).await?);
            }
        }

        // 2. Condition.
        let should_run = self.evaluate_condition(step, ctx)?;
        if !should_run {
            return Ok(self.skipped_result(step, workspace, ctx, process_env, engine_version).await?);
        }

        // 3. Environment resolution — resolved env is what's hashed into
        // the cache key, not the whole process env (spec.md §4.3.3).
        let step_context_json = ctx.step_context(None).to_json();
        let resolved_env = self.resolve_env(step, ctx, process_env, engine_version)?;

        // 4. Image assurance.
        let digest = self
            .images
            .ensure_image(&step.image)
            .await
            .map_err(|e| EngineError::Resource(e))?;

        // 5. Command render.
        let command = self.render_string(&step.run, &step_context_json, step.index)?;

        // 6. Mount preparation.
        let mut mounts = workspace.mounts();
        mounts.extend(self.prepare_step_mounts(step, batch_spec_dir, remote_execution)?);

        // 7/8. Launch with a per-step deadline.
        let spec = ContainerSpec {
            image_digest: digest.clone(),
            command: command.clone(),
            working_dir: workspace.container_working_dir(),
            env: resolved_env.clone(),
            mounts,
        };

        let run_cancel = CancellationToken::new();
        let _guard = run_cancel.clone().drop_guard();
        let outcome = tokio::select! {
            result = self.launcher.run(&spec, log, run_cancel.clone()) => {
                result.map_err(EngineError::Resource)?
            }
            _ = tokio::time::sleep(timeout) => {
                run_cancel.cancel();
                return Err(EngineError::Timeout(TimeoutError::new(timeout)));
            }
            _ = cancel.cancelled() => {
                run_cancel.cancel();
                return Err(EngineError::Cancellation(batchexec_common::errors::CancellationError));
            }
        };

        if outcome.exit_code != 0 {
            return Err(EngineError::StepExecution(StepExecutionError::new(
                step.index,
                step.image.clone(),
                command,
                Some(outcome.exit_code),
                log.tail(),
            )));
        }

        // 9. Post-step state.
        let changed_files = workspace.changes().await.map_err(EngineError::Resource)?;
        let diff = workspace.diff(!changed_files.is_empty()).await.map_err(EngineError::Resource)?;

        ctx.previous_step = Some(PreviousStepContext {
            modified_files: changed_files.modified.clone(),
            added_files: changed_files.added.clone(),
            deleted_files: changed_files.deleted.clone(),
            renamed_files: changed_files.renamed.clone(),
            stdout: outcome.stdout.clone(),
            stderr: outcome.stderr.clone(),
        });
        ctx.steps.push(StepSummary {
            path: workspace.container_working_dir(),
            modified_files: changed_files.modified.clone(),
            added_files: changed_files.added.clone(),
            deleted_files: changed_files.deleted.clone(),
            renamed_files: changed_files.renamed.clone(),
        });

        // 10. Outputs — render each output's value template; parse per
        // format; merge into the task's outputs map (later-wins).
        let result_json = ctx
            .step_context(Some(StepResultContext {
                stdout: outcome.stdout.clone(),
                stderr: outcome.stderr.clone(),
                exit_code: Some(outcome.exit_code),
            }))
            .to_json();
        for (name, output_spec) in &step.outputs {
            let rendered = self.render_string(&output_spec.value_template, &result_json, step.index)?;
            let value = match output_spec.format {
                OutputFormat::Raw => serde_json::Value::String(rendered),
                OutputFormat::Json => serde_json::from_str(&rendered).map_err(|e| {
                    SpecificationError::Template {
                        location: format!("step[{}].outputs.{name}", step.index),
                        message: format!("invalid json: {e}"),
                    }
                })?,
                OutputFormat::Yaml => serde_yaml::from_str(&rendered).map_err(|e| {
                    SpecificationError::Template {
                        location: format!("step[{}].outputs.{name}", step.index),
                        message: format!("invalid yaml: {e}"),
                    }
                })?,
            };
            ctx.outputs.insert(name.clone(), value);
        }

        // 11. Checkpoint.
        Ok(AfterStepResult {
            step_index: step.index,
            diff,
            changed_files,
            outputs: ctx.outputs.clone().into_iter().collect(),
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            skipped: false,
            exit_code: Some(outcome.exit_code),
            resolved_env,
        })
    }

    async fn skipped_result(
        &self,
        step: &Step,
        workspace: &mut dyn Workspace,
        ctx: &RunningContext,
        process_env: &HashMap<String, String>,
        engine_version: &str,
    ) -> Result<AfterStepResult, EngineError> {
        // A condition-skipped step inherits the prior diff/outputs so later
        // resumptions find a continuous chain (spec.md §4.4). Its env is
        // still resolved so the cache entry it writes carries a correct key.
        let resolved_env = self.resolve_env(step, ctx, process_env, engine_version)?;
        let changed_files = workspace.changes().await.map_err(EngineError::Resource)?;
        let diff = workspace.diff(!changed_files.is_empty()).await.map_err(EngineError::Resource)?;
        Ok(AfterStepResult {
            step_index: step.index,
            diff,
            changed_files,
            outputs: ctx.outputs.clone().into_iter().collect(),
            stdout: String::new(),
            stderr: String::new(),
            skipped: true,
            exit_code: None,
            resolved_env,
        })
    }

    /// Merge the process environment, the fixed `SRC_CLI_VERSION` and the
    /// step's own declared env (with `${{ … }}` references rendered against
    /// `ctx`) into the env a container actually runs with (spec.md §4.3.3).
    /// This is the value hashed into the cache key, not the whole process
    /// env. `pub` so the cache probe ahead of execution (Task Executor,
    /// Coordinator) can derive the same resolved env a real run would
    /// produce, given a `ctx` that already reflects every prior step's
    /// outcome (see [`RunningContext::absorb_cached_result`]).
    pub fn resolve_env(
        &self,
        step: &Step,
        ctx: &RunningContext,
        process_env: &HashMap<String, String>,
        engine_version: &str,
    ) -> Result<HashMap<String, String>, EngineError> {
        let step_context_json = ctx.step_context(None).to_json();
        let mut resolved_env = process_env.clone();
        resolved_env.insert("SRC_CLI_VERSION".to_string(), engine_version.to_string());
        for (key, value_template) in &step.env {
            let rendered = self.render_string(value_template, &step_context_json, step.index)?;
            resolved_env.insert(key.clone(), rendered);
        }
        Ok(resolved_env)
    }

    /// Validate and normalise each step-declared mount (spec.md §4.3.6,
    /// §4.3's step 6): the host path must exist, must live inside the
    /// batch-spec directory, and is normalised to an absolute path with a
    /// trailing slash when it names a directory. Forbidden outright when
    /// the engine is executing remotely, since there is no shared host
    /// filesystem to mount from.
    fn prepare_step_mounts(
        &self,
        step: &Step,
        batch_spec_dir: &Path,
        remote_execution: bool,
    ) -> Result<Vec<MountSpec>, EngineError> {
        if step.mounts.is_empty() {
            return Ok(Vec::new());
        }
        if remote_execution {
            return Err(EngineError::Specification(SpecificationError::Mount {
                step_index: step.index,
                message: "mounts are forbidden when the engine is executing remotely".to_string(),
            }));
        }

        let batch_spec_dir = batch_spec_dir.canonicalize().map_err(|e| {
            EngineError::Specification(SpecificationError::Mount {
                step_index: step.index,
                message: format!("batch-spec directory '{}' is not accessible: {e}", batch_spec_dir.display()),
            })
        })?;

        step.mounts
            .iter()
            .map(|mount: &Mount| self.prepare_one_mount(step.index, mount, &batch_spec_dir))
            .collect()
    }

    fn prepare_one_mount(&self, step_index: usize, mount: &Mount, batch_spec_dir: &Path) -> Result<MountSpec, EngineError> {
        let host_path = Path::new(&mount.path);
        let metadata = std::fs::metadata(host_path).map_err(|e| {
            EngineError::Specification(SpecificationError::Mount {
                step_index,
                message: format!("mount host path '{}' does not exist: {e}", mount.path),
            })
        })?;
        let canonical = host_path.canonicalize().map_err(|e| {
            EngineError::Specification(SpecificationError::Mount {
                step_index,
                message: format!("mount host path '{}' could not be resolved: {e}", mount.path),
            })
        })?;
        if !canonical.starts_with(batch_spec_dir) {
            return Err(EngineError::Specification(SpecificationError::Mount {
                step_index,
                message: format!(
                    "mount host path '{}' is outside the batch-spec directory '{}'",
                    canonical.display(),
                    batch_spec_dir.display()
                ),
            }));
        }

        let mut source = canonical.to_string_lossy().into_owned();
        if metadata.is_dir() && !source.ends_with('/') {
            source.push('/');
        }

        Ok(MountSpec { source, target: mount.mount_path.clone(), read_only: false })
    }

    fn evaluate_condition(&self, step: &Step, ctx: &RunningContext) -> Result<bool, EngineError> {
        let Some(condition) = &step.if_condition else {
            return Ok(true);
        };
        let template = parse_template(condition).map_err(|e| {
            SpecificationError::Template { location: format!("step[{}].if", step.index), message: e.to_string() }
        })?;

        let partial = partial_eval(&template, &ctx.static_context());
        if partial.is_fully_static() {
            let text = partial.as_static_text().unwrap_or_default();
            return Ok(text.trim() == "true");
        }

        let full_context = ctx.step_context(None).to_json();
        render_bool(&template, &full_context).map_err(|e| {
            EngineError::Specification(SpecificationError::Template {
                location: format!("step[{}].if", step.index),
                message: e.to_string(),
            })
        })
    }

    fn render_string(&self, template_str: &str, context: &serde_json::Value, step_index: usize) -> Result<String, EngineError> {
        let template = parse_template(template_str).map_err(|e| {
            SpecificationError::Template { location: format!("step[{step_index}]"), message: e.to_string() }
        })?;
        render(&template, context).map_err(|e| {
            EngineError::Specification(SpecificationError::Template {
                location: format!("step[{step_index}]"),
                message: e.to_string(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ContainerRunOutcome;
    use async_trait::async_trait;
    use batchexec_common::errors::ResourceError;
    use batchexec_workspace::MountSpec;

    struct FakeLauncher {
        exit_code: i32,
    }

    #[async_trait]
    impl ContainerLauncher for FakeLauncher {
        async fn run(
            &self,
            _spec: &ContainerSpec,
            log: &mut TaskLogSink,
            _cancel: CancellationToken,
        ) -> Result<ContainerRunOutcome, ResourceError> {
            log.write_prefixed("stdout", "hello from step");
            Ok(ContainerRunOutcome { exit_code: self.exit_code, stdout: "hello from step".to_string(), stderr: String::new() })
        }
    }

    struct FakeRegistry;

    #[async_trait]
    impl ImageRegistry for FakeRegistry {
        async fn ensure_image(&self, image: &str) -> Result<String, ResourceError> {
            Ok(format!("sha256:{image}"))
        }
    }

    struct FakeWorkspace {
        diff_bytes: Vec<u8>,
    }

    #[async_trait]
    impl Workspace for FakeWorkspace {
        async fn prepare(&mut self, _archive: &[u8], _only_fetch: bool) -> Result<(), ResourceError> {
            Ok(())
        }
        async fn changes(&self) -> Result<ChangedFiles, ResourceError> {
            Ok(ChangedFiles { modified: vec!["README.md".to_string()], ..Default::default() })
        }
        async fn diff(&self, _expect_non_empty: bool) -> Result<Vec<u8>, ResourceError> {
            Ok(self.diff_bytes.clone())
        }
        async fn apply_diff(&mut self, _diff: &[u8]) -> Result<(), ResourceError> {
            Ok(())
        }
        async fn close(&mut self) -> Result<(), ResourceError> {
            Ok(())
        }
        fn mounts(&self) -> Vec<MountSpec> {
            vec![]
        }
        fn container_working_dir(&self) -> String {
            "/work".to_string()
        }
    }

    fn sample_step() -> Step {
        Step {
            index: 0,
            image: "alpine:3".to_string(),
            run: "echo hi".to_string(),
            if_condition: None,
            env: HashMap::new(),
            in_glob: None,
            mounts: vec![],
            outputs: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn run_step_succeeds_and_checkpoints() {
        let runner = StepRunner::new(Arc::new(FakeLauncher { exit_code: 0 }), Arc::new(FakeRegistry));
        let mut workspace = FakeWorkspace { diff_bytes: b"diff --git a b\n+hi\n".to_vec() };
        let mut log = TaskLogSink::create(tempfile::tempdir().unwrap().path(), "t").unwrap();
        let mut ctx = RunningContext::default();
        let step = sample_step();

        let result = runner
            .run_step(
                &step,
                "org/repo",
                "1.0.0",
                &HashMap::new(),
                &mut workspace,
                &mut log,
                &mut ctx,
                Duration::from_secs(5),
                CancellationToken::new(),
                tempfile::tempdir().unwrap().path(),
                false,
            )
            .await
            .unwrap();

        assert_eq!(result.step_index, 0);
        assert!(!result.skipped);
        assert!(!result.is_empty_diff());
        assert_eq!(ctx.previous_step.as_ref().unwrap().stdout, "hello from step");
    }

    #[tokio::test]
    async fn run_step_reports_non_zero_exit_as_step_execution_error() {
        let runner = StepRunner::new(Arc::new(FakeLauncher { exit_code: 1 }), Arc::new(FakeRegistry));
        let mut workspace = FakeWorkspace { diff_bytes: vec![] };
        let mut log = TaskLogSink::create(tempfile::tempdir().unwrap().path(), "t").unwrap();
        let mut ctx = RunningContext::default();
        let step = sample_step();

        let err = runner
            .run_step(
                &step,
                "org/repo",
                "1.0.0",
                &HashMap::new(),
                &mut workspace,
                &mut log,
                &mut ctx,
                Duration::from_secs(5),
                CancellationToken::new(),
                tempfile::tempdir().unwrap().path(),
                false,
            )
            .await
            .unwrap_err();

        match err {
            EngineError::StepExecution(e) => assert_eq!(e.exit_code, Some(1)),
            other => panic!("expected StepExecution, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn eligibility_glob_mismatch_skips_step() {
        let runner = StepRunner::new(Arc::new(FakeLauncher { exit_code: 0 }), Arc::new(FakeRegistry));
        let mut workspace = FakeWorkspace { diff_bytes: b"prior diff".to_vec() };
        let mut log = TaskLogSink::create(tempfile::tempdir().unwrap().path(), "t").unwrap();
        let mut ctx = RunningContext::default();
        let mut step = sample_step();
        step.in_glob = Some("other-org/*".to_string());

        let result = runner
            .run_step(
                &step,
                "org/repo",
                "1.0.0",
                &HashMap::new(),
                &mut workspace,
                &mut log,
                &mut ctx,
                Duration::from_secs(5),
                CancellationToken::new(),
                tempfile::tempdir().unwrap().path(),
                false,
            )
            .await
            .unwrap();

        assert!(result.skipped);
    }

    #[tokio::test]
    async fn static_false_condition_skips_without_launching() {
        let runner = StepRunner::new(Arc::new(FakeLauncher { exit_code: 0 }), Arc::new(FakeRegistry));
        let mut workspace = FakeWorkspace { diff_bytes: b"prior diff".to_vec() };
        let mut log = TaskLogSink::create(tempfile::tempdir().unwrap().path(), "t").unwrap();
        let mut ctx = RunningContext::default();
        ctx.repository.name = "org/repo".to_string();
        let mut step = sample_step();
        step.if_condition = Some("${{ eq(repository.name, \"other\") }}".to_string());

        let result = runner
            .run_step(
                &step,
                "org/repo",
                "1.0.0",
                &HashMap::new(),
                &mut workspace,
                &mut log,
                &mut ctx,
                Duration::from_secs(5),
                CancellationToken::new(),
                tempfile::tempdir().unwrap().path(),
                false,
            )
            .await
            .unwrap();

        assert!(result.skipped);
    }

    #[test]
    fn mount_is_passed_through_for_an_existing_directory_inside_the_batch_spec_dir() {
        let runner = StepRunner::new(Arc::new(FakeLauncher { exit_code: 0 }), Arc::new(FakeRegistry));
        let batch_spec_dir = tempfile::tempdir().unwrap();
        let sub = batch_spec_dir.path().join("assets");
        std::fs::create_dir(&sub).unwrap();
        let mut step = sample_step();
        step.mounts = vec![Mount { path: sub.to_string_lossy().into_owned(), mount_path: "/assets".to_string() }];

        let mounts = runner.prepare_step_mounts(&step, batch_spec_dir.path(), false).unwrap();

        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].target, "/assets");
        assert!(mounts[0].source.ends_with('/'));
    }

    #[test]
    fn mount_outside_the_batch_spec_dir_is_rejected() {
        let runner = StepRunner::new(Arc::new(FakeLauncher { exit_code: 0 }), Arc::new(FakeRegistry));
        let batch_spec_dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let mut step = sample_step();
        step.mounts = vec![Mount { path: outside.path().to_string_lossy().into_owned(), mount_path: "/outside".to_string() }];

        let err = runner.prepare_step_mounts(&step, batch_spec_dir.path(), false).unwrap_err();

        match err {
            EngineError::Specification(SpecificationError::Mount { .. }) => {}
            other => panic!("expected a Mount error, got {other:?}"),
        }
    }

    #[test]
    fn mount_with_a_missing_host_path_is_rejected() {
        let runner = StepRunner::new(Arc::new(FakeLauncher { exit_code: 0 }), Arc::new(FakeRegistry));
        let batch_spec_dir = tempfile::tempdir().unwrap();
        let mut step = sample_step();
        step.mounts =
            vec![Mount { path: batch_spec_dir.path().join("does-not-exist").to_string_lossy().into_owned(), mount_path: "/x".to_string() }];

        runner.prepare_step_mounts(&step, batch_spec_dir.path(), false).unwrap_err();
    }

    #[test]
    fn mounts_are_forbidden_when_executing_remotely() {
        let runner = StepRunner::new(Arc::new(FakeLauncher { exit_code: 0 }), Arc::new(FakeRegistry));
        let batch_spec_dir = tempfile::tempdir().unwrap();
        let mut step = sample_step();
        step.mounts = vec![Mount { path: batch_spec_dir.path().to_string_lossy().into_owned(), mount_path: "/x".to_string() }];

        let err = runner.prepare_step_mounts(&step, batch_spec_dir.path(), true).unwrap_err();

        match err {
            EngineError::Specification(SpecificationError::Mount { .. }) => {}
            other => panic!("expected a Mount error, got {other:?}"),
        }
    }

    #[test]
    fn no_declared_mounts_is_a_no_op_even_when_remote() {
        let runner = StepRunner::new(Arc::new(FakeLauncher { exit_code: 0 }), Arc::new(FakeRegistry));
        let batch_spec_dir = tempfile::tempdir().unwrap();
        let step = sample_step();

        let mounts = runner.prepare_step_mounts(&step, batch_spec_dir.path(), true).unwrap();

        assert!(mounts.is_empty());
    }
}
