// Container invocation (spec.md §4.3.4/§4.3.7, §1's "we consume an
// ImageRegistry and a minimal container launcher"). Grounded directly on
// `runner-worker/src/container/docker_command_manager.rs`'s CLI-wrapping
// idiom: build an args vec, shell out via `ProcessInvoker`, parse stdout.
//
// Two narrow boundaries, per the spec's explicit out-of-scope list:
// `ImageRegistry` (pull/inspect only) and `ContainerLauncher` (create,
// start logs streaming, wait, stop/remove). A Docker-CLI-backed default
// implementation of each is provided; other implementations can swap in
// without touching the Step Runner.

use async_trait::async_trait;
use batchexec_common::errors::ResourceError;
use batchexec_common::TaskLogSink;
use batchexec_sdk::process_invoker::ProcessInvoker;
use batchexec_sdk::trace::{NullTraceWriter, TraceWriter};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything the launcher needs to run one step's container (spec.md
/// §4.3.7).
pub struct ContainerSpec {
    /// Content digest, not the tag — cache keys must be reproducible
    /// (spec.md §4.3.4).
    pub image_digest: String,
    pub command: String,
    pub working_dir: String,
    pub env: HashMap<String, String>,
    pub mounts: Vec<batchexec_workspace::MountSpec>,
}

#[derive(Debug, Clone)]
pub struct ContainerRunOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Ensures an image is present locally, returning its content digest
/// (spec.md §4.3.4). The "ensure image" operation must be idempotent and
/// collapse concurrent requests for the same image (spec.md §5) — that
/// collapsing is the caller's responsibility (e.g. an in-memory
/// once-per-image lock), not this trait's.
#[async_trait]
pub trait ImageRegistry: Send + Sync {
    async fn ensure_image(&self, image: &str) -> Result<String, ResourceError>;
}

/// Minimal container lifecycle: create, stream logs into the task's log
/// sink, wait, and tear down. Does not expose anything beyond what the
/// Step Runner needs (spec.md §1: "Container-runtime control beyond
/// run/pull/inspect" is out of scope).
#[async_trait]
pub trait ContainerLauncher: Send + Sync {
    async fn run(
        &self,
        spec: &ContainerSpec,
        log: &mut TaskLogSink,
        cancel: CancellationToken,
    ) -> Result<ContainerRunOutcome, ResourceError>;
}

/// Docker-CLI-backed default implementation of both boundaries.
pub struct DockerClient {
    docker_path: String,
}

impl DockerClient {
    pub fn new() -> Self {
        Self { docker_path: "docker".to_string() }
    }

    pub fn with_path(docker_path: impl Into<String>) -> Self {
        Self { docker_path: docker_path.into() }
    }

    fn trace(&self) -> Arc<dyn TraceWriter> {
        Arc::new(NullTraceWriter)
    }

    /// Run a docker subcommand and collect its stdout (grounded on
    /// `DockerCommandManager::run_docker_command`).
    async fn run_docker_command(&self, arguments: &str) -> Result<String, ResourceError> {
        let mut invoker = ProcessInvoker::new(self.trace());
        let mut stdout_rx = invoker.take_stdout_receiver().unwrap();
        let output_handle = tokio::spawn(async move {
            let mut lines = Vec::new();
            while let Some(event) = stdout_rx.recv().await {
                lines.push(event.data);
            }
            lines.join("\n")
        });

        let exit_code = invoker
            .execute("", &self.docker_path, arguments, None, false, false, CancellationToken::new())
            .await
            .map_err(|e| ResourceError::ImagePull { image: arguments.to_string(), message: e.to_string() })?;
        let output = output_handle.await.unwrap_or_default();

        if exit_code != 0 {
            return Err(ResourceError::ImagePull {
                image: arguments.to_string(),
                message: format!("docker {arguments} exited with code {exit_code}"),
            });
        }
        Ok(output)
    }

    fn mount_args(mounts: &[batchexec_workspace::MountSpec]) -> Vec<String> {
        mounts
            .iter()
            .map(|m| {
                let ro = if m.read_only { ":ro" } else { "" };
                format!("-v {}:{}{}", m.source, m.target, ro)
            })
            .collect()
    }

    fn env_args(env: &HashMap<String, String>) -> Vec<String> {
        let mut keys: Vec<&String> = env.keys().collect();
        keys.sort();
        keys.into_iter().map(|k| format!("-e {}={}", k, shell_quote(&env[k]))).collect()
    }
}

impl Default for DockerClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageRegistry for DockerClient {
    async fn ensure_image(&self, image: &str) -> Result<String, ResourceError> {
        let inspect_args = format!("image inspect --format {{{{.Id}}}} {image}");
        match self.run_docker_command(&inspect_args).await {
            Ok(digest) if !digest.trim().is_empty() => Ok(digest.trim().to_string()),
            _ => {
                self.run_docker_command(&format!("pull {image}"))
                    .await
                    .map_err(|e| ResourceError::ImagePull { image: image.to_string(), message: e.to_string() })?;
                let digest = self.run_docker_command(&inspect_args).await?;
                Ok(digest.trim().to_string())
            }
        }
    }
}

#[async_trait]
impl ContainerLauncher for DockerClient {
    async fn run(
        &self,
        spec: &ContainerSpec,
        log: &mut TaskLogSink,
        cancel: CancellationToken,
    ) -> Result<ContainerRunOutcome, ResourceError> {
        let mut args = vec!["create".to_string(), "-w".to_string(), spec.working_dir.clone()];
        args.extend(Self::mount_args(&spec.mounts));
        args.extend(Self::env_args(&spec.env));
        args.push(spec.image_digest.clone());
        args.push("/bin/sh".to_string());
        args.push("-c".to_string());
        args.push(shell_quote(&spec.command));
        let arguments = args.join(" ");

        let container_id = self
            .run_docker_command(&arguments)
            .await
            .map_err(|e| ResourceError::WorkspaceSetup { path: spec.image_digest.clone(), message: e.to_string() })?
            .trim()
            .to_string();

        self.run_docker_command(&format!("start {container_id}")).await?;

        let (stdout, stderr) = self.stream_logs(&container_id, log).await;

        let wait_cmd = format!("wait {container_id}");
        let wait_result = tokio::select! {
            out = self.run_docker_command(&wait_cmd) => out,
            _ = cancel.cancelled() => {
                let _ = self.run_docker_command(&format!("stop {container_id}")).await;
                Ok("-1".to_string())
            }
        };

        let _ = self.run_docker_command(&format!("rm -f {container_id}")).await;

        let exit_code = wait_result
            .ok()
            .and_then(|s| s.trim().parse::<i32>().ok())
            .unwrap_or(-1);

        Ok(ContainerRunOutcome { exit_code, stdout, stderr })
    }
}

impl DockerClient {
    /// Stream `docker logs -f <id>` into the task log sink as each line
    /// arrives, prefixed `stdout:`/`stderr:` (spec.md §4.3.7: piped to the
    /// log sink live, flushed at a 1-second interval and on completion),
    /// returning the accumulated buffers for outputs evaluation.
    async fn stream_logs(&self, container_id: &str, log: &mut TaskLogSink) -> (String, String) {
        let mut invoker = ProcessInvoker::new(self.trace());
        let mut stdout_rx = invoker.take_stdout_receiver().unwrap();
        let mut stderr_rx = invoker.take_stderr_receiver().unwrap();

        let docker_path = self.docker_path.clone();
        let args = format!("logs -f {container_id}");
        let exec_handle = tokio::spawn(async move {
            invoker.execute("", &docker_path, &args, None, false, false, CancellationToken::new()).await
        });

        let mut stdout_lines = Vec::new();
        let mut stderr_lines = Vec::new();
        let mut stdout_done = false;
        let mut stderr_done = false;
        while !stdout_done || !stderr_done {
            tokio::select! {
                event = stdout_rx.recv(), if !stdout_done => {
                    match event {
                        Some(event) => {
                            log.write_prefixed("stdout", &event.data);
                            stdout_lines.push(event.data);
                        }
                        None => stdout_done = true,
                    }
                }
                event = stderr_rx.recv(), if !stderr_done => {
                    match event {
                        Some(event) => {
                            log.write_prefixed("stderr", &event.data);
                            stderr_lines.push(event.data);
                        }
                        None => stderr_done = true,
                    }
                }
            }
        }

        let _ = exec_handle.await;
        log.flush();

        (stdout_lines.join("\n"), stderr_lines.join("\n"))
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}
