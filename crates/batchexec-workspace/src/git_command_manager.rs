// Wraps the `git` CLI, grounded on `docker_command_manager.rs`'s CLI
// wrapping idiom: build an args vec, shell out via `ProcessInvoker`,
// inspect exit code and stdout. Used by both workspace variants for
// baseline commits and (non-diff) plumbing commands; large-output commands
// like `diff` go through `diff.rs`'s temp-file capture instead.

use anyhow::{Context, Result};
use batchexec_sdk::process_invoker::ProcessInvoker;
use batchexec_sdk::trace::{NullTraceWriter, TraceWriter};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Fixed commit identity used for every workspace baseline commit — it is
/// unrelated to the host, matching spec.md §4.2's "configure user identity
/// (fixed name/email unrelated to host)".
pub const COMMIT_AUTHOR_NAME: &str = "batch-change-executor";
pub const COMMIT_AUTHOR_EMAIL: &str = "batch-change-executor@localhost";

pub struct GitCommandManager {
    git_path: String,
    trace: Arc<dyn TraceWriter>,
}

impl GitCommandManager {
    pub fn new() -> Self {
        Self { git_path: "git".to_string(), trace: Arc::new(NullTraceWriter) }
    }

    pub fn with_trace(trace: Arc<dyn TraceWriter>) -> Self {
        Self { git_path: "git".to_string(), trace }
    }

    pub async fn init(&self, dir: &str) -> Result<()> {
        self.run(dir, "init -q").await?;
        self.run(dir, &format!("config user.name {COMMIT_AUTHOR_NAME}")).await?;
        self.run(dir, &format!("config user.email {COMMIT_AUTHOR_EMAIL}")).await?;
        Ok(())
    }

    /// Stage every file and record the baseline commit. Returns the
    /// resulting commit hash.
    pub async fn commit_baseline(&self, dir: &str) -> Result<String> {
        self.run(dir, "add -A").await?;
        // --allow-empty: an archive can legitimately contain zero files.
        self.run(dir, "commit -q --allow-empty -m baseline").await?;
        let hash = self.run(dir, "rev-parse HEAD").await?;
        Ok(hash.trim().to_string())
    }

    /// Stage every file produced by a step so the next `diff`/`status`
    /// reflects it.
    pub async fn stage_all(&self, dir: &str) -> Result<()> {
        self.run(dir, "add -A").await?;
        Ok(())
    }

    pub async fn status_porcelain(&self, dir: &str) -> Result<String> {
        self.run(dir, "status --porcelain").await
    }

    pub async fn apply(&self, dir: &str, patch_file: &str) -> Result<()> {
        self.run(dir, &format!("apply --binary --whitespace=nowarn {patch_file}")).await?;
        Ok(())
    }

    async fn run(&self, dir: &str, args: &str) -> Result<String> {
        let mut invoker = ProcessInvoker::new(self.trace.clone());
        let mut stdout_rx = invoker.take_stdout_receiver().unwrap();
        let output_handle = tokio::spawn(async move {
            let mut lines = Vec::new();
            while let Some(event) = stdout_rx.recv().await {
                lines.push(event.data);
            }
            lines.join("\n")
        });

        let exit_code = invoker
            .execute(dir, &self.git_path, args, None, false, false, CancellationToken::new())
            .await
            .with_context(|| format!("git {args} failed to start"))?;
        let output = output_handle.await.unwrap_or_default();
        if exit_code != 0 {
            anyhow::bail!("git {args} exited with code {exit_code}: {output}");
        }
        Ok(output)
    }
}

impl Default for GitCommandManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn init_creates_repository() {
        let dir = tempfile::tempdir().unwrap();
        let git = GitCommandManager::new();
        std::fs::write(dir.path().join("a.txt"), "hello").unwrap();
        git.init(dir.path().to_str().unwrap()).await.unwrap();
        assert!(dir.path().join(".git").is_dir());
    }

    #[tokio::test]
    async fn commit_baseline_records_a_commit() {
        let dir = tempfile::tempdir().unwrap();
        let git = GitCommandManager::new();
        let path = dir.path().to_str().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello").unwrap();
        git.init(path).await.unwrap();
        let hash = git.commit_baseline(path).await.unwrap();
        assert_eq!(hash.len(), 40);
    }
}
