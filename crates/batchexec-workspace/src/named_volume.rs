// Named-volume workspace variant (spec.md §4.2): a container-managed
// volume into which the archive is copied; faster than bind-mount on
// non-Linux, but fails when successive steps run as different UIDs. Diff
// extraction needs the volume's contents back on the host, so every
// `changes`/`diff` call first syncs the volume into a local git-tracked
// staging directory via a throwaway container — the "copy-out" half of
// "copy-in, copy-out" (spec.md §4.2).

use crate::archive;
use crate::diff::{capture_git_output_via_tempfile, write_diff_to_tempfile};
use crate::git_command_manager::GitCommandManager;
use crate::workspace::{ChangedFiles, MountSpec, Workspace};
use async_trait::async_trait;
use batchexec_common::errors::ResourceError;
use batchexec_sdk::io_util::IOUtil;
use batchexec_sdk::process_invoker::ProcessInvoker;
use batchexec_sdk::trace::NullTraceWriter;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Image used for the throwaway copy-in/copy-out containers. Any image
/// with `cp` on its PATH works; alpine keeps the pull small.
const SYNC_IMAGE: &str = "alpine:3";

pub struct NamedVolumeWorkspace {
    staging: Option<TempDir>,
    git: GitCommandManager,
    baseline_commit: Option<String>,
    volume_name: String,
    container_dir: String,
}

impl NamedVolumeWorkspace {
    pub fn new(volume_name: impl Into<String>, container_dir: impl Into<String>) -> Result<Self, ResourceError> {
        let staging = tempfile::tempdir().map_err(|e| ResourceError::WorkspaceSetup {
            path: "<tempdir>".to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            staging: Some(staging),
            git: GitCommandManager::new(),
            baseline_commit: None,
            volume_name: volume_name.into(),
            container_dir: container_dir.into(),
        })
    }

    fn staging_path(&self) -> &std::path::Path {
        self.staging.as_ref().expect("workspace used after close").path()
    }

    fn staging_path_str(&self) -> String {
        self.staging_path().to_string_lossy().into_owned()
    }

    async fn run_docker(&self, args: &str) -> Result<(), ResourceError> {
        let invoker = ProcessInvoker::new(Arc::new(NullTraceWriter));
        let exit_code = invoker
            .execute("", "docker", args, None, false, false, CancellationToken::new())
            .await
            .map_err(|e| ResourceError::WorkspaceSetup { path: self.volume_name.clone(), message: e.to_string() })?;
        if exit_code != 0 {
            return Err(ResourceError::WorkspaceSetup {
                path: self.volume_name.clone(),
                message: format!("docker {args} exited with code {exit_code}"),
            });
        }
        Ok(())
    }

    async fn copy_in(&self) -> Result<(), ResourceError> {
        self.run_docker(&format!("volume create {}", self.volume_name)).await?;
        let args = format!(
            "run --rm -v {}:/src:ro -v {}:/dst {} cp -a /src/. /dst/",
            self.staging_path_str(),
            self.volume_name,
            SYNC_IMAGE,
        );
        self.run_docker(&args).await
    }

    async fn copy_out(&self) -> Result<(), ResourceError> {
        let args = format!(
            "run --rm -v {}:/src:ro -v {}:/dst {} cp -a /src/. /dst/",
            self.volume_name,
            self.staging_path_str(),
            SYNC_IMAGE,
        );
        self.run_docker(&args).await
    }
}

#[async_trait]
impl Workspace for NamedVolumeWorkspace {
    async fn prepare(&mut self, archive_bytes: &[u8], _only_fetch_workspace: bool) -> Result<(), ResourceError> {
        let dir = self.staging_path().to_path_buf();
        archive::unpack(archive_bytes, &dir)
            .map_err(|e| ResourceError::WorkspaceSetup { path: dir.display().to_string(), message: e.to_string() })?;

        let dir_str = dir.to_string_lossy().into_owned();
        self.git.init(&dir_str).await.map_err(|e| ResourceError::WorkspaceSetup { path: dir_str.clone(), message: e.to_string() })?;
        let commit = self.git.commit_baseline(&dir_str).await.map_err(|e| ResourceError::WorkspaceSetup { path: dir_str, message: e.to_string() })?;
        self.baseline_commit = Some(commit);

        self.copy_in().await
    }

    async fn changes(&self) -> Result<ChangedFiles, ResourceError> {
        self.copy_out().await?;
        let dir_str = self.staging_path_str();
        self.git.stage_all(&dir_str).await.map_err(|e| ResourceError::WorkspaceSetup { path: dir_str.clone(), message: e.to_string() })?;
        let status = self.git.status_porcelain(&dir_str).await.map_err(|e| ResourceError::WorkspaceSetup { path: dir_str, message: e.to_string() })?;
        Ok(crate::bind_mount::parse_porcelain_status(&status))
    }

    async fn diff(&self, expect_non_empty: bool) -> Result<Vec<u8>, ResourceError> {
        self.copy_out().await?;
        let dir_str = self.staging_path_str();
        let baseline = self.baseline_commit.as_deref().unwrap_or("HEAD");
        capture_git_output_via_tempfile(&dir_str, &format!("diff --binary {baseline}"), expect_non_empty)
            .await
            .map_err(|e| ResourceError::WorkspaceSetup { path: dir_str, message: e.to_string() })
    }

    async fn apply_diff(&mut self, diff: &[u8]) -> Result<(), ResourceError> {
        if diff.is_empty() {
            return Err(ResourceError::WorkspaceSetup {
                path: self.staging_path_str(),
                message: "cannot apply an empty diff".to_string(),
            });
        }
        let dir = self.staging_path().to_path_buf();
        let patch_path = write_diff_to_tempfile(&dir, diff)
            .map_err(|e| ResourceError::WorkspaceSetup { path: dir.display().to_string(), message: e.to_string() })?;
        let dir_str = dir.to_string_lossy().into_owned();
        self.git
            .apply(&dir_str, patch_path.to_string_lossy().as_ref())
            .await
            .map_err(|e| ResourceError::WorkspaceSetup { path: dir_str, message: e.to_string() })?;
        self.copy_in().await
    }

    async fn close(&mut self) -> Result<(), ResourceError> {
        let _ = self.run_docker(&format!("volume rm -f {}", self.volume_name)).await;
        if let Some(dir) = self.staging.take() {
            let path = dir.path().to_path_buf();
            drop(dir);
            let _ = IOUtil::delete_directory(&path);
        }
        Ok(())
    }

    fn mounts(&self) -> Vec<MountSpec> {
        vec![MountSpec { source: self.volume_name.clone(), target: self.container_dir.clone(), read_only: false }]
    }

    fn container_working_dir(&self) -> String {
        self.container_dir.clone()
    }
}
