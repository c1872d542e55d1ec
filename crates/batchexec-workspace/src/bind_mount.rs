// Bind-mount workspace variant (spec.md §4.2): a host-side directory
// mounted into the container. Safe on every platform; slower than
// named-volume on non-Linux.

use crate::archive;
use crate::diff::{capture_git_output_via_tempfile, write_diff_to_tempfile};
use crate::git_command_manager::GitCommandManager;
use crate::workspace::{ChangedFiles, MountSpec, Workspace};
use async_trait::async_trait;
use batchexec_common::errors::ResourceError;
use batchexec_sdk::io_util::IOUtil;
use tempfile::TempDir;

pub struct BindMountWorkspace {
    dir: Option<TempDir>,
    git: GitCommandManager,
    baseline_commit: Option<String>,
    container_dir: String,
}

impl BindMountWorkspace {
    pub fn new(container_dir: impl Into<String>) -> Result<Self, ResourceError> {
        let dir = tempfile::tempdir().map_err(|e| ResourceError::WorkspaceSetup {
            path: "<tempdir>".to_string(),
            message: e.to_string(),
        })?;
        Ok(Self { dir: Some(dir), git: GitCommandManager::new(), baseline_commit: None, container_dir: container_dir.into() })
    }

    fn path(&self) -> &std::path::Path {
        self.dir.as_ref().expect("workspace used after close").path()
    }

    fn path_str(&self) -> String {
        self.path().to_string_lossy().into_owned()
    }
}

#[async_trait]
impl Workspace for BindMountWorkspace {
    async fn prepare(&mut self, archive_bytes: &[u8], _only_fetch_workspace: bool) -> Result<(), ResourceError> {
        let dir = self.path().to_path_buf();
        archive::unpack(archive_bytes, &dir).map_err(|e| ResourceError::WorkspaceSetup {
            path: dir.display().to_string(),
            message: e.to_string(),
        })?;

        let dir_str = dir.to_string_lossy().into_owned();
        self.git.init(&dir_str).await.map_err(|e| ResourceError::WorkspaceSetup {
            path: dir_str.clone(),
            message: e.to_string(),
        })?;
        let commit = self.git.commit_baseline(&dir_str).await.map_err(|e| ResourceError::WorkspaceSetup {
            path: dir_str.clone(),
            message: e.to_string(),
        })?;
        self.baseline_commit = Some(commit);
        Ok(())
    }

    async fn changes(&self) -> Result<ChangedFiles, ResourceError> {
        let dir_str = self.path_str();
        self.git.stage_all(&dir_str).await.map_err(|e| ResourceError::WorkspaceSetup {
            path: dir_str.clone(),
            message: e.to_string(),
        })?;
        let status = self.git.status_porcelain(&dir_str).await.map_err(|e| ResourceError::WorkspaceSetup {
            path: dir_str,
            message: e.to_string(),
        })?;
        Ok(parse_porcelain_status(&status))
    }

    async fn diff(&self, expect_non_empty: bool) -> Result<Vec<u8>, ResourceError> {
        let dir_str = self.path_str();
        let baseline = self.baseline_commit.as_deref().unwrap_or("HEAD");
        capture_git_output_via_tempfile(&dir_str, &format!("diff --binary {baseline}"), expect_non_empty)
            .await
            .map_err(|e| ResourceError::WorkspaceSetup { path: dir_str, message: e.to_string() })
    }

    async fn apply_diff(&mut self, diff: &[u8]) -> Result<(), ResourceError> {
        if diff.is_empty() {
            return Err(ResourceError::WorkspaceSetup {
                path: self.path_str(),
                message: "cannot apply an empty diff".to_string(),
            });
        }
        let dir = self.path().to_path_buf();
        let patch_path = write_diff_to_tempfile(&dir, diff).map_err(|e| ResourceError::WorkspaceSetup {
            path: dir.display().to_string(),
            message: e.to_string(),
        })?;
        let dir_str = dir.to_string_lossy().into_owned();
        self.git
            .apply(&dir_str, patch_path.to_string_lossy().as_ref())
            .await
            .map_err(|e| ResourceError::WorkspaceSetup { path: dir_str, message: e.to_string() })
    }

    async fn close(&mut self) -> Result<(), ResourceError> {
        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_path_buf();
            drop(dir);
            let _ = IOUtil::delete_directory(&path);
        }
        Ok(())
    }

    fn mounts(&self) -> Vec<MountSpec> {
        vec![MountSpec { source: self.path_str(), target: self.container_dir.clone(), read_only: false }]
    }

    fn container_working_dir(&self) -> String {
        self.container_dir.clone()
    }
}

/// Parse `git status --porcelain` output into [`ChangedFiles`] (status
/// codes: `A` added, `M` modified, `D` deleted, `R` renamed, `??` untracked
/// treated as added).
pub(crate) fn parse_porcelain_status(output: &str) -> ChangedFiles {
    let mut changes = ChangedFiles::default();
    for line in output.lines() {
        if line.len() < 3 {
            continue;
        }
        let code = &line[..2];
        let path = line[3..].to_string();
        match code.trim() {
            "A" | "??" => changes.added.push(path),
            "M" => changes.modified.push(path),
            "D" => changes.deleted.push(path),
            r if r.starts_with('R') => changes.renamed.push(path),
            _ => changes.modified.push(path),
        }
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_porcelain_status_codes() {
        let status = " M modified.txt\nA  added.txt\n?? untracked.txt\nD  deleted.txt\nR  old.txt -> new.txt\n";
        let changes = parse_porcelain_status(status);
        assert!(changes.modified.contains(&"modified.txt".to_string()));
        assert!(changes.added.contains(&"added.txt".to_string()));
        assert!(changes.added.contains(&"untracked.txt".to_string()));
        assert!(changes.deleted.contains(&"deleted.txt".to_string()));
        assert_eq!(changes.renamed.len(), 1);
    }

    #[tokio::test]
    async fn prepare_unpacks_and_commits_baseline() {
        let mut buf = Vec::new();
        {
            use std::io::Write;
            let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            writer.start_file("file.txt", zip::write::FileOptions::<()>::default()).unwrap();
            writer.write_all(b"hi").unwrap();
            writer.finish().unwrap();
        }
        let mut ws = BindMountWorkspace::new("/work").unwrap();
        ws.prepare(&buf, false).await.unwrap();
        assert!(ws.baseline_commit.is_some());
        ws.close().await.unwrap();
    }
}
