// Default `ArchiveRegistry` for the command-line binary. Repository-archive
// fetching is deliberately out of scope for the core (spec.md §1): this
// reads a previously staged archive from a local directory rather than
// reaching out to a remote service, following the same
// root/slug/file-per-key layout `batchexec_engine::cache::DiskCache` uses
// for the execution cache.

use anyhow::{Context, Result};
use async_trait::async_trait;
use batchexec_workspace::ArchiveRegistry;
use std::path::PathBuf;

pub struct FilesystemArchiveRegistry {
    root: PathBuf,
}

impl FilesystemArchiveRegistry {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn archive_path(&self, repo_id: &str, commit: &str) -> PathBuf {
        let repo_dir = repo_id.replace('/', "-");
        for ext in ["tar.gz", "zip"] {
            let candidate = self.root.join(&repo_dir).join(format!("{commit}.{ext}"));
            if candidate.exists() {
                return candidate;
            }
        }
        self.root.join(&repo_dir).join(format!("{commit}.tar.gz"))
    }
}

#[async_trait]
impl ArchiveRegistry for FilesystemArchiveRegistry {
    async fn fetch(&self, repo_id: &str, commit: &str, _only_path: Option<&str>) -> Result<Vec<u8>> {
        let path = self.archive_path(repo_id, commit);
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("no staged archive for {repo_id}@{commit} at {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fetch_reads_staged_tar_gz() {
        let dir = tempfile::tempdir().unwrap();
        let repo_dir = dir.path().join("org-repo");
        tokio::fs::create_dir_all(&repo_dir).await.unwrap();
        tokio::fs::write(repo_dir.join("abc123.tar.gz"), b"fake archive bytes").await.unwrap();

        let registry = FilesystemArchiveRegistry::new(dir.path().to_path_buf());
        let bytes = registry.fetch("org/repo", "abc123", None).await.unwrap();
        assert_eq!(bytes, b"fake archive bytes");
    }

    #[tokio::test]
    async fn fetch_reports_missing_archive() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FilesystemArchiveRegistry::new(dir.path().to_path_buf());
        assert!(registry.fetch("org/repo", "missing", None).await.is_err());
    }
}
