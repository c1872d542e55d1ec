// Disk-backed Execution Cache (spec.md §4.4, §6): one file per key under
// `<cache-dir>/<slug>/<key>.json`. Writes go through a temp file and an
// atomic rename, the same pattern `runner-common`'s settings store uses to
// avoid ever leaving a half-written file on disk.

use super::ExecutionCache;
use async_trait::async_trait;
use batchexec_common::errors::CacheCorruptionError;
use batchexec_common::model::AfterStepResult;
use std::path::PathBuf;
use tokio::fs;

pub struct DiskCache {
    root: PathBuf,
}

impl DiskCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn entry_path(&self, slug: &str, key: &str) -> PathBuf {
        self.root.join(slug).join(format!("{key}.json"))
    }
}

#[async_trait]
impl ExecutionCache for DiskCache {
    async fn get_step_result(&self, slug: &str, key: &str) -> Result<Option<AfterStepResult>, CacheCorruptionError> {
        let path = self.entry_path(slug, key);
        let bytes = match fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(_) => return Ok(None),
        };
        match serde_json::from_slice::<AfterStepResult>(&bytes) {
            Ok(result) => Ok(Some(result)),
            Err(e) => {
                // Local recovery: delete the offending file, treat as a
                // miss, report the corruption for logging (spec.md §7.6).
                let _ = fs::remove_file(&path).await;
                Err(CacheCorruptionError { path: path.display().to_string(), message: e.to_string() })
            }
        }
    }

    async fn set_step_result(&self, slug: &str, key: &str, result: &AfterStepResult) -> anyhow::Result<()> {
        let dir = self.root.join(slug);
        fs::create_dir_all(&dir).await?;
        let final_path = self.entry_path(slug, key);
        let tmp_path = dir.join(format!(".{key}.json.tmp"));
        let json = serde_json::to_vec_pretty(result)?;
        fs::write(&tmp_path, &json).await?;
        fs::rename(&tmp_path, &final_path).await?;
        Ok(())
    }

    async fn clear(&self, slug: &str) -> anyhow::Result<()> {
        let dir = self.root.join(slug);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchexec_common::model::ChangedFiles;
    use std::collections::HashMap;

    fn sample_result() -> AfterStepResult {
        AfterStepResult {
            step_index: 0,
            diff: b"diff".to_vec(),
            changed_files: ChangedFiles::default(),
            outputs: HashMap::new(),
            stdout: String::new(),
            stderr: String::new(),
            skipped: false,
            exit_code: Some(0),
            resolved_env: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn miss_reports_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path());
        let result = cache.get_step_result("slug", "key").await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path());
        cache.set_step_result("slug", "key", &sample_result()).await.unwrap();
        let result = cache.get_step_result("slug", "key").await.unwrap().unwrap();
        assert_eq!(result.step_index, 0);
    }

    #[tokio::test]
    async fn clear_removes_all_entries_for_slug() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path());
        cache.set_step_result("slug", "key1", &sample_result()).await.unwrap();
        cache.set_step_result("slug", "key2", &sample_result()).await.unwrap();
        cache.clear("slug").await.unwrap();
        assert!(cache.get_step_result("slug", "key1").await.unwrap().is_none());
        assert!(cache.get_step_result("slug", "key2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_entry_is_deleted_and_reported() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path());
        let entry_dir = dir.path().join("slug");
        fs::create_dir_all(&entry_dir).await.unwrap();
        fs::write(entry_dir.join("key.json"), b"not json").await.unwrap();

        let err = cache.get_step_result("slug", "key").await.unwrap_err();
        assert!(err.message.contains("expected"));
        assert!(cache.get_step_result("slug", "key").await.unwrap().is_none());
    }
}
