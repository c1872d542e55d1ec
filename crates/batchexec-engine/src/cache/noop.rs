// No-op Execution Cache (spec.md §4.4): drops all writes, always misses.
// Used when a caller wants every step to run from scratch, e.g. the
// `clear-cache` flag or a dry run.

use super::ExecutionCache;
use async_trait::async_trait;
use batchexec_common::errors::CacheCorruptionError;
use batchexec_common::model::AfterStepResult;

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCache;

#[async_trait]
impl ExecutionCache for NoopCache {
    async fn get_step_result(&self, _slug: &str, _key: &str) -> Result<Option<AfterStepResult>, CacheCorruptionError> {
        Ok(None)
    }

    async fn set_step_result(&self, _slug: &str, _key: &str, _result: &AfterStepResult) -> anyhow::Result<()> {
        Ok(())
    }

    async fn clear(&self, _slug: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchexec_common::model::ChangedFiles;
    use std::collections::HashMap;

    #[tokio::test]
    async fn writes_are_dropped() {
        let cache = NoopCache;
        let result = AfterStepResult {
            step_index: 0,
            diff: vec![],
            changed_files: ChangedFiles::default(),
            outputs: HashMap::new(),
            stdout: String::new(),
            stderr: String::new(),
            skipped: false,
            exit_code: Some(0),
            resolved_env: HashMap::new(),
        };
        cache.set_step_result("slug", "key", &result).await.unwrap();
        assert!(cache.get_step_result("slug", "key").await.unwrap().is_none());
    }
}
