// Execution Cache (spec.md §4.4): a content-addressed store of per-step
// results, keyed on `(repo, path, step-prefix, resolved-env, working-dir)`.
// Grounded on spec.md §4.4 directly; the write-temp-then-rename atomicity
// idiom is the same one `runner-common/src/config_store.rs` uses to persist
// settings without risking a torn write.

pub mod disk;
pub mod noop;
pub mod streaming;

use async_trait::async_trait;
use batchexec_common::errors::CacheCorruptionError;
use batchexec_common::model::{AfterStepResult, Step};
use serde::Serialize;
use std::collections::HashMap;

pub use disk::DiskCache;
pub use noop::NoopCache;
pub use streaming::{StreamingCache, StreamSink};

/// `Get`/`Set`/`Clear` over step results, keyed by a string produced by
/// [`cache_key_for_prefix`]. Implementations never need to know how the key
/// was derived.
#[async_trait]
pub trait ExecutionCache: Send + Sync {
    /// Look up a step result. `Ok(None)` is a clean miss; `Err` surfaces
    /// cache corruption (spec.md §7.6), which callers should treat as a
    /// miss after logging.
    async fn get_step_result(&self, slug: &str, key: &str) -> Result<Option<AfterStepResult>, CacheCorruptionError>;

    /// Persist a step result. Must be atomic with respect to readers
    /// (spec.md §3 "writes are overwriting and atomic").
    async fn set_step_result(&self, slug: &str, key: &str, result: &AfterStepResult) -> anyhow::Result<()>;

    /// Delete every entry for `slug` (spec.md §4.4 "clear-cache flag forces
    /// a full delete for every step of every task").
    async fn clear(&self, slug: &str) -> anyhow::Result<()>;
}

#[derive(Serialize)]
struct KeyInput<'a> {
    repo_id: &'a str,
    commit: &'a str,
    path: &'a str,
    working_dir: &'a str,
    steps: &'a [Step],
    resolved_envs: &'a [HashMap<String, String>],
}

/// Derive the cache key for the prefix `steps[0..=prefix_len-1]` of a task
/// (spec.md §3's Cache Key formula). `resolved_envs` must have exactly
/// `prefix_len` entries, one per included step.
pub fn cache_key_for_prefix(
    repo_id: &str,
    commit: &str,
    path: &str,
    working_dir: &str,
    steps: &[Step],
    resolved_envs: &[HashMap<String, String>],
) -> anyhow::Result<String> {
    let input = KeyInput { repo_id, commit, path, working_dir, steps, resolved_envs };
    batchexec_common::hashing::cache_key(&input)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_step(index: usize) -> Step {
        Step {
            index,
            image: "alpine:3".to_string(),
            run: "echo hi".to_string(),
            if_condition: None,
            env: HashMap::new(),
            in_glob: None,
            mounts: vec![],
            outputs: HashMap::new(),
        }
    }

    #[test]
    fn key_is_deterministic_and_ignores_unrelated_env() {
        let steps = vec![sample_step(0)];
        let envs = vec![HashMap::new()];
        let k1 = cache_key_for_prefix("r1", "abc", "", "/work", &steps, &envs).unwrap();
        let k2 = cache_key_for_prefix("r1", "abc", "", "/work", &steps, &envs).unwrap();
        assert_eq!(k1, k2);
    }

    #[test]
    fn key_changes_when_resolved_env_changes() {
        let steps = vec![sample_step(0)];
        let mut env_a = HashMap::new();
        env_a.insert("FOO".to_string(), "bar".to_string());
        let k1 = cache_key_for_prefix("r1", "abc", "", "/work", &steps, &[env_a]).unwrap();
        let k2 = cache_key_for_prefix("r1", "abc", "", "/work", &steps, &[HashMap::new()]).unwrap();
        assert_ne!(k1, k2);
    }
}
