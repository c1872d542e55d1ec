// Engine configuration, grounded on `runner-common/src/config_store.rs`'s
// settings-struct shape but repurposed entirely: there is no credential
// store or server registration here (auth is out of scope per spec.md §1),
// just the handful of knobs that govern a single engine run.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// What happens to the rest of the batch when one task fails
/// (spec.md §4.6 "fail-fast vs. skip-errors").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailurePolicy {
    /// Cancel all still-pending and in-flight tasks as soon as one fails.
    FailFast,
    /// Let every other task run to completion; report failures at the end.
    SkipErrors,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        FailurePolicy::SkipErrors
    }
}

/// Top-level engine configuration, built once at startup and shared
/// read-only across the Coordinator, Task Executor and Step Runner
/// (spec.md §9 "Global state").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root of the content-addressed execution cache (spec.md §4.4).
    pub cache_dir: PathBuf,

    /// Root under which per-task workspaces and logs are created
    /// (spec.md §4.2, §4.3).
    pub temp_dir: PathBuf,

    /// Maximum number of tasks executing concurrently (spec.md §4.5
    /// "Task Executor ... bounded worker pool").
    pub parallelism: usize,

    /// Wall-clock budget applied to each task unless overridden per-step
    /// (spec.md §4.3.8).
    #[serde(with = "duration_secs")]
    pub default_step_timeout: Duration,

    /// Fail-fast or skip-errors (spec.md §4.6).
    pub failure_policy: FailurePolicy,

    /// Delete all cache entries before starting the run (spec.md §4.4
    /// "Clearing the cache").
    pub clear_cache: bool,

    /// Directory the batch spec was loaded from. A step's declared mounts
    /// (spec.md §4.3.6) must resolve to host paths inside this directory.
    pub batch_spec_dir: PathBuf,

    /// True when the engine is executing against a remote backend with no
    /// shared host filesystem, in which case step-declared mounts are
    /// rejected outright (spec.md §4.3's step 6).
    pub remote_execution: bool,
}

impl EngineConfig {
    pub fn new(cache_dir: PathBuf, temp_dir: PathBuf) -> Self {
        Self {
            batch_spec_dir: temp_dir.clone(),
            cache_dir,
            temp_dir,
            parallelism: default_parallelism(),
            default_step_timeout: Duration::from_secs(60 * 30),
            failure_policy: FailurePolicy::default(),
            clear_cache: false,
            remote_execution: false,
        }
    }

    pub fn cache_entries_dir(&self) -> PathBuf {
        self.cache_dir.join(crate::constants::path::CACHE_ENTRIES_DIRECTORY)
    }

    pub fn workspaces_dir(&self) -> PathBuf {
        self.temp_dir.join(crate::constants::path::WORKSPACES_DIRECTORY)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.temp_dir.join(crate::constants::path::LOGS_DIRECTORY)
    }
}

/// Matches the number of available CPUs, mirroring the teacher's
/// `Environment.ProcessorCount`-based worker defaults.
fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_skip_errors() {
        assert_eq!(FailurePolicy::default(), FailurePolicy::SkipErrors);
    }

    #[test]
    fn derived_paths_nest_under_roots() {
        let cfg = EngineConfig::new(PathBuf::from("/tmp/cache"), PathBuf::from("/tmp/work"));
        assert_eq!(cfg.cache_entries_dir(), PathBuf::from("/tmp/cache/entries"));
        assert_eq!(cfg.workspaces_dir(), PathBuf::from("/tmp/work/workspaces"));
        assert_eq!(cfg.logs_dir(), PathBuf::from("/tmp/work/logs"));
    }

    #[test]
    fn round_trips_through_json() {
        let cfg = EngineConfig::new(PathBuf::from("/c"), PathBuf::from("/t"));
        let json = serde_json::to_string(&cfg).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.parallelism, cfg.parallelism);
        assert_eq!(back.default_step_timeout, cfg.default_step_timeout);
    }
}
