// Core data model (spec.md §3): Repository, Step, Task, AfterStepResult,
// TaskResult and the changeset-template attributes carried alongside a
// Task. Shared by `batchexec-engine` (Step Runner, Execution Cache) and
// `batchexec-coordinator` (task splitting, Changeset Spec Builder) — lives
// here, below both, to avoid a dependency cycle between them.

use serde::{Deserialize, Serialize};
use sha2::Digest;
use std::collections::HashMap;

/// A matched repository at a specific resolved commit. Immutable input
/// (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Repository {
    pub id: String,
    pub name: String,
    pub default_branch: String,
    pub commit: String,
}

/// Files added/modified/deleted/renamed since a workspace's baseline
/// commit (spec.md §4.2 `Changes`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangedFiles {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
    pub renamed: Vec<String>,
}

impl ChangedFiles {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.modified.is_empty()
            && self.deleted.is_empty()
            && self.renamed.is_empty()
    }
}

/// A host-path → container-path mount entry declared on a step (spec.md
/// §3, §4.3.6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Mount {
    pub path: String,
    pub mount_path: String,
}

/// How an output's rendered template string is parsed before being merged
/// into the task's outputs map (spec.md §4.3.10).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Raw,
    Yaml,
    Json,
}

/// One entry of a step's `outputs` map (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutputSpec {
    pub value_template: String,
    pub format: OutputFormat,
}

/// One ordered step of a task (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub index: usize,
    pub image: String,
    pub run: String,
    pub if_condition: Option<String>,
    pub env: HashMap<String, String>,
    pub in_glob: Option<String>,
    pub mounts: Vec<Mount>,
    pub outputs: HashMap<String, OutputSpec>,
}

/// Commit author identity used both for the workspace's fixed baseline
/// identity and for a rendered changeset commit (spec.md §4.2, §4.7).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitAuthor {
    pub name: String,
    pub email: String,
}

/// Templates rendered against the `ChangesetTemplateContext` once a task's
/// final diff is known (spec.md §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangesetTemplate {
    pub title: String,
    pub body: String,
    pub branch: String,
    pub commit_message: String,
    pub author: CommitAuthor,
    pub published: String,
}

/// One `transformChanges.group` entry: files under `directory` are split
/// into their own ChangesetSpec on `branch`, optionally scoped to a
/// specific repository (spec.md §4.7).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransformChangesGroup {
    pub directory: String,
    pub branch: String,
    pub repository: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TransformChanges {
    pub group: Vec<TransformChangesGroup>,
}

/// Batch-change-level attributes, templated into every task's changeset
/// (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchChangeAttrs {
    pub name: String,
    pub description: String,
}

/// An `importChangesets` entry: a repository whose existing changesets
/// (by external ID) should be attached to this batch change without
/// running any steps (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportChangeset {
    pub repository: String,
    pub external_ids: Vec<String>,
}

/// One (Repository, sub-path, steps, batch-change attributes) unit of
/// parallelism (spec.md §3). A task's cache identity is derived from a
/// prefix of `steps` plus the resolved environment for each included step
/// — see `batchexec_common::hashing::cache_key`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub repository: Repository,
    pub path: String,
    pub only_fetch_workspace: bool,
    pub steps: Vec<Step>,
    pub batch_change: BatchChangeAttrs,
    pub changeset_template: ChangesetTemplate,
    pub transform_changes: TransformChanges,
}

impl Task {
    /// Filesystem-sharding slug: `<repo-name-with-/→->-<commit>[-<hash(path)>]`
    /// (spec.md §6's cache file layout).
    pub fn slug(&self) -> String {
        let repo_part = self.repository.name.replace('/', "-");
        if self.path.is_empty() {
            format!("{repo_part}-{}", self.repository.commit)
        } else {
            let digest = sha2::Sha256::digest(self.path.as_bytes());
            let path_hash = crate::hashing::base64_url(&digest);
            let path_hash: String = path_hash.chars().take(32).collect();
            format!("{repo_part}-{}-{path_hash}", self.repository.commit)
        }
    }

    pub fn step_images(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.image.clone()).collect()
    }
}

/// Result of running (or skipping) one step; immutable once written
/// (spec.md §3). Cached verbatim by the Execution Cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AfterStepResult {
    pub step_index: usize,
    pub diff: Vec<u8>,
    pub changed_files: ChangedFiles,
    pub outputs: HashMap<String, serde_json::Value>,
    pub stdout: String,
    pub stderr: String,
    pub skipped: bool,
    pub exit_code: Option<i32>,
    /// The step's environment after `${{ … }}` rendering — what the cache
    /// key for this step's prefix was actually derived from (spec.md §4.4),
    /// as distinct from the raw, unrendered `Step::env` template map.
    pub resolved_env: HashMap<String, String>,
}

impl AfterStepResult {
    pub fn is_empty_diff(&self) -> bool {
        self.diff.is_empty()
    }
}

/// The outcome of running every step of one task (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_slug: String,
    pub step_results: Vec<AfterStepResult>,
    pub error_summary: Option<String>,
    pub outcome: crate::outcome::TaskOutcome,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn sample_task() -> Task {
        Task {
            repository: Repository {
                id: "1".into(),
                name: "org/repo".into(),
                default_branch: "main".into(),
                commit: "abc123".into(),
            },
            path: String::new(),
            only_fetch_workspace: false,
            steps: vec![],
            batch_change: BatchChangeAttrs { name: "bc".into(), description: "d".into() },
            changeset_template: ChangesetTemplate {
                title: "t".into(),
                body: "b".into(),
                branch: "batch/${{ batch_change.name }}".into(),
                commit_message: "m".into(),
                author: CommitAuthor { name: "n".into(), email: "e".into() },
                published: "false".into(),
            },
            transform_changes: TransformChanges::default(),
        }
    }

    #[test]
    fn slug_replaces_slashes_and_omits_path_hash_when_empty() {
        let task = sample_task();
        assert_eq!(task.slug(), "org-repo-abc123");
    }

    #[test]
    fn slug_includes_path_hash_when_path_set() {
        let mut task = sample_task();
        task.path = "sub/dir".into();
        let slug = task.slug();
        assert!(slug.starts_with("org-repo-abc123-"));
        assert!(slug.len() > "org-repo-abc123-".len());
    }

    #[test]
    fn slug_path_hash_is_sha256_of_path_not_raw_bytes() {
        let mut task = sample_task();
        task.path = "sub/dir".into();
        let slug = task.slug();
        let path_hash = slug.strip_prefix("org-repo-abc123-").unwrap();

        let digest = sha2::Sha256::digest(task.path.as_bytes());
        let expected: String = crate::hashing::base64_url(&digest).chars().take(32).collect();
        assert_eq!(path_hash, expected);

        let raw: String = crate::hashing::base64_url(task.path.as_bytes()).chars().take(32).collect();
        assert_ne!(path_hash, raw);
    }

    #[test]
    fn changed_files_is_empty() {
        let mut cf = ChangedFiles::default();
        assert!(cf.is_empty());
        cf.modified.push("a.txt".into());
        assert!(!cf.is_empty());
    }

    #[test]
    fn after_step_result_round_trips_json() {
        let result = AfterStepResult {
            step_index: 0,
            diff: b"diff --git a b".to_vec(),
            changed_files: ChangedFiles::default(),
            outputs: HashMap::new(),
            stdout: String::new(),
            stderr: String::new(),
            skipped: false,
            exit_code: Some(0),
            resolved_env: HashMap::new(),
        };
        let json = serde_json::to_string(&result).unwrap();
        let back: AfterStepResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back.step_index, 0);
        assert!(!back.is_empty_diff());
    }
}
