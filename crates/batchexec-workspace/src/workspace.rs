// The Workspace abstraction (spec.md §4.2): a working directory owned by
// one (repository, path) pair across N steps. Two variants implement this
// trait: `BindMountWorkspace` and `NamedVolumeWorkspace`.

use async_trait::async_trait;
use batchexec_common::errors::ResourceError;

pub use batchexec_common::model::ChangedFiles;

/// Mount argument handed to the container launcher: `host_path:container_path`
/// for a bind mount, or `volume_name:container_path` for a named volume.
#[derive(Debug, Clone)]
pub struct MountSpec {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

/// Common contract implemented by both workspace variants (spec.md §4.2).
#[async_trait]
pub trait Workspace: Send + Sync {
    /// Unpack the provided archive, place additional files, `git init`,
    /// configure a fixed commit identity, and record the baseline commit.
    async fn prepare(&mut self, archive_bytes: &[u8], only_fetch_workspace: bool)
        -> Result<(), ResourceError>;

    /// Files added/modified/deleted/renamed since the baseline commit.
    async fn changes(&self) -> Result<ChangedFiles, ResourceError>;

    /// A unified-diff byte sequence relative to the baseline, binary-safe.
    /// `expect_non_empty` enforces spec.md §4.2's "empty output when
    /// change-presence was expected is an error, not silent success" —
    /// pass `true` when the caller already knows `changes()` reported a
    /// non-empty set of modified files.
    async fn diff(&self, expect_non_empty: bool) -> Result<Vec<u8>, ResourceError>;

    /// Apply a previously produced diff atop the baseline (used to seed
    /// from a cached step result). An empty `diff` is an error.
    async fn apply_diff(&mut self, diff: &[u8]) -> Result<(), ResourceError>;

    /// Reclaim all resources (directory, volume, mount).
    async fn close(&mut self) -> Result<(), ResourceError>;

    /// Mount arguments required to run a container against this workspace.
    fn mounts(&self) -> Vec<MountSpec>;

    /// Working directory to set inside the container.
    fn container_working_dir(&self) -> String;
}
