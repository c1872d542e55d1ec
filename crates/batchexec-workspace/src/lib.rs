// batchexec-workspace: the Workspace abstraction (spec.md §4.2) — owns a
// working directory for one (repository, path) pair across N steps, in
// either bind-mount or named-volume form, plus the selection policy
// between them and the archive-unpack/diff-extraction helpers they share.

pub mod archive;
pub mod bind_mount;
pub mod diff;
pub mod git_command_manager;
pub mod named_volume;
pub mod selection;
pub mod workspace;

pub use archive::ArchiveRegistry;
pub use bind_mount::BindMountWorkspace;
pub use named_volume::NamedVolumeWorkspace;
pub use selection::{select_variant, WorkspaceVariant};
pub use workspace::{ChangedFiles, MountSpec, Workspace};
