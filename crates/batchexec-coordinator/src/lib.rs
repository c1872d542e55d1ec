// batchexec-coordinator: the Coordinator (C6) and Changeset Spec Builder
// (C7) — cache-aware task splitting, driving `batchexec_engine::TaskExecutor`,
// and assembling the ChangesetSpec list a caller turns into pull requests or
// imported-changeset attachments (spec.md §4.6/§4.7).

pub mod changeset;
pub mod coordinator;

pub use changeset::{ChangesetSpec, Commit, ExternalChangeset};
pub use coordinator::Coordinator;
