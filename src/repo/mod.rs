//! Replicated store integration
//!
//! The ledger lives in a version-controlled working copy shared with other
//! instances through a common remote. This module exposes the replication
//! primitives the synchronization core needs and nothing more: it knows
//! about revisions, staging, commits and pushes, never about ledger entries.

/// Git working copy driven through child processes
mod git;
/// Shared types and the replication error enum
mod types;

pub use git::{GitStore, classify_push_failure};
pub use types::*;

use async_trait::async_trait;
use std::path::Path;

/// Replication primitives over a working copy.
///
/// Every path handed to the store is relative to [`ReplicatedStore::workdir`].
#[async_trait]
pub trait ReplicatedStore: Send + Sync {
	/// Root directory of the working copy.
	fn workdir(&self) -> &Path;

	/// Fetch and merge upstream changes.
	///
	/// A merge that cannot be resolved automatically is aborted before
	/// returning [`RepoError::MergeConflict`], so the working copy is left at
	/// its previous revision.
	async fn pull(&self) -> Result<(), RepoError>;

	/// Commit everything that is staged. Returns `false` when there was
	/// nothing to commit.
	async fn commit_all(&self, message: &str) -> Result<bool, RepoError>;

	/// Publish local commits. A remote that moved ahead is reported as
	/// [`RepoError::PushRejected`].
	async fn push(&self) -> Result<(), RepoError>;

	/// Discard all local changes and move the working copy to `revision`.
	async fn reset_hard(&self, revision: &Revision) -> Result<(), RepoError>;

	/// Stage a file for the next commit.
	async fn stage(&self, path: &Path) -> Result<(), RepoError>;

	/// Current HEAD revision.
	async fn rev_parse_head(&self) -> Result<Revision, RepoError>;
}
