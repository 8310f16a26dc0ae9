//! Types for the replicated store integration

use serde::{Deserialize, Serialize};
use std::fmt;

/// An opaque commit identifier as reported by the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Revision(pub String);

impl Revision {
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for Revision {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Errors raised by the replicated store.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
	/// The remote refused the push because it has moved ahead.
	#[error("Push rejected by remote: {0}")]
	PushRejected(String),

	/// Merging upstream changes conflicted; the merge was aborted.
	#[error("Merge conflict, merge aborted: {0}")]
	MergeConflict(String),

	#[error("Command `{command}` failed: {stderr}")]
	CommandFailed { command: String, stderr: String },

	#[error("IO error: {0}")]
	IoError(#[from] std::io::Error),
}

impl RepoError {
	pub fn is_push_rejected(&self) -> bool {
		matches!(self, RepoError::PushRejected(_))
	}
}
