use crate::repo::RepoError;
use crate::transaction::TransactionError;

/// Boxed error kept as the cause of an `UpdateFailed`.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by the ledger synchronization core
#[allow(clippy::enum_variant_names)]
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
	/// Postings do not sum to zero within tolerance. Never reaches storage.
	#[error("Imbalanced transaction, residual {residual}")]
	ImbalancedTransaction { residual: String },

	/// Reloading failed; the working copy was rolled back where possible.
	#[error("Update failed: {message}")]
	UpdateFailed {
		message: String,
		#[source]
		source: Option<BoxError>,
	},

	/// The remote moved ahead while publishing.
	#[error("Push conflict: {0}")]
	PushConflict(String),

	/// Another instance claimed the same instance ledger name.
	#[error("Instance ledger name already taken: {0}")]
	AllocationRace(String),

	#[error("Unknown {kind}: {key}")]
	NotFound { kind: &'static str, key: String },

	/// A bounded retry policy gave up on push conflicts.
	#[error("Gave up after {attempts} push attempts")]
	RetriesExhausted { attempts: u32 },

	#[error("Product error: {0}")]
	ProductError(String),

	#[error("Repository error: {0}")]
	RepoError(#[from] RepoError),

	#[error("Transaction error: {0}")]
	TransactionError(#[from] TransactionError),

	#[error("IO error: {0}")]
	IoError(#[from] std::io::Error),
}

impl LedgerError {
	/// An `UpdateFailed` without an underlying cause.
	pub fn update_failed(message: impl Into<String>) -> Self {
		LedgerError::UpdateFailed {
			message: message.into(),
			source: None,
		}
	}

	/// An `UpdateFailed` wrapping the error that caused it.
	pub fn update_failed_with(
		message: impl Into<String>,
		source: impl Into<BoxError>,
	) -> Self {
		LedgerError::UpdateFailed {
			message: message.into(),
			source: Some(source.into()),
		}
	}

	pub fn not_found(kind: &'static str, key: impl Into<String>) -> Self {
		LedgerError::NotFound {
			kind,
			key: key.into(),
		}
	}

	/// True for the client-facing "unknown member or product" condition.
	pub fn is_not_found(&self) -> bool {
		matches!(self, LedgerError::NotFound { .. })
	}

	/// True when the error signals that the remote moved ahead.
	pub fn is_push_conflict(&self) -> bool {
		match self {
			LedgerError::PushConflict(_) => true,
			LedgerError::RepoError(e) => e.is_push_rejected(),
			_ => false,
		}
	}
}
