/// Transaction builder module for constructing bar transactions
pub mod builder;

pub use builder::{
	PendingTransaction, TransactionBuilder, TransactionError, TransactionKind, TransactionRequest,
};

/// Currency of all monetary postings.
pub const EUR: &str = "EUR";
