//! Replicated bar-tab ledger
//!
//! Keeps an in-memory account book in sync with a plain-text double-entry
//! ledger that several instances share through a git remote. Transactions
//! are appended to a per-instance shard inside a git-transaction scope and
//! retried on push conflicts; reloads pull upstream changes and rebuild the
//! book, rolling the working copy back when the new state does not load.

/// Members, products and the account book built from the ledger
pub mod book;
/// YAML configuration with environment overrides
pub mod config;
/// Core error type
pub mod error;
/// Legacy data import
pub mod import;
/// Plain-text ledger engine
pub mod ledger;
/// Replicated store abstraction and its git implementation
pub mod repo;
/// Synchronization core
pub mod sync;
/// Bar transaction construction
pub mod transaction;
/// Decimal helpers
pub mod utils;

/// In-process replicated store for tests
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use book::{AccountBook, Member, Product};
pub use config::Config;
pub use error::LedgerError;
pub use repo::{GitStore, ReplicatedStore};
pub use sync::{AppendOutcome, LedgerStore, LedgerStoreBuilder, ReloadSummary};
pub use transaction::{PendingTransaction, TransactionRequest};
