//! Ledger Synchronization Module
//!
//! This module keeps the in-memory account book consistent with the ledger
//! replicated through version control. It is composed of several submodules:
//!
//! - `store`: The `LedgerStore`, entry point for reloads and appends. It owns the writer lock and wires the other services together.
//! - `git_transaction`: The snapshot, mutate, commit, push scope every write runs in.
//! - `instance_ledger`: Claims and registers the per-process shard transactions are appended to.
//! - `validator`: Rejects transactions whose postings do not balance.
//! - `balance_update`: Applies committed postings to a copy of the book.
//! - `repositories`: Product definitions and the shared include file.
//! - `events`: Event types and handlers for observing the write path.
//! - `status`, `retry`: Synchronization state and the retry policy.

/// Post-commit balance updates
pub mod balance_update;
/// Event system for observing reloads and commits
pub mod events;
/// Git-transaction scope
pub mod git_transaction;
/// Per-process append-only shards
pub mod instance_ledger;
/// File-backed repositories
pub mod repositories;
/// Retry policy for push conflicts and name collisions
pub mod retry;
/// Synchronization state and counters
pub mod status;
/// The synchronization core
pub mod store;
/// Balance check before anything is written
pub mod validator;

pub use balance_update::BalanceUpdateService;
pub use events::{EventDispatcher, LedgerEvent, LedgerEventHandler, LoggingEventHandler};
pub use git_transaction::{GitTransaction, ScopeFailure, ScopeOutcome, ScopeState};
pub use instance_ledger::{Clock, InstanceLedger, InstanceLedgerAllocator, hostname, system_clock};
pub use repositories::{FileProductRepository, IncludeFile, ProductRepository};
pub use retry::RetryPolicy;
pub use status::SyncStatus;
pub use store::*;
pub use validator::TransactionValidator;
