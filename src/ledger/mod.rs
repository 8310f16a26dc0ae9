//! Plain-text double-entry ledger support
//!
//! This module provides the engine used by the synchronization core to read the
//! replicated ledger, print new transactions into it and aggregate balances.

/// Engine trait and the plain-text implementation
pub mod engine;
/// Line-oriented reader
pub mod parser;
/// Ledger text rendering
pub mod printer;
/// Entry, posting and amount types
pub mod types;

pub use engine::{LedgerEngine, PlainTextEngine, is_within_tolerance};
pub use types::*;
