//! Historical data import
//!
//! Converts logs of the previous point-of-sale system into ledger text that
//! can be committed next to the live ledger.

/// Legacy point-of-sale log converter
pub mod spacebar;

pub use spacebar::{EntryKind, SpacebarImporter, parse_log};

use crate::config::AccountNames;
use crate::ledger::printer::print_entries;

/// Errors raised while converting a legacy log
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
	#[error("Failed to parse log: {0}")]
	Json(#[from] serde_json::Error),

	#[error("Invalid record on line {line}: {message}")]
	InvalidRecord { line: usize, message: String },

	#[error("Invalid number: {0}")]
	InvalidNumber(String),
}

/// Convert a whole legacy log into ledger text.
pub fn convert_log(
	text: &str,
	accounts: AccountNames,
	keep_open: impl IntoIterator<Item = String>,
) -> Result<String, ImportError> {
	let mut importer = SpacebarImporter::new(accounts).with_keep_open(keep_open);
	importer.process_log(text)?;
	let entries = importer.finish();
	Ok(print_entries(&entries))
}
