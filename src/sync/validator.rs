use crate::error::LedgerError;
use crate::ledger::{LedgerEngine, LedgerOptions, Transaction, is_within_tolerance};
use itertools::Itertools;
use std::sync::Arc;
use tracing::error;

/// Checks that a transaction balances before anything is written.
#[derive(Clone)]
pub struct TransactionValidator {
	engine: Arc<dyn LedgerEngine>,
}

impl TransactionValidator {
	pub fn new(engine: Arc<dyn LedgerEngine>) -> Self {
		Self { engine }
	}

	/// Fail with `ImbalancedTransaction` when the residual of the postings is
	/// outside the tolerance inferred from them.
	pub fn validate(
		&self,
		txn: &Transaction,
		options: &LedgerOptions,
	) -> Result<(), LedgerError> {
		let residual = self.engine.compute_residual(&txn.postings);
		let tolerances = self.engine.infer_tolerances(&txn.postings, options);
		if is_within_tolerance(&residual, &tolerances) {
			return Ok(());
		}

		let residual = residual
			.iter()
			.filter(|(_, number)| !number.is_zero())
			.map(|(currency, number)| format!("{} {}", number, currency))
			.join(", ");
		error!(
			"Refusing imbalanced transaction \"{}\": residual {}",
			txn.narration, residual
		);
		Err(LedgerError::ImbalancedTransaction { residual })
	}
}
