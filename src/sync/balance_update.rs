//! Balance update service for committed transactions.
//!
//! After a transaction is durably committed its posting deltas are applied to
//! the members they touch. The book is never edited in place: the service
//! produces an updated copy so readers holding the previous snapshot keep a
//! consistent view.

use crate::book::{AccountBook, Member};
use crate::error::LedgerError;
use crate::ledger::Transaction;

use tracing::debug;

/// Applies posting deltas to member balances.
#[derive(Debug, Clone, Default)]
pub struct BalanceUpdateService;

impl BalanceUpdateService {
    pub fn new() -> Self {
        Self
    }

    /// Return a copy of `book` with the postings of `txn` applied, and the
    /// members whose balance changed, in posting order.
    pub fn apply(&self, book: &AccountBook, txn: &Transaction) -> (AccountBook, Vec<Member>) {
        let mut updated = book.clone();
        let mut changed: Vec<String> = Vec::new();

        for posting in &txn.postings {
            let Some(member) = updated.member_by_account_mut(&posting.account) else {
                continue;
            };
            member.balance.add(&posting.units);
            if !changed.contains(&posting.account) {
                changed.push(posting.account.clone());
            }
        }

        let members: Vec<Member> = changed
            .iter()
            .filter_map(|account| updated.member_by_account(account).cloned())
            .collect();
        debug!(
            "Applied {} postings, {} members changed",
            txn.postings.len(),
            members.len()
        );
        (updated, members)
    }

    /// Check that every member account the transaction books against still
    /// exists in `book`.
    ///
    /// Used before retrying an append against a freshly reloaded book, where
    /// an account may have been closed upstream in the meantime.
    pub fn ensure_accounts_exist(
        &self,
        book: &AccountBook,
        txn: &Transaction,
        is_member_account: impl Fn(&str) -> bool,
    ) -> Result<(), LedgerError> {
        match txn
            .postings
            .iter()
            .find(|p| is_member_account(&p.account) && !book.contains_account(&p.account))
        {
            Some(posting) => Err(LedgerError::not_found("account", posting.account.clone())),
            None => Ok(()),
        }
    }
}
