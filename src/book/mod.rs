//! In-memory projection of the ledger
//!
//! The [`AccountBook`] holds members, products and the ledger options the
//! last successful load produced. It is read-optimized and treated as an
//! immutable snapshot: the synchronization core replaces it wholesale on
//! reload and swaps in an updated copy after each committed transaction.

/// Member accounts and their derived balances
mod member;
/// Product definitions and pricing
mod product;

pub use member::*;
pub use product::*;

use crate::config::AccountNames;
use crate::error::LedgerError;
use crate::ledger::{BalanceQuery, BalanceRow, Entry, LedgerOptions};

use std::collections::{BTreeMap, HashSet};
use tracing::debug;

/// Snapshot of accounts and products.
#[derive(Debug, Clone, Default)]
pub struct AccountBook {
	/// Members by internal name
	accounts: BTreeMap<String, Member>,
	/// Ledger account to internal name
	accounts_by_ledger_id: BTreeMap<String, String>,
	/// Products by currency
	products: BTreeMap<String, Product>,
	options: LedgerOptions,
}

impl AccountBook {
	/// Assemble a book from members and products, wiring item currencies
	/// into every member.
	pub fn new(
		members: impl IntoIterator<Item = Member>,
		products: BTreeMap<String, Product>,
		options: LedgerOptions,
	) -> Self {
		let item_currencies: std::collections::BTreeSet<String> =
			products.keys().cloned().collect();
		let mut accounts = BTreeMap::new();
		let mut accounts_by_ledger_id = BTreeMap::new();
		for mut member in members {
			member.item_currencies = item_currencies.clone();
			accounts_by_ledger_id.insert(member.account.clone(), member.internal_name.clone());
			accounts.insert(member.internal_name.clone(), member);
		}
		Self {
			accounts,
			accounts_by_ledger_id,
			products,
			options,
		}
	}

	/// Build a book from loaded entries and the balance query result.
	///
	/// Members are the opened (and not later closed) accounts directly under
	/// the members parent plus the cash account. Accounts without postings
	/// load with an empty balance.
	pub fn from_ledger(
		entries: &[Entry],
		options: LedgerOptions,
		balances: Vec<BalanceRow>,
		products: BTreeMap<String, Product>,
		names: &AccountNames,
	) -> Result<Self, LedgerError> {
		let query = Self::balance_query(names);
		let closed: HashSet<&str> = entries
			.iter()
			.filter_map(|entry| match entry {
				Entry::Close(close) => Some(close.account.as_str()),
				_ => None,
			})
			.collect();

		let mut balances: BTreeMap<String, _> = balances
			.into_iter()
			.map(|row| (row.account, row.balance))
			.collect();

		let mut members = Vec::new();
		for entry in entries {
			let Entry::Open(open) = entry else {
				continue;
			};
			if !query.matches(&open.account) {
				continue;
			}
			if closed.contains(open.account.as_str()) {
				debug!("Skipping closed account {}", open.account);
				continue;
			}
			let mut member = Member::from_open(open, names)?;
			if let Some(balance) = balances.remove(&open.account) {
				member.balance = balance;
			}
			members.push(member);
		}

		Ok(Self::new(members, products, options))
	}

	/// Accounts whose balances make up the book.
	pub fn balance_query(names: &AccountNames) -> BalanceQuery {
		BalanceQuery {
			parents: vec![names.members.clone()],
			accounts: vec![names.cash.clone()],
		}
	}

	pub fn get_member(&self, internal_name: &str) -> Result<&Member, LedgerError> {
		self.accounts
			.get(internal_name)
			.ok_or_else(|| LedgerError::not_found("member", internal_name))
	}

	/// Look a product up by currency, falling back to its name.
	pub fn get_product(&self, key: &str) -> Result<&Product, LedgerError> {
		self.products
			.get(key)
			.or_else(|| self.products.values().find(|p| p.name == key))
			.ok_or_else(|| LedgerError::not_found("product", key))
	}

	pub fn member_by_account(&self, account: &str) -> Option<&Member> {
		self.accounts_by_ledger_id
			.get(account)
			.and_then(|name| self.accounts.get(name))
	}

	pub(crate) fn member_by_account_mut(&mut self, account: &str) -> Option<&mut Member> {
		let name = self.accounts_by_ledger_id.get(account)?;
		self.accounts.get_mut(name)
	}

	pub fn contains_account(&self, account: &str) -> bool {
		self.accounts_by_ledger_id.contains_key(account)
	}

	pub fn list_accounts(&self) -> impl Iterator<Item = &Member> {
		self.accounts.values()
	}

	pub fn list_products(&self) -> impl Iterator<Item = &Product> {
		self.products.values()
	}

	pub fn options(&self) -> &LedgerOptions {
		&self.options
	}

	/// Account listing as sent to clients, keyed by internal name.
	pub fn accounts_view(&self) -> BTreeMap<String, MemberView> {
		self.accounts
			.iter()
			.map(|(name, member)| (name.clone(), member.view()))
			.collect()
	}

	/// Visible products as sent to clients, keyed by currency.
	pub fn products_view(&self) -> BTreeMap<String, ProductView> {
		self.products
			.iter()
			.filter(|(_, product)| product.visible)
			.map(|(currency, product)| (currency.clone(), product.view()))
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ledger::parser::parse_str;
	use crate::ledger::{LedgerEngine, PlainTextEngine};
	use rust_decimal_macros::dec;
	use std::path::Path;

	const LEDGER: &str = r#"
1970-01-01 open Assets:Cash:Bar
1970-01-01 open Liabilities:Bar:Members:Alice
  display_name: "Alice A."
1970-01-01 open Liabilities:Bar:Members:Bob
1970-01-01 open Liabilities:Bar:Members:Carol
1970-01-01 open Income:Bar

2024-01-01 * "Alice deposits"
  Liabilities:Bar:Members:Alice  -20.00 EUR
  Assets:Cash:Bar  20.00 EUR

2024-01-02 * "Alice buys"
  Liabilities:Bar:Members:Alice  3 CM
  Assets:Bar:Inventory  -3 CM
  Liabilities:Bar:Members:Alice  4.50 EUR
  Income:Bar  -4.50 EUR

2024-02-01 close Liabilities:Bar:Members:Carol
"#;

	fn book() -> AccountBook {
		let parsed = parse_str(LEDGER, Path::new("test.beancount"));
		assert!(parsed.errors.is_empty(), "{:?}", parsed.errors);
		let names = AccountNames::default();
		let options = LedgerOptions::default();
		let rows = PlainTextEngine::new().query(
			&parsed.entries,
			&options,
			&AccountBook::balance_query(&names),
		);
		let products = build_products(
			serde_yaml::from_str("- {name: Club Mate, currency: CM, price: 1.5}\n").unwrap(),
			false,
		)
		.unwrap();
		AccountBook::from_ledger(&parsed.entries, options, rows, products, &names).unwrap()
	}

	#[test]
	fn test_from_ledger() {
		let book = book();
		let names: Vec<&str> = book.list_accounts().map(|m| m.internal_name.as_str()).collect();
		assert_eq!(names, vec![CASH_INTERNAL_NAME, "Alice", "Bob"]);

		let alice = book.get_member("Alice").unwrap();
		assert_eq!(alice.display_name, "Alice A.");
		assert_eq!(alice.balance_eur(), dec!(15.50));
		assert_eq!(alice.item_count(), dec!(3));

		let cash = book.member_by_account("Assets:Cash:Bar").unwrap();
		assert_eq!(cash.balance_eur(), dec!(-20.00));

		let bob = book.get_member("Bob").unwrap();
		assert_eq!(bob.balance_eur(), dec!(0.00));
	}

	#[test]
	fn test_lookups() {
		let book = book();
		assert!(book.get_member("Carol").unwrap_err().is_not_found());
		assert_eq!(book.get_product("CM").unwrap().name, "Club Mate");
		assert_eq!(book.get_product("Club Mate").unwrap().currency, "CM");
		assert!(book.get_product("BEER").unwrap_err().is_not_found());
	}

	#[test]
	fn test_views() {
		let book = book();
		let accounts = serde_json::to_value(book.accounts_view()).unwrap();
		assert_eq!(accounts["Alice"]["balance"], "15.50");
		assert_eq!(accounts["Alice"]["items"], 3);
		let products = serde_json::to_value(book.products_view()).unwrap();
		assert_eq!(products["CM"]["price"], "1.50");
	}
}
