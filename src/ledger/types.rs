//! Types for the plain-text ledger: entries, postings and amounts

use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Metadata attached to a directive, kept in key order so printing is stable.
pub type Meta = BTreeMap<String, String>;

/// A number paired with the currency (commodity) it is denominated in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Amount {
	pub number: Decimal,
	pub currency: String,
}

impl Amount {
	pub fn new(number: Decimal, currency: impl Into<String>) -> Self {
		Self {
			number,
			currency: currency.into(),
		}
	}
}

impl fmt::Display for Amount {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} {}", self.number, self.currency)
	}
}

/// A single (account, signed amount) line within a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Posting {
	pub account: String,
	pub units: Amount,
}

impl Posting {
	pub fn new(account: impl Into<String>, number: Decimal, currency: impl Into<String>) -> Self {
		Self {
			account: account.into(),
			units: Amount::new(number, currency),
		}
	}
}

/// A dated, titled set of postings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
	pub date: NaiveDate,
	/// `*` for completed transactions, `!` for flagged ones
	pub flag: char,
	pub payee: Option<String>,
	pub narration: String,
	pub tags: Vec<String>,
	pub meta: Meta,
	pub postings: Vec<Posting>,
}

impl Transaction {
	pub fn new(date: NaiveDate, narration: impl Into<String>) -> Self {
		Self {
			date,
			flag: '*',
			payee: None,
			narration: narration.into(),
			tags: Vec::new(),
			meta: Meta::new(),
			postings: Vec::new(),
		}
	}

	pub fn add_posting(&mut self, account: impl Into<String>, number: Decimal, currency: &str) {
		self.postings.push(Posting::new(account, number, currency));
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Open {
	pub date: NaiveDate,
	pub account: String,
	pub currencies: Vec<String>,
	pub meta: Meta,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Close {
	pub date: NaiveDate,
	pub account: String,
	pub meta: Meta,
}

/// A balance assertion; recorded but not checked by this engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceAssertion {
	pub date: NaiveDate,
	pub account: String,
	pub amount: Amount,
	pub meta: Meta,
}

/// One parsed directive from a ledger file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
	Open(Open),
	Close(Close),
	Balance(BalanceAssertion),
	Transaction(Transaction),
	/// Any other dated directive (price, note, event, ...), kept verbatim
	Other {
		date: NaiveDate,
		directive: String,
		line: String,
	},
}

impl Entry {
	pub fn date(&self) -> NaiveDate {
		match self {
			Entry::Open(open) => open.date,
			Entry::Close(close) => close.date,
			Entry::Balance(balance) => balance.date,
			Entry::Transaction(txn) => txn.date,
			Entry::Other { date, .. } => *date,
		}
	}
}

/// Per-currency running totals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
	units: BTreeMap<String, Decimal>,
}

impl Inventory {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add(&mut self, amount: &Amount) {
		*self
			.units
			.entry(amount.currency.clone())
			.or_insert(Decimal::ZERO) += amount.number;
	}

	pub fn add_inventory(&mut self, other: &Inventory) {
		for (currency, number) in &other.units {
			*self.units.entry(currency.clone()).or_insert(Decimal::ZERO) += *number;
		}
	}

	/// Units held in `currency`; zero when the currency never appeared.
	pub fn get(&self, currency: &str) -> Decimal {
		self.units.get(currency).copied().unwrap_or(Decimal::ZERO)
	}

	pub fn iter(&self) -> impl Iterator<Item = (&String, &Decimal)> {
		self.units.iter()
	}

	pub fn is_zero(&self) -> bool {
		self.units.values().all(|n| n.is_zero())
	}
}

impl FromIterator<Amount> for Inventory {
	fn from_iter<T: IntoIterator<Item = Amount>>(iter: T) -> Self {
		let mut inventory = Inventory::new();
		for amount in iter {
			inventory.add(&amount);
		}
		inventory
	}
}

/// Global options declared with `option "key" "value"` lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerOptions {
	pub title: Option<String>,
	pub operating_currencies: Vec<String>,
	/// Scale applied to the last significant digit when inferring tolerances
	pub inferred_tolerance_multiplier: Decimal,
	/// Fallback tolerance per currency; the `*` key applies to all currencies
	pub inferred_tolerance_default: BTreeMap<String, Decimal>,
	/// Options this engine does not interpret, kept for completeness
	pub other: BTreeMap<String, String>,
}

impl Default for LedgerOptions {
	fn default() -> Self {
		Self {
			title: None,
			operating_currencies: Vec::new(),
			inferred_tolerance_multiplier: Decimal::new(5, 1),
			inferred_tolerance_default: BTreeMap::new(),
			other: BTreeMap::new(),
		}
	}
}

/// A problem found while loading, with its location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadError {
	pub file: PathBuf,
	pub line: usize,
	pub message: String,
}

impl fmt::Display for LoadError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}: {}", self.file.display(), self.line, self.message)
	}
}

/// Result of loading a ledger file and everything it includes.
#[derive(Debug, Clone, Default)]
pub struct LoadedLedger {
	pub entries: Vec<Entry>,
	pub errors: Vec<LoadError>,
	pub options: LedgerOptions,
}

/// Restricts a balance query to a subtree and a set of exact accounts.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BalanceQuery {
	/// Accounts whose immediate parent is one of these are included
	pub parents: Vec<String>,
	/// Accounts included by exact name
	pub accounts: Vec<String>,
}

impl BalanceQuery {
	pub fn matches(&self, account: &str) -> bool {
		if self.accounts.iter().any(|a| a == account) {
			return true;
		}
		match account.rsplit_once(':') {
			Some((parent, _)) => self.parents.iter().any(|p| p == parent),
			None => false,
		}
	}
}

/// One row of a balance query: an account and the sum of its postings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceRow {
	pub account: String,
	pub balance: Inventory,
}
