//! Bar transaction builder
//!
//! Turns a request (purchase, transfer or deposit) into a balanced ledger
//! transaction against the current account book. Construction is pure: no
//! I/O happens here and nothing is written until the synchronization core
//! appends the result.

use crate::book::{AccountBook, Member};
use crate::config::AccountNames;
use crate::error::LedgerError;
use crate::ledger::Transaction;
use crate::transaction::EUR;
use crate::utils::quantize_money;

use chrono::{DateTime, Utc};
use itertools::Itertools;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
	#[error("Invalid amount: {0}")]
	InvalidAmount(String),

	#[error("Invalid quantity {quantity} for product {product}")]
	InvalidQuantity { product: String, quantity: Decimal },

	#[error("A purchase needs at least one product")]
	EmptyPurchase,

	#[error("Payer and payee are the same account: {0}")]
	SameAccount(String),

	#[error("Builder is missing {0}")]
	MissingField(&'static str),
}

/// The closed set of transaction shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionKind {
	Purchase,
	Transfer,
	Deposit,
}

impl TransactionKind {
	/// Value of the `type` metadata field.
	pub fn as_str(&self) -> &'static str {
		match self {
			TransactionKind::Purchase => "purchase",
			TransactionKind::Transfer => "transfer",
			TransactionKind::Deposit => "deposit",
		}
	}
}

impl fmt::Display for TransactionKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// What a client asked for, by member internal name and product key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionRequest {
	Purchase {
		buyer: String,
		/// Product key (currency or name) and quantity
		items: Vec<(String, Decimal)>,
	},
	Transfer {
		payer: String,
		payee: String,
		amount: Decimal,
	},
	Deposit {
		member: String,
		amount: Decimal,
	},
}

impl TransactionRequest {
	pub fn kind(&self) -> TransactionKind {
		match self {
			TransactionRequest::Purchase { .. } => TransactionKind::Purchase,
			TransactionRequest::Transfer { .. } => TransactionKind::Transfer,
			TransactionRequest::Deposit { .. } => TransactionKind::Deposit,
		}
	}
}

/// A balanced transaction ready to be appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTransaction {
	pub kind: TransactionKind,
	/// Ledger account whose new balance is reported back to the client
	pub primary_account: Option<String>,
	pub transaction: Transaction,
}

impl PendingTransaction {
	pub fn narration(&self) -> &str {
		&self.transaction.narration
	}
}

/// Builder for bar transactions
pub struct TransactionBuilder<'a> {
	/// Book the member and product keys are resolved against
	book: Option<&'a AccountBook>,
	/// Fixed accounts used for cash, income and inventory
	accounts: AccountNames,
	/// Defaults to the time of `build`
	timestamp: Option<DateTime<Utc>>,
	request: Option<TransactionRequest>,
}

impl<'a> TransactionBuilder<'a> {
	/// Creates a new transaction builder
	pub fn new() -> Self {
		Self {
			book: None,
			accounts: AccountNames::default(),
			timestamp: None,
			request: None,
		}
	}

	/// Sets the account book
	pub fn with_book(mut self, book: &'a AccountBook) -> Self {
		self.book = Some(book);
		self
	}

	/// Sets the fixed account names
	pub fn with_accounts(mut self, accounts: AccountNames) -> Self {
		self.accounts = accounts;
		self
	}

	/// Sets the transaction time
	pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
		self.timestamp = Some(timestamp);
		self
	}

	/// Sets the request to build
	pub fn with_request(mut self, request: TransactionRequest) -> Self {
		self.request = Some(request);
		self
	}

	/// Builds the balanced transaction.
	///
	/// Unknown members or products fail with `NotFound`; invalid amounts
	/// and quantities fail with a [`TransactionError`].
	pub fn build(self) -> Result<PendingTransaction, LedgerError> {
		let book = self.book.ok_or(TransactionError::MissingField("book"))?;
		let request = self
			.request
			.clone()
			.ok_or(TransactionError::MissingField("request"))?;
		let timestamp = self.timestamp.unwrap_or_else(Utc::now);

		let mut pending = match request {
			TransactionRequest::Purchase { buyer, items } => {
				self.purchase(book, book.get_member(&buyer)?, &items, timestamp)?
			}
			TransactionRequest::Transfer {
				payer,
				payee,
				amount,
			} => self.transfer(
				book.get_member(&payer)?,
				book.get_member(&payee)?,
				amount,
				timestamp,
			)?,
			TransactionRequest::Deposit { member, amount } => {
				self.deposit(book.get_member(&member)?, amount, timestamp)?
			}
		};

		let meta = &mut pending.transaction.meta;
		meta.insert(
			"timestamp".to_string(),
			timestamp.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
		);
		meta.insert("type".to_string(), pending.kind.as_str().to_string());
		tracing::debug!(
			"Built {} transaction with {} postings",
			pending.kind,
			pending.transaction.postings.len()
		);
		Ok(pending)
	}

	fn purchase(
		&self,
		book: &AccountBook,
		buyer: &Member,
		items: &[(String, Decimal)],
		timestamp: DateTime<Utc>,
	) -> Result<PendingTransaction, LedgerError> {
		if items.is_empty() {
			return Err(TransactionError::EmptyPurchase.into());
		}

		// Quantities per product currency, in request order of first sight.
		let mut quantities: Vec<(&crate::book::Product, Decimal)> = Vec::new();
		for (key, quantity) in items {
			let product = book.get_product(key)?;
			if *quantity <= Decimal::ZERO {
				return Err(TransactionError::InvalidQuantity {
					product: product.name.clone(),
					quantity: *quantity,
				}
				.into());
			}
			match quantities
				.iter_mut()
				.find(|(p, _)| p.currency == product.currency)
			{
				Some((_, total)) => *total += *quantity,
				None => quantities.push((product, *quantity)),
			}
		}

		let mut charge = Decimal::ZERO;
		let mut paybacks: BTreeMap<&str, Decimal> = BTreeMap::new();
		let mut txn = Transaction::new(
			timestamp.date_naive(),
			format!(
				"{} bought {}",
				buyer.display_name,
				quantities
					.iter()
					.map(|(product, quantity)| format!("{} {}", quantity.normalize(), product.name))
					.join(", ")
			),
		);

		for (product, quantity) in &quantities {
			txn.add_posting(&self.accounts.inventory, -*quantity, &product.currency);
			txn.add_posting(&buyer.account, *quantity, &product.currency);
			charge += product.price_for(buyer.is_paying_member) * *quantity;
			if let Some(payback) = &product.payback {
				*paybacks.entry(payback.account.as_str()).or_default() +=
					payback.amount * *quantity;
			}
		}

		let charge = quantize_money(charge);
		txn.add_posting(&buyer.account, charge, EUR);
		let mut paid_back = Decimal::ZERO;
		for (account, amount) in paybacks {
			let amount = quantize_money(amount);
			paid_back += amount;
			txn.add_posting(account, -amount, EUR);
		}
		txn.add_posting(&self.accounts.income, -(charge - paid_back), EUR);

		Ok(PendingTransaction {
			kind: TransactionKind::Purchase,
			primary_account: Some(buyer.account.clone()),
			transaction: txn,
		})
	}

	fn transfer(
		&self,
		payer: &Member,
		payee: &Member,
		amount: Decimal,
		timestamp: DateTime<Utc>,
	) -> Result<PendingTransaction, LedgerError> {
		if payer.account == payee.account {
			return Err(TransactionError::SameAccount(payer.account.clone()).into());
		}
		let amount = positive_money(amount)?;
		let mut txn = Transaction::new(
			timestamp.date_naive(),
			format!(
				"{} transferred €{} to {}",
				payer.display_name, amount, payee.display_name
			),
		);
		txn.add_posting(&payer.account, amount, EUR);
		txn.add_posting(&payee.account, -amount, EUR);

		Ok(PendingTransaction {
			kind: TransactionKind::Transfer,
			primary_account: Some(payer.account.clone()),
			transaction: txn,
		})
	}

	fn deposit(
		&self,
		member: &Member,
		amount: Decimal,
		timestamp: DateTime<Utc>,
	) -> Result<PendingTransaction, LedgerError> {
		if member.account == self.accounts.cash {
			return Err(TransactionError::SameAccount(member.account.clone()).into());
		}
		let amount = positive_money(amount)?;
		let mut txn = Transaction::new(
			timestamp.date_naive(),
			format!("{} deposited €{}", member.display_name, amount),
		);
		txn.add_posting(&member.account, amount, EUR);
		txn.add_posting(&self.accounts.cash, -amount, EUR);

		Ok(PendingTransaction {
			kind: TransactionKind::Deposit,
			primary_account: Some(member.account.clone()),
			transaction: txn,
		})
	}
}

impl Default for TransactionBuilder<'_> {
	fn default() -> Self {
		Self::new()
	}
}

fn positive_money(amount: Decimal) -> Result<Decimal, TransactionError> {
	let amount = quantize_money(amount);
	if amount <= Decimal::ZERO {
		return Err(TransactionError::InvalidAmount(format!(
			"{} must be positive",
			amount
		)));
	}
	Ok(amount)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::book::{Member, build_products};
	use crate::ledger::{LedgerOptions, Open, Posting};
	use chrono::{NaiveDate, TimeZone};
	use rust_decimal_macros::dec;

	const PRODUCTS: &str = r#"
- {name: Club Mate, currency: CM, price: 1.50, paying_member_price: 1.20}
- {name: Sticker, currency: STICKER, price: 1.00, payback: {account: "Liabilities:Bar:Members:Carol", amount: 0.20}}
- {name: Tea, currency: TEA, price: 0.35}
"#;

	fn member(name: &str, paying: bool) -> Member {
		let mut open = Open {
			date: NaiveDate::from_ymd_opt(1970, 1, 1).unwrap(),
			account: if name == "cash" {
				"Assets:Cash:Bar".to_string()
			} else {
				format!("Liabilities:Bar:Members:{}", name)
			},
			currencies: vec![],
			meta: Default::default(),
		};
		if paying {
			open.meta.insert("paying_member".into(), "TRUE".into());
		}
		Member::from_open(&open, &AccountNames::default()).unwrap()
	}

	fn book() -> AccountBook {
		AccountBook::new(
			vec![
				member("Alice", false),
				member("Bob", false),
				member("Carol", false),
				member("Dave", true),
				member("cash", false),
			],
			build_products(serde_yaml::from_str(PRODUCTS).unwrap(), false).unwrap(),
			LedgerOptions::default(),
		)
	}

	fn build(book: &AccountBook, request: TransactionRequest) -> Result<PendingTransaction, LedgerError> {
		TransactionBuilder::new()
			.with_book(book)
			.with_timestamp(Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap())
			.with_request(request)
			.build()
	}

	fn sum(postings: &[Posting], currency: &str) -> Decimal {
		postings
			.iter()
			.filter(|p| p.units.currency == currency)
			.map(|p| p.units.number)
			.sum()
	}

	fn amount_of(postings: &[Posting], account: &str, currency: &str) -> Decimal {
		postings
			.iter()
			.filter(|p| p.account == account && p.units.currency == currency)
			.map(|p| p.units.number)
			.sum()
	}

	fn purchase(buyer: &str, items: &[(&str, Decimal)]) -> TransactionRequest {
		TransactionRequest::Purchase {
			buyer: buyer.to_string(),
			items: items.iter().map(|(k, q)| (k.to_string(), *q)).collect(),
		}
	}

	#[test]
	fn test_purchase_without_payback() {
		let book = book();
		let pending = build(&book, purchase("Alice", &[("CM", dec!(2))])).unwrap();
		let postings = &pending.transaction.postings;

		assert_eq!(pending.kind, TransactionKind::Purchase);
		assert_eq!(pending.primary_account.as_deref(), Some("Liabilities:Bar:Members:Alice"));
		// Buyer is charged 3.00 (client balance drops by 3.00)
		assert_eq!(amount_of(postings, "Liabilities:Bar:Members:Alice", EUR), dec!(3.00));
		assert_eq!(amount_of(postings, "Income:Bar", EUR), dec!(-3.00));
		assert_eq!(amount_of(postings, "Liabilities:Bar:Members:Alice", "CM"), dec!(2));
		assert_eq!(amount_of(postings, "Assets:Bar:Inventory", "CM"), dec!(-2));
		assert_eq!(sum(postings, "CM"), Decimal::ZERO);
		assert_eq!(sum(postings, EUR), Decimal::ZERO);

		let meta = &pending.transaction.meta;
		assert_eq!(meta["type"], "purchase");
		assert_eq!(meta["timestamp"], "2024-05-01 12:30:00.000000");
		assert_eq!(pending.narration(), "Alice bought 2 Club Mate");
	}

	#[test]
	fn test_purchase_with_payback() {
		let book = book();
		let pending = build(&book, purchase("Alice", &[("STICKER", dec!(3)), ("TEA", dec!(1))])).unwrap();
		let postings = &pending.transaction.postings;

		let charge = amount_of(postings, "Liabilities:Bar:Members:Alice", EUR);
		assert_eq!(charge, dec!(3.35));
		assert_eq!(amount_of(postings, "Liabilities:Bar:Members:Carol", EUR), dec!(-0.60));
		assert_eq!(amount_of(postings, "Income:Bar", EUR), -(charge - dec!(0.60)));
		assert_eq!(sum(postings, EUR), Decimal::ZERO);
	}

	#[test]
	fn test_purchase_sums_to_zero_exactly() {
		let book = book();
		let cases: Vec<Vec<(&str, Decimal)>> = vec![
			vec![("CM", dec!(1))],
			vec![("TEA", dec!(7)), ("STICKER", dec!(2)), ("CM", dec!(3))],
			vec![("Sticker", dec!(1)), ("STICKER", dec!(4))],
			vec![("TEA", dec!(0.5)), ("CM", dec!(1.333))],
		];
		for buyer in ["Alice", "Dave"] {
			for items in &cases {
				let pending = build(&book, purchase(buyer, items)).unwrap();
				let postings = &pending.transaction.postings;
				for currency in ["CM", "STICKER", "TEA", EUR] {
					assert_eq!(sum(postings, currency), Decimal::ZERO, "{} {:?}", buyer, items);
				}
			}
		}
	}

	#[test]
	fn test_repeated_product_is_merged() {
		let book = book();
		let pending = build(&book, purchase("Alice", &[("Sticker", dec!(1)), ("STICKER", dec!(4))])).unwrap();
		let postings = &pending.transaction.postings;
		let sticker_lines = postings
			.iter()
			.filter(|p| p.units.currency == "STICKER")
			.count();
		assert_eq!(sticker_lines, 2);
		assert_eq!(amount_of(postings, "Liabilities:Bar:Members:Carol", EUR), dec!(-1.00));
	}

	#[test]
	fn test_paying_member_price() {
		let book = book();
		let pending = build(&book, purchase("Dave", &[("CM", dec!(2))])).unwrap();
		let postings = &pending.transaction.postings;
		assert_eq!(amount_of(postings, "Liabilities:Bar:Members:Dave", EUR), dec!(2.40));
		assert!(pending.narration().starts_with("Dave * bought"));
	}

	#[test]
	fn test_charge_quantized_once() {
		let book = book();
		// 0.35 * 0.5 = 0.175 and 1.50 * 1.333 = 1.9995; total 2.1745 -> 2.17
		let pending = build(&book, purchase("Alice", &[("TEA", dec!(0.5)), ("CM", dec!(1.333))])).unwrap();
		let postings = &pending.transaction.postings;
		assert_eq!(amount_of(postings, "Liabilities:Bar:Members:Alice", EUR), dec!(2.17));
	}

	#[test]
	fn test_transfer_and_deposit() {
		let book = book();
		let transfer = build(
			&book,
			TransactionRequest::Transfer {
				payer: "Alice".into(),
				payee: "Bob".into(),
				amount: dec!(5),
			},
		)
		.unwrap();
		let postings = &transfer.transaction.postings;
		assert_eq!(amount_of(postings, "Liabilities:Bar:Members:Alice", EUR), dec!(5.00));
		assert_eq!(amount_of(postings, "Liabilities:Bar:Members:Bob", EUR), dec!(-5.00));
		assert_eq!(transfer.transaction.meta["type"], "transfer");

		let deposit = build(
			&book,
			TransactionRequest::Deposit {
				member: "Alice".into(),
				amount: dec!(10.00),
			},
		)
		.unwrap();
		let postings = &deposit.transaction.postings;
		assert_eq!(amount_of(postings, "Liabilities:Bar:Members:Alice", EUR), dec!(10.00));
		assert_eq!(amount_of(postings, "Assets:Cash:Bar", EUR), dec!(-10.00));
		assert_eq!(deposit.narration(), "Alice deposited €10.00");
	}

	#[test]
	fn test_invalid_requests() {
		let book = book();
		let err = build(&book, purchase("Nobody", &[("CM", dec!(1))])).unwrap_err();
		assert!(err.is_not_found());

		let err = build(&book, purchase("Alice", &[("BEER", dec!(1))])).unwrap_err();
		assert!(err.is_not_found());

		let err = build(&book, purchase("Alice", &[])).unwrap_err();
		assert!(matches!(err, LedgerError::TransactionError(TransactionError::EmptyPurchase)));

		let err = build(&book, purchase("Alice", &[("CM", dec!(0))])).unwrap_err();
		assert!(matches!(err, LedgerError::TransactionError(TransactionError::InvalidQuantity { .. })));

		let err = build(
			&book,
			TransactionRequest::Transfer {
				payer: "Alice".into(),
				payee: "Alice".into(),
				amount: dec!(1),
			},
		)
		.unwrap_err();
		assert!(matches!(err, LedgerError::TransactionError(TransactionError::SameAccount(_))));

		let err = build(
			&book,
			TransactionRequest::Deposit {
				member: "Alice".into(),
				amount: dec!(-3),
			},
		)
		.unwrap_err();
		assert!(matches!(err, LedgerError::TransactionError(TransactionError::InvalidAmount(_))));

		let err = TransactionBuilder::new().build().unwrap_err();
		assert!(matches!(err, LedgerError::TransactionError(TransactionError::MissingField("book"))));
	}
}
