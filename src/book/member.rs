//! Member accounts: people with a tab, plus the cash drawer.

use crate::config::AccountNames;
use crate::error::LedgerError;
use crate::ledger::{Inventory, Open};
use crate::transaction::EUR;
use crate::utils::{quantize_count, quantize_money};

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;
use std::collections::BTreeSet;

pub const CASH_INTERNAL_NAME: &str = "--cash--";
pub const CASH_DISPLAY_NAME: &str = "--CASH--";
/// Appended to the display name of paying members.
pub const PAYING_MEMBER_MARKER: &str = " *";

const MEMBER_ACCOUNT_SEGMENTS: usize = 4;

/// One ledger account shown to clients.
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
	pub internal_name: String,
	pub display_name: String,
	pub account: String,
	/// Ledger balance, seen from the bar's side
	pub balance: Inventory,
	/// Currencies counted as items
	pub item_currencies: BTreeSet<String>,
	pub is_paying_member: bool,
}

impl Member {
	/// Build a member from the `open` directive of its account.
	pub fn from_open(open: &Open, names: &AccountNames) -> Result<Self, LedgerError> {
		let mut member = if open.account == names.cash {
			Self::blank(CASH_INTERNAL_NAME, CASH_DISPLAY_NAME, &open.account)
		} else {
			let segments: Vec<&str> = open.account.split(':').collect();
			if segments.len() != MEMBER_ACCOUNT_SEGMENTS {
				return Err(LedgerError::update_failed(format!(
					"Member account should have {} components: {}",
					MEMBER_ACCOUNT_SEGMENTS, open.account
				)));
			}
			let name = segments[MEMBER_ACCOUNT_SEGMENTS - 1];
			Self::blank(name, name, &open.account)
		};

		if let Some(display_name) = open.meta.get("display_name") {
			member.display_name = display_name.clone();
		}
		if open
			.meta
			.get("paying_member")
			.is_some_and(|flag| flag.eq_ignore_ascii_case("true"))
		{
			member.is_paying_member = true;
			member.display_name.push_str(PAYING_MEMBER_MARKER);
		}
		Ok(member)
	}

	fn blank(internal_name: &str, display_name: &str, account: &str) -> Self {
		Self {
			internal_name: internal_name.to_string(),
			display_name: display_name.to_string(),
			account: account.to_string(),
			balance: Inventory::new(),
			item_currencies: BTreeSet::new(),
			is_paying_member: false,
		}
	}

	/// Client-facing EUR balance: the ledger amount negated, to the cent.
	pub fn balance_eur(&self) -> Decimal {
		quantize_money(-self.balance.get(EUR))
	}

	/// Items held, summed over every item currency (absent ones count as zero).
	pub fn item_count(&self) -> Decimal {
		self.item_currencies
			.iter()
			.map(|currency| quantize_count(self.balance.get(currency)))
			.sum()
	}

	pub fn view(&self) -> MemberView {
		MemberView {
			display_name: self.display_name.clone(),
			balance: self.balance_eur(),
			items: self.item_count().to_i64().unwrap_or_default(),
		}
	}

	pub fn balance_view(&self) -> MemberBalanceView {
		MemberBalanceView {
			balance: self.balance_eur(),
			items: self.item_count().to_i64().unwrap_or_default(),
		}
	}
}

/// JSON shape of a member in account listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemberView {
	pub display_name: String,
	pub balance: Decimal,
	pub items: i64,
}

/// JSON shape of a member changed by a transaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemberBalanceView {
	pub balance: Decimal,
	pub items: i64,
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ledger::Amount;
	use chrono::NaiveDate;
	use rust_decimal_macros::dec;

	fn open(account: &str) -> Open {
		Open {
			date: NaiveDate::from_ymd_opt(1970, 1, 1).unwrap(),
			account: account.to_string(),
			currencies: vec![],
			meta: Default::default(),
		}
	}

	#[test]
	fn test_member_names() {
		let names = AccountNames::default();
		let alice = Member::from_open(&open("Liabilities:Bar:Members:Alice"), &names).unwrap();
		assert_eq!(alice.internal_name, "Alice");
		assert_eq!(alice.display_name, "Alice");

		let cash = Member::from_open(&open("Assets:Cash:Bar"), &names).unwrap();
		assert_eq!(cash.internal_name, CASH_INTERNAL_NAME);
		assert_eq!(cash.display_name, CASH_DISPLAY_NAME);

		let err = Member::from_open(&open("Liabilities:Bar:Alice"), &names).unwrap_err();
		assert!(matches!(err, LedgerError::UpdateFailed { .. }));
	}

	#[test]
	fn test_metadata_overrides_display_name() {
		let mut entry = open("Liabilities:Bar:Members:Bob");
		entry.meta.insert("display_name".into(), "Bobby".into());
		entry.meta.insert("paying_member".into(), "TRUE".into());
		let bob = Member::from_open(&entry, &AccountNames::default()).unwrap();
		assert_eq!(bob.internal_name, "Bob");
		assert_eq!(bob.display_name, "Bobby *");
		assert!(bob.is_paying_member);
	}

	#[test]
	fn test_derived_balances() {
		let mut member =
			Member::from_open(&open("Liabilities:Bar:Members:Alice"), &AccountNames::default())
				.unwrap();
		member.item_currencies = ["CM", "MATE"].iter().map(|c| c.to_string()).collect();
		member.balance.add(&Amount::new(dec!(2.005), "EUR"));
		member.balance.add(&Amount::new(dec!(2.5), "CM"));

		assert_eq!(member.balance_eur(), dec!(-2.00));
		// 2.5 rounds to 2, absent MATE counts as 0
		assert_eq!(member.item_count(), dec!(2));

		let view = member.view();
		assert_eq!(view.items, 2);
		let json = serde_json::to_value(&view).unwrap();
		assert_eq!(json["balance"], "-2.00");
	}
}
