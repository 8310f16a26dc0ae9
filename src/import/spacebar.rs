//! Converter for the legacy point-of-sale log.
//!
//! The log holds one JSON object per line, each followed by a comma. Every
//! object has a `type`; `buy` and `deposit` become transactions, `check`
//! carries nothing worth keeping. Account balances reported alongside each
//! record become opening balances on first sight and balance assertions
//! afterwards (at most one per account and day).

use crate::config::AccountNames;
use crate::import::ImportError;
use crate::ledger::{Amount, BalanceAssertion, Close, Entry, Open, Transaction};
use crate::transaction::EUR;
use crate::utils::quantize_money;

use chrono::{DateTime, Days, NaiveDate};
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::str::FromStr;
use tracing::{debug, warn};

/// Account name the legacy system used for the cash drawer.
pub const LEGACY_CASH_NAME: &str = "--CASH--";
/// Receives the amounts members gave away as part of a purchase.
pub const EXPENSES_ACCOUNT: &str = "Expenses:Bar";
/// Counter-account of the opening balance transfers.
pub const INITIAL_BALANCES_ACCOUNT: &str = "Assets:InitialBalances";

fn epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default()
}

/// The record kinds the importer understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Buy,
    Deposit,
    Check,
}

impl FromStr for EntryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buy" => Ok(EntryKind::Buy),
            "deposit" => Ok(EntryKind::Deposit),
            "check" => Ok(EntryKind::Check),
            other => Err(other.to_string()),
        }
    }
}

/// Numbers in the log are strings, integers or floats.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum LegacyNumber {
    Text(String),
    Number(f64),
}

impl LegacyNumber {
    fn to_decimal(&self) -> Result<Decimal, ImportError> {
        match self {
            LegacyNumber::Text(text) => Decimal::from_str(text.trim())
                .map_err(|e| ImportError::InvalidNumber(format!("{}: {}", text, e))),
            LegacyNumber::Number(number) => Decimal::from_f64(*number)
                .map(quantize_money)
                .ok_or_else(|| ImportError::InvalidNumber(number.to_string())),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct AccountRef {
    account_id: i64,
    account_name: String,
    /// Client-facing balance before the record
    account_money: LegacyNumber,
    /// Amount given away in a purchase
    #[serde(default)]
    account_money_give: Option<LegacyNumber>,
    /// Amount deposited
    #[serde(default)]
    give: Option<LegacyNumber>,
}

#[derive(Debug, Clone, Deserialize)]
struct LegacyRecord {
    timestamp: f64,
    #[serde(default)]
    human: String,
    #[serde(default)]
    products_totalprice: Option<LegacyNumber>,
    #[serde(default)]
    takefrom: Vec<AccountRef>,
    #[serde(default)]
    giveto: Vec<AccountRef>,
}

/// Split the log into records.
///
/// The trailing comma of the last record is dropped before the whole text
/// is read as one JSON array.
pub fn parse_log(text: &str) -> Result<Vec<serde_json::Value>, ImportError> {
    let trimmed = text.trim_end();
    let body = trimmed.strip_suffix(',').unwrap_or(trimmed);
    Ok(serde_json::from_str(&format!("[{}]", body))?)
}

/// Python-style capitalization: first letter upper case, the rest lower case.
fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

/// Converts legacy log records into ledger entries.
pub struct SpacebarImporter {
    accounts: AccountNames,
    keep_open: BTreeSet<String>,
    entries: Vec<Entry>,
    /// Opening balance per account; `None` once the balance arrived by rename
    initial_balances: BTreeMap<String, Option<Decimal>>,
    last_assertion: HashMap<String, NaiveDate>,
    accounts_by_id: HashMap<i64, String>,
    line: usize,
    skipped: Vec<(usize, String)>,
}

impl SpacebarImporter {
    pub fn new(accounts: AccountNames) -> Self {
        Self {
            accounts,
            keep_open: BTreeSet::new(),
            entries: Vec::new(),
            initial_balances: BTreeMap::new(),
            last_assertion: HashMap::new(),
            accounts_by_id: HashMap::new(),
            line: 0,
            skipped: Vec::new(),
        }
    }

    /// Accounts that stay open after being renamed away from.
    pub fn with_keep_open(mut self, accounts: impl IntoIterator<Item = String>) -> Self {
        self.keep_open.extend(accounts);
        self
    }

    /// Ledger account for a legacy account name.
    pub fn member_account(&self, name: &str) -> String {
        if name == LEGACY_CASH_NAME {
            self.accounts.cash.clone()
        } else {
            format!("{}:{}", self.accounts.members, capitalize(name))
        }
    }

    /// Records whose kind was not recognised, by line.
    pub fn skipped(&self) -> &[(usize, String)] {
        &self.skipped
    }

    /// Process a whole log.
    pub fn process_log(&mut self, text: &str) -> Result<(), ImportError> {
        for record in parse_log(text)? {
            self.process_record(record)?;
        }
        Ok(())
    }

    /// Process one record.
    pub fn process_record(&mut self, value: serde_json::Value) -> Result<(), ImportError> {
        self.line += 1;
        let kind = value
            .get("type")
            .and_then(|kind| kind.as_str())
            .unwrap_or_default()
            .to_string();
        let kind = match EntryKind::from_str(&kind) {
            Ok(kind) => kind,
            Err(unknown) => {
                warn!("Could not process entry type {:?} on line {}", unknown, self.line);
                self.skipped.push((self.line, unknown));
                return Ok(());
            }
        };

        match kind {
            EntryKind::Buy => self.process_buy(self.record(value)?),
            EntryKind::Deposit => self.process_deposit(self.record(value)?),
            EntryKind::Check => Ok(()),
        }
    }

    fn record(&self, value: serde_json::Value) -> Result<LegacyRecord, ImportError> {
        serde_json::from_value(value).map_err(|e| ImportError::InvalidRecord {
            line: self.line,
            message: e.to_string(),
        })
    }

    fn invalid(&self, message: impl Into<String>) -> ImportError {
        ImportError::InvalidRecord {
            line: self.line,
            message: message.into(),
        }
    }

    fn new_transaction(&self, record: &LegacyRecord) -> Result<Transaction, ImportError> {
        let date = DateTime::from_timestamp(record.timestamp.trunc() as i64, 0)
            .ok_or_else(|| self.invalid(format!("Invalid timestamp {}", record.timestamp)))?
            .date_naive();
        Ok(Transaction::new(date, record.human.clone()))
    }

    /// Resolve the ledger account of `reference`, tracking renames, opening
    /// balances and balance assertions.
    fn member(&mut self, reference: &AccountRef, date: NaiveDate) -> Result<String, ImportError> {
        let balance = reference.account_money.to_decimal()?;
        let name = self.member_account(&reference.account_name);

        match self.accounts_by_id.get(&reference.account_id).cloned() {
            Some(previous) if previous != name => {
                debug!("Account {} renamed to {}", previous, name);
                let mut rename =
                    Transaction::new(date, format!("Rename {} to {}", previous, name));
                rename.tags.push("rename".to_string());
                rename.add_posting(previous.clone(), balance, EUR);
                rename.add_posting(name.clone(), -balance, EUR);
                self.entries.push(Entry::Transaction(rename));

                if !self.keep_open.contains(&previous) {
                    self.entries.push(Entry::Close(Close {
                        date: date + Days::new(1),
                        account: previous,
                        meta: Default::default(),
                    }));
                }
                // No assertion for the new name on the day of the rename
                self.last_assertion.insert(name.clone(), date);
                self.initial_balances.insert(name.clone(), None);
            }
            _ if !self.initial_balances.contains_key(&name) => {
                self.initial_balances.insert(name.clone(), Some(balance));
                self.last_assertion.insert(name.clone(), date);
            }
            _ if self.last_assertion.get(&name) != Some(&date) && name != self.accounts.cash => {
                let mut meta = BTreeMap::new();
                meta.insert("iline".to_string(), self.line.to_string());
                self.entries.push(Entry::Balance(BalanceAssertion {
                    date,
                    account: name.clone(),
                    amount: Amount::new(-balance, EUR),
                    meta,
                }));
                self.last_assertion.insert(name.clone(), date);
            }
            _ => {}
        }
        self.accounts_by_id.insert(reference.account_id, name.clone());
        Ok(name)
    }

    fn process_buy(&mut self, record: LegacyRecord) -> Result<(), ImportError> {
        let mut txn = self.new_transaction(&record)?;
        let amount = record
            .products_totalprice
            .as_ref()
            .ok_or_else(|| self.invalid("Purchase without products_totalprice"))?
            .to_decimal()?
            .abs();
        let [takefrom] = record.takefrom.as_slice() else {
            return Err(self.invalid("Expected exactly one account in takefrom"));
        };

        let account = self.member(takefrom, txn.date)?;
        txn.add_posting(account, amount, EUR);
        txn.add_posting(self.accounts.income.clone(), -amount, EUR);

        for giveto in &record.giveto {
            let account = self.member(giveto, txn.date)?;
            let given = giveto
                .account_money_give
                .as_ref()
                .ok_or_else(|| self.invalid("Gift without account_money_give"))?
                .to_decimal()?;
            txn.add_posting(account, -given, EUR);
            txn.add_posting(EXPENSES_ACCOUNT, given, EUR);
        }

        self.entries.push(Entry::Transaction(txn));
        Ok(())
    }

    fn process_deposit(&mut self, record: LegacyRecord) -> Result<(), ImportError> {
        let mut txn = self.new_transaction(&record)?;
        let [giveto] = record.giveto.as_slice() else {
            return Err(self.invalid("Expected exactly one giveto account in a deposit"));
        };
        let amount = giveto
            .give
            .as_ref()
            .ok_or_else(|| self.invalid("Deposit without give"))?
            .to_decimal()?;

        let account = self.member(giveto, txn.date)?;
        txn.add_posting(account, -amount, EUR);
        txn.add_posting(self.accounts.cash.clone(), amount, EUR);
        self.entries.push(Entry::Transaction(txn));
        Ok(())
    }

    fn opening_transfers(&self) -> Vec<Transaction> {
        self.initial_balances
            .iter()
            .filter_map(|(account, balance)| match balance {
                Some(balance) if !balance.is_zero() => Some((account, *balance)),
                _ => None,
            })
            .map(|(account, balance)| {
                let mut txn =
                    Transaction::new(epoch(), format!("Initial balance transfer for {}", account));
                txn.add_posting(account.clone(), -balance, EUR);
                txn.add_posting(INITIAL_BALANCES_ACCOUNT, balance, EUR);
                txn
            })
            .collect()
    }

    /// All entries in output order: `open` directives for every account
    /// used, opening balance transfers, then the converted records.
    pub fn finish(self) -> Vec<Entry> {
        let opening = self.opening_transfers();
        let accounts: BTreeSet<String> = self
            .initial_balances
            .keys()
            .cloned()
            .chain(
                opening
                    .iter()
                    .chain(self.entries.iter().filter_map(|entry| match entry {
                        Entry::Transaction(txn) => Some(txn),
                        _ => None,
                    }))
                    .flat_map(|txn| txn.postings.iter().map(|p| p.account.clone())),
            )
            .collect();

        accounts
            .into_iter()
            .map(|account| {
                Entry::Open(Open {
                    date: epoch(),
                    account,
                    currencies: Vec::new(),
                    meta: Default::default(),
                })
            })
            .chain(opening.into_iter().map(Entry::Transaction))
            .chain(self.entries)
            .collect()
    }
}
