//! The ledger engine boundary and its plain-text implementation.
//!
//! The synchronization core only talks to the ledger through [`LedgerEngine`]:
//! load a file graph, print a transaction, compute residuals and tolerances,
//! and aggregate balances per account.

use crate::ledger::parser::parse_str;
use crate::ledger::printer::print_transaction;
use crate::ledger::types::{
    BalanceQuery, BalanceRow, Entry, Inventory, LedgerOptions, LoadError, LoadedLedger, Posting,
    Transaction,
};

use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

/// Contract between the synchronization core and the ledger implementation.
pub trait LedgerEngine: Send + Sync {
    /// Load a root ledger file and everything it includes.
    ///
    /// Parse problems are returned in `errors`; they never abort the load.
    fn load(&self, path: &Path) -> LoadedLedger;

    /// Render a transaction as ledger text.
    fn print(&self, txn: &Transaction) -> String;

    /// Per-currency sum of the postings.
    fn compute_residual(&self, postings: &[Posting]) -> Inventory;

    /// Per-currency tolerance allowed for the residual of these postings.
    fn infer_tolerances(
        &self,
        postings: &[Posting],
        options: &LedgerOptions,
    ) -> BTreeMap<String, Decimal>;

    /// Sum of postings per account for the accounts selected by `query`.
    fn query(
        &self,
        entries: &[Entry],
        options: &LedgerOptions,
        query: &BalanceQuery,
    ) -> Vec<BalanceRow>;
}

/// Engine for the plain-text ledger format written by this system.
#[derive(Debug, Clone, Default)]
pub struct PlainTextEngine;

impl PlainTextEngine {
    pub fn new() -> Self {
        Self
    }

    fn load_file(
        &self,
        path: &Path,
        visited: &mut HashSet<PathBuf>,
        option_lines: &mut Vec<(PathBuf, String, String, usize)>,
        loaded: &mut LoadedLedger,
    ) {
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        if !visited.insert(canonical) {
            debug!("Skipping already included file {:?}", path);
            return;
        }

        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                loaded.errors.push(LoadError {
                    file: path.to_path_buf(),
                    line: 0,
                    message: format!("Failed to read ledger file: {}", e),
                });
                return;
            }
        };

        let parsed = parse_str(&text, path);
        loaded.entries.extend(parsed.entries);
        loaded.errors.extend(parsed.errors);
        for (key, value, line) in parsed.options {
            option_lines.push((path.to_path_buf(), key, value, line));
        }

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        for (include, line) in parsed.includes {
            let target = base.join(&include);
            if !target.exists() {
                loaded.errors.push(LoadError {
                    file: path.to_path_buf(),
                    line,
                    message: format!("Included file \"{}\" does not exist", include),
                });
                continue;
            }
            self.load_file(&target, visited, option_lines, loaded);
        }
    }
}

fn apply_option(
    options: &mut LedgerOptions,
    key: &str,
    value: &str,
) -> Result<(), String> {
    match key {
        "title" => options.title = Some(value.to_string()),
        "operating_currency" => options.operating_currencies.push(value.to_string()),
        "inferred_tolerance_multiplier" => {
            options.inferred_tolerance_multiplier = Decimal::from_str(value)
                .map_err(|e| format!("Invalid tolerance multiplier '{}': {}", value, e))?;
        }
        "inferred_tolerance_default" => {
            let (currency, tolerance) = value
                .split_once(':')
                .ok_or_else(|| format!("Expected CURRENCY:TOLERANCE, got '{}'", value))?;
            let tolerance = Decimal::from_str(tolerance)
                .map_err(|e| format!("Invalid tolerance '{}': {}", tolerance, e))?;
            options
                .inferred_tolerance_default
                .insert(currency.to_string(), tolerance);
        }
        _ => {
            options.other.insert(key.to_string(), value.to_string());
        }
    }
    Ok(())
}

impl LedgerEngine for PlainTextEngine {
    fn load(&self, path: &Path) -> LoadedLedger {
        let mut loaded = LoadedLedger::default();
        let mut visited = HashSet::new();
        let mut option_lines = Vec::new();
        self.load_file(path, &mut visited, &mut option_lines, &mut loaded);

        for (file, key, value, line) in option_lines {
            if let Err(message) = apply_option(&mut loaded.options, &key, &value) {
                loaded.errors.push(LoadError {
                    file,
                    line,
                    message,
                });
            }
        }

        // Stable, so same-day entries keep their file order.
        loaded.entries.sort_by_key(Entry::date);
        debug!(
            "Loaded {} entries with {} errors from {:?}",
            loaded.entries.len(),
            loaded.errors.len(),
            path
        );
        loaded
    }

    fn print(&self, txn: &Transaction) -> String {
        print_transaction(txn)
    }

    fn compute_residual(&self, postings: &[Posting]) -> Inventory {
        postings.iter().map(|p| p.units.clone()).collect()
    }

    fn infer_tolerances(
        &self,
        postings: &[Posting],
        options: &LedgerOptions,
    ) -> BTreeMap<String, Decimal> {
        let mut tolerances: BTreeMap<String, Decimal> = BTreeMap::new();
        for posting in postings {
            let scale = posting.units.number.scale();
            if scale == 0 {
                continue;
            }
            let tolerance = options.inferred_tolerance_multiplier * Decimal::new(1, scale);
            let current = tolerances
                .entry(posting.units.currency.clone())
                .or_insert(tolerance);
            if tolerance > *current {
                *current = tolerance;
            }
        }
        for posting in postings {
            let currency = &posting.units.currency;
            if !tolerances.contains_key(currency) {
                let fallback = options
                    .inferred_tolerance_default
                    .get(currency)
                    .or_else(|| options.inferred_tolerance_default.get("*"))
                    .copied()
                    .unwrap_or(Decimal::ZERO);
                tolerances.insert(currency.clone(), fallback);
            }
        }
        tolerances
    }

    fn query(
        &self,
        entries: &[Entry],
        _options: &LedgerOptions,
        query: &BalanceQuery,
    ) -> Vec<BalanceRow> {
        let mut balances: BTreeMap<&str, Inventory> = BTreeMap::new();
        for entry in entries {
            let Entry::Transaction(txn) = entry else {
                continue;
            };
            for posting in &txn.postings {
                if query.matches(&posting.account) {
                    balances
                        .entry(posting.account.as_str())
                        .or_default()
                        .add(&posting.units);
                }
            }
        }
        balances
            .into_iter()
            .map(|(account, balance)| BalanceRow {
                account: account.to_string(),
                balance,
            })
            .collect()
    }
}

/// True when every currency of the residual is within its tolerance.
pub fn is_within_tolerance(residual: &Inventory, tolerances: &BTreeMap<String, Decimal>) -> bool {
    residual.iter().all(|(currency, number)| {
        let tolerance = tolerances.get(currency).copied().unwrap_or(Decimal::ZERO);
        number.abs() <= tolerance
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn write(dir: &Path, name: &str, content: &str) {
        let path = dir.join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_load_follows_includes_and_reports_errors() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "bartab.beancount",
            "option \"title\" \"Bar\"\noption \"inferred_tolerance_default\" \"CM:0.5\"\ninclude \"ledger/dynamic.beancount\"\n1970-01-01 open Liabilities:Bar:Members:Alice\n",
        );
        write(
            dir.path(),
            "ledger/dynamic.beancount",
            "include \"host_1.beancount\"\ninclude \"missing.beancount\"\n",
        );
        write(
            dir.path(),
            "ledger/host_1.beancount",
            "2024-01-02 * \"Deposit\"\n  Liabilities:Bar:Members:Alice  10.00 EUR\n  Assets:Cash:Bar  -10.00 EUR\n",
        );

        let engine = PlainTextEngine::new();
        let loaded = engine.load(&dir.path().join("bartab.beancount"));
        assert_eq!(loaded.entries.len(), 2);
        assert_eq!(loaded.errors.len(), 1);
        assert!(loaded.errors[0].message.contains("missing.beancount"));
        assert_eq!(loaded.options.title.as_deref(), Some("Bar"));
        assert_eq!(loaded.options.inferred_tolerance_default["CM"], dec!(0.5));
    }

    #[test]
    fn test_include_cycle_is_loaded_once() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.beancount", "include \"b.beancount\"\n2024-01-01 open Assets:A\n");
        write(dir.path(), "b.beancount", "include \"a.beancount\"\n2024-01-01 open Assets:B\n");
        let loaded = PlainTextEngine::new().load(&dir.path().join("a.beancount"));
        assert!(loaded.errors.is_empty(), "{:?}", loaded.errors);
        assert_eq!(loaded.entries.len(), 2);
    }

    #[test]
    fn test_tolerances_follow_precision() {
        let engine = PlainTextEngine::new();
        let postings = vec![
            Posting::new("Assets:A", dec!(1.50), "EUR"),
            Posting::new("Assets:B", dec!(-1.5), "EUR"),
            Posting::new("Assets:A", dec!(2), "CM"),
            Posting::new("Assets:B", dec!(-2), "CM"),
        ];
        let options = LedgerOptions::default();
        let tolerances = engine.infer_tolerances(&postings, &options);
        assert_eq!(tolerances["EUR"], dec!(0.05));
        assert_eq!(tolerances["CM"], dec!(0));

        let residual = engine.compute_residual(&[
            Posting::new("Assets:A", dec!(1.00), "EUR"),
            Posting::new("Assets:B", dec!(-0.996), "EUR"),
        ]);
        assert_eq!(residual.get("EUR"), dec!(0.004));
        let tight = engine.infer_tolerances(
            &[Posting::new("Assets:B", dec!(-0.996), "EUR")],
            &options,
        );
        assert!(!is_within_tolerance(&residual, &tight));
    }

    #[test]
    fn test_query_groups_by_account() {
        let text = "2024-01-01 * \"a\"\n  Liabilities:Bar:Members:Alice  2 CM\n  Liabilities:Bar:Members:Alice  3.00 EUR\n  Assets:Bar:Inventory  -2 CM\n  Income:Bar  -3.00 EUR\n\n2024-01-02 * \"b\"\n  Liabilities:Bar:Members:Alice  -1.00 EUR\n  Assets:Cash:Bar  1.00 EUR\n";
        let parsed = parse_str(text, Path::new("q.beancount"));
        let query = BalanceQuery {
            parents: vec!["Liabilities:Bar:Members".into()],
            accounts: vec!["Assets:Cash:Bar".into()],
        };
        let rows = PlainTextEngine::new().query(&parsed.entries, &LedgerOptions::default(), &query);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].account, "Assets:Cash:Bar");
        assert_eq!(rows[0].balance.get("EUR"), dec!(1.00));
        assert_eq!(rows[1].balance.get("EUR"), dec!(2.00));
        assert_eq!(rows[1].balance.get("CM"), dec!(2));
    }
}
