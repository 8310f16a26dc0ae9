//! Renders entries back into ledger text the reader accepts.

use crate::ledger::parser::escape;
use crate::ledger::types::{Entry, Meta, Posting, Transaction};

use itertools::Itertools;
use std::fmt::Write;

const INDENT: &str = "  ";

/// Render a single entry, terminated by a newline.
pub fn print_entry(entry: &Entry) -> String {
    let mut out = String::new();
    match entry {
        Entry::Transaction(txn) => return print_transaction(txn),
        Entry::Open(open) => {
            let _ = write!(out, "{} open {}", open.date, open.account);
            if !open.currencies.is_empty() {
                let _ = write!(out, " {}", open.currencies.join(","));
            }
            out.push('\n');
            print_meta(&mut out, &open.meta);
        }
        Entry::Close(close) => {
            let _ = writeln!(out, "{} close {}", close.date, close.account);
            print_meta(&mut out, &close.meta);
        }
        Entry::Balance(balance) => {
            let _ = writeln!(
                out,
                "{} balance {}  {}",
                balance.date, balance.account, balance.amount
            );
            print_meta(&mut out, &balance.meta);
        }
        Entry::Other { date, line, .. } => {
            let _ = writeln!(out, "{} {}", date, line);
        }
    }
    out
}

/// Render a transaction with its metadata and aligned postings.
pub fn print_transaction(txn: &Transaction) -> String {
    let mut out = String::new();
    let _ = write!(out, "{} {}", txn.date, txn.flag);
    if let Some(payee) = &txn.payee {
        let _ = write!(out, " \"{}\"", escape(payee));
    }
    let _ = write!(out, " \"{}\"", escape(&txn.narration));
    for tag in &txn.tags {
        let _ = write!(out, " #{}", tag);
    }
    out.push('\n');
    print_meta(&mut out, &txn.meta);
    print_postings(&mut out, &txn.postings);
    out
}

/// Render a list of entries separated by blank lines.
pub fn print_entries<'a>(entries: impl IntoIterator<Item = &'a Entry>) -> String {
    entries.into_iter().map(print_entry).join("\n")
}

fn print_meta(out: &mut String, meta: &Meta) {
    for (key, value) in meta {
        let _ = writeln!(out, "{}{}: \"{}\"", INDENT, key, escape(value));
    }
}

fn print_postings(out: &mut String, postings: &[Posting]) {
    let width = postings
        .iter()
        .map(|p| p.account.len())
        .max()
        .unwrap_or(0);
    for posting in postings {
        let _ = writeln!(
            out,
            "{}{:<width$}  {}",
            INDENT,
            posting.account,
            posting.units,
            width = width
        );
    }
}
