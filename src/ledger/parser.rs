//! Line-oriented reader for the plain-text ledger subset.
//!
//! The reader understands the directives this system writes and consumes:
//! options, includes, `open`/`close`/`balance` and transactions with metadata
//! and simple postings. Anything else with a date is kept as an opaque entry.
//! Problems are collected with their line number instead of aborting the parse.

use crate::ledger::types::{
    Amount, BalanceAssertion, Close, Entry, Inventory, LoadError, Meta, Open, Posting, Transaction,
};

use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const ROOT_ACCOUNT_TYPES: [&str; 5] = ["Assets", "Liabilities", "Equity", "Income", "Expenses"];

/// Everything found in a single file, before includes are resolved.
#[derive(Debug, Default)]
pub struct ParsedFile {
    pub entries: Vec<Entry>,
    /// Include targets with the line they were declared on
    pub includes: Vec<(String, usize)>,
    pub options: Vec<(String, String, usize)>,
    pub errors: Vec<LoadError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Str(String),
    Word(String),
}

impl Token {
    fn as_word(&self) -> Option<&str> {
        match self {
            Token::Word(w) => Some(w),
            Token::Str(_) => None,
        }
    }
}

/// A transaction posting whose amount may still need to be inferred.
struct PendingPosting {
    account: String,
    units: Option<Amount>,
    line: usize,
}

/// The directive currently receiving indented metadata and postings.
enum Pending {
    None,
    /// The directive line was rejected; its indented lines are ignored
    Skip,
    Entry(Entry),
    Transaction {
        txn: Transaction,
        postings: Vec<PendingPosting>,
        line: usize,
    },
}

struct Parser<'a> {
    file: &'a Path,
    out: ParsedFile,
    current: Pending,
}

/// Parse the text of one ledger file.
pub fn parse_str(text: &str, file: &Path) -> ParsedFile {
    let mut parser = Parser {
        file,
        out: ParsedFile::default(),
        current: Pending::None,
    };
    for (idx, raw_line) in text.lines().enumerate() {
        parser.line(idx + 1, raw_line);
    }
    parser.finish_current();
    parser.out
}

/// Check that an account name has a valid root and no empty components.
pub fn is_valid_account(account: &str) -> bool {
    let mut parts = account.split(':');
    match parts.next() {
        Some(root) if ROOT_ACCOUNT_TYPES.contains(&root) => {}
        _ => return false,
    }
    let mut rest = 0;
    for part in parts {
        if part.is_empty() || part.chars().any(char::is_whitespace) {
            return false;
        }
        rest += 1;
    }
    rest > 0
}

impl<'a> Parser<'a> {
    fn error(&mut self, line: usize, message: impl Into<String>) {
        self.out.errors.push(LoadError {
            file: PathBuf::from(self.file),
            line,
            message: message.into(),
        });
    }

    fn line(&mut self, lineno: usize, raw: &str) {
        let content = strip_comment(raw);
        if content.trim().is_empty() {
            return;
        }
        let indented = content.starts_with(' ') || content.starts_with('\t');
        let tokens = match tokenize(content.trim()) {
            Ok(tokens) => tokens,
            Err(message) => {
                self.error(lineno, message);
                return;
            }
        };
        if indented {
            self.indented_line(lineno, tokens);
        } else {
            self.finish_current();
            self.current = Pending::Skip;
            self.directive_line(lineno, tokens);
        }
    }

    fn directive_line(&mut self, lineno: usize, tokens: Vec<Token>) {
        let Some(Token::Word(head)) = tokens.first() else {
            self.error(lineno, "Expected a directive");
            return;
        };
        match head.as_str() {
            "option" => match (tokens.get(1), tokens.get(2)) {
                (Some(Token::Str(key)), Some(Token::Str(value))) => {
                    self.out.options.push((key.clone(), value.clone(), lineno));
                }
                _ => self.error(lineno, "option requires a quoted key and value"),
            },
            "include" => match tokens.get(1) {
                Some(Token::Str(path)) => self.out.includes.push((path.clone(), lineno)),
                _ => self.error(lineno, "include requires a quoted path"),
            },
            "plugin" | "pushtag" | "poptag" => {}
            _ => match NaiveDate::parse_from_str(head, "%Y-%m-%d") {
                Ok(date) => self.dated_directive(lineno, date, &tokens[1..]),
                Err(_) => self.error(lineno, format!("Unknown directive '{}'", head)),
            },
        }
    }

    fn dated_directive(&mut self, lineno: usize, date: NaiveDate, tokens: &[Token]) {
        let Some(kind) = tokens.first() else {
            self.error(lineno, "Dated line without a directive");
            return;
        };
        match kind.as_word() {
            Some("open") => {
                let Some(account) = self.account_at(lineno, tokens.get(1)) else {
                    return;
                };
                let currencies = match tokens.get(2) {
                    Some(Token::Word(list)) => list
                        .split(',')
                        .filter(|c| !c.is_empty())
                        .map(str::to_string)
                        .collect(),
                    _ => Vec::new(),
                };
                self.current = Pending::Entry(Entry::Open(Open {
                    date,
                    account,
                    currencies,
                    meta: Meta::new(),
                }));
            }
            Some("close") => {
                let Some(account) = self.account_at(lineno, tokens.get(1)) else {
                    return;
                };
                self.current = Pending::Entry(Entry::Close(Close {
                    date,
                    account,
                    meta: Meta::new(),
                }));
            }
            Some("balance") => {
                let Some(account) = self.account_at(lineno, tokens.get(1)) else {
                    return;
                };
                match parse_amount(tokens.get(2), tokens.get(3)) {
                    Ok(Some(amount)) => {
                        self.current = Pending::Entry(Entry::Balance(BalanceAssertion {
                            date,
                            account,
                            amount,
                            meta: Meta::new(),
                        }));
                    }
                    Ok(None) => self.error(lineno, "balance requires an amount"),
                    Err(message) => self.error(lineno, message),
                }
            }
            Some("*") | Some("!") | Some("txn") => {
                let flag = match kind.as_word() {
                    Some("!") => '!',
                    _ => '*',
                };
                self.transaction_header(lineno, date, flag, &tokens[1..]);
            }
            Some(other) => {
                let line = tokens
                    .iter()
                    .map(|t| match t {
                        Token::Word(w) => w.clone(),
                        Token::Str(s) => format!("\"{}\"", escape(s)),
                    })
                    .collect::<Vec<_>>()
                    .join(" ");
                self.current = Pending::Entry(Entry::Other {
                    date,
                    directive: other.to_string(),
                    line,
                });
            }
            None => self.error(lineno, "Unexpected string where a directive was expected"),
        }
    }

    fn transaction_header(&mut self, lineno: usize, date: NaiveDate, flag: char, tokens: &[Token]) {
        let strings: Vec<&String> = tokens
            .iter()
            .filter_map(|t| match t {
                Token::Str(s) => Some(s),
                Token::Word(_) => None,
            })
            .collect();
        let (payee, narration) = match strings.as_slice() {
            [] => (None, String::new()),
            [narration] => (None, (*narration).clone()),
            [payee, narration] => (Some((*payee).clone()), (*narration).clone()),
            _ => {
                self.error(lineno, "Too many strings on transaction line");
                return;
            }
        };
        let mut txn = Transaction::new(date, narration);
        txn.flag = flag;
        txn.payee = payee;
        for token in tokens {
            if let Token::Word(word) = token {
                if let Some(tag) = word.strip_prefix('#') {
                    txn.tags.push(tag.to_string());
                } else if !word.starts_with('^') {
                    self.error(lineno, format!("Unexpected token '{}' in transaction", word));
                }
            }
        }
        self.current = Pending::Transaction {
            txn,
            postings: Vec::new(),
            line: lineno,
        };
    }

    fn indented_line(&mut self, lineno: usize, tokens: Vec<Token>) {
        if matches!(self.current, Pending::Skip) {
            return;
        }
        if let Some((key, value)) = meta_pair(&tokens) {
            match &mut self.current {
                Pending::None | Pending::Skip => {
                    self.error(lineno, "Metadata outside of a directive")
                }
                Pending::Entry(entry) => {
                    if let Some(meta) = entry_meta(entry) {
                        meta.insert(key, value);
                    }
                }
                Pending::Transaction { txn, postings, .. } => {
                    // Metadata after a posting belongs to the posting; it is not kept.
                    if postings.is_empty() {
                        txn.meta.insert(key, value);
                    }
                }
            }
            return;
        }

        let mut rest = tokens.as_slice();
        if matches!(rest.first(), Some(Token::Word(w)) if w == "*" || w == "!") {
            rest = &rest[1..];
        }
        let account = match rest.first() {
            Some(Token::Word(account)) if is_valid_account(account) => account.clone(),
            Some(Token::Word(other)) => {
                self.error(lineno, format!("Invalid account '{}'", other));
                return;
            }
            _ => {
                self.error(lineno, "Expected a posting");
                return;
            }
        };
        if rest[1..]
            .iter()
            .any(|t| matches!(t, Token::Word(w) if w.starts_with('{') || w.starts_with('@')))
        {
            self.error(lineno, "Costs and prices are not supported");
            return;
        }
        let units = match parse_amount(rest.get(1), rest.get(2)) {
            Ok(units) => units,
            Err(message) => {
                self.error(lineno, message);
                return;
            }
        };
        match &mut self.current {
            Pending::Transaction { postings, .. } => postings.push(PendingPosting {
                account,
                units,
                line: lineno,
            }),
            _ => self.error(lineno, "Posting outside of a transaction"),
        }
    }

    fn account_at(&mut self, lineno: usize, token: Option<&Token>) -> Option<String> {
        match token {
            Some(Token::Word(account)) if is_valid_account(account) => Some(account.clone()),
            Some(Token::Word(account)) => {
                self.error(lineno, format!("Invalid account '{}'", account));
                None
            }
            _ => {
                self.error(lineno, "Expected an account");
                None
            }
        }
    }

    fn finish_current(&mut self) {
        match std::mem::replace(&mut self.current, Pending::None) {
            Pending::None | Pending::Skip => {}
            Pending::Entry(entry) => self.out.entries.push(entry),
            Pending::Transaction {
                txn,
                postings,
                line,
            } => {
                if let Some(txn) = self.complete_transaction(txn, postings, line) {
                    self.out.entries.push(Entry::Transaction(txn));
                }
            }
        }
    }

    /// Fill in an elided posting amount from the residual of the others.
    fn complete_transaction(
        &mut self,
        mut txn: Transaction,
        postings: Vec<PendingPosting>,
        line: usize,
    ) -> Option<Transaction> {
        if let Some(second) = postings.iter().filter(|p| p.units.is_none()).nth(1) {
            self.error(
                second.line,
                "At most one posting per transaction may omit its amount",
            );
            return None;
        }
        let residual: Inventory = postings.iter().filter_map(|p| p.units.clone()).collect();
        for posting in postings {
            match posting.units {
                Some(units) => txn.postings.push(Posting {
                    account: posting.account,
                    units,
                }),
                None => {
                    for (currency, number) in residual.iter() {
                        if !number.is_zero() {
                            txn.postings
                                .push(Posting::new(posting.account.clone(), -*number, currency));
                        }
                    }
                }
            }
        }
        if txn.postings.is_empty() {
            self.error(line, "Transaction has no postings");
            return None;
        }
        Some(txn)
    }
}

fn entry_meta(entry: &mut Entry) -> Option<&mut Meta> {
    match entry {
        Entry::Open(open) => Some(&mut open.meta),
        Entry::Close(close) => Some(&mut close.meta),
        Entry::Balance(balance) => Some(&mut balance.meta),
        Entry::Transaction(txn) => Some(&mut txn.meta),
        Entry::Other { .. } => None,
    }
}

/// `key: value` where the key starts with a lowercase letter.
fn meta_pair(tokens: &[Token]) -> Option<(String, String)> {
    let Some(Token::Word(first)) = tokens.first() else {
        return None;
    };
    let key = first.strip_suffix(':')?;
    if !key.chars().next().is_some_and(|c| c.is_ascii_lowercase()) {
        return None;
    }
    let value = match tokens.get(1) {
        Some(Token::Str(s)) => s.clone(),
        Some(Token::Word(w)) => w.clone(),
        None => String::new(),
    };
    Some((key.to_string(), value))
}

fn parse_amount(
    number: Option<&Token>,
    currency: Option<&Token>,
) -> Result<Option<Amount>, String> {
    let Some(number) = number else {
        return Ok(None);
    };
    let Token::Word(number) = number else {
        return Err("Expected a number".to_string());
    };
    let number = Decimal::from_str(number).map_err(|e| format!("Invalid number '{}': {}", number, e))?;
    match currency {
        Some(Token::Word(currency)) if is_valid_currency(currency) => {
            Ok(Some(Amount::new(number, currency.clone())))
        }
        Some(Token::Word(currency)) => Err(format!("Invalid currency '{}'", currency)),
        _ => Err("Amount without a currency".to_string()),
    }
}

fn is_valid_currency(currency: &str) -> bool {
    let mut chars = currency.chars();
    chars.next().is_some_and(|c| c.is_ascii_uppercase())
        && chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || "'._-".contains(c))
}

/// Drop a `;` comment that is not inside a quoted string.
fn strip_comment(line: &str) -> &str {
    let mut in_string = false;
    let mut escaped = false;
    for (idx, c) in line.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            ';' => return &line[..idx],
            _ => {}
        }
    }
    line
}

fn tokenize(line: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '"' {
            chars.next();
            let mut value = String::new();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' => match chars.next() {
                        Some('n') => value.push('\n'),
                        Some(other) => value.push(other),
                        None => break,
                    },
                    '"' => {
                        closed = true;
                        break;
                    }
                    other => value.push(other),
                }
            }
            if !closed {
                return Err("Unterminated string".to_string());
            }
            tokens.push(Token::Str(value));
        } else {
            let mut word = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() || c == '"' {
                    break;
                }
                word.push(c);
                chars.next();
            }
            tokens.push(Token::Word(word));
        }
    }
    Ok(tokens)
}

/// Escape a string for inclusion between double quotes.
pub fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn parse(text: &str) -> ParsedFile {
        parse_str(text, Path::new("test.beancount"))
    }

    #[test]
    fn test_parse_open_with_metadata() {
        let parsed = parse(
            "1970-01-01 open Liabilities:Bar:Members:Alice EUR,CM\n  display_name: \"Alice A.\"\n",
        );
        assert!(parsed.errors.is_empty(), "{:?}", parsed.errors);
        let Entry::Open(open) = &parsed.entries[0] else {
            panic!("expected open");
        };
        assert_eq!(open.account, "Liabilities:Bar:Members:Alice");
        assert_eq!(open.currencies, vec!["EUR", "CM"]);
        assert_eq!(open.meta.get("display_name").unwrap(), "Alice A.");
    }

    #[test]
    fn test_parse_transaction_with_elided_posting() {
        let parsed = parse(
            r#"2024-03-01 * "Shop" "Alice bought some stuff" #bar
  timestamp: "2024-03-01 10:00:00"
  type: "purchase"
  Liabilities:Bar:Members:Alice   3.00 EUR ; charge
  Income:Bar
"#,
        );
        assert!(parsed.errors.is_empty(), "{:?}", parsed.errors);
        let Entry::Transaction(txn) = &parsed.entries[0] else {
            panic!("expected transaction");
        };
        assert_eq!(txn.payee.as_deref(), Some("Shop"));
        assert_eq!(txn.narration, "Alice bought some stuff");
        assert_eq!(txn.tags, vec!["bar"]);
        assert_eq!(txn.meta.get("type").unwrap(), "purchase");
        assert_eq!(txn.postings.len(), 2);
        assert_eq!(txn.postings[1].account, "Income:Bar");
        assert_eq!(txn.postings[1].units.number, dec!(-3.00));
    }

    #[test]
    fn test_parse_collects_errors_and_continues() {
        let parsed = parse(
            "option \"title\" \"Bar\"\ninclude \"ledger/dynamic.beancount\"\nnonsense here\n2024-01-01 open Bogus:Account\n2024-01-02 close Assets:Cash:Bar\n",
        );
        assert_eq!(parsed.options, vec![("title".into(), "Bar".into(), 1)]);
        assert_eq!(parsed.includes, vec![("ledger/dynamic.beancount".into(), 2)]);
        assert_eq!(parsed.errors.len(), 2);
        assert_eq!(parsed.errors[0].line, 3);
        assert_eq!(parsed.errors[1].line, 4);
        assert_eq!(parsed.entries.len(), 1);
    }

    #[test]
    fn test_two_elided_postings_rejected() {
        let parsed = parse("2024-01-01 * \"x\"\n  Assets:A\n  Assets:B\n");
        assert_eq!(parsed.errors.len(), 1);
        assert!(parsed.entries.is_empty());
    }

    #[test]
    fn test_comment_inside_string_is_kept() {
        assert_eq!(strip_comment("  key: \"a;b\" ; note"), "  key: \"a;b\" ");
    }
}
