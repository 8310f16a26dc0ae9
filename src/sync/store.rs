//! Ledger store: the synchronization core.
//!
//! The `LedgerStore` ties the replicated store, the ledger engine and the
//! instance ledger together. It guarantees that every accepted transaction
//! is committed and pushed before it shows up in memory, and that the
//! in-memory [`AccountBook`] is always built from a committed state.
//!
//! Mutations (reload, append, instance ledger registration) are serialized
//! behind one writer lock, taken through [`LedgerStore::with_ledger_lock`].
//! Code that already holds the lock calls the `*_locked` methods directly.
//! Readers never take the writer lock: they clone the current book snapshot,
//! which writers replace wholesale.

use crate::book::{AccountBook, Member, MemberBalanceView, Product, build_products};
use crate::config::{AccountNames, Config, LedgerPaths};
use crate::error::LedgerError;
use crate::ledger::{LedgerEngine, PlainTextEngine};
use crate::repo::{GitStore, ReplicatedStore, Revision};
use crate::sync::balance_update::BalanceUpdateService;
use crate::sync::events::{EventDispatcher, LedgerEvent, LedgerEventHandler, LoggingEventHandler};
use crate::sync::git_transaction::{GitTransaction, ScopeFailure};
use crate::sync::instance_ledger::{Clock, InstanceLedger, InstanceLedgerAllocator, system_clock};
use crate::sync::repositories::{FileProductRepository, ProductRepository};
use crate::sync::retry::RetryPolicy;
use crate::sync::status::SyncStatus;
use crate::sync::validator::TransactionValidator;
use crate::transaction::{PendingTransaction, TransactionBuilder, TransactionRequest};

use futures::future::{BoxFuture, FutureExt};
use itertools::Itertools;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

/// State only the holder of the writer lock may touch.
pub struct WriterState {
    instance: InstanceLedger,
    dispatcher: EventDispatcher,
}

impl WriterState {
    pub fn instance(&self) -> &InstanceLedger {
        &self.instance
    }
}

/// What a successful reload loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReloadSummary {
    pub revision: Revision,
    pub accounts: usize,
    pub products: usize,
}

/// Result of a committed transaction.
#[derive(Debug, Clone)]
pub struct AppendOutcome {
    /// Members whose balance changed, with their new balances
    pub members: Vec<Member>,
    pub message: String,
    pub revision: Revision,
    /// Push attempts it took, 1 without conflicts
    pub attempts: u32,
}

/// JSON shape of a committed transaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionView {
    pub members: BTreeMap<String, MemberBalanceView>,
    pub message: String,
}

impl AppendOutcome {
    pub fn view(&self) -> TransactionView {
        TransactionView {
            members: self
                .members
                .iter()
                .map(|member| (member.internal_name.clone(), member.balance_view()))
                .collect(),
            message: self.message.clone(),
        }
    }
}

/// The synchronization core.
pub struct LedgerStore {
    repo: Arc<dyn ReplicatedStore>,
    engine: Arc<dyn LedgerEngine>,
    products: Arc<dyn ProductRepository>,
    allocator: InstanceLedgerAllocator,
    validator: TransactionValidator,
    balance_updates: BalanceUpdateService,
    paths: LedgerPaths,
    accounts: AccountNames,
    event_mode: bool,
    policy: RetryPolicy,
    clock: Clock,

    writer: tokio::sync::Mutex<WriterState>,
    book: RwLock<Arc<AccountBook>>,
    status: Mutex<SyncStatus>,
}

/// Builder for [`LedgerStore`].
pub struct LedgerStoreBuilder {
    repo: Arc<dyn ReplicatedStore>,
    engine: Option<Arc<dyn LedgerEngine>>,
    products: Option<Arc<dyn ProductRepository>>,
    paths: LedgerPaths,
    accounts: AccountNames,
    event_mode: bool,
    policy: RetryPolicy,
    clock: Option<Clock>,
    hostname: Option<String>,
    handlers: Vec<Box<dyn LedgerEventHandler>>,
}

impl LedgerStoreBuilder {
    pub fn new(repo: Arc<dyn ReplicatedStore>) -> Self {
        Self {
            repo,
            engine: None,
            products: None,
            paths: LedgerPaths::default(),
            accounts: AccountNames::default(),
            event_mode: false,
            policy: RetryPolicy::default(),
            clock: None,
            hostname: None,
            handlers: Vec::new(),
        }
    }

    /// Take paths, account names, event mode and retry policy from `config`.
    pub fn with_config(mut self, config: &Config) -> Self {
        self.paths = config.ledger.clone();
        self.accounts = config.accounts.clone();
        self.event_mode = config.event_mode;
        self.policy = config.retry.policy();
        self
    }

    pub fn with_engine(mut self, engine: Arc<dyn LedgerEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn with_product_repository(mut self, products: Arc<dyn ProductRepository>) -> Self {
        self.products = Some(products);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Clock for transaction timestamps and instance ledger names.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Register an event handler after the default logging handler.
    pub fn with_event_handler(mut self, handler: Box<dyn LedgerEventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn build(self) -> LedgerStore {
        let workdir = self.repo.workdir().to_path_buf();
        let engine = self
            .engine
            .unwrap_or_else(|| Arc::new(PlainTextEngine::new()));
        let products = self.products.unwrap_or_else(|| {
            Arc::new(FileProductRepository::new(workdir.join(&self.paths.products)))
        });
        let clock = self.clock.unwrap_or_else(system_clock);

        let mut allocator = InstanceLedgerAllocator::new(&workdir, &self.paths)
            .with_clock(clock.clone())
            .with_retry_policy(self.policy.clone());
        if let Some(hostname) = self.hostname {
            allocator = allocator.with_hostname(hostname);
        }

        let mut dispatcher = EventDispatcher::new();
        dispatcher.register_handler(Box::new(LoggingEventHandler));
        for handler in self.handlers {
            dispatcher.register_handler(handler);
        }

        LedgerStore {
            repo: self.repo,
            validator: TransactionValidator::new(engine.clone()),
            engine,
            products,
            allocator,
            balance_updates: BalanceUpdateService::new(),
            paths: self.paths,
            accounts: self.accounts,
            event_mode: self.event_mode,
            policy: self.policy,
            clock,
            writer: tokio::sync::Mutex::new(WriterState {
                instance: InstanceLedger::new(),
                dispatcher,
            }),
            book: RwLock::new(Arc::new(AccountBook::default())),
            status: Mutex::new(SyncStatus::new()),
        }
    }
}

impl LedgerStore {
    pub fn builder(repo: Arc<dyn ReplicatedStore>) -> LedgerStoreBuilder {
        LedgerStoreBuilder::new(repo)
    }

    /// Store over a git working copy at the configured data directory.
    pub fn from_config(config: &Config) -> Self {
        let repo = Arc::new(GitStore::new(config.datadir.clone()));
        Self::builder(repo).with_config(config).build()
    }

    /// Run `f` while holding the writer lock.
    ///
    /// The lock is released on every exit path of `f`, including errors and
    /// panics.
    pub async fn with_ledger_lock<T, F>(&self, f: F) -> Result<T, LedgerError>
    where
        F: for<'s> FnOnce(&'s LedgerStore, &'s mut WriterState) -> BoxFuture<'s, Result<T, LedgerError>>,
    {
        let mut state = self.writer.lock().await;
        f(self, &mut *state).await
    }

    /// Pull upstream changes and rebuild the book from the working copy.
    pub async fn reload(&self) -> Result<ReloadSummary, LedgerError> {
        self.with_ledger_lock(|store, state| store.reload_locked(state).boxed())
            .await
    }

    /// Durably record `pending` and apply it to the book.
    pub async fn append(&self, pending: PendingTransaction) -> Result<AppendOutcome, LedgerError> {
        self.with_ledger_lock(move |store, state| store.append_locked(state, pending).boxed())
            .await
    }

    /// Build the transaction for `request` against the current book and append it.
    pub async fn submit(&self, request: TransactionRequest) -> Result<AppendOutcome, LedgerError> {
        self.with_ledger_lock(move |store, state| {
            async move {
                let pending = store.build_transaction(request)?;
                store.append_locked(state, pending).await
            }
            .boxed()
        })
        .await
    }

    /// Build a balanced transaction without recording it.
    pub fn build_transaction(
        &self,
        request: TransactionRequest,
    ) -> Result<PendingTransaction, LedgerError> {
        let book = self.book();
        TransactionBuilder::new()
            .with_book(&book)
            .with_accounts(self.accounts.clone())
            .with_timestamp((self.clock)())
            .with_request(request)
            .build()
    }

    pub async fn register_handler(&self, handler: Box<dyn LedgerEventHandler>) {
        self.writer.lock().await.dispatcher.register_handler(handler);
    }

    /// Current book snapshot.
    pub fn book(&self) -> Arc<AccountBook> {
        self.book.read().clone()
    }

    pub fn get_member(&self, internal_name: &str) -> Result<Member, LedgerError> {
        self.book().get_member(internal_name).cloned()
    }

    pub fn get_product(&self, key: &str) -> Result<Product, LedgerError> {
        self.book().get_product(key).cloned()
    }

    pub fn list_accounts(&self) -> Vec<Member> {
        self.book().list_accounts().cloned().collect()
    }

    pub fn list_products(&self) -> Vec<Product> {
        self.book().list_products().cloned().collect()
    }

    pub fn status(&self) -> SyncStatus {
        self.status.lock().clone()
    }

    /// True only between a successful push or reload and the next mutation.
    pub fn is_synchronized(&self) -> bool {
        self.status.lock().synchronized
    }

    /// Reload with the writer lock held.
    ///
    /// A failed pull is reported without touching the working copy (the
    /// store already aborted the merge). A failed load resets the working
    /// copy to the revision before the pull and keeps the previous book.
    pub async fn reload_locked(&self, state: &mut WriterState) -> Result<ReloadSummary, LedgerError> {
        info!("Reloading ledger in {:?}", self.repo.workdir());
        let head = self.repo.rev_parse_head().await?;
        state.instance.mark_stale();

        if let Err(e) = self.repo.pull().await {
            error!("Failed to pull upstream changes: {}", e);
            self.status.lock().record_failed_reload();
            return Err(LedgerError::update_failed_with(
                "Failed to pull upstream changes",
                e,
            ));
        }

        let loaded = match self.load().await {
            Ok(book) => book,
            Err(e) => {
                let error = match e {
                    e @ LedgerError::UpdateFailed { .. } => e,
                    other => LedgerError::update_failed_with("Failed to reload data", other),
                };
                warn!("Reload failed, rolling back to {}: {}", head, error);
                match self.repo.reset_hard(&head).await {
                    Ok(()) => {
                        state
                            .dispatcher
                            .dispatch(&LedgerEvent::RolledBack {
                                revision: head,
                                reason: error.to_string(),
                            })
                            .await
                    }
                    Err(reset_error) => error!("Failed to roll back to {}: {}", head, reset_error),
                }
                state.instance.mark_stale();
                self.status.lock().record_failed_reload();
                return Err(error);
            }
        };

        let revision = self.repo.rev_parse_head().await?;
        let summary = ReloadSummary {
            revision: revision.clone(),
            accounts: loaded.list_accounts().count(),
            products: loaded.list_products().count(),
        };
        *self.book.write() = Arc::new(loaded);
        self.status.lock().record_reload(revision.clone());
        state
            .dispatcher
            .dispatch(&LedgerEvent::Reloaded {
                revision,
                accounts: summary.accounts,
                products: summary.products,
            })
            .await;
        Ok(summary)
    }

    /// Read products and the ledger from the working copy into a new book.
    async fn load(&self) -> Result<AccountBook, LedgerError> {
        let definitions = self.products.load().await?;
        let products = build_products(definitions, self.event_mode)
            .map_err(|e| {
                LedgerError::update_failed_with(format!("Failed to load products: {}", e), e)
            })?;

        let engine = self.engine.clone();
        let root = self.repo.workdir().join(&self.paths.root);
        let loaded = tokio::task::spawn_blocking(move || engine.load(&root))
            .await
            .map_err(|e| LedgerError::update_failed_with("Ledger load task failed", e))?;
        if !loaded.errors.is_empty() {
            let message = std::iter::once("Failed to load ledger".to_string())
                .chain(loaded.errors.iter().map(|e| e.to_string()))
                .join("\n");
            return Err(LedgerError::update_failed(message));
        }

        let query = AccountBook::balance_query(&self.accounts);
        let rows = self.engine.query(&loaded.entries, &loaded.options, &query);
        debug!(
            "Loaded {} entries, {} balance rows",
            loaded.entries.len(),
            rows.len()
        );
        AccountBook::from_ledger(
            &loaded.entries,
            loaded.options,
            rows,
            products,
            &self.accounts,
        )
    }

    /// Append with the writer lock held.
    ///
    /// The transaction text is rendered once. Every attempt writes it to the
    /// instance ledger inside a fresh git-transaction scope; a rejected push
    /// resets the working copy, so the text is never committed twice.
    pub async fn append_locked(
        &self,
        state: &mut WriterState,
        pending: PendingTransaction,
    ) -> Result<AppendOutcome, LedgerError> {
        self.validator
            .validate(&pending.transaction, self.book().options())?;
        let text = format!("{}\n", self.engine.print(&pending.transaction));
        let message = format!("Automatic commit: {}", pending.narration());

        let mut attempt = 0;
        loop {
            attempt += 1;
            let shard = self.ensure_instance_ledger_locked(state).await?;
            self.status.lock().begin_mutation();

            let workdir = self.repo.workdir();
            let instance = &mut state.instance;
            let result = GitTransaction::new(self.repo.as_ref(), message.as_str())
                .run(async {
                    let file = instance.acquire(workdir).await?;
                    file.write_all(text.as_bytes()).await?;
                    file.flush().await?;
                    self.repo.stage(&shard).await?;
                    Ok(())
                })
                .await;

            match result {
                Ok(outcome) => {
                    {
                        let mut status = self.status.lock();
                        status.record_push(outcome.revision.clone());
                        status.record_append();
                    }
                    let (updated, members) = self
                        .balance_updates
                        .apply(&self.book(), &pending.transaction);
                    *self.book.write() = Arc::new(updated);

                    state
                        .dispatcher
                        .dispatch(&LedgerEvent::TransactionCommitted {
                            kind: pending.kind,
                            narration: pending.narration().to_string(),
                            revision: outcome.revision.clone(),
                            attempts: attempt,
                        })
                        .await;
                    return Ok(AppendOutcome {
                        message: result_message(&pending, &members),
                        members,
                        revision: outcome.revision,
                        attempts: attempt,
                    });
                }
                Err(failure) => {
                    self.recover_from_conflict(state, failure, attempt).await?;
                    // Accounts may have been closed upstream in the meantime
                    let query = AccountBook::balance_query(&self.accounts);
                    self.balance_updates.ensure_accounts_exist(
                        &self.book(),
                        &pending.transaction,
                        |account| query.matches(account),
                    )?;
                }
            }
        }
    }

    /// Make sure this process has a registered instance ledger and return
    /// its path relative to the working copy.
    async fn ensure_instance_ledger_locked(
        &self,
        state: &mut WriterState,
    ) -> Result<PathBuf, LedgerError> {
        if let Some(name) = state.instance.name() {
            return Ok(name.to_path_buf());
        }

        let shard = self.allocator.claim().await?;
        let message = format!("Automatic commit: register {}", shard.display());
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.status.lock().begin_mutation();
            let result = GitTransaction::new(self.repo.as_ref(), message.as_str())
                .run(self.allocator.register(self.repo.as_ref(), &shard))
                .await;
            match result {
                Ok(outcome) => {
                    self.status.lock().record_push(outcome.revision);
                    info!("Registered instance ledger {:?}", shard);
                    state.instance.register(shard.clone());
                    return Ok(shard);
                }
                Err(failure) => self.recover_from_conflict(state, failure, attempt).await?,
            }
        }
    }

    /// Handle a failed scope. Returns `Ok` when the scope should be retried,
    /// after the working copy has been fast-forwarded.
    async fn recover_from_conflict(
        &self,
        state: &mut WriterState,
        failure: ScopeFailure,
        attempt: u32,
    ) -> Result<(), LedgerError> {
        state.instance.mark_stale();
        if let Some(revision) = &failure.rolled_back_to {
            state
                .dispatcher
                .dispatch(&LedgerEvent::RolledBack {
                    revision: revision.clone(),
                    reason: failure.error.to_string(),
                })
                .await;
        }
        // Without a successful reset the rejected commit is still in the
        // working copy; retrying on top of it would duplicate postings.
        if !failure.error.is_push_conflict() || failure.rolled_back_to.is_none() {
            return Err(failure.error);
        }

        self.status.lock().record_conflict();
        state
            .dispatcher
            .dispatch(&LedgerEvent::PushConflict { attempt })
            .await;
        if !self.policy.allows_retry(attempt) {
            warn!("Giving up after {} push attempts", attempt);
            return Err(LedgerError::RetriesExhausted { attempts: attempt });
        }
        self.reload_locked(state).await.map(|_| ())
    }
}

/// Narration, plus the new balance of the primary account when it changed.
fn result_message(pending: &PendingTransaction, members: &[Member]) -> String {
    let primary = pending
        .primary_account
        .as_deref()
        .and_then(|account| members.iter().find(|member| member.account == account));
    match primary {
        Some(member) => format!(
            "{} (and now has €{})",
            pending.narration(),
            member.balance_eur()
        ),
        None => pending.narration().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Transaction;
    use crate::testing::{FakeReplicatedStore, PushOutcome, write_files};
    use crate::transaction::TransactionKind;
    use chrono::{NaiveDate, TimeZone, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    const ROOT: &str = r#"option "title" "Test bar"
option "operating_currency" "EUR"
include "ledger/dynamic.beancount"

1970-01-01 open Liabilities:Bar:Members:Alice

1970-01-01 open Liabilities:Bar:Members:Bob

1970-01-01 open Assets:Cash:Bar

1970-01-01 open Income:Bar

1970-01-01 open Assets:Bar:Inventory

1970-01-01 open Liabilities:Suppliers:Brewery

2024-01-01 * "Alice tops up"
  Liabilities:Bar:Members:Alice  -20.00 EUR
  Assets:Cash:Bar  20.00 EUR
"#;

    const PRODUCTS: &str = r#"- name: Club Mate
  currency: CM
  price: 1.50
- name: Beer
  currency: BEER
  price: 2.00
  payback:
    account: Liabilities:Suppliers:Brewery
    amount: 0.20
"#;

    const SHARD: &str = "ledger/bar01_20240501T123000.000000Z.beancount";

    struct Fixture {
        dir: tempfile::TempDir,
        repo: Arc<FakeReplicatedStore>,
        store: LedgerStore,
    }

    impl Fixture {
        fn read(&self, path: &str) -> String {
            std::fs::read_to_string(self.dir.path().join(path)).unwrap_or_default()
        }

        fn balance(&self, member: &str) -> Decimal {
            self.store.get_member(member).unwrap().balance_eur()
        }
    }

    fn fixture_with(builder: impl FnOnce(LedgerStoreBuilder) -> LedgerStoreBuilder) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        write_files(
            dir.path(),
            &[
                ("bartab.beancount", ROOT),
                ("ledger/dynamic.beancount", ""),
                ("static/products.yml", PRODUCTS),
            ],
        )
        .unwrap();
        let repo = Arc::new(FakeReplicatedStore::new(dir.path()).unwrap());
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        let store = builder(
            LedgerStore::builder(repo.clone())
                .with_hostname("bar01")
                .with_clock(Arc::new(move || now)),
        )
        .build();
        Fixture { dir, repo, store }
    }

    async fn loaded() -> Fixture {
        let fixture = fixture_with(|builder| builder);
        fixture.store.reload().await.unwrap();
        fixture
    }

    fn deposit(member: &str, amount: Decimal) -> TransactionRequest {
        TransactionRequest::Deposit {
            member: member.to_string(),
            amount,
        }
    }

    #[tokio::test]
    async fn test_reload_builds_book() {
        let fixture = fixture_with(|builder| builder);
        assert!(!fixture.store.is_synchronized());

        let summary = fixture.store.reload().await.unwrap();
        assert_eq!(summary.accounts, 3);
        assert_eq!(summary.products, 2);
        assert!(fixture.store.is_synchronized());

        assert_eq!(fixture.balance("Alice"), dec!(20.00));
        assert_eq!(fixture.balance("--cash--"), dec!(-20.00));
        assert_eq!(fixture.store.get_product("CM").unwrap().name, "Club Mate");
        assert!(fixture.store.get_member("Carol").unwrap_err().is_not_found());
        assert_eq!(fixture.repo.count("pull"), 1);
    }

    #[tokio::test]
    async fn test_deposit() {
        let fixture = loaded().await;
        let outcome = fixture.store.submit(deposit("Alice", dec!(10.00))).await.unwrap();

        assert_eq!(outcome.attempts, 1);
        assert_eq!(fixture.balance("Alice"), dec!(10.00));
        assert_eq!(fixture.balance("--cash--"), dec!(-10.00));
        assert!(outcome.message.ends_with("(and now has €10.00)"));
        assert_eq!(outcome.view().members["Alice"].balance, dec!(10.00));
        assert!(fixture.store.is_synchronized());

        // Written to this instance's shard, which the dynamic ledger includes
        assert_eq!(fixture.read(SHARD).matches("deposited").count(), 1);
        assert_eq!(
            fixture.read("ledger/dynamic.beancount"),
            "include \"bar01_20240501T123000.000000Z.beancount\"\n"
        );
        assert_eq!(fixture.repo.pushed(), Some(outcome.revision));
    }

    #[tokio::test]
    async fn test_transfer_keeps_member_total() {
        let fixture = loaded().await;
        let total_before = fixture.balance("Alice") + fixture.balance("Bob");

        fixture
            .store
            .submit(TransactionRequest::Transfer {
                payer: "Alice".to_string(),
                payee: "Bob".to_string(),
                amount: dec!(5.00),
            })
            .await
            .unwrap();

        assert_eq!(fixture.balance("Alice"), dec!(15.00));
        assert_eq!(fixture.balance("Bob"), dec!(5.00));
        assert_eq!(fixture.balance("Alice") + fixture.balance("Bob"), total_before);
    }

    #[tokio::test]
    async fn test_purchase_with_payback() {
        let fixture = loaded().await;
        let outcome = fixture
            .store
            .submit(TransactionRequest::Purchase {
                buyer: "Bob".to_string(),
                items: vec![("BEER".to_string(), dec!(3))],
            })
            .await
            .unwrap();

        let bob = fixture.store.get_member("Bob").unwrap();
        assert_eq!(bob.balance_eur(), dec!(-6.00));
        assert_eq!(bob.item_count(), dec!(3));
        assert_eq!(outcome.members.len(), 1);

        let shard = fixture.read(SHARD);
        assert!(shard.contains("Liabilities:Suppliers:Brewery"));
        assert!(shard.contains("-0.60 EUR"));
        assert!(shard.contains("-5.40 EUR"));
    }

    #[tokio::test]
    async fn test_appends_agree_with_reload() {
        let fixture = loaded().await;
        fixture.store.submit(deposit("Bob", dec!(3.50))).await.unwrap();
        fixture
            .store
            .submit(TransactionRequest::Purchase {
                buyer: "Alice".to_string(),
                items: vec![("CM".to_string(), dec!(2)), ("BEER".to_string(), dec!(1))],
            })
            .await
            .unwrap();
        fixture
            .store
            .submit(TransactionRequest::Transfer {
                payer: "Bob".to_string(),
                payee: "Alice".to_string(),
                amount: dec!(1.25),
            })
            .await
            .unwrap();

        let incremental = fixture.store.book().accounts_view();
        fixture.store.reload().await.unwrap();
        assert_eq!(fixture.store.book().accounts_view(), incremental);
        assert_eq!(fixture.store.status().appends, 3);
    }

    #[tokio::test]
    async fn test_push_conflict_retry_is_idempotent() {
        let fixture = loaded().await;
        // Registration goes through, the first append push is rejected
        fixture
            .repo
            .script_push([PushOutcome::Accept, PushOutcome::Reject]);
        fixture.repo.queue_upstream_append(
            "bartab.beancount",
            "\n2024-04-01 * \"Bob pays upstream\"\n  Liabilities:Bar:Members:Bob  1.00 EUR\n  Assets:Cash:Bar  -1.00 EUR\n",
        );

        let outcome = fixture.store.submit(deposit("Alice", dec!(10.00))).await.unwrap();
        assert_eq!(outcome.attempts, 2);
        assert_eq!(fixture.repo.count("reset"), 1);
        assert_eq!(fixture.store.status().push_conflicts, 1);

        assert_eq!(fixture.read(SHARD).matches("deposited").count(), 1);
        assert_eq!(
            fixture
                .repo
                .committed_file(SHARD)
                .unwrap()
                .matches("deposited")
                .count(),
            1
        );
        assert_eq!(fixture.balance("Alice"), dec!(10.00));
        assert_eq!(fixture.balance("Bob"), dec!(-1.00));

        let incremental = fixture.store.book().accounts_view();
        fixture.store.reload().await.unwrap();
        assert_eq!(fixture.store.book().accounts_view(), incremental);
    }

    #[tokio::test]
    async fn test_bounded_retry_gives_up() {
        let fixture = fixture_with(|builder| builder.with_retry_policy(RetryPolicy::bounded(2)));
        fixture.store.reload().await.unwrap();
        fixture.repo.script_push([
            PushOutcome::Accept,
            PushOutcome::Reject,
            PushOutcome::Reject,
        ]);

        let err = fixture
            .store
            .submit(deposit("Alice", dec!(10.00)))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::RetriesExhausted { attempts: 2 }));
        assert_eq!(fixture.read(SHARD), "");
        assert_eq!(fixture.balance("Alice"), dec!(20.00));
        assert!(!fixture.store.is_synchronized());
    }

    #[tokio::test]
    async fn test_account_closed_upstream_during_retry() {
        let fixture = loaded().await;
        fixture
            .repo
            .script_push([PushOutcome::Accept, PushOutcome::Reject]);
        fixture.repo.queue_upstream_append(
            "bartab.beancount",
            "\n2024-04-01 close Liabilities:Bar:Members:Bob\n",
        );

        let err = fixture
            .store
            .submit(TransactionRequest::Transfer {
                payer: "Alice".to_string(),
                payee: "Bob".to_string(),
                amount: dec!(5.00),
            })
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(fixture.balance("Alice"), dec!(20.00));
        assert_eq!(fixture.read(SHARD), "");
    }

    #[tokio::test]
    async fn test_duplicate_product_currency_rolls_back() {
        let fixture = loaded().await;
        fixture.repo.queue_upstream_append(
            "static/products.yml",
            "- name: Mate Again\n  currency: CM\n  price: 1.00\n",
        );

        let err = fixture.store.reload().await.unwrap_err();
        assert!(matches!(err, LedgerError::UpdateFailed { .. }));
        assert_eq!(fixture.repo.count("reset"), 1);
        assert!(!fixture.read("static/products.yml").contains("Mate Again"));
        assert!(!fixture.store.is_synchronized());
        assert_eq!(fixture.store.status().failed_reloads, 1);

        // The previous book is still served
        assert_eq!(fixture.store.list_products().len(), 2);
        assert_eq!(fixture.balance("Alice"), dec!(20.00));
    }

    #[tokio::test]
    async fn test_ledger_errors_roll_back() {
        let fixture = loaded().await;
        fixture
            .repo
            .queue_upstream_append("bartab.beancount", "include \"missing.beancount\"\n");

        let err = fixture.store.reload().await.unwrap_err();
        match &err {
            LedgerError::UpdateFailed { message, .. } => {
                assert!(message.starts_with("Failed to load ledger\n"));
                assert!(message.contains("missing.beancount"));
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(!fixture.read("bartab.beancount").contains("missing"));
    }

    #[tokio::test]
    async fn test_pull_failure_does_not_reset() {
        let fixture = loaded().await;
        fixture.repo.fail_next_pull("CONFLICT (content): Merge conflict in bartab.beancount");

        let err = fixture.store.reload().await.unwrap_err();
        assert!(err.to_string().contains("Failed to pull upstream changes"));
        assert_eq!(fixture.repo.count("reset"), 0);
        assert!(!fixture.store.is_synchronized());
    }

    #[tokio::test]
    async fn test_imbalanced_transaction_has_no_side_effects() {
        let fixture = loaded().await;
        fixture.repo.clear_calls();

        let mut txn = Transaction::new(NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(), "broken");
        txn.add_posting("Liabilities:Bar:Members:Alice", dec!(3.00), "EUR");
        txn.add_posting("Income:Bar", dec!(-2.90), "EUR");
        let pending = PendingTransaction {
            kind: TransactionKind::Purchase,
            primary_account: None,
            transaction: txn,
        };

        let err = fixture.store.append(pending).await.unwrap_err();
        assert!(matches!(err, LedgerError::ImbalancedTransaction { .. }));
        assert!(fixture.repo.calls().is_empty());
        assert!(!fixture.dir.path().join(SHARD).exists());
        assert_eq!(fixture.balance("Alice"), dec!(20.00));
    }

    #[tokio::test]
    async fn test_unknown_member_is_not_found() {
        let fixture = loaded().await;
        fixture.repo.clear_calls();
        let err = fixture
            .store
            .submit(deposit("Carol", dec!(1.00)))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(fixture.repo.calls().is_empty());
    }

    struct Recorder(Arc<Mutex<Vec<LedgerEvent>>>);

    #[async_trait::async_trait]
    impl LedgerEventHandler for Recorder {
        async fn handle(&mut self, event: &LedgerEvent) -> Result<(), LedgerError> {
            self.0.lock().push(event.clone());
            Ok(())
        }

        fn name(&self) -> &'static str {
            "recorder"
        }
    }

    #[tokio::test]
    async fn test_events() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let fixture =
            fixture_with(|builder| builder.with_event_handler(Box::new(Recorder(seen.clone()))));
        fixture.store.reload().await.unwrap();
        fixture.repo.script_push([PushOutcome::Accept, PushOutcome::Reject]);
        fixture.store.submit(deposit("Alice", dec!(1.00))).await.unwrap();

        let events = seen.lock().clone();
        assert!(matches!(events[0], LedgerEvent::Reloaded { accounts: 3, .. }));
        assert!(matches!(events[1], LedgerEvent::RolledBack { .. }));
        assert_eq!(events[2], LedgerEvent::PushConflict { attempt: 1 });
        assert!(matches!(events[3], LedgerEvent::Reloaded { .. }));
        match &events[4] {
            LedgerEvent::TransactionCommitted {
                kind, attempts, ..
            } => {
                assert_eq!(*kind, TransactionKind::Deposit);
                assert_eq!(*attempts, 2);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(fixture.dir.path().join(SHARD).exists());
    }
}
