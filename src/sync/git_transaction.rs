//! Git-transaction scope.
//!
//! Every mutation of the replicated store runs inside a [`GitTransaction`]:
//! the current HEAD is recorded, the body writes and stages files, the
//! staged changes are committed and pushed. Any failure after the snapshot
//! resets the working copy hard to it, so a failed scope leaves no trace.
//! A rejected push surfaces as [`LedgerError::PushConflict`]; deciding
//! whether to pull and retry is left to the caller.

use crate::error::LedgerError;
use crate::repo::{ReplicatedStore, Revision};

use std::future::Future;
use tracing::{debug, error, warn};

/// Where a scope currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    Snapshot,
    Mutate,
    Commit,
    Push,
    Done,
    /// The push was rejected because the remote moved ahead
    Conflict,
    RolledBack,
}

/// Result of a scope that was committed and pushed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeOutcome<T> {
    /// What the body returned
    pub value: T,
    /// HEAD before the body ran
    pub snapshot: Revision,
    /// HEAD after the commit; equal to `snapshot` when nothing was staged
    pub revision: Revision,
    pub committed: bool,
}

/// A failed scope.
#[derive(Debug)]
pub struct ScopeFailure {
    pub error: LedgerError,
    /// The revision the working copy was reset to, if a reset happened and succeeded
    pub rolled_back_to: Option<Revision>,
}

impl From<ScopeFailure> for LedgerError {
    fn from(failure: ScopeFailure) -> Self {
        failure.error
    }
}

/// One snapshot, mutate, commit, push cycle.
pub struct GitTransaction<'r> {
    repo: &'r dyn ReplicatedStore,
    message: String,
    state: ScopeState,
}

impl<'r> GitTransaction<'r> {
    /// Create a scope that commits with `message`.
    pub fn new(repo: &'r dyn ReplicatedStore, message: impl Into<String>) -> Self {
        Self {
            repo,
            message: message.into(),
            state: ScopeState::Snapshot,
        }
    }

    pub fn state(&self) -> ScopeState {
        self.state
    }

    /// Run `body` inside the scope.
    ///
    /// The body must only write files and stage them; committing and pushing
    /// is done here. Failures of the body, the commit or the push reset the
    /// working copy to the snapshot before the error is returned.
    pub async fn run<T, F>(mut self, body: F) -> Result<ScopeOutcome<T>, ScopeFailure>
    where
        F: Future<Output = Result<T, LedgerError>>,
    {
        self.transition(ScopeState::Snapshot);
        let snapshot = self
            .repo
            .rev_parse_head()
            .await
            .map_err(|e| ScopeFailure {
                error: e.into(),
                rolled_back_to: None,
            })?;

        self.transition(ScopeState::Mutate);
        let value = match body.await {
            Ok(value) => value,
            Err(e) => return Err(self.rollback(&snapshot, e).await),
        };

        self.transition(ScopeState::Commit);
        let committed = match self.repo.commit_all(&self.message).await {
            Ok(committed) => committed,
            Err(e) => return Err(self.rollback(&snapshot, e.into()).await),
        };
        // Read the new HEAD before publishing: once the push is accepted the
        // scope must not fail any more.
        let revision = match self.repo.rev_parse_head().await {
            Ok(revision) => revision,
            Err(e) => return Err(self.rollback(&snapshot, e.into()).await),
        };

        self.transition(ScopeState::Push);
        if let Err(e) = self.repo.push().await {
            let error = if e.is_push_rejected() {
                self.transition(ScopeState::Conflict);
                LedgerError::PushConflict(e.to_string())
            } else {
                e.into()
            };
            return Err(self.rollback(&snapshot, error).await);
        }

        self.transition(ScopeState::Done);
        Ok(ScopeOutcome {
            value,
            snapshot,
            revision,
            committed,
        })
    }

    async fn rollback(&mut self, snapshot: &Revision, error: LedgerError) -> ScopeFailure {
        warn!(
            "Git transaction \"{}\" failed in {:?}: {}",
            self.message, self.state, error
        );
        self.transition(ScopeState::RolledBack);
        match self.repo.reset_hard(snapshot).await {
            Ok(()) => ScopeFailure {
                error,
                rolled_back_to: Some(snapshot.clone()),
            },
            Err(reset_error) => {
                error!("Failed to reset to {}: {}", snapshot, reset_error);
                ScopeFailure {
                    error,
                    rolled_back_to: None,
                }
            }
        }
    }

    fn transition(&mut self, next: ScopeState) {
        debug!("Git transaction: {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}
