//! Synchronization status.
//!
//! Tracks whether the in-memory book is known to match the last durable,
//! pushed state, along with counters describing what the store has done.

use crate::repo::Revision;
use tracing::debug;

/// Synchronization state and counters for one store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStatus {
    /// True only between a successful push (or reload) and the next mutation
    pub synchronized: bool,
    /// Revision of the last successful push or reload
    pub last_revision: Option<Revision>,
    pub appends: u64,
    pub push_conflicts: u64,
    pub reloads: u64,
    pub failed_reloads: u64,
}

impl SyncStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A mutation is about to start.
    pub fn begin_mutation(&mut self) {
        self.synchronized = false;
    }

    /// A scope pushed successfully.
    pub fn record_push(&mut self, revision: Revision) {
        debug!("Synchronized at {}", revision);
        self.synchronized = true;
        self.last_revision = Some(revision);
    }

    pub fn record_append(&mut self) {
        self.appends += 1;
    }

    pub fn record_conflict(&mut self) {
        self.synchronized = false;
        self.push_conflicts += 1;
    }

    pub fn record_reload(&mut self, revision: Revision) {
        self.reloads += 1;
        self.record_push(revision);
    }

    pub fn record_failed_reload(&mut self) {
        self.synchronized = false;
        self.failed_reloads += 1;
    }

    /// Get a human-readable summary of the status
    pub fn summary(&self) -> String {
        format!(
            "{} at {}: {} appends, {} push conflicts, {} reloads{}",
            if self.synchronized {
                "synchronized"
            } else {
                "not synchronized"
            },
            self.last_revision
                .as_ref()
                .map(|r| r.to_string())
                .unwrap_or_else(|| "-".to_string()),
            self.appends,
            self.push_conflicts,
            self.reloads,
            if self.failed_reloads == 0 {
                String::new()
            } else {
                format!(" ({} failed)", self.failed_reloads)
            }
        )
    }
}
