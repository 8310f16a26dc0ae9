//! Event system for ledger synchronization.
//!
//! The store emits an event at each externally interesting step of the write
//! path: a reload finished, a transaction was durably committed, a push was
//! rejected, or the working copy was rolled back. Handlers observe these
//! events; they never influence the outcome of the operation that emitted
//! them.

use crate::error::LedgerError;
use crate::repo::Revision;
use crate::transaction::TransactionKind;
use tracing::{info, warn};

/// Events that occur while synchronizing the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerEvent {
    /// The book was rebuilt from the working copy
    Reloaded {
        revision: Revision,
        accounts: usize,
        products: usize,
    },
    /// A transaction was committed and pushed
    TransactionCommitted {
        kind: TransactionKind,
        narration: String,
        revision: Revision,
        attempts: u32,
    },
    /// The remote moved ahead; the scope will be retried after a reload
    PushConflict { attempt: u32 },
    /// The working copy was reset after a failure
    RolledBack { revision: Revision, reason: String },
}

/// Trait for handling ledger events.
#[async_trait::async_trait]
pub trait LedgerEventHandler: Send + Sync {
    /// Handle a ledger event.
    async fn handle(&mut self, event: &LedgerEvent) -> Result<(), LedgerError>;

    /// Get the name of this handler for logging and diagnostics.
    fn name(&self) -> &'static str;
}

/// Event dispatcher that manages multiple event handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Box<dyn LedgerEventHandler>>,
}

impl EventDispatcher {
    /// Create a new, empty event dispatcher.
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Register a new event handler.
    ///
    /// Handlers are called in the order they are registered.
    pub fn register_handler(&mut self, handler: Box<dyn LedgerEventHandler>) {
        self.handlers.push(handler);
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Dispatch an event to all registered handlers.
    ///
    /// Errors from handlers are logged, but do not stop other handlers from running.
    pub async fn dispatch(&mut self, event: &LedgerEvent) {
        for handler in &mut self.handlers {
            if let Err(e) = handler.handle(event).await {
                tracing::error!("Handler {} failed to process event: {}", handler.name(), e);
            }
        }
    }
}

/// Handler that writes every event to the log.
pub struct LoggingEventHandler;

#[async_trait::async_trait]
impl LedgerEventHandler for LoggingEventHandler {
    async fn handle(&mut self, event: &LedgerEvent) -> Result<(), LedgerError> {
        match event {
            LedgerEvent::Reloaded {
                revision,
                accounts,
                products,
            } => info!(
                "Reloaded at {}: {} accounts, {} products",
                revision, accounts, products
            ),
            LedgerEvent::TransactionCommitted {
                kind,
                narration,
                revision,
                attempts,
            } => info!(
                "Committed {} \"{}\" at {} after {} attempt(s)",
                kind, narration, revision, attempts
            ),
            LedgerEvent::PushConflict { attempt } => {
                warn!("Push rejected on attempt {}, pulling and retrying", attempt)
            }
            LedgerEvent::RolledBack { revision, reason } => {
                warn!("Rolled back to {}: {}", revision, reason)
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "logging"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

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

    struct Failing;

    #[async_trait::async_trait]
    impl LedgerEventHandler for Failing {
        async fn handle(&mut self, _event: &LedgerEvent) -> Result<(), LedgerError> {
            Err(LedgerError::ProductError("boom".into()))
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_stop_others() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = EventDispatcher::new();
        dispatcher.register_handler(Box::new(Failing));
        dispatcher.register_handler(Box::new(LoggingEventHandler));
        dispatcher.register_handler(Box::new(Recorder(seen.clone())));

        let event = LedgerEvent::PushConflict { attempt: 1 };
        dispatcher.dispatch(&event).await;
        assert_eq!(*seen.lock(), vec![event]);
    }
}
