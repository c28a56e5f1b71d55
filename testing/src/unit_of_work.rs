//! In-memory unit of work.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on poisoned locks

use meshbus_core::broker::BrokerFuture;
use meshbus_core::unit_of_work::{CommitHook, UnitOfWork, UnitOfWorkError};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Lifecycle of an [`InMemoryUnitOfWork`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    /// Accepting hooks.
    Open,
    /// Committed; hooks ran.
    Committed,
    /// Rolled back or failed to commit; hooks discarded.
    RolledBack,
}

/// [`UnitOfWork`] with no backing storage. Commit can be forced to fail.
pub struct InMemoryUnitOfWork {
    hooks: Mutex<Vec<CommitHook>>,
    state: Mutex<UnitState>,
    fail_commit: AtomicBool,
}

impl InMemoryUnitOfWork {
    /// Open unit of work.
    #[must_use]
    pub fn new() -> Self {
        Self {
            hooks: Mutex::new(Vec::new()),
            state: Mutex::new(UnitState::Open),
            fail_commit: AtomicBool::new(false),
        }
    }

    /// Make the next commit fail as if the transaction aborted.
    pub fn fail_next_commit(&self) {
        self.fail_commit.store(true, Ordering::SeqCst);
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> UnitState {
        *self.state.lock().unwrap()
    }

    /// Hooks registered and not yet run.
    #[must_use]
    pub fn pending_hooks(&self) -> usize {
        self.hooks.lock().unwrap().len()
    }

    fn finish(&self, next: UnitState) -> Result<Vec<CommitHook>, UnitOfWorkError> {
        let mut state = self.state.lock().unwrap();
        if *state != UnitState::Open {
            return Err(UnitOfWorkError::AlreadyFinished);
        }
        *state = next;
        Ok(std::mem::take(&mut *self.hooks.lock().unwrap()))
    }
}

impl Default for InMemoryUnitOfWork {
    fn default() -> Self {
        Self::new()
    }
}

impl UnitOfWork for InMemoryUnitOfWork {
    fn on_commit(&self, hook: CommitHook) {
        if *self.state.lock().unwrap() == UnitState::Open {
            self.hooks.lock().unwrap().push(hook);
        }
    }

    fn commit(&self) -> BrokerFuture<'_, Result<(), UnitOfWorkError>> {
        Box::pin(async move {
            if self.fail_commit.swap(false, Ordering::SeqCst) {
                self.finish(UnitState::RolledBack)?;
                return Err(UnitOfWorkError::Transaction(
                    "in-memory commit failed".to_string(),
                ));
            }
            for hook in self.finish(UnitState::Committed)? {
                hook().await;
            }
            Ok(())
        })
    }

    fn rollback(&self) -> BrokerFuture<'_, Result<(), UnitOfWorkError>> {
        Box::pin(async move {
            self.finish(UnitState::RolledBack)?;
            Ok(())
        })
    }
}
