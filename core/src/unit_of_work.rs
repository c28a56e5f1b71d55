//! Unit of work seam used by the transactional outbox.
//!
//! The storage collaborator owns the transaction. This layer only needs to
//! register work that must run once the transaction has committed, and never
//! otherwise.

use crate::broker::BrokerFuture;
use thiserror::Error;

/// Work scheduled to run after a successful commit.
pub type CommitHook = Box<dyn FnOnce() -> BrokerFuture<'static, ()> + Send>;

/// Errors from committing or rolling back.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnitOfWorkError {
    /// The unit of work was already committed or rolled back.
    #[error("Unit of work already finished")]
    AlreadyFinished,

    /// The underlying transaction failed.
    #[error("Transaction failed: {0}")]
    Transaction(String),
}

/// A transaction boundary with post-commit hooks.
///
/// Implementations guarantee:
///
/// - hooks run only after `commit` succeeded, in registration order;
/// - `rollback`, a failed commit, or dropping the unit of work discards every
///   hook without running it.
///
/// There is no `begin` here: a unit of work is begun by constructing it, and
/// each implementation's constructor opens the transaction
/// (`meshbus_postgres::PgUnitOfWork::begin(&pool)`, or
/// `meshbus_testing::InMemoryUnitOfWork::new()` in tests). The outbox is then
/// attached with `OutboxFactory::begin(&unit_of_work)`.
pub trait UnitOfWork: Send + Sync {
    /// Register `hook` to run after commit.
    fn on_commit(&self, hook: CommitHook);

    /// Commit, then run the hooks.
    ///
    /// # Errors
    ///
    /// Returns [`UnitOfWorkError`] if the commit fails; hooks are discarded.
    fn commit(&self) -> BrokerFuture<'_, Result<(), UnitOfWorkError>>;

    /// Roll back and discard the hooks.
    ///
    /// # Errors
    ///
    /// Returns [`UnitOfWorkError`] if the rollback fails.
    fn rollback(&self) -> BrokerFuture<'_, Result<(), UnitOfWorkError>>;
}
