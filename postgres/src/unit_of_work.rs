//! [`UnitOfWork`] over an sqlx transaction.

use meshbus_core::broker::BrokerFuture;
use meshbus_core::unit_of_work::{CommitHook, UnitOfWork, UnitOfWorkError};
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, MappedMutexGuard, MutexGuard as AsyncMutexGuard};

/// A database transaction that runs post-commit hooks.
///
/// Dropping an unfinished unit of work rolls the transaction back (sqlx does
/// so when the transaction is dropped) and discards every hook.
pub struct PgUnitOfWork {
    tx: AsyncMutex<Option<Transaction<'static, Postgres>>>,
    hooks: Mutex<Vec<CommitHook>>,
}

impl PgUnitOfWork {
    /// Begin a transaction on `pool`.
    ///
    /// # Errors
    ///
    /// Returns [`UnitOfWorkError::Transaction`] if `BEGIN` fails.
    pub async fn begin(pool: &PgPool) -> Result<Self, UnitOfWorkError> {
        let tx = pool
            .begin()
            .await
            .map_err(|e| UnitOfWorkError::Transaction(e.to_string()))?;
        Ok(Self {
            tx: AsyncMutex::new(Some(tx)),
            hooks: Mutex::new(Vec::new()),
        })
    }

    /// The open transaction, for running statements inside it.
    ///
    /// # Errors
    ///
    /// Returns [`UnitOfWorkError::AlreadyFinished`] after commit or rollback.
    pub async fn transaction(
        &self,
    ) -> Result<MappedMutexGuard<'_, Transaction<'static, Postgres>>, UnitOfWorkError> {
        AsyncMutexGuard::try_map(self.tx.lock().await, Option::as_mut)
            .map_err(|_| UnitOfWorkError::AlreadyFinished)
    }

    fn hooks(&self) -> MutexGuard<'_, Vec<CommitHook>> {
        self.hooks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn finish(&self) -> Result<Transaction<'static, Postgres>, UnitOfWorkError> {
        self.tx
            .lock()
            .await
            .take()
            .ok_or(UnitOfWorkError::AlreadyFinished)
    }
}

impl UnitOfWork for PgUnitOfWork {
    fn on_commit(&self, hook: CommitHook) {
        self.hooks().push(hook);
    }

    fn commit(&self) -> BrokerFuture<'_, Result<(), UnitOfWorkError>> {
        Box::pin(async move {
            let tx = self.finish().await?;
            let hooks = std::mem::take(&mut *self.hooks());

            if let Err(e) = tx.commit().await {
                tracing::warn!(
                    error = %e,
                    discarded_hooks = hooks.len(),
                    "Commit failed; post-commit hooks discarded"
                );
                return Err(UnitOfWorkError::Transaction(e.to_string()));
            }

            tracing::debug!(hooks = hooks.len(), "Committed; running post-commit hooks");
            for hook in hooks {
                hook().await;
            }
            Ok(())
        })
    }

    fn rollback(&self) -> BrokerFuture<'_, Result<(), UnitOfWorkError>> {
        Box::pin(async move {
            let tx = self.finish().await?;
            let discarded = std::mem::take(&mut *self.hooks()).len();
            tx.rollback()
                .await
                .map_err(|e| UnitOfWorkError::Transaction(e.to_string()))?;
            tracing::debug!(discarded_hooks = discarded, "Rolled back");
            Ok(())
        })
    }
}
