//! Lease-based lock store on a single table.
//!
//! ```sql
//! mesh_leases(key TEXT PRIMARY KEY, token TEXT, expires_at TIMESTAMPTZ)
//! ```
//!
//! Acquire is one upsert that only overwrites an expired row, so two
//! replicas racing for the same key cannot both win. Refresh and release
//! match on the token, so a replica whose lease was taken over cannot touch
//! the new holder's row. All times come from the database clock.

use chrono::{DateTime, Utc};
use meshbus_core::broker::BrokerFuture;
use meshbus_core::lock::{LeaseToken, LockError, LockStore};
use sqlx::PgPool;
use std::time::Duration;

/// Current holder of a lease, for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    /// Lock key.
    pub key: String,
    /// When the lease lapses unless refreshed.
    pub expires_at: DateTime<Utc>,
}

/// `PostgreSQL` implementation of [`LockStore`].
#[derive(Clone)]
pub struct PgLockStore {
    pool: PgPool,
}

fn millis(lease: Duration) -> f64 {
    lease.as_secs_f64() * 1000.0
}

fn unavailable(error: &sqlx::Error) -> LockError {
    LockError::Unavailable(error.to_string())
}

impl PgLockStore {
    /// Create a lock store over `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the lease table if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Unavailable`] if the statement fails.
    pub async fn ensure_schema(&self) -> Result<(), LockError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS mesh_leases (
                key TEXT PRIMARY KEY,
                token TEXT NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| unavailable(&e))?;
        Ok(())
    }

    /// The live lease on `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Unavailable`] if the query fails.
    pub async fn lease(&self, key: &str) -> Result<Option<LeaseRecord>, LockError> {
        let row: Option<(String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT key, expires_at FROM mesh_leases WHERE key = $1 AND expires_at > now()",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| unavailable(&e))?;

        Ok(row.map(|(key, expires_at)| LeaseRecord { key, expires_at }))
    }
}

impl LockStore for PgLockStore {
    fn try_acquire<'a>(
        &'a self,
        key: &'a str,
        lease: Duration,
    ) -> BrokerFuture<'a, Result<Option<LeaseToken>, LockError>> {
        Box::pin(async move {
            let token = LeaseToken::generate(key);
            let acquired: Option<(String,)> = sqlx::query_as(
                r"
                INSERT INTO mesh_leases (key, token, expires_at)
                VALUES ($1, $2, now() + $3 * interval '1 millisecond')
                ON CONFLICT (key) DO UPDATE
                    SET token = EXCLUDED.token, expires_at = EXCLUDED.expires_at
                    WHERE mesh_leases.expires_at <= now()
                RETURNING token
                ",
            )
            .bind(key)
            .bind(token.token())
            .bind(millis(lease))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| unavailable(&e))?;

            if acquired.is_some() {
                tracing::debug!(lock_key = %key, "Lease acquired");
                Ok(Some(token))
            } else {
                Ok(None)
            }
        })
    }

    fn refresh<'a>(
        &'a self,
        token: &'a LeaseToken,
        lease: Duration,
    ) -> BrokerFuture<'a, Result<(), LockError>> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE mesh_leases
                SET expires_at = now() + $3 * interval '1 millisecond'
                WHERE key = $1 AND token = $2 AND expires_at > now()
                ",
            )
            .bind(token.key())
            .bind(token.token())
            .bind(millis(lease))
            .execute(&self.pool)
            .await
            .map_err(|e| unavailable(&e))?;

            if result.rows_affected() == 0 {
                return Err(LockError::LeaseLost {
                    key: token.key().to_string(),
                });
            }
            Ok(())
        })
    }

    fn release<'a>(&'a self, token: &'a LeaseToken) -> BrokerFuture<'a, Result<(), LockError>> {
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM mesh_leases WHERE key = $1 AND token = $2")
                .bind(token.key())
                .bind(token.token())
                .execute(&self.pool)
                .await
                .map_err(|e| unavailable(&e))?;

            if result.rows_affected() == 0 {
                tracing::debug!(lock_key = %token.key(), "Released lease was already gone");
            }
            Ok(())
        })
    }
}
