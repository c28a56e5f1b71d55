//! External lock store shared by every replica of every service.
//!
//! A lease is held under a unique token; refresh and release only succeed for
//! the token that currently owns the key, so a replica whose lease expired
//! cannot extend or delete a lease another replica has since taken.

use crate::broker::BrokerFuture;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Error type for lock store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// The store could not be reached or rejected the operation.
    #[error("Lock store unavailable: {0}")]
    Unavailable(String),

    /// The lease expired or was taken over; the token no longer owns the key.
    #[error("Lease on '{key}' lost")]
    LeaseLost {
        /// Lock key.
        key: String,
    },

    /// Any other lock error.
    #[error("Lock error: {0}")]
    Other(String),
}

/// Proof of ownership of a lease.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct LeaseToken {
    key: String,
    token: String,
}

impl LeaseToken {
    /// Token with a fresh random value.
    #[must_use]
    pub fn generate(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            token: Uuid::new_v4().to_string(),
        }
    }

    /// Rebuild a token from stored parts.
    #[must_use]
    pub fn from_parts(key: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            token: token.into(),
        }
    }

    /// Locked key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Ownership value.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseToken").field("key", &self.key).finish_non_exhaustive()
    }
}

/// `tryAcquire` / `refresh` / `release` over an external store.
pub trait LockStore: Send + Sync {
    /// Take `key` for `lease` if nobody holds it (or the holder's lease
    /// expired). Returns `None` when the key is held elsewhere.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Unavailable`] if the store fails.
    fn try_acquire<'a>(
        &'a self,
        key: &'a str,
        lease: Duration,
    ) -> BrokerFuture<'a, Result<Option<LeaseToken>, LockError>>;

    /// Extend a held lease to `lease` from now.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::LeaseLost`] if `token` no longer owns the key.
    fn refresh<'a>(
        &'a self,
        token: &'a LeaseToken,
        lease: Duration,
    ) -> BrokerFuture<'a, Result<(), LockError>>;

    /// Release a held lease. Releasing a lease that was already lost is not
    /// an error.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Unavailable`] if the store fails.
    fn release<'a>(&'a self, token: &'a LeaseToken) -> BrokerFuture<'a, Result<(), LockError>>;
}
