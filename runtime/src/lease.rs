//! Distributed lease manager.
//!
//! Mutual exclusion across every replica of every service, over a shared
//! [`LockStore`]. Two modes:
//!
//! - [`LeaseManager::with_mutex`] waits until the lock is free, then runs the
//!   callback. Use it when the critical section must eventually run.
//! - [`LeaseManager::with_lease_renewing_mutex`] makes a bounded number of
//!   attempts and returns [`LeaseOutcome::Skipped`] if another replica holds
//!   the lock. Use it for periodic jobs that only one replica should run per
//!   tick.
//!
//! While the callback runs, the lease is refreshed every `refresh_interval`,
//! so callbacks may outlive a single lease window. A failed refresh is fatal:
//! the callback is dropped and [`LeaseError::RefreshFailed`] returned. The
//! lock is released exactly once on every path, including callback panics.
//!
//! ```text
//! Idle -> Acquiring -> Skipped
//!                   -> Held (refreshing) -> Released
//! ```

use crate::backoff::BackoffPolicy;
use crate::metrics::LeaseMetrics;
use futures::FutureExt;
use meshbus_core::config::LeaseConfig;
use meshbus_core::lock::{LeaseToken, LockError, LockStore};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};

/// Errors from the lease manager. Losing the race for a lock is not one of
/// them; see [`LeaseOutcome::Skipped`].
#[derive(Error, Debug)]
pub enum LeaseError {
    /// The lock store failed while acquiring.
    #[error("Failed to acquire lease: {0}")]
    Acquire(#[from] LockError),

    /// The lease could not be kept alive; the callback was abandoned.
    #[error("Lease on '{key}' could not be refreshed: {source}")]
    RefreshFailed {
        /// Lock key.
        key: String,
        /// Store failure.
        #[source]
        source: LockError,
    },

    /// The lease would expire before its first refresh.
    #[error(
        "refresh_interval {refresh_interval:?} must be shorter than lease_timeout {lease_timeout:?}"
    )]
    InvalidTiming {
        /// Requested lease length.
        lease_timeout: Duration,
        /// Requested refresh period.
        refresh_interval: Duration,
    },
}

/// Result of a lease-renewing execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome<T> {
    /// The lock was acquired and the callback ran to completion.
    Completed(T),
    /// Another replica holds the lock; the callback did not run.
    Skipped,
}

impl<T> LeaseOutcome<T> {
    /// Whether the callback was skipped.
    #[must_use]
    pub const fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }

    /// The callback's value, if it ran.
    #[must_use]
    pub fn completed(self) -> Option<T> {
        match self {
            Self::Completed(value) => Some(value),
            Self::Skipped => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaseState {
    Acquiring,
    Skipped,
    Held,
    Released,
}

impl fmt::Display for LeaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Acquiring => "acquiring",
            Self::Skipped => "skipped",
            Self::Held => "held",
            Self::Released => "released",
        })
    }
}

/// Lease manager over a shared lock store.
///
/// # Example
///
/// ```no_run
/// use meshbus_core::config::LeaseConfig;
/// use meshbus_runtime::lease::LeaseManager;
/// use std::time::Duration;
///
/// # async fn example(manager: LeaseManager) -> Result<(), meshbus_runtime::lease::LeaseError> {
/// let outcome = manager
///     .with_lease_renewing_mutex(
///         "billing.nightly-invoices",
///         Duration::from_secs(30),
///         Duration::from_secs(10),
///         1,
///         || async { /* run the job */ },
///     )
///     .await?;
///
/// if outcome.is_skipped() {
///     // Another replica is running this tick.
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn LockStore>,
    config: LeaseConfig,
    backoff: BackoffPolicy,
}

impl LeaseManager {
    /// Manager with backoff derived from `config`.
    #[must_use]
    pub fn new(store: Arc<dyn LockStore>, config: LeaseConfig) -> Self {
        Self {
            backoff: BackoffPolicy::from_config(&config),
            store,
            config,
        }
    }

    /// Override the delay between acquire attempts.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Lease defaults in use.
    #[must_use]
    pub const fn config(&self) -> &LeaseConfig {
        &self.config
    }

    /// Wait until `key` is free, run `callback` under the configured lease,
    /// then release.
    ///
    /// # Errors
    ///
    /// - [`LeaseError::Acquire`] if the store fails while acquiring
    /// - [`LeaseError::RefreshFailed`] if the lease was lost mid-callback
    pub async fn with_mutex<F, Fut, T>(&self, key: &str, callback: F) -> Result<T, LeaseError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let LeaseConfig {
            lease_timeout,
            refresh_interval,
            ..
        } = self.config;
        check_timing(lease_timeout, refresh_interval)?;

        tracing::debug!(lock_key = key, state = %LeaseState::Acquiring, "Waiting for lock");
        let mut attempt = 0usize;
        let token = loop {
            if let Some(token) = self.store.try_acquire(key, lease_timeout).await? {
                break token;
            }
            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt = attempt.saturating_add(1);
        };

        self.hold(token, lease_timeout, refresh_interval, callback).await
    }

    /// Try to take `key` up to `max_acquire_attempts` times (at least once)
    /// and run `callback` while renewing the lease. Returns
    /// [`LeaseOutcome::Skipped`] without running `callback` if the lock is
    /// held elsewhere.
    ///
    /// # Errors
    ///
    /// - [`LeaseError::InvalidTiming`] if `refresh_interval >= lease_timeout`
    /// - [`LeaseError::Acquire`] if the store fails while acquiring
    /// - [`LeaseError::RefreshFailed`] if the lease was lost mid-callback
    pub async fn with_lease_renewing_mutex<F, Fut, T>(
        &self,
        key: &str,
        lease_timeout: Duration,
        refresh_interval: Duration,
        max_acquire_attempts: usize,
        callback: F,
    ) -> Result<LeaseOutcome<T>, LeaseError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        check_timing(lease_timeout, refresh_interval)?;

        let attempts = max_acquire_attempts.max(1);
        for attempt in 0..attempts {
            tracing::trace!(lock_key = key, attempt, state = %LeaseState::Acquiring, "Trying lock");
            if let Some(token) = self.store.try_acquire(key, lease_timeout).await? {
                return self
                    .hold(token, lease_timeout, refresh_interval, callback)
                    .await
                    .map(LeaseOutcome::Completed);
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            }
        }

        LeaseMetrics::record_skipped(key);
        tracing::debug!(lock_key = key, state = %LeaseState::Skipped, "Lock held elsewhere");
        Ok(LeaseOutcome::Skipped)
    }

    async fn hold<F, Fut, T>(
        &self,
        token: LeaseToken,
        lease_timeout: Duration,
        refresh_interval: Duration,
        callback: F,
    ) -> Result<T, LeaseError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let key = token.key().to_string();
        LeaseMetrics::record_acquired(&key);
        tracing::debug!(lock_key = %key, state = %LeaseState::Held, "Lock acquired");

        let mut refresh =
            tokio::time::interval_at(Instant::now() + refresh_interval, refresh_interval);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut work = Box::pin(AssertUnwindSafe(callback()).catch_unwind());
        let outcome = loop {
            tokio::select! {
                result = &mut work => break Ok(result),
                _ = refresh.tick() => {
                    if let Err(error) = self.store.refresh(&token, lease_timeout).await {
                        LeaseMetrics::record_refresh_failure(&key);
                        tracing::error!(
                            lock_key = %key,
                            error = %error,
                            "Lease refresh failed, abandoning callback"
                        );
                        break Err(error);
                    }
                    tracing::trace!(lock_key = %key, "Lease refreshed");
                }
            }
        };
        drop(work);

        self.release(&token).await;

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(panic)) => std::panic::resume_unwind(panic),
            Err(source) => Err(LeaseError::RefreshFailed { key, source }),
        }
    }

    async fn release(&self, token: &LeaseToken) {
        match self.store.release(token).await {
            Ok(()) => {
                tracing::debug!(
                    lock_key = token.key(),
                    state = %LeaseState::Released,
                    "Lock released"
                );
            }
            Err(error) => {
                // The lease expires on its own.
                tracing::warn!(lock_key = token.key(), error = %error, "Failed to release lock");
            }
        }
    }
}

fn check_timing(lease_timeout: Duration, refresh_interval: Duration) -> Result<(), LeaseError> {
    if refresh_interval.is_zero() || refresh_interval >= lease_timeout {
        return Err(LeaseError::InvalidTiming {
            lease_timeout,
            refresh_interval,
        });
    }
    Ok(())
}
