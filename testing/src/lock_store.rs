//! In-memory lock store.
//!
//! Expiry uses `tokio::time::Instant`, so leases expire under paused time
//! exactly as `tokio::time::advance` dictates.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on poisoned locks

use meshbus_core::broker::BrokerFuture;
use meshbus_core::lock::{LeaseToken, LockError, LockStore};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Default)]
struct Leases {
    held: HashMap<String, (String, Instant)>,
    acquisitions: usize,
    refreshes: usize,
    releases: usize,
    fail_refresh_after: Option<usize>,
    unavailable: bool,
}

/// Shared in-memory [`LockStore`]. Clones see the same leases, which makes
/// one instance stand in for the store shared by several replicas.
#[derive(Clone, Default)]
pub struct InMemoryLockStore {
    leases: Arc<Mutex<Leases>>,
}

impl InMemoryLockStore {
    /// Store with no leases.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Let the first `n` refreshes succeed, then report the lease as lost.
    #[must_use]
    pub fn failing_refresh_after(self, n: usize) -> Self {
        self.leases.lock().unwrap().fail_refresh_after = Some(n);
        self
    }

    /// Make every call fail with [`LockError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.leases.lock().unwrap().unavailable = unavailable;
    }

    /// Whether `key` is held by an unexpired lease.
    #[must_use]
    pub fn is_held(&self, key: &str) -> bool {
        let leases = self.leases.lock().unwrap();
        leases
            .held
            .get(key)
            .is_some_and(|(_, expires)| *expires > Instant::now())
    }

    /// Successful acquisitions.
    #[must_use]
    pub fn acquisitions(&self) -> usize {
        self.leases.lock().unwrap().acquisitions
    }

    /// Refresh calls, successful or not.
    #[must_use]
    pub fn refreshes(&self) -> usize {
        self.leases.lock().unwrap().refreshes
    }

    /// Release calls.
    #[must_use]
    pub fn releases(&self) -> usize {
        self.leases.lock().unwrap().releases
    }

    fn check_available(leases: &Leases) -> Result<(), LockError> {
        if leases.unavailable {
            return Err(LockError::Unavailable("in-memory store offline".to_string()));
        }
        Ok(())
    }
}

impl LockStore for InMemoryLockStore {
    fn try_acquire<'a>(
        &'a self,
        key: &'a str,
        lease: Duration,
    ) -> BrokerFuture<'a, Result<Option<LeaseToken>, LockError>> {
        Box::pin(async move {
            let mut leases = self.leases.lock().unwrap();
            Self::check_available(&leases)?;

            let now = Instant::now();
            if leases
                .held
                .get(key)
                .is_some_and(|(_, expires)| *expires > now)
            {
                return Ok(None);
            }

            let token = LeaseToken::generate(key);
            leases
                .held
                .insert(key.to_string(), (token.token().to_string(), now + lease));
            leases.acquisitions += 1;
            Ok(Some(token))
        })
    }

    fn refresh<'a>(
        &'a self,
        token: &'a LeaseToken,
        lease: Duration,
    ) -> BrokerFuture<'a, Result<(), LockError>> {
        Box::pin(async move {
            let mut leases = self.leases.lock().unwrap();
            Self::check_available(&leases)?;
            leases.refreshes += 1;

            let lost = || LockError::LeaseLost {
                key: token.key().to_string(),
            };
            if leases
                .fail_refresh_after
                .is_some_and(|n| leases.refreshes > n)
            {
                return Err(lost());
            }

            let now = Instant::now();
            match leases.held.get_mut(token.key()) {
                Some((owner, expires)) if owner == token.token() && *expires > now => {
                    *expires = now + lease;
                    Ok(())
                }
                _ => Err(lost()),
            }
        })
    }

    fn release<'a>(&'a self, token: &'a LeaseToken) -> BrokerFuture<'a, Result<(), LockError>> {
        Box::pin(async move {
            let mut leases = self.leases.lock().unwrap();
            Self::check_available(&leases)?;
            leases.releases += 1;
            if leases
                .held
                .get(token.key())
                .is_some_and(|(owner, _)| owner == token.token())
            {
                leases.held.remove(token.key());
            }
            Ok(())
        })
    }
}
