//! Registry of typed errors that survive the RPC boundary.
//!
//! A remote handler encodes a typed error as a [`RemoteError`] with a `code`.
//! The calling process looks the code up here and rebuilds the typed error, so
//! callers can match on `InsufficientFunds` instead of parsing broker text.
//!
//! The registry is built once at bootstrap and read-only afterwards:
//!
//! ```
//! use meshbus_core::exception::{ExceptionRegistry, RemoteException};
//! use meshbus_core::error::RemoteError;
//!
//! #[derive(Debug, thiserror::Error)]
//! #[error("limit exceeded")]
//! struct LimitExceeded { data: Option<serde_json::Value> }
//!
//! impl RemoteException for LimitExceeded {
//!     const CODE: &'static str = "LIMIT_EXCEEDED";
//!     fn from_remote(remote: &RemoteError) -> Self {
//!         Self { data: remote.data.clone() }
//!     }
//! }
//!
//! let registry = ExceptionRegistry::builder().register::<LimitExceeded>().build();
//! assert!(registry.contains("LIMIT_EXCEEDED"));
//! ```

use crate::error::RemoteError;
use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

/// Boxed error produced by a factory.
pub type BoxedDomainError = Box<dyn StdError + Send + Sync>;

/// Factory rebuilding a typed error from its wire form.
pub type ExceptionFactory = Arc<dyn Fn(&RemoteError) -> BoxedDomainError + Send + Sync>;

/// A typed error that can cross the RPC boundary.
pub trait RemoteException: StdError + Send + Sync + Sized + 'static {
    /// Code identifying this error on the wire. Must be unique per mesh.
    const CODE: &'static str;

    /// Rebuild from the wire form. Implementations should keep `data` and
    /// `caused_by_stack`.
    fn from_remote(remote: &RemoteError) -> Self;

    /// Wire form, used by responders.
    fn to_remote(&self) -> RemoteError {
        let mut remote = RemoteError::from_error(self).with_code(Self::CODE);
        if let Some(data) = self.data() {
            remote = remote.with_data(data);
        }
        remote
    }

    /// Structured payload to ship alongside the message.
    fn data(&self) -> Option<serde_json::Value> {
        None
    }
}

/// Immutable `code -> factory` table.
#[derive(Clone, Default)]
pub struct ExceptionRegistry {
    factories: HashMap<String, ExceptionFactory>,
}

impl fmt::Debug for ExceptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut codes: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        codes.sort_unstable();
        f.debug_struct("ExceptionRegistry")
            .field("codes", &codes)
            .finish()
    }
}

impl ExceptionRegistry {
    /// Start building a registry.
    #[must_use]
    pub fn builder() -> ExceptionRegistryBuilder {
        ExceptionRegistryBuilder::default()
    }

    /// Whether `code` is registered.
    #[must_use]
    pub fn contains(&self, code: &str) -> bool {
        self.factories.contains_key(code)
    }

    /// Number of registered codes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Rebuild the typed error for a remote failure.
    ///
    /// Returns `None` when the error has no code or the code is unknown.
    #[must_use]
    pub fn rehydrate(&self, remote: &RemoteError) -> Option<(String, BoxedDomainError)> {
        let code = remote.code.as_deref()?;
        let factory = self.factories.get(code)?;
        Some((code.to_string(), factory(remote)))
    }
}

/// Builder for [`ExceptionRegistry`].
#[derive(Default)]
pub struct ExceptionRegistryBuilder {
    factories: HashMap<String, ExceptionFactory>,
}

impl ExceptionRegistryBuilder {
    /// Register a [`RemoteException`] under its code.
    #[must_use]
    pub fn register<E: RemoteException>(self) -> Self {
        self.register_fn(E::CODE, |remote| Box::new(E::from_remote(remote)))
    }

    /// Register an explicit factory. A later registration for the same code
    /// replaces the earlier one.
    #[must_use]
    pub fn register_fn<F>(mut self, code: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&RemoteError) -> BoxedDomainError + Send + Sync + 'static,
    {
        let code = code.into();
        if self.factories.insert(code.clone(), Arc::new(factory)).is_some() {
            tracing::warn!(code = %code, "Exception code registered twice, keeping the latest");
        }
        self
    }

    /// Freeze the registry.
    #[must_use]
    pub fn build(self) -> ExceptionRegistry {
        ExceptionRegistry {
            factories: self.factories,
        }
    }
}
