//! # Meshbus Testing
//!
//! In-memory doubles for the meshbus collaborator seams, for fast and
//! deterministic tests without a broker or a database:
//!
//! - [`MockTransport`]: scriptable [`BrokerTransport`](meshbus_core::BrokerTransport)
//! - [`InMemoryAdminConnector`]: fake cluster for topic provisioning
//! - [`InMemoryLockStore`]: shared lease store honoring paused tokio time
//! - [`InMemoryUnitOfWork`]: unit of work with post-commit hooks
//! - [`LogCapture`]: formatted tracing output captured in memory
//!
//! ## Example
//!
//! ```
//! use meshbus_testing::{InMemoryLockStore, MockTransport};
//! use serde_json::json;
//!
//! let transport = MockTransport::new().respond_json("users.get", &json!({"id": 1}));
//! let locks = InMemoryLockStore::new();
//! assert!(!locks.is_held("nightly-report"));
//! # let _ = transport;
//! ```

pub mod admin;
pub mod lock_store;
pub mod logs;
pub mod transport;
pub mod unit_of_work;

pub use admin::{InMemoryAdminConnector, InMemoryTopicAdmin};
pub use lock_store::InMemoryLockStore;
pub use logs::LogCapture;
pub use transport::{MockTransport, SentKind, SentMessage};
pub use unit_of_work::{InMemoryUnitOfWork, UnitState};
