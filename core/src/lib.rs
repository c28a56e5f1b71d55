//! # Meshbus Core
//!
//! Core types and traits for turning a Kafka-compatible publish/subscribe
//! broker into a service mesh with request/reply RPC, a transactional outbox
//! and replica-safe scheduled jobs.
//!
//! This crate does no I/O. It defines:
//!
//! - the wire [`Envelope`](envelope::Envelope) and topic naming
//!   ([`TopicNamer`](topic::TopicNamer), [`PrefixedTopic`](topic::PrefixedTopic))
//! - the error taxonomy ([`BrokerError`](error::BrokerError),
//!   [`RpcError`](error::RpcError))
//! - the registries built once at bootstrap
//!   ([`ExceptionRegistry`](exception::ExceptionRegistry),
//!   [`DependencyRegistry`](registry::DependencyRegistry))
//! - the seams to external collaborators
//!   ([`BrokerTransport`](broker::BrokerTransport),
//!   [`TopicAdmin`](broker::TopicAdmin), [`LockStore`](lock::LockStore),
//!   [`UnitOfWork`](unit_of_work::UnitOfWork))
//!
//! ## Architecture
//!
//! ```text
//!   unit of work ──► RpcClient::send ──► DependencyRegistry gate
//!        │                │
//!        │                └──► BrokerTransport (request/reply)
//!        │
//!        └─ on_commit ──► Outbox::flush ──► RpcClient::emit
//!
//!   bootstrap ──► TopicProvisioner ──► TopicAdmin
//!   scheduler ──► LeaseManager ──► LockStore
//! ```
//!
//! Implementations live in `meshbus-runtime` (client, outbox, provisioner,
//! leases), `meshbus-redpanda` (Kafka), `meshbus-postgres` (locks, units of
//! work) and `meshbus-testing` (in-memory doubles).

pub mod broker;
pub mod config;
pub mod context;
pub mod envelope;
pub mod error;
pub mod exception;
pub mod lock;
pub mod registry;
pub mod topic;
pub mod unit_of_work;

pub use broker::{AdminConnector, BrokerFuture, BrokerTransport, ProvisionError, TopicAdmin};
pub use context::RequestContext;
pub use envelope::{Envelope, REQUEST_ID_HEADER, WireMessage};
pub use error::{BrokerError, RemoteError, RpcError};
pub use exception::{ExceptionRegistry, RemoteException};
pub use lock::{LeaseToken, LockError, LockStore};
pub use registry::{
    DependencyNotLoadedError, DependencyRegistry, RemoteStub, StubDescriptor, StubId,
};
pub use topic::{PrefixedTopic, TopicNamer, TopicSpec};
pub use unit_of_work::{CommitHook, UnitOfWork, UnitOfWorkError};
