//! Kafka-compatible broker plumbing for meshbus.
//!
//! Works against Redpanda, Apache Kafka or any other broker speaking the
//! Kafka protocol, through rdkafka.
//!
//! - [`KafkaTransport`]: request/reply and emits for the RPC client. One
//!   producer, and one reply consumer assigned every partition of every
//!   reply channel the dependency registry knows about.
//! - [`KafkaResponder`]: the serving side. Consumes request topics, runs a
//!   [`RequestHandler`] and produces the reply.
//! - [`KafkaAdminConnector`]: topic provisioning sessions.
//!
//! # Reply protocol
//!
//! ```text
//! caller                                   responder
//!   │ request ──► orders.create             │
//!   │   x-correlation-id: 7f3c…             │
//!   │   x-reply-topic:    orders.create.reply
//!   │                                       │ handler
//!   │ ◄── orders.create.reply ──────────────│
//!   │   x-correlation-id: 7f3c…             │
//!   │   x-error: 1   (only on failure)      │
//! ```
//!
//! Failed replies carry a JSON `RemoteError`, so typed errors registered on
//! the caller's exception registry come back typed.
//!
//! # Example
//!
//! ```no_run
//! use meshbus_core::config::MeshConfig;
//! use meshbus_redpanda::{KafkaAdminConnector, KafkaTransport};
//! use meshbus_runtime::MeshBuilder;
//! # use meshbus_core::LockStore;
//! # use std::sync::Arc;
//!
//! # async fn example(locks: Arc<dyn LockStore>) -> Result<(), Box<dyn std::error::Error>> {
//! let config = MeshConfig::from_env()?;
//! let admin = Arc::new(KafkaAdminConnector::new(&config.broker));
//!
//! let mesh = MeshBuilder::new(config)
//!     .subscribe_reply("users.get")
//!     .build(KafkaTransport::for_mesh, admin, locks)?;
//!
//! mesh.provision(&["users.created"]).await?;
//! # Ok(())
//! # }
//! ```

mod admin;
mod config;
mod responder;
mod transport;
pub mod wire;

pub use admin::{KafkaAdminConnector, KafkaTopicAdmin};
pub use config::{client_config, producer_config};
pub use responder::{
    KafkaResponder, KafkaResponderBuilder, RequestHandler, ResponderError, remote_error,
};
pub use transport::{KafkaTransport, KafkaTransportBuilder, TransportError};
