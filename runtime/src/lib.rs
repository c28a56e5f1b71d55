//! # Meshbus Runtime
//!
//! Runtime components of the broker-mediated service mesh:
//!
//! - [`RpcClient`]: request/reply and fire-and-forget calls with typed error
//!   mapping and correlation-id logging
//! - [`TopicProvisioner`]: creates missing topics and grows partitions
//! - [`OutboxEmitter`]: buffers events per unit of work, flushes after commit
//! - [`LeaseManager`]: replica-safe mutual exclusion for scheduled jobs
//! - [`MeshBuilder`]: wires all of the above at bootstrap
//!
//! ## Example
//!
//! ```ignore
//! let mesh = MeshBuilder::new(MeshConfig::from_env()?)
//!     .register_stub::<KycStub>()
//!     .register_exception::<InsufficientFunds>()
//!     .build(KafkaTransport::for_mesh, admin, locks)?;
//!
//! mesh.provision(&["payments.settled"]).await?;
//!
//! let outbox = mesh.outbox.begin(&unit_of_work);
//! outbox.emit("payments.settled", &ctx.envelope(payment))?;
//! unit_of_work.commit().await?;
//! ```

/// Jittered exponential backoff
pub mod backoff;

/// RPC client facade
pub mod client;

/// Distributed lease manager
pub mod lease;

/// Composition root
pub mod mesh;

/// Prometheus metrics for observability
pub mod metrics;

/// Transactional outbox
pub mod outbox;

/// Topic provisioning
pub mod provisioner;

/// Tracing bootstrap
pub mod telemetry;

pub use backoff::BackoffPolicy;
pub use client::RpcClient;
pub use lease::{LeaseError, LeaseManager, LeaseOutcome};
pub use mesh::{Mesh, MeshBuilder, MeshError};
pub use outbox::{
    FailedEmit, FlushReport, FlushedEvent, OutboxEmitter, OutboxEvent, OutboxFactory,
};
pub use provisioner::{ProvisionReport, TopicProvisioner};
