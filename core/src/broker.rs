//! Seams to the broker client.
//!
//! Two traits cover everything this layer needs from a Kafka-compatible
//! broker:
//!
//! - [`BrokerTransport`]: request/reply round trips and fire-and-forget emits.
//! - [`AdminConnector`] / [`TopicAdmin`]: short-lived administrative sessions
//!   used to provision topics and partitions.
//!
//! Both take [`PrefixedTopic`]s, never logical names; prefixing is the
//! caller's job and happens exactly once.
//!
//! # Dyn Compatibility
//!
//! Methods return `Pin<Box<dyn Future>>` instead of using `async fn` so the
//! traits can be used as `Arc<dyn BrokerTransport>`.

use crate::envelope::WireMessage;
use crate::error::BrokerError;
use crate::topic::{PrefixedTopic, TopicSpec};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Boxed future returned by the broker seams.
pub type BrokerFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Request/reply and emit primitives of a broker client.
pub trait BrokerTransport: Send + Sync {
    /// Publish `message` to `topic` and wait for the correlated reply.
    ///
    /// # Errors
    ///
    /// - [`BrokerError::Remote`] when the handler failed remotely
    /// - [`BrokerError::ReplyTopicNotSubscribed`] when `topic.reply()` is not
    ///   consumed by this process
    /// - [`BrokerError::Timeout`] when no reply arrives in time
    /// - [`BrokerError::Transport`] for anything else
    fn request<'a>(
        &'a self,
        topic: &'a PrefixedTopic,
        message: WireMessage,
    ) -> BrokerFuture<'a, Result<Vec<u8>, BrokerError>>;

    /// Publish `message` to `topic` without expecting a reply. Resolves once
    /// the broker accepted (or rejected) the message.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Transport`] if the broker rejects the message.
    fn emit<'a>(
        &'a self,
        topic: &'a PrefixedTopic,
        message: WireMessage,
    ) -> BrokerFuture<'a, Result<(), BrokerError>>;
}

/// Failures while provisioning topics. All are fatal to the run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProvisionError {
    /// Admin client could not connect.
    #[error("Admin connection failed: {0}")]
    ConnectionFailed(String),

    /// Listing or describing topics failed.
    #[error("Metadata fetch failed: {0}")]
    MetadataFailed(String),

    /// Creating a topic failed.
    #[error("Failed to create topic '{topic}': {reason}")]
    CreateFailed {
        /// Broker-facing topic name.
        topic: String,
        /// Broker reason.
        reason: String,
    },

    /// Partition leaders were not elected within the bound.
    #[error("Leader election for '{topic}' did not complete within {waited:?}")]
    LeaderElectionTimeout {
        /// Broker-facing topic name.
        topic: String,
        /// Bound that elapsed.
        waited: Duration,
    },

    /// Increasing partitions failed.
    #[error("Failed to increase partitions of '{topic}' to {partitions}: {reason}")]
    PartitionIncreaseFailed {
        /// Broker-facing topic name.
        topic: String,
        /// Requested total partition count.
        partitions: i32,
        /// Broker reason.
        reason: String,
    },
}

/// Opens short-lived admin sessions.
pub trait AdminConnector: Send + Sync {
    /// Connect an admin client.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::ConnectionFailed`] if the broker is unreachable.
    fn connect(&self) -> BrokerFuture<'_, Result<Box<dyn TopicAdmin>, ProvisionError>>;
}

/// An open admin session.
pub trait TopicAdmin: Send + Sync {
    /// Names of all topics on the cluster.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::MetadataFailed`] on broker failure.
    fn list_topics(&self) -> BrokerFuture<'_, Result<Vec<PrefixedTopic>, ProvisionError>>;

    /// Create a topic and wait up to `leader_wait` for every partition to
    /// have an elected leader.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::CreateFailed`] or
    /// [`ProvisionError::LeaderElectionTimeout`].
    fn create_topic<'a>(
        &'a self,
        spec: &'a TopicSpec,
        leader_wait: Duration,
    ) -> BrokerFuture<'a, Result<(), ProvisionError>>;

    /// Current partition count per topic. Unknown topics are omitted.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::MetadataFailed`] on broker failure.
    fn partition_counts<'a>(
        &'a self,
        topics: &'a [PrefixedTopic],
    ) -> BrokerFuture<'a, Result<HashMap<PrefixedTopic, i32>, ProvisionError>>;

    /// Grow `topic` to `total` partitions.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::PartitionIncreaseFailed`] on broker failure.
    fn create_partitions<'a>(
        &'a self,
        topic: &'a PrefixedTopic,
        total: i32,
    ) -> BrokerFuture<'a, Result<(), ProvisionError>>;

    /// Close the session.
    fn disconnect(self: Box<Self>) -> BrokerFuture<'static, ()>;
}
