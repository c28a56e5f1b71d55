//! Error taxonomy for broker calls.
//!
//! Two layers:
//!
//! - [`BrokerError`]: what a [`BrokerTransport`](crate::broker::BrokerTransport)
//!   reports. Knows nothing about typed domain errors.
//! - [`RpcError`]: what callers of the RPC client see, after registered remote
//!   errors have been rehydrated and missing reply subscriptions recognized.

use crate::registry::DependencyNotLoadedError;
use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::time::Duration;
use thiserror::Error;

/// Text a broker client reports when a reply arrives on (or is requested for)
/// a topic its consumer never subscribed to.
pub const MISSING_REPLY_SUBSCRIPTION: &str = "did not subscribe to the corresponding reply topic";

/// Error raised by a remote handler, as carried on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Error)]
#[serde(rename_all = "camelCase")]
#[error("{message}")]
pub struct RemoteError {
    /// Registered exception code, if the remote side raised a typed error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Human-readable message.
    pub message: String,
    /// Structured error payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Stack or cause chain from the remote process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caused_by_stack: Option<String>,
}

impl RemoteError {
    /// Untyped remote failure.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            data: None,
            caused_by_stack: None,
        }
    }

    /// Set the exception code.
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Attach structured data.
    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Attach the remote cause chain.
    #[must_use]
    pub fn with_caused_by_stack(mut self, stack: impl Into<String>) -> Self {
        self.caused_by_stack = Some(stack.into());
        self
    }

    /// Flatten any error into a remote error, recording its source chain.
    #[must_use]
    pub fn from_error(error: &(dyn StdError + 'static)) -> Self {
        let mut chain = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }
        let remote = Self::new(error.to_string());
        if chain.is_empty() {
            remote
        } else {
            remote.with_caused_by_stack(chain.join("\ncaused by: "))
        }
    }
}

/// Failure reported by the broker client.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BrokerError {
    /// The remote handler failed; its error came back on the reply topic.
    #[error("Remote handler failed: {0}")]
    Remote(RemoteError),

    /// The reply consumer is not subscribed to the reply channel, so no reply
    /// could ever be routed back.
    #[error(
        "The client consumer did not subscribe to the corresponding reply topic ({reply_topic})"
    )]
    ReplyTopicNotSubscribed {
        /// Reply channel that is missing from the subscription.
        reply_topic: String,
    },

    /// No reply within the client's per-call timeout.
    #[error("No reply on '{topic}' within {after:?}")]
    Timeout {
        /// Request topic.
        topic: String,
        /// Timeout that elapsed.
        after: Duration,
    },

    /// Payload could not be encoded or decoded.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Network, protocol or client failure.
    #[error("Transport error: {0}")]
    Transport(String),
}

impl BrokerError {
    /// Whether the failure means the reply channel was never subscribed.
    ///
    /// Recognizes the dedicated variant as well as broker clients that only
    /// report it as text.
    #[must_use]
    pub fn is_missing_reply_subscription(&self) -> bool {
        match self {
            Self::ReplyTopicNotSubscribed { .. } => true,
            Self::Transport(text) => text.contains(MISSING_REPLY_SUBSCRIPTION),
            Self::Remote(remote) => remote.message.contains(MISSING_REPLY_SUBSCRIPTION),
            Self::Timeout { .. } | Self::Serialization(_) => false,
        }
    }
}

/// Error seen by callers of the RPC client.
#[derive(Error, Debug)]
pub enum RpcError {
    /// A registered typed error raised on the remote side.
    ///
    /// `error` downcasts to the concrete type registered for `code`.
    #[error("{error}")]
    Domain {
        /// Exception code.
        code: String,
        /// The rehydrated error.
        error: Box<dyn StdError + Send + Sync>,
    },

    /// The remote service's reply channel is not wired into this process.
    #[error("Service for pattern '{pattern}' is not loaded: reply topic is not subscribed")]
    ServiceNotLoaded {
        /// Logical pattern that was called.
        pattern: String,
    },

    /// A stub was refused by the dependency gate.
    #[error(transparent)]
    DependencyNotLoaded(#[from] DependencyNotLoadedError),

    /// Any other broker failure.
    #[error("Broker call to '{pattern}' failed: {source}")]
    Broker {
        /// Logical pattern that was called.
        pattern: String,
        /// Underlying broker failure.
        #[source]
        source: BrokerError,
    },

    /// Request or reply payload could not be (de)serialized.
    #[error("Payload for '{pattern}' could not be (de)serialized: {reason}")]
    Serialization {
        /// Logical pattern that was called.
        pattern: String,
        /// Details.
        reason: String,
    },
}

impl RpcError {
    /// Downcast a rehydrated domain error.
    #[must_use]
    pub fn domain<E: StdError + 'static>(&self) -> Option<&E> {
        match self {
            Self::Domain { error, .. } => error.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// Exception code of a domain error.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Domain { code, .. } => Some(code),
            _ => None,
        }
    }
}
