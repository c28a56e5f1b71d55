//! RPC client over a broker transport.
//!
//! [`RpcClient`] turns logical patterns into broker calls:
//!
//! - the pattern is prefixed exactly once, here;
//! - the envelope's `requestId` becomes the broker key and the
//!   `correlation_id` of a span wrapping the whole call, so every log line
//!   emitted while the call is in flight carries it;
//! - broker failures are mapped to [`RpcError`], rehydrating registered
//!   remote exceptions first.

use crate::metrics::RpcMetrics;
use meshbus_core::broker::BrokerTransport;
use meshbus_core::envelope::{Envelope, decode_payload};
use meshbus_core::error::{BrokerError, RpcError};
use meshbus_core::exception::ExceptionRegistry;
use meshbus_core::registry::{DependencyRegistry, RemoteStub};
use meshbus_core::topic::{PrefixedTopic, TopicNamer};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{Instrument, Span};

/// Request/reply and emit facade.
///
/// Cheap to clone; clones share the transport and registries.
///
/// # Example
///
/// ```no_run
/// use meshbus_core::{Envelope, RequestContext};
/// use meshbus_runtime::RpcClient;
/// use serde_json::{Value, json};
///
/// # async fn example(client: RpcClient) -> Result<(), meshbus_core::RpcError> {
/// let ctx = RequestContext::generate();
/// let user: Value = client.send("users.get", &ctx.envelope(json!({"id": 7}))).await?;
/// client.emit("users.viewed", &ctx.envelope(user)).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RpcClient {
    transport: Arc<dyn BrokerTransport>,
    namer: TopicNamer,
    exceptions: Arc<ExceptionRegistry>,
    dependencies: Arc<DependencyRegistry>,
}

impl RpcClient {
    /// Client with no prefix and empty registries.
    #[must_use]
    pub fn new(transport: Arc<dyn BrokerTransport>) -> Self {
        Self {
            transport,
            namer: TopicNamer::unprefixed(),
            exceptions: Arc::new(ExceptionRegistry::builder().build()),
            dependencies: Arc::new(DependencyRegistry::builder().build()),
        }
    }

    /// Use `namer` to turn patterns into broker topics.
    #[must_use]
    pub fn with_namer(mut self, namer: TopicNamer) -> Self {
        self.namer = namer;
        self
    }

    /// Rehydrate remote failures through `exceptions`.
    #[must_use]
    pub fn with_exceptions(mut self, exceptions: Arc<ExceptionRegistry>) -> Self {
        self.exceptions = exceptions;
        self
    }

    /// Gate stub construction through `dependencies`.
    #[must_use]
    pub fn with_dependencies(mut self, dependencies: Arc<DependencyRegistry>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Topic naming in use.
    #[must_use]
    pub const fn namer(&self) -> &TopicNamer {
        &self.namer
    }

    /// Dependency registry in use.
    #[must_use]
    pub const fn dependencies(&self) -> &Arc<DependencyRegistry> {
        &self.dependencies
    }

    /// Send a request and wait for the reply.
    ///
    /// # Errors
    ///
    /// In priority order:
    ///
    /// - [`RpcError::Domain`] when the remote failure carries a registered code
    /// - [`RpcError::ServiceNotLoaded`] when the reply topic is not subscribed
    /// - [`RpcError::Broker`] for any other broker failure
    ///
    /// [`RpcError::Serialization`] is returned if the request or reply payload
    /// cannot be (de)serialized.
    pub async fn send<T, R>(&self, pattern: &str, envelope: &Envelope<T>) -> Result<R, RpcError>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let topic = self.namer.prefixed(pattern);
        let span = call_span("send", pattern, &topic, envelope.request_id());

        async move {
            let message = envelope
                .to_wire()
                .map_err(|e| serialization_error(pattern, &e))?;
            tracing::debug!(key = ?message.key, "Sending request");

            let started = Instant::now();
            let result = self.transport.request(&topic, message).await;
            RpcMetrics::record_request(pattern, started.elapsed());

            match result {
                Ok(payload) => {
                    tracing::debug!(bytes = payload.len(), "Reply received");
                    decode_payload(&payload).map_err(|e| serialization_error(pattern, &e))
                }
                Err(error) => {
                    RpcMetrics::record_error(pattern);
                    Err(self.map_request_error(pattern, &topic, error))
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Publish an event without waiting for a reply.
    ///
    /// The call still resolves only once the broker accepted or rejected the
    /// message. Failures are not retried.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Broker`] if the broker rejects the message, or
    /// [`RpcError::Serialization`] if the payload cannot be encoded.
    pub async fn emit<T>(&self, pattern: &str, envelope: &Envelope<T>) -> Result<(), RpcError>
    where
        T: Serialize,
    {
        let topic = self.namer.prefixed(pattern);
        let span = call_span("emit", pattern, &topic, envelope.request_id());

        async move {
            let message = envelope
                .to_wire()
                .map_err(|e| serialization_error(pattern, &e))?;
            tracing::debug!(key = ?message.key, "Emitting event");

            match self.transport.emit(&topic, message).await {
                Ok(()) => {
                    RpcMetrics::record_emit(pattern);
                    Ok(())
                }
                Err(source) => {
                    RpcMetrics::record_error(pattern);
                    tracing::warn!(error = %source, "Emit rejected by broker");
                    Err(RpcError::Broker {
                        pattern: pattern.to_string(),
                        source,
                    })
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Construct stub `S` if its dependencies are wired into this process.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::DependencyNotLoaded`] naming the missing topics and
    /// stubs, instead of letting calls hang waiting for replies that will
    /// never be routed back.
    pub fn stub<S: RemoteStub>(&self, args: S::Args) -> Result<S, RpcError> {
        self.dependencies
            .create_remote_stub::<S>(args)
            .map_err(|error| {
                tracing::error!(stub = S::ID, error = %error, "Refusing to construct stub");
                RpcError::from(error)
            })
    }

    fn map_request_error(
        &self,
        pattern: &str,
        topic: &PrefixedTopic,
        error: BrokerError,
    ) -> RpcError {
        if let BrokerError::Remote(remote) = &error {
            if let Some((code, rehydrated)) = self.exceptions.rehydrate(remote) {
                tracing::debug!(code = %code, "Remote failure rehydrated");
                return RpcError::Domain {
                    code,
                    error: rehydrated,
                };
            }
        }

        if error.is_missing_reply_subscription() {
            tracing::error!(
                reply_topic = %topic.reply(),
                "Reply topic is not subscribed; register the stub that calls this pattern"
            );
            return RpcError::ServiceNotLoaded {
                pattern: pattern.to_string(),
            };
        }

        tracing::warn!(error = %error, "Request failed");
        RpcError::Broker {
            pattern: pattern.to_string(),
            source: error,
        }
    }
}

fn call_span(
    operation: &'static str,
    pattern: &str,
    topic: &PrefixedTopic,
    request_id: Option<&str>,
) -> Span {
    let span = tracing::info_span!(
        "rpc",
        operation,
        pattern = %pattern,
        topic = %topic,
        correlation_id = tracing::field::Empty
    );
    if let Some(id) = request_id {
        span.record("correlation_id", tracing::field::display(id));
    }
    span
}

fn serialization_error(pattern: &str, error: &impl std::fmt::Display) -> RpcError {
    RpcError::Serialization {
        pattern: pattern.to_string(),
        reason: error.to_string(),
    }
}
