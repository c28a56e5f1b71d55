//! Serving side of request/reply.

use crate::config::{client_config, producer_config};
use crate::wire::{self, CORRELATION_ID_HEADER, ERROR_HEADER, REPLY_TOPIC_HEADER};
use futures::FutureExt;
use meshbus_core::broker::BrokerFuture;
use meshbus_core::config::BrokerConfig;
use meshbus_core::envelope::{Envelope, REQUEST_ID_HEADER, WireMessage};
use meshbus_core::error::RemoteError;
use meshbus_core::exception::RemoteException;
use meshbus_core::topic::{PrefixedTopic, TopicNamer};
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::Instrument;

/// Handles requests arriving on one pattern.
///
/// Closures `Fn(Envelope<Value>) -> impl Future<Output = Result<Value, RemoteError>>`
/// implement this trait. Typed errors are returned through
/// [`RemoteException::to_remote`] (or [`remote_error`]) so callers can rehydrate
/// them.
pub trait RequestHandler: Send + Sync {
    /// Handle one request. The envelope keeps the caller's headers,
    /// including `requestId`.
    fn handle(&self, request: Envelope<Value>) -> BrokerFuture<'_, Result<Value, RemoteError>>;
}

impl<F, Fut> RequestHandler for F
where
    F: Fn(Envelope<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, RemoteError>> + Send + 'static,
{
    fn handle(&self, request: Envelope<Value>) -> BrokerFuture<'_, Result<Value, RemoteError>> {
        Box::pin(self(request))
    }
}

/// Wire form of a typed error, for use with `?` in handlers:
/// `.map_err(remote_error)?`.
pub fn remote_error<E: RemoteException>(error: E) -> RemoteError {
    error.to_remote()
}

/// Errors creating or running a [`KafkaResponder`].
#[derive(Error, Debug)]
pub enum ResponderError {
    /// rdkafka refused the client configuration.
    #[error("Failed to create Kafka client: {0}")]
    Client(#[from] KafkaError),

    /// Subscribing to request topics failed.
    #[error("Failed to subscribe to request topics {topics:?}: {reason}")]
    Subscribe {
        /// Request topics.
        topics: Vec<String>,
        /// Broker reason.
        reason: String,
    },

    /// No handler was registered.
    #[error("Responder has no handlers")]
    NoHandlers,
}

/// Consumes request topics and replies through the reply protocol.
///
/// Requests without a reply topic header are treated as events: the handler
/// runs and its result is dropped. Offsets are committed once a request has
/// been handed to its handler task, so a crash mid-handler loses that
/// request and the caller sees a timeout.
///
/// # Example
///
/// ```no_run
/// use meshbus_core::config::BrokerConfig;
/// use meshbus_core::{Envelope, RemoteError};
/// use meshbus_redpanda::KafkaResponder;
/// use serde_json::{Value, json};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let responder = KafkaResponder::builder(&BrokerConfig::default())
///     .handle("users.get", |request: Envelope<Value>| async move {
///         Ok::<_, RemoteError>(json!({ "id": request.value["id"], "name": "Ada" }))
///     })
///     .build()?;
///
/// tokio::spawn(responder.run());
/// # Ok(())
/// # }
/// ```
pub struct KafkaResponder {
    consumer: StreamConsumer,
    producer: FutureProducer,
    handlers: HashMap<PrefixedTopic, Arc<dyn RequestHandler>>,
    send_timeout: Duration,
}

impl KafkaResponder {
    /// Start configuring a responder.
    #[must_use]
    pub fn builder(broker: &BrokerConfig) -> KafkaResponderBuilder {
        KafkaResponderBuilder {
            namer: broker.topic_namer(),
            broker: broker.clone(),
            handlers: HashMap::new(),
            auto_offset_reset: None,
        }
    }

    /// Serve requests until the task is dropped.
    pub async fn run(self) {
        self.run_until(futures::future::pending::<()>()).await;
    }

    /// Serve requests until `shutdown` resolves.
    pub async fn run_until<S>(self, shutdown: S)
    where
        S: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => break,
                received = self.consumer.recv() => match received {
                    Ok(message) => self.dispatch(&message),
                    Err(error) => tracing::warn!(error = %error, "Request consumer error"),
                },
            }
        }
        tracing::info!("Responder stopped");
    }

    fn dispatch(&self, message: &BorrowedMessage<'_>) {
        let topic = PrefixedTopic::from_broker(message.topic());
        let Some(handler) = self.handlers.get(&topic) else {
            tracing::warn!(topic = %topic, "No handler for topic");
            return;
        };

        let request = WireMessage {
            key: message
                .key()
                .and_then(|key| std::str::from_utf8(key).ok())
                .map(str::to_string),
            headers: wire::read_headers(message),
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        };
        let span = tracing::info_span!(
            "serve",
            topic = %topic,
            correlation_id = request.request_id().unwrap_or_default(),
        );
        tokio::spawn(
            serve(
                Arc::clone(handler),
                self.producer.clone(),
                topic,
                request,
                self.send_timeout,
            )
            .instrument(span),
        );

        if let Err(error) = self.consumer.commit_message(message, CommitMode::Async) {
            tracing::warn!(
                topic = message.topic(),
                partition = message.partition(),
                offset = message.offset(),
                error = %error,
                "Failed to commit request offset"
            );
        }
    }
}

async fn serve(
    handler: Arc<dyn RequestHandler>,
    producer: FutureProducer,
    topic: PrefixedTopic,
    mut request: WireMessage,
    send_timeout: Duration,
) {
    let correlation_id = request.headers.remove(CORRELATION_ID_HEADER);
    let reply_topic = request.headers.remove(REPLY_TOPIC_HEADER);
    let key = request.key.clone();
    let request_id = request.request_id().map(str::to_string);

    let outcome = match request.into_envelope::<Value>() {
        Ok(envelope) => match AssertUnwindSafe(handler.handle(envelope)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => Err(RemoteError::new(format!("Handler for '{topic}' panicked"))),
        },
        Err(e) => Err(RemoteError::new(format!("Malformed request: {e}"))),
    };

    let (Some(reply_topic), Some(correlation_id)) = (reply_topic, correlation_id) else {
        if let Err(error) = outcome {
            tracing::warn!(error = %error, "Event handler failed");
        }
        return;
    };

    if let Err(error) = &outcome {
        tracing::debug!(code = ?error.code, error = %error, "Replying with remote error");
    }
    let (payload, is_error) = match wire::encode_reply(&outcome) {
        Ok(encoded) => encoded,
        Err(error) => {
            tracing::error!(error = %error, "Failed to encode reply");
            return;
        }
    };

    let mut headers = BTreeMap::new();
    headers.insert(CORRELATION_ID_HEADER.to_string(), correlation_id);
    if let Some(request_id) = request_id {
        headers.insert(REQUEST_ID_HEADER.to_string(), request_id);
    }
    if is_error {
        headers.insert(ERROR_HEADER.to_string(), "1".to_string());
    }

    let mut record: FutureRecord<'_, str, Vec<u8>> = FutureRecord::to(&reply_topic)
        .payload(&payload)
        .headers(wire::owned_headers(&headers));
    if let Some(key) = key.as_deref() {
        record = record.key(key);
    }

    match producer.send(record, Timeout::After(send_timeout)).await {
        Ok(_) => tracing::debug!(reply_topic = %reply_topic, "Reply sent"),
        Err((error, _)) => {
            tracing::error!(reply_topic = %reply_topic, error = %error, "Failed to send reply");
        }
    }
}

/// Builder for [`KafkaResponder`].
pub struct KafkaResponderBuilder {
    broker: BrokerConfig,
    namer: TopicNamer,
    handlers: HashMap<PrefixedTopic, Arc<dyn RequestHandler>>,
    auto_offset_reset: Option<String>,
}

impl KafkaResponderBuilder {
    /// Serve `pattern` (a logical name; the deployment prefix is applied).
    /// A later handler for the same pattern replaces the earlier one.
    #[must_use]
    pub fn handle<H: RequestHandler + 'static>(mut self, pattern: &str, handler: H) -> Self {
        self.handlers
            .insert(self.namer.prefixed(pattern), Arc::new(handler));
        self
    }

    /// Where a new consumer group starts reading: "earliest" or "latest".
    ///
    /// Default: "latest"
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Create the consumer and producer and subscribe to every handled topic.
    /// Instances sharing the configured consumer group split the load.
    ///
    /// # Errors
    ///
    /// - [`ResponderError::NoHandlers`] if nothing was registered
    /// - [`ResponderError::Client`] if rdkafka rejects the configuration
    /// - [`ResponderError::Subscribe`] if the subscription fails
    pub fn build(self) -> Result<KafkaResponder, ResponderError> {
        if self.handlers.is_empty() {
            return Err(ResponderError::NoHandlers);
        }
        let auto_offset_reset = self.auto_offset_reset.as_deref().unwrap_or("latest");

        let consumer: StreamConsumer = client_config(&self.broker)
            .set("group.id", &self.broker.consumer_group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", auto_offset_reset)
            .set("session.timeout.ms", "6000")
            .set("enable.partition.eof", "false")
            .create()?;
        let send_timeout = self.broker.send_timeout;
        let producer: FutureProducer = producer_config(&self.broker, "all", send_timeout).create()?;

        let mut topics: Vec<&str> = self.handlers.keys().map(PrefixedTopic::as_str).collect();
        topics.sort_unstable();
        consumer
            .subscribe(&topics)
            .map_err(|e| ResponderError::Subscribe {
                topics: topics.iter().map(|t| (*t).to_string()).collect(),
                reason: e.to_string(),
            })?;

        tracing::info!(
            topics = ?topics,
            consumer_group = %self.broker.consumer_group,
            auto_offset_reset = auto_offset_reset,
            "Responder subscribed"
        );

        Ok(KafkaResponder {
            consumer,
            producer,
            handlers: self.handlers,
            send_timeout,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, thiserror::Error)]
    #[error("user {0} not found")]
    struct UserNotFound(u64);

    impl RemoteException for UserNotFound {
        const CODE: &'static str = "USER_NOT_FOUND";

        fn from_remote(remote: &RemoteError) -> Self {
            Self(remote.data.as_ref().and_then(Value::as_u64).unwrap_or_default())
        }

        fn data(&self) -> Option<Value> {
            Some(json!(self.0))
        }
    }

    #[test]
    fn builder_without_handlers_is_rejected() {
        let result = KafkaResponder::builder(&BrokerConfig::default()).build();
        assert!(matches!(result, Err(ResponderError::NoHandlers)));
    }

    #[test]
    fn handlers_are_keyed_by_prefixed_topic() {
        let broker = BrokerConfig {
            topic_prefix: Some("prod".to_string()),
            ..BrokerConfig::default()
        };
        let builder = KafkaResponder::builder(&broker)
            .handle("users.get", |_: Envelope<Value>| async { Ok::<_, RemoteError>(Value::Null) });

        assert!(builder.handlers.contains_key(&PrefixedTopic::from_broker("prod.users.get")));
    }

    #[tokio::test]
    async fn reply_send_timeout_follows_broker_config() {
        // Subscribing only records the topics; no broker is contacted.
        let broker = BrokerConfig {
            send_timeout: Duration::from_millis(750),
            ..BrokerConfig::default()
        };
        let responder = KafkaResponder::builder(&broker)
            .handle("users.get", |_: Envelope<Value>| async {
                Ok::<_, RemoteError>(Value::Null)
            })
            .build()
            .unwrap();

        assert_eq!(responder.send_timeout, Duration::from_millis(750));
    }

    #[tokio::test]
    async fn closure_handlers_return_typed_errors_in_wire_form() {
        let handler = |request: Envelope<Value>| async move {
            let id = request.value["id"].as_u64().unwrap_or_default();
            Err::<Value, _>(remote_error(UserNotFound(id)))
        };

        let error = handler
            .handle(Envelope::new(json!({"id": 42})))
            .await
            .unwrap_err();

        assert_eq!(error.code.as_deref(), Some("USER_NOT_FOUND"));
        assert_eq!(error.data, Some(json!(42)));
        assert_eq!(error.message, "user 42 not found");
    }
}
