//! Scriptable in-memory broker transport.
//!
//! [`MockTransport`] records every request and emit, answers requests from
//! per-topic responders and can be told to fail or slow down. Each recorded
//! message carries dispatch and settle instants taken from `tokio::time`, so
//! tests running with paused time can assert on ordering and concurrency.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on poisoned locks

use meshbus_core::broker::{BrokerFuture, BrokerTransport};
use meshbus_core::envelope::WireMessage;
use meshbus_core::error::{BrokerError, RemoteError};
use meshbus_core::topic::PrefixedTopic;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::time::Instant;

type Responder = Arc<dyn Fn(&WireMessage) -> Result<Vec<u8>, BrokerError> + Send + Sync>;
type EmitFilter = Arc<dyn Fn(&PrefixedTopic, &WireMessage) -> bool + Send + Sync>;

/// Whether a recorded message was a request or an emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentKind {
    /// Request/reply round trip.
    Request,
    /// Fire-and-forget publish.
    Emit,
}

/// A message the transport saw.
#[derive(Debug, Clone)]
pub struct SentMessage {
    /// Broker-facing topic.
    pub topic: String,
    /// Request or emit.
    pub kind: SentKind,
    /// Message as handed over.
    pub message: WireMessage,
    /// When the call started.
    pub dispatched_at: Instant,
    /// When the call resolved, if it has.
    pub settled_at: Option<Instant>,
    /// Whether the call succeeded, once it resolved.
    pub succeeded: Option<bool>,
}

impl SentMessage {
    /// Payload parsed as JSON.
    #[must_use]
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.message.payload).unwrap()
    }
}

#[derive(Default)]
struct State {
    responders: RwLock<HashMap<String, Responder>>,
    subscribed_replies: RwLock<Option<BTreeSet<String>>>,
    emit_filter: RwLock<Option<EmitFilter>>,
    latency: RwLock<Duration>,
    sent: Mutex<Vec<SentMessage>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// In-memory [`BrokerTransport`].
///
/// Requests to a topic with no responder resolve to
/// [`BrokerError::Timeout`].
///
/// # Example
///
/// ```
/// use meshbus_testing::MockTransport;
/// use serde_json::json;
///
/// let transport = MockTransport::new().respond_json("billing.charge", &json!({"ok": true}));
/// assert!(transport.sent().is_empty());
/// ```
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<State>,
}

impl MockTransport {
    /// Transport with no responders.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer requests on `topic` with `responder`.
    #[must_use]
    pub fn respond<F>(self, topic: impl Into<String>, responder: F) -> Self
    where
        F: Fn(&WireMessage) -> Result<Vec<u8>, BrokerError> + Send + Sync + 'static,
    {
        self.state
            .responders
            .write()
            .unwrap()
            .insert(topic.into(), Arc::new(responder));
        self
    }

    /// Answer requests on `topic` with a fixed JSON value.
    #[must_use]
    pub fn respond_json<T: Serialize>(self, topic: impl Into<String>, value: &T) -> Self {
        let body = serde_json::to_vec(value).unwrap();
        self.respond(topic, move |_| Ok(body.clone()))
    }

    /// Answer requests on `topic` with a remote handler failure.
    #[must_use]
    pub fn respond_remote_error(self, topic: impl Into<String>, error: RemoteError) -> Self {
        self.respond(topic, move |_| Err(BrokerError::Remote(error.clone())))
    }

    /// Fail every request on `topic` with `error`.
    #[must_use]
    pub fn fail_requests(self, topic: impl Into<String>, error: BrokerError) -> Self {
        self.respond(topic, move |_| Err(error.clone()))
    }

    /// Only these reply topics are consumed; requests whose `.reply` channel
    /// is missing fail with [`BrokerError::ReplyTopicNotSubscribed`].
    #[must_use]
    pub fn with_subscribed_replies<I, S>(self, replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.state.subscribed_replies.write().unwrap() =
            Some(replies.into_iter().map(Into::into).collect());
        self
    }

    /// Fail emits for which `filter` returns true.
    #[must_use]
    pub fn fail_emits_where<F>(self, filter: F) -> Self
    where
        F: Fn(&PrefixedTopic, &WireMessage) -> bool + Send + Sync + 'static,
    {
        *self.state.emit_filter.write().unwrap() = Some(Arc::new(filter));
        self
    }

    /// Delay every call by `latency`.
    #[must_use]
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.state.latency.write().unwrap() = latency;
        self
    }

    /// Everything sent so far, in dispatch order.
    #[must_use]
    pub fn sent(&self) -> Vec<SentMessage> {
        self.state.sent.lock().unwrap().clone()
    }

    /// Requests sent so far.
    #[must_use]
    pub fn requests(&self) -> Vec<SentMessage> {
        self.of_kind(SentKind::Request)
    }

    /// Emits sent so far.
    #[must_use]
    pub fn emits(&self) -> Vec<SentMessage> {
        self.of_kind(SentKind::Emit)
    }

    /// Emits the broker accepted, in dispatch order.
    #[must_use]
    pub fn produced(&self) -> Vec<SentMessage> {
        self.emits()
            .into_iter()
            .filter(|m| m.succeeded == Some(true))
            .collect()
    }

    /// Highest number of calls that were in flight at once.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    fn of_kind(&self, kind: SentKind) -> Vec<SentMessage> {
        self.sent().into_iter().filter(|m| m.kind == kind).collect()
    }

    fn dispatch(&self, topic: &PrefixedTopic, kind: SentKind, message: &WireMessage) -> usize {
        let now = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let mut sent = self.state.sent.lock().unwrap();
        sent.push(SentMessage {
            topic: topic.as_str().to_string(),
            kind,
            message: message.clone(),
            dispatched_at: Instant::now(),
            settled_at: None,
            succeeded: None,
        });
        sent.len() - 1
    }

    async fn settle(&self, index: usize) {
        let latency = *self.state.latency.read().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
        if let Some(entry) = self.state.sent.lock().unwrap().get_mut(index) {
            entry.settled_at = Some(Instant::now());
        }
    }

    fn record_outcome(&self, index: usize, succeeded: bool) {
        if let Some(entry) = self.state.sent.lock().unwrap().get_mut(index) {
            entry.succeeded = Some(succeeded);
        }
    }

    fn answer(&self, topic: &PrefixedTopic, message: &WireMessage) -> Result<Vec<u8>, BrokerError> {
        if let Some(subscribed) = self.state.subscribed_replies.read().unwrap().as_ref() {
            let reply = topic.reply();
            if !subscribed.contains(reply.as_str()) {
                return Err(BrokerError::ReplyTopicNotSubscribed {
                    reply_topic: reply.into_inner(),
                });
            }
        }

        let responder = self
            .state
            .responders
            .read()
            .unwrap()
            .get(topic.as_str())
            .cloned();
        match responder {
            Some(responder) => responder(message),
            None => Err(BrokerError::Timeout {
                topic: topic.as_str().to_string(),
                after: Duration::ZERO,
            }),
        }
    }
}

impl BrokerTransport for MockTransport {
    fn request<'a>(
        &'a self,
        topic: &'a PrefixedTopic,
        message: WireMessage,
    ) -> BrokerFuture<'a, Result<Vec<u8>, BrokerError>> {
        Box::pin(async move {
            tracing::debug!(topic = %topic, "mock transport received request");
            let index = self.dispatch(topic, SentKind::Request, &message);
            self.settle(index).await;
            let reply = self.answer(topic, &message);
            self.record_outcome(index, reply.is_ok());
            reply
        })
    }

    fn emit<'a>(
        &'a self,
        topic: &'a PrefixedTopic,
        message: WireMessage,
    ) -> BrokerFuture<'a, Result<(), BrokerError>> {
        Box::pin(async move {
            tracing::debug!(topic = %topic, "mock transport received emit");
            let index = self.dispatch(topic, SentKind::Emit, &message);
            self.settle(index).await;

            let filter = self.state.emit_filter.read().unwrap().clone();
            let rejected = filter.is_some_and(|rejects| rejects(topic, &message));
            self.record_outcome(index, !rejected);
            if rejected {
                return Err(BrokerError::Transport(format!("emit to '{topic}' rejected")));
            }
            Ok(())
        })
    }
}
