//! [`BrokerTransport`] over rdkafka.

use crate::config::{client_config, producer_config};
use crate::wire::{self, CORRELATION_ID_HEADER, REPLY_TOPIC_HEADER};
use meshbus_core::broker::{BrokerFuture, BrokerTransport};
use meshbus_core::config::{BrokerConfig, MeshConfig};
use meshbus_core::envelope::WireMessage;
use meshbus_core::error::BrokerError;
use meshbus_core::registry::DependencyRegistry;
use meshbus_core::topic::PrefixedTopic;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::metadata::MetadataPartition;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::util::Timeout;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

/// Bound on each metadata or watermark query made for the reply consumer.
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// How often the reply consumer looks for reply partitions it does not
/// read yet.
const DEFAULT_PARTITION_RESCAN: Duration = Duration::from_secs(5);

/// Errors creating a [`KafkaTransport`].
#[derive(Error, Debug)]
pub enum TransportError {
    /// rdkafka refused the client configuration.
    #[error("Failed to create Kafka client: {0}")]
    Client(#[from] KafkaError),

    /// Assigning the reply partitions to the reply consumer failed.
    #[error("Failed to assign reply topics {topics:?}: {reason}")]
    Assign {
        /// Reply topics requested.
        topics: Vec<String>,
        /// Broker reason.
        reason: String,
    },

    /// The reply consumer needs a Tokio runtime to run on.
    #[error("Kafka transport must be created inside a Tokio runtime")]
    NoRuntime,
}

type ReplySender = oneshot::Sender<Result<Vec<u8>, BrokerError>>;

/// Calls waiting for a reply, keyed by correlation id.
#[derive(Default)]
struct PendingReplies {
    calls: Mutex<HashMap<String, ReplySender>>,
}

impl PendingReplies {
    fn calls(&self) -> MutexGuard<'_, HashMap<String, ReplySender>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, correlation_id: &str) -> oneshot::Receiver<Result<Vec<u8>, BrokerError>> {
        let (tx, rx) = oneshot::channel();
        self.calls().insert(correlation_id.to_string(), tx);
        rx
    }

    /// Hand a reply to its caller. False if nobody is waiting any more.
    fn complete(&self, correlation_id: &str, reply: Result<Vec<u8>, BrokerError>) -> bool {
        self.calls()
            .remove(correlation_id)
            .is_some_and(|tx| tx.send(reply).is_ok())
    }

    fn forget(&self, correlation_id: &str) {
        self.calls().remove(correlation_id);
    }

    fn len(&self) -> usize {
        self.calls().len()
    }
}

/// Removes the pending entry when the call finishes, times out or is
/// cancelled.
struct PendingGuard<'a> {
    pending: &'a PendingReplies,
    correlation_id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.forget(&self.correlation_id);
    }
}

/// Kafka-backed transport for the RPC client.
///
/// Requests are produced with a fresh correlation id and the reply topic in
/// their headers, then wait on a oneshot channel the reply consumer
/// completes.
///
/// The reply consumer does not join a consumer group. It is assigned every
/// partition of every reply topic, starting at the high watermark read while
/// the transport is built, so every instance sees the replies to its own
/// calls and no reply produced after [`KafkaTransportBuilder::build`]
/// returns is skipped. Reply partitions that appear later (topics
/// provisioned after the transport, partition growth) are picked up by a
/// periodic rescan and read from their beginning.
///
/// # Example
///
/// ```no_run
/// use meshbus_core::config::BrokerConfig;
/// use meshbus_core::TopicNamer;
/// use meshbus_redpanda::KafkaTransport;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = BrokerConfig::default();
/// let transport = KafkaTransport::builder(&broker)
///     .reply_topics([TopicNamer::unprefixed().reply_topic("users.get")])
///     .producer_acks("all")
///     .build()?;
/// # let _ = transport;
/// # Ok(())
/// # }
/// ```
pub struct KafkaTransport {
    producer: FutureProducer,
    reply_topics: HashSet<PrefixedTopic>,
    pending: Arc<PendingReplies>,
    request_timeout: Duration,
    send_timeout: Duration,
    reply_consumer: Option<JoinHandle<()>>,
}

impl KafkaTransport {
    /// Start configuring a transport.
    #[must_use]
    pub fn builder(broker: &BrokerConfig) -> KafkaTransportBuilder {
        KafkaTransportBuilder {
            broker: broker.clone(),
            reply_topics: Vec::new(),
            producer_acks: None,
            compression: None,
            send_timeout: None,
            partition_rescan: DEFAULT_PARTITION_RESCAN,
        }
    }

    /// Transport factory for `MeshBuilder::build`: consumes the reply
    /// channel of every registered dependency topic.
    ///
    /// # Errors
    ///
    /// See [`KafkaTransportBuilder::build`].
    pub fn for_mesh(
        config: &MeshConfig,
        dependencies: &Arc<DependencyRegistry>,
    ) -> Result<Arc<dyn BrokerTransport>, TransportError> {
        let namer = config.broker.topic_namer();
        let transport = Self::builder(&config.broker)
            .reply_topics(dependencies.reply_topics(&namer))
            .build()?;
        Ok(Arc::new(transport))
    }

    /// Reply channels this transport consumes.
    #[must_use]
    pub const fn reply_topics(&self) -> &HashSet<PrefixedTopic> {
        &self.reply_topics
    }

    /// Number of calls currently waiting for a reply.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    async fn produce(
        &self,
        topic: &PrefixedTopic,
        message: &WireMessage,
    ) -> Result<(), BrokerError> {
        let mut record: FutureRecord<'_, str, Vec<u8>> = FutureRecord::to(topic.as_str())
            .payload(&message.payload)
            .headers(wire::owned_headers(&message.headers));
        if let Some(key) = message.key.as_deref() {
            record = record.key(key);
        }

        match self
            .producer
            .send(record, Timeout::After(self.send_timeout))
            .await
        {
            Ok((partition, offset)) => {
                tracing::trace!(
                    topic = %topic,
                    partition = partition,
                    offset = offset,
                    "Message produced"
                );
                Ok(())
            }
            Err((error, _)) => {
                tracing::error!(topic = %topic, error = %error, "Failed to produce message");
                Err(BrokerError::Transport(error.to_string()))
            }
        }
    }
}

impl Drop for KafkaTransport {
    fn drop(&mut self) {
        if let Some(task) = self.reply_consumer.take() {
            task.abort();
        }
    }
}

impl BrokerTransport for KafkaTransport {
    fn request<'a>(
        &'a self,
        topic: &'a PrefixedTopic,
        mut message: WireMessage,
    ) -> BrokerFuture<'a, Result<Vec<u8>, BrokerError>> {
        Box::pin(async move {
            let reply_topic = topic.reply();
            if !self.reply_topics.contains(&reply_topic) {
                return Err(BrokerError::ReplyTopicNotSubscribed {
                    reply_topic: reply_topic.into_inner(),
                });
            }

            let correlation_id = Uuid::new_v4().to_string();
            let reply = self.pending.register(&correlation_id);
            let _guard = PendingGuard {
                pending: &self.pending,
                correlation_id: correlation_id.clone(),
            };

            message
                .headers
                .insert(CORRELATION_ID_HEADER.to_string(), correlation_id);
            message
                .headers
                .insert(REPLY_TOPIC_HEADER.to_string(), reply_topic.into_inner());
            self.produce(topic, &message).await?;

            match tokio::time::timeout(self.request_timeout, reply).await {
                Ok(Ok(reply)) => reply,
                Ok(Err(_)) => Err(BrokerError::Transport(
                    "reply consumer stopped before the reply arrived".to_string(),
                )),
                Err(_) => Err(BrokerError::Timeout {
                    topic: topic.as_str().to_string(),
                    after: self.request_timeout,
                }),
            }
        })
    }

    fn emit<'a>(
        &'a self,
        topic: &'a PrefixedTopic,
        message: WireMessage,
    ) -> BrokerFuture<'a, Result<(), BrokerError>> {
        Box::pin(async move { self.produce(topic, &message).await })
    }
}

/// Builder for [`KafkaTransport`].
pub struct KafkaTransportBuilder {
    broker: BrokerConfig,
    reply_topics: Vec<PrefixedTopic>,
    producer_acks: Option<String>,
    compression: Option<String>,
    send_timeout: Option<Duration>,
    partition_rescan: Duration,
}

impl KafkaTransportBuilder {
    /// Reply channels to consume.
    #[must_use]
    pub fn reply_topics<I>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = PrefixedTopic>,
    {
        self.reply_topics.extend(topics);
        self
    }

    /// Producer acknowledgment mode: "0", "1" or "all".
    ///
    /// Default: "all"
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Compression codec: "none", "gzip", "snappy", "lz4" or "zstd".
    ///
    /// Default: "none"
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// How long a produce may wait for delivery.
    ///
    /// Default: the broker config's `send_timeout`
    #[must_use]
    pub const fn send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = Some(timeout);
        self
    }

    /// How often to look for new reply partitions.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn partition_rescan(mut self, interval: Duration) -> Self {
        self.partition_rescan = interval;
        self
    }

    /// Create the producer and, when there are reply topics, the reply
    /// consumer.
    ///
    /// Blocks while it reads the reply partitions and their watermarks from
    /// the broker. Reply topics that do not exist yet are assigned once a
    /// rescan finds them.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Client`] if rdkafka rejects the configuration
    /// - [`TransportError::Assign`] if the reply partitions cannot be
    ///   read or assigned
    /// - [`TransportError::NoRuntime`] outside a Tokio runtime
    pub fn build(self) -> Result<KafkaTransport, TransportError> {
        let acks = self.producer_acks.as_deref().unwrap_or("all");
        let compression = self.compression.as_deref().unwrap_or("none");
        let send_timeout = self.send_timeout.unwrap_or(self.broker.send_timeout);

        let producer: FutureProducer = producer_config(&self.broker, acks, send_timeout)
            .set("compression.type", compression)
            .create()?;

        let pending = Arc::new(PendingReplies::default());
        let reply_topics: HashSet<PrefixedTopic> = self.reply_topics.into_iter().collect();

        let reply_consumer = if reply_topics.is_empty() {
            tracing::warn!("No reply topics registered; every request will be refused");
            None
        } else {
            let runtime =
                tokio::runtime::Handle::try_current().map_err(|_| TransportError::NoRuntime)?;
            let mut topics: Vec<String> =
                reply_topics.iter().map(|t| t.as_str().to_string()).collect();
            topics.sort_unstable();

            let consumer = reply_consumer(&self.broker)?;
            let assignment = ReplyAssignment::at_high_watermarks(&consumer, &topics)
                .and_then(|assignment| assignment.apply(&consumer).map(|()| assignment))
                .map_err(|e| TransportError::Assign {
                    topics: topics.clone(),
                    reason: e.to_string(),
                })?;
            tracing::info!(
                topics = ?topics,
                partitions = assignment.partitions.len(),
                "Reply consumer assigned"
            );

            Some(runtime.spawn(consume_replies(
                Arc::new(consumer),
                topics,
                assignment,
                Arc::clone(&pending),
                self.partition_rescan,
            )))
        };

        tracing::info!(
            brokers = %self.broker.brokers,
            acks = acks,
            compression = compression,
            reply_topics = reply_topics.len(),
            request_timeout = ?self.broker.request_timeout,
            send_timeout = ?send_timeout,
            "KafkaTransport created"
        );

        Ok(KafkaTransport {
            producer,
            reply_topics,
            pending,
            request_timeout: self.broker.request_timeout,
            send_timeout,
            reply_consumer,
        })
    }
}

fn reply_consumer(broker: &BrokerConfig) -> Result<StreamConsumer, TransportError> {
    // Offsets are never committed; the group id only labels the client.
    let group_id = format!("{}-replies-{}", broker.consumer_group, Uuid::new_v4());
    let consumer: StreamConsumer = client_config(broker)
        .set("group.id", &group_id)
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", "latest")
        .set("enable.partition.eof", "false")
        .create()?;
    Ok(consumer)
}

/// Partition ids of `topic`; empty while the topic does not exist.
fn partition_ids(consumer: &StreamConsumer, topic: &str) -> Result<Vec<i32>, KafkaError> {
    let metadata = consumer.fetch_metadata(Some(topic), METADATA_TIMEOUT)?;
    Ok(metadata
        .topics()
        .iter()
        .filter(|t| t.name() == topic && t.error().is_none())
        .flat_map(|t| t.partitions().iter().map(MetadataPartition::id))
        .collect())
}

/// Where reading a partition continues after a reassignment: the consumer's
/// position once it has one, otherwise the offset it was first assigned at.
fn resume_offset(start: Offset, position: Option<Offset>) -> Offset {
    match position {
        Some(Offset::Offset(next)) => Offset::Offset(next),
        _ => start,
    }
}

#[derive(Debug, Clone, PartialEq)]
struct ReplyPartition {
    topic: String,
    partition: i32,
    start: Offset,
}

/// Partitions the reply consumer reads, with the offset each started at.
#[derive(Debug, Default)]
struct ReplyAssignment {
    partitions: Vec<ReplyPartition>,
}

impl ReplyAssignment {
    /// Every existing partition of `topics`, starting at its high watermark.
    fn at_high_watermarks(
        consumer: &StreamConsumer,
        topics: &[String],
    ) -> Result<Self, KafkaError> {
        let mut partitions = Vec::new();
        for topic in topics {
            for partition in partition_ids(consumer, topic)? {
                let (_, high) = consumer.fetch_watermarks(topic, partition, METADATA_TIMEOUT)?;
                partitions.push(ReplyPartition {
                    topic: topic.clone(),
                    partition,
                    start: Offset::Offset(high),
                });
            }
        }
        Ok(Self { partitions })
    }

    fn contains(&self, topic: &str, partition: i32) -> bool {
        self.partitions
            .iter()
            .any(|p| p.topic == topic && p.partition == partition)
    }

    /// Add partitions of `topics` not assigned yet, starting at their
    /// beginning. Returns how many were added.
    fn add_new_partitions(
        &mut self,
        consumer: &StreamConsumer,
        topics: &[String],
    ) -> Result<usize, KafkaError> {
        let mut added = 0;
        for topic in topics {
            for partition in partition_ids(consumer, topic)? {
                if !self.contains(topic, partition) {
                    self.partitions.push(ReplyPartition {
                        topic: topic.clone(),
                        partition,
                        start: Offset::Beginning,
                    });
                    added += 1;
                }
            }
        }
        Ok(added)
    }

    /// Replace the consumer's assignment, keeping its position on
    /// partitions it already reads.
    fn apply(&self, consumer: &StreamConsumer) -> Result<(), KafkaError> {
        let positions = consumer.position()?;
        let mut list = TopicPartitionList::new();
        for p in &self.partitions {
            let position = positions
                .find_partition(&p.topic, p.partition)
                .map(|elem| elem.offset());
            list.add_partition_offset(&p.topic, p.partition, resume_offset(p.start, position))?;
        }
        consumer.assign(&list)
    }
}

async fn consume_replies(
    consumer: Arc<StreamConsumer>,
    topics: Vec<String>,
    mut assignment: ReplyAssignment,
    pending: Arc<PendingReplies>,
    rescan_every: Duration,
) {
    let mut rescan = tokio::time::interval_at(Instant::now() + rescan_every, rescan_every);
    rescan.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            received = consumer.recv() => match received {
                Ok(message) => deliver_reply(&message, &pending),
                Err(error) => {
                    tracing::warn!(error = %error, "Reply consumer error");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            _ = rescan.tick() => {
                let scan_consumer = Arc::clone(&consumer);
                let scan_topics = topics.clone();
                let mut scanned = std::mem::take(&mut assignment);
                let outcome = tokio::task::spawn_blocking(move || {
                    let result = scanned
                        .add_new_partitions(&scan_consumer, &scan_topics)
                        .and_then(|added| {
                            if added > 0 {
                                scanned.apply(&scan_consumer)?;
                            }
                            Ok(added)
                        });
                    (scanned, result)
                })
                .await;

                match outcome {
                    Ok((scanned, result)) => {
                        assignment = scanned;
                        match result {
                            Ok(0) => {}
                            Ok(added) => tracing::info!(added, "New reply partitions assigned"),
                            Err(error) => {
                                tracing::warn!(error = %error, "Reply partition rescan failed");
                            }
                        }
                    }
                    Err(error) => {
                        tracing::error!(error = %error, "Reply partition rescan task failed");
                    }
                }
            }
        }
    }
}

fn deliver_reply<M: Message>(message: &M, pending: &PendingReplies) {
    let headers = wire::read_headers(message);
    let Some(correlation_id) = headers.get(CORRELATION_ID_HEADER) else {
        tracing::debug!(topic = message.topic(), "Reply without correlation id ignored");
        return;
    };
    let reply = wire::decode_reply(&headers, message.payload().unwrap_or_default());
    if !pending.complete(correlation_id, reply) {
        tracing::debug!(
            topic = message.topic(),
            correlation_id = %correlation_id,
            "Reply for an expired or foreign call ignored"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn kafka_transport_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<KafkaTransport>();
        assert_sync::<KafkaTransport>();
    }

    #[test]
    fn pending_replies_complete_once() {
        let pending = PendingReplies::default();
        let mut rx = pending.register("c-1");

        assert!(pending.complete("c-1", Ok(b"1".to_vec())));
        assert!(!pending.complete("c-1", Ok(b"2".to_vec())));
        assert_eq!(rx.try_recv().unwrap().unwrap(), b"1".to_vec());
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn guard_forgets_abandoned_calls() {
        let pending = PendingReplies::default();
        let _rx = pending.register("c-2");
        {
            let _guard = PendingGuard {
                pending: &pending,
                correlation_id: "c-2".to_string(),
            };
        }
        assert_eq!(pending.len(), 0);
        assert!(!pending.complete("c-2", Ok(Vec::new())));
    }

    #[test]
    fn reassignment_resumes_from_consumed_position() {
        let start = Offset::Offset(40);

        // Nothing consumed yet: keep the watermark read at build time rather
        // than falling back to "latest".
        assert_eq!(resume_offset(start, None), start);
        assert_eq!(resume_offset(start, Some(Offset::Invalid)), start);
        assert_eq!(resume_offset(Offset::Beginning, Some(Offset::Invalid)), Offset::Beginning);

        assert_eq!(resume_offset(start, Some(Offset::Offset(57))), Offset::Offset(57));
    }

    #[test]
    fn assignment_tracks_partitions_by_topic_and_id() {
        let assignment = ReplyAssignment {
            partitions: vec![ReplyPartition {
                topic: "users.get.reply".to_string(),
                partition: 0,
                start: Offset::Offset(3),
            }],
        };

        assert!(assignment.contains("users.get.reply", 0));
        assert!(!assignment.contains("users.get.reply", 1));
        assert!(!assignment.contains("users.list.reply", 0));
    }

    #[tokio::test]
    async fn send_timeout_defaults_to_broker_config() {
        let broker = BrokerConfig {
            send_timeout: Duration::from_millis(1200),
            ..BrokerConfig::default()
        };

        let configured = KafkaTransport::builder(&broker).build().unwrap();
        assert_eq!(configured.send_timeout, Duration::from_millis(1200));

        let overridden = KafkaTransport::builder(&broker)
            .send_timeout(Duration::from_secs(2))
            .build()
            .unwrap();
        assert_eq!(overridden.send_timeout, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn unsubscribed_reply_topic_is_refused_without_producing() {
        // Creating a producer does not contact the broker.
        let transport = KafkaTransport::builder(&BrokerConfig::default())
            .build()
            .unwrap();
        let topic = meshbus_core::TopicNamer::unprefixed().prefixed("kyc.check");

        let err = transport
            .request(&topic, WireMessage {
                key: None,
                headers: Default::default(),
                payload: b"{}".to_vec(),
            })
            .await
            .unwrap_err();

        assert_eq!(
            err,
            BrokerError::ReplyTopicNotSubscribed {
                reply_topic: "kyc.check.reply".to_string()
            }
        );
        assert!(err.is_missing_reply_subscription());
        assert_eq!(transport.in_flight(), 0);
    }
}
