//! Topic administration over rdkafka's `AdminClient`.

use crate::config::client_config;
use meshbus_core::broker::{AdminConnector, BrokerFuture, ProvisionError, TopicAdmin};
use meshbus_core::config::BrokerConfig;
use meshbus_core::topic::{PrefixedTopic, TopicSpec};
use rdkafka::admin::{
    AdminClient, AdminOptions, NewPartitions, NewTopic, TopicReplication, TopicResult,
};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::error::KafkaError;
use rdkafka::metadata::Metadata;
use rdkafka::types::RDKafkaErrorCode;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

type Client = AdminClient<DefaultClientContext>;

const LEADER_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Opens [`KafkaTopicAdmin`] sessions.
pub struct KafkaAdminConnector {
    config: ClientConfig,
    timeout: Duration,
}

impl KafkaAdminConnector {
    /// Connector for `broker`, with a 30 second operation timeout.
    #[must_use]
    pub fn new(broker: &BrokerConfig) -> Self {
        Self {
            config: client_config(broker),
            timeout: Duration::from_secs(30),
        }
    }

    /// Bound on each admin and metadata operation.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl AdminConnector for KafkaAdminConnector {
    fn connect(&self) -> BrokerFuture<'_, Result<Box<dyn TopicAdmin>, ProvisionError>> {
        Box::pin(async move {
            let client: Client = self
                .config
                .create()
                .map_err(|e| ProvisionError::ConnectionFailed(e.to_string()))?;
            let admin = KafkaTopicAdmin {
                client: Arc::new(client),
                timeout: self.timeout,
            };

            // Creating the client does not touch the network; a metadata
            // round trip does.
            let metadata = admin
                .metadata(None, self.timeout)
                .await
                .map_err(|e| ProvisionError::ConnectionFailed(e.to_string()))?;
            tracing::debug!(
                brokers = metadata.brokers().len(),
                topics = metadata.topics().len(),
                "Admin client connected"
            );
            Ok(Box::new(admin) as Box<dyn TopicAdmin>)
        })
    }
}

/// An open admin session.
pub struct KafkaTopicAdmin {
    client: Arc<Client>,
    timeout: Duration,
}

impl KafkaTopicAdmin {
    fn options(&self) -> AdminOptions {
        AdminOptions::new()
            .operation_timeout(Some(self.timeout))
            .request_timeout(Some(self.timeout))
    }

    /// Metadata fetches block, so they run off the async workers.
    async fn metadata(
        &self,
        topic: Option<&str>,
        timeout: Duration,
    ) -> Result<Metadata, KafkaError> {
        let client = Arc::clone(&self.client);
        let topic = topic.map(str::to_string);
        tokio::task::spawn_blocking(move || {
            client.inner().fetch_metadata(topic.as_deref(), timeout)
        })
        .await
            .map_err(|_| KafkaError::Canceled)?
    }

    /// Poll until every partition of `topic` has a leader. No poll, and no
    /// pause between polls, outlasts `leader_wait`.
    async fn wait_for_leaders(
        &self,
        topic: &str,
        leader_wait: Duration,
    ) -> Result<(), ProvisionError> {
        let deadline = Instant::now() + leader_wait;
        while let Some(budget) = poll_budget(self.timeout, deadline, Instant::now()) {
            match self.metadata(Some(topic), budget).await {
                Ok(metadata) if has_all_leaders(&metadata, topic) => return Ok(()),
                Ok(_) => {}
                Err(e) => tracing::debug!(topic = %topic, error = %e, "Metadata not ready yet"),
            }
            let Some(pause) = poll_budget(LEADER_POLL_INTERVAL, deadline, Instant::now()) else {
                break;
            };
            tokio::time::sleep(pause).await;
        }
        Err(ProvisionError::LeaderElectionTimeout {
            topic: topic.to_string(),
            waited: leader_wait,
        })
    }
}

/// `limit`, shortened to what is left before `deadline`; `None` once the
/// deadline has passed.
fn poll_budget(limit: Duration, deadline: Instant, now: Instant) -> Option<Duration> {
    let remaining = deadline.checked_duration_since(now)?;
    (!remaining.is_zero()).then(|| limit.min(remaining))
}

fn has_all_leaders(metadata: &Metadata, topic: &str) -> bool {
    metadata
        .topics()
        .iter()
        .find(|t| t.name() == topic)
        .is_some_and(|t| {
            t.error().is_none()
                && !t.partitions().is_empty()
                && t.partitions().iter().all(|p| p.leader() >= 0)
        })
}

/// The single result of a one-topic admin call. Already-existing topics count
/// as success.
fn single_result(results: Vec<TopicResult>) -> Result<(), String> {
    match results.into_iter().next() {
        Some(Ok(_) | Err((_, RDKafkaErrorCode::TopicAlreadyExists))) => Ok(()),
        Some(Err((_, code))) => Err(code.to_string()),
        None => Err("broker returned no result".to_string()),
    }
}

impl TopicAdmin for KafkaTopicAdmin {
    fn list_topics(&self) -> BrokerFuture<'_, Result<Vec<PrefixedTopic>, ProvisionError>> {
        Box::pin(async move {
            let metadata = self
                .metadata(None, self.timeout)
                .await
                .map_err(|e| ProvisionError::MetadataFailed(e.to_string()))?;
            Ok(metadata
                .topics()
                .iter()
                .map(|topic| PrefixedTopic::from_broker(topic.name()))
                .collect())
        })
    }

    fn create_topic<'a>(
        &'a self,
        spec: &'a TopicSpec,
        leader_wait: Duration,
    ) -> BrokerFuture<'a, Result<(), ProvisionError>> {
        Box::pin(async move {
            let name = spec.name.as_str();
            let new_topic = NewTopic::new(
                name,
                spec.partitions,
                TopicReplication::Fixed(spec.replication_factor),
            );

            let results = self
                .client
                .create_topics(&[new_topic], &self.options())
                .await
                .map_err(|e| ProvisionError::CreateFailed {
                    topic: name.to_string(),
                    reason: e.to_string(),
                })?;
            single_result(results).map_err(|reason| ProvisionError::CreateFailed {
                topic: name.to_string(),
                reason,
            })?;

            self.wait_for_leaders(name, leader_wait).await?;
            tracing::debug!(topic = %name, partitions = spec.partitions, "Topic ready");
            Ok(())
        })
    }

    fn partition_counts<'a>(
        &'a self,
        topics: &'a [PrefixedTopic],
    ) -> BrokerFuture<'a, Result<HashMap<PrefixedTopic, i32>, ProvisionError>> {
        Box::pin(async move {
            let metadata = self
                .metadata(None, self.timeout)
                .await
                .map_err(|e| ProvisionError::MetadataFailed(e.to_string()))?;

            let mut counts = HashMap::with_capacity(topics.len());
            for described in metadata.topics() {
                if described.error().is_some() {
                    continue;
                }
                if let Some(topic) = topics.iter().find(|t| t.as_str() == described.name()) {
                    let partitions =
                        i32::try_from(described.partitions().len()).unwrap_or(i32::MAX);
                    counts.insert(topic.clone(), partitions);
                }
            }
            Ok(counts)
        })
    }

    fn create_partitions<'a>(
        &'a self,
        topic: &'a PrefixedTopic,
        total: i32,
    ) -> BrokerFuture<'a, Result<(), ProvisionError>> {
        Box::pin(async move {
            let failed = |reason: String| ProvisionError::PartitionIncreaseFailed {
                topic: topic.as_str().to_string(),
                partitions: total,
                reason,
            };

            let count = usize::try_from(total).map_err(|e| failed(e.to_string()))?;
            let results = self
                .client
                .create_partitions(&[NewPartitions::new(topic.as_str(), count)], &self.options())
                .await
                .map_err(|e| failed(e.to_string()))?;
            single_result(results).map_err(failed)
        })
    }

    fn disconnect(self: Box<Self>) -> BrokerFuture<'static, ()> {
        Box::pin(async move {
            drop(self);
            tracing::debug!("Admin client disconnected");
        })
    }
}
