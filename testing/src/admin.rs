//! In-memory topic administration.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on poisoned locks

use meshbus_core::broker::{AdminConnector, BrokerFuture, ProvisionError, TopicAdmin};
use meshbus_core::topic::{PrefixedTopic, TopicSpec};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct Cluster {
    topics: BTreeMap<String, i32>,
    created: Vec<TopicSpec>,
    partition_increases: Vec<(String, i32)>,
    leader_waits: Vec<Duration>,
    connects: usize,
    disconnects: usize,
    fail_connect: bool,
    fail_create: BTreeSet<String>,
}

/// A fake cluster that hands out [`TopicAdmin`] sessions.
///
/// Clones share the same cluster, so a test keeps one handle for assertions
/// and gives another to the provisioner.
#[derive(Clone, Default)]
pub struct InMemoryAdminConnector {
    cluster: Arc<Mutex<Cluster>>,
}

impl InMemoryAdminConnector {
    /// Empty cluster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cluster that already has `topics` with the given partition counts.
    #[must_use]
    pub fn with_topics<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = (S, i32)>,
        S: Into<String>,
    {
        let connector = Self::new();
        connector
            .cluster
            .lock()
            .unwrap()
            .topics
            .extend(topics.into_iter().map(|(name, n)| (name.into(), n)));
        connector
    }

    /// Refuse every connection attempt.
    #[must_use]
    pub fn failing_connect(self) -> Self {
        self.cluster.lock().unwrap().fail_connect = true;
        self
    }

    /// Fail creation of `topic`.
    #[must_use]
    pub fn failing_create(self, topic: impl Into<String>) -> Self {
        self.cluster.lock().unwrap().fail_create.insert(topic.into());
        self
    }

    /// Current topics and partition counts.
    #[must_use]
    pub fn topics(&self) -> BTreeMap<String, i32> {
        self.cluster.lock().unwrap().topics.clone()
    }

    /// Topics created so far, in creation order.
    #[must_use]
    pub fn created(&self) -> Vec<TopicSpec> {
        self.cluster.lock().unwrap().created.clone()
    }

    /// Partition increases requested so far.
    #[must_use]
    pub fn partition_increases(&self) -> Vec<(String, i32)> {
        self.cluster.lock().unwrap().partition_increases.clone()
    }

    /// Leader wait bound passed to each creation.
    #[must_use]
    pub fn leader_waits(&self) -> Vec<Duration> {
        self.cluster.lock().unwrap().leader_waits.clone()
    }

    /// Sessions opened.
    #[must_use]
    pub fn connects(&self) -> usize {
        self.cluster.lock().unwrap().connects
    }

    /// Sessions closed.
    #[must_use]
    pub fn disconnects(&self) -> usize {
        self.cluster.lock().unwrap().disconnects
    }
}

impl AdminConnector for InMemoryAdminConnector {
    fn connect(&self) -> BrokerFuture<'_, Result<Box<dyn TopicAdmin>, ProvisionError>> {
        Box::pin(async move {
            let mut cluster = self.cluster.lock().unwrap();
            if cluster.fail_connect {
                return Err(ProvisionError::ConnectionFailed(
                    "in-memory cluster refused connection".to_string(),
                ));
            }
            cluster.connects += 1;
            Ok(Box::new(InMemoryTopicAdmin {
                cluster: Arc::clone(&self.cluster),
            }) as Box<dyn TopicAdmin>)
        })
    }
}

/// Admin session over an [`InMemoryAdminConnector`] cluster.
pub struct InMemoryTopicAdmin {
    cluster: Arc<Mutex<Cluster>>,
}

impl TopicAdmin for InMemoryTopicAdmin {
    fn list_topics(&self) -> BrokerFuture<'_, Result<Vec<PrefixedTopic>, ProvisionError>> {
        Box::pin(async move {
            Ok(self
                .cluster
                .lock()
                .unwrap()
                .topics
                .keys()
                .map(PrefixedTopic::from_broker)
                .collect())
        })
    }

    fn create_topic<'a>(
        &'a self,
        spec: &'a TopicSpec,
        leader_wait: Duration,
    ) -> BrokerFuture<'a, Result<(), ProvisionError>> {
        Box::pin(async move {
            let mut cluster = self.cluster.lock().unwrap();
            if cluster.fail_create.contains(spec.name.as_str()) {
                return Err(ProvisionError::CreateFailed {
                    topic: spec.name.as_str().to_string(),
                    reason: "rejected by in-memory cluster".to_string(),
                });
            }
            cluster
                .topics
                .entry(spec.name.as_str().to_string())
                .or_insert(spec.partitions);
            cluster.created.push(spec.clone());
            cluster.leader_waits.push(leader_wait);
            Ok(())
        })
    }

    fn partition_counts<'a>(
        &'a self,
        topics: &'a [PrefixedTopic],
    ) -> BrokerFuture<'a, Result<HashMap<PrefixedTopic, i32>, ProvisionError>> {
        Box::pin(async move {
            let cluster = self.cluster.lock().unwrap();
            Ok(topics
                .iter()
                .filter_map(|t| cluster.topics.get(t.as_str()).map(|n| (t.clone(), *n)))
                .collect())
        })
    }

    fn create_partitions<'a>(
        &'a self,
        topic: &'a PrefixedTopic,
        total: i32,
    ) -> BrokerFuture<'a, Result<(), ProvisionError>> {
        Box::pin(async move {
            let mut cluster = self.cluster.lock().unwrap();
            match cluster.topics.get_mut(topic.as_str()) {
                Some(current) if *current < total => *current = total,
                Some(_) => {
                    return Err(ProvisionError::PartitionIncreaseFailed {
                        topic: topic.as_str().to_string(),
                        partitions: total,
                        reason: "partition count can only grow".to_string(),
                    });
                }
                None => {
                    return Err(ProvisionError::PartitionIncreaseFailed {
                        topic: topic.as_str().to_string(),
                        partitions: total,
                        reason: "unknown topic".to_string(),
                    });
                }
            }
            cluster
                .partition_increases
                .push((topic.as_str().to_string(), total));
            Ok(())
        })
    }

    fn disconnect(self: Box<Self>) -> BrokerFuture<'static, ()> {
        Box::pin(async move {
            self.cluster.lock().unwrap().disconnects += 1;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn partitions_never_shrink() {
        let connector = InMemoryAdminConnector::with_topics([("t", 4)]);
        let admin = connector.connect().await.unwrap();
        let err = admin
            .create_partitions(&PrefixedTopic::from_broker("t"), 2)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::PartitionIncreaseFailed { .. }));
        admin.disconnect().await;
        assert_eq!(connector.topics()["t"], 4);
        assert_eq!(connector.disconnects(), 1);
    }
}
