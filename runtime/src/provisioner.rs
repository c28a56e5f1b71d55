//! Topic provisioning.
//!
//! Run once at startup or deploy time, before any traffic flows, so no
//! producer or consumer starts against a missing topic or one without an
//! elected leader. Any broker failure aborts the run; recovery is a process
//! restart, not an internal retry.

use crate::metrics::ProvisioningMetrics;
use meshbus_core::broker::{AdminConnector, ProvisionError, TopicAdmin};
use meshbus_core::config::ProvisioningConfig;
use meshbus_core::topic::{PrefixedTopic, TopicNamer, TopicSpec};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

/// What a provisioning run changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionReport {
    /// Topics created, in creation order.
    pub created: Vec<PrefixedTopic>,
    /// Topics whose partition count was raised, with the new total.
    pub partitions_increased: Vec<(PrefixedTopic, i32)>,
}

/// Ensures request, reply and event topics exist with enough partitions.
#[derive(Clone)]
pub struct TopicProvisioner {
    connector: Arc<dyn AdminConnector>,
    namer: TopicNamer,
    config: ProvisioningConfig,
}

impl TopicProvisioner {
    /// Provisioner creating topics through `connector`.
    #[must_use]
    pub fn new(
        connector: Arc<dyn AdminConnector>,
        namer: TopicNamer,
        config: ProvisioningConfig,
    ) -> Self {
        Self {
            connector,
            namer,
            config,
        }
    }

    /// Make sure every request pattern, its `.reply` channel and every event
    /// pattern exist on the broker.
    ///
    /// Patterns are logical names; they are prefixed here. Existing topics
    /// outside this deployment's prefix are ignored. Partition counts are
    /// only ever raised to the configured default, never lowered.
    ///
    /// # Errors
    ///
    /// Returns the first [`ProvisionError`]; the admin session is closed
    /// either way.
    pub async fn ensure_topics<R, E>(
        &self,
        request_patterns: &[R],
        event_patterns: &[E],
    ) -> Result<ProvisionReport, ProvisionError>
    where
        R: AsRef<str>,
        E: AsRef<str>,
    {
        let mut candidates = BTreeSet::new();
        for pattern in request_patterns {
            candidates.insert(self.namer.prefixed(pattern.as_ref()));
            candidates.insert(self.namer.reply_topic(pattern.as_ref()));
        }
        for pattern in event_patterns {
            candidates.insert(self.namer.prefixed(pattern.as_ref()));
        }
        if candidates.is_empty() {
            return Ok(ProvisionReport::default());
        }

        let admin = self.connector.connect().await?;
        let result = self.provision(admin.as_ref(), &candidates).await;
        admin.disconnect().await;

        match &result {
            Ok(report) => tracing::info!(
                candidates = candidates.len(),
                created = report.created.len(),
                partitions_increased = report.partitions_increased.len(),
                "Topics provisioned"
            ),
            Err(error) => tracing::error!(error = %error, "Topic provisioning failed"),
        }
        result
    }

    async fn provision(
        &self,
        admin: &dyn TopicAdmin,
        candidates: &BTreeSet<PrefixedTopic>,
    ) -> Result<ProvisionReport, ProvisionError> {
        let mut report = ProvisionReport::default();

        let known: HashSet<PrefixedTopic> = admin
            .list_topics()
            .await?
            .into_iter()
            .filter(|topic| self.namer.owns(topic.as_str()))
            .collect();

        for topic in candidates.iter().filter(|topic| !known.contains(*topic)) {
            let spec = TopicSpec::new(
                topic.clone(),
                self.config.default_partitions,
                self.config.replication_factor,
            );
            tracing::debug!(
                topic = %topic,
                partitions = spec.partitions,
                replication_factor = spec.replication_factor,
                "Creating topic"
            );
            admin.create_topic(&spec, self.config.leader_wait).await?;
            ProvisioningMetrics::record_topic_created();
            report.created.push(topic.clone());
        }

        let names: Vec<PrefixedTopic> = candidates.iter().cloned().collect();
        let counts = admin.partition_counts(&names).await?;
        for topic in &names {
            match counts.get(topic) {
                Some(&current) if current < self.config.default_partitions => {
                    tracing::info!(
                        topic = %topic,
                        from = current,
                        to = self.config.default_partitions,
                        "Increasing partitions"
                    );
                    admin
                        .create_partitions(topic, self.config.default_partitions)
                        .await?;
                    ProvisioningMetrics::record_partitions_increased();
                    report
                        .partitions_increased
                        .push((topic.clone(), self.config.default_partitions));
                }
                Some(_) => {}
                None => tracing::warn!(topic = %topic, "Topic missing from metadata"),
            }
        }

        Ok(report)
    }
}
