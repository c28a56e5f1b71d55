//! Integration tests for topic provisioning against an in-memory cluster

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use meshbus_core::config::ProvisioningConfig;
use meshbus_core::{ProvisionError, PrefixedTopic, TopicNamer};
use meshbus_runtime::TopicProvisioner;
use meshbus_testing::InMemoryAdminConnector;
use std::sync::Arc;
use std::time::Duration;

const NONE: &[&str] = &[];

fn provisioner(
    connector: &InMemoryAdminConnector,
    prefix: Option<&str>,
    partitions: i32,
) -> TopicProvisioner {
    TopicProvisioner::new(
        Arc::new(connector.clone()),
        TopicNamer::new(prefix.map(str::to_string)),
        ProvisioningConfig {
            default_partitions: partitions,
            ..ProvisioningConfig::default()
        },
    )
}

fn names(topics: &[PrefixedTopic]) -> Vec<&str> {
    topics.iter().map(PrefixedTopic::as_str).collect()
}

#[tokio::test]
async fn creates_only_missing_topics() {
    let connector = InMemoryAdminConnector::with_topics([("A", 1)]);

    let report = provisioner(&connector, None, 1)
        .ensure_topics(&["B"], &["A"])
        .await
        .unwrap();

    assert_eq!(names(&report.created), vec!["B", "B.reply"]);
    assert!(report.partitions_increased.is_empty());
    assert_eq!(connector.topics()["A"], 1);
    assert_eq!(connector.connects(), 1);
    assert_eq!(connector.disconnects(), 1);
}

#[tokio::test]
async fn created_topics_carry_defaults_and_leader_wait() {
    let connector = InMemoryAdminConnector::new();

    provisioner(&connector, None, 3)
        .ensure_topics(&["kyc.check"], NONE)
        .await
        .unwrap();

    let created = connector.created();
    assert_eq!(created.len(), 2);
    assert!(created.iter().all(|spec| spec.partitions == 3 && spec.replication_factor == 1));
    assert!(created.iter().any(|spec| spec.is_reply_topic));
    assert_eq!(connector.leader_waits(), vec![Duration::from_secs(120); 2]);
}

#[tokio::test]
async fn applies_prefix_and_ignores_foreign_topics() {
    let connector = InMemoryAdminConnector::with_topics([("prod.orders", 1), ("orders.reply", 1)]);

    let report = provisioner(&connector, Some("prod"), 1)
        .ensure_topics(&["orders"], NONE)
        .await
        .unwrap();

    assert_eq!(names(&report.created), vec!["prod.orders.reply"]);
}

#[tokio::test]
async fn partitions_are_only_ever_raised() {
    let connector = InMemoryAdminConnector::with_topics([("A", 1), ("C", 5)]);

    let report = provisioner(&connector, None, 3)
        .ensure_topics(NONE, &["A", "C"])
        .await
        .unwrap();

    assert!(report.created.is_empty());
    assert_eq!(report.partitions_increased, vec![(PrefixedTopic::from_broker("A"), 3)]);
    assert_eq!(connector.topics()["A"], 3);
    assert_eq!(connector.topics()["C"], 5);
}

#[tokio::test]
async fn creation_failure_aborts_and_disconnects() {
    let connector = InMemoryAdminConnector::new().failing_create("B.reply");

    let err = provisioner(&connector, None, 1)
        .ensure_topics(&["B"], NONE)
        .await
        .unwrap_err();

    assert!(matches!(err, ProvisionError::CreateFailed { ref topic, .. } if topic == "B.reply"));
    assert_eq!(connector.disconnects(), 1);
    assert!(connector.partition_increases().is_empty());
}

#[tokio::test]
async fn connection_failure_is_fatal() {
    let connector = InMemoryAdminConnector::new().failing_connect();

    let err = provisioner(&connector, None, 1)
        .ensure_topics(&["B"], NONE)
        .await
        .unwrap_err();

    assert!(matches!(err, ProvisionError::ConnectionFailed(_)));
}

#[tokio::test]
async fn nothing_to_do_skips_the_admin_session() {
    let connector = InMemoryAdminConnector::new();

    let report = provisioner(&connector, None, 1)
        .ensure_topics(NONE, NONE)
        .await
        .unwrap();

    assert_eq!(report, Default::default());
    assert_eq!(connector.connects(), 0);
}
