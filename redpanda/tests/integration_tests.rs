//! Integration tests against a real Kafka broker.
//!
//! These tests use testcontainers to start Kafka and check:
//! - Topic provisioning, including partition growth
//! - Request/reply through [`KafkaTransport`] and [`KafkaResponder`]
//! - Typed remote errors crossing the broker
//! - Reply topics created after the transport was built
//!
//! # Running These Tests
//!
//! They are `#[ignore]`d by default because they need Docker and take a while
//! to start the broker:
//! ```bash
//! cargo test -p meshbus-redpanda --test integration_tests -- --ignored
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use meshbus_core::config::{BrokerConfig, ProvisioningConfig};
use meshbus_core::{
    AdminConnector, Envelope, ExceptionRegistry, RemoteError, RemoteException, RpcError, TopicAdmin,
    TopicNamer,
};
use meshbus_redpanda::{KafkaAdminConnector, KafkaResponder, KafkaTransport, remote_error};
use meshbus_runtime::{RpcClient, TopicProvisioner};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};

// ============================================================================
// Test Fixtures
// ============================================================================

#[derive(Debug, thiserror::Error)]
#[error("account {account} is frozen")]
struct AccountFrozen {
    account: String,
}

impl RemoteException for AccountFrozen {
    const CODE: &'static str = "ACCOUNT_FROZEN";

    fn from_remote(remote: &RemoteError) -> Self {
        Self {
            account: remote
                .data
                .as_ref()
                .and_then(|data| data["account"].as_str())
                .unwrap_or_default()
                .to_string(),
        }
    }

    fn data(&self) -> Option<Value> {
        Some(json!({ "account": self.account }))
    }
}

async fn start_kafka() -> (ContainerAsync<Kafka>, BrokerConfig) {
    let kafka = Kafka::default()
        .with_env_var("KAFKA_AUTO_CREATE_TOPICS_ENABLE", "false")
        .start()
        .await
        .expect("Failed to start Kafka container");
    let host = kafka.get_host().await.expect("Failed to get host");
    let port = kafka
        .get_host_port_ipv4(KAFKA_PORT)
        .await
        .expect("Failed to get port");

    let broker = BrokerConfig {
        brokers: format!("{host}:{port}"),
        consumer_group: format!("meshbus-test-{port}"),
        request_timeout: Duration::from_secs(20),
        ..BrokerConfig::default()
    };
    wait_for_broker(&broker).await;
    (kafka, broker)
}

async fn wait_for_broker(broker: &BrokerConfig) {
    let connector = KafkaAdminConnector::new(broker).with_timeout(Duration::from_secs(2));
    for _ in 0..60 {
        if let Ok(admin) = connector.connect().await {
            admin.disconnect().await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    panic!("Kafka failed to become ready");
}

fn provisioner(broker: &BrokerConfig, partitions: i32) -> TopicProvisioner {
    TopicProvisioner::new(
        Arc::new(KafkaAdminConnector::new(broker)),
        broker.topic_namer(),
        ProvisioningConfig {
            default_partitions: partitions,
            leader_wait: Duration::from_secs(30),
            ..ProvisioningConfig::default()
        },
    )
}

// ============================================================================
// Provisioning
// ============================================================================

#[tokio::test]
#[ignore = "requires Docker"]
async fn provisioning_creates_topics_and_grows_partitions() {
    let (_kafka, broker) = start_kafka().await;

    let report = provisioner(&broker, 1)
        .ensure_topics(&["ledger.post"], &["ledger.posted"])
        .await
        .unwrap();
    let created: Vec<_> = report.created.iter().map(|t| t.as_str().to_string()).collect();
    assert_eq!(created, vec!["ledger.post", "ledger.post.reply", "ledger.posted"]);

    // Running again only raises partition counts.
    let report = provisioner(&broker, 3)
        .ensure_topics(&["ledger.post"], &["ledger.posted"])
        .await
        .unwrap();
    assert!(report.created.is_empty());
    assert_eq!(report.partitions_increased.len(), 3);

    let admin = KafkaAdminConnector::new(&broker).connect().await.unwrap();
    let topics = [TopicNamer::unprefixed().prefixed("ledger.posted")];
    let counts = admin.partition_counts(&topics).await.unwrap();
    assert_eq!(counts[&topics[0]], 3);
    admin.disconnect().await;
}

// ============================================================================
// Request / reply
// ============================================================================

#[tokio::test]
#[ignore = "requires Docker"]
async fn request_reply_round_trip_with_typed_errors() {
    let (_kafka, broker) = start_kafka().await;
    provisioner(&broker, 1)
        .ensure_topics(&["accounts.get"], &[] as &[&str])
        .await
        .unwrap();

    let responder = KafkaResponder::builder(&broker)
        .auto_offset_reset("earliest")
        .handle("accounts.get", |request: Envelope<Value>| async move {
            let account = request.value["account"].as_str().unwrap_or_default().to_string();
            if account == "frozen-1" {
                return Err(remote_error(AccountFrozen { account }));
            }
            Ok(json!({ "account": account, "balance": 120 }))
        })
        .build()
        .unwrap();
    let server = tokio::spawn(responder.run());

    let transport = KafkaTransport::builder(&broker)
        .reply_topics([broker.topic_namer().reply_topic("accounts.get")])
        .build()
        .unwrap();
    let client = RpcClient::new(Arc::new(transport)).with_exceptions(Arc::new(
        ExceptionRegistry::builder().register::<AccountFrozen>().build(),
    ));

    // No wait: the reply consumer reads from the watermark taken at build.
    let reply: Value = client
        .send(
            "accounts.get",
            &Envelope::new(json!({"account": "acc-1"})).with_request_id("req-1"),
        )
        .await
        .unwrap();
    assert_eq!(reply, json!({"account": "acc-1", "balance": 120}));

    let err = client
        .send::<_, Value>(
            "accounts.get",
            &Envelope::new(json!({"account": "frozen-1"})).with_request_id("req-2"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Domain { .. }));
    assert_eq!(err.domain::<AccountFrozen>().unwrap().account, "frozen-1");

    server.abort();
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn reply_topic_provisioned_after_the_transport_is_picked_up() {
    let (_kafka, broker) = start_kafka().await;

    // Mesh order: the transport exists before its reply topic does.
    let transport = KafkaTransport::builder(&broker)
        .reply_topics([broker.topic_namer().reply_topic("fx.quote")])
        .partition_rescan(Duration::from_millis(500))
        .build()
        .unwrap();
    provisioner(&broker, 2)
        .ensure_topics(&["fx.quote"], &[] as &[&str])
        .await
        .unwrap();

    let responder = KafkaResponder::builder(&broker)
        .auto_offset_reset("earliest")
        .handle("fx.quote", |request: Envelope<Value>| async move {
            Ok::<_, RemoteError>(json!({ "pair": request.value["pair"], "rate": 1.08 }))
        })
        .build()
        .unwrap();
    let server = tokio::spawn(responder.run());

    let client = RpcClient::new(Arc::new(transport));
    let reply: Value = client
        .send("fx.quote", &Envelope::new(json!({"pair": "EURUSD"})).with_request_id("q-1"))
        .await
        .unwrap();
    assert_eq!(reply, json!({"pair": "EURUSD", "rate": 1.08}));

    server.abort();
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn unsubscribed_service_is_reported_as_not_loaded() {
    let (_kafka, broker) = start_kafka().await;

    let transport = KafkaTransport::builder(&broker).build().unwrap();
    let client = RpcClient::new(Arc::new(transport));

    let err = client
        .send::<_, Value>("reports.render", &Envelope::new(json!({})))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        RpcError::ServiceNotLoaded { ref pattern } if pattern == "reports.render"
    ));
}
