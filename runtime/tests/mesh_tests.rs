//! End-to-end wiring through the composition root with in-memory
//! collaborators.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use meshbus_core::config::MeshConfig;
use meshbus_core::error::RemoteError;
use meshbus_core::exception::RemoteException;
use meshbus_core::unit_of_work::UnitOfWork;
use meshbus_core::{BrokerTransport, RemoteStub, RequestContext, RpcError};
use meshbus_runtime::{MeshBuilder, MeshError, RpcClient};
use meshbus_testing::{InMemoryAdminConnector, InMemoryLockStore, InMemoryUnitOfWork, MockTransport};
use serde_json::{Value, json};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Test Fixtures
// ============================================================================

#[derive(Debug, thiserror::Error)]
#[error("{message}")]
struct LimitExceeded {
    message: String,
}

impl RemoteException for LimitExceeded {
    const CODE: &'static str = "LIMIT_EXCEEDED";

    fn from_remote(remote: &RemoteError) -> Self {
        Self {
            message: remote.message.clone(),
        }
    }
}

/// Leaf stub: waits for replies on `limits.check`.
struct LimitsStub {
    client: RpcClient,
}

impl RemoteStub for LimitsStub {
    const ID: &'static str = "limits";
    const DEPENDENCY_TOPICS: &'static [&'static str] = &["limits.check"];
    type Args = RpcClient;

    fn construct(client: RpcClient) -> Self {
        Self { client }
    }
}

impl LimitsStub {
    async fn check(&self, ctx: &RequestContext, amount: u64) -> Result<Value, RpcError> {
        self.client.send("limits.check", &ctx.envelope(json!({ "amount": amount }))).await
    }
}

/// Composite stub: delegates to the limits stub.
struct WithdrawStub;

impl RemoteStub for WithdrawStub {
    const ID: &'static str = "withdraw";
    const DEPENDENCY_STUBS: &'static [&'static str] = &["limits"];
    type Args = ();

    fn construct((): ()) -> Self {
        Self
    }
}

fn config() -> MeshConfig {
    let mut config = MeshConfig::default();
    config.broker.topic_prefix = Some("staging".to_string());
    config
}

type TransportResult = Result<Arc<dyn BrokerTransport>, Infallible>;

fn transport_factory(
    transport: &MockTransport,
) -> impl FnOnce(&MeshConfig, &Arc<meshbus_core::DependencyRegistry>) -> TransportResult {
    let transport = transport.clone();
    move |_, _| Ok(Arc::new(transport) as Arc<dyn BrokerTransport>)
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn registered_stubs_drive_provisioning_and_calls() {
    let transport = MockTransport::new()
        .respond_json("staging.limits.check", &json!({"allowed": true}))
        .with_subscribed_replies(["staging.limits.check.reply"]);
    let admin = InMemoryAdminConnector::new();

    let mesh = MeshBuilder::new(config())
        .register_stub::<LimitsStub>()
        .register_stub::<WithdrawStub>()
        .build(
            transport_factory(&transport),
            Arc::new(admin.clone()),
            Arc::new(InMemoryLockStore::new()),
        )
        .unwrap();

    let report = mesh.provision(&["withdraw.requested"]).await.unwrap();
    let created: Vec<_> = report.created.iter().map(|t| t.as_str().to_string()).collect();
    assert_eq!(
        created,
        vec!["staging.limits.check", "staging.limits.check.reply", "staging.withdraw.requested"]
    );

    let limits = mesh.client.stub::<LimitsStub>(mesh.client.clone()).unwrap();
    let reply = limits.check(&RequestContext::new("r-1"), 100).await.unwrap();
    assert_eq!(reply, json!({"allowed": true}));

    assert!(mesh.client.stub::<WithdrawStub>(()).is_ok());
}

#[tokio::test]
async fn composite_stub_without_its_dependency_is_refused() {
    let mesh = MeshBuilder::new(config())
        .register_stub::<WithdrawStub>()
        .build(
            transport_factory(&MockTransport::new()),
            Arc::new(InMemoryAdminConnector::new()),
            Arc::new(InMemoryLockStore::new()),
        )
        .unwrap();

    match mesh.client.stub::<WithdrawStub>(()) {
        Err(RpcError::DependencyNotLoaded(error)) => {
            assert_eq!(error.missing_stubs.len(), 1);
            assert_eq!(error.missing_stubs[0].as_str(), "limits");
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("stub should have been refused"),
    }
}

#[tokio::test]
async fn registered_exceptions_cross_the_boundary() {
    let transport = MockTransport::new().respond_remote_error(
        "staging.limits.check",
        RemoteError::new("daily limit reached").with_code("LIMIT_EXCEEDED"),
    );
    let mesh = MeshBuilder::new(config())
        .register_stub::<LimitsStub>()
        .register_exception::<LimitExceeded>()
        .build(
            transport_factory(&transport),
            Arc::new(InMemoryAdminConnector::new()),
            Arc::new(InMemoryLockStore::new()),
        )
        .unwrap();

    let limits = mesh.client.stub::<LimitsStub>(mesh.client.clone()).unwrap();
    let err = limits.check(&RequestContext::generate(), 1).await.unwrap_err();

    assert_eq!(err.domain::<LimitExceeded>().unwrap().message, "daily limit reached");
}

#[tokio::test]
async fn outbox_and_leases_share_the_mesh() {
    let transport = MockTransport::new();
    let locks = InMemoryLockStore::new();
    let mesh = MeshBuilder::new(config())
        .build(
            transport_factory(&transport),
            Arc::new(InMemoryAdminConnector::new()),
            Arc::new(locks.clone()),
        )
        .unwrap();

    let outcome = mesh
        .leases
        .with_lease_renewing_mutex(
            "withdraw.sweep",
            Duration::from_secs(5),
            Duration::from_secs(1),
            1,
            || async {
                let uow = InMemoryUnitOfWork::new();
                let outbox = mesh.outbox.begin(&uow);
                let envelope = RequestContext::new("sweep-1").envelope(json!({"count": 2}));
                outbox.emit("withdraw.swept", &envelope).unwrap();
                uow.commit().await.unwrap();
            },
        )
        .await
        .unwrap();

    assert!(!outcome.is_skipped());
    let emitted = transport.emits();
    assert_eq!(emitted.len(), 1);
    assert_eq!(emitted[0].topic, "staging.withdraw.swept");
    assert_eq!(emitted[0].message.key.as_deref(), Some("sweep-1"));
    assert_eq!(locks.releases(), 1);
}

#[test]
fn invalid_config_is_rejected() {
    let mut config = config();
    config.outbox.chunk_size = 0;

    let result = MeshBuilder::new(config).build(
        transport_factory(&MockTransport::new()),
        Arc::new(InMemoryAdminConnector::new()),
        Arc::new(InMemoryLockStore::new()),
    );

    assert!(matches!(result, Err(MeshError::Config(_))));
}
