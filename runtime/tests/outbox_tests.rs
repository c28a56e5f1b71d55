//! Integration tests for the transactional outbox
//!
//! Flush ordering, partial failure and unit-of-work wiring, against the
//! in-memory transport with paused time.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use meshbus_core::config::OutboxConfig;
use meshbus_core::unit_of_work::UnitOfWork;
use meshbus_core::{Envelope, RequestContext};
use meshbus_runtime::{OutboxEmitter, OutboxFactory, RpcClient};
use meshbus_testing::{InMemoryUnitOfWork, MockTransport, UnitState};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

// ============================================================================
// Test Fixtures
// ============================================================================

fn factory(transport: &MockTransport) -> OutboxFactory {
    OutboxFactory::new(
        RpcClient::new(Arc::new(transport.clone())),
        OutboxConfig {
            chunk_size: 100,
            chunk_delay: Duration::from_millis(100),
        },
    )
}

fn fill(outbox: &OutboxEmitter, count: usize) {
    for i in 0..count {
        outbox
            .emit("ledger.posted", &Envelope::new(json!({ "seq": i })).with_key(format!("e{i}")))
            .unwrap();
    }
}

// ============================================================================
// Flushing
// ============================================================================

#[tokio::test(start_paused = true)]
async fn chunks_are_dispatched_only_after_previous_chunk_settled() {
    let transport = MockTransport::new().with_latency(Duration::from_millis(50));
    let outbox = factory(&transport).create();
    fill(&outbox, 250);

    let report = outbox.flush().await;
    assert_eq!(report.delivered.len(), 250);
    assert!(report.is_complete());

    let sent = transport.emits();
    assert_eq!(sent.len(), 250);

    let chunks: Vec<_> = sent.chunks(100).collect();
    assert_eq!(chunks.iter().map(|c| c.len()).collect::<Vec<_>>(), vec![100, 100, 50]);

    for pair in chunks.windows(2) {
        let previous_settled = pair[0]
            .iter()
            .map(|m| m.settled_at.expect("every emit settles"))
            .max()
            .unwrap();
        let next_dispatched = pair[1].iter().map(|m| m.dispatched_at).min().unwrap();
        assert!(
            next_dispatched >= previous_settled + Duration::from_millis(100),
            "next chunk started before the previous one settled and the pause elapsed"
        );
    }

    // Emits inside a chunk run concurrently, never more than one chunk at once.
    assert_eq!(transport.max_in_flight(), 100);
}

#[tokio::test]
async fn one_failed_emit_does_not_affect_its_siblings() {
    let transport = MockTransport::new()
        .fail_emits_where(|_, message| message.key.as_deref() == Some("e2"));
    let outbox = factory(&transport).create();
    fill(&outbox, 5);

    let report = outbox.flush().await;

    let keys = |events: Vec<Option<String>>| -> Vec<String> {
        events.into_iter().map(Option::unwrap).collect()
    };

    // The report names exactly the rejected event...
    assert_eq!(report.failed.len(), 1);
    let failed = &report.failed[0];
    assert_eq!(failed.event.name, "ledger.posted");
    assert_eq!(failed.event.key.as_deref(), Some("e2"));
    assert!(failed.error.contains("rejected"));

    // ...and every sibling was delivered, in buffer order.
    assert_eq!(
        keys(report.delivered.iter().map(|e| e.key.clone()).collect()),
        vec!["e0", "e1", "e3", "e4"]
    );

    // The broker saw all five attempts but only produced the siblings.
    assert_eq!(transport.emits().len(), 5);
    let mut produced = keys(transport.produced().into_iter().map(|m| m.message.key).collect());
    produced.sort();
    assert_eq!(produced, vec!["e0", "e1", "e3", "e4"]);
    assert!(outbox.is_empty());
}

#[tokio::test]
async fn empty_flush_touches_nothing() {
    let transport = MockTransport::new();
    let outbox = factory(&transport).create();

    let report = outbox.flush().await;

    assert!(report.delivered.is_empty());
    assert!(transport.sent().is_empty());
}

#[tokio::test]
async fn buffered_events_keep_the_request_id() {
    let transport = MockTransport::new();
    let outbox = factory(&transport).create();
    let ctx = RequestContext::new("req-42");

    outbox.emit("orders.created", &ctx.envelope(json!({"id": 1}))).unwrap();
    outbox.emit("orders.audited", &ctx.envelope(json!({"id": 1}))).unwrap();
    outbox.flush().await;

    for message in transport.emits() {
        assert_eq!(message.message.key.as_deref(), Some("req-42"));
        assert_eq!(message.message.request_id(), Some("req-42"));
    }
}

// ============================================================================
// Unit of work wiring
// ============================================================================

#[tokio::test]
async fn commit_flushes_the_buffer() {
    let transport = MockTransport::new();
    let uow = InMemoryUnitOfWork::new();
    let outbox = factory(&transport).begin(&uow);

    fill(&outbox, 2);
    assert!(transport.emits().is_empty(), "emit must not touch the broker");

    assert_ok!(uow.commit().await);

    assert_eq!(transport.emits().len(), 2);
    assert!(outbox.is_empty());
}

#[tokio::test]
async fn rollback_discards_the_buffer() {
    let transport = MockTransport::new();
    let uow = InMemoryUnitOfWork::new();
    let outbox = factory(&transport).begin(&uow);
    fill(&outbox, 3);

    assert_ok!(uow.rollback().await);

    assert!(transport.emits().is_empty());
    assert_eq!(uow.state(), UnitState::RolledBack);
}

#[tokio::test]
async fn failed_commit_never_flushes() {
    let transport = MockTransport::new();
    let uow = InMemoryUnitOfWork::new();
    let outbox = factory(&transport).begin(&uow);
    fill(&outbox, 3);

    uow.fail_next_commit();
    assert_err!(uow.commit().await);

    assert!(transport.emits().is_empty());
}
