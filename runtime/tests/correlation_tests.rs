//! Every log line emitted during an RPC call carries the request's
//! correlation id.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use meshbus_core::{Envelope, RpcError};
use meshbus_runtime::RpcClient;
use meshbus_testing::{LogCapture, MockTransport};
use serde_json::{Value, json};
use std::sync::Arc;

#[tokio::test]
async fn send_logs_carry_correlation_id() {
    let transport = MockTransport::new().respond_json("limits.get", &json!({"daily": 500}));
    let client = RpcClient::new(Arc::new(transport.clone()));
    let capture = LogCapture::new();

    let reply: Value = {
        let _guard = capture.set_default();
        client
            .send("limits.get", &Envelope::new(json!({"user": 9})).with_request_id("abc"))
            .await
            .unwrap()
    };

    assert_eq!(reply, json!({"daily": 500}));
    assert_eq!(transport.requests()[0].message.key.as_deref(), Some("abc"));

    let lines = capture.lines();
    assert!(lines.len() >= 3, "expected client and transport lines, got {lines:?}");
    for line in &lines {
        assert!(line.contains("correlation_id=abc"), "line without correlation id: {line}");
    }
}

#[tokio::test]
async fn failure_logs_carry_correlation_id() {
    let transport = MockTransport::new();
    let client = RpcClient::new(Arc::new(transport));
    let capture = LogCapture::new();

    let err = {
        let _guard = capture.set_default();
        client
            .send::<_, Value>("limits.get", &Envelope::new(json!({})).with_request_id("abc"))
            .await
            .unwrap_err()
    };

    assert!(matches!(err, RpcError::Broker { .. }));
    let lines = capture.lines();
    assert!(lines.iter().any(|line| line.contains("Request failed")));
    assert!(lines.iter().all(|line| line.contains("correlation_id=abc")));
}

#[tokio::test]
async fn emit_logs_carry_correlation_id() {
    let transport = MockTransport::new();
    let client = RpcClient::new(Arc::new(transport));
    let capture = LogCapture::new();

    {
        let _guard = capture.set_default();
        client
            .emit("limits.changed", &Envelope::new(json!({})).with_request_id("abc"))
            .await
            .unwrap();
    }

    let lines = capture.lines();
    assert!(!lines.is_empty());
    assert!(lines.iter().all(|line| line.contains("correlation_id=abc")));
}
