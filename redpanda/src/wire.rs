//! Mapping between meshbus wire messages and Kafka records.
//!
//! Envelope headers travel as Kafka headers. Three more headers carry the
//! reply protocol: [`CORRELATION_ID_HEADER`], [`REPLY_TOPIC_HEADER`] and
//! [`ERROR_HEADER`].

use meshbus_core::error::{BrokerError, RemoteError};
use rdkafka::message::{Header, Headers, Message, OwnedHeaders};
use serde_json::Value;
use std::collections::BTreeMap;

/// Correlates a reply with its pending request.
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// Topic the responder must reply on.
pub const REPLY_TOPIC_HEADER: &str = "x-reply-topic";

/// Present on replies whose payload is a JSON [`RemoteError`].
pub const ERROR_HEADER: &str = "x-error";

/// Kafka headers for an envelope's header map.
#[must_use]
pub fn owned_headers(headers: &BTreeMap<String, String>) -> OwnedHeaders {
    headers
        .iter()
        .fold(OwnedHeaders::new_with_capacity(headers.len()), |acc, (key, value)| {
            acc.insert(Header {
                key: key.as_str(),
                value: Some(value.as_str()),
            })
        })
}

/// Header map of a consumed record. Headers without a value, or whose value
/// is not UTF-8, are skipped.
#[must_use]
pub fn read_headers<M: Message>(message: &M) -> BTreeMap<String, String> {
    let Some(headers) = message.headers() else {
        return BTreeMap::new();
    };
    headers
        .iter()
        .filter_map(|header| {
            let value = std::str::from_utf8(header.value?).ok()?;
            Some((header.key.to_string(), value.to_string()))
        })
        .collect()
}

/// Encode a handler outcome as a reply payload. Returns the payload and
/// whether it carries an error.
///
/// # Errors
///
/// Returns [`BrokerError::Serialization`] if the value cannot be encoded.
pub fn encode_reply(outcome: &Result<Value, RemoteError>) -> Result<(Vec<u8>, bool), BrokerError> {
    let (payload, is_error) = match outcome {
        Ok(value) => (serde_json::to_vec(value), false),
        Err(remote) => (serde_json::to_vec(remote), true),
    };
    payload
        .map(|bytes| (bytes, is_error))
        .map_err(|e| BrokerError::Serialization(e.to_string()))
}

/// Decode a reply into the payload bytes the RPC client expects.
///
/// # Errors
///
/// Returns [`BrokerError::Remote`] for error replies. A malformed error
/// payload still yields a remote error, with the raw text as message.
pub fn decode_reply(
    headers: &BTreeMap<String, String>,
    payload: &[u8],
) -> Result<Vec<u8>, BrokerError> {
    if !headers.contains_key(ERROR_HEADER) {
        return Ok(payload.to_vec());
    }
    let remote = serde_json::from_slice::<RemoteError>(payload)
        .unwrap_or_else(|_| RemoteError::new(String::from_utf8_lossy(payload)));
    Err(BrokerError::Remote(remote))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use rdkafka::message::{OwnedMessage, Timestamp};
    use serde_json::json;

    fn record(headers: OwnedHeaders, payload: Vec<u8>) -> OwnedMessage {
        OwnedMessage::new(
            Some(payload),
            None,
            "orders.create.reply".to_string(),
            Timestamp::NotAvailable,
            0,
            0,
            Some(headers),
        )
    }

    #[test]
    fn envelope_headers_survive_kafka_headers() {
        let mut headers = BTreeMap::new();
        headers.insert("requestId".to_string(), "abc".to_string());
        headers.insert(CORRELATION_ID_HEADER.to_string(), "c-1".to_string());

        let message = record(owned_headers(&headers), Vec::new());

        assert_eq!(read_headers(&message), headers);
    }

    #[test]
    fn non_utf8_header_values_are_skipped() {
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: "binary",
                value: Some(&[0xff_u8, 0xfe][..]),
            })
            .insert(Header {
                key: "tenant",
                value: Some("t1"),
            });

        let read = read_headers(&record(headers, Vec::new()));

        assert_eq!(read.len(), 1);
        assert_eq!(read["tenant"], "t1");
    }

    #[test]
    fn successful_reply_passes_payload_through() {
        let (payload, is_error) = encode_reply(&Ok(json!({"id": 7}))).unwrap();
        assert!(!is_error);

        let decoded = decode_reply(&BTreeMap::new(), &payload).unwrap();
        assert_eq!(serde_json::from_slice::<Value>(&decoded).unwrap(), json!({"id": 7}));
    }

    #[test]
    fn error_reply_keeps_code_and_data() {
        let remote = RemoteError::new("insufficient funds")
            .with_code("INSUFFICIENT_FUNDS")
            .with_data(json!({"balance": 3}));
        let (payload, is_error) = encode_reply(&Err(remote.clone())).unwrap();
        assert!(is_error);

        let mut headers = BTreeMap::new();
        headers.insert(ERROR_HEADER.to_string(), "1".to_string());

        match decode_reply(&headers, &payload) {
            Err(BrokerError::Remote(decoded)) => assert_eq!(decoded, remote),
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[test]
    fn malformed_error_reply_keeps_raw_text() {
        let mut headers = BTreeMap::new();
        headers.insert(ERROR_HEADER.to_string(), "1".to_string());

        match decode_reply(&headers, b"handler crashed") {
            Err(BrokerError::Remote(remote)) => {
                assert_eq!(remote.message, "handler crashed");
                assert_eq!(remote.code, None);
            }
            other => panic!("expected remote error, got {other:?}"),
        }
    }
}
