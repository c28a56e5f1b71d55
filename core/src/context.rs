//! Per-request correlation context.

use crate::envelope::{Envelope, REQUEST_ID_HEADER};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Correlation state for one inbound request.
///
/// Every envelope built through a context carries the same `requestId`, so a
/// call chain started by one request stays correlated across services.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestContext {
    request_id: String,
}

impl RequestContext {
    /// Context for an existing correlation id.
    #[must_use]
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
        }
    }

    /// Fresh context with a random id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }

    /// Continue the correlation of an inbound envelope, or start a new one.
    #[must_use]
    pub fn from_headers(headers: &BTreeMap<String, String>) -> Self {
        headers
            .get(REQUEST_ID_HEADER)
            .map_or_else(Self::generate, Self::new)
    }

    /// The correlation id.
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Envelope for an outbound call made on behalf of this request.
    pub fn envelope<T>(&self, value: T) -> Envelope<T> {
        Envelope::new(value).with_request_id(self.request_id.clone())
    }
}
