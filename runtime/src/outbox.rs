//! Transactional outbox.
//!
//! An [`OutboxEmitter`] lives as long as one unit of work. Domain code
//! buffers events with [`OutboxEmitter::emit`]; nothing reaches the broker
//! until the unit of work commits and its post-commit hook calls
//! [`OutboxEmitter::flush`].
//!
//! # Delivery
//!
//! Delivery is best effort and at most once:
//!
//! - a crash or rollback before commit drops the buffer together with the
//!   data it describes, so no event ever refers to a row that was not
//!   persisted;
//! - a crash after commit but before or during flush loses events whose rows
//!   *were* persisted. Flush failures are logged and counted, never retried
//!   and never returned as errors.
//!
//! # Flushing
//!
//! Events are flushed in chunks of `chunk_size`. Emits inside a chunk run
//! concurrently and fail independently; chunk N starts only after every emit
//! of chunk N-1 settled, with a `chunk_delay` pause in between.

use crate::client::RpcClient;
use crate::metrics::OutboxMetrics;
use futures::future::join_all;
use meshbus_core::config::OutboxConfig;
use meshbus_core::envelope::Envelope;
use meshbus_core::error::RpcError;
use meshbus_core::unit_of_work::UnitOfWork;
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;

/// A buffered event.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEvent {
    /// Logical event pattern.
    pub name: String,
    /// Envelope to emit.
    pub data: Envelope<Value>,
}

/// Identity of a flushed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushedEvent {
    /// Logical event pattern.
    pub name: String,
    /// Explicit envelope key, if any.
    pub key: Option<String>,
    /// Correlation id of the envelope, if any.
    pub request_id: Option<String>,
}

impl FlushedEvent {
    fn of(event: &OutboxEvent) -> Self {
        Self {
            name: event.name.clone(),
            key: event.data.key.clone(),
            request_id: event.data.request_id().map(str::to_string),
        }
    }
}

/// An event the broker did not accept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedEmit {
    /// Which event failed.
    pub event: FlushedEvent,
    /// Failure description.
    pub error: String,
}

/// Outcome of a flush. Both lists are in buffer order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Events the broker accepted.
    pub delivered: Vec<FlushedEvent>,
    /// Events that failed.
    pub failed: Vec<FailedEmit>,
}

impl FlushReport {
    /// Whether every event was delivered.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Per-unit-of-work event buffer.
pub struct OutboxEmitter {
    client: RpcClient,
    config: OutboxConfig,
    buffer: Mutex<Vec<OutboxEvent>>,
}

impl OutboxEmitter {
    /// Empty outbox flushing through `client`.
    #[must_use]
    pub fn new(client: RpcClient, config: OutboxConfig) -> Self {
        Self {
            client,
            config,
            buffer: Mutex::new(Vec::new()),
        }
    }

    /// Buffer an event. Does not touch the broker.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Serialization`] if the value is not representable
    /// as JSON.
    pub fn emit<T: Serialize>(&self, name: &str, envelope: &Envelope<T>) -> Result<(), RpcError> {
        let data = envelope.to_json().map_err(|e| RpcError::Serialization {
            pattern: name.to_string(),
            reason: e.to_string(),
        })?;
        self.buffer().push(OutboxEvent {
            name: name.to_string(),
            data,
        });
        OutboxMetrics::record_buffered();
        tracing::trace!(event = name, "Buffered outbox event");
        Ok(())
    }

    /// Number of buffered events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer().len()
    }

    /// Whether nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer().is_empty()
    }

    /// Flush the buffered events to the broker. Never fails; see the module
    /// docs for the delivery guarantees.
    pub async fn flush(&self) -> FlushReport {
        let events = std::mem::take(&mut *self.buffer());
        let mut report = FlushReport::default();
        if events.is_empty() {
            return report;
        }

        let started = Instant::now();
        let chunk_size = self.config.chunk_size.max(1);
        let chunks = events.len().div_ceil(chunk_size);
        tracing::debug!(events = events.len(), chunks, "Flushing outbox");

        for (chunk, batch) in events.chunks(chunk_size).enumerate() {
            if chunk > 0 {
                tokio::time::sleep(self.config.chunk_delay).await;
            }

            let outcomes = join_all(batch.iter().map(|event| async move {
                (event, self.client.emit(&event.name, &event.data).await)
            }))
            .await;

            for (event, outcome) in outcomes {
                let flushed = FlushedEvent::of(event);
                match outcome {
                    Ok(()) => {
                        tracing::debug!(
                            chunk,
                            event = %flushed.name,
                            correlation_id = ?flushed.request_id,
                            "Outbox event delivered"
                        );
                        report.delivered.push(flushed);
                    }
                    Err(error) => {
                        tracing::error!(
                            chunk,
                            event = %flushed.name,
                            correlation_id = ?flushed.request_id,
                            error = %error,
                            "Outbox event lost"
                        );
                        report.failed.push(FailedEmit {
                            event: flushed,
                            error: error.to_string(),
                        });
                    }
                }
            }
        }

        OutboxMetrics::record_flush(
            report.delivered.len(),
            report.failed.len(),
            started.elapsed(),
        );
        tracing::info!(
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "Outbox flushed"
        );
        report
    }

    /// Flush this outbox once `unit_of_work` commits. Rollback, a failed
    /// commit, or dropping the unit of work discards the buffer instead.
    pub fn attach(self: &Arc<Self>, unit_of_work: &dyn UnitOfWork) {
        let outbox = Arc::clone(self);
        unit_of_work.on_commit(Box::new(move || {
            Box::pin(async move {
                outbox.flush().await;
            })
        }));
    }

    fn buffer(&self) -> MutexGuard<'_, Vec<OutboxEvent>> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for OutboxEmitter {
    fn drop(&mut self) {
        let pending = self.buffer().len();
        if pending > 0 {
            tracing::debug!(pending, "Discarding unflushed outbox events");
        }
    }
}

/// Creates outboxes sharing one client and configuration.
#[derive(Clone)]
pub struct OutboxFactory {
    client: RpcClient,
    config: OutboxConfig,
}

impl OutboxFactory {
    /// Factory over `client`.
    #[must_use]
    pub const fn new(client: RpcClient, config: OutboxConfig) -> Self {
        Self { client, config }
    }

    /// Detached outbox; the caller decides when to flush.
    #[must_use]
    pub fn create(&self) -> Arc<OutboxEmitter> {
        Arc::new(OutboxEmitter::new(self.client.clone(), self.config))
    }

    /// Outbox flushed after `unit_of_work` commits.
    #[must_use]
    pub fn begin(&self, unit_of_work: &dyn UnitOfWork) -> Arc<OutboxEmitter> {
        let outbox = self.create();
        outbox.attach(unit_of_work);
        outbox
    }
}
