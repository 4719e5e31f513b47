//! Inbound side: dispatches envelopes to handlers registered per operation.
//!
//! Dispatch is an explicit table from operation name to [`MessageHandler`].
//! Operations without a handler fall through to a logging no-op.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::FutureExt;
use mcp_hub_core::{MessageEnvelope, SystemId};
use serde::Serialize;
use tracing::{error, info, warn};

use super::MessagingError;
use crate::metrics::CallMetricsRegistry;

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Processes one inbound envelope for a single operation.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// # Errors
    ///
    /// Any error marks the message as failed; the consumer moves it to the
    /// dead-letter queue.
    async fn handle(&self, envelope: &MessageEnvelope) -> anyhow::Result<()>;
}

/// Adapter returned by [`handler_fn`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(MessageEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, envelope: &MessageEnvelope) -> anyhow::Result<()> {
        (self.0)(envelope.clone()).await
    }
}

/// Wraps an async closure as a [`MessageHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(MessageEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    FnHandler(f)
}

// ---------------------------------------------------------------------------
// Per-source counters
// ---------------------------------------------------------------------------

/// Dead-letter bucket for envelopes whose `sourceSystem` is not a known system.
pub const UNKNOWN_SOURCE: &str = "unknown";

#[derive(Default)]
struct SourceCounters {
    received: AtomicU64,
    process_errors: AtomicU64,
    dead_letters: AtomicU64,
}

/// Counters for one source system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceStats {
    pub source: String,
    pub received: u64,
    pub process_errors: u64,
    pub dead_letters: u64,
}

// ---------------------------------------------------------------------------
// MessageListener
// ---------------------------------------------------------------------------

/// Routes inbound envelopes to registered handlers and keeps per-source stats.
pub struct MessageListener {
    handlers: DashMap<String, Arc<dyn MessageHandler>>,
    counters: DashMap<String, Arc<SourceCounters>>,
    metrics: CallMetricsRegistry,
}

impl MessageListener {
    #[must_use]
    pub fn new(metrics: CallMetricsRegistry) -> Self {
        Self {
            handlers: DashMap::new(),
            counters: DashMap::new(),
            metrics,
        }
    }

    /// Registers `handler` for `operation`. Returns `true` if it replaced an
    /// existing handler.
    pub fn register_handler(
        &self,
        operation: impl Into<String>,
        handler: impl MessageHandler + 'static,
    ) -> bool {
        let operation = operation.into();
        info!(operation = %operation, "registered message handler");
        self.handlers
            .insert(operation, Arc::new(handler))
            .is_some()
    }

    /// Removes the handler for `operation`. Returns `true` if one was present.
    pub fn unregister_handler(&self, operation: &str) -> bool {
        self.handlers.remove(operation).is_some()
    }

    #[must_use]
    pub fn has_handler(&self, operation: &str) -> bool {
        self.handlers.contains_key(operation)
    }

    /// Handles one envelope received from `source`.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::HandlerFailure`] when the registered handler
    /// fails or panics. The failure is counted and logged before it is returned.
    pub async fn on_message(
        &self,
        source: &str,
        envelope: &MessageEnvelope,
    ) -> Result<(), MessagingError> {
        let counters = self.counters_for(source);
        counters.received.fetch_add(1, Ordering::Relaxed);
        ::metrics::counter!("mcp_messages_received_total", "source" => source.to_lowercase())
            .increment(1);

        let timer = self.metrics.start_timer(&format!("mq_receive_{source}"));

        // Clone out of the map so no shard lock is held across the await.
        let handler = self
            .handlers
            .get(&envelope.operation)
            .map(|h| Arc::clone(h.value()));

        let Some(handler) = handler else {
            info!(
                source,
                operation = %envelope.operation,
                message_id = %envelope.message_id,
                "no handler registered, message acknowledged"
            );
            timer.complete(true);
            return Ok(());
        };

        // A panicking handler fails this message only; the consumer keeps going.
        let outcome = AssertUnwindSafe(handler.handle(envelope))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(anyhow::anyhow!(
                    "handler panicked: {}",
                    panic_message(panic.as_ref())
                ))
            });

        match outcome {
            Ok(()) => {
                timer.complete(true);
                Ok(())
            }
            Err(source_err) => {
                counters.process_errors.fetch_add(1, Ordering::Relaxed);
                timer.complete(false);
                self.metrics.record_error(
                    &format!("mq_receive_{source}"),
                    format!("{}: {source_err:#}", envelope.operation),
                );
                error!(
                    source,
                    operation = %envelope.operation,
                    message_id = %envelope.message_id,
                    error = %source_err,
                    "message handler failed"
                );
                Err(MessagingError::HandlerFailure {
                    operation: envelope.operation.clone(),
                    message_id: envelope.message_id,
                    source: source_err,
                })
            }
        }
    }

    /// Records a dead-lettered envelope. Nothing is resubmitted.
    ///
    /// `sourceSystem` comes from the message body, so only known systems get
    /// their own bucket; anything else is counted under [`UNKNOWN_SOURCE`].
    pub fn on_dead_letter(&self, envelope: &MessageEnvelope) {
        let source = envelope
            .source_system
            .parse::<SystemId>()
            .map_or(UNKNOWN_SOURCE, SystemId::as_str);
        let counters = self.counters_for(source);
        counters.dead_letters.fetch_add(1, Ordering::Relaxed);
        ::metrics::counter!("mcp_dead_letters_total", "source" => source).increment(1);
        warn!(
            source = %envelope.source_system,
            operation = %envelope.operation,
            message_id = %envelope.message_id,
            retry_count = envelope.retry_count,
            "message dead-lettered"
        );
    }

    /// Per-source counters, sorted by source.
    #[must_use]
    pub fn stats(&self) -> Vec<SourceStats> {
        let mut stats: Vec<SourceStats> = self
            .counters
            .iter()
            .map(|entry| SourceStats {
                source: entry.key().clone(),
                received: entry.received.load(Ordering::Relaxed),
                process_errors: entry.process_errors.load(Ordering::Relaxed),
                dead_letters: entry.dead_letters.load(Ordering::Relaxed),
            })
            .collect();
        stats.sort_by(|a, b| a.source.cmp(&b.source));
        stats
    }

    /// Counters keyed case-insensitively, so `"MES"` from an envelope and
    /// `"mes"` from a queue name land in the same bucket.
    fn counters_for(&self, source: &str) -> Arc<SourceCounters> {
        let key = source.to_lowercase();
        if let Some(existing) = self.counters.get(&key) {
            return Arc::clone(existing.value());
        }
        Arc::clone(self.counters.entry(key).or_default().value())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
