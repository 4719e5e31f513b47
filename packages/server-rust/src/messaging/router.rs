//! Outbound side: wraps payloads in envelopes and publishes them to sibling
//! systems, timing every send under `mq_send_<target>`.

use std::sync::Arc;
use std::time::Duration;

use mcp_hub_core::{MessageEnvelope, RoutingScheme, CONTENT_TYPE_JSON};
use tracing::{debug, error};
use uuid::Uuid;

use super::broker::{MessageBroker, MessageProperties, OutboundMessage};
use super::MessagingError;
use crate::metrics::CallMetricsRegistry;

/// Highest broker priority a message can carry.
pub const MAX_PRIORITY: u8 = 10;

/// Addressing used by the router.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Exchange every message is published to.
    pub exchange: String,
    /// Name stamped into `sourceSystem` of each envelope.
    pub source_system: String,
    pub routing: RoutingScheme,
}

/// One-shot delivery outcome hooks for [`MessageRouter::send_with_callback`].
pub struct DeliveryCallback {
    on_success: Box<dyn FnOnce(Uuid) + Send>,
    on_failure: Box<dyn FnOnce(Uuid, String) + Send>,
}

impl DeliveryCallback {
    pub fn new(
        on_success: impl FnOnce(Uuid) + Send + 'static,
        on_failure: impl FnOnce(Uuid, String) + Send + 'static,
    ) -> Self {
        Self {
            on_success: Box::new(on_success),
            on_failure: Box::new(on_failure),
        }
    }
}

impl std::fmt::Debug for DeliveryCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryCallback").finish_non_exhaustive()
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct PublishOptions {
    priority: Option<u8>,
    delay: Option<Duration>,
}

/// Publishes envelopes to sibling systems through a [`MessageBroker`].
pub struct MessageRouter {
    broker: Arc<dyn MessageBroker>,
    metrics: CallMetricsRegistry,
    config: RouterConfig,
}

impl MessageRouter {
    #[must_use]
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        metrics: CallMetricsRegistry,
        config: RouterConfig,
    ) -> Self {
        Self {
            broker,
            metrics,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Sends `payload` to `target` under `operation` and returns the message id.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::PublishFailure`] if the broker rejects the
    /// message, or [`MessagingError::Encode`] if the payload cannot be encoded.
    pub async fn send(
        &self,
        target: &str,
        operation: &str,
        payload: serde_json::Value,
    ) -> Result<Uuid, MessagingError> {
        self.dispatch(target, operation, payload, PublishOptions::default())
            .await
    }

    /// Like [`send`](Self::send) with a broker priority clamped to `0..=10`.
    ///
    /// # Errors
    ///
    /// Same as [`send`](Self::send).
    pub async fn send_priority(
        &self,
        target: &str,
        operation: &str,
        payload: serde_json::Value,
        priority: i64,
    ) -> Result<Uuid, MessagingError> {
        let options = PublishOptions {
            priority: Some(clamp_priority(priority)),
            ..PublishOptions::default()
        };
        self.dispatch(target, operation, payload, options).await
    }

    /// Like [`send`](Self::send), but consumers only see the message after
    /// `delay_ms` milliseconds.
    ///
    /// # Errors
    ///
    /// Same as [`send`](Self::send).
    pub async fn send_delayed(
        &self,
        target: &str,
        operation: &str,
        payload: serde_json::Value,
        delay_ms: u64,
    ) -> Result<Uuid, MessagingError> {
        let options = PublishOptions {
            delay: Some(Duration::from_millis(delay_ms)),
            ..PublishOptions::default()
        };
        self.dispatch(target, operation, payload, options).await
    }

    /// Sends and reports the outcome through `callback` instead of an error.
    ///
    /// Exactly one of the callback's hooks runs before this returns. The
    /// message id is returned either way.
    pub async fn send_with_callback(
        &self,
        target: &str,
        operation: &str,
        payload: serde_json::Value,
        callback: DeliveryCallback,
    ) -> Uuid {
        match self
            .dispatch(target, operation, payload, PublishOptions::default())
            .await
        {
            Ok(id) => {
                (callback.on_success)(id);
                id
            }
            Err(err) => {
                let id = err.message_id();
                (callback.on_failure)(id, err.to_string());
                id
            }
        }
    }

    async fn dispatch(
        &self,
        target: &str,
        operation: &str,
        payload: serde_json::Value,
        options: PublishOptions,
    ) -> Result<Uuid, MessagingError> {
        let timer_name = format!("mq_send_{target}");
        let timer = self.metrics.start_timer(&timer_name);

        let envelope = MessageEnvelope::new(&self.config.source_system, operation, payload);
        let message_id = envelope.message_id;

        let body = match envelope.to_json_bytes() {
            Ok(body) => body,
            Err(source) => {
                timer.complete(false);
                self.metrics.record_error(&timer_name, source.to_string());
                return Err(MessagingError::Encode {
                    target: target.to_string(),
                    message_id,
                    source,
                });
            }
        };

        let message = OutboundMessage {
            exchange: self.config.exchange.clone(),
            routing_key: self.config.routing.outbound_key(target),
            properties: MessageProperties {
                message_id,
                content_type: CONTENT_TYPE_JSON.to_string(),
                timestamp: envelope.timestamp,
                priority: options.priority,
                delay: options.delay,
            },
            body,
        };

        match self.broker.publish(message).await {
            Ok(()) => {
                timer.complete(true);
                debug!(%message_id, target, operation, "message sent");
                Ok(message_id)
            }
            Err(source) => {
                timer.complete(false);
                self.metrics.record_error(&timer_name, source.to_string());
                error!(%message_id, target, operation, error = %source, "failed to send message");
                Err(MessagingError::PublishFailure {
                    target: target.to_string(),
                    message_id,
                    source,
                })
            }
        }
    }
}

fn clamp_priority(priority: i64) -> u8 {
    u8::try_from(priority.clamp(0, i64::from(MAX_PRIORITY))).unwrap_or(MAX_PRIORITY)
}
