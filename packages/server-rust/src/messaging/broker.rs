//! Message-broker boundary.
//!
//! The hub only needs two capabilities from a broker: publish to the exchange
//! under a routing key, and pull the next delivery from a named queue. Both
//! are traits so the router and consumers can run against any transport.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// AMQP-style properties attached to every published message.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageProperties {
    pub message_id: Uuid,
    pub content_type: String,
    pub timestamp: DateTime<Utc>,
    /// Broker-side queue priority, `0..=10`. `None` means 0.
    pub priority: Option<u8>,
    /// Visibility delay before consumers can see the message.
    pub delay: Option<Duration>,
}

/// A message handed to the broker for publishing.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

/// A message pulled from a queue.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: String,
    pub routing_key: String,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

/// Transport-level failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("broker unavailable: {reason}")]
    Unavailable { reason: String },
    #[error("unknown exchange: {exchange}")]
    UnknownExchange { exchange: String },
    #[error("no queue bound for routing key {routing_key}")]
    Unroutable { routing_key: String },
    #[error("unknown queue: {queue}")]
    UnknownQueue { queue: String },
}

/// Publishing side of the broker.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Publishes one message. `Ok` means the broker accepted it.
    async fn publish(&self, message: OutboundMessage) -> Result<(), BrokerError>;
}

/// Consuming side of the broker.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Waits for the next visible delivery on `queue`.
    ///
    /// Implementations must be cancel-safe: dropping the future before it
    /// resolves must not lose a message.
    async fn next_delivery(&self, queue: &str) -> Result<Delivery, BrokerError>;
}
