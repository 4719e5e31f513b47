//! Message bus integration: publishing to sibling systems, dispatching
//! inbound messages, and dead-letter bookkeeping.

pub mod broker;
pub mod consumer;
pub mod listener;
pub mod memory;
pub mod router;

use uuid::Uuid;

pub use broker::{
    BrokerError, Delivery, MessageBroker, MessageProperties, MessageSource, OutboundMessage,
};
pub use consumer::{ConsumerContext, ConsumerGroup};
pub use listener::{
    handler_fn, FnHandler, MessageHandler, MessageListener, SourceStats, UNKNOWN_SOURCE,
};
pub use memory::InMemoryBroker;
pub use router::{DeliveryCallback, MessageRouter, RouterConfig, MAX_PRIORITY};

/// Errors raised while sending or handling bus messages.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error("failed to publish message {message_id} to {target}: {source}")]
    PublishFailure {
        target: String,
        message_id: Uuid,
        #[source]
        source: BrokerError,
    },

    #[error("failed to encode message {message_id} for {target}: {source}")]
    Encode {
        target: String,
        message_id: Uuid,
        #[source]
        source: serde_json::Error,
    },

    #[error("handler for {operation} failed on message {message_id}: {source}")]
    HandlerFailure {
        operation: String,
        message_id: Uuid,
        #[source]
        source: anyhow::Error,
    },
}

impl MessagingError {
    /// Id of the message the error concerns.
    #[must_use]
    pub fn message_id(&self) -> Uuid {
        match self {
            Self::PublishFailure { message_id, .. }
            | Self::Encode { message_id, .. }
            | Self::HandlerFailure { message_id, .. } => *message_id,
        }
    }
}
