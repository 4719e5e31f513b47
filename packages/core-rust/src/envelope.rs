//! Message envelope carried over the bus between hub nodes.
//!
//! All fields serialize in `camelCase` so the JSON body matches what sibling
//! systems already produce and consume.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Content type stamped on every published envelope.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Metadata-wrapped outbound message unit.
///
/// `retry_count` starts at 0 and is only ever advanced by
/// [`for_redelivery`](Self::for_redelivery); the original send never touches it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    pub message_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub source_system: String,
    pub operation: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub retry_count: u32,
}

impl MessageEnvelope {
    /// Wraps `payload` with a fresh message id and the current UTC time.
    #[must_use]
    pub fn new(
        source_system: impl Into<String>,
        operation: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source_system: source_system.into(),
            operation: operation.into(),
            payload,
            retry_count: 0,
        }
    }

    /// Copy of this envelope for a resend path, with `retry_count` advanced.
    ///
    /// Message id, timestamp and payload are preserved so the receiver can
    /// correlate the resend with the original.
    #[must_use]
    pub fn for_redelivery(&self) -> Self {
        Self {
            retry_count: self.retry_count.saturating_add(1),
            ..self.clone()
        }
    }

    /// ISO-8601 send timestamp with millisecond precision.
    #[must_use]
    pub fn timestamp_iso(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    /// Encodes the envelope as a JSON body.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload contains a value JSON cannot represent.
    pub fn to_json_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Decodes an envelope from a JSON body.
    ///
    /// # Errors
    ///
    /// Returns an error if the body is not a valid envelope.
    pub fn from_json_slice(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}
