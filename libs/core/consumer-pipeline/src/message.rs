//! Inbound message wrapper
//!
//! Wraps a broker delivery with its identifier, payload and metadata, and
//! names the metadata keys the pipeline reads and writes.

use std::collections::HashMap;
use tracing::debug;

/// Broker-assigned message identifier (e.g. a Redis stream entry ID "1234567890123-0")
pub type MessageId = String;

/// Per-message key/value properties. Unordered; copied, never shared, on republish.
pub type Metadata = HashMap<String, String>;

/// Metadata wire keys produced by the pipeline.
pub mod keys {
    pub const RETRY_COUNT: &str = "retry-count";
    pub const ORIGINAL_MESSAGE_ID: &str = "original-message-id";
    pub const ORIGINAL_TOPIC: &str = "original-topic";
    pub const ERROR_MESSAGE: &str = "error-message";
    pub const FAILED_AT: &str = "failed-at";
    pub const DEFAULT_IDEMPOTENCY_KEY: &str = "idempotency-key";
}

/// A message delivered by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    id: MessageId,
    topic: String,
    payload: Vec<u8>,
    metadata: Metadata,
}

impl InboundMessage {
    pub fn new(
        id: impl Into<MessageId>,
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        metadata: Metadata,
    ) -> Self {
        Self {
            id: id.into(),
            topic: topic.into(),
            payload: payload.into(),
            metadata,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Topic the message was delivered from
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Look up a single metadata property
    pub fn property(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Number of retries already attempted for this logical message.
    ///
    /// Absent or unparsable values count as 0.
    pub fn retry_count(&self) -> u32 {
        match self.property(keys::RETRY_COUNT) {
            None => 0,
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                debug!(
                    message_id = %self.id,
                    retry_count = %raw,
                    "Malformed retry-count metadata, treating as 0"
                );
                0
            }),
        }
    }

    /// Metadata for the republished copy of this message.
    pub fn retry_metadata(&self, next_retry_count: u32) -> Metadata {
        let mut metadata = self.metadata.clone();
        metadata.insert(keys::RETRY_COUNT.to_string(), next_retry_count.to_string());
        metadata.insert(keys::ORIGINAL_MESSAGE_ID.to_string(), self.id.clone());
        metadata
    }
}
