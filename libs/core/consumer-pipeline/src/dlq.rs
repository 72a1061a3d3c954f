//! Dead Letter Queue (DLQ) routing
//!
//! Publishes messages that exhausted their retries to the dead-letter topic,
//! annotated with where they came from and why they failed. Routing is
//! attempted once; the caller decides what a failure means.

use crate::broker::{Broker, Producer};
use crate::config::DeadLetterPolicy;
use crate::error::{HandlerError, PipelineError};
use crate::message::{keys, InboundMessage, MessageId, Metadata};
use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Longest `error-message` value written to the DLQ, in characters
pub const MAX_ERROR_MESSAGE_LEN: usize = 1024;

/// Dead-letter router bound to one source topic
pub struct DeadLetterRouter {
    broker: Arc<dyn Broker>,
    /// `None` when dead-lettering is disabled
    destination: Option<String>,
    producer: OnceCell<Arc<dyn Producer>>,
}

impl DeadLetterRouter {
    pub fn new(broker: Arc<dyn Broker>, policy: &DeadLetterPolicy, source_topic: &str) -> Self {
        let destination = policy.enabled.then(|| policy.topic_for(source_topic));
        Self {
            broker,
            destination,
            producer: OnceCell::new(),
        }
    }

    /// Dead-letter topic, if routing is enabled
    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    pub fn is_enabled(&self) -> bool {
        self.destination.is_some()
    }

    /// Publish `message` to the dead-letter topic.
    ///
    /// Returns the DLQ message ID, `PipelineError::DeadLetterDisabled` when
    /// routing is off, or the broker error if publishing failed.
    pub async fn route(
        &self,
        message: &InboundMessage,
        last_error: &HandlerError,
        original_topic: &str,
    ) -> Result<MessageId, PipelineError> {
        let Some(destination) = self.destination.as_deref() else {
            return Err(PipelineError::DeadLetterDisabled);
        };

        let producer = self
            .producer
            .get_or_try_init(|| async {
                debug!(topic = %destination, "Creating dead-letter producer");
                self.broker.create_producer(destination).await
            })
            .await?;

        let metadata = dead_letter_metadata(message, last_error, original_topic, Utc::now());
        let dlq_id = producer.send(message.payload().to_vec(), metadata).await?;

        info!(
            message_id = %message.id(),
            dlq_id = %dlq_id,
            dlq_topic = %destination,
            retry_count = message.retry_count(),
            "Moved message to DLQ"
        );

        Ok(dlq_id)
    }
}

/// Original metadata plus the failure annotations
pub fn dead_letter_metadata(
    message: &InboundMessage,
    last_error: &HandlerError,
    original_topic: &str,
    failed_at: DateTime<Utc>,
) -> Metadata {
    let mut metadata = message.metadata().clone();
    metadata.insert(keys::ORIGINAL_TOPIC.to_string(), original_topic.to_string());
    metadata.insert(keys::ORIGINAL_MESSAGE_ID.to_string(), message.id().to_string());
    metadata.insert(
        keys::ERROR_MESSAGE.to_string(),
        sanitize_error_message(&last_error.render()),
    );
    metadata.insert(
        keys::FAILED_AT.to_string(),
        failed_at.to_rfc3339_opts(SecondsFormat::Millis, true),
    );
    metadata.insert(keys::RETRY_COUNT.to_string(), message.retry_count().to_string());
    metadata
}

/// Single-line, length-bounded rendering of an error message
pub fn sanitize_error_message(raw: &str) -> String {
    let collapsed = raw
        .split(|c: char| c.is_control())
        .filter(|part| !part.trim().is_empty())
        .map(str::trim)
        .collect::<Vec<_>>()
        .join(" ");

    if collapsed.is_empty() {
        return "Unknown error".to_string();
    }

    match collapsed.char_indices().nth(MAX_ERROR_MESSAGE_LEN) {
        Some((cut, _)) => format!("{}...", &collapsed[..cut]),
        None => collapsed,
    }
}
