//! Pipeline error types
//!
//! Two families live here:
//! - **`HandlerError`**: what an application handler returns. It always carries a
//!   human-readable message so the dead-letter router can render `error-message`
//!   deterministically, plus an optional cause and a retryable flag.
//! - **`PipelineError` / `BrokerError`**: failures of the pipeline's own
//!   collaborators (broker, codec, dead-letter routing).
//!
//! None of these cross the pipeline boundary into the broker transport.

use std::error::Error as StdError;
use std::fmt;
use thiserror::Error;

type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Error returned by an application handler.
#[derive(Debug)]
pub struct HandlerError {
    message: String,
    cause: Option<BoxError>,
    retryable: bool,
}

impl HandlerError {
    /// A failure that may succeed on a later attempt.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
            retryable: true,
        }
    }

    /// A failure that retrying cannot fix; skips straight to dead-letter routing.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            ..Self::new(message)
        }
    }

    /// Attach the underlying cause.
    pub fn with_cause(mut self, cause: impl Into<BoxError>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// Wrap any error, using its display output as the message.
    pub fn from_error(err: impl Into<BoxError>) -> Self {
        let cause = err.into();
        Self {
            message: cause.to_string(),
            cause: Some(cause),
            retryable: true,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// Message followed by the cause chain, joined with `": "`.
    pub fn render(&self) -> String {
        let mut rendered = self.message.clone();
        let mut source: Option<&(dyn StdError + 'static)> = self
            .cause
            .as_deref()
            .map(|c| c as &(dyn StdError + 'static));
        while let Some(err) = source {
            let text = err.to_string();
            if !rendered.ends_with(&text) {
                rendered.push_str(": ");
                rendered.push_str(&text);
            }
            source = err.source();
        }
        rendered
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl StdError for HandlerError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn StdError + 'static))
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        HandlerError::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        HandlerError::new(message)
    }
}

/// Broker collaborator errors
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Redis connection or command error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Destination could not be reached or refused the message
    #[error("Publish to '{topic}' failed: {message}")]
    Publish { topic: String, message: String },

    /// Broker connection already closed
    #[error("Broker closed")]
    Closed,
}

impl BrokerError {
    pub fn publish(topic: impl Into<String>, message: impl Into<String>) -> Self {
        BrokerError::Publish {
            topic: topic.into(),
            message: message.into(),
        }
    }

    /// Check if this is a connection-level error worth backing off for
    pub fn is_connection_error(&self) -> bool {
        match self {
            BrokerError::Redis(e) => {
                e.is_connection_dropped() || e.is_connection_refusal() || e.is_io_error()
            }
            BrokerError::Closed => true,
            _ => false,
        }
    }

    /// Check if the command outlived the client response timeout.
    ///
    /// A blocking read can exceed it when no messages arrive.
    pub fn is_timeout(&self) -> bool {
        matches!(self, BrokerError::Redis(e) if e.is_timeout())
    }

    /// Check if the consumer group is missing (stream was deleted)
    pub fn is_nogroup_error(&self) -> bool {
        matches!(self, BrokerError::Redis(e) if e.to_string().contains("NOGROUP"))
    }
}

/// Pipeline errors
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Payload could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(String),

    /// Retries exhausted but no dead-letter destination is configured
    #[error("Dead-letter queue is not configured")]
    DeadLetterDisabled,
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Codec(err.to_string())
    }
}
