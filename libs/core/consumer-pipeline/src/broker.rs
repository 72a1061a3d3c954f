//! Broker collaborator seam
//!
//! The pipeline never talks to a transport directly. It needs exactly two
//! capabilities: publish to a named destination, and acknowledge a delivery.
//! `RedisBroker` is the production implementation; tests substitute their own.

use crate::error::BrokerError;
use crate::message::{InboundMessage, MessageId, Metadata};
use async_trait::async_trait;
use std::sync::Arc;

/// Publisher bound to one destination
#[async_trait]
pub trait Producer: Send + Sync {
    /// Destination this producer publishes to
    fn topic(&self) -> &str;

    /// Publish a message. Returns the broker-assigned message ID.
    async fn send(&self, payload: Vec<u8>, metadata: Metadata) -> Result<MessageId, BrokerError>;
}

/// Broker connection as seen by the pipeline
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    /// Create a producer for `topic`. Callers cache the result.
    async fn create_producer(&self, topic: &str) -> Result<Arc<dyn Producer>, BrokerError>;

    /// Acknowledge a delivery so the broker will not redeliver it
    async fn acknowledge(&self, message: &InboundMessage) -> Result<(), BrokerError>;
}
