//! Redis Streams producer
//!
//! One producer per destination stream. The payload goes in the `payload`
//! field of the stream entry; each metadata property becomes a field of its own.
//!
//! # Example
//!
//! ```rust,ignore
//! use consumer_pipeline::{RedisProducer, Producer};
//!
//! let producer = RedisProducer::new(redis, "Fibonacci");
//! let metadata = with_idempotency_key(Metadata::new(), None, "idempotency-key");
//! let message_id = producer.send(serde_json::to_vec(&job)?, metadata).await?;
//! ```

use crate::broker::Producer;
use crate::error::BrokerError;
use crate::message::{MessageId, Metadata};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::{debug, warn};

/// Stream entry field carrying the message payload
pub const PAYLOAD_FIELD: &str = "payload";

const DEFAULT_MAX_LENGTH: i64 = 100_000;

/// Producer for one Redis stream
#[derive(Clone)]
pub struct RedisProducer {
    redis: ConnectionManager,
    topic: String,
    max_length: i64,
}

impl RedisProducer {
    pub fn new(redis: ConnectionManager, topic: impl Into<String>) -> Self {
        Self {
            redis,
            topic: topic.into(),
            max_length: DEFAULT_MAX_LENGTH,
        }
    }

    /// Set the maximum stream length (MAXLEN ~).
    pub fn with_max_length(mut self, max_length: i64) -> Self {
        self.max_length = max_length;
        self
    }
}

#[async_trait]
impl Producer for RedisProducer {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn send(&self, payload: Vec<u8>, metadata: Metadata) -> Result<MessageId, BrokerError> {
        let mut conn = self.redis.clone();

        // Use XADD with MAXLEN ~ for approximate trimming (more efficient)
        let mut cmd = redis::cmd("XADD");
        cmd.arg(&self.topic)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_length)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(payload);

        for (key, value) in &metadata {
            if key == PAYLOAD_FIELD {
                warn!(topic = %self.topic, "Dropping metadata property that collides with the payload field");
                continue;
            }
            cmd.arg(key).arg(value);
        }

        let message_id: String = cmd.query_async(&mut conn).await?;

        debug!(
            topic = %self.topic,
            message_id = %message_id,
            properties = metadata.len(),
            "Published message"
        );

        Ok(message_id)
    }
}
