//! Consumer Pipeline
//!
//! Reliable message consumption on top of a topic/subscription broker.
//!
//! ## Features
//!
//! - **Deduplication**: skip deliveries whose key was already processed within a TTL
//! - **Bounded retry**: failed messages are republished with `retry-count` and
//!   exponential backoff
//! - **Dead Letter Queue**: exhausted messages land on `<topic>-dlq` with failure annotations
//! - **Redis Streams binding**: consumer groups, pending resume, abandoned-entry
//!   claiming, and leases on entries waiting out a retry backoff
//! - **Prometheus metrics** and **health endpoints**
//!
//! ## Example
//!
//! ```ignore
//! use consumer_pipeline::{
//!     ConsumptionPipeline, MessageHandler, PipelineConfig, RedisBroker, RedisSubscription,
//!     SubscriptionConfig,
//! };
//!
//! let broker = Arc::new(RedisBroker::new(redis.clone(), "workq-subscription"));
//! let pipeline = Arc::new(ConsumptionPipeline::new(
//!     broker,
//!     "Fibonacci",
//!     FibonacciHandler,
//!     PipelineConfig::from_env("FIBONACCI")?,
//! ));
//!
//! let subscription = RedisSubscription::new(
//!     redis,
//!     SubscriptionConfig::new("Fibonacci", "workq-subscription"),
//! );
//! subscription.run(pipeline, shutdown_rx).await?;
//! ```

mod broker;
mod codec;
mod config;
mod consumer;
mod dedup;
mod dlq;
mod error;
mod health;
pub mod idempotency;
mod message;
pub mod metrics;
mod pipeline;
mod producer;
mod retry;
mod shared_dedup;

pub use broker::{Broker, Producer};
pub use codec::{Codec, JsonCodec};
pub use config::{DeadLetterPolicy, DedupBackend, IdempotencyPolicy, PipelineConfig};
pub use consumer::{PendingLease, RedisBroker, RedisSubscription, SubscriptionConfig};
pub use dedup::{DedupStore, InMemoryDedupStore};
pub use dlq::{dead_letter_metadata, sanitize_error_message, DeadLetterRouter, MAX_ERROR_MESSAGE_LEN};
pub use error::{BrokerError, HandlerError, PipelineError};
pub use health::{health_router, HealthState};
pub use message::{keys, InboundMessage, MessageId, Metadata};
pub use self::metrics::{init_metrics, PipelineMetrics};
pub use pipeline::{
    ConsumptionPipeline, Delivery, MessageHandler, MessageListener, MessageOutcome, PendingRetry,
};
pub use producer::{RedisProducer, PAYLOAD_FIELD};
pub use retry::RetryPolicy;
pub use shared_dedup::RedisDedupStore;
