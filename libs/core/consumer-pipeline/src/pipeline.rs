//! Consumption pipeline
//!
//! The per-message state machine between the broker and the application
//! handler:
//!
//! ```text
//! Received -> DuplicateCheck -> Skip ------------------------------+
//!                            -> Dispatch -> Success ---------------+--> Acknowledged
//!                                        -> Failure -> RetryScheduled
//!                                                   -> DeadLettered
//! ```
//!
//! Every delivery is acknowledged exactly once, whichever branch it takes.
//! Retries are re-publications carrying `retry-count` and
//! `original-message-id`, not broker redeliveries. A retry copy is published
//! before the original is acknowledged; if that publish fails the message is
//! dead-lettered instead, so retry intent is never dropped silently.
//!
//! [`ConsumptionPipeline::process`] stops at the retry wait and hands back a
//! [`PendingRetry`]; [`ConsumptionPipeline::complete_retry`] sleeps and
//! republishes. A subscription can therefore free the delivery's concurrency
//! slot while the backoff runs. A handler that panics counts as a failed attempt.

use crate::broker::{Broker, Producer};
use crate::codec::{Codec, JsonCodec};
use crate::config::PipelineConfig;
use crate::dedup::{DedupStore, InMemoryDedupStore};
use crate::dlq::DeadLetterRouter;
use crate::error::{HandlerError, PipelineError};
use crate::idempotency::derive_key;
use crate::message::{InboundMessage, MessageId};
use crate::metrics::PipelineMetrics;
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, OnceCell};
use tracing::{debug, error, info, warn};

/// Application handler invoked once per admitted message.
///
/// # Example
///
/// ```rust,ignore
/// use consumer_pipeline::{HandlerError, MessageHandler};
///
/// struct FibonacciHandler;
///
/// #[async_trait]
/// impl MessageHandler for FibonacciHandler {
///     type Payload = FibonacciData;
///
///     async fn handle(&self, payload: FibonacciData) -> Result<(), HandlerError> {
///         let result = fibonacci(payload.iterations)?;
///         info!(result = %result, "Fibonacci computed");
///         Ok(())
///     }
///
///     fn name(&self) -> &'static str {
///         "FibonacciHandler"
///     }
/// }
/// ```
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Decoded payload type
    type Payload: Send + 'static;

    /// Process one payload. Any `Err` counts as a failure of this attempt.
    async fn handle(&self, payload: Self::Payload) -> Result<(), HandlerError>;

    /// Handler name for logging and metrics
    fn name(&self) -> &'static str;
}

/// Receives deliveries from a subscription
#[async_trait]
pub trait MessageListener: Send + Sync {
    /// Run a delivery up to its terminal state or up to a retry wait
    async fn on_message(&self, message: InboundMessage) -> Delivery;

    /// Wait out the backoff of a deferred retry, then republish
    async fn on_retry(&self, retry: PendingRetry);

    /// Called once when the subscription stops
    async fn on_shutdown(&self) {}
}

/// A failed delivery whose retry copy is due after [`PendingRetry::delay`].
///
/// The original message is still unacknowledged.
#[derive(Debug)]
pub struct PendingRetry {
    message: InboundMessage,
    attempt: u32,
    delay: Duration,
    error: HandlerError,
}

impl PendingRetry {
    pub fn message(&self) -> &InboundMessage {
        &self.message
    }

    /// Retry count the republished copy will carry
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

/// Result of [`ConsumptionPipeline::process`]
#[derive(Debug)]
pub enum Delivery {
    /// Terminal state reached and the message acknowledged
    Settled(MessageOutcome),
    /// Waiting on a retry delay
    RetryPending(PendingRetry),
}

/// Terminal state reached by one delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Dedup key seen before; handler not invoked
    Duplicate,
    /// Handler succeeded
    Processed,
    /// Handler failed and a retry copy was published
    RetryScheduled {
        attempt: u32,
        retry_message_id: MessageId,
    },
    /// Handler failed terminally and the message reached the DLQ
    DeadLettered { dlq_message_id: MessageId },
    /// Handler failed terminally and no durable record exists
    Lost,
}

/// Reliable consumer for one source topic
pub struct ConsumptionPipeline<H, C = JsonCodec>
where
    H: MessageHandler,
    C: Codec<H::Payload>,
{
    topic: String,
    handler: Arc<H>,
    codec: C,
    config: PipelineConfig,
    broker: Arc<dyn Broker>,
    dedup: Option<Arc<dyn DedupStore>>,
    dead_letter: DeadLetterRouter,
    retry_producer: OnceCell<Arc<dyn Producer>>,
    metrics: PipelineMetrics,
    shutdown: watch::Sender<bool>,
}

impl<H> ConsumptionPipeline<H, JsonCodec>
where
    H: MessageHandler,
    JsonCodec: Codec<H::Payload>,
{
    /// Create a pipeline decoding JSON payloads
    pub fn new(
        broker: Arc<dyn Broker>,
        topic: impl Into<String>,
        handler: H,
        config: PipelineConfig,
    ) -> Self {
        Self::with_codec(broker, topic, handler, JsonCodec, config)
    }
}

impl<H, C> ConsumptionPipeline<H, C>
where
    H: MessageHandler,
    C: Codec<H::Payload>,
{
    /// Create a pipeline with a custom payload codec.
    ///
    /// An in-memory dedup store is allocated iff idempotency is enabled.
    pub fn with_codec(
        broker: Arc<dyn Broker>,
        topic: impl Into<String>,
        handler: H,
        codec: C,
        config: PipelineConfig,
    ) -> Self {
        let topic = topic.into();
        let handler = Arc::new(handler);

        let dedup: Option<Arc<dyn DedupStore>> = if config.idempotency.enabled {
            info!(
                topic = %topic,
                ttl_ms = config.idempotency.ttl_ms,
                use_message_id = config.idempotency.use_message_id,
                "Idempotency enabled with deduplication store"
            );
            Some(Arc::new(InMemoryDedupStore::with_sweeper(
                config.idempotency.ttl(),
                config.idempotency.sweep_interval(),
            )))
        } else {
            None
        };

        let dead_letter = DeadLetterRouter::new(Arc::clone(&broker), &config.dead_letter, &topic);
        if let Some(destination) = dead_letter.destination() {
            info!(topic = %topic, dlq_topic = %destination, "Dead-letter routing enabled");
        }

        let metrics = PipelineMetrics::new(&topic, handler.name());
        let (shutdown, _) = watch::channel(false);

        Self {
            topic,
            handler,
            codec,
            config,
            broker,
            dedup,
            dead_letter,
            retry_producer: OnceCell::new(),
            metrics,
            shutdown,
        }
    }

    /// Replace the dedup store, e.g. with a store shared across consumers.
    ///
    /// Ignored when idempotency is disabled.
    pub fn with_dedup_store(mut self, store: Arc<dyn DedupStore>) -> Self {
        if !self.config.idempotency.enabled {
            warn!(topic = %self.topic, "Idempotency disabled, ignoring dedup store");
            return self;
        }
        if let Some(previous) = self.dedup.replace(store) {
            previous.shutdown();
        }
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn dedup_store(&self) -> Option<&Arc<dyn DedupStore>> {
        self.dedup.as_ref()
    }

    pub fn dead_letter_topic(&self) -> Option<&str> {
        self.dead_letter.destination()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Stop waiting on retry delays and release the dedup sweep.
    ///
    /// Retries already waiting are republished immediately.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        if let Some(store) = &self.dedup {
            store.shutdown();
        }
        info!(topic = %self.topic, "Consumption pipeline shutting down");
    }

    /// Run one delivery through the state machine, retry wait included.
    pub async fn handle(&self, message: InboundMessage) -> MessageOutcome {
        match self.process(message).await {
            Delivery::Settled(outcome) => outcome,
            Delivery::RetryPending(retry) => self.complete_retry(retry).await,
        }
    }

    /// Run one delivery up to its terminal state, or up to the retry wait.
    pub async fn process(&self, message: InboundMessage) -> Delivery {
        self.metrics.message_received();
        debug!(
            topic = %self.topic,
            message_id = %message.id(),
            retry_count = message.retry_count(),
            "Received message"
        );

        let dedup_key = match &self.dedup {
            Some(store) => {
                let key = derive_key(&message, &self.config.idempotency);
                if !store.check_and_set(&key).await {
                    warn!(topic = %self.topic, key = %key, "Duplicate message skipped");
                    self.metrics.duplicate_skipped();
                    self.acknowledge(&message).await;
                    return Delivery::Settled(MessageOutcome::Duplicate);
                }
                Some(key)
            }
            None => None,
        };

        let started = Instant::now();
        let result = match self.codec.decode(message.payload()) {
            Ok(payload) => self.dispatch(&message, payload).await,
            Err(e) => Err(HandlerError::permanent("Failed to decode payload").with_cause(e)),
        };
        let elapsed = started.elapsed();

        match result {
            Ok(()) => {
                self.metrics.message_processed(elapsed);
                self.acknowledge(&message).await;
                Delivery::Settled(MessageOutcome::Processed)
            }
            Err(err) => {
                self.metrics.message_failed(elapsed);
                // the key only guards successful processing; let the retry copy through
                if let (Some(store), Some(key)) = (&self.dedup, &dedup_key) {
                    store.remove(key).await;
                }
                self.handle_failure(message, err).await
            }
        }
    }

    async fn dispatch(&self, message: &InboundMessage, payload: H::Payload) -> Result<(), HandlerError> {
        match AssertUnwindSafe(self.handler.handle(payload)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                error!(
                    topic = %self.topic,
                    message_id = %message.id(),
                    handler = self.handler.name(),
                    panic = %reason,
                    "Handler panicked"
                );
                Err(HandlerError::new(format!("handler panicked: {}", reason)))
            }
        }
    }

    async fn handle_failure(&self, message: InboundMessage, err: HandlerError) -> Delivery {
        let retry_count = message.retry_count();
        let max_retries = self.config.retry.max_retries;

        error!(
            topic = %self.topic,
            message_id = %message.id(),
            retry_count = retry_count,
            max_retries = max_retries,
            retryable = err.is_retryable(),
            error = %err.render(),
            "Error processing message"
        );

        if err.is_retryable() && self.config.retry.allows_retry(retry_count) {
            let attempt = retry_count + 1;
            let delay = self.config.retry.delay_for(attempt);
            warn!(
                topic = %self.topic,
                message_id = %message.id(),
                attempt = attempt,
                max_retries = self.config.retry.max_retries,
                delay_ms = delay.as_millis() as u64,
                "Retrying message"
            );
            Delivery::RetryPending(PendingRetry {
                message,
                attempt,
                delay,
                error: err,
            })
        } else {
            Delivery::Settled(self.route_to_dead_letter(message, err).await)
        }
    }

    /// Wait out the retry delay, publish the retry copy, then acknowledge the original.
    ///
    /// Falls back to dead-letter routing when the republish fails.
    pub async fn complete_retry(&self, retry: PendingRetry) -> MessageOutcome {
        let PendingRetry {
            message,
            attempt,
            delay,
            error: err,
        } = retry;

        self.wait_for_retry(delay).await;

        match self.republish(&message, attempt).await {
            Ok(retry_message_id) => {
                self.metrics.retry_scheduled(attempt);
                self.acknowledge(&message).await;
                MessageOutcome::RetryScheduled {
                    attempt,
                    retry_message_id,
                }
            }
            Err(publish_err) => {
                error!(
                    topic = %self.topic,
                    message_id = %message.id(),
                    attempt = attempt,
                    error = %publish_err,
                    "Failed to republish message for retry, routing to dead-letter queue"
                );
                let err = HandlerError::new(format!("{}; retry republish failed", err.render()))
                    .with_cause(publish_err);
                self.route_to_dead_letter(message, err).await
            }
        }
    }

    /// Sleep for `delay`, cut short by shutdown.
    async fn wait_for_retry(&self, delay: Duration) {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            return;
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            true = async { shutdown.wait_for(|stopping| *stopping).await.is_ok() } => {
                debug!(topic = %self.topic, "Shutdown during retry wait, republishing now");
            }
        }
    }

    async fn republish(
        &self,
        message: &InboundMessage,
        attempt: u32,
    ) -> Result<MessageId, PipelineError> {
        let producer = self
            .retry_producer
            .get_or_try_init(|| async {
                debug!(topic = %self.topic, "Creating retry producer");
                self.broker.create_producer(&self.topic).await
            })
            .await?;

        let id = producer
            .send(message.payload().to_vec(), message.retry_metadata(attempt))
            .await?;
        Ok(id)
    }

    async fn route_to_dead_letter(&self, message: InboundMessage, err: HandlerError) -> MessageOutcome {
        let outcome = match self.dead_letter.route(&message, &err, &self.topic).await {
            Ok(dlq_message_id) => {
                warn!(
                    topic = %self.topic,
                    message_id = %message.id(),
                    dlq_topic = self.dead_letter.destination().unwrap_or_default(),
                    "Message sent to dead-letter queue"
                );
                self.metrics.dead_lettered();
                MessageOutcome::DeadLettered { dlq_message_id }
            }
            Err(PipelineError::DeadLetterDisabled) => {
                error!(
                    topic = %self.topic,
                    message_id = %message.id(),
                    retry_count = message.retry_count(),
                    error = %err.render(),
                    data_loss = true,
                    "Max retries reached, but dead-letter queue is not enabled. Message will be lost"
                );
                self.metrics.dead_letter_failed("disabled");
                MessageOutcome::Lost
            }
            Err(dlq_err) => {
                error!(
                    topic = %self.topic,
                    message_id = %message.id(),
                    retry_count = message.retry_count(),
                    error = %err.render(),
                    dlq_error = %dlq_err,
                    data_loss = true,
                    "Failed to send message to dead-letter queue. Message will be lost"
                );
                self.metrics.dead_letter_failed("publish_failed");
                MessageOutcome::Lost
            }
        };

        self.acknowledge(&message).await;
        outcome
    }

    async fn acknowledge(&self, message: &InboundMessage) {
        if let Err(e) = self.broker.acknowledge(message).await {
            self.metrics.ack_failed();
            if self.is_shutting_down() {
                warn!(message_id = %message.id(), error = %e, "Failed to ACK message during shutdown");
            } else {
                error!(message_id = %message.id(), error = %e, "Failed to ACK message");
            }
        }
    }

    /// Current dedup store size, also published as a gauge
    pub async fn dedup_size(&self) -> Option<usize> {
        let store = self.dedup.as_ref()?;
        let size = store.size().await;
        self.metrics.dedup_store_size(size);
        Some(size)
    }
}

#[async_trait]
impl<H, C> MessageListener for ConsumptionPipeline<H, C>
where
    H: MessageHandler,
    C: Codec<H::Payload>,
{
    async fn on_message(&self, message: InboundMessage) -> Delivery {
        self.process(message).await
    }

    async fn on_retry(&self, retry: PendingRetry) {
        self.complete_retry(retry).await;
    }

    async fn on_shutdown(&self) {
        self.shutdown();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
