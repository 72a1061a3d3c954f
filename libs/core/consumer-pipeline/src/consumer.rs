//! Redis Streams broker binding
//!
//! - `RedisBroker`: the `Broker` implementation (producers + XACK)
//! - `RedisSubscription`: a consumer-group subscription that hands every
//!   delivery to a `MessageListener` on its own task
//!
//! A subscription is a Redis consumer group, so several processes sharing one
//! subscription name split the stream between them. Entries that a crashed
//! consumer never acknowledged are claimed by the survivors after
//! `claim_idle_ms`.
//!
//! A delivery holds an in-flight slot only while the handler runs. During a
//! retry backoff the slot is free and the original entry is re-claimed by
//! its own consumer every `claim_idle_ms / 2`, so no peer mistakes it for
//! abandoned work.

use crate::broker::{Broker, Producer};
use crate::error::BrokerError;
use crate::message::{InboundMessage, Metadata};
use crate::pipeline::{Delivery, MessageListener};
use crate::producer::{RedisProducer, PAYLOAD_FIELD};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::RedisResult;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

// Raw XREADGROUP / XCLAIM reply shapes
type StreamEntries = Vec<(String, Vec<(String, Vec<u8>)>)>;
type StreamReply = Vec<(String, StreamEntries)>;

const MAX_BACKOFF_SECS: u64 = 30;

/// Broker backed by Redis Streams
#[derive(Clone)]
pub struct RedisBroker {
    redis: ConnectionManager,
    subscription: String,
    max_length: i64,
}

impl RedisBroker {
    /// `subscription` is the consumer group acknowledgments are recorded against
    pub fn new(redis: ConnectionManager, subscription: impl Into<String>) -> Self {
        Self {
            redis,
            subscription: subscription.into(),
            max_length: 100_000,
        }
    }

    /// Set the maximum length of streams written by this broker's producers
    pub fn with_max_length(mut self, max_length: i64) -> Self {
        self.max_length = max_length;
        self
    }

    pub fn redis(&self) -> ConnectionManager {
        self.redis.clone()
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn create_producer(&self, topic: &str) -> Result<Arc<dyn Producer>, BrokerError> {
        debug!(topic = %topic, "Creating producer");
        Ok(Arc::new(
            RedisProducer::new(self.redis.clone(), topic).with_max_length(self.max_length),
        ))
    }

    async fn acknowledge(&self, message: &InboundMessage) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();

        let acked: i64 = redis::cmd("XACK")
            .arg(message.topic())
            .arg(&self.subscription)
            .arg(message.id())
            .query_async(&mut conn)
            .await?;

        if acked == 0 {
            // already acknowledged, or claimed and acknowledged by another consumer
            debug!(message_id = %message.id(), "ACK matched no pending entry");
        } else {
            debug!(message_id = %message.id(), "Acknowledged message");
        }
        Ok(())
    }
}

/// Configuration for a subscription
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    /// Stream to consume
    pub topic: String,

    /// Consumer group name
    pub subscription: String,

    /// Unique consumer name within the group (auto-generated if not provided)
    pub consumer_name: String,

    /// Entries fetched per read
    pub batch_size: usize,

    /// XREADGROUP BLOCK timeout in milliseconds
    pub block_timeout_ms: u64,

    /// Deliveries whose handler runs concurrently; retry waits do not count
    pub max_in_flight: usize,

    /// Idle time after which another consumer's unacknowledged entry is claimed
    pub claim_idle_ms: u64,
}

impl SubscriptionConfig {
    pub fn new(topic: impl Into<String>, subscription: impl Into<String>) -> Self {
        let subscription = subscription.into();
        Self {
            topic: topic.into(),
            consumer_name: format!("{}-{}", subscription, Uuid::new_v4()),
            subscription,
            batch_size: 10,
            block_timeout_ms: 1000,
            max_in_flight: 16,
            claim_idle_ms: 60_000,
        }
    }

    /// Set the consumer name
    pub fn with_consumer_name(mut self, name: impl Into<String>) -> Self {
        self.consumer_name = name.into();
        self
    }

    /// Set the batch size
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Set the blocking read timeout
    pub fn with_block_timeout_ms(mut self, timeout: u64) -> Self {
        self.block_timeout_ms = timeout;
        self
    }

    /// Set the maximum in-flight deliveries
    pub fn with_max_in_flight(mut self, count: usize) -> Self {
        self.max_in_flight = count.max(1);
        self
    }

    /// Set the claim idle time for abandoned entries
    pub fn with_claim_idle_ms(mut self, idle: u64) -> Self {
        self.claim_idle_ms = idle;
        self
    }
}

/// Consumer-group subscription on one stream
pub struct RedisSubscription {
    redis: ConnectionManager,
    config: SubscriptionConfig,
    in_flight: Arc<Semaphore>,
}

impl RedisSubscription {
    pub fn new(redis: ConnectionManager, config: SubscriptionConfig) -> Self {
        let in_flight = Arc::new(Semaphore::new(config.max_in_flight));
        Self {
            redis,
            config,
            in_flight,
        }
    }

    pub fn config(&self) -> &SubscriptionConfig {
        &self.config
    }

    /// Lease that keeps `message_id` owned by this consumer
    pub fn lease(&self, message_id: impl Into<String>) -> PendingLease {
        PendingLease {
            redis: self.redis.clone(),
            topic: self.config.topic.clone(),
            subscription: self.config.subscription.clone(),
            consumer_name: self.config.consumer_name.clone(),
            message_id: message_id.into(),
            renew_every: Duration::from_millis((self.config.claim_idle_ms / 2).max(100)),
        }
    }

    /// Create the consumer group if it doesn't exist
    pub async fn ensure_consumer_group(&self) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();

        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.config.topic)
            .arg(&self.config.subscription)
            .arg("$") // Only messages published from now on
            .arg("MKSTREAM") // Create stream if it doesn't exist
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => {
                info!(
                    topic = %self.config.topic,
                    subscription = %self.config.subscription,
                    "Created consumer group"
                );
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(
                    topic = %self.config.topic,
                    subscription = %self.config.subscription,
                    "Consumer group already exists"
                );
                Ok(())
            }
            Err(e) => Err(BrokerError::Redis(e)),
        }
    }

    /// Entries delivered to this consumer but never acknowledged
    pub async fn read_pending(&self) -> Result<Vec<InboundMessage>, BrokerError> {
        self.read_group("0", None).await
    }

    /// New entries, blocking up to `block_timeout_ms`
    pub async fn read_new(&self) -> Result<Vec<InboundMessage>, BrokerError> {
        self.read_group(">", Some(self.config.block_timeout_ms)).await
    }

    async fn read_group(
        &self,
        cursor: &str,
        block_ms: Option<u64>,
    ) -> Result<Vec<InboundMessage>, BrokerError> {
        let mut conn = self.redis.clone();

        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.config.subscription)
            .arg(&self.config.consumer_name);
        if let Some(block) = block_ms {
            cmd.arg("BLOCK").arg(block);
        }
        cmd.arg("COUNT")
            .arg(self.config.batch_size)
            .arg("STREAMS")
            .arg(&self.config.topic)
            .arg(cursor);

        // nil reply when BLOCK times out
        let reply: Option<StreamReply> = cmd.query_async(&mut conn).await?;

        let entries: StreamEntries = reply
            .into_iter()
            .flatten()
            .flat_map(|(_stream, entries)| entries)
            .collect();
        let parsed = parse_entries(&self.config.topic, entries);
        self.discard_malformed(&parsed.malformed).await;
        Ok(parsed.messages)
    }

    /// Acknowledge entries that carry no payload so they leave the pending list
    async fn discard_malformed(&self, ids: &[String]) {
        if ids.is_empty() {
            return;
        }

        error!(
            topic = %self.config.topic,
            message_ids = ?ids,
            data_loss = true,
            "Discarding stream entries without a 'payload' field"
        );

        let mut conn = self.redis.clone();
        let result: RedisResult<i64> = redis::cmd("XACK")
            .arg(&self.config.topic)
            .arg(&self.config.subscription)
            .arg(ids)
            .query_async(&mut conn)
            .await;

        if let Err(e) = result {
            warn!(error = %e, message_ids = ?ids, "Failed to ACK malformed entries");
        }
    }

    /// Claim entries other consumers left unacknowledged for longer than `claim_idle_ms`
    pub async fn claim_abandoned(&self) -> Result<Vec<InboundMessage>, BrokerError> {
        let mut conn = self.redis.clone();

        // (id, consumer, idle ms, delivery count)
        let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(&self.config.topic)
            .arg(&self.config.subscription)
            .arg("IDLE")
            .arg(self.config.claim_idle_ms)
            .arg("-")
            .arg("+")
            .arg(self.config.batch_size)
            .query_async(&mut conn)
            .await?;

        let claim_ids: Vec<&str> = pending
            .iter()
            .filter(|(_, consumer, _, _)| *consumer != self.config.consumer_name)
            .map(|(id, _, _, _)| id.as_str())
            .collect();

        if claim_ids.is_empty() {
            return Ok(vec![]);
        }

        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(&self.config.topic)
            .arg(&self.config.subscription)
            .arg(&self.config.consumer_name)
            .arg(self.config.claim_idle_ms);
        for id in &claim_ids {
            cmd.arg(*id);
        }

        let entries: StreamEntries = cmd.query_async(&mut conn).await?;
        let parsed = parse_entries(&self.config.topic, entries);
        self.discard_malformed(&parsed.malformed).await;
        let messages = parsed.messages;
        if !messages.is_empty() {
            warn!(count = messages.len(), topic = %self.config.topic, "Claimed abandoned messages");
        }
        Ok(messages)
    }

    /// Consume until `shutdown` flips to true, then drain in-flight deliveries.
    pub async fn run(
        &self,
        listener: Arc<dyn MessageListener>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), BrokerError> {
        info!(
            topic = %self.config.topic,
            subscription = %self.config.subscription,
            consumer = %self.config.consumer_name,
            max_in_flight = self.config.max_in_flight,
            batch_size = self.config.batch_size,
            "Starting subscription"
        );

        self.ensure_consumer_group().await?;

        let mut tasks: JoinSet<()> = JoinSet::new();

        match self.read_pending().await {
            Ok(pending) if !pending.is_empty() => {
                info!(count = pending.len(), "Resuming pending messages");
                self.dispatch(&mut tasks, &listener, pending, &mut shutdown).await;
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to read pending messages on startup"),
        }

        let claim_interval = Duration::from_millis(self.config.claim_idle_ms.max(1000));
        let mut last_claim = Instant::now();
        let mut consecutive_errors: u32 = 0;

        loop {
            if *shutdown.borrow() {
                info!("Received shutdown signal, stopping subscription");
                break;
            }

            match self.read_new().await {
                Ok(messages) => {
                    if consecutive_errors > 0 {
                        info!("Connection recovered after {} errors", consecutive_errors);
                        consecutive_errors = 0;
                    }
                    self.dispatch(&mut tasks, &listener, messages, &mut shutdown).await;
                }
                Err(e) if e.is_timeout() => {
                    debug!("Blocking read timed out, continuing");
                }
                Err(e) => {
                    consecutive_errors += 1;

                    if e.is_nogroup_error() {
                        warn!("Consumer group missing, recreating...");
                        if let Err(create_err) = self.ensure_consumer_group().await {
                            error!(error = %create_err, "Failed to recreate consumer group");
                        }
                    } else if e.is_connection_error() {
                        let backoff_secs =
                            2u64.pow(consecutive_errors.min(5)).min(MAX_BACKOFF_SECS);
                        warn!(
                            error = %e,
                            consecutive_errors = consecutive_errors,
                            backoff_secs = backoff_secs,
                            "Redis connection error, backing off"
                        );
                        tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                    } else {
                        error!(error = %e, "Error reading from stream");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                    continue;
                }
            }

            if last_claim.elapsed() >= claim_interval {
                match self.claim_abandoned().await {
                    Ok(claimed) => self.dispatch(&mut tasks, &listener, claimed, &mut shutdown).await,
                    Err(e) => debug!(error = %e, "Error claiming abandoned messages"),
                }
                last_claim = Instant::now();
            }

            while let Some(result) = tasks.try_join_next() {
                log_task_result(result);
            }
        }

        // Let retries waiting on a delay publish now instead of holding shutdown
        listener.on_shutdown().await;

        let remaining = tasks.len();
        if remaining > 0 {
            info!(in_flight = remaining, "Draining in-flight messages");
        }
        while let Some(result) = tasks.join_next().await {
            log_task_result(result);
        }

        info!(topic = %self.config.topic, "Subscription stopped");
        Ok(())
    }

    /// Spawn one task per message, waiting for a free slot first.
    ///
    /// Messages left undispatched at shutdown stay pending and are resumed on restart.
    async fn dispatch(
        &self,
        tasks: &mut JoinSet<()>,
        listener: &Arc<dyn MessageListener>,
        messages: Vec<InboundMessage>,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        let total = messages.len();
        for (index, message) in messages.into_iter().enumerate() {
            let permit = tokio::select! {
                permit = Arc::clone(&self.in_flight).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        error!("In-flight semaphore closed, dropping dispatch");
                        return;
                    }
                },
                true = shutdown_requested(shutdown) => {
                    info!(
                        undispatched = total - index,
                        "Shutdown while waiting for a free slot, leaving messages pending"
                    );
                    return;
                }
            };

            let listener = Arc::clone(listener);
            let lease = self.lease(message.id());
            tasks.spawn(async move {
                let delivery = listener.on_message(message).await;
                drop(permit);
                if let Delivery::RetryPending(retry) = delivery {
                    lease.hold_while(listener.on_retry(retry)).await;
                }
            });
        }
    }
}

/// Ownership of one pending entry during a retry backoff.
///
/// Re-claiming the entry with `XCLAIM ... JUSTID` resets its idle time without
/// bumping the delivery count, so `claim_abandoned` on other consumers skips it.
pub struct PendingLease {
    redis: ConnectionManager,
    topic: String,
    subscription: String,
    consumer_name: String,
    message_id: String,
    renew_every: Duration,
}

impl PendingLease {
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Reset the entry's idle time.
    ///
    /// Returns false once the entry is acknowledged or owned by another consumer.
    pub async fn renew(&self) -> Result<bool, BrokerError> {
        let mut conn = self.redis.clone();

        let owned: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(&self.topic)
            .arg(&self.subscription)
            .arg(&self.message_id)
            .arg(&self.message_id)
            .arg(1)
            .arg(&self.consumer_name)
            .query_async(&mut conn)
            .await?;
        if owned.is_empty() {
            return Ok(false);
        }

        let claimed: Vec<String> = redis::cmd("XCLAIM")
            .arg(&self.topic)
            .arg(&self.subscription)
            .arg(&self.consumer_name)
            .arg(0)
            .arg(&self.message_id)
            .arg("JUSTID")
            .query_async(&mut conn)
            .await?;
        Ok(!claimed.is_empty())
    }

    /// Drive `work` to completion, renewing the lease until it finishes
    pub async fn hold_while<F: Future>(&self, work: F) -> F::Output {
        tokio::pin!(work);
        let mut ticker = tokio::time::interval(self.renew_every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                output = &mut work => return output,
                _ = ticker.tick() => match self.renew().await {
                    Ok(true) => debug!(message_id = %self.message_id, "Renewed pending entry"),
                    Ok(false) => debug!(message_id = %self.message_id, "Entry no longer pending"),
                    Err(e) => warn!(
                        message_id = %self.message_id,
                        error = %e,
                        "Failed to renew pending entry"
                    ),
                },
            }
        }
    }
}

/// Resolves once shutdown is signalled; false if the sender is gone
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) -> bool {
    shutdown.wait_for(|stopping| *stopping).await.is_ok()
}

fn log_task_result(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!(error = %e, "Message task panicked");
        } else {
            debug!(error = %e, "Message task cancelled");
        }
    }
}

struct ParsedEntries {
    messages: Vec<InboundMessage>,
    /// Entry ids without a payload field
    malformed: Vec<String>,
}

/// Turn raw stream entries into messages, setting aside entries without a payload
fn parse_entries(topic: &str, entries: StreamEntries) -> ParsedEntries {
    let mut parsed = ParsedEntries {
        messages: Vec::with_capacity(entries.len()),
        malformed: Vec::new(),
    };

    for (id, fields) in entries {
        let mut payload = None;
        let mut metadata = Metadata::new();

        for (key, value) in fields {
            if key == PAYLOAD_FIELD && payload.is_none() {
                payload = Some(value);
            } else {
                metadata.insert(key, String::from_utf8_lossy(&value).into_owned());
            }
        }

        match payload {
            Some(payload) => parsed.messages.push(InboundMessage::new(id, topic, payload, metadata)),
            None => {
                warn!(
                    message_id = %id,
                    fields = ?metadata.keys().collect::<Vec<_>>(),
                    "Missing 'payload' field in message"
                );
                parsed.malformed.push(id);
            }
        }
    }

    parsed
}
