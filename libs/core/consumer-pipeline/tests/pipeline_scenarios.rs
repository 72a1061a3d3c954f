//! End-to-end consumption scenarios against an in-memory broker.
//!
//! Republished retry copies are fed back into the pipeline the way a live
//! subscription would deliver them.

use async_trait::async_trait;
use consumer_pipeline::{
    Broker, BrokerError, ConsumptionPipeline, DeadLetterPolicy, Delivery, HandlerError,
    IdempotencyPolicy, InboundMessage, MessageHandler, MessageId, MessageOutcome, Metadata,
    PipelineConfig, Producer, RetryPolicy,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
struct Published {
    topic: String,
    id: MessageId,
    payload: Vec<u8>,
    metadata: Metadata,
}

#[derive(Default)]
struct Recorded {
    published: Vec<Published>,
    acked: Vec<MessageId>,
    next_id: u64,
}

/// Broker that keeps everything in memory
#[derive(Clone, Default)]
struct RecordingBroker {
    state: Arc<Mutex<Recorded>>,
}

impl RecordingBroker {
    fn published_to(&self, topic: &str) -> Vec<Published> {
        let state = self.state.lock().unwrap();
        state
            .published
            .iter()
            .filter(|p| p.topic == topic)
            .cloned()
            .collect()
    }

    fn acked(&self) -> Vec<MessageId> {
        self.state.lock().unwrap().acked.clone()
    }
}

struct RecordingProducer {
    topic: String,
    state: Arc<Mutex<Recorded>>,
}

#[async_trait]
impl Producer for RecordingProducer {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn send(&self, payload: Vec<u8>, metadata: Metadata) -> Result<MessageId, BrokerError> {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("{}-0", state.next_id);
        state.published.push(Published {
            topic: self.topic.clone(),
            id: id.clone(),
            payload,
            metadata,
        });
        Ok(id)
    }
}

#[async_trait]
impl Broker for RecordingBroker {
    async fn create_producer(&self, topic: &str) -> Result<Arc<dyn Producer>, BrokerError> {
        Ok(Arc::new(RecordingProducer {
            topic: topic.to_string(),
            state: Arc::clone(&self.state),
        }))
    }

    async fn acknowledge(&self, message: &InboundMessage) -> Result<(), BrokerError> {
        self.state.lock().unwrap().acked.push(message.id().to_string());
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FibonacciData {
    iterations: u32,
}

/// Fails the first `failures` calls, then succeeds
struct FlakyHandler {
    calls: AtomicUsize,
    failures: usize,
}

impl FlakyHandler {
    fn failing(failures: usize) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            failures,
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageHandler for FlakyHandler {
    type Payload = FibonacciData;

    async fn handle(&self, _payload: FibonacciData) -> Result<(), HandlerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            Err(HandlerError::new(format!("attempt {} failed", call + 1)))
        } else {
            Ok(())
        }
    }

    fn name(&self) -> &'static str {
        "FlakyHandler"
    }
}

const TOPIC: &str = "Fibonacci";

fn delivery(id: &str, metadata: &[(&str, &str)]) -> InboundMessage {
    InboundMessage::new(
        id,
        TOPIC,
        br#"{"iterations":10}"#.to_vec(),
        metadata
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    )
}

/// Deliver `first`, then every retry copy published to the source topic, until none remain
async fn drive(
    pipeline: &ConsumptionPipeline<FlakyHandler>,
    broker: &RecordingBroker,
    first: InboundMessage,
) -> Vec<MessageOutcome> {
    let mut delivered = 0;
    let mut queue = VecDeque::from([first]);
    let mut outcomes = Vec::new();

    while let Some(message) = queue.pop_front() {
        outcomes.push(pipeline.handle(message).await);

        let retries = broker.published_to(TOPIC);
        for copy in retries.into_iter().skip(delivered) {
            delivered += 1;
            queue.push_back(InboundMessage::new(copy.id, TOPIC, copy.payload, copy.metadata));
        }
    }
    outcomes
}

fn config(max_retries: u32) -> PipelineConfig {
    PipelineConfig::new().with_retry(RetryPolicy::new(max_retries))
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_land_on_dead_letter_topic() {
    let broker = RecordingBroker::default();
    let pipeline = ConsumptionPipeline::new(
        Arc::new(broker.clone()),
        TOPIC,
        FlakyHandler::failing(usize::MAX),
        config(3),
    );

    let outcomes = drive(&pipeline, &broker, delivery("100-0", &[])).await;

    assert_eq!(outcomes.len(), 4);
    assert!(matches!(outcomes[0], MessageOutcome::RetryScheduled { attempt: 1, .. }));
    assert!(matches!(outcomes[1], MessageOutcome::RetryScheduled { attempt: 2, .. }));
    assert!(matches!(outcomes[2], MessageOutcome::RetryScheduled { attempt: 3, .. }));
    assert!(matches!(outcomes[3], MessageOutcome::DeadLettered { .. }));
    assert_eq!(pipeline.handler().calls(), 4);

    let retries = broker.published_to(TOPIC);
    let counts: Vec<&str> = retries.iter().map(|p| p.metadata["retry-count"].as_str()).collect();
    assert_eq!(counts, ["1", "2", "3"]);
    assert_eq!(retries[0].metadata["original-message-id"], "100-0");

    let dead = broker.published_to("Fibonacci-dlq");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].payload, br#"{"iterations":10}"#.to_vec());
    assert_eq!(dead[0].metadata["retry-count"], "3");
    assert_eq!(dead[0].metadata["original-topic"], TOPIC);
    assert_eq!(dead[0].metadata["error-message"], "attempt 4 failed");
    assert!(dead[0].metadata["failed-at"].ends_with('Z'));

    // original plus three retry copies, each acknowledged once
    assert_eq!(broker.acked().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn transient_failure_recovers_on_retry() {
    let broker = RecordingBroker::default();
    let pipeline = ConsumptionPipeline::new(
        Arc::new(broker.clone()),
        TOPIC,
        FlakyHandler::failing(1),
        config(3),
    );

    let outcomes = drive(&pipeline, &broker, delivery("200-0", &[])).await;

    assert!(matches!(outcomes[0], MessageOutcome::RetryScheduled { attempt: 1, .. }));
    assert_eq!(outcomes[1], MessageOutcome::Processed);
    assert!(broker.published_to("Fibonacci-dlq").is_empty());
    assert_eq!(broker.acked().len(), 2);
}

#[tokio::test]
async fn duplicate_delivery_is_skipped() {
    let broker = RecordingBroker::default();
    let pipeline = ConsumptionPipeline::new(
        Arc::new(broker.clone()),
        TOPIC,
        FlakyHandler::failing(0),
        config(3).with_idempotency(IdempotencyPolicy::enabled()),
    );

    assert_eq!(pipeline.handle(delivery("300-0", &[])).await, MessageOutcome::Processed);
    assert_eq!(pipeline.handle(delivery("300-0", &[])).await, MessageOutcome::Duplicate);

    assert_eq!(pipeline.handler().calls(), 1);
    assert_eq!(broker.acked(), ["300-0", "300-0"]);
    assert_eq!(pipeline.dedup_size().await, Some(1));
}

#[tokio::test]
async fn redelivery_is_processed_when_idempotency_is_off() {
    let broker = RecordingBroker::default();
    let pipeline = ConsumptionPipeline::new(
        Arc::new(broker.clone()),
        TOPIC,
        FlakyHandler::failing(0),
        config(3),
    );

    pipeline.handle(delivery("400-0", &[])).await;
    pipeline.handle(delivery("400-0", &[])).await;

    assert_eq!(pipeline.handler().calls(), 2);
    assert!(pipeline.dedup_store().is_none());
}

#[tokio::test]
async fn business_key_deduplicates_distinct_message_ids() {
    let broker = RecordingBroker::default();
    let pipeline = ConsumptionPipeline::new(
        Arc::new(broker.clone()),
        TOPIC,
        FlakyHandler::failing(0),
        config(3).with_idempotency(IdempotencyPolicy::enabled().with_key_property("idempotency-key")),
    );

    let key = [("idempotency-key", "order-9")];
    assert_eq!(pipeline.handle(delivery("500-0", &key)).await, MessageOutcome::Processed);
    assert_eq!(pipeline.handle(delivery("501-0", &key)).await, MessageOutcome::Duplicate);
    assert_eq!(pipeline.handler().calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn business_key_retry_copies_are_not_duplicates() {
    let broker = RecordingBroker::default();
    let pipeline = ConsumptionPipeline::new(
        Arc::new(broker.clone()),
        TOPIC,
        FlakyHandler::failing(2),
        config(3).with_idempotency(IdempotencyPolicy::enabled().with_key_property("idempotency-key")),
    );

    let outcomes = drive(&pipeline, &broker, delivery("600-0", &[("idempotency-key", "order-1")])).await;

    // retry copies carry the same business key, yet the handler runs again
    assert_eq!(outcomes.len(), 3);
    assert_eq!(outcomes[2], MessageOutcome::Processed);
    assert_eq!(pipeline.handler().calls(), 3);
    assert_eq!(broker.published_to(TOPIC)[0].metadata["idempotency-key"], "order-1");
}

#[tokio::test]
async fn disabled_dead_letter_loses_message_but_acknowledges() {
    let broker = RecordingBroker::default();
    let pipeline = ConsumptionPipeline::new(
        Arc::new(broker.clone()),
        TOPIC,
        FlakyHandler::failing(usize::MAX),
        config(0).with_dead_letter(DeadLetterPolicy::disabled()),
    );

    assert_eq!(pipeline.handle(delivery("700-0", &[])).await, MessageOutcome::Lost);
    assert_eq!(broker.acked(), ["700-0"]);
    assert!(broker.state.lock().unwrap().published.is_empty());
}

#[tokio::test]
async fn custom_dead_letter_topic() {
    let broker = RecordingBroker::default();
    let pipeline = ConsumptionPipeline::new(
        Arc::new(broker.clone()),
        TOPIC,
        FlakyHandler::failing(usize::MAX),
        config(0).with_dead_letter(DeadLetterPolicy::default().with_topic("poison")),
    );

    assert!(matches!(
        pipeline.handle(delivery("800-0", &[])).await,
        MessageOutcome::DeadLettered { .. }
    ));
    assert_eq!(broker.published_to("poison").len(), 1);
}

#[tokio::test]
async fn malformed_retry_count_is_treated_as_first_attempt() {
    let broker = RecordingBroker::default();
    let pipeline = ConsumptionPipeline::new(
        Arc::new(broker.clone()),
        TOPIC,
        FlakyHandler::failing(usize::MAX),
        config(1).with_retry(RetryPolicy::new(1).with_retry_delay(Duration::ZERO)),
    );

    let outcome = pipeline.handle(delivery("900-0", &[("retry-count", "abc")])).await;
    assert!(matches!(outcome, MessageOutcome::RetryScheduled { attempt: 1, .. }));
}

#[tokio::test(start_paused = true)]
async fn every_delivery_is_acknowledged_exactly_once() {
    let broker = RecordingBroker::default();
    let pipeline = ConsumptionPipeline::new(
        Arc::new(broker.clone()),
        TOPIC,
        FlakyHandler::failing(2),
        config(1).with_idempotency(IdempotencyPolicy::enabled()),
    );

    let mut ids = Vec::new();
    // fails, retries once, then dead-letters
    drive(&pipeline, &broker, delivery("1000-0", &[])).await;
    // succeeds, then a duplicate
    pipeline.handle(delivery("1001-0", &[])).await;
    pipeline.handle(delivery("1001-0", &[])).await;
    ids.extend(["1000-0", "1001-0", "1001-0"].map(String::from));
    ids.extend(broker.published_to(TOPIC).into_iter().map(|p| p.id));

    let mut acked = broker.acked();
    acked.sort();
    ids.sort();
    assert_eq!(acked, ids);
}

/// Panics on its first call, then succeeds
struct PanicOnceHandler {
    calls: AtomicUsize,
}

#[async_trait]
impl MessageHandler for PanicOnceHandler {
    type Payload = FibonacciData;

    async fn handle(&self, _payload: FibonacciData) -> Result<(), HandlerError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("iteration table corrupted");
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "PanicOnceHandler"
    }
}

#[tokio::test(start_paused = true)]
async fn panicking_handler_is_retried_not_lost() {
    let broker = RecordingBroker::default();
    let pipeline = ConsumptionPipeline::new(
        Arc::new(broker.clone()),
        TOPIC,
        PanicOnceHandler { calls: AtomicUsize::new(0) },
        config(3).with_idempotency(IdempotencyPolicy::enabled()),
    );

    let outcome = pipeline.handle(delivery("1100-0", &[])).await;
    assert!(matches!(outcome, MessageOutcome::RetryScheduled { attempt: 1, .. }));
    assert_eq!(broker.acked(), ["1100-0"]);

    let retry = broker.published_to(TOPIC).remove(0);
    assert_eq!(retry.metadata["retry-count"], "1");
    assert_eq!(retry.metadata["original-message-id"], "1100-0");

    // the retry copy runs the handler again instead of being skipped as a duplicate
    let redelivered = InboundMessage::new(retry.id, TOPIC, retry.payload, retry.metadata);
    assert_eq!(pipeline.handle(redelivered).await, MessageOutcome::Processed);
    assert_eq!(pipeline.handler().calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn panic_on_last_attempt_is_dead_lettered() {
    let broker = RecordingBroker::default();
    let pipeline = ConsumptionPipeline::new(
        Arc::new(broker.clone()),
        TOPIC,
        PanicOnceHandler { calls: AtomicUsize::new(0) },
        config(0),
    );

    assert!(matches!(
        pipeline.handle(delivery("1200-0", &[])).await,
        MessageOutcome::DeadLettered { .. }
    ));
    let dead = broker.published_to("Fibonacci-dlq");
    assert_eq!(dead[0].metadata["error-message"], "handler panicked: iteration table corrupted");
    assert_eq!(broker.acked(), ["1200-0"]);
}

/// Fails every job with the given iteration count
struct RejectingHandler {
    rejected: u32,
}

#[async_trait]
impl MessageHandler for RejectingHandler {
    type Payload = FibonacciData;

    async fn handle(&self, payload: FibonacciData) -> Result<(), HandlerError> {
        if payload.iterations == self.rejected {
            Err(HandlerError::new("upstream unavailable"))
        } else {
            Ok(())
        }
    }

    fn name(&self) -> &'static str {
        "RejectingHandler"
    }
}

#[tokio::test(start_paused = true)]
async fn retry_wait_only_suspends_its_own_message() {
    let broker = RecordingBroker::default();
    let pipeline = Arc::new(ConsumptionPipeline::new(
        Arc::new(broker.clone()),
        TOPIC,
        RejectingHandler { rejected: 7 },
        PipelineConfig::new().with_retry(RetryPolicy::new(3).with_retry_delay(Duration::from_secs(60))),
    ));
    let started = tokio::time::Instant::now();

    let failing = InboundMessage::new("1300-0", TOPIC, br#"{"iterations":7}"#.to_vec(), Metadata::new());
    let worker = Arc::clone(&pipeline);
    let waiting = tokio::spawn(async move { worker.handle(failing).await });
    tokio::task::yield_now().await;

    let worker = Arc::clone(&pipeline);
    let other = tokio::spawn(async move { worker.handle(delivery("1301-0", &[])).await });
    assert_eq!(other.await.unwrap(), MessageOutcome::Processed);

    assert!(started.elapsed() < Duration::from_secs(60));
    assert!(!waiting.is_finished());
    assert_eq!(broker.acked(), ["1301-0"]);

    assert!(matches!(waiting.await.unwrap(), MessageOutcome::RetryScheduled { attempt: 1, .. }));
    assert!(started.elapsed() >= Duration::from_secs(60));
    assert_eq!(broker.acked(), ["1301-0", "1300-0"]);
}

#[tokio::test]
async fn failed_delivery_is_not_acknowledged_until_retry_completes() {
    let broker = RecordingBroker::default();
    let pipeline = ConsumptionPipeline::new(
        Arc::new(broker.clone()),
        TOPIC,
        FlakyHandler::failing(1),
        config(3).with_retry(RetryPolicy::new(3).with_retry_delay(Duration::ZERO)),
    );

    let Delivery::RetryPending(retry) = pipeline.process(delivery("1400-0", &[])).await else {
        panic!("expected a pending retry");
    };
    assert_eq!(retry.attempt(), 1);
    assert_eq!(retry.message().id(), "1400-0");
    assert!(broker.acked().is_empty());
    assert!(broker.published_to(TOPIC).is_empty());

    assert!(matches!(
        pipeline.complete_retry(retry).await,
        MessageOutcome::RetryScheduled { attempt: 1, .. }
    ));
    assert_eq!(broker.acked(), ["1400-0"]);
    assert_eq!(broker.published_to(TOPIC).len(), 1);
}
