//! Prometheus metrics for consumption pipelines
//!
//! Every exit path of the per-message state machine is counted, so duplicate
//! suppression, retry pressure and data loss are visible without reading logs.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::{info, warn};

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialize Prometheus metrics
///
/// Call this once at startup. Subsequent calls are no-ops. If another
/// recorder is already installed, metrics are not exported.
pub fn init_metrics() {
    let _ = PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
            warn!(error = %e, "Failed to install Prometheus recorder");
        })?;
        describe_metrics();
        info!("Prometheus metrics initialized");
        Ok::<_, ()>(handle)
    });
}

/// Get the Prometheus handle for rendering metrics
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

fn describe_metrics() {
    describe_counter!(
        "consumer_pipeline_messages_received_total",
        "Deliveries that entered the pipeline"
    );
    describe_counter!(
        "consumer_pipeline_duplicates_skipped_total",
        "Deliveries acknowledged without invoking the handler"
    );
    describe_counter!(
        "consumer_pipeline_messages_processed_total",
        "Handler invocations by outcome"
    );
    describe_counter!(
        "consumer_pipeline_retries_scheduled_total",
        "Messages republished for another attempt"
    );
    describe_counter!(
        "consumer_pipeline_dead_lettered_total",
        "Messages routed to the dead-letter topic"
    );
    describe_counter!(
        "consumer_pipeline_dead_letter_failures_total",
        "Messages lost because dead-letter routing failed or is disabled"
    );
    describe_counter!(
        "consumer_pipeline_ack_failures_total",
        "Acknowledgments rejected by the broker"
    );
    describe_histogram!(
        "consumer_pipeline_handler_duration_seconds",
        "Handler execution time"
    );
    describe_gauge!(
        "consumer_pipeline_dedup_store_size",
        "Keys held by the deduplication store"
    );
}

/// Pipeline metrics helper
#[derive(Clone)]
pub struct PipelineMetrics {
    /// Source topic for labeling
    topic: String,
    /// Handler name for labeling
    handler: String,
}

impl PipelineMetrics {
    pub fn new(topic: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            handler: handler.into(),
        }
    }

    pub fn message_received(&self) {
        counter!(
            "consumer_pipeline_messages_received_total",
            "topic" => self.topic.clone(),
            "handler" => self.handler.clone()
        )
        .increment(1);
    }

    pub fn duplicate_skipped(&self) {
        counter!(
            "consumer_pipeline_duplicates_skipped_total",
            "topic" => self.topic.clone(),
            "handler" => self.handler.clone()
        )
        .increment(1);
    }

    pub fn message_processed(&self, duration: Duration) {
        counter!(
            "consumer_pipeline_messages_processed_total",
            "topic" => self.topic.clone(),
            "handler" => self.handler.clone(),
            "status" => "success"
        )
        .increment(1);

        histogram!(
            "consumer_pipeline_handler_duration_seconds",
            "topic" => self.topic.clone(),
            "handler" => self.handler.clone()
        )
        .record(duration.as_secs_f64());
    }

    pub fn message_failed(&self, duration: Duration) {
        counter!(
            "consumer_pipeline_messages_processed_total",
            "topic" => self.topic.clone(),
            "handler" => self.handler.clone(),
            "status" => "failed"
        )
        .increment(1);

        histogram!(
            "consumer_pipeline_handler_duration_seconds",
            "topic" => self.topic.clone(),
            "handler" => self.handler.clone()
        )
        .record(duration.as_secs_f64());
    }

    pub fn retry_scheduled(&self, attempt: u32) {
        counter!(
            "consumer_pipeline_retries_scheduled_total",
            "topic" => self.topic.clone(),
            "handler" => self.handler.clone(),
            "attempt" => attempt.to_string()
        )
        .increment(1);
    }

    pub fn dead_lettered(&self) {
        counter!(
            "consumer_pipeline_dead_lettered_total",
            "topic" => self.topic.clone(),
            "handler" => self.handler.clone()
        )
        .increment(1);
    }

    /// `reason` is "disabled" or "publish_failed"
    pub fn dead_letter_failed(&self, reason: &'static str) {
        counter!(
            "consumer_pipeline_dead_letter_failures_total",
            "topic" => self.topic.clone(),
            "handler" => self.handler.clone(),
            "reason" => reason
        )
        .increment(1);
    }

    pub fn ack_failed(&self) {
        counter!(
            "consumer_pipeline_ack_failures_total",
            "topic" => self.topic.clone(),
            "handler" => self.handler.clone()
        )
        .increment(1);
    }

    pub fn dedup_store_size(&self, size: usize) {
        gauge!(
            "consumer_pipeline_dedup_store_size",
            "topic" => self.topic.clone()
        )
        .set(size as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = PipelineMetrics::new("Fibonacci", "FibonacciHandler");
        assert_eq!(metrics.topic, "Fibonacci");
        assert_eq!(metrics.handler, "FibonacciHandler");
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        let metrics = PipelineMetrics::new("Fibonacci", "FibonacciHandler");
        metrics.message_received();
        metrics.retry_scheduled(1);
        metrics.dead_letter_failed("disabled");
        metrics.dedup_store_size(3);
    }
}
