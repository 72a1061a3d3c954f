//! Pipeline configuration
//!
//! This module provides `PipelineConfig` and its three policies. Every field
//! is optional on the wire (camelCase keys) and falls back to its default.

use crate::message::keys;
use crate::retry::RetryPolicy;
use core_config::{env_or_default, env_parse, ConfigError};
use serde::Deserialize;
use std::time::Duration;

const DEFAULT_IDEMPOTENCY_TTL_MS: u64 = 3_600_000;
const DEFAULT_SWEEP_INTERVAL_MS: u64 = 300_000;

/// Dead-letter configuration (`deadLetter.*`)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeadLetterPolicy {
    pub enabled: bool,

    /// Destination topic; `<source-topic>-dlq` when unset
    pub topic: Option<String>,
}

impl DeadLetterPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            topic: None,
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Resolve the dead-letter topic for a source topic
    pub fn topic_for(&self, source_topic: &str) -> String {
        self.topic
            .clone()
            .unwrap_or_else(|| format!("{}-dlq", source_topic))
    }
}

impl Default for DeadLetterPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            topic: None,
        }
    }
}

/// Where deduplication records live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DedupBackend {
    /// Per-process map; deduplicates within one consumer only
    #[default]
    Memory,
    /// Redis keys shared by every consumer of the subscription
    Redis,
}

impl std::str::FromStr for DedupBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(DedupBackend::Memory),
            "redis" => Ok(DedupBackend::Redis),
            other => Err(format!("unknown dedup backend '{}'", other)),
        }
    }
}

/// Idempotency configuration (`idempotency.*`)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IdempotencyPolicy {
    pub enabled: bool,

    /// How long a key is remembered, in milliseconds
    pub ttl_ms: u64,

    /// Key on the broker message ID rather than a metadata property
    pub use_message_id: bool,

    /// Metadata property holding the business key
    #[serde(rename = "idempotencyKeyProperty")]
    pub key_property: String,

    /// Period of the expiry sweep for the in-memory store, in milliseconds
    pub sweep_interval_ms: u64,

    pub backend: DedupBackend,
}

impl IdempotencyPolicy {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_ms = ttl.as_millis().try_into().unwrap_or(u64::MAX);
        self
    }

    /// Key on a business key stored under `property` instead of the message ID
    pub fn with_key_property(mut self, property: impl Into<String>) -> Self {
        self.use_message_id = false;
        self.key_property = property.into();
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_ms = interval.as_millis().try_into().unwrap_or(u64::MAX);
        self
    }

    pub fn with_backend(mut self, backend: DedupBackend) -> Self {
        self.backend = backend;
        self
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

impl Default for IdempotencyPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_ms: DEFAULT_IDEMPOTENCY_TTL_MS,
            use_message_id: true,
            key_property: keys::DEFAULT_IDEMPOTENCY_KEY.to_string(),
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            backend: DedupBackend::Memory,
        }
    }
}

/// Configuration for one consumption pipeline
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineConfig {
    pub retry: RetryPolicy,
    pub dead_letter: DeadLetterPolicy,
    pub idempotency: IdempotencyPolicy,
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_dead_letter(mut self, dead_letter: DeadLetterPolicy) -> Self {
        self.dead_letter = dead_letter;
        self
    }

    pub fn with_idempotency(mut self, idempotency: IdempotencyPolicy) -> Self {
        self.idempotency = idempotency;
        self
    }

    /// Load configuration from `<PREFIX>_*` environment variables.
    ///
    /// Unset variables keep their defaults; unparsable ones are an error.
    pub fn from_env(prefix: &str) -> Result<Self, ConfigError> {
        Self::from_env_or(prefix, Self::default())
    }

    /// Like [`PipelineConfig::from_env`], with unset variables taken from `defaults`
    pub fn from_env_or(prefix: &str, defaults: Self) -> Result<Self, ConfigError> {
        let var = |name: &str| format!("{}_{}", prefix, name);

        let retry = RetryPolicy {
            max_retries: env_parse(&var("MAX_RETRIES"), defaults.retry.max_retries)?,
            retry_delay_ms: env_parse(&var("RETRY_DELAY_MS"), defaults.retry.retry_delay_ms)?,
            exponential: env_parse(&var("EXPONENTIAL_BACKOFF"), defaults.retry.exponential)?,
            max_delay_ms: match std::env::var(var("RETRY_MAX_DELAY_MS")) {
                Ok(_) => Some(env_parse(&var("RETRY_MAX_DELAY_MS"), 0u64)?),
                Err(_) => defaults.retry.max_delay_ms,
            },
        };

        let dlq_topic = env_or_default(&var("DLQ_TOPIC"), "");
        let dead_letter = DeadLetterPolicy {
            enabled: env_parse(&var("DLQ_ENABLED"), defaults.dead_letter.enabled)?,
            topic: if dlq_topic.is_empty() {
                defaults.dead_letter.topic.clone()
            } else {
                Some(dlq_topic)
            },
        };

        let idempotency = IdempotencyPolicy {
            enabled: env_parse(&var("IDEMPOTENCY_ENABLED"), defaults.idempotency.enabled)?,
            ttl_ms: env_parse(&var("IDEMPOTENCY_TTL_MS"), defaults.idempotency.ttl_ms)?,
            use_message_id: env_parse(
                &var("IDEMPOTENCY_USE_MESSAGE_ID"),
                defaults.idempotency.use_message_id,
            )?,
            key_property: env_or_default(
                &var("IDEMPOTENCY_KEY_PROPERTY"),
                &defaults.idempotency.key_property,
            ),
            sweep_interval_ms: env_parse(
                &var("IDEMPOTENCY_SWEEP_INTERVAL_MS"),
                defaults.idempotency.sweep_interval_ms,
            )?,
            backend: env_parse(&var("DEDUP_BACKEND"), defaults.idempotency.backend)?,
        };

        Ok(Self {
            retry,
            dead_letter,
            idempotency,
        })
    }
}
