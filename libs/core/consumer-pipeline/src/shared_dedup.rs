//! Redis-backed deduplication store
//!
//! Shares dedup records across every consumer of a subscription. Each key is
//! a Redis string with a PX expiry, so the TTL is enforced by Redis itself.
//!
//! Redis failures fail open: `check_and_set` admits the message and logs a
//! warning, trading a possible duplicate for never stalling the pipeline.

use crate::dedup::DedupStore;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisResult};
use std::time::Duration;
use tracing::{debug, warn};

const SCAN_BATCH: usize = 500;

/// Deduplication store shared through Redis
#[derive(Clone)]
pub struct RedisDedupStore {
    redis: ConnectionManager,
    prefix: String,
    ttl: Duration,
}

impl RedisDedupStore {
    /// Create a store whose keys live under `<prefix>:`
    pub fn new(redis: ConnectionManager, prefix: impl Into<String>, ttl: Duration) -> Self {
        Self {
            redis,
            prefix: prefix.into(),
            ttl,
        }
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }

    fn ttl_ms(&self) -> u64 {
        self.ttl.as_millis().try_into().unwrap_or(u64::MAX).max(1)
    }

    async fn scan_keys(&self) -> RedisResult<Vec<String>> {
        let mut conn = self.redis.clone();
        let pattern = format!("{}:*", self.prefix);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(keys)
    }
}

#[async_trait]
impl DedupStore for RedisDedupStore {
    async fn check_and_set(&self, key: &str) -> bool {
        let mut conn = self.redis.clone();
        // SET NX returns nil when the key already exists
        let result: RedisResult<Option<String>> = redis::cmd("SET")
            .arg(self.redis_key(key))
            .arg(chrono::Utc::now().timestamp_millis())
            .arg("NX")
            .arg("PX")
            .arg(self.ttl_ms())
            .query_async(&mut conn)
            .await;

        match result {
            Ok(Some(_)) => true,
            Ok(None) => {
                debug!(key = %key, "Duplicate message detected");
                false
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Dedup check failed, admitting message");
                true
            }
        }
    }

    async fn mark_processed(&self, key: &str) {
        let mut conn = self.redis.clone();
        let result: RedisResult<()> = redis::cmd("SET")
            .arg(self.redis_key(key))
            .arg(chrono::Utc::now().timestamp_millis())
            .arg("PX")
            .arg(self.ttl_ms())
            .query_async(&mut conn)
            .await;

        if let Err(e) = result {
            warn!(key = %key, error = %e, "Failed to mark message as processed");
        }
    }

    async fn has_been_processed(&self, key: &str) -> bool {
        let mut conn = self.redis.clone();
        match conn.exists::<_, bool>(self.redis_key(key)).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!(key = %key, error = %e, "Dedup lookup failed");
                false
            }
        }
    }

    async fn remove(&self, key: &str) {
        let mut conn = self.redis.clone();
        if let Err(e) = conn.del::<_, i64>(self.redis_key(key)).await {
            warn!(key = %key, error = %e, "Failed to remove dedup key");
        }
    }

    async fn clear(&self) {
        let keys = match self.scan_keys().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(prefix = %self.prefix, error = %e, "Failed to scan dedup keys");
                return;
            }
        };

        let mut conn = self.redis.clone();
        for chunk in keys.chunks(SCAN_BATCH) {
            if let Err(e) = conn.del::<_, i64>(chunk).await {
                warn!(prefix = %self.prefix, error = %e, "Failed to delete dedup keys");
                return;
            }
        }
        warn!(prefix = %self.prefix, removed = keys.len(), "Deduplication store cleared");
    }

    async fn size(&self) -> usize {
        match self.scan_keys().await {
            Ok(keys) => keys.len(),
            Err(e) => {
                warn!(prefix = %self.prefix, error = %e, "Failed to count dedup keys");
                0
            }
        }
    }
}
