//! Deduplication store
//!
//! TTL-bounded record of dedup keys that have already been admitted for
//! processing. `check_and_set` is the only call on the consumer hot path and
//! is atomic: two concurrent deliveries of the same key can never both be
//! admitted.
//!
//! TTL is a soft bound. Expired entries are removed by a periodic sweep, so an
//! entry may outlive its TTL by up to one sweep interval.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Contract shared by the in-process and the Redis-backed store.
///
/// None of these operations fail; an absent key is a normal outcome.
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Insert `key` if absent. Returns `true` if the caller should process the message.
    async fn check_and_set(&self, key: &str) -> bool;

    /// Insert or refresh `key` unconditionally
    async fn mark_processed(&self, key: &str);

    /// Presence test without side effects
    async fn has_been_processed(&self, key: &str) -> bool;

    async fn remove(&self, key: &str);

    /// Drop every record. Operational recovery only.
    async fn clear(&self);

    async fn size(&self) -> usize;

    /// Stop background work owned by the store
    fn shutdown(&self) {}
}

type Entries = Mutex<HashMap<String, Instant>>;

fn lock(entries: &Entries) -> MutexGuard<'_, HashMap<String, Instant>> {
    entries.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-process deduplication store
pub struct InMemoryDedupStore {
    entries: Arc<Entries>,
    ttl: Duration,
    sweeper_stop: Option<watch::Sender<bool>>,
}

impl InMemoryDedupStore {
    /// Create a store without a background sweep; call [`sweep_expired`](Self::sweep_expired) yourself.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            ttl,
            sweeper_stop: None,
        }
    }

    /// Create a store that sweeps expired entries every `sweep_interval`.
    ///
    /// The sweep runs on the current tokio runtime and stops when the store
    /// is shut down or dropped. Outside a runtime no sweep is started.
    pub fn with_sweeper(ttl: Duration, sweep_interval: Duration) -> Self {
        let mut store = Self::new(ttl);

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No tokio runtime available, deduplication sweep disabled");
            return store;
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        runtime.spawn(sweep_loop(
            Arc::downgrade(&store.entries),
            ttl,
            sweep_interval,
            stop_rx,
        ));
        store.sweeper_stop = Some(stop_tx);

        debug!(
            ttl_ms = ttl.as_millis() as u64,
            sweep_interval_ms = sweep_interval.as_millis() as u64,
            "Deduplication sweep started"
        );
        store
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn check_and_set(&self, key: &str) -> bool {
        let mut entries = lock(&self.entries);
        if entries.contains_key(key) {
            debug!(key = %key, "Duplicate message detected");
            return false;
        }
        entries.insert(key.to_string(), Instant::now());
        true
    }

    pub fn mark_processed(&self, key: &str) {
        lock(&self.entries).insert(key.to_string(), Instant::now());
    }

    pub fn has_been_processed(&self, key: &str) -> bool {
        lock(&self.entries).contains_key(key)
    }

    pub fn remove(&self, key: &str) {
        lock(&self.entries).remove(key);
    }

    pub fn clear(&self) {
        let removed = {
            let mut entries = lock(&self.entries);
            let count = entries.len();
            entries.clear();
            count
        };
        warn!(removed = removed, "Deduplication store cleared");
    }

    pub fn size(&self) -> usize {
        lock(&self.entries).len()
    }

    /// Remove every entry older than the TTL. Returns the number removed.
    pub fn sweep_expired(&self) -> usize {
        sweep(&self.entries, self.ttl)
    }

    pub fn stop_sweeper(&self) {
        if let Some(stop) = &self.sweeper_stop {
            let _ = stop.send(true);
        }
    }
}

impl Drop for InMemoryDedupStore {
    fn drop(&mut self) {
        self.stop_sweeper();
    }
}

fn sweep(entries: &Entries, ttl: Duration) -> usize {
    let now = Instant::now();
    let mut entries = lock(entries);
    let before = entries.len();
    entries.retain(|_, first_seen| now.saturating_duration_since(*first_seen) <= ttl);
    let removed = before - entries.len();

    if removed > 0 {
        debug!(removed = removed, remaining = entries.len(), "Cleaned up expired deduplication entries");
    }
    removed
}

async fn sweep_loop(
    entries: Weak<Entries>,
    ttl: Duration,
    period: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(entries) = entries.upgrade() else { break };
                sweep(&entries, ttl);
            }
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }

    info!("Deduplication sweep stopped");
}

#[async_trait]
impl DedupStore for InMemoryDedupStore {
    async fn check_and_set(&self, key: &str) -> bool {
        InMemoryDedupStore::check_and_set(self, key)
    }

    async fn mark_processed(&self, key: &str) {
        InMemoryDedupStore::mark_processed(self, key)
    }

    async fn has_been_processed(&self, key: &str) -> bool {
        InMemoryDedupStore::has_been_processed(self, key)
    }

    async fn remove(&self, key: &str) {
        InMemoryDedupStore::remove(self, key)
    }

    async fn clear(&self) {
        InMemoryDedupStore::clear(self)
    }

    async fn size(&self) -> usize {
        InMemoryDedupStore::size(self)
    }

    fn shutdown(&self) {
        self.stop_sweeper();
    }
}
