//! Bounded in-process store with TTL and LRU eviction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Result;

use super::{now_millis, LimitEntry, LimitStore, StoreMetrics, StoreStats};

/// Configuration for the in-process store.
#[derive(Debug, Clone)]
pub struct MemoryStoreConfig {
    /// Maximum number of keys held at once. At capacity, the
    /// least-recently-accessed 10% of entries are evicted before a new key
    /// is inserted.
    pub max_size: usize,
    /// Entries unread for longer than this are reclaimed by the sweeper.
    pub max_age: Duration,
    /// How often the background sweeper runs.
    pub sweep_interval: Duration,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            max_size: 10_000,
            max_age: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// A stored entry plus the bookkeeping the store needs around it.
#[derive(Debug, Clone)]
struct Stored {
    entry: LimitEntry,
    /// Absolute expiry instant (epoch ms), if a TTL was attached.
    expires_at: Option<u64>,
    /// Last read instant (epoch ms), for idle reclamation.
    last_access: u64,
    /// Monotonic access sequence, for LRU ordering. Wall-clock milliseconds
    /// are too coarse to order accesses within the same tick.
    touched: u64,
}

impl Stored {
    fn is_expired(&self, now: u64) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }
}

/// Handle to the background sweeper task.
struct Sweeper {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Bounded in-process rate limit store.
///
/// Entries live in a sharded concurrent map; per-key read-modify-write is
/// serialized by the map's shard locks. Expiry is a lazy check on read plus
/// a periodic sweep, and the store is bounded by `max_size` with
/// least-recently-accessed eviction.
///
/// Reads return owned copies, so callers can never mutate stored state.
pub struct MemoryStore {
    entries: DashMap<String, Stored>,
    config: MemoryStoreConfig,
    metrics: StoreMetrics,
    access_seq: AtomicU64,
    sweeper: Mutex<Option<Sweeper>>,
}

impl MemoryStore {
    /// Create a store with default configuration.
    pub fn new() -> Self {
        Self::with_config(MemoryStoreConfig::default())
    }

    /// Create a store with the given configuration.
    pub fn with_config(config: MemoryStoreConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
            metrics: StoreMetrics::default(),
            access_seq: AtomicU64::new(0),
            sweeper: Mutex::new(None),
        }
    }

    /// Start the background sweeper.
    ///
    /// The sweeper runs [`LimitStore::cleanup`] every `sweep_interval`. It
    /// holds only a weak reference to the store, so dropping the store also
    /// ends the task. Calling this twice is a no-op.
    pub fn start_sweeper(self: Arc<Self>) {
        let mut guard = self.sweeper.lock();
        if guard.is_some() {
            return;
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let store: Weak<Self> = Arc::downgrade(&self);
        let interval = self.config.sweep_interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(store) = store.upgrade() else {
                            break;
                        };
                        if let Err(e) = store.cleanup().await {
                            warn!(error = %e, "Sweep failed");
                        }
                    }
                    _ = stop_rx.changed() => {
                        break;
                    }
                }
            }
        });

        *guard = Some(Sweeper {
            stop: stop_tx,
            task,
        });
        debug!(interval_ms = interval.as_millis() as u64, "Started store sweeper");
    }

    fn next_seq(&self) -> u64 {
        self.access_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Make room for one new key by evicting the least-recently-accessed
    /// 10% of entries.
    fn evict_lru(&self) {
        let evict_count = (self.config.max_size / 10).max(1);

        let mut by_access: Vec<(String, u64)> = self
            .entries
            .iter()
            .map(|r| (r.key().clone(), r.value().touched))
            .collect();
        by_access.sort_by_key(|(_, touched)| *touched);

        let mut evicted = 0usize;
        for (key, _) in by_access.into_iter().take(evict_count) {
            if self.entries.remove(&key).is_some() {
                evicted += 1;
            }
        }

        debug!(evicted, "Evicted least-recently-used entries at capacity");
    }

    /// Evict before inserting `key` if the store is at capacity.
    fn make_room_for(&self, key: &str) {
        if self.entries.len() >= self.config.max_size && !self.entries.contains_key(key) {
            self.evict_lru();
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LimitStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<LimitEntry>> {
        let now = now_millis();

        let expired = match self.entries.get_mut(key) {
            Some(mut stored) => {
                if stored.is_expired(now) {
                    true
                } else {
                    stored.last_access = now;
                    stored.touched = self.next_seq();
                    let entry = stored.entry.clone();
                    self.metrics.record_get(true);
                    return Ok(Some(entry));
                }
            }
            None => {
                self.metrics.record_get(false);
                return Ok(None);
            }
        };

        // Lazy expiry: the guard must be dropped before removal.
        if expired {
            self.entries.remove(key);
        }
        self.metrics.record_get(false);
        Ok(None)
    }

    async fn set(&self, key: &str, entry: LimitEntry, ttl: Option<Duration>) -> Result<()> {
        let now = now_millis();
        self.make_room_for(key);

        let stored = Stored {
            entry,
            expires_at: ttl.map(|ttl| now + ttl.as_millis() as u64),
            last_access: now,
            touched: self.next_seq(),
        };
        self.entries.insert(key.to_string(), stored);
        self.metrics.record_set();
        Ok(())
    }

    async fn increment(&self, key: &str, amount: u64, ttl: Option<Duration>) -> Result<u64> {
        let now = now_millis();
        self.make_room_for(key);
        let touched = self.next_seq();

        // The shard lock held by the entry guard serializes the
        // read-modify-write against concurrent increments on the same key.
        let mut slot = self.entries.entry(key.to_string()).or_insert_with(|| {
            let expires_at = ttl.map(|ttl| now + ttl.as_millis() as u64);
            Stored {
                entry: LimitEntry::new(expires_at.unwrap_or(0)),
                expires_at,
                last_access: now,
                touched,
            }
        });

        // An expired entry restarts the sequence, re-attaching the TTL as if
        // the key were newly created.
        if slot.is_expired(now) {
            let expires_at = ttl.map(|ttl| now + ttl.as_millis() as u64);
            slot.entry = LimitEntry::new(expires_at.unwrap_or(0));
            slot.expires_at = expires_at;
        }

        slot.entry.count += amount;
        slot.last_access = now;
        slot.touched = touched;
        let count = slot.entry.count;
        drop(slot);

        self.metrics.record_increment();
        Ok(count)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = now_millis();
        let removed = self
            .entries
            .remove(key)
            .map(|(_, stored)| !stored.is_expired(now))
            .unwrap_or(false);
        self.metrics.record_delete();
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let now = now_millis();
        Ok(self
            .entries
            .get(key)
            .map(|stored| !stored.is_expired(now))
            .unwrap_or(false))
    }

    async fn cleanup(&self) -> Result<usize> {
        let now = now_millis();
        let max_age_ms = self.config.max_age.as_millis() as u64;

        let dead: Vec<String> = self
            .entries
            .iter()
            .filter(|r| {
                let stored = r.value();
                stored.is_expired(now)
                    || (stored.entry.reset_at > 0 && now >= stored.entry.reset_at)
                    || now.saturating_sub(stored.last_access) > max_age_ms
            })
            .map(|r| r.key().clone())
            .collect();

        let mut removed = 0usize;
        for key in dead {
            if self.entries.remove(&key).is_some() {
                removed += 1;
            }
        }

        if removed > 0 {
            debug!(removed, "Swept expired rate limit entries");
        }
        Ok(removed)
    }

    /// Stop the background sweeper and wait for it to exit.
    ///
    /// Idempotent; a no-op if the sweeper was never started.
    async fn shutdown(&self) {
        let sweeper = self.sweeper.lock().take();
        if let Some(Sweeper { stop, task }) = sweeper {
            let _ = stop.send(true);
            let _ = task.await;
            debug!("Store sweeper stopped");
        }
    }

    fn stats(&self) -> StoreStats {
        let memory_bytes: usize = self
            .entries
            .iter()
            .map(|r| r.key().len() + r.value().entry.estimated_size())
            .sum();
        self.metrics
            .snapshot(self.entries.len() as u64, memory_bytes as u64)
    }

    fn reset_stats(&self) {
        self.metrics.reset();
    }
}
