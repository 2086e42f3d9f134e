//! Storage backends for rate limit state.
//!
//! The engine reads and writes [`LimitEntry`] values through the [`LimitStore`]
//! trait, which abstracts over the bounded in-process store and the
//! Redis-backed store so the admission algorithms work against either.

mod memory;
mod redis;

pub use self::memory::{MemoryStore, MemoryStoreConfig};
pub use self::redis::{RedisStore, RedisStoreConfig};

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Hard cap on the sliding-window request log, independent of the configured
/// `max_requests`. Entries beyond the cap are evicted oldest-first even when
/// still inside the window.
pub const REQUEST_LOG_CAP: usize = 1000;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One admission recorded in a sliding-window log.
///
/// A weighted admission occupies a single slot; the in-window request count
/// is the sum of slot weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSlot {
    /// When the admission happened (epoch milliseconds).
    pub timestamp: u64,
    /// The admitted request's weight.
    pub weight: u32,
}

/// Rate limit state stored per key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitEntry {
    /// Number of admissions counted against this key.
    pub count: u64,
    /// Absolute instant (epoch milliseconds) at which the limit resets.
    pub reset_at: u64,
    /// Remaining tokens (token bucket only). Never exceeds the configured
    /// burst size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<f64>,
    /// Last refill instant in epoch milliseconds (token bucket only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_refill: Option<u64>,
    /// Ordered admission log (sliding window only), bounded by
    /// [`REQUEST_LOG_CAP`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_log: Option<Vec<LogSlot>>,
}

impl LimitEntry {
    /// Create an empty entry resetting at the given instant.
    pub fn new(reset_at: u64) -> Self {
        Self {
            count: 0,
            reset_at,
            tokens: None,
            last_refill: None,
            request_log: None,
        }
    }

    /// Approximate heap + inline footprint of this entry, used for store
    /// memory estimates.
    pub(crate) fn estimated_size(&self) -> usize {
        let log_bytes = self
            .request_log
            .as_ref()
            .map(|log| log.capacity() * std::mem::size_of::<LogSlot>())
            .unwrap_or(0);
        std::mem::size_of::<Self>() + log_bytes
    }
}

/// A snapshot of store health and operation counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreStats {
    /// Number of live keys (in-process store; backend-resident for Redis).
    pub total_keys: u64,
    /// Estimated memory footprint of stored entries in bytes.
    pub memory_bytes: u64,
    /// Reads that found a live entry.
    pub hits: u64,
    /// Reads that found nothing (or an expired entry).
    pub misses: u64,
    /// Fraction of reads that hit, in `[0, 1]`.
    pub hit_rate: f64,
    /// Fraction of reads that missed, in `[0, 1]`.
    pub miss_rate: f64,
    /// Total `get` operations.
    pub gets: u64,
    /// Total `set` operations.
    pub sets: u64,
    /// Total `delete` operations.
    pub deletes: u64,
    /// Total `increment` operations.
    pub increments: u64,
}

/// Atomic operation counters shared by store implementations.
///
/// Updated on every operation; reset only by explicit operator action via
/// [`LimitStore::reset_stats`].
#[derive(Debug, Default)]
pub(crate) struct StoreMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    gets: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    increments: AtomicU64,
}

impl StoreMetrics {
    pub fn record_get(&self, hit: bool) {
        self.gets.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_increment(&self) {
        self.increments.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.gets.store(0, Ordering::Relaxed);
        self.sets.store(0, Ordering::Relaxed);
        self.deletes.store(0, Ordering::Relaxed);
        self.increments.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self, total_keys: u64, memory_bytes: u64) -> StoreStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let reads = hits + misses;
        let (hit_rate, miss_rate) = if reads == 0 {
            (0.0, 0.0)
        } else {
            (hits as f64 / reads as f64, misses as f64 / reads as f64)
        };

        StoreStats {
            total_keys,
            memory_bytes,
            hits,
            misses,
            hit_rate,
            miss_rate,
            gets: self.gets.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            increments: self.increments.load(Ordering::Relaxed),
        }
    }
}

/// Trait for rate limit state stores.
///
/// This trait abstracts over the in-process [`MemoryStore`] and the
/// network-backed [`RedisStore`] so the admission algorithms and the tier
/// composer can work with either.
#[async_trait]
pub trait LimitStore: Send + Sync {
    /// Fetch the entry for a key. Never returns an expired entry; an expired
    /// entry is deleted lazily on read.
    async fn get(&self, key: &str) -> Result<Option<LimitEntry>>;

    /// Store an entry under a key, overwriting any existing value. With a
    /// `ttl`, the entry becomes unreachable after it elapses.
    async fn set(&self, key: &str, entry: LimitEntry, ttl: Option<Duration>) -> Result<()>;

    /// Atomically add `amount` to the counter at `key`, returning the new
    /// count. Concurrent callers observe a strictly increasing, gapless
    /// sequence. The `ttl` is attached only by the increment that creates
    /// the key.
    async fn increment(&self, key: &str, amount: u64, ttl: Option<Duration>) -> Result<u64>;

    /// Remove a key. Returns whether a live entry was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Whether a live (unexpired) entry exists for the key.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Sweep expired and idle entries. A no-op for backends with native
    /// expiry. Returns the number of entries removed.
    async fn cleanup(&self) -> Result<usize>;

    /// Stop any background work and release resources. Idempotent; the
    /// default is a no-op for backends without background tasks.
    async fn shutdown(&self) {}

    /// Snapshot of operation counters and size estimates.
    fn stats(&self) -> StoreStats;

    /// Zero all operation counters. Operator action; never called by the
    /// engine itself.
    fn reset_stats(&self);
}
