//! Redis-backed store for cross-instance rate limiting.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{FloodgateError, Result};

use super::{LimitEntry, LimitStore, StoreMetrics, StoreStats};

/// Ceiling on the reconnect backoff delay.
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Configuration for the Redis-backed store.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Redis connection URL, e.g. `redis://127.0.0.1:6379`.
    pub url: String,
    /// Namespace prefix applied to every key.
    pub key_prefix: String,
    /// Bound on each individual operation, connection attempts included.
    pub op_timeout: Duration,
    /// How many connection attempts to make before giving up.
    pub max_reconnect_attempts: u32,
    /// Base delay for exponential reconnect backoff.
    pub backoff_base: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "floodgate:".to_string(),
            op_timeout: Duration::from_secs(2),
            max_reconnect_attempts: 5,
            backoff_base: Duration::from_millis(100),
        }
    }
}

/// Exponential backoff delay for the given attempt (1-based), capped at
/// [`MAX_RECONNECT_DELAY`].
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent).min(MAX_RECONNECT_DELAY)
}

/// Network-backed rate limit store.
///
/// All keys live under a configurable prefix, entries are serialized as JSON,
/// and expiry is native (`PEXPIRE`). The connection is established lazily on
/// first use and re-established with bounded exponential backoff after a
/// failure. Atomicity across instances comes from the backend's `INCRBY`, so
/// no local locking is required.
///
/// Read failures are absorbed: `get` and `exists` report absent rather than
/// erroring. Write failures propagate to the caller, where the tier's
/// `skip_on_error` policy decides between fail-open and fail-closed.
pub struct RedisStore {
    client: redis::Client,
    conn: Mutex<Option<MultiplexedConnection>>,
    config: RedisStoreConfig,
    metrics: StoreMetrics,
}

impl RedisStore {
    /// Create a store for the given configuration.
    ///
    /// No connection is made here; the first operation connects.
    pub fn new(config: RedisStoreConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| FloodgateError::Config(format!("Invalid Redis URL: {}", e)))?;

        Ok(Self {
            client,
            conn: Mutex::new(None),
            config,
            metrics: StoreMetrics::default(),
        })
    }

    /// Create a store with default settings for the given URL.
    pub fn with_url(url: &str) -> Result<Self> {
        Self::new(RedisStoreConfig {
            url: url.to_string(),
            ..Default::default()
        })
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    /// Get the cached connection, or connect with bounded backoff.
    async fn connection(&self) -> Result<MultiplexedConnection> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let mut attempt = 1u32;
        loop {
            let connect = self.client.get_multiplexed_tokio_connection();
            match tokio::time::timeout(self.config.op_timeout, connect).await {
                Ok(Ok(conn)) => {
                    info!(url = %self.config.url, "Connected to Redis");
                    *guard = Some(conn.clone());
                    return Ok(conn);
                }
                Ok(Err(e)) if attempt < self.config.max_reconnect_attempts => {
                    let delay = jittered(backoff_delay(self.config.backoff_base, attempt));
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Redis connection failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Ok(Err(e)) => {
                    return Err(FloodgateError::StoreConnection(format!(
                        "Redis unreachable after {} attempts: {}",
                        attempt, e
                    )));
                }
                Err(_) if attempt < self.config.max_reconnect_attempts => {
                    let delay = jittered(backoff_delay(self.config.backoff_base, attempt));
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Redis connection attempt timed out, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(_) => {
                    return Err(FloodgateError::StoreConnection(format!(
                        "Redis unreachable after {} attempts: connect timed out",
                        attempt
                    )));
                }
            }
        }
    }

    /// Drop the cached connection so the next operation reconnects.
    async fn invalidate(&self) {
        *self.conn.lock().await = None;
    }

    /// Run a store operation under the configured timeout. A timeout behaves
    /// exactly like a connection failure.
    async fn bounded<T, F>(&self, op: F) -> Result<T>
    where
        F: std::future::Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.config.op_timeout, op).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                self.invalidate().await;
                Err(e.into())
            }
            Err(_) => {
                self.invalidate().await;
                Err(FloodgateError::StoreConnection(
                    "Redis operation timed out".to_string(),
                ))
            }
        }
    }

    async fn try_get(&self, key: &str) -> Result<Option<LimitEntry>> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = self.bounded(conn.get(key)).await?;
        match raw {
            None => Ok(None),
            Some(json) => serde_json::from_str(&json).map(Some).map_err(|e| {
                FloodgateError::StoreOperation(format!("Corrupt entry at {}: {}", key, e))
            }),
        }
    }

    /// Ping the backend and report reachability.
    pub async fn health_check(&self) -> bool {
        let mut conn = match self.connection().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "Redis health check failed to connect");
                return false;
            }
        };

        let pong: Result<String> = self.bounded(redis::cmd("PING").query_async(&mut conn)).await;
        match pong {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "Redis health check failed");
                false
            }
        }
    }
}

fn jittered(delay: Duration) -> Duration {
    let jitter_ceiling = (delay.as_millis() as u64 / 4).max(1);
    let jitter = rand::thread_rng().gen_range(0..jitter_ceiling);
    delay + Duration::from_millis(jitter)
}

#[async_trait]
impl LimitStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<LimitEntry>> {
        let key = self.namespaced(key);
        match self.try_get(&key).await {
            Ok(entry) => {
                self.metrics.record_get(entry.is_some());
                Ok(entry)
            }
            Err(e) => {
                // Reads never fail the admission path; absent is the
                // conservative answer.
                warn!(key = %key, error = %e, "Redis get failed, treating as absent");
                self.metrics.record_get(false);
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, entry: LimitEntry, ttl: Option<Duration>) -> Result<()> {
        let key = self.namespaced(key);
        let json = serde_json::to_string(&entry)
            .map_err(|e| FloodgateError::StoreOperation(format!("Serialize failed: {}", e)))?;

        let mut conn = self.connection().await?;
        match ttl {
            Some(ttl) => {
                let mut pipe = redis::pipe();
                pipe.atomic()
                    .set(&key, &json)
                    .ignore()
                    .pexpire(&key, ttl.as_millis() as i64)
                    .ignore();
                let _: () = self.bounded(pipe.query_async(&mut conn)).await?;
            }
            None => {
                let _: () = self.bounded(conn.set(&key, &json)).await?;
            }
        }

        self.metrics.record_set();
        Ok(())
    }

    async fn increment(&self, key: &str, amount: u64, ttl: Option<Duration>) -> Result<u64> {
        let key = self.namespaced(key);
        let mut conn = self.connection().await?;

        let count: u64 = self.bounded(conn.incr(&key, amount)).await?;

        // First increment created the key; attach the window TTL.
        if count == amount {
            if let Some(ttl) = ttl {
                let _: i64 = self
                    .bounded(conn.pexpire(&key, ttl.as_millis() as i64))
                    .await?;
            }
        }

        self.metrics.record_increment();
        debug!(key = %key, count, "Incremented counter");
        Ok(count)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let key = self.namespaced(key);
        let mut conn = self.connection().await?;
        let removed: i64 = self.bounded(conn.del(&key)).await?;
        self.metrics.record_delete();
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let key = self.namespaced(key);
        let mut conn = match self.connection().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(key = %key, error = %e, "Redis exists failed, treating as absent");
                return Ok(false);
            }
        };

        match self.bounded(conn.exists(&key)).await {
            Ok(exists) => Ok(exists),
            Err(e) => {
                warn!(key = %key, error = %e, "Redis exists failed, treating as absent");
                Ok(false)
            }
        }
    }

    async fn cleanup(&self) -> Result<usize> {
        // Expiry is native; nothing to sweep.
        Ok(0)
    }

    fn stats(&self) -> StoreStats {
        // Key counts and memory live in the backend; only local operation
        // counters are reported here.
        self.metrics.snapshot(0, 0)
    }

    fn reset_stats(&self) {
        self.metrics.reset();
    }
}
