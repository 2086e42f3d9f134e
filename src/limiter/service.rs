//! Core admission algorithms.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::config::{Algorithm, LimitConfig};
use crate::error::Result;
use crate::store::{LimitEntry, LimitStore, LogSlot, REQUEST_LOG_CAP};

use super::context::{default_store_key, RequestContext};
use super::decision::RateLimitDecision;

/// Admission service for a single limit.
///
/// Holds one validated [`LimitConfig`] and a shared store handle. All state
/// lives in the store; nothing is cached across checks.
pub struct RateLimitService {
    store: Arc<dyn LimitStore>,
    config: LimitConfig,
}

impl RateLimitService {
    /// Create a service, validating the configuration up front.
    pub fn new(store: Arc<dyn LimitStore>, config: LimitConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { store, config })
    }

    /// The limit configuration this service enforces.
    pub fn config(&self) -> &LimitConfig {
        &self.config
    }

    /// The store this service reads and writes.
    pub fn store(&self) -> &Arc<dyn LimitStore> {
        &self.store
    }

    /// The store key for a request.
    pub fn store_key(&self, ctx: &RequestContext) -> String {
        match &self.config.key_generator {
            Some(generator) => generator(&ctx.identifier, &ctx.endpoint),
            None => default_store_key(&ctx.identifier, &ctx.endpoint),
        }
    }

    /// Check one request against this limit.
    ///
    /// On a store failure, a limit configured with `skip_on_error` fails
    /// open and admits the request; otherwise the error propagates.
    pub async fn check(&self, ctx: &RequestContext) -> Result<RateLimitDecision> {
        let key = self.store_key(ctx);

        trace!(
            key = %key,
            weight = ctx.weight,
            algorithm = %self.config.algorithm,
            "Checking rate limit"
        );

        let result = match self.config.algorithm {
            Algorithm::TokenBucket => self.check_token_bucket(&key, ctx).await,
            Algorithm::SlidingWindow => self.check_sliding_window(&key, ctx).await,
            Algorithm::FixedWindow => self.check_fixed_window(&key, ctx).await,
        };

        match result {
            Ok(decision) => {
                if !decision.allowed {
                    debug!(
                        key = %key,
                        algorithm = %self.config.algorithm,
                        "Rate limit exceeded"
                    );
                }
                Ok(decision)
            }
            Err(e) if e.is_store_error() && self.config.skip_on_error => {
                warn!(key = %key, error = %e, "Store failure, failing open");
                Ok(self.fail_open_decision(ctx))
            }
            Err(e) => Err(e),
        }
    }

    /// Best-effort decision when the store is down and the limit fails open:
    /// the request is treated as unlimited for this call.
    fn fail_open_decision(&self, ctx: &RequestContext) -> RateLimitDecision {
        RateLimitDecision {
            allowed: true,
            remaining: self.config.limit(),
            limit: self.config.limit(),
            reset_at: ctx.timestamp_ms + self.config.window_ms,
            retry_after_secs: None,
            algorithm: self.config.algorithm,
        }
    }

    async fn check_token_bucket(
        &self,
        key: &str,
        ctx: &RequestContext,
    ) -> Result<RateLimitDecision> {
        let burst = self.config.burst_size as f64;
        let rate = self.config.refill_rate;

        let entry = self.store.get(key).await?;
        let (tokens, last_refill, admitted) = match &entry {
            Some(e) => (
                e.tokens.unwrap_or(burst),
                e.last_refill.unwrap_or(ctx.timestamp_ms),
                e.count,
            ),
            None => (burst, ctx.timestamp_ms, 0),
        };

        let elapsed_secs = ctx.timestamp_ms.saturating_sub(last_refill) as f64 / 1000.0;
        let mut tokens = (tokens + elapsed_secs * rate).min(burst);

        let weight = ctx.weight as f64;
        let allowed = tokens >= weight;
        if allowed {
            tokens -= weight;
        }

        // Instant at which a full token is next available.
        let reset_at = if tokens >= 1.0 {
            ctx.timestamp_ms
        } else {
            ctx.timestamp_ms + ((1.0 - tokens) / rate * 1000.0).ceil() as u64
        };

        let retry_after_secs = if allowed {
            None
        } else {
            Some(((weight - tokens) / rate).ceil() as u64)
        };

        let updated = LimitEntry {
            count: admitted + u64::from(allowed),
            reset_at,
            tokens: Some(tokens),
            last_refill: Some(ctx.timestamp_ms),
            request_log: None,
        };

        // Once the bucket would be full again, the entry carries no
        // information; let it expire then.
        let ttl_secs = ((burst - tokens) / rate).ceil().max(1.0);
        self.store
            .set(key, updated, Some(Duration::from_secs_f64(ttl_secs)))
            .await?;

        Ok(RateLimitDecision {
            allowed,
            remaining: tokens.floor() as u64,
            limit: self.config.limit(),
            reset_at,
            retry_after_secs,
            algorithm: Algorithm::TokenBucket,
        })
    }

    async fn check_sliding_window(
        &self,
        key: &str,
        ctx: &RequestContext,
    ) -> Result<RateLimitDecision> {
        let window = self.config.window_ms;
        let max = self.config.max_requests;

        let entry = self.store.get(key).await?;
        let mut log: Vec<LogSlot> = entry.and_then(|e| e.request_log).unwrap_or_default();

        // Slots at or before the window edge no longer count.
        let cutoff = ctx.timestamp_ms.saturating_sub(window);
        log.retain(|slot| slot.timestamp > cutoff);

        let current: u64 = log.iter().map(|slot| slot.weight as u64).sum();
        let allowed = max.saturating_sub(current) >= ctx.weight as u64;

        if allowed {
            log.push(LogSlot {
                timestamp: ctx.timestamp_ms,
                weight: ctx.weight,
            });
            // Bound memory regardless of max_requests: oldest slots go
            // first, even when still inside the window.
            if log.len() > REQUEST_LOG_CAP {
                let excess = log.len() - REQUEST_LOG_CAP;
                log.drain(..excess);
            }

            let count: u64 = log.iter().map(|slot| slot.weight as u64).sum();
            let oldest = log.first().map(|slot| slot.timestamp).unwrap_or(ctx.timestamp_ms);
            let reset_at = oldest + window;

            let updated = LimitEntry {
                count,
                reset_at,
                tokens: None,
                last_refill: None,
                request_log: Some(log),
            };
            self.store
                .set(key, updated, Some(Duration::from_millis(window)))
                .await?;

            return Ok(RateLimitDecision {
                allowed: true,
                remaining: max.saturating_sub(count),
                limit: max,
                reset_at,
                retry_after_secs: None,
                algorithm: Algorithm::SlidingWindow,
            });
        }

        // Denials are read-only: the pruned log is recomputed next check.
        let oldest = log.first().map(|slot| slot.timestamp).unwrap_or(ctx.timestamp_ms);
        let reset_at = oldest + window;
        let retry_after_ms = reset_at.saturating_sub(ctx.timestamp_ms);

        Ok(RateLimitDecision {
            allowed: false,
            remaining: max.saturating_sub(current),
            limit: max,
            reset_at,
            retry_after_secs: Some((retry_after_ms + 999) / 1000),
            algorithm: Algorithm::SlidingWindow,
        })
    }

    async fn check_fixed_window(
        &self,
        key: &str,
        ctx: &RequestContext,
    ) -> Result<RateLimitDecision> {
        let window = self.config.window_ms;
        let max = self.config.max_requests;

        // The window start is part of the key, so a new window starts a
        // fresh counter automatically.
        let window_start = (ctx.timestamp_ms / window) * window;
        let window_key = format!("{}:{}", key, window_start);

        let count = self
            .store
            .increment(&window_key, ctx.weight as u64, Some(Duration::from_millis(window)))
            .await?;

        let allowed = count <= max;
        let reset_at = window_start + window;
        let retry_after_secs = if allowed {
            None
        } else {
            let retry_after_ms = reset_at.saturating_sub(ctx.timestamp_ms);
            Some((retry_after_ms + 999) / 1000)
        };

        Ok(RateLimitDecision {
            allowed,
            remaining: max.saturating_sub(count),
            limit: max,
            reset_at,
            retry_after_secs,
            algorithm: Algorithm::FixedWindow,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FloodgateError;
    use crate::store::{MemoryStore, StoreStats};
    use async_trait::async_trait;

    const T0: u64 = 1_700_000_000_000;

    fn service(config: LimitConfig) -> RateLimitService {
        RateLimitService::new(Arc::new(MemoryStore::new()), config).unwrap()
    }

    fn ctx(ts: u64) -> RequestContext {
        RequestContext::new("user:1", "/login").at(ts)
    }

    #[tokio::test]
    async fn test_token_bucket_burst_then_denial() {
        let service = service(LimitConfig::token_bucket(5, 1.0));

        for expected_remaining in [4, 3, 2, 1, 0] {
            let decision = service.check(&ctx(T0)).await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
        }

        let decision = service.check(&ctx(T0)).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after_secs, Some(1));
        assert_eq!(decision.reset_at, T0 + 1_000);
    }

    #[tokio::test]
    async fn test_token_bucket_refills_over_time() {
        let service = service(LimitConfig::token_bucket(5, 1.0));

        for _ in 0..5 {
            assert!(service.check(&ctx(T0)).await.unwrap().allowed);
        }
        assert!(!service.check(&ctx(T0)).await.unwrap().allowed);

        // Two seconds later exactly two tokens are back.
        assert!(service.check(&ctx(T0 + 2_000)).await.unwrap().allowed);
        assert!(service.check(&ctx(T0 + 2_000)).await.unwrap().allowed);
        assert!(!service.check(&ctx(T0 + 2_000)).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_token_bucket_never_exceeds_burst() {
        let service = service(LimitConfig::token_bucket(5, 1.0));

        service.check(&ctx(T0)).await.unwrap();
        // A long idle period refills to the burst size, not beyond.
        let decision = service.check(&ctx(T0 + 3_600_000)).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 4);
    }

    #[tokio::test]
    async fn test_token_bucket_weighted_requests() {
        let service = service(LimitConfig::token_bucket(5, 1.0));

        let decision = service
            .check(&RequestContext::new("u", "e").with_weight(3).at(T0))
            .await
            .unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 2);

        let decision = service
            .check(&RequestContext::new("u", "e").with_weight(3).at(T0))
            .await
            .unwrap();
        assert!(!decision.allowed);
        // One more token needed at one token per second.
        assert_eq!(decision.retry_after_secs, Some(1));
    }

    #[tokio::test]
    async fn test_sliding_window_fills_then_denies() {
        let service = service(LimitConfig::sliding_window(60_000, 5));

        for expected_remaining in [4, 3, 2, 1, 0] {
            let decision = service.check(&ctx(T0)).await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
        }

        let decision = service.check(&ctx(T0)).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.reset_at, T0 + 60_000);
        assert_eq!(decision.retry_after_secs, Some(60));
    }

    #[tokio::test]
    async fn test_sliding_window_slides() {
        let service = service(LimitConfig::sliding_window(60_000, 5));

        for _ in 0..5 {
            assert!(service.check(&ctx(T0)).await.unwrap().allowed);
        }
        assert!(!service.check(&ctx(T0)).await.unwrap().allowed);

        // Past the first request's window the count drops and capacity is
        // back.
        let decision = service.check(&ctx(T0 + 60_001)).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 4);
    }

    #[tokio::test]
    async fn test_sliding_window_partial_slide() {
        let service = service(LimitConfig::sliding_window(60_000, 5));

        assert!(service.check(&ctx(T0)).await.unwrap().allowed);
        assert!(service.check(&ctx(T0 + 10_000)).await.unwrap().allowed);

        // Only the first request has left the window.
        let decision = service.check(&ctx(T0 + 60_001)).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 3);
        assert_eq!(decision.reset_at, T0 + 10_000 + 60_000);
    }

    #[tokio::test]
    async fn test_sliding_window_sums_weights() {
        let service = service(LimitConfig::sliding_window(60_000, 5));

        let heavy = |ts| RequestContext::new("u", "e").with_weight(2).at(ts);
        assert!(service.check(&heavy(T0)).await.unwrap().allowed);
        assert!(service.check(&heavy(T0)).await.unwrap().allowed);

        let decision = service.check(&heavy(T0)).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 1);
    }

    #[tokio::test]
    async fn test_sliding_window_log_is_capped() {
        let store = Arc::new(MemoryStore::new());
        let service = RateLimitService::new(
            store.clone(),
            LimitConfig::sliding_window(3_600_000, 5_000),
        )
        .unwrap();

        for i in 0..(REQUEST_LOG_CAP as u64 + 5) {
            service.check(&ctx(T0 + i)).await.unwrap();
        }

        let key = service.store_key(&ctx(T0));
        let entry = store.get(&key).await.unwrap().unwrap();
        assert_eq!(entry.request_log.unwrap().len(), REQUEST_LOG_CAP);
    }

    #[tokio::test]
    async fn test_fixed_window_counts_per_window() {
        let service = service(LimitConfig::fixed_window(60_000, 5));
        let window_start = (T0 / 60_000) * 60_000;

        for _ in 0..5 {
            let decision = service.check(&ctx(T0)).await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.reset_at, window_start + 60_000);
        }

        let decision = service.check(&ctx(T0)).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn test_fixed_window_resets_at_boundary() {
        let service = service(LimitConfig::fixed_window(60_000, 5));
        let window_start = (T0 / 60_000) * 60_000;

        for _ in 0..6 {
            service.check(&ctx(T0)).await.unwrap();
        }

        // A fresh counter in the next window, regardless of the prior
        // pattern.
        let next_window = window_start + 60_000;
        let decision = service.check(&ctx(next_window)).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 4);
        assert_eq!(decision.reset_at, next_window + 60_000);
    }

    #[tokio::test]
    async fn test_custom_key_generator() {
        let config = LimitConfig::token_bucket(5, 1.0)
            .with_key_generator(|id, _endpoint| format!("global:{}", id));
        let service = service(config);

        let key = service.store_key(&RequestContext::new("user:1", "/a"));
        assert_eq!(key, "global:user:1");
    }

    /// A store whose every operation fails.
    struct FailingStore;

    #[async_trait]
    impl LimitStore for FailingStore {
        async fn get(&self, _key: &str) -> Result<Option<LimitEntry>> {
            Err(FloodgateError::StoreOperation("read failed".into()))
        }
        async fn set(
            &self,
            _key: &str,
            _entry: LimitEntry,
            _ttl: Option<Duration>,
        ) -> Result<()> {
            Err(FloodgateError::StoreOperation("write failed".into()))
        }
        async fn increment(
            &self,
            _key: &str,
            _amount: u64,
            _ttl: Option<Duration>,
        ) -> Result<u64> {
            Err(FloodgateError::StoreOperation("increment failed".into()))
        }
        async fn delete(&self, _key: &str) -> Result<bool> {
            Err(FloodgateError::StoreOperation("delete failed".into()))
        }
        async fn exists(&self, _key: &str) -> Result<bool> {
            Err(FloodgateError::StoreOperation("exists failed".into()))
        }
        async fn cleanup(&self) -> Result<usize> {
            Ok(0)
        }
        fn stats(&self) -> StoreStats {
            crate::store::StoreMetrics::default().snapshot(0, 0)
        }
        fn reset_stats(&self) {}
    }

    #[tokio::test]
    async fn test_fails_open_by_default_on_store_failure() {
        let config = LimitConfig::fixed_window(60_000, 5);
        let service = RateLimitService::new(Arc::new(FailingStore), config).unwrap();

        let decision = service.check(&ctx(T0)).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 5);
        assert_eq!(decision.retry_after_secs, None);
    }

    #[tokio::test]
    async fn test_fail_closed_propagates_store_failure() {
        let config = LimitConfig::fixed_window(60_000, 5).fail_closed();
        let service = RateLimitService::new(Arc::new(FailingStore), config).unwrap();

        let err = service.check(&ctx(T0)).await.unwrap_err();
        assert!(err.is_store_error());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_at_construction() {
        let result = RateLimitService::new(
            Arc::new(MemoryStore::new()),
            LimitConfig::token_bucket(0, 1.0),
        );
        assert!(matches!(result, Err(FloodgateError::Config(_))));
    }
}
