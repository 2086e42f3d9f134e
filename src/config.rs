//! Configuration for the Floodgate engine.
//!
//! Tier tables are plain data loaded from YAML (or built in code) and
//! validated once when a tier is registered; the admission path never
//! re-validates. There is no global default table: configuration is always
//! passed in explicitly.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{FloodgateError, Result};
use crate::limiter::KeyGenerator;
use crate::store::{LimitStore, MemoryStore, MemoryStoreConfig, RedisStore, RedisStoreConfig};

/// Admission algorithm selector.
///
/// A closed enum: an unsupported algorithm name fails at configuration
/// parse time, never on the admission path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    /// Bursts up to a capacity refilled at a constant rate.
    TokenBucket,
    /// Requests counted in a continuously moving interval ending at now.
    SlidingWindow,
    /// Requests counted in discrete buckets aligned to the window size.
    FixedWindow,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::TokenBucket => "token-bucket",
            Algorithm::SlidingWindow => "sliding-window",
            Algorithm::FixedWindow => "fixed-window",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for a single limit.
///
/// Immutable once attached to a tier. Window algorithms use `window_ms` +
/// `max_requests`; the token bucket uses `burst_size` + `refill_rate`.
#[derive(Clone, Serialize, Deserialize)]
pub struct LimitConfig {
    /// Which admission algorithm to run.
    pub algorithm: Algorithm,
    /// Window length in milliseconds (sliding and fixed window).
    #[serde(default)]
    pub window_ms: u64,
    /// Maximum total request weight per window (sliding and fixed window).
    #[serde(default)]
    pub max_requests: u64,
    /// Bucket capacity in tokens (token bucket).
    #[serde(default)]
    pub burst_size: u32,
    /// Refill rate in tokens per second (token bucket).
    #[serde(default)]
    pub refill_rate: f64,
    /// Custom store-key generator. Defaults to `"<identifier>:<endpoint>"`.
    #[serde(skip)]
    pub key_generator: Option<KeyGenerator>,
    /// On a store failure, admit the request instead of surfacing the error.
    /// Defaults to true; security-sensitive tiers opt out with
    /// [`LimitConfig::fail_closed`].
    #[serde(default = "default_skip_on_error")]
    pub skip_on_error: bool,
}

fn default_skip_on_error() -> bool {
    true
}

impl LimitConfig {
    /// A token bucket limit.
    pub fn token_bucket(burst_size: u32, refill_rate: f64) -> Self {
        Self {
            algorithm: Algorithm::TokenBucket,
            window_ms: 0,
            max_requests: 0,
            burst_size,
            refill_rate,
            key_generator: None,
            skip_on_error: true,
        }
    }

    /// A sliding window limit.
    pub fn sliding_window(window_ms: u64, max_requests: u64) -> Self {
        Self {
            algorithm: Algorithm::SlidingWindow,
            window_ms,
            max_requests,
            burst_size: 0,
            refill_rate: 0.0,
            key_generator: None,
            skip_on_error: true,
        }
    }

    /// A fixed window limit.
    pub fn fixed_window(window_ms: u64, max_requests: u64) -> Self {
        Self {
            algorithm: Algorithm::FixedWindow,
            window_ms,
            max_requests,
            burst_size: 0,
            refill_rate: 0.0,
            key_generator: None,
            skip_on_error: true,
        }
    }

    /// Use a custom store-key generator for this limit.
    pub fn with_key_generator(
        mut self,
        generator: impl Fn(&str, &str) -> String + Send + Sync + 'static,
    ) -> Self {
        self.key_generator = Some(Arc::new(generator));
        self
    }

    /// Propagate store failures instead of admitting the request. For tiers
    /// where letting traffic through on an infrastructure fault is worse
    /// than rejecting it.
    pub fn fail_closed(mut self) -> Self {
        self.skip_on_error = false;
        self
    }

    /// Check that every parameter the algorithm needs is present and sane.
    ///
    /// Called when a tier is registered; never on the admission path.
    pub fn validate(&self) -> Result<()> {
        match self.algorithm {
            Algorithm::TokenBucket => {
                if self.burst_size == 0 {
                    return Err(FloodgateError::Config(
                        "token-bucket requires burst_size > 0".to_string(),
                    ));
                }
                if !self.refill_rate.is_finite() || self.refill_rate <= 0.0 {
                    return Err(FloodgateError::Config(
                        "token-bucket requires refill_rate > 0".to_string(),
                    ));
                }
            }
            Algorithm::SlidingWindow | Algorithm::FixedWindow => {
                if self.window_ms == 0 {
                    return Err(FloodgateError::Config(format!(
                        "{} requires window_ms > 0",
                        self.algorithm
                    )));
                }
                if self.max_requests == 0 {
                    return Err(FloodgateError::Config(format!(
                        "{} requires max_requests > 0",
                        self.algorithm
                    )));
                }
            }
        }
        Ok(())
    }

    /// The nominal limit this configuration enforces, for headers and
    /// `remaining` math.
    pub fn limit(&self) -> u64 {
        match self.algorithm {
            Algorithm::TokenBucket => self.burst_size as u64,
            Algorithm::SlidingWindow | Algorithm::FixedWindow => self.max_requests,
        }
    }
}

impl fmt::Debug for LimitConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LimitConfig")
            .field("algorithm", &self.algorithm)
            .field("window_ms", &self.window_ms)
            .field("max_requests", &self.max_requests)
            .field("burst_size", &self.burst_size)
            .field("refill_rate", &self.refill_rate)
            .field(
                "key_generator",
                &self.key_generator.as_ref().map(|_| "<custom>"),
            )
            .field("skip_on_error", &self.skip_on_error)
            .finish()
    }
}

/// Store backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreSettings {
    /// Bounded in-process store.
    Memory {
        #[serde(default = "default_max_size")]
        max_size: usize,
        #[serde(default = "default_max_age_ms")]
        max_age_ms: u64,
        #[serde(default = "default_sweep_interval_ms")]
        sweep_interval_ms: u64,
    },
    /// Redis-backed store, shared across service instances.
    Redis {
        url: String,
        #[serde(default = "default_key_prefix")]
        key_prefix: String,
        #[serde(default = "default_op_timeout_ms")]
        op_timeout_ms: u64,
        #[serde(default = "default_max_reconnect_attempts")]
        max_reconnect_attempts: u32,
    },
}

impl Default for StoreSettings {
    fn default() -> Self {
        StoreSettings::Memory {
            max_size: default_max_size(),
            max_age_ms: default_max_age_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

fn default_max_size() -> usize {
    10_000
}

fn default_max_age_ms() -> u64 {
    600_000
}

fn default_sweep_interval_ms() -> u64 {
    60_000
}

fn default_key_prefix() -> String {
    "floodgate:".to_string()
}

fn default_op_timeout_ms() -> u64 {
    2_000
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

impl StoreSettings {
    /// Build the configured store.
    ///
    /// For the memory backend this also starts the background sweeper, so it
    /// must run inside a Tokio runtime.
    pub fn build(&self) -> Result<Arc<dyn LimitStore>> {
        match self {
            StoreSettings::Memory {
                max_size,
                max_age_ms,
                sweep_interval_ms,
            } => {
                let store = Arc::new(MemoryStore::with_config(MemoryStoreConfig {
                    max_size: *max_size,
                    max_age: Duration::from_millis(*max_age_ms),
                    sweep_interval: Duration::from_millis(*sweep_interval_ms),
                }));
                store.clone().start_sweeper();
                info!(max_size, "Built in-memory rate limit store");
                Ok(store)
            }
            StoreSettings::Redis {
                url,
                key_prefix,
                op_timeout_ms,
                max_reconnect_attempts,
            } => {
                let store = RedisStore::new(RedisStoreConfig {
                    url: url.clone(),
                    key_prefix: key_prefix.clone(),
                    op_timeout: Duration::from_millis(*op_timeout_ms),
                    max_reconnect_attempts: *max_reconnect_attempts,
                    ..Default::default()
                })?;
                info!(key_prefix = %key_prefix, "Built Redis rate limit store");
                Ok(Arc::new(store))
            }
        }
    }
}

/// Engine configuration: a store selection plus a named tier table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Which store backend the tiers share.
    #[serde(default)]
    pub store: StoreSettings,
    /// Named tier table: tier name to limit configuration.
    #[serde(default)]
    pub tiers: HashMap<String, LimitConfig>,
}

impl EngineConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string and validate every tier.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse config: {}", e)))?;

        for (name, tier) in &config.tiers {
            tier.validate().map_err(|e| match e {
                FloodgateError::Config(msg) => {
                    FloodgateError::Config(format!("Tier '{}': {}", name, msg))
                }
                other => other,
            })?;
        }
        Ok(config)
    }

    /// Merge an environment-level default tier table under this one.
    ///
    /// Tiers already present keep their startup configuration; only missing
    /// names are filled in. The store selection is never overridden.
    pub fn merge_defaults(&mut self, defaults: &EngineConfig) {
        for (name, tier) in &defaults.tiers {
            self.tiers
                .entry(name.clone())
                .or_insert_with(|| tier.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory_config() {
        let yaml = r#"
store:
  backend: memory
  max_size: 500
tiers:
  global:
    algorithm: fixed-window
    window_ms: 60000
    max_requests: 1000
  user:
    algorithm: token-bucket
    burst_size: 20
    refill_rate: 5.0
"#;
        let config = EngineConfig::from_yaml(yaml).unwrap();

        assert!(matches!(
            config.store,
            StoreSettings::Memory { max_size: 500, .. }
        ));
        assert_eq!(config.tiers.len(), 2);
        assert_eq!(config.tiers["global"].algorithm, Algorithm::FixedWindow);
        assert_eq!(config.tiers["user"].burst_size, 20);
    }

    #[test]
    fn test_parse_redis_config_with_defaults() {
        let yaml = r#"
store:
  backend: redis
  url: redis://cache.internal:6379
tiers:
  endpoint:
    algorithm: sliding-window
    window_ms: 1000
    max_requests: 50
  login:
    algorithm: fixed-window
    window_ms: 60000
    max_requests: 10
    skip_on_error: false
"#;
        let config = EngineConfig::from_yaml(yaml).unwrap();

        match &config.store {
            StoreSettings::Redis {
                url,
                key_prefix,
                op_timeout_ms,
                max_reconnect_attempts,
            } => {
                assert_eq!(url, "redis://cache.internal:6379");
                assert_eq!(key_prefix, "floodgate:");
                assert_eq!(*op_timeout_ms, 2_000);
                assert_eq!(*max_reconnect_attempts, 5);
            }
            other => panic!("Expected redis store, got {:?}", other),
        }
        // Fail-open unless a tier opts into fail-closed.
        assert!(config.tiers["endpoint"].skip_on_error);
        assert!(!config.tiers["login"].skip_on_error);
    }

    #[test]
    fn test_unsupported_algorithm_fails_at_parse() {
        let yaml = r#"
tiers:
  broken:
    algorithm: leaky-cauldron
    window_ms: 1000
    max_requests: 5
"#;
        let err = EngineConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, FloodgateError::Config(_)));
    }

    #[test]
    fn test_missing_parameters_fail_validation() {
        let yaml = r#"
tiers:
  broken:
    algorithm: sliding-window
    max_requests: 5
"#;
        let err = EngineConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("window_ms"));

        assert!(LimitConfig::token_bucket(0, 1.0).validate().is_err());
        assert!(LimitConfig::token_bucket(5, 0.0).validate().is_err());
        assert!(LimitConfig::token_bucket(5, f64::NAN).validate().is_err());
        assert!(LimitConfig::fixed_window(1000, 0).validate().is_err());
        assert!(LimitConfig::sliding_window(0, 5).validate().is_err());
        assert!(LimitConfig::token_bucket(5, 1.0).validate().is_ok());
    }

    #[test]
    fn test_merge_defaults_fills_only_missing_tiers() {
        let mut config = EngineConfig::default();
        config
            .tiers
            .insert("user".to_string(), LimitConfig::token_bucket(10, 1.0));

        let mut defaults = EngineConfig::default();
        defaults
            .tiers
            .insert("user".to_string(), LimitConfig::token_bucket(99, 9.0));
        defaults
            .tiers
            .insert("global".to_string(), LimitConfig::fixed_window(60_000, 1_000));

        config.merge_defaults(&defaults);

        assert_eq!(config.tiers.len(), 2);
        // Startup value wins over the environment default.
        assert_eq!(config.tiers["user"].burst_size, 10);
        assert_eq!(config.tiers["global"].max_requests, 1_000);
    }

    #[test]
    fn test_limit_accessor() {
        assert_eq!(LimitConfig::token_bucket(7, 1.0).limit(), 7);
        assert_eq!(LimitConfig::sliding_window(1000, 42).limit(), 42);
        assert_eq!(LimitConfig::fixed_window(1000, 13).limit(), 13);
    }
}
