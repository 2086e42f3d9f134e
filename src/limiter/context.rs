//! Request context and store-key generation.

use std::fmt;
use std::sync::Arc;

use crate::store::now_millis;

/// Pluggable store-key generator: `(identifier, endpoint) -> key`.
pub type KeyGenerator = Arc<dyn Fn(&str, &str) -> String + Send + Sync>;

/// Default store key: `"<identifier>:<endpoint>"`.
pub fn default_store_key(identifier: &str, endpoint: &str) -> String {
    format!("{}:{}", identifier, endpoint)
}

/// Everything the engine needs to know about one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// Caller key, e.g. a user id or client IP.
    pub identifier: String,
    /// Logical route being called.
    pub endpoint: String,
    /// Cost of this request against the limit.
    pub weight: u32,
    /// When the request arrived (epoch milliseconds). Defaults to the wall
    /// clock; tests pass explicit values to simulate time.
    pub timestamp_ms: u64,
}

impl RequestContext {
    /// Create a context with weight 1 and the current wall-clock timestamp.
    pub fn new(identifier: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            endpoint: endpoint.into(),
            weight: 1,
            timestamp_ms: now_millis(),
        }
    }

    /// Set the request weight.
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Pin the request to an explicit timestamp.
    pub fn at(mut self, timestamp_ms: u64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }
}

impl fmt::Display for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.identifier, self.endpoint)
    }
}
