//! Admission decisions and response-header rendering.

use std::collections::HashMap;

use serde::Serialize;

use crate::config::Algorithm;

/// The outcome of checking one request against one limit.
///
/// Constructed fresh on every check and never mutated afterwards; callers
/// hold it only long enough to build a response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitDecision {
    /// Whether the request is admitted.
    pub allowed: bool,
    /// Capacity left after this request (floored for token buckets).
    pub remaining: u64,
    /// The configured limit (burst size or max requests).
    pub limit: u64,
    /// Absolute instant (epoch milliseconds) at which capacity returns.
    pub reset_at: u64,
    /// Seconds to wait before retrying. Present only when denied.
    pub retry_after_secs: Option<u64>,
    /// Which algorithm produced this decision.
    pub algorithm: Algorithm,
}

impl RateLimitDecision {
    /// Render the standard rate limit response headers.
    ///
    /// `X-RateLimit-Reset` is in unix seconds; `X-RateLimit-RetryAfter`
    /// appears only on denials.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", (self.reset_at / 1000).to_string()),
            ("X-RateLimit-Algorithm", self.algorithm.to_string()),
        ];
        if let Some(retry_after) = self.retry_after_secs {
            headers.push(("X-RateLimit-RetryAfter", retry_after.to_string()));
        }
        headers
    }
}

/// The aggregate outcome of checking one request against several tiers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TieredDecision {
    /// Logical AND over all evaluated tiers.
    pub allowed: bool,
    /// Per-tier results, keyed by tier name. Unknown tiers are omitted.
    pub tiers: HashMap<String, RateLimitDecision>,
    /// The first denying tier, or the tier with the least remaining
    /// capacity when all allowed. `None` when no tiers were evaluated.
    pub most_restrictive: Option<String>,
}

impl TieredDecision {
    /// The result for a single tier, if it was evaluated.
    pub fn tier(&self, name: &str) -> Option<&RateLimitDecision> {
        self.tiers.get(name)
    }

    /// The decision of the most restrictive tier.
    pub fn most_restrictive_decision(&self) -> Option<&RateLimitDecision> {
        self.most_restrictive
            .as_deref()
            .and_then(|name| self.tiers.get(name))
    }

    /// Response headers from the most restrictive tier.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        self.most_restrictive_decision()
            .map(|decision| decision.headers())
            .unwrap_or_default()
    }
}
