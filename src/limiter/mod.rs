//! Admission control: algorithms, decisions, and tier composition.

mod context;
mod decision;
mod service;
mod tiers;

pub use context::{default_store_key, KeyGenerator, RequestContext};
pub use decision::{RateLimitDecision, TieredDecision};
pub use service::RateLimitService;
pub use tiers::TieredRateLimiter;
