//! Floodgate - Multi-Tier Rate Limiting Engine
//!
//! This crate implements a pluggable-store, multi-algorithm request
//! throttler. Requests are checked against named tiers (global, per-user,
//! per-endpoint), each enforcing a token bucket, sliding window, or fixed
//! window limit over a shared store. State lives either in a bounded
//! in-process store or in Redis when limits must hold across instances.
//!
//! The engine is a library: transports build a [`limiter::RequestContext`],
//! call [`limiter::TieredRateLimiter::check_tiers`], and translate the
//! returned decision into response headers and an accept-or-reject.

pub mod config;
pub mod error;
pub mod limiter;
pub mod store;
