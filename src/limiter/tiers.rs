//! Multi-tier composition: several named limits evaluated per request.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::config::{EngineConfig, LimitConfig};
use crate::error::{FloodgateError, Result};
use crate::store::LimitStore;

use super::context::RequestContext;
use super::decision::TieredDecision;
use super::service::RateLimitService;

/// A named collection of independently configured limits ("tiers") that can
/// be evaluated together for one request.
///
/// Tiers share the store handed to the constructor unless registered with
/// [`TieredRateLimiter::add_tier_with_store`]. The composer owns the tier
/// table and is its only writer; tiers can be added and removed at runtime
/// without a restart.
pub struct TieredRateLimiter {
    store: Arc<dyn LimitStore>,
    tiers: RwLock<HashMap<String, Arc<RateLimitService>>>,
}

impl TieredRateLimiter {
    /// Create a composer with no tiers over a shared store.
    pub fn new(store: Arc<dyn LimitStore>) -> Self {
        Self {
            store,
            tiers: RwLock::new(HashMap::new()),
        }
    }

    /// Build a composer from configuration: the configured store plus every
    /// tier in the table.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let limiter = Self::new(config.store.build()?);
        for (name, tier) in &config.tiers {
            limiter.add_tier(name, tier.clone())?;
        }
        Ok(limiter)
    }

    /// Register a tier over the shared store.
    ///
    /// The configuration is validated here; duplicate names are rejected.
    pub fn add_tier(&self, name: &str, config: LimitConfig) -> Result<()> {
        self.add_tier_with_store(name, config, self.store.clone())
    }

    /// Register a tier over its own store.
    pub fn add_tier_with_store(
        &self,
        name: &str,
        config: LimitConfig,
        store: Arc<dyn LimitStore>,
    ) -> Result<()> {
        let service = RateLimitService::new(store, config)?;

        let mut tiers = self.tiers.write();
        if tiers.contains_key(name) {
            return Err(FloodgateError::Config(format!(
                "Tier '{}' is already registered",
                name
            )));
        }
        tiers.insert(name.to_string(), Arc::new(service));

        info!(tier = %name, "Registered rate limit tier");
        Ok(())
    }

    /// Remove a tier by name. Returns whether it existed.
    pub fn remove_tier(&self, name: &str) -> bool {
        let removed = self.tiers.write().remove(name).is_some();
        if removed {
            info!(tier = %name, "Removed rate limit tier");
        }
        removed
    }

    /// Names of all registered tiers.
    pub fn tier_names(&self) -> Vec<String> {
        self.tiers.read().keys().cloned().collect()
    }

    /// The service enforcing a single tier, if registered.
    pub fn tier(&self, name: &str) -> Option<Arc<RateLimitService>> {
        self.tiers.read().get(name).cloned()
    }

    /// Check one request against the named tiers, in the order given.
    ///
    /// Unknown tier names are skipped and omitted from the result, since
    /// callers routinely pass a superset of tiers across heterogeneous
    /// endpoints. The aggregate is allowed only if every evaluated tier
    /// allows; the most restrictive tier is the first denier, or the tier
    /// with the least remaining capacity when all allow.
    pub async fn check_tiers(
        &self,
        ctx: &RequestContext,
        tier_names: &[&str],
    ) -> Result<TieredDecision> {
        // Snapshot the services first so no lock is held across store I/O.
        let services: Vec<(String, Arc<RateLimitService>)> = {
            let tiers = self.tiers.read();
            tier_names
                .iter()
                .filter_map(|name| match tiers.get(*name) {
                    Some(service) => Some((name.to_string(), service.clone())),
                    None => {
                        debug!(tier = %name, "Unknown tier skipped");
                        None
                    }
                })
                .collect()
        };

        let mut results = HashMap::with_capacity(services.len());
        let mut allowed = true;
        let mut first_denied: Option<String> = None;
        let mut least_remaining: Option<(String, u64)> = None;

        for (name, service) in services {
            let decision = service.check(ctx).await?;

            if !decision.allowed {
                allowed = false;
                if first_denied.is_none() {
                    first_denied = Some(name.clone());
                }
            }

            // Strictly-smaller keeps the earlier tier on ties.
            match &least_remaining {
                Some((_, current_min)) if decision.remaining >= *current_min => {}
                _ => least_remaining = Some((name.clone(), decision.remaining)),
            }

            results.insert(name, decision);
        }

        let most_restrictive = first_denied.or(least_remaining.map(|(name, _)| name));

        Ok(TieredDecision {
            allowed,
            tiers: results,
            most_restrictive,
        })
    }

    /// Stop the shared store's background work. Stores registered per-tier
    /// via [`TieredRateLimiter::add_tier_with_store`] are the caller's to
    /// shut down.
    pub async fn shutdown(&self) {
        self.store.shutdown().await;
    }
}
