//! Process-wide registry holding one limiter per upstream target.

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::bucket::LimiterState;
use super::config::LimiterConfig;
use super::limiter::AdaptiveRateLimiter;
use crate::config::TempoConfig;
use crate::error::Result;

/// Limiters indexed by upstream name.
///
/// This struct is thread-safe and can be shared across multiple tasks.
#[derive(Debug, Default)]
pub struct LimiterRegistry {
    limiters: DashMap<String, Arc<AdaptiveRateLimiter>>,
}

impl LimiterRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry with a limiter for every configured upstream.
    pub fn from_config(config: &TempoConfig) -> Result<Self> {
        let registry = Self::new();
        for (name, limiter_config) in &config.upstreams {
            registry.insert(name, limiter_config.clone())?;
        }

        info!(upstreams = registry.len(), "Limiter registry initialized");
        Ok(registry)
    }

    /// Create a limiter for `name`, replacing any existing one.
    pub fn insert(&self, name: &str, config: LimiterConfig) -> Result<Arc<AdaptiveRateLimiter>> {
        let limiter = Arc::new(AdaptiveRateLimiter::named(name, config)?);
        self.limiters.insert(name.to_string(), limiter.clone());
        Ok(limiter)
    }

    /// Get the limiter for `name`, if one exists.
    pub fn get(&self, name: &str) -> Option<Arc<AdaptiveRateLimiter>> {
        self.limiters.get(name).map(|entry| entry.value().clone())
    }

    /// Get the limiter for `name`, creating it from `config` if absent.
    ///
    /// An existing limiter is returned as is; `config` is ignored for it.
    pub fn get_or_create(
        &self,
        name: &str,
        config: LimiterConfig,
    ) -> Result<Arc<AdaptiveRateLimiter>> {
        if let Some(existing) = self.get(name) {
            return Ok(existing);
        }

        let limiter = self
            .limiters
            .entry(name.to_string())
            .or_try_insert_with(|| {
                debug!(upstream = %name, "Creating limiter for upstream");
                AdaptiveRateLimiter::named(name, config).map(Arc::new)
            })?
            .value()
            .clone();

        Ok(limiter)
    }

    /// Names of all registered upstreams, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.limiters.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Current state of every limiter.
    pub fn states(&self) -> BTreeMap<String, LimiterState> {
        self.limiters
            .iter()
            .map(|e| (e.key().clone(), e.value().state()))
            .collect()
    }

    /// Reset every limiter to its construction-time state.
    pub fn reset_all(&self) {
        for entry in self.limiters.iter() {
            entry.value().reset();
        }
    }

    /// Get the number of registered limiters.
    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    /// Whether no limiter is registered.
    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }
}
