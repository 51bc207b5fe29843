//! Limiter configuration and validation.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TempoError};

/// Configuration for a single adaptive rate limiter.
///
/// Immutable for the lifetime of the limiter it is handed to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Starting sustained throughput, in tokens per second
    #[serde(default = "default_initial_rate")]
    pub initial_rate: f64,

    /// Floor below which a penalty never pushes the rate
    #[serde(default = "default_min_rate")]
    pub min_rate: f64,

    /// Maximum tokens the bucket holds; also the initial fill
    #[serde(default = "default_burst_capacity")]
    pub burst_capacity: f64,

    /// Multiplier applied to the rate when a success streak completes
    #[serde(default = "default_recovery_factor")]
    pub recovery_factor: f64,

    /// Consecutive successes required before a recovery step fires
    #[serde(default = "default_success_streak_threshold")]
    pub success_streak_threshold: u32,

    /// Optional ceiling for recovered rates. `None` lets recovery grow unbounded.
    #[serde(default)]
    pub max_rate: Option<f64>,

    /// Longest cooldown a single upstream signal can impose, in seconds
    #[serde(default = "default_max_cooldown_secs")]
    pub max_cooldown_secs: f64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            initial_rate: default_initial_rate(),
            min_rate: default_min_rate(),
            burst_capacity: default_burst_capacity(),
            recovery_factor: default_recovery_factor(),
            success_streak_threshold: default_success_streak_threshold(),
            max_rate: None,
            max_cooldown_secs: default_max_cooldown_secs(),
        }
    }
}

fn default_initial_rate() -> f64 {
    10.0
}

fn default_min_rate() -> f64 {
    1.0
}

fn default_burst_capacity() -> f64 {
    5.0
}

fn default_recovery_factor() -> f64 {
    1.5
}

fn default_success_streak_threshold() -> u32 {
    3
}

fn default_max_cooldown_secs() -> f64 {
    3600.0
}

impl LimiterConfig {
    /// Create a configuration with the five core parameters and default policy knobs.
    pub fn new(
        initial_rate: f64,
        min_rate: f64,
        burst_capacity: f64,
        recovery_factor: f64,
        success_streak_threshold: u32,
    ) -> Self {
        Self {
            initial_rate,
            min_rate,
            burst_capacity,
            recovery_factor,
            success_streak_threshold,
            ..Default::default()
        }
    }

    /// Cap recovered rates at `max_rate`.
    pub fn with_max_rate(mut self, max_rate: f64) -> Self {
        self.max_rate = Some(max_rate);
        self
    }

    /// Check that the configuration describes a coherent limiter.
    pub fn validate(&self) -> Result<()> {
        positive("initial_rate", self.initial_rate)?;
        positive("min_rate", self.min_rate)?;
        positive("burst_capacity", self.burst_capacity)?;

        if self.burst_capacity < 1.0 {
            return Err(TempoError::Config(format!(
                "burst_capacity must hold at least one token, got {}",
                self.burst_capacity
            )));
        }

        if self.min_rate > self.initial_rate {
            return Err(TempoError::Config(format!(
                "min_rate ({}) must not exceed initial_rate ({})",
                self.min_rate, self.initial_rate
            )));
        }

        if !self.recovery_factor.is_finite() || self.recovery_factor <= 1.0 {
            return Err(TempoError::Config(format!(
                "recovery_factor must be a finite number greater than 1, got {}",
                self.recovery_factor
            )));
        }

        if self.success_streak_threshold == 0 {
            return Err(TempoError::Config(
                "success_streak_threshold must be at least 1".to_string(),
            ));
        }

        if let Some(max_rate) = self.max_rate {
            if !max_rate.is_finite() || max_rate < self.initial_rate {
                return Err(TempoError::Config(format!(
                    "max_rate ({}) must be finite and at least initial_rate ({})",
                    max_rate, self.initial_rate
                )));
            }
        }

        if !self.max_cooldown_secs.is_finite() || self.max_cooldown_secs < 0.0 {
            return Err(TempoError::Config(format!(
                "max_cooldown_secs must be a finite, non-negative number, got {}",
                self.max_cooldown_secs
            )));
        }

        Ok(())
    }
}

fn positive(field: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(TempoError::Config(format!(
            "{} must be a finite number greater than 0, got {}",
            field, value
        )))
    }
}
