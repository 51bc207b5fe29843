//! Token bucket state and its transitions.
//!
//! Everything in here is a pure function of the current state, the limiter
//! configuration and an explicit `now`. Locking and suspension live in
//! [`AdaptiveRateLimiter`](super::AdaptiveRateLimiter).

use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

use super::config::LimiterConfig;

/// Slack for floating-point refill error when checking for a whole token.
const TOKEN_EPSILON: f64 = 1e-9;

/// Cooldown deadline used when `now + cooldown` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Snapshot of the observable limiter state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LimiterState {
    /// Current refill rate in tokens per second
    pub current_rate: f64,
    /// Current bucket fill level
    pub tokens: f64,
    /// Whether an upstream cooldown is in force
    pub is_paused: bool,
}

/// Running counters kept alongside the bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LimiterStats {
    /// Tokens handed out
    pub granted: u64,
    /// Upstream rate-limit signals received
    pub rate_limit_hits: u64,
    /// Recovery steps applied
    pub recoveries: u64,
    /// Consecutive successes since the last penalty or recovery
    pub success_streak: u32,
}

/// Outcome of a single admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A token was consumed.
    Granted,
    /// No token can be handed out before this much time has passed.
    Wait(Duration),
}

/// Mutable state of one adaptive token bucket.
#[derive(Debug, Clone)]
pub(crate) struct BucketState {
    current_rate: f64,
    tokens: f64,
    last_refill: Instant,
    success_streak: u32,
    paused_until: Option<Instant>,
    stats: LimiterStats,
}

impl BucketState {
    /// Fresh state: full bucket, initial rate, no streak, not paused.
    pub(crate) fn new(config: &LimiterConfig, now: Instant) -> Self {
        Self {
            current_rate: config.initial_rate,
            tokens: config.burst_capacity,
            last_refill: now,
            success_streak: 0,
            paused_until: None,
            stats: LimiterStats::default(),
        }
    }

    /// Credit tokens for the time elapsed since the last reconciliation.
    fn accrue(&mut self, config: &LimiterConfig, now: Instant) {
        if now <= self.last_refill {
            return;
        }

        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.current_rate).min(config.burst_capacity);
        self.last_refill = now;
    }

    /// Lazy refill: credit elapsed time and lapse an expired cooldown.
    pub(crate) fn refill(&mut self, config: &LimiterConfig, now: Instant) {
        self.accrue(config, now);

        if let Some(until) = self.paused_until {
            if now >= until {
                self.paused_until = None;
            }
        }
    }

    /// Try to take one token.
    ///
    /// Returns how long the caller should wait before trying again when no
    /// token can be handed out. The wait is a hint, not a reservation.
    pub(crate) fn try_admit(&mut self, config: &LimiterConfig, now: Instant) -> Admission {
        self.refill(config, now);

        if let Some(until) = self.paused_until {
            return Admission::Wait(until.duration_since(now));
        }

        if self.tokens >= 1.0 - TOKEN_EPSILON {
            self.tokens = (self.tokens - 1.0).max(0.0);
            self.stats.granted += 1;
            return Admission::Granted;
        }

        let need = 1.0 - self.tokens;
        Admission::Wait(wait_for(need / self.current_rate))
    }

    /// Count a success. Returns the new rate if this success completed a streak.
    pub(crate) fn record_success(&mut self, config: &LimiterConfig, now: Instant) -> Option<f64> {
        self.accrue(config, now);

        self.success_streak += 1;
        self.stats.success_streak = self.success_streak;

        if self.success_streak < config.success_streak_threshold {
            return None;
        }

        let mut recovered = self.current_rate * config.recovery_factor;
        if let Some(max_rate) = config.max_rate {
            recovered = recovered.min(max_rate);
        }

        self.current_rate = recovered;
        self.success_streak = 0;
        self.stats.success_streak = 0;
        self.stats.recoveries += 1;
        Some(recovered)
    }

    /// Apply an upstream rate-limit signal. Returns the cooldown actually imposed.
    pub(crate) fn penalize(
        &mut self,
        config: &LimiterConfig,
        now: Instant,
        retry_after_secs: f64,
    ) -> Duration {
        self.refill(config, now);

        self.current_rate = (self.current_rate / 2.0).max(config.min_rate);
        self.success_streak = 0;
        self.stats.success_streak = 0;
        self.stats.rate_limit_hits += 1;

        let cooldown = cooldown_for(retry_after_secs, config.max_cooldown_secs);
        self.paused_until = Some(
            now.checked_add(cooldown)
                .or_else(|| now.checked_add(FAR_FUTURE))
                .unwrap_or(now),
        );
        cooldown
    }

    pub(crate) fn reset(&mut self, config: &LimiterConfig, now: Instant) {
        *self = Self::new(config, now);
    }

    pub(crate) fn snapshot(&self) -> LimiterState {
        LimiterState {
            current_rate: self.current_rate,
            tokens: self.tokens,
            is_paused: self.paused_until.is_some(),
        }
    }

    pub(crate) fn stats(&self) -> LimiterStats {
        self.stats
    }
}

/// Turn an advisory retry-after value into a bounded cooldown.
///
/// Negative and NaN inputs mean "no cooldown"; anything above `max_secs`
/// (including infinity) is clamped to it.
pub(crate) fn cooldown_for(retry_after_secs: f64, max_secs: f64) -> Duration {
    if retry_after_secs.is_nan() || retry_after_secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(retry_after_secs.min(max_secs)).unwrap_or(Duration::MAX)
}

/// Time until `secs` have passed, rounded up to a whole nanosecond.
///
/// Never zero, so a caller that sleeps for it always lets the clock move.
fn wait_for(secs: f64) -> Duration {
    let nanos = (secs * 1e9).ceil();
    if nanos >= u64::MAX as f64 {
        return Duration::MAX;
    }
    Duration::from_nanos((nanos as u64).max(1))
}
