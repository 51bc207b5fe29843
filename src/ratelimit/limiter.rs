//! Core adaptive rate limiter implementation.

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::backend::Throttle;
use super::bucket::{Admission, BucketState, LimiterState, LimiterStats};
use super::config::LimiterConfig;
use crate::error::Result;

/// Name used in log fields when the limiter was not given one.
const DEFAULT_NAME: &str = "default";

/// A self-adjusting token bucket shared by every caller of one upstream.
///
/// The bucket admits bursts up to `burst_capacity`, refills continuously at
/// the current rate, halves that rate and pauses when the upstream signals
/// it is overloaded, and multiplies it back up after sustained success.
///
/// This struct is thread-safe and meant to be held in an `Arc`. All state
/// lives behind one short critical section; callers that have to wait for a
/// token sleep outside it and re-check on wake.
pub struct AdaptiveRateLimiter {
    /// Name used in log fields
    name: String,
    /// Immutable configuration
    config: LimiterConfig,
    /// Bucket state, only touched while the lock is held
    state: Mutex<BucketState>,
}

impl AdaptiveRateLimiter {
    /// Create a new rate limiter.
    ///
    /// Fails if the configuration is incoherent.
    pub fn new(config: LimiterConfig) -> Result<Self> {
        Self::named(DEFAULT_NAME, config)
    }

    /// Create a new rate limiter that identifies itself as `name` in logs.
    pub fn named(name: impl Into<String>, config: LimiterConfig) -> Result<Self> {
        config.validate()?;

        let name = name.into();
        debug!(
            limiter = %name,
            initial_rate = config.initial_rate,
            min_rate = config.min_rate,
            burst_capacity = config.burst_capacity,
            "Creating adaptive rate limiter"
        );

        let state = BucketState::new(&config, Instant::now());
        Ok(Self {
            name,
            config,
            state: Mutex::new(state),
        })
    }

    /// Wait until a token is available, then consume it.
    ///
    /// Returns immediately when a token is already in the bucket and no
    /// cooldown is in force. Otherwise sleeps for the computed shortfall and
    /// re-checks, since other callers may have taken the regenerated token
    /// in the meantime. Dropping the future while it sleeps leaves the
    /// bucket untouched.
    pub async fn acquire(&self) {
        loop {
            let admission = self.state.lock().try_admit(&self.config, Instant::now());
            let wait = match admission {
                Admission::Granted => {
                    trace!(limiter = %self.name, "Token granted");
                    return;
                }
                Admission::Wait(wait) => wait,
            };

            debug!(
                limiter = %self.name,
                wait_ms = wait.as_millis() as u64,
                "Waiting for rate limiter"
            );
            tokio::time::sleep(wait).await;
        }
    }

    /// Consume a token if one is available right now.
    ///
    /// Returns `false` without waiting when the bucket is empty or paused.
    pub fn try_acquire(&self) -> bool {
        matches!(
            self.state.lock().try_admit(&self.config, Instant::now()),
            Admission::Granted
        )
    }

    /// Report a successful upstream call.
    ///
    /// Every `success_streak_threshold` consecutive successes multiply the
    /// rate by `recovery_factor`.
    pub fn record_success(&self) {
        let recovered = self
            .state
            .lock()
            .record_success(&self.config, Instant::now());

        if let Some(rate) = recovered {
            debug!(limiter = %self.name, rate = rate, "Rate recovered after success streak");
        }
    }

    /// Report an upstream rate-limit signal.
    ///
    /// Halves the rate (never below `min_rate`), discards the success streak
    /// and pauses admission for `retry_after_secs`. Negative values are
    /// treated as zero; a newer signal replaces the previous cooldown.
    pub fn handle_rate_limit(&self, retry_after_secs: f64) {
        let (cooldown, rate) = {
            let mut state = self.state.lock();
            let cooldown = state.penalize(&self.config, Instant::now(), retry_after_secs);
            (cooldown, state.snapshot().current_rate)
        };

        warn!(
            limiter = %self.name,
            retry_after_secs = retry_after_secs,
            cooldown_ms = cooldown.as_millis() as u64,
            rate = rate,
            "Upstream rate limit hit, backing off"
        );
    }

    /// Get an up-to-date snapshot of the limiter state.
    ///
    /// Credits elapsed time and lapses an expired cooldown first; never
    /// consumes a token.
    pub fn state(&self) -> LimiterState {
        let mut state = self.state.lock();
        state.refill(&self.config, Instant::now());
        state.snapshot()
    }

    /// Get the running counters.
    pub fn stats(&self) -> LimiterStats {
        self.state.lock().stats()
    }

    /// Restore the construction-time state.
    pub fn reset(&self) {
        self.state.lock().reset(&self.config, Instant::now());
        info!(limiter = %self.name, "Rate limiter reset");
    }

    /// Get the name of this limiter.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the configuration of this limiter.
    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }
}

impl std::fmt::Debug for AdaptiveRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveRateLimiter")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Throttle for AdaptiveRateLimiter {
    async fn acquire(&self) {
        self.acquire().await
    }

    fn record_success(&self) {
        self.record_success()
    }

    fn handle_rate_limit(&self, retry_after_secs: f64) {
        self.handle_rate_limit(retry_after_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_test::{assert_pending, assert_ready, task};

    fn create_test_limiter() -> AdaptiveRateLimiter {
        AdaptiveRateLimiter::new(LimiterConfig::new(10.0, 1.0, 5.0, 1.5, 3)).unwrap()
    }

    #[tokio::test]
    async fn test_rate_limiter_creation() {
        let limiter = create_test_limiter();
        let state = limiter.state();

        assert_eq!(state.tokens, 5.0);
        assert_eq!(state.current_rate, 10.0);
        assert!(!state.is_paused);
        assert_eq!(limiter.name(), "default");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = AdaptiveRateLimiter::new(LimiterConfig::new(1.0, 5.0, 5.0, 1.5, 3));
        assert!(result.is_err());

        let result = AdaptiveRateLimiter::new(LimiterConfig::new(10.0, 1.0, 5.0, 1.0, 3));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_burst_serves_concurrent_callers_immediately() {
        let limiter = Arc::new(create_test_limiter());
        let start = std::time::Instant::now();

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.acquire().await })
            })
            .collect();

        for result in join_all(handles).await {
            result.unwrap();
        }

        assert!(start.elapsed() < Duration::from_millis(100));
        assert!(limiter.state().tokens < 1.0);
        assert_eq!(limiter.stats().granted, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_refill_after_burst() {
        let limiter = create_test_limiter();
        for _ in 0..5 {
            limiter.acquire().await;
        }

        let start = Instant::now();
        limiter.acquire().await;

        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(start.elapsed() < Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_are_throttled_to_rate() {
        let limiter = Arc::new(create_test_limiter());
        for _ in 0..5 {
            limiter.acquire().await;
        }

        let start = Instant::now();
        let waiters: Vec<_> = (0..10)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.acquire().await })
            })
            .collect();

        for result in join_all(waiters).await {
            result.unwrap();
        }

        // Ten tokens at 10/s cannot regenerate faster than one second
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert!(start.elapsed() < Duration::from_millis(1100));
        assert_eq!(limiter.stats().granted, 15);
    }

    #[test]
    fn test_try_acquire_does_not_wait() {
        let limiter = create_test_limiter();

        for _ in 0..5 {
            assert!(limiter.try_acquire());
        }
        assert!(!limiter.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_rate_limit_pauses_acquire() {
        let limiter = create_test_limiter();
        limiter.handle_rate_limit(1.0);

        let state = limiter.state();
        assert!(state.is_paused);
        assert_eq!(state.current_rate, 5.0);

        let start = Instant::now();
        limiter.acquire().await;

        assert!(start.elapsed() >= Duration::from_secs(1));
        assert!(!limiter.state().is_paused);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_pending_during_cooldown() {
        let limiter = create_test_limiter();
        limiter.handle_rate_limit(2.0);

        let mut acquire = task::spawn(limiter.acquire());
        assert_pending!(acquire.poll());

        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_pending!(acquire.poll());

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(acquire.is_woken());
        assert_ready!(acquire.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_acquire_leaves_bucket_intact() {
        let limiter = create_test_limiter();
        for _ in 0..5 {
            limiter.acquire().await;
        }

        let abandoned = tokio::time::timeout(Duration::from_millis(10), limiter.acquire()).await;
        assert!(abandoned.is_err());

        // The timed-out caller reserved nothing; the next token is still 100ms after drain
        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(89));
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_repeated_rate_limits_clamp_at_min_rate() {
        let limiter = create_test_limiter();

        let rates: Vec<f64> = (0..5)
            .map(|_| {
                limiter.handle_rate_limit(1.0);
                limiter.state().current_rate
            })
            .collect();

        assert_eq!(rates, vec![5.0, 2.5, 1.25, 1.0, 1.0]);
    }

    #[test]
    fn test_record_success_recovers_after_streak() {
        let limiter =
            AdaptiveRateLimiter::new(LimiterConfig::new(5.0, 1.0, 5.0, 1.5, 3)).unwrap();

        limiter.record_success();
        limiter.record_success();
        assert_eq!(limiter.state().current_rate, 5.0);

        limiter.record_success();
        assert_eq!(limiter.state().current_rate, 7.5);
        assert_eq!(limiter.stats().recoveries, 1);
    }

    #[test]
    fn test_rate_limit_resets_success_streak() {
        let limiter = create_test_limiter();

        limiter.record_success();
        limiter.handle_rate_limit(0.0);
        limiter.record_success();
        limiter.record_success();
        assert_eq!(limiter.state().current_rate, 5.0);

        limiter.record_success();
        assert_eq!(limiter.state().current_rate, 7.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_negative_retry_after_treated_as_zero() {
        let limiter = create_test_limiter();
        limiter.handle_rate_limit(-30.0);

        let start = Instant::now();
        limiter.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_restores_initial_state() {
        let limiter = create_test_limiter();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        limiter.handle_rate_limit(60.0);
        limiter.record_success();

        limiter.reset();

        let state = limiter.state();
        assert_eq!(state.tokens, 5.0);
        assert_eq!(state.current_rate, 10.0);
        assert!(!state.is_paused);
        assert_eq!(limiter.stats(), LimiterStats::default());

        // Idempotent
        limiter.reset();
        assert_eq!(limiter.state(), state);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_twice_is_identical() {
        let limiter = create_test_limiter();
        limiter.acquire().await;
        limiter.acquire().await;

        assert_eq!(limiter.state(), limiter.state());
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_does_not_consume_tokens() {
        let limiter = create_test_limiter();
        for _ in 0..10 {
            limiter.state();
        }
        assert_eq!(limiter.state().tokens, 5.0);
        assert_eq!(limiter.stats().granted, 0);
    }

    #[tokio::test]
    async fn test_limiter_through_throttle_trait() {
        let limiter: Arc<dyn Throttle> = Arc::new(create_test_limiter());

        limiter.acquire().await;
        limiter.record_success();
        limiter.handle_rate_limit(0.0);
    }
}
