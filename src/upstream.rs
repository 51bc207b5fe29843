//! Upstream response classification and limiter feedback.
//!
//! Callers wrap every outbound request: acquire a token, send the request,
//! then feed the response status back so the limiter can adapt.

use chrono::{DateTime, Utc};
use std::future::Future;
use tracing::{debug, trace};

use crate::ratelimit::Throttle;

/// What an upstream response means for the limiter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UpstreamOutcome {
    /// 2xx/3xx: counts towards rate recovery
    Success,
    /// 429/503: halve the rate and cool down
    RateLimited {
        /// Advised cooldown in seconds, 0 when the upstream gave none
        retry_after_secs: f64,
    },
    /// Anything else: no feedback, retries are the caller's business
    Failure,
}

impl UpstreamOutcome {
    /// Classify a response by status code and `Retry-After` header value.
    pub fn classify(status: u16, retry_after: Option<&str>) -> Self {
        Self::classify_at(status, retry_after, Utc::now())
    }

    /// Classify a response, resolving HTTP-date `Retry-After` values against `now`.
    pub fn classify_at(status: u16, retry_after: Option<&str>, now: DateTime<Utc>) -> Self {
        if is_rate_limited(status) {
            let retry_after_secs = retry_after
                .and_then(|value| parse_retry_after(value, now))
                .unwrap_or(0.0);
            return UpstreamOutcome::RateLimited { retry_after_secs };
        }

        if (200..400).contains(&status) {
            UpstreamOutcome::Success
        } else {
            UpstreamOutcome::Failure
        }
    }

    /// Feed this outcome back into a limiter.
    pub fn report<T: Throttle + ?Sized>(&self, throttle: &T) {
        match *self {
            UpstreamOutcome::Success => throttle.record_success(),
            UpstreamOutcome::RateLimited { retry_after_secs } => {
                throttle.handle_rate_limit(retry_after_secs)
            }
            UpstreamOutcome::Failure => {
                trace!("Upstream failure, limiter left unchanged");
            }
        }
    }
}

/// Check if a status code is an upstream rate-limit signal (429 or 503).
pub fn is_rate_limited(status: u16) -> bool {
    matches!(status, 429 | 503)
}

/// Parse a `Retry-After` header value into seconds from `now`.
///
/// Accepts delta-seconds (integer or decimal) and HTTP-dates. Dates in the
/// past and negative deltas yield 0. Returns `None` for anything else.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<f64> {
    let value = value.trim();

    if let Ok(secs) = value.parse::<f64>() {
        return secs.is_finite().then(|| secs.max(0.0));
    }

    match DateTime::parse_from_rfc2822(value) {
        Ok(date) => {
            let delta = date.with_timezone(&Utc) - now;
            Some((delta.num_milliseconds() as f64 / 1000.0).max(0.0))
        }
        Err(e) => {
            debug!(value = %value, error = %e, "Ignoring unparseable Retry-After header");
            None
        }
    }
}

/// A response that can be classified for limiter feedback.
pub trait UpstreamResponse {
    /// HTTP status code
    fn status(&self) -> u16;

    /// Raw `Retry-After` header value, if present
    fn retry_after(&self) -> Option<&str>;
}

/// Run one upstream request under a limiter.
///
/// Waits for a token, sends the request built by `request`, reports the
/// classified outcome and hands the response back unchanged.
pub async fn throttled<T, F, Fut, R>(throttle: &T, request: F) -> R
where
    T: Throttle + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = R>,
    R: UpstreamResponse,
{
    throttle.acquire().await;

    let response = request().await;
    let outcome = UpstreamOutcome::classify(response.status(), response.retry_after());
    trace!(status = response.status(), outcome = ?outcome, "Upstream response classified");
    outcome.report(throttle);

    response
}
