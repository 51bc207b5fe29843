//! Throttle trait for abstracting over limiter implementations.

use async_trait::async_trait;

/// The contract callers use around every outbound request.
///
/// Call [`acquire`](Throttle::acquire) before the request, then report the
/// outcome with [`record_success`](Throttle::record_success) or
/// [`handle_rate_limit`](Throttle::handle_rate_limit).
#[async_trait]
pub trait Throttle: Send + Sync {
    /// Wait until the request may proceed.
    async fn acquire(&self);

    /// Report a successful request.
    fn record_success(&self);

    /// Report an upstream rate-limit signal with its advised cooldown.
    fn handle_rate_limit(&self, retry_after_secs: f64);
}
