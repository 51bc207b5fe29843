//! Adaptive rate limiting: token bucket state, the shared limiter and its registry.

mod backend;
mod bucket;
mod config;
mod limiter;
mod registry;

pub use backend::Throttle;
pub use bucket::{LimiterState, LimiterStats};
pub use config::LimiterConfig;
pub use limiter::AdaptiveRateLimiter;
pub use registry::LimiterRegistry;
