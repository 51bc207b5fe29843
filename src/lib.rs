//! Tempo - Adaptive Rate Limiting for Upstream APIs
//!
//! This crate implements a self-adjusting token bucket used to throttle
//! outbound calls to a rate-limited upstream API. The bucket admits bursts,
//! refills smoothly, backs off when the upstream answers "too many requests"
//! and recovers its rate gradually after sustained success.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod upstream;
