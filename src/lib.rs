//! Throttle - Per-Action Request Rate Limiting
//!
//! This crate answers one question for every mutating request: may this caller
//! perform this action once more inside its window? Counting happens either in
//! process (fixed window) or in a shared Upstash Redis store reached over REST
//! (sliding window), and the `http` module turns decisions into `RateLimit-*`
//! headers and 429 responses for axum handlers.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
