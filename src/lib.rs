//! Ratekeeper - Rate Limiting Decision Engine
//!
//! This crate decides, per caller-supplied key, whether the current request
//! fits within a fixed window, sliding window or token bucket budget. Counters
//! live in pluggable storage: in-process maps for a single instance, or a
//! shared backend so several instances enforce one budget.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod storage;

pub use error::{RatekeeperError, Result};
pub use ratelimit::{Algorithm, Decision, FailurePolicy, RateLimiter, RateLimiterBuilder};
