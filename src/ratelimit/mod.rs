//! Rate limiting decisions.

mod decision;
mod key;
mod limiter;
mod policy;
mod token_bucket;

pub use decision::Decision;
pub use key::{IdentityKey, KeyError, KeyGenerator, SkipPredicate};
pub use limiter::{
    RateLimiter, RateLimiterBuilder, DEFAULT_BUCKET_SWEEP_INTERVAL, DEFAULT_MAX_REQUESTS,
    DEFAULT_WINDOW,
};
pub use policy::{Algorithm, FailurePolicy};
pub use token_bucket::TokenBucket;
