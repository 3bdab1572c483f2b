//! Admission algorithms and failure handling policy.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RatekeeperError;

/// Admission algorithm used by a rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    /// Counter that resets entirely at each window boundary
    #[default]
    FixedWindow,
    /// Count of hits within the trailing window
    SlidingWindow,
    /// Continuously refilling bucket of `max_requests` tokens
    TokenBucket,
}

impl Algorithm {
    /// The configuration name of this algorithm.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::FixedWindow => "fixed-window",
            Algorithm::SlidingWindow => "sliding-window",
            Algorithm::TokenBucket => "token-bucket",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = RatekeeperError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed-window" => Ok(Algorithm::FixedWindow),
            "sliding-window" => Ok(Algorithm::SlidingWindow),
            "token-bucket" => Ok(Algorithm::TokenBucket),
            other => Err(RatekeeperError::Config(format!(
                "unknown algorithm '{}', expected fixed-window, sliding-window or token-bucket",
                other
            ))),
        }
    }
}

/// What a limiter does when it cannot reach a decision.
///
/// Applies to key extraction failures and to storage failures that the
/// storage layer did not absorb itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Admit the request and log a warning
    #[default]
    Open,
    /// Return the error to the caller
    Closed,
}
