//! The result of a rate limit check.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

/// Outcome of one rate limit check.
///
/// Decisions are returned per call and never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Usage counted against the key, including this request
    pub current: u64,
    /// The configured ceiling
    pub limit: u64,
    /// Time left until `reset_time`
    #[serde(rename = "remaining_ms", serialize_with = "serialize_millis")]
    pub remaining: Duration,
    /// When the key's budget is fully restored
    pub reset_time: DateTime<Utc>,
}

impl Decision {
    pub(crate) fn new(allowed: bool, current: u64, limit: u64, now_ms: u64, reset_ms: u64) -> Self {
        Self {
            allowed,
            current,
            limit,
            remaining: Duration::from_millis(reset_ms.saturating_sub(now_ms)),
            reset_time: DateTime::from_timestamp_millis(reset_ms as i64).unwrap_or_default(),
        }
    }

    /// An admitted request that was not counted.
    pub(crate) fn unaccounted(limit: u64, now_ms: u64) -> Self {
        Self::new(true, 0, limit, now_ms, now_ms)
    }

    /// Requests left before the ceiling is reached.
    pub fn remaining_requests(&self) -> u64 {
        self.limit.saturating_sub(self.current)
    }

    /// `reset_time` in epoch milliseconds.
    pub fn reset_time_ms(&self) -> u64 {
        self.reset_time.timestamp_millis().max(0) as u64
    }
}

fn serialize_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_timing() {
        let decision = Decision::new(true, 3, 10, 1_700_000_000_000, 1_700_000_000_750);

        assert_eq!(decision.remaining, Duration::from_millis(750));
        assert_eq!(decision.reset_time_ms(), 1_700_000_000_750);
        assert_eq!(decision.remaining_requests(), 7);
    }

    #[test]
    fn test_remaining_requests_saturates() {
        let decision = Decision::new(false, 12, 10, 0, 100);
        assert_eq!(decision.remaining_requests(), 0);
    }

    #[test]
    fn test_serializes_remaining_as_millis() {
        let decision = Decision::new(false, 3, 2, 1_000, 1_500);
        let json = serde_json::to_value(&decision).unwrap();

        assert_eq!(json["allowed"], false);
        assert_eq!(json["current"], 3);
        assert_eq!(json["limit"], 2);
        assert_eq!(json["remaining_ms"], 500);
        assert!(json["reset_time"].is_string());
    }
}
