//! Fixed-window counter record.

/// A counter for one key within one fixed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowRecord {
    /// Hits recorded in the current window
    pub count: u64,
    /// When the current window ends, in epoch milliseconds
    pub reset_time: u64,
}

impl WindowRecord {
    /// Start a new window at `now_ms` holding its first hit.
    pub fn first(now_ms: u64, window_ms: u64) -> Self {
        Self {
            count: 1,
            reset_time: now_ms + window_ms.max(1),
        }
    }

    /// Whether the window has ended at `now_ms`.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.reset_time
    }

    /// Record a hit, rolling over to a fresh window if this one has ended.
    pub fn hit(&mut self, now_ms: u64, window_ms: u64) {
        if self.is_expired(now_ms) {
            *self = Self::first(now_ms, window_ms);
        } else {
            self.count += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_hit() {
        let record = WindowRecord::first(1_000, 500);
        assert_eq!(record.count, 1);
        assert_eq!(record.reset_time, 1_500);
    }

    #[test]
    fn test_hit_within_window_increments() {
        let mut record = WindowRecord::first(1_000, 500);
        record.hit(1_100, 500);
        record.hit(1_499, 500);

        assert_eq!(record.count, 3);
        assert_eq!(record.reset_time, 1_500);
    }

    #[test]
    fn test_hit_after_window_rolls_over() {
        let mut record = WindowRecord::first(1_000, 500);
        record.hit(1_100, 500);
        record.hit(1_500, 500);

        assert_eq!(record.count, 1);
        assert_eq!(record.reset_time, 2_000);
    }

    #[test]
    fn test_zero_window_still_expires_after_creation() {
        let record = WindowRecord::first(1_000, 0);
        assert!(record.reset_time > 1_000);
    }
}
