//! Retry backoff shared by the node and pod reconcilers.
//!
//! Transient failures are retried with an exponential delay (10s, 20s,
//! 40s, ...) capped at five minutes; the delay resets after ten minutes
//! without a failure. Time is passed in so tests drive a fake clock.

use std::collections::HashMap;
use std::time::{Duration, Instant};

pub const INITIAL_DELAY: Duration = Duration::from_secs(10);
pub const MAX_DELAY: Duration = Duration::from_secs(300);
pub const RESET_AFTER: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
struct Entry {
    delay: Duration,
    last_failure: Instant,
    next_attempt: Instant,
}

/// Per-key backoff state.
#[derive(Debug, Default)]
pub struct BackoffTracker {
    entries: HashMap<String, Entry>,
}

impl BackoffTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether work for `key` may be attempted now.
    pub fn ready(&self, key: &str, now: Instant) -> bool {
        match self.entries.get(key) {
            Some(entry) => now >= entry.next_attempt,
            None => true,
        }
    }

    /// Record a failure and return the delay before the next attempt.
    pub fn failure(&mut self, key: &str, now: Instant) -> Duration {
        let delay = match self.entries.get(key) {
            Some(entry) if now.duration_since(entry.last_failure) < RESET_AFTER => {
                (entry.delay * 2).min(MAX_DELAY)
            }
            _ => INITIAL_DELAY,
        };
        self.entries.insert(
            key.to_string(),
            Entry {
                delay,
                last_failure: now,
                next_attempt: now + delay,
            },
        );
        delay
    }

    /// Clear backoff state after a success.
    pub fn clear(&mut self, key: &str) {
        self.entries.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double_up_to_the_cap() {
        let mut tracker = BackoffTracker::new();
        let start = Instant::now();
        assert_eq!(tracker.failure("n", start), Duration::from_secs(10));
        assert_eq!(
            tracker.failure("n", start + Duration::from_secs(10)),
            Duration::from_secs(20)
        );
        let mut now = start + Duration::from_secs(30);
        let mut delay = Duration::ZERO;
        for _ in 0..10 {
            delay = tracker.failure("n", now);
            now += delay;
        }
        assert_eq!(delay, MAX_DELAY);
    }

    #[test]
    fn test_resets_after_quiet_period() {
        let mut tracker = BackoffTracker::new();
        let start = Instant::now();
        tracker.failure("n", start);
        tracker.failure("n", start + Duration::from_secs(10));
        let later = start + RESET_AFTER + Duration::from_secs(11);
        assert_eq!(tracker.failure("n", later), INITIAL_DELAY);
    }

    #[test]
    fn test_ready_respects_next_attempt() {
        let mut tracker = BackoffTracker::new();
        let start = Instant::now();
        assert!(tracker.ready("n", start));
        tracker.failure("n", start);
        assert!(!tracker.ready("n", start + Duration::from_secs(5)));
        assert!(tracker.ready("n", start + Duration::from_secs(10)));
    }

    #[test]
    fn test_keys_are_independent() {
        let mut tracker = BackoffTracker::new();
        let start = Instant::now();
        tracker.failure("a", start);
        assert!(tracker.ready("b", start));
        tracker.clear("a");
        assert!(tracker.ready("a", start));
    }
}
