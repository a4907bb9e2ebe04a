//! Retry strategy with exponential backoff for transient errors.
//!
//! Failed operations are not retried by free-running timers. Instead every
//! pending retry is recorded in a single [`RetryScheduler`], and the engine's
//! scheduler loop sleeps until the earliest entry is due.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Duration;

use offsync_common::OperationId;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the first retry.
    #[serde(with = "crate::config::duration_ms")]
    pub base_delay: Duration,
    /// Maximum delay (cap for exponential growth).
    #[serde(with = "crate::config::duration_ms")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub jitter: bool,
}

impl RetryConfig {
    /// Create a new retry configuration.
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    /// Set initial delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Calculate the delay before re-running an operation whose
    /// `attempt`-th execution (1-based) just failed.
    ///
    /// `min(max_delay, base_delay * multiplier^(attempt - 1))`, non-decreasing
    /// in `attempt` when jitter is off.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_delay =
            self.base_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);

        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        let final_delay = if self.jitter {
            // Add random jitter of +/- 25%, still bounded by the cap
            let jitter_factor = 0.75 + (rand::random::<f64>() * 0.5);
            (capped_delay * jitter_factor).min(self.max_delay.as_millis() as f64)
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

/// Min-heap of scheduled operation retries.
///
/// Entries are hints: the drain pass re-reads each operation's
/// `next_attempt_at` before running it, so stale entries for operations that
/// were cleared or already ran are harmless and simply dropped when due.
#[derive(Debug, Default)]
pub struct RetryScheduler {
    heap: BinaryHeap<Reverse<(DateTime<Utc>, OperationId)>>,
}

impl RetryScheduler {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `id` should be re-run at `at`.
    pub fn schedule(&mut self, id: OperationId, at: DateTime<Utc>) {
        self.heap.push(Reverse((at, id)));
    }

    /// Earliest scheduled retry, if any.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.heap.peek().map(|Reverse((at, _))| *at)
    }

    /// Remove and return every entry due at or before `now`.
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<OperationId> {
        let mut due = Vec::new();
        while let Some(Reverse((at, _))) = self.heap.peek() {
            if *at > now {
                break;
            }
            if let Some(Reverse((_, id))) = self.heap.pop() {
                due.push(id);
            }
        }
        due
    }

    /// Number of scheduled entries.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Check if nothing is scheduled.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Drop every scheduled entry.
    pub fn clear(&mut self) {
        self.heap.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_retry_config_delay_calculation() {
        let config = RetryConfig::default();

        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(4));
    }

    #[test]
    fn test_max_delay_cap() {
        let config = RetryConfig::default()
            .with_max_delay(Duration::from_secs(10))
            .with_backoff_multiplier(10.0);

        // 1 * 10^5 = 100000 seconds, but should be capped at 10
        let delay = config.delay_for_attempt(6);
        assert_eq!(delay, Duration::from_secs(10));
    }

    #[test]
    fn test_attempt_zero_uses_base_delay() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
    }

    #[test]
    fn test_scheduler_orders_by_deadline() {
        let mut scheduler = RetryScheduler::new();
        let now = Utc::now();
        let late = OperationId::generate();
        let early = OperationId::generate();

        scheduler.schedule(late.clone(), now + chrono::Duration::seconds(10));
        scheduler.schedule(early.clone(), now + chrono::Duration::seconds(1));

        assert_eq!(
            scheduler.next_deadline(),
            Some(now + chrono::Duration::seconds(1))
        );
        assert!(scheduler.pop_due(now).is_empty());

        let due = scheduler.pop_due(now + chrono::Duration::seconds(5));
        assert_eq!(due, vec![early]);
        assert_eq!(scheduler.len(), 1);

        let due = scheduler.pop_due(now + chrono::Duration::seconds(10));
        assert_eq!(due, vec![late]);
        assert!(scheduler.is_empty());
    }

    proptest! {
        #[test]
        fn prop_backoff_non_decreasing_and_capped(
            base_ms in 1u64..5_000,
            max_ms in 1u64..120_000,
            attempt in 1u32..64,
        ) {
            let config = RetryConfig::new(
                Duration::from_millis(base_ms),
                Duration::from_millis(max_ms),
            );
            let current = config.delay_for_attempt(attempt);
            let next = config.delay_for_attempt(attempt + 1);

            prop_assert!(next >= current);
            prop_assert!(current <= Duration::from_millis(max_ms));
        }

        #[test]
        fn prop_jitter_stays_under_cap(attempt in 1u32..32) {
            let config = RetryConfig::default().with_jitter(true);
            prop_assert!(config.delay_for_attempt(attempt) <= Duration::from_secs(30));
        }
    }
}
