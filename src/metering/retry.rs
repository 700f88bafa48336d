//! Requeue policy for usage deltas that failed to persist.
//!
//! The default policy retries forever with no delay: a failed delta goes
//! straight back into the aggregator and rides along with the next flush
//! cycle. Backoff parks failed deltas until their delay has elapsed, and
//! `max_attempts` caps how many consecutive failed flushes a token may have
//! before its pending delta is dropped.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::models::delta::PendingDelta;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Zero disables backoff.
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            base_backoff_ms: 0,
            max_backoff_ms: 30_000,
            jitter_ms: 0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the `attempt`-th consecutive failure.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if self.base_backoff_ms == 0 {
            return Duration::ZERO;
        }
        // Exponential: base * 2^(attempt - 1)
        let exp = attempt.saturating_sub(1).min(32);
        let raw = self.base_backoff_ms.saturating_mul(1u64 << exp);
        let capped = raw.min(self.max_backoff_ms);
        let jitter = if self.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        } else {
            0
        };
        Duration::from_millis(capped + jitter)
    }

    pub fn gives_up_after(&self, attempts: u32) -> bool {
        self.max_attempts.map_or(false, |max| attempts >= max)
    }
}

struct Parked {
    entry: PendingDelta,
    not_before: Instant,
}

/// What happened to one batch of failed deltas.
#[derive(Debug, Default)]
pub struct Requeue {
    /// Merge back into the aggregator now.
    pub immediate: Vec<PendingDelta>,
    /// Held back until their backoff elapses.
    pub parked: usize,
    /// Gave up on these.
    pub dropped: Vec<PendingDelta>,
}

/// Per-token consecutive failure counts plus the parked entries.
pub struct RetryTracker {
    policy: RetryPolicy,
    attempts: HashMap<i64, u32>,
    parked: Vec<Parked>,
}

impl RetryTracker {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempts: HashMap::new(),
            parked: Vec::new(),
        }
    }

    /// Reset the failure count, unless an earlier delta for the token is
    /// still parked: that one has not succeeded yet.
    pub fn record_success(&mut self, token_id: i64) {
        if self.parked.iter().any(|p| p.entry.token_id == token_id) {
            return;
        }
        self.attempts.remove(&token_id);
    }

    pub fn record_failures(&mut self, failed: Vec<PendingDelta>, now: Instant) -> Requeue {
        let mut out = Requeue::default();
        for entry in failed {
            let attempts = self.attempts.entry(entry.token_id).or_insert(0);
            *attempts += 1;
            let n = *attempts;

            if self.policy.gives_up_after(n) {
                self.attempts.remove(&entry.token_id);
                out.dropped.push(entry);
                continue;
            }

            let wait = self.policy.backoff(n);
            if wait.is_zero() {
                out.immediate.push(entry);
            } else {
                self.parked.push(Parked {
                    entry,
                    not_before: now + wait,
                });
                out.parked += 1;
            }
        }
        out
    }

    /// Parked entries whose backoff has elapsed.
    pub fn take_due(&mut self, now: Instant) -> Vec<PendingDelta> {
        let (due, waiting): (Vec<_>, Vec<_>) =
            self.parked.drain(..).partition(|p| p.not_before <= now);
        self.parked = waiting;
        due.into_iter().map(|p| p.entry).collect()
    }

    /// Every parked entry, ignoring backoff.
    pub fn take_all(&mut self) -> Vec<PendingDelta> {
        self.parked.drain(..).map(|p| p.entry).collect()
    }

    pub fn parked_len(&self) -> usize {
        self.parked.len()
    }

    /// Sum of the parked deltas for a token.
    pub fn parked_delta(&self, token_id: i64) -> i64 {
        self.parked
            .iter()
            .filter(|p| p.entry.token_id == token_id)
            .fold(0i64, |acc, p| acc.saturating_add(p.entry.delta))
    }

    pub fn parked_ids(&self) -> HashSet<i64> {
        self.parked.iter().map(|p| p.entry.token_id).collect()
    }

    pub fn attempts(&self, token_id: i64) -> u32 {
        self.attempts.get(&token_id).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pd(token_id: i64, delta: i64) -> PendingDelta {
        PendingDelta { token_id, delta }
    }

    #[test]
    fn test_default_policy_requeues_immediately_forever() {
        let mut tracker = RetryTracker::new(RetryPolicy::default());
        for _ in 0..100 {
            let out = tracker.record_failures(vec![pd(1, 5)], Instant::now());
            assert_eq!(out.immediate, vec![pd(1, 5)]);
            assert!(out.dropped.is_empty());
        }
        assert_eq!(tracker.attempts(1), 100);
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_attempts: None,
            base_backoff_ms: 100,
            max_backoff_ms: 1_000,
            jitter_ms: 0,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(5), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(60), Duration::from_millis(1_000));
    }

    #[test]
    fn test_parked_entries_released_when_due() {
        let policy = RetryPolicy {
            base_backoff_ms: 50,
            ..RetryPolicy::default()
        };
        let mut tracker = RetryTracker::new(policy);
        let t0 = Instant::now();
        let out = tracker.record_failures(vec![pd(1, 3), pd(2, -4)], t0);
        assert!(out.immediate.is_empty());
        assert_eq!(out.parked, 2);
        assert!(tracker.take_due(t0).is_empty());
        let due = tracker.take_due(t0 + Duration::from_millis(50));
        assert_eq!(due.len(), 2);
        assert_eq!(tracker.parked_len(), 0);
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: Some(2),
            ..RetryPolicy::default()
        };
        let mut tracker = RetryTracker::new(policy);
        let out = tracker.record_failures(vec![pd(1, 9)], Instant::now());
        assert_eq!(out.immediate.len(), 1);
        let out = tracker.record_failures(vec![pd(1, 9)], Instant::now());
        assert_eq!(out.dropped, vec![pd(1, 9)]);
        assert_eq!(tracker.attempts(1), 0);
    }

    #[test]
    fn test_success_resets_attempts() {
        let policy = RetryPolicy {
            max_attempts: Some(2),
            ..RetryPolicy::default()
        };
        let mut tracker = RetryTracker::new(policy);
        tracker.record_failures(vec![pd(1, 1)], Instant::now());
        tracker.record_success(1);
        let out = tracker.record_failures(vec![pd(1, 1)], Instant::now());
        assert_eq!(out.immediate.len(), 1);
    }

    #[test]
    fn test_success_keeps_attempts_while_delta_is_parked() {
        let policy = RetryPolicy {
            max_attempts: Some(3),
            base_backoff_ms: 1_000,
            ..RetryPolicy::default()
        };
        let mut tracker = RetryTracker::new(policy);
        let t0 = Instant::now();
        tracker.record_failures(vec![pd(1, 7)], t0);
        tracker.record_failures(vec![pd(1, 2)], t0);
        assert_eq!(tracker.attempts(1), 2);

        // a later delta for the same token went through
        tracker.record_success(1);
        assert_eq!(tracker.attempts(1), 2);
        assert_eq!(tracker.parked_delta(1), 9);
        assert_eq!(tracker.parked_ids(), HashSet::from([1]));

        // the count carried over, so the third failure hits the cap
        let released = tracker.take_all();
        let out = tracker.record_failures(released, t0);
        assert_eq!(out.dropped, vec![pd(1, 7)]);
        assert_eq!(out.parked, 1);

        tracker.take_all();
        tracker.record_success(1);
        assert_eq!(tracker.attempts(1), 0);
    }
}
