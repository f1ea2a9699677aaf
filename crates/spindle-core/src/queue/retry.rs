//! Retry policy: how many attempts, and how long to back off between them.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;

/// Retry policy for failed jobs.
///
/// Exponential backoff: `delay = base_delay * multiplier^(attempts - 1)`,
/// capped at `max_delay`. With `jitter`, the delay is stretched by a random
/// factor in `[1, 2)` so retries of jobs that failed together spread out.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first one.
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    pub max_delay: Option<Duration>,

    pub jitter: bool,
}

impl Default for RetryPolicy {
    /// 5 attempts, 2s base delay doubling each time.
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: None,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Run once; any failure dead-letters the job.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Delay before the next retry, given the number of attempts already
    /// made (1-indexed).
    ///
    /// Example with base_delay=2s, multiplier=2.0:
    /// - attempt 1 (first failure): 2s
    /// - attempt 2: 4s
    /// - attempt 3: 8s
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let delay = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);
        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    /// When to retry a job that just failed its `attempts`-th attempt, or
    /// `None` when the attempts are exhausted.
    pub fn next_due(&self, attempts: u32, failed_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if attempts >= self.max_attempts {
            return None;
        }
        let mut delay = self.next_delay(attempts);
        if self.jitter {
            let factor: f64 = rand::thread_rng().gen_range(1.0..2.0);
            delay = Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(delay);
            if let Some(cap) = self.max_delay {
                delay = delay.min(cap);
            }
        }
        let delta = TimeDelta::from_std(delay).unwrap_or(TimeDelta::MAX);
        Some(failed_at.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    #[test]
    fn default_policy_has_reasonable_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_secs(2));
        assert_eq!(policy.multiplier, 2.0);
    }

    #[rstest]
    #[case(1, 2)]
    #[case(2, 4)]
    #[case(3, 8)]
    #[case(4, 16)]
    fn exponential_backoff_increases(#[case] attempts: u32, #[case] secs: u64) {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next_delay(attempts), Duration::from_secs(secs));
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy {
            max_delay: Some(Duration::from_secs(5)),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.next_delay(10), Duration::from_secs(5));
        // absurd attempt counts must not overflow
        assert_eq!(policy.next_delay(u32::MAX), Duration::from_secs(5));
        assert_eq!(RetryPolicy::default().next_delay(u32::MAX), Duration::MAX);
    }

    #[test]
    fn next_due_stops_at_max_attempts() {
        let failed_at = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let policy = RetryPolicy::default().with_max_attempts(3);

        assert_eq!(policy.next_due(1, failed_at), Some(failed_at + TimeDelta::seconds(2)));
        assert_eq!(policy.next_due(2, failed_at), Some(failed_at + TimeDelta::seconds(4)));
        assert_eq!(policy.next_due(3, failed_at), None);
        assert_eq!(RetryPolicy::no_retry().next_due(1, failed_at), None);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let failed_at = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let policy = RetryPolicy {
            jitter: true,
            ..RetryPolicy::default()
        };
        for _ in 0..100 {
            let due = policy.next_due(1, failed_at).unwrap();
            assert!(due >= failed_at + TimeDelta::seconds(2));
            assert!(due <= failed_at + TimeDelta::seconds(4));
        }
    }
}
