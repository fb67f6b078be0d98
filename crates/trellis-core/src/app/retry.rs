//! Retry policy for internal guarded writes.
//!
//! Services that write without a caller-supplied etag (create, lease
//! acquire/heartbeat/release/reclaim) re-read and retry when an unrelated
//! writer bumped the collection in between.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the second attempt.
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Scale each delay by a random factor in `[0.5, 1.0]`.
    pub jitter: bool,
}

impl RetryPolicy {
    /// Short, jittered backoff suited to in-process write contention.
    pub fn guarded_write() -> Self {
        Self {
            base_delay: Duration::from_millis(5),
            multiplier: 2.0,
            max_delay: Duration::from_millis(250),
            max_attempts: 8,
            jitter: true,
        }
    }

    /// No waiting between attempts. For tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
            max_attempts,
            jitter: false,
        }
    }

    /// Delay after `attempts` failed attempts (1-indexed):
    /// `base_delay * multiplier^(attempts - 1)`, capped at `max_delay`.
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = i32::try_from(attempts.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = if secs.is_finite() {
            secs.min(self.max_delay.as_secs_f64())
        } else {
            self.max_delay.as_secs_f64()
        };

        let factor = if self.jitter {
            rand::thread_rng().gen_range(0.5..=1.0)
        } else {
            1.0
        };
        Duration::from_secs_f64(capped * factor)
    }

    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Sleep for [`next_delay`](Self::next_delay).
    pub async fn wait(&self, attempts: u32) {
        let delay = self.next_delay(attempts);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::guarded_write()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(10),
            multiplier: 2.0,
            max_delay: Duration::from_millis(50),
            max_attempts: 4,
            jitter: false,
        }
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = plain();
        assert_eq!(policy.next_delay(1), Duration::from_millis(10));
        assert_eq!(policy.next_delay(2), Duration::from_millis(20));
        assert_eq!(policy.next_delay(3), Duration::from_millis(40));
        assert_eq!(policy.next_delay(4), Duration::from_millis(50));
        assert_eq!(policy.next_delay(u32::MAX), Duration::from_millis(50));
    }

    #[test]
    fn jitter_stays_within_half_to_full_delay() {
        let policy = RetryPolicy {
            jitter: true,
            ..plain()
        };
        for _ in 0..100 {
            let delay = policy.next_delay(2);
            assert!(delay >= Duration::from_millis(10) && delay <= Duration::from_millis(20));
        }
    }

    #[test]
    fn attempts_are_bounded() {
        let policy = plain();
        assert!(policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }
}
