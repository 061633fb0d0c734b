//! Reconnect policies for a [`Session`](crate::session::Session).

use std::time::Duration;

use rand::Rng;

use crate::error::ConnectionError;

/// Trait defining interface for reconnect policies.
pub trait ReconnectPolicy {
    /// Get the next reconnect delay.
    /// Returns None if no reconnect should be attempted.
    fn next_reconnect_delay(&self, prev_attempts: u32, error: &ConnectionError)
    -> Option<Duration>;
}

/// A reconnect policy that exponentially backs off the delay between reconnect attempts.
///
/// Reconnects range from 128ms to the specified max wait time, before applying jitter.
#[derive(Clone)]
pub struct ExponentialBackoffWithJitter {
    /// The longest possible time to wait between reconnect attempts.
    pub max_wait: Duration,
    /// The max number of reconnect attempts before giving up.
    pub max_reconnect_attempts: Option<u32>,
}

impl ExponentialBackoffWithJitter {
    const MIN_EXPONENT: u32 = 7;
    const BASE_DELAY_MS: u64 = 2;
    /// Jitter multiplier range applied to the computed backoff delay.
    const JITTER_RANGE: std::ops::RangeInclusive<f64> = 0.95..=1.05;

    fn should_reconnect(&self, prev_attempts: u32, _error: &ConnectionError) -> bool {
        if let Some(max_attempts) = self.max_reconnect_attempts {
            prev_attempts < max_attempts
        } else {
            true
        }
    }

    fn calculate_delay(&self, prev_attempts: u32) -> Duration {
        // Exponent cannot be less than 7, to prevent the delay from being too short.
        let exponent = prev_attempts.saturating_add(Self::MIN_EXPONENT);
        let interval =
            Duration::from_millis(Self::BASE_DELAY_MS.saturating_pow(exponent)).min(self.max_wait);

        // Jitter symmetric around 1.0, to prevent multiple clients from reconnecting in lockstep
        // without systematically shortening or lengthening the backoff curve.
        let jitter_multiplier = rand::thread_rng().gen_range(Self::JITTER_RANGE);
        interval.mul_f64(jitter_multiplier)
    }
}

impl Default for ExponentialBackoffWithJitter {
    /// Indefinite reconnect, with a max wait time of 60 seconds.
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(60),
            max_reconnect_attempts: None,
        }
    }
}

impl ReconnectPolicy for ExponentialBackoffWithJitter {
    fn next_reconnect_delay(
        &self,
        attempt_count: u32,
        error: &ConnectionError,
    ) -> Option<Duration> {
        if self.should_reconnect(attempt_count, error) {
            Some(self.calculate_delay(attempt_count))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halts_after_max_attempts() {
        let policy = ExponentialBackoffWithJitter {
            max_wait: Duration::from_secs(1),
            max_reconnect_attempts: Some(3),
        };
        let err = ConnectionError::RequestsDone;
        assert!(policy.next_reconnect_delay(2, &err).is_some());
        assert!(policy.next_reconnect_delay(3, &err).is_none());
    }

    #[test]
    fn delay_never_exceeds_max_wait() {
        let policy = ExponentialBackoffWithJitter {
            max_wait: Duration::from_millis(500),
            max_reconnect_attempts: None,
        };
        let err = ConnectionError::RequestsDone;
        for attempt in 0..50 {
            let delay = policy.next_reconnect_delay(attempt, &err).unwrap();
            assert!(delay <= Duration::from_millis(500).mul_f64(1.05));
        }
    }
}
