//! Reconnection backoff for ticket push channels
//!
//! Pure attempt-counter arithmetic: the delay before reconnect attempt `n`
//! (0-indexed) is `base_delay * 2^n`, and no delay is produced once
//! `max_attempts` reconnects have been spent.

use std::time::Duration;

/// Backoff parameters shared by every channel of a multiplexer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first reconnect
    pub base_delay: Duration,
    /// Number of reconnects allowed before the channel is abandoned
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_attempts: 5,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_attempts,
        }
    }

    /// Delay before reconnect `attempt`, or `None` once the cap is reached
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let multiplier = 2u32.checked_pow(attempt)?;
        self.base_delay.checked_mul(multiplier)
    }
}

/// Per-channel attempt counter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackoffState {
    attempts: u32,
}

impl BackoffState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconnects scheduled since the last successful open
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record a closed connection and return the delay before the next try.
    ///
    /// Returns `None` when the policy's cap has been exceeded; the caller
    /// gives up on the channel.
    pub fn record_failure(&mut self, policy: &BackoffPolicy) -> Option<Duration> {
        let delay = policy.delay_for(self.attempts)?;
        self.attempts += 1;
        Some(delay)
    }

    /// Record a successful open
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_per_attempt() {
        let policy = BackoffPolicy::new(Duration::from_millis(1000), 5);
        let delays: Vec<_> = (0..5).filter_map(|n| policy.delay_for(n)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(1000),
                Duration::from_millis(2000),
                Duration::from_millis(4000),
                Duration::from_millis(8000),
                Duration::from_millis(16000),
            ]
        );
    }

    #[test]
    fn test_no_delay_past_cap() {
        let policy = BackoffPolicy::new(Duration::from_millis(1000), 5);
        assert_eq!(policy.delay_for(5), None);
        assert_eq!(policy.delay_for(40), None);
    }

    #[test]
    fn test_overflow_is_treated_as_exhausted() {
        let policy = BackoffPolicy::new(Duration::from_secs(u64::MAX / 2), 64);
        assert_eq!(policy.delay_for(63), None);
    }

    #[test]
    fn test_state_counts_and_resets() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), 2);
        let mut state = BackoffState::new();

        assert_eq!(state.record_failure(&policy), Some(Duration::from_millis(100)));
        assert_eq!(state.record_failure(&policy), Some(Duration::from_millis(200)));
        assert_eq!(state.record_failure(&policy), None);
        assert_eq!(state.attempts(), 2);

        state.reset();
        assert_eq!(state.attempts(), 0);
        assert_eq!(state.record_failure(&policy), Some(Duration::from_millis(100)));
    }
}
