//! Retry utilities: snapshot retry policy and its backoff builder.
//!
//! Uses `backon` for the delay schedule. Snapshot writes use a constant
//! delay with no jitter: the attempt budget is small and the delay fixed.

use std::time::Duration;

use backon::ConstantBuilder;
use serde::Deserialize;

/// Default number of attempts per snapshot write.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default delay between attempts, in milliseconds.
pub const DEFAULT_DELAY_MS: u64 = 1000;

/// Retry configuration as loaded from config files / environment.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    /// Delay between attempts in milliseconds.
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay_ms: DEFAULT_DELAY_MS,
        }
    }
}

/// Bounded retry policy for one snapshot write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay: Duration::from_millis(DEFAULT_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// A single attempt, no delay.
    pub fn single() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, Duration::from_millis(config.delay_ms))
    }
}

/// Backoff for snapshot write retries.
///
/// Yields `max_attempts - 1` delays: one before each attempt after the
/// first, none after the last.
pub fn snapshot_backoff(policy: &RetryPolicy) -> ConstantBuilder {
    ConstantBuilder::default()
        .with_delay(policy.delay)
        .with_max_times(policy.max_attempts.saturating_sub(1) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use backon::BackoffBuilder;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay, Duration::from_secs(1));
    }

    #[test]
    fn test_snapshot_backoff_yields_delays_between_attempts() {
        let delays: Vec<Duration> = snapshot_backoff(&RetryPolicy::default()).build().collect();
        assert_eq!(delays, vec![Duration::from_secs(1), Duration::from_secs(1)]);
    }

    #[test]
    fn test_single_policy_has_no_delays() {
        let delays: Vec<Duration> = snapshot_backoff(&RetryPolicy::single()).build().collect();
        assert!(delays.is_empty());
    }

    #[test]
    fn test_zero_attempts_clamped() {
        let policy = RetryPolicy::new(0, Duration::from_millis(5));
        assert_eq!(policy.max_attempts, 1);
    }

    #[test]
    fn test_policy_from_config() {
        let config = RetryConfig {
            max_attempts: 5,
            delay_ms: 250,
        };
        let policy = RetryPolicy::from(&config);
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.delay, Duration::from_millis(250));
    }
}
