use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-run retry budget and backoff schedule.
///
/// `max_attempts` counts every attempt including the first, so `1` means no
/// retries. The delay before attempt `n + 1` is `backoff_base * 2^(n - 1)`,
/// capped at `backoff_cap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base", with = "secs")]
    pub backoff_base: Duration,
    #[serde(default = "default_backoff_cap", with = "secs")]
    pub backoff_cap: Duration,
}

fn default_max_attempts() -> u32 { 2 }
fn default_backoff_base() -> Duration { Duration::from_secs(300) }
fn default_backoff_cap() -> Duration { Duration::from_secs(3600) }

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base: default_backoff_base(),
            backoff_cap: default_backoff_cap(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_base: Duration, backoff_cap: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_base,
            backoff_cap,
        }
    }

    /// Whether another attempt is allowed after `attempt` attempts failed.
    pub fn can_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay after the `attempt`-th (1-based) failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.backoff_base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.backoff_cap)
            .min(self.backoff_cap)
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = RetryPolicy::new(10, Duration::from_secs(300), Duration::from_secs(3600));
        assert_eq!(policy.delay_for(1), Duration::from_secs(300));
        assert_eq!(policy.delay_for(2), Duration::from_secs(600));
        assert_eq!(policy.delay_for(3), Duration::from_secs(1200));
        assert_eq!(policy.delay_for(5), Duration::from_secs(3600));
        assert_eq!(policy.delay_for(40), Duration::from_secs(3600));
    }

    #[test]
    fn budget_counts_first_attempt() {
        let policy = RetryPolicy::new(3, Duration::ZERO, Duration::ZERO);
        assert!(policy.can_retry(1));
        assert!(policy.can_retry(2));
        assert!(!policy.can_retry(3));
        assert!(!RetryPolicy::new(0, Duration::ZERO, Duration::ZERO).can_retry(1));
    }

    #[test]
    fn defaults_from_toml() {
        let policy: RetryPolicy = toml::from_str("max_attempts = 4").unwrap();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.backoff_base, Duration::from_secs(300));
        assert_eq!(policy.backoff_cap, Duration::from_secs(3600));
    }
}
