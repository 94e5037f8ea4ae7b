// Exponential-backoff retry policy with jitter for adapter calls.

use crate::utils::{NotifyError, NotifyResult};
use rand::Rng;
use std::time::Duration;

/// Retry policy for transient delivery failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Jitter factor in [0, 1]: each delay is multiplied by a random value in
    /// [1 - jitter, 1 + jitter].
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 5_000,
            max_delay_ms: 60_000,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Read `RETRY_MAX_ATTEMPTS`, `RETRY_INITIAL_DELAY_MS`,
    /// `RETRY_MAX_DELAY_MS` and `RETRY_JITTER`.
    pub fn from_env() -> NotifyResult<Self> {
        let mut policy = Self::default();
        if let Ok(raw) = std::env::var("RETRY_MAX_ATTEMPTS") {
            policy.max_attempts = raw.trim().parse().map_err(|_| {
                NotifyError::config_error(format!("RETRY_MAX_ATTEMPTS must be an integer: {}", raw))
            })?;
        }
        if let Ok(raw) = std::env::var("RETRY_INITIAL_DELAY_MS") {
            policy.initial_delay_ms = raw.trim().parse().map_err(|_| {
                NotifyError::config_error(format!(
                    "RETRY_INITIAL_DELAY_MS must be an integer: {}",
                    raw
                ))
            })?;
        }
        if let Ok(raw) = std::env::var("RETRY_MAX_DELAY_MS") {
            policy.max_delay_ms = raw.trim().parse().map_err(|_| {
                NotifyError::config_error(format!("RETRY_MAX_DELAY_MS must be an integer: {}", raw))
            })?;
        }
        if let Ok(raw) = std::env::var("RETRY_JITTER") {
            policy.jitter = raw.trim().parse().map_err(|_| {
                NotifyError::config_error(format!("RETRY_JITTER must be a float: {}", raw))
            })?;
        }
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> NotifyResult<()> {
        if self.max_attempts == 0 {
            return Err(NotifyError::config_error(
                "max_attempts must be greater than 0",
            ));
        }
        if self.initial_delay_ms == 0 {
            return Err(NotifyError::config_error(
                "initial_delay_ms must be greater than 0",
            ));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(NotifyError::config_error(
                "max_delay_ms must be >= initial_delay_ms",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(NotifyError::config_error("jitter must be between 0.0 and 1.0"));
        }
        Ok(())
    }

    /// Whether another in-process attempt is allowed after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Base (deterministic) delay before attempt `attempt + 1`, capped.
    pub fn base_delay_ms(&self, attempt: u32) -> u64 {
        let exp = attempt.saturating_sub(1).min(20);
        let delay = self.initial_delay_ms.saturating_mul(1u64 << exp);
        delay.min(self.max_delay_ms)
    }

    /// Base delay with jitter applied.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms(attempt) as f64;
        let jittered = if self.jitter > 0.0 {
            let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
            base * factor
        } else {
            base
        };
        Duration::from_millis(jittered.max(0.0) as u64)
    }

    /// Jittered delay on top of an externally imposed floor, used when a
    /// circuit's remaining cooldown dictates the minimum wait.
    pub fn delay_with_floor(&self, floor: Duration) -> Duration {
        let extra = if self.jitter > 0.0 {
            let span = (self.initial_delay_ms as f64) * self.jitter;
            rand::thread_rng().gen_range(0.0..=span)
        } else {
            0.0
        };
        floor + Duration::from_millis(extra as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_is_valid() {
        let policy = RetryPolicy::default();
        assert!(policy.validate().is_ok());
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_delay_ms, 5_000);
    }

    #[test]
    fn test_exponential_backoff_with_cap() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay_ms: 5_000,
            max_delay_ms: 60_000,
            jitter: 0.0,
        };
        assert_eq!(policy.base_delay_ms(1), 5_000);
        assert_eq!(policy.base_delay_ms(2), 10_000);
        assert_eq!(policy.base_delay_ms(3), 20_000);
        assert_eq!(policy.base_delay_ms(4), 40_000);
        assert_eq!(policy.base_delay_ms(5), 60_000); // capped
        assert_eq!(policy.base_delay_ms(12), 60_000);
    }

    #[test]
    fn test_should_retry_respects_budget() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            jitter: 0.5,
        };
        for _ in 0..100 {
            let delay = policy.delay_for_attempt(1).as_millis() as u64;
            assert!((500..=1_500).contains(&delay), "delay out of band: {}", delay);
        }
    }

    #[test]
    fn test_delay_with_floor_never_undercuts() {
        let policy = RetryPolicy::default();
        let floor = Duration::from_millis(12_345);
        for _ in 0..20 {
            assert!(policy.delay_with_floor(floor) >= floor);
        }
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let policy = RetryPolicy {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(policy.validate().is_err());

        let policy = RetryPolicy {
            max_delay_ms: 1,
            ..Default::default()
        };
        assert!(policy.validate().is_err());

        let policy = RetryPolicy {
            jitter: 1.5,
            ..Default::default()
        };
        assert!(policy.validate().is_err());
    }
}
