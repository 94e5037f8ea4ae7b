// Sliding-window rate limiting for per-recipient and global channel caps.

use crate::types::Channel;
use crate::utils::{logger::Logger, LogLevel, NotifyError, NotifyResult};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

const SHARD_COUNT: usize = 16;

/// Configuration for the rate limiter.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub enabled: bool,
    /// Window length; one hour per the channel caps.
    pub window_seconds: i64,
    /// Per-channel hourly limits, keyed by channel.
    pub limits: HashMap<Channel, u32>,
    /// Deny on internal inconsistency instead of allowing.
    pub fail_closed: bool,
    pub janitor_interval_seconds: u64,
    /// Windows idle beyond this are removed by the janitor.
    pub stale_window_seconds: i64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        let mut limits = HashMap::new();
        for channel in Channel::all() {
            limits.insert(channel, channel.default_rate_limit_per_hour());
        }
        Self {
            enabled: true,
            window_seconds: 3600,
            limits,
            fail_closed: false,
            janitor_interval_seconds: 300,
            stale_window_seconds: 7200,
        }
    }
}

impl RateLimiterConfig {
    /// Read `RATE_LIMIT_{CHANNEL}_PER_HOUR` and `RATE_LIMIT_FAIL_CLOSED`.
    pub fn from_env() -> NotifyResult<Self> {
        let mut config = Self::default();
        for channel in Channel::all() {
            let var = format!("RATE_LIMIT_{}_PER_HOUR", channel.as_str());
            if let Ok(raw) = std::env::var(&var) {
                if raw.trim().is_empty() {
                    continue;
                }
                let parsed: u32 = raw.trim().parse().map_err(|_| {
                    NotifyError::config_error(format!("{} must be a positive integer: {}", var, raw))
                })?;
                config.limits.insert(channel, parsed);
            }
        }
        if let Ok(raw) = std::env::var("RATE_LIMIT_FAIL_CLOSED") {
            config.fail_closed = matches!(raw.trim(), "1" | "true" | "TRUE" | "yes");
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> NotifyResult<()> {
        if self.window_seconds <= 0 {
            return Err(NotifyError::config_error(
                "window_seconds must be greater than 0",
            ));
        }
        if self.janitor_interval_seconds == 0 {
            return Err(NotifyError::config_error(
                "janitor_interval_seconds must be greater than 0",
            ));
        }
        for (channel, limit) in &self.limits {
            if *limit == 0 {
                return Err(NotifyError::config_error(format!(
                    "rate limit for {} must be greater than 0",
                    channel
                )));
            }
        }
        Ok(())
    }

    pub fn limit_for(&self, channel: Channel) -> u32 {
        self.limits
            .get(&channel)
            .copied()
            .unwrap_or_else(|| channel.default_rate_limit_per_hour())
    }
}

/// Remaining-quota view of one window, for 429 responses and bulk pre-checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitStatus {
    pub key: String,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at_epoch: i64,
    pub is_limited: bool,
}

#[derive(Debug, Clone, Copy)]
struct WindowCounter {
    count: u32,
    window_start: i64,
}

/// Fixed one-hour sliding window per key. Counters are sharded by key hash so
/// hot dispatch paths contend only within a shard.
pub struct RateLimiter {
    config: RateLimiterConfig,
    shards: Vec<Mutex<HashMap<String, WindowCounter>>>,
    logger: Logger,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> NotifyResult<Self> {
        config.validate()?;
        let shards = (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect();
        Ok(Self {
            config,
            shards,
            logger: Logger::new(LogLevel::Info),
        })
    }

    /// Key for a per-recipient window.
    pub fn recipient_key(channel: Channel, recipient: &str) -> String {
        format!("{}:{}", channel.as_str(), recipient)
    }

    /// Key for the channel-wide window.
    pub fn global_key(channel: Channel) -> String {
        format!("{}:global", channel.as_str())
    }

    /// Check-and-consume `n` units against the channel limit derived from the
    /// key prefix. Returns false and logs on deny.
    pub fn allow(&self, key: &str, n: u32) -> bool {
        let limit = self.limit_for_key(key);
        self.allow_with_limit(key, n, limit)
    }

    /// Check-and-consume with an explicit limit; used for per-user frequency
    /// caps where the limit comes from the user's preferences.
    pub fn allow_with_limit(&self, key: &str, n: u32, limit: u32) -> bool {
        self.allow_in_window(key, n, limit, self.config.window_seconds)
    }

    /// Check-and-consume against an explicit window length, for caps that do
    /// not follow the hourly default (e.g. per-day user frequency limits).
    pub fn allow_in_window(&self, key: &str, n: u32, limit: u32, window_seconds: i64) -> bool {
        if !self.config.enabled {
            return true;
        }

        let now = Utc::now().timestamp();
        let shard = self.shard_for(key);
        let mut windows = match shard.lock() {
            Ok(guard) => guard,
            Err(_) => {
                self.logger.warn(&format!(
                    "rate window shard poisoned for key {}; failing {}",
                    key,
                    if self.config.fail_closed { "closed" } else { "open" }
                ));
                return !self.config.fail_closed;
            }
        };

        let counter = windows.entry(key.to_string()).or_insert(WindowCounter {
            count: 0,
            window_start: now,
        });

        if now - counter.window_start >= window_seconds {
            counter.count = 0;
            counter.window_start = now;
        }

        if counter.count.saturating_add(n) > limit {
            self.logger.info(&format!(
                "rate limit denied key={} count={} n={} limit={}",
                key, counter.count, n, limit
            ));
            return false;
        }

        counter.count += n;
        true
    }

    /// Unconditionally record `n` units against the key's window.
    pub fn record(&self, key: &str, n: u32) {
        if !self.config.enabled {
            return;
        }
        let now = Utc::now().timestamp();
        if let Ok(mut windows) = self.shard_for(key).lock() {
            let counter = windows.entry(key.to_string()).or_insert(WindowCounter {
                count: 0,
                window_start: now,
            });
            if now - counter.window_start >= self.config.window_seconds {
                counter.count = 0;
                counter.window_start = now;
            }
            counter.count = counter.count.saturating_add(n);
        }
    }

    pub fn status(&self, key: &str) -> RateLimitStatus {
        let limit = self.limit_for_key(key);
        let now = Utc::now().timestamp();

        let (count, window_start) = self
            .shard_for(key)
            .lock()
            .ok()
            .and_then(|windows| windows.get(key).copied())
            .map(|counter| {
                if now - counter.window_start >= self.config.window_seconds {
                    (0, now)
                } else {
                    (counter.count, counter.window_start)
                }
            })
            .unwrap_or((0, now));

        RateLimitStatus {
            key: key.to_string(),
            limit,
            remaining: limit.saturating_sub(count),
            reset_at_epoch: window_start + self.config.window_seconds,
            is_limited: count >= limit,
        }
    }

    /// Remove windows idle beyond the staleness horizon. Day-scoped windows
    /// (per-user daily frequency caps) age out on their own, longer horizon.
    pub fn sweep_stale(&self) -> usize {
        let now = Utc::now().timestamp();
        let horizon = self.config.stale_window_seconds;
        let mut removed = 0;
        for shard in &self.shards {
            if let Ok(mut windows) = shard.lock() {
                let before = windows.len();
                windows.retain(|key, counter| {
                    let key_horizon = if key.starts_with("user-day:") {
                        2 * 86_400
                    } else {
                        horizon
                    };
                    now - counter.window_start < key_horizon
                });
                removed += before - windows.len();
            }
        }
        if removed > 0 {
            self.logger
                .debug(&format!("rate window janitor removed {} stale windows", removed));
        }
        removed
    }

    /// Periodic janitor removing stale windows and orphan counters.
    pub fn spawn_janitor(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::clone(self);
        let interval = std::time::Duration::from_secs(limiter.config.janitor_interval_seconds);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                limiter.sweep_stale();
            }
        })
    }

    fn limit_for_key(&self, key: &str) -> u32 {
        key.split(':')
            .next()
            .and_then(|prefix| prefix.parse::<Channel>().ok())
            .map(|channel| self.config.limit_for(channel))
            .unwrap_or(u32::MAX)
    }

    fn shard_for(&self, key: &str) -> &Mutex<HashMap<String, WindowCounter>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter_with_email_limit(limit: u32) -> RateLimiter {
        let mut config = RateLimiterConfig::default();
        config.limits.insert(Channel::Email, limit);
        RateLimiter::new(config).unwrap()
    }

    #[test]
    fn test_allow_until_limit_then_deny() {
        let limiter = limiter_with_email_limit(3);
        let key = RateLimiter::recipient_key(Channel::Email, "a@x.io");

        assert!(limiter.allow(&key, 1));
        assert!(limiter.allow(&key, 1));
        assert!(limiter.allow(&key, 1));
        assert!(!limiter.allow(&key, 1));
    }

    #[test]
    fn test_bulk_consume_respects_limit_boundary() {
        let limiter = limiter_with_email_limit(5);
        let key = RateLimiter::global_key(Channel::Email);

        assert!(limiter.allow(&key, 5));
        assert!(!limiter.allow(&key, 1));
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = limiter_with_email_limit(1);
        assert!(limiter.allow(&RateLimiter::recipient_key(Channel::Email, "a@x.io"), 1));
        assert!(limiter.allow(&RateLimiter::recipient_key(Channel::Email, "b@x.io"), 1));
        assert!(!limiter.allow(&RateLimiter::recipient_key(Channel::Email, "a@x.io"), 1));
    }

    #[test]
    fn test_status_reports_remaining_quota() {
        let limiter = limiter_with_email_limit(10);
        let key = RateLimiter::recipient_key(Channel::Email, "a@x.io");
        assert!(limiter.allow(&key, 4));

        let status = limiter.status(&key);
        assert_eq!(status.limit, 10);
        assert_eq!(status.remaining, 6);
        assert!(!status.is_limited);
    }

    #[test]
    fn test_explicit_limit_for_user_frequency_keys() {
        let limiter = RateLimiter::new(RateLimiterConfig::default()).unwrap();
        let key = "user:u-1";
        assert!(limiter.allow_with_limit(key, 1, 2));
        assert!(limiter.allow_with_limit(key, 1, 2));
        assert!(!limiter.allow_with_limit(key, 1, 2));
    }

    #[test]
    fn test_sweep_removes_stale_windows() {
        let mut config = RateLimiterConfig::default();
        config.stale_window_seconds = 0;
        let limiter = RateLimiter::new(config).unwrap();
        limiter.record(&RateLimiter::global_key(Channel::Sms), 1);
        assert_eq!(limiter.sweep_stale(), 1);
    }

    #[test]
    fn test_disabled_limiter_always_allows() {
        let config = RateLimiterConfig {
            enabled: false,
            ..Default::default()
        };
        let limiter = RateLimiter::new(config).unwrap();
        let key = RateLimiter::recipient_key(Channel::Sms, "+14155550123");
        for _ in 0..1000 {
            assert!(limiter.allow(&key, 1));
        }
    }

    #[test]
    fn test_config_validation() {
        let mut config = RateLimiterConfig::default();
        config.limits.insert(Channel::Push, 0);
        assert!(config.validate().is_err());

        let config = RateLimiterConfig {
            window_seconds: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
