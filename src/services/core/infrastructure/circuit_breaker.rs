// Per-channel circuit breaker protecting the external delivery providers.

use crate::types::Channel;
use crate::utils::{NotifyError, NotifyResult};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    /// Error ratio over the rolling outcome window that opens the circuit.
    pub error_rate_threshold: f32,
    /// Rolling window length in calls.
    pub window_size: usize,
    /// Minimum calls in the window before the ratio is evaluated.
    pub min_calls: usize,
    /// Cooldown while OPEN before admitting half-open probes.
    pub wait_ms: u64,
    /// Probe budget in HALF_OPEN.
    pub half_open_max_calls: u32,
    /// Successful probes required to close from HALF_OPEN.
    pub half_open_success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            error_rate_threshold: 0.5,
            window_size: 20,
            min_calls: 4,
            wait_ms: 30_000,
            half_open_max_calls: 3,
            half_open_success_threshold: 2,
        }
    }
}

impl CircuitBreakerConfig {
    /// Read `CB_{CHANNEL}_ERROR_RATE`, `CB_{CHANNEL}_WAIT_MS` and
    /// `CB_{CHANNEL}_HALF_OPEN_CALLS` for one channel.
    pub fn from_env(channel: Channel) -> NotifyResult<Self> {
        let mut config = Self::default();
        let prefix = format!("CB_{}", channel.as_str());

        if let Ok(raw) = std::env::var(format!("{}_ERROR_RATE", prefix)) {
            let parsed: f32 = raw.trim().parse().map_err(|_| {
                NotifyError::config_error(format!("{}_ERROR_RATE must be a float: {}", prefix, raw))
            })?;
            config.error_rate_threshold = parsed;
        }
        if let Ok(raw) = std::env::var(format!("{}_WAIT_MS", prefix)) {
            config.wait_ms = raw.trim().parse().map_err(|_| {
                NotifyError::config_error(format!("{}_WAIT_MS must be an integer: {}", prefix, raw))
            })?;
        }
        if let Ok(raw) = std::env::var(format!("{}_HALF_OPEN_CALLS", prefix)) {
            config.half_open_max_calls = raw.trim().parse().map_err(|_| {
                NotifyError::config_error(format!(
                    "{}_HALF_OPEN_CALLS must be an integer: {}",
                    prefix, raw
                ))
            })?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> NotifyResult<()> {
        if !self.enabled {
            return Ok(());
        }
        if !(0.0..=1.0).contains(&self.error_rate_threshold) {
            return Err(NotifyError::config_error(
                "error_rate_threshold must be between 0.0 and 1.0",
            ));
        }
        if self.window_size == 0 {
            return Err(NotifyError::config_error(
                "window_size must be greater than 0",
            ));
        }
        if self.min_calls == 0 {
            return Err(NotifyError::config_error("min_calls must be greater than 0"));
        }
        if self.half_open_max_calls == 0 || self.half_open_success_threshold == 0 {
            return Err(NotifyError::config_error(
                "half-open thresholds must be greater than 0",
            ));
        }
        if self.half_open_success_threshold > self.half_open_max_calls {
            return Err(NotifyError::config_error(
                "half_open_success_threshold cannot exceed half_open_max_calls",
            ));
        }
        Ok(())
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

/// Observable snapshot of one breaker's state.
#[derive(Debug, Clone)]
pub struct CircuitStateInfo {
    pub channel: Channel,
    pub state: CircuitState,
    pub window_error_rate: f32,
    pub total_calls: u64,
    pub total_failures: u64,
    pub remaining_cooldown: Option<Duration>,
}

/// Rolling-window error-ratio breaker for one channel.
#[derive(Debug)]
pub struct CircuitBreaker {
    channel: Channel,
    config: CircuitBreakerConfig,
    state: CircuitState,
    /// Recent call outcomes, true = failure.
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    half_open_calls: u32,
    half_open_successes: u32,
    total_calls: u64,
    total_failures: u64,
}

impl CircuitBreaker {
    pub fn new(channel: Channel, config: CircuitBreakerConfig) -> NotifyResult<Self> {
        config.validate()?;
        Ok(Self {
            channel,
            config,
            state: CircuitState::Closed,
            window: VecDeque::new(),
            opened_at: None,
            half_open_calls: 0,
            half_open_successes: 0,
            total_calls: 0,
            total_failures: 0,
        })
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Whether the next call may proceed. Transitions OPEN -> HALF_OPEN once
    /// the cooldown elapses, and meters half-open probes.
    pub fn can_execute(&mut self) -> bool {
        if !self.config.enabled {
            return true;
        }

        match self.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => {
                if self.half_open_calls < self.config.half_open_max_calls {
                    self.half_open_calls += 1;
                    true
                } else {
                    false
                }
            }
            CircuitState::Open => {
                let elapsed = self.opened_at.map(|at| at.elapsed()).unwrap_or_default();
                if elapsed >= Duration::from_millis(self.config.wait_ms) {
                    self.transition_to_half_open();
                    self.half_open_calls += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.total_calls += 1;
        match self.state {
            CircuitState::Closed => self.push_outcome(false),
            CircuitState::HalfOpen => {
                self.half_open_successes += 1;
                if self.half_open_successes >= self.config.half_open_success_threshold {
                    self.transition_to_closed();
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&mut self) {
        self.total_calls += 1;
        self.total_failures += 1;
        match self.state {
            CircuitState::Closed => {
                self.push_outcome(true);
                if self.window.len() >= self.config.min_calls
                    && self.window_error_rate() >= self.config.error_rate_threshold
                {
                    self.transition_to_open();
                }
            }
            CircuitState::HalfOpen => self.transition_to_open(),
            CircuitState::Open => {}
        }
    }

    /// Cooldown left before half-open probing, while OPEN.
    pub fn remaining_cooldown(&self) -> Option<Duration> {
        if self.state != CircuitState::Open {
            return None;
        }
        let wait = Duration::from_millis(self.config.wait_ms);
        self.opened_at
            .map(|at| wait.saturating_sub(at.elapsed()))
            .or(Some(wait))
    }

    pub fn window_error_rate(&self) -> f32 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|failed| **failed).count();
        failures as f32 / self.window.len() as f32
    }

    pub fn state_info(&self) -> CircuitStateInfo {
        CircuitStateInfo {
            channel: self.channel,
            state: self.state,
            window_error_rate: self.window_error_rate(),
            total_calls: self.total_calls,
            total_failures: self.total_failures,
            remaining_cooldown: self.remaining_cooldown(),
        }
    }

    fn push_outcome(&mut self, failed: bool) {
        self.window.push_back(failed);
        while self.window.len() > self.config.window_size {
            self.window.pop_front();
        }
    }

    fn transition_to_open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.half_open_calls = 0;
        self.half_open_successes = 0;
    }

    fn transition_to_half_open(&mut self) {
        self.state = CircuitState::HalfOpen;
        self.half_open_calls = 0;
        self.half_open_successes = 0;
    }

    fn transition_to_closed(&mut self) {
        self.state = CircuitState::Closed;
        self.window.clear();
        self.opened_at = None;
        self.half_open_calls = 0;
        self.half_open_successes = 0;
    }
}

/// Holds one breaker per channel.
pub struct CircuitBreakerManager {
    breakers: HashMap<Channel, Arc<Mutex<CircuitBreaker>>>,
}

impl CircuitBreakerManager {
    pub fn new(configs: HashMap<Channel, CircuitBreakerConfig>) -> NotifyResult<Self> {
        let mut breakers = HashMap::new();
        for channel in Channel::all() {
            let config = configs.get(&channel).cloned().unwrap_or_default();
            breakers.insert(
                channel,
                Arc::new(Mutex::new(CircuitBreaker::new(channel, config)?)),
            );
        }
        Ok(Self { breakers })
    }

    pub fn from_env() -> NotifyResult<Self> {
        let mut configs = HashMap::new();
        for channel in Channel::all() {
            configs.insert(channel, CircuitBreakerConfig::from_env(channel)?);
        }
        Self::new(configs)
    }

    pub fn breaker(&self, channel: Channel) -> Arc<Mutex<CircuitBreaker>> {
        // Every channel is populated in the constructor.
        Arc::clone(self.breakers.get(&channel).expect("breaker per channel"))
    }

    pub fn all_states(&self) -> Vec<CircuitStateInfo> {
        let mut states: Vec<CircuitStateInfo> = self
            .breakers
            .values()
            .filter_map(|breaker| breaker.lock().ok().map(|guard| guard.state_info()))
            .collect();
        states.sort_by_key(|info| info.channel.as_str());
        states
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: f32, min_calls: usize, wait_ms: u64) -> CircuitBreaker {
        let config = CircuitBreakerConfig {
            error_rate_threshold: threshold,
            window_size: 4,
            min_calls,
            wait_ms,
            half_open_max_calls: 1,
            half_open_success_threshold: 1,
            ..Default::default()
        };
        CircuitBreaker::new(Channel::Email, config).unwrap()
    }

    #[test]
    fn test_opens_after_error_rate_exceeded() {
        let mut cb = breaker(0.5, 4, 30_000);

        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);

        // 3 failures out of 4 = 75% >= 50%
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_execute());
        assert!(cb.remaining_cooldown().is_some());
    }

    #[test]
    fn test_half_open_probe_closes_on_success() {
        let mut cb = breaker(0.5, 2, 0);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        // Zero cooldown: next check admits a half-open probe.
        assert!(cb.can_execute());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.can_execute());
    }

    #[test]
    fn test_half_open_probe_failure_reopens() {
        let mut cb = breaker(0.5, 2, 0);
        cb.record_failure();
        cb.record_failure();
        assert!(cb.can_execute());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_half_open_meters_probe_budget() {
        let config = CircuitBreakerConfig {
            error_rate_threshold: 0.5,
            window_size: 4,
            min_calls: 2,
            wait_ms: 0,
            half_open_max_calls: 2,
            half_open_success_threshold: 2,
            ..Default::default()
        };
        let mut cb = CircuitBreaker::new(Channel::Sms, config).unwrap();
        cb.record_failure();
        cb.record_failure();

        assert!(cb.can_execute()); // probe 1
        assert!(cb.can_execute()); // probe 2
        assert!(!cb.can_execute()); // budget exhausted
    }

    #[test]
    fn test_successes_keep_circuit_closed() {
        let mut cb = breaker(0.5, 4, 30_000);
        for _ in 0..20 {
            cb.record_success();
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.window_error_rate(), 0.0);
    }

    #[test]
    fn test_manager_provides_breaker_per_channel() {
        let manager = CircuitBreakerManager::new(HashMap::new()).unwrap();
        for channel in Channel::all() {
            let breaker = manager.breaker(channel);
            assert_eq!(breaker.lock().unwrap().channel(), channel);
        }
        assert_eq!(manager.all_states().len(), 4);
    }

    #[test]
    fn test_config_validation() {
        let config = CircuitBreakerConfig {
            error_rate_threshold: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = CircuitBreakerConfig {
            half_open_success_threshold: 5,
            half_open_max_calls: 3,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
