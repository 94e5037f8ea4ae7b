// Channel adapters: one per delivery channel, invoked by the dispatcher
// through the composed timeout / retry / circuit-breaker policies.

pub mod email;
pub mod in_app;
pub mod push;
pub mod sms;

pub use email::{EmailAdapter, EmailProviderConfig, EmailTransport, HttpEmailTransport, OutboundEmail};
pub use in_app::InAppAdapter;
pub use push::{HttpPushGateway, PushAdapter, PushGateway, PushProviderConfig};
pub use sms::{HttpSmsGateway, SmsAdapter, SmsGateway, SmsProviderConfig};

use crate::services::core::infrastructure::circuit_breaker::CircuitBreaker;
use crate::services::core::infrastructure::retry::RetryPolicy;
use crate::services::core::notification::template_store::RenderedMessage;
use crate::types::{Channel, DispatchRequest};
use crate::utils::{logger::Logger, LogLevel, NotifyError, NotifyResult};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by channel adapters and provider clients. The taxonomy
/// drives retry decisions: transient failures are retried and counted by the
/// circuit breaker, permanent ones fail the dispatch immediately.
#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("recipient rejected: {0}")]
    RecipientRejected(String),
    #[error("missing provider configuration: {0}")]
    MissingConfig(String),
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("provider call timed out after {0}ms")]
    Timeout(u64),
    #[error("provider responded {code}: {message}")]
    Provider { code: u16, message: String },
}

impl AdapterError {
    pub fn is_transient(&self) -> bool {
        match self {
            AdapterError::Unavailable(_) | AdapterError::Timeout(_) => true,
            AdapterError::Provider { code, .. } => *code >= 500 || *code == 429,
            AdapterError::Validation(_)
            | AdapterError::RecipientRejected(_)
            | AdapterError::MissingConfig(_) => false,
        }
    }
}

impl From<AdapterError> for NotifyError {
    fn from(err: AdapterError) -> Self {
        match &err {
            AdapterError::MissingConfig(message) => NotifyError::missing_config(message.clone()),
            _ if err.is_transient() => NotifyError::adapter_transient(err.to_string()),
            _ => NotifyError::adapter_permanent(err.to_string()),
        }
    }
}

/// Common contract implemented by every delivery channel. `send` returns the
/// provider's external message id on acceptance.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn channel(&self) -> Channel;

    async fn send(
        &self,
        request: &DispatchRequest,
        message: &RenderedMessage,
    ) -> Result<String, AdapterError>;
}

/// The three policies wrapped around every adapter call, applied outward-in:
/// per-call time limit, retry with backoff, circuit breaker.
pub struct ChannelPolicies {
    channel: Channel,
    timeout: Duration,
    retry: RetryPolicy,
    breaker: Arc<Mutex<CircuitBreaker>>,
    logger: Logger,
}

impl ChannelPolicies {
    pub fn new(
        channel: Channel,
        timeout: Duration,
        retry: RetryPolicy,
        breaker: Arc<Mutex<CircuitBreaker>>,
    ) -> Self {
        Self {
            channel,
            timeout,
            retry,
            breaker,
            logger: Logger::new(LogLevel::Info),
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Remaining cooldown of the breaker, used by the retry scheduler to
    /// derive the re-queue backoff after a CircuitOpen failure.
    pub fn breaker_cooldown(&self) -> Option<Duration> {
        self.breaker
            .lock()
            .ok()
            .and_then(|guard| guard.remaining_cooldown())
    }

    /// Invoke the adapter under the composed policies. In-process retries are
    /// bounded by min(policy budget, request budget); CircuitOpen and
    /// exhausted transients bubble as retryable NotifyErrors for the retry
    /// scheduler.
    pub async fn execute(
        &self,
        adapter: &dyn ChannelAdapter,
        request: &DispatchRequest,
        message: &RenderedMessage,
    ) -> NotifyResult<String> {
        let budget = self
            .retry
            .max_attempts
            .min(request.max_retry_attempts.max(1));
        let mut attempt: u32 = 0;
        let mut last_error: Option<AdapterError> = None;

        while attempt < budget {
            attempt += 1;

            let admitted = self
                .breaker
                .lock()
                .map(|mut guard| guard.can_execute())
                .unwrap_or(true);
            if !admitted {
                self.logger.warn(&format!(
                    "{} circuit open, failing fast (attempt {})",
                    self.channel, attempt
                ));
                return Err(NotifyError::circuit_open(format!(
                    "{} circuit breaker is open",
                    self.channel
                )));
            }

            let outcome = match tokio::time::timeout(
                self.timeout,
                adapter.send(request, message),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(AdapterError::Timeout(self.timeout.as_millis() as u64)),
            };

            match outcome {
                Ok(external_id) => {
                    if let Ok(mut guard) = self.breaker.lock() {
                        guard.record_success();
                    }
                    return Ok(external_id);
                }
                Err(err) if err.is_transient() => {
                    if let Ok(mut guard) = self.breaker.lock() {
                        guard.record_failure();
                    }
                    self.logger.warn(&format!(
                        "{} transient failure on attempt {}/{}: {}",
                        self.channel, attempt, budget, err
                    ));
                    if self.retry.should_retry(attempt) && attempt < budget {
                        tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
                    }
                    last_error = Some(err);
                }
                Err(err) => {
                    // Permanent failures short-circuit and do not count
                    // toward the breaker's error window.
                    return Err(NotifyError::from(err));
                }
            }
        }

        let err = last_error
            .map(NotifyError::from)
            .unwrap_or_else(|| NotifyError::adapter_transient("delivery attempts exhausted"));
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::core::infrastructure::circuit_breaker::{
        CircuitBreakerConfig, CircuitState,
    };
    use crate::utils::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedAdapter {
        calls: AtomicU32,
        fail_first: u32,
        error: AdapterError,
    }

    #[async_trait]
    impl ChannelAdapter for ScriptedAdapter {
        fn channel(&self) -> Channel {
            Channel::Email
        }

        async fn send(
            &self,
            _request: &DispatchRequest,
            _message: &RenderedMessage,
        ) -> Result<String, AdapterError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                Err(self.error.clone())
            } else {
                Ok("ext-ok".to_string())
            }
        }
    }

    fn policies(retry_attempts: u32) -> ChannelPolicies {
        let breaker = CircuitBreaker::new(
            Channel::Email,
            CircuitBreakerConfig {
                window_size: 8,
                min_calls: 100, // effectively never opens in these tests
                ..Default::default()
            },
        )
        .unwrap();
        ChannelPolicies::new(
            Channel::Email,
            Duration::from_millis(500),
            RetryPolicy {
                max_attempts: retry_attempts,
                initial_delay_ms: 1,
                max_delay_ms: 2,
                jitter: 0.0,
            },
            Arc::new(Mutex::new(breaker)),
        )
    }

    fn request() -> DispatchRequest {
        DispatchRequest::new(Channel::Email, "a@x.io").with_content("hello")
    }

    fn message() -> RenderedMessage {
        RenderedMessage {
            subject: Some("s".to_string()),
            content: "hello".to_string(),
            html: None,
        }
    }

    #[test]
    fn test_adapter_error_taxonomy() {
        assert!(AdapterError::Timeout(10).is_transient());
        assert!(AdapterError::Unavailable("reset".into()).is_transient());
        assert!(AdapterError::Provider { code: 503, message: "".into() }.is_transient());
        assert!(AdapterError::Provider { code: 429, message: "".into() }.is_transient());
        assert!(!AdapterError::Provider { code: 400, message: "".into() }.is_transient());
        assert!(!AdapterError::Validation("bad".into()).is_transient());
        assert!(!AdapterError::MissingConfig("sid".into()).is_transient());

        let err: NotifyError = AdapterError::Timeout(10).into();
        assert_eq!(err.kind, ErrorKind::AdapterTransient);
        let err: NotifyError = AdapterError::RecipientRejected("bad".into()).into();
        assert_eq!(err.kind, ErrorKind::AdapterPermanent);
        let err: NotifyError = AdapterError::MissingConfig("sid".into()).into();
        assert_eq!(err.kind, ErrorKind::MissingConfig);
    }

    #[tokio::test]
    async fn test_transient_failures_retried_until_success() {
        let adapter = ScriptedAdapter {
            calls: AtomicU32::new(0),
            fail_first: 2,
            error: AdapterError::Unavailable("reset".into()),
        };
        let result = policies(3).execute(&adapter, &request(), &message()).await;
        assert_eq!(result.unwrap(), "ext-ok");
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_transient_exhaustion_yields_retryable_error() {
        let adapter = ScriptedAdapter {
            calls: AtomicU32::new(0),
            fail_first: 10,
            error: AdapterError::Unavailable("reset".into()),
        };
        let err = policies(2)
            .execute(&adapter, &request(), &message())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::AdapterTransient);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_short_circuits() {
        let adapter = ScriptedAdapter {
            calls: AtomicU32::new(0),
            fail_first: 10,
            error: AdapterError::RecipientRejected("bad address".into()),
        };
        let err = policies(3)
            .execute(&adapter, &request(), &message())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::AdapterPermanent);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_open_breaker_fails_fast_without_touching_adapter() {
        let breaker = CircuitBreaker::new(
            Channel::Email,
            CircuitBreakerConfig {
                window_size: 4,
                min_calls: 2,
                wait_ms: 60_000,
                ..Default::default()
            },
        )
        .unwrap();
        let breaker = Arc::new(Mutex::new(breaker));
        {
            let mut guard = breaker.lock().unwrap();
            guard.record_failure();
            guard.record_failure();
            assert_eq!(guard.state(), CircuitState::Open);
        }

        let policies = ChannelPolicies::new(
            Channel::Email,
            Duration::from_millis(500),
            RetryPolicy {
                max_attempts: 3,
                initial_delay_ms: 1,
                max_delay_ms: 2,
                jitter: 0.0,
            },
            breaker,
        );

        let adapter = ScriptedAdapter {
            calls: AtomicU32::new(0),
            fail_first: 0,
            error: AdapterError::Unavailable("unused".into()),
        };
        let err = policies
            .execute(&adapter, &request(), &message())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::CircuitOpen);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 0);
        assert!(policies.breaker_cooldown().is_some());
    }

    struct SlowAdapter;

    #[async_trait]
    impl ChannelAdapter for SlowAdapter {
        fn channel(&self) -> Channel {
            Channel::Email
        }

        async fn send(
            &self,
            _request: &DispatchRequest,
            _message: &RenderedMessage,
        ) -> Result<String, AdapterError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok("never".to_string())
        }
    }

    #[tokio::test]
    async fn test_deadline_counts_as_retryable_failure() {
        let policies = ChannelPolicies::new(
            Channel::Email,
            Duration::from_millis(10),
            RetryPolicy {
                max_attempts: 1,
                initial_delay_ms: 1,
                max_delay_ms: 2,
                jitter: 0.0,
            },
            Arc::new(Mutex::new(
                CircuitBreaker::new(Channel::Email, CircuitBreakerConfig::default()).unwrap(),
            )),
        );
        let err = policies
            .execute(&SlowAdapter, &request(), &message())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::AdapterTransient);
        assert!(err.is_retryable());
    }
}
