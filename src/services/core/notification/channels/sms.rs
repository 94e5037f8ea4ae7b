// SMS channel: submits (from, to, body) to the SMS provider API; the
// provider SID becomes the external message id.

use super::{AdapterError, ChannelAdapter};
use crate::services::core::notification::template_store::RenderedMessage;
use crate::types::{Channel, DispatchRequest};
use crate::utils::{logger::Logger, LogLevel, NotifyError, NotifyResult};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::sync::Arc;

/// SMS provider configuration. Credentials are optional at build time and
/// enforced at send time (MissingConfig).
#[derive(Debug, Clone)]
pub struct SmsProviderConfig {
    pub api_url: String,
    pub account_sid: Option<String>,
    pub auth_token: Option<SecretString>,
    pub from_number: Option<String>,
    pub request_timeout_ms: u64,
}

impl Default for SmsProviderConfig {
    fn default() -> Self {
        Self {
            api_url: "https://localhost:8771/2010-04-01/Messages".to_string(),
            account_sid: None,
            auth_token: None,
            from_number: None,
            request_timeout_ms: 10_000,
        }
    }
}

impl SmsProviderConfig {
    /// Read `SMS_PROVIDER_URL`, `SMS_ACCOUNT_SID`, `SMS_AUTH_TOKEN` and
    /// `SMS_FROM_NUMBER`.
    pub fn from_env() -> NotifyResult<Self> {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var("SMS_PROVIDER_URL") {
            config.api_url = raw;
        }
        if let Ok(raw) = std::env::var("SMS_ACCOUNT_SID") {
            config.account_sid = Some(raw);
        }
        if let Ok(raw) = std::env::var("SMS_AUTH_TOKEN") {
            config.auth_token = Some(SecretString::new(raw));
        }
        if let Ok(raw) = std::env::var("SMS_FROM_NUMBER") {
            config.from_number = Some(raw);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> NotifyResult<()> {
        url::Url::parse(&self.api_url).map_err(|e| {
            NotifyError::config_error(format!("SMS_PROVIDER_URL is not a valid URL: {}", e))
        })?;
        Ok(())
    }

    pub fn has_credentials(&self) -> bool {
        self.account_sid.is_some() && self.auth_token.is_some() && self.from_number.is_some()
    }
}

/// Provider client seam for the SMS gateway.
#[async_trait]
pub trait SmsGateway: Send + Sync {
    /// Returns the provider SID for the accepted message.
    async fn submit(&self, from: &str, to: &str, body: &str) -> Result<String, AdapterError>;
}

#[derive(Debug, Deserialize)]
struct SmsApiResponse {
    sid: String,
}

/// HTTP implementation of the provider gateway.
pub struct HttpSmsGateway {
    config: SmsProviderConfig,
    client: reqwest::Client,
}

impl HttpSmsGateway {
    pub fn new(config: SmsProviderConfig) -> NotifyResult<Self> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| NotifyError::internal_error(format!("HTTP client build failed: {}", e)))?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl SmsGateway for HttpSmsGateway {
    async fn submit(&self, from: &str, to: &str, body: &str) -> Result<String, AdapterError> {
        let sid = self
            .config
            .account_sid
            .as_deref()
            .ok_or_else(|| AdapterError::MissingConfig("SMS_ACCOUNT_SID".into()))?;
        let token = self
            .config
            .auth_token
            .as_ref()
            .ok_or_else(|| AdapterError::MissingConfig("SMS_AUTH_TOKEN".into()))?;

        let params = [("From", from), ("To", to), ("Body", body)];
        let response = self
            .client
            .post(&self.config.api_url)
            .basic_auth(sid, Some(token.expose_secret()))
            .form(&params)
            .send()
            .await
            .map_err(|e| AdapterError::Unavailable(format!("sms provider unreachable: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            let parsed: SmsApiResponse = response.json().await.map_err(|e| {
                AdapterError::Provider {
                    code: 502,
                    message: format!("malformed provider response: {}", e),
                }
            })?;
            Ok(parsed.sid)
        } else {
            let message = response.text().await.unwrap_or_default();
            if status.as_u16() == 400 && message.contains("not a valid phone number") {
                Err(AdapterError::RecipientRejected(message))
            } else {
                Err(AdapterError::Provider {
                    code: status.as_u16(),
                    message,
                })
            }
        }
    }
}

/// SMS channel adapter.
pub struct SmsAdapter {
    gateway: Arc<dyn SmsGateway>,
    from_number: Option<String>,
    logger: Logger,
}

impl SmsAdapter {
    pub fn new(gateway: Arc<dyn SmsGateway>, from_number: Option<String>) -> Self {
        Self {
            gateway,
            from_number,
            logger: Logger::new(LogLevel::Info),
        }
    }
}

#[async_trait]
impl ChannelAdapter for SmsAdapter {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    async fn send(
        &self,
        request: &DispatchRequest,
        message: &RenderedMessage,
    ) -> Result<String, AdapterError> {
        let from = self
            .from_number
            .as_deref()
            .ok_or_else(|| AdapterError::MissingConfig("SMS_FROM_NUMBER".into()))?;

        let to = request
            .phone_number
            .clone()
            .unwrap_or_else(|| request.recipient.clone());
        if to.trim().is_empty() {
            return Err(AdapterError::Validation("Recipient cannot be empty".into()));
        }

        if message.content.len() > Channel::Sms.max_content_length() {
            return Err(AdapterError::Validation(format!(
                "SMS content too long: {} > {}",
                message.content.len(),
                Channel::Sms.max_content_length()
            )));
        }

        let sid = self.gateway.submit(from, &to, &message.content).await?;
        self.logger.debug(&format!(
            "sms accepted for {} sid={}",
            request.notification_id, sid
        ));
        Ok(sid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeGateway {
        sent: Mutex<Vec<(String, String, String)>>,
    }

    #[async_trait]
    impl SmsGateway for FakeGateway {
        async fn submit(&self, from: &str, to: &str, body: &str) -> Result<String, AdapterError> {
            self.sent
                .lock()
                .unwrap()
                .push((from.to_string(), to.to_string(), body.to_string()));
            Ok("SM123".to_string())
        }
    }

    fn rendered(content: &str) -> RenderedMessage {
        RenderedMessage {
            subject: None,
            content: content.to_string(),
            html: None,
        }
    }

    #[tokio::test]
    async fn test_send_returns_provider_sid() {
        let gateway = Arc::new(FakeGateway {
            sent: Mutex::new(Vec::new()),
        });
        let adapter = SmsAdapter::new(gateway.clone(), Some("+15005550006".to_string()));
        let request =
            DispatchRequest::new(Channel::Sms, "+14155550123").with_content("price alert");

        let sid = adapter.send(&request, &rendered("price alert")).await.unwrap();
        assert_eq!(sid, "SM123");

        let sent = gateway.sent.lock().unwrap();
        assert_eq!(sent[0].0, "+15005550006");
        assert_eq!(sent[0].1, "+14155550123");
    }

    #[tokio::test]
    async fn test_missing_from_number_is_missing_config() {
        let gateway = Arc::new(FakeGateway {
            sent: Mutex::new(Vec::new()),
        });
        let adapter = SmsAdapter::new(gateway, None);
        let request = DispatchRequest::new(Channel::Sms, "+14155550123").with_content("x");
        let err = adapter.send(&request, &rendered("x")).await.unwrap_err();
        assert!(matches!(err, AdapterError::MissingConfig(_)));
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let gateway = Arc::new(FakeGateway {
            sent: Mutex::new(Vec::new()),
        });
        let adapter = SmsAdapter::new(gateway, Some("+15005550006".to_string()));
        let request = DispatchRequest::new(Channel::Sms, "+14155550123").with_content("x");
        let body = "z".repeat(1_601);
        let err = adapter.send(&request, &rendered(&body)).await.unwrap_err();
        assert!(matches!(err, AdapterError::Validation(_)));
    }

    #[test]
    fn test_credentials_check() {
        let mut config = SmsProviderConfig::default();
        assert!(!config.has_credentials());
        config.account_sid = Some("AC1".to_string());
        config.auth_token = Some(SecretString::new("tok".to_string()));
        config.from_number = Some("+15005550006".to_string());
        assert!(config.has_credentials());
    }
}
