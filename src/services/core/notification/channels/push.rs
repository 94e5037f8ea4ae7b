// Mobile push channel: submits (deviceToken, title, body, data) to the push
// provider. No template path; content is always inline by the time it
// reaches this adapter.

use super::{AdapterError, ChannelAdapter};
use crate::services::core::notification::template_store::RenderedMessage;
use crate::types::{Channel, DispatchRequest};
use crate::utils::{logger::Logger, LogLevel, NotifyError, NotifyResult};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

/// Push provider configuration.
#[derive(Debug, Clone)]
pub struct PushProviderConfig {
    pub api_url: String,
    pub server_key: Option<SecretString>,
    pub request_timeout_ms: u64,
}

impl Default for PushProviderConfig {
    fn default() -> Self {
        Self {
            api_url: "https://localhost:8644/v1/messages:send".to_string(),
            server_key: None,
            request_timeout_ms: 2_000,
        }
    }
}

impl PushProviderConfig {
    /// Read `PUSH_PROVIDER_URL` and `PUSH_SERVER_KEY`.
    pub fn from_env() -> NotifyResult<Self> {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var("PUSH_PROVIDER_URL") {
            config.api_url = raw;
        }
        if let Ok(raw) = std::env::var("PUSH_SERVER_KEY") {
            config.server_key = Some(SecretString::new(raw));
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> NotifyResult<()> {
        url::Url::parse(&self.api_url).map_err(|e| {
            NotifyError::config_error(format!("PUSH_PROVIDER_URL is not a valid URL: {}", e))
        })?;
        Ok(())
    }
}

/// Provider client seam for the push gateway.
#[async_trait]
pub trait PushGateway: Send + Sync {
    async fn submit(
        &self,
        device_token: &str,
        title: &str,
        body: &str,
        data: serde_json::Value,
    ) -> Result<String, AdapterError>;
}

#[derive(Debug, Deserialize)]
struct PushApiResponse {
    message_id: String,
}

/// HTTP implementation of the push gateway.
pub struct HttpPushGateway {
    config: PushProviderConfig,
    client: reqwest::Client,
}

impl HttpPushGateway {
    pub fn new(config: PushProviderConfig) -> NotifyResult<Self> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| NotifyError::internal_error(format!("HTTP client build failed: {}", e)))?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl PushGateway for HttpPushGateway {
    async fn submit(
        &self,
        device_token: &str,
        title: &str,
        body: &str,
        data: serde_json::Value,
    ) -> Result<String, AdapterError> {
        let key = self
            .config
            .server_key
            .as_ref()
            .ok_or_else(|| AdapterError::MissingConfig("PUSH_SERVER_KEY".into()))?;

        let payload = json!({
            "to": device_token,
            "notification": { "title": title, "body": body },
            "data": data,
        });

        let response = self
            .client
            .post(&self.config.api_url)
            .header("Authorization", format!("key={}", key.expose_secret()))
            .json(&payload)
            .send()
            .await
            .map_err(|e| AdapterError::Unavailable(format!("push provider unreachable: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            let parsed: PushApiResponse = response.json().await.map_err(|e| {
                AdapterError::Provider {
                    code: 502,
                    message: format!("malformed provider response: {}", e),
                }
            })?;
            Ok(parsed.message_id)
        } else {
            let message = response.text().await.unwrap_or_default();
            if status.as_u16() == 404 || message.contains("NotRegistered") {
                Err(AdapterError::RecipientRejected(format!(
                    "device token rejected: {}",
                    message
                )))
            } else {
                Err(AdapterError::Provider {
                    code: status.as_u16(),
                    message,
                })
            }
        }
    }
}

/// PUSH channel adapter.
pub struct PushAdapter {
    gateway: Arc<dyn PushGateway>,
    logger: Logger,
}

impl PushAdapter {
    pub fn new(gateway: Arc<dyn PushGateway>) -> Self {
        Self {
            gateway,
            logger: Logger::new(LogLevel::Info),
        }
    }
}

#[async_trait]
impl ChannelAdapter for PushAdapter {
    fn channel(&self) -> Channel {
        Channel::Push
    }

    async fn send(
        &self,
        request: &DispatchRequest,
        message: &RenderedMessage,
    ) -> Result<String, AdapterError> {
        let device_token = request
            .device_token
            .as_deref()
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| AdapterError::Validation("Push requires a device token".into()))?;

        if message.content.len() > Channel::Push.max_content_length() {
            return Err(AdapterError::Validation(format!(
                "Push content too long: {} > {}",
                message.content.len(),
                Channel::Push.max_content_length()
            )));
        }

        let title = message.subject.clone().unwrap_or_default();
        let data = json!({
            "notificationId": request.notification_id,
            "referenceId": request.reference_id,
            "referenceType": request.reference_type,
        });

        let message_id = self
            .gateway
            .submit(device_token, &title, &message.content, data)
            .await?;
        self.logger.debug(&format!(
            "push accepted for {} message_id={}",
            request.notification_id, message_id
        ));
        Ok(message_id)
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
    impl PushGateway for FakeGateway {
        async fn submit(
            &self,
            device_token: &str,
            title: &str,
            body: &str,
            _data: serde_json::Value,
        ) -> Result<String, AdapterError> {
            self.sent.lock().unwrap().push((
                device_token.to_string(),
                title.to_string(),
                body.to_string(),
            ));
            Ok("pm-1".to_string())
        }
    }

    fn rendered(content: &str) -> RenderedMessage {
        RenderedMessage {
            subject: Some("Price alert".to_string()),
            content: content.to_string(),
            html: None,
        }
    }

    #[tokio::test]
    async fn test_send_requires_device_token() {
        let gateway = Arc::new(FakeGateway {
            sent: Mutex::new(Vec::new()),
        });
        let adapter = PushAdapter::new(gateway);
        let request = DispatchRequest::new(Channel::Push, "user-1").with_content("x");
        let err = adapter.send(&request, &rendered("x")).await.unwrap_err();
        assert!(matches!(err, AdapterError::Validation(_)));
    }

    #[tokio::test]
    async fn test_send_submits_token_title_body() {
        let gateway = Arc::new(FakeGateway {
            sent: Mutex::new(Vec::new()),
        });
        let adapter = PushAdapter::new(gateway.clone());
        let request = DispatchRequest::new(Channel::Push, "user-1")
            .with_device_token("dtok-abc")
            .with_content("BTC dropped 5%");

        let id = adapter
            .send(&request, &rendered("BTC dropped 5%"))
            .await
            .unwrap();
        assert_eq!(id, "pm-1");

        let sent = gateway.sent.lock().unwrap();
        assert_eq!(sent[0].0, "dtok-abc");
        assert_eq!(sent[0].1, "Price alert");
        assert_eq!(sent[0].2, "BTC dropped 5%");
    }

    #[tokio::test]
    async fn test_oversized_content_rejected() {
        let gateway = Arc::new(FakeGateway {
            sent: Mutex::new(Vec::new()),
        });
        let adapter = PushAdapter::new(gateway);
        let request = DispatchRequest::new(Channel::Push, "user-1")
            .with_device_token("dtok")
            .with_content("x");
        let big = "z".repeat(2_049);
        let err = adapter.send(&request, &rendered(&big)).await.unwrap_err();
        assert!(matches!(err, AdapterError::Validation(_)));
    }
}
