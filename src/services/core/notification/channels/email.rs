// Transactional email channel: builds an RFC-5322 message and submits it to
// the email provider, mapping the SMTP error taxonomy onto retry semantics.

use super::{AdapterError, ChannelAdapter};
use crate::services::core::notification::template_store::RenderedMessage;
use crate::types::{Channel, DispatchRequest};
use crate::utils::{logger::Logger, LogLevel, NotifyError, NotifyResult};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;

/// Email provider configuration.
#[derive(Debug, Clone)]
pub struct EmailProviderConfig {
    /// Message submission endpoint of the provider.
    pub endpoint: String,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    pub from_address: String,
    pub request_timeout_ms: u64,
}

impl Default for EmailProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://localhost:8587/messages".to_string(),
            username: None,
            password: None,
            from_address: "no-reply@trade-notify.local".to_string(),
            request_timeout_ms: 10_000,
        }
    }
}

impl EmailProviderConfig {
    /// Read `EMAIL_PROVIDER_URL`, `EMAIL_PROVIDER_USERNAME`,
    /// `EMAIL_PROVIDER_PASSWORD` and `EMAIL_FROM_ADDRESS`.
    pub fn from_env() -> NotifyResult<Self> {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var("EMAIL_PROVIDER_URL") {
            config.endpoint = raw;
        }
        if let Ok(raw) = std::env::var("EMAIL_PROVIDER_USERNAME") {
            config.username = Some(raw);
        }
        if let Ok(raw) = std::env::var("EMAIL_PROVIDER_PASSWORD") {
            config.password = Some(SecretString::new(raw));
        }
        if let Ok(raw) = std::env::var("EMAIL_FROM_ADDRESS") {
            config.from_address = raw;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> NotifyResult<()> {
        url::Url::parse(&self.endpoint).map_err(|e| {
            NotifyError::config_error(format!("EMAIL_PROVIDER_URL is not a valid URL: {}", e))
        })?;
        if !self.from_address.contains('@') {
            return Err(NotifyError::config_error(format!(
                "EMAIL_FROM_ADDRESS is not an email address: {}",
                self.from_address
            )));
        }
        Ok(())
    }

    /// AUTH PLAIN credential blob for the provider session, if configured.
    pub fn auth_plain(&self) -> Option<String> {
        let username = self.username.as_deref()?;
        let password = self.password.as_ref()?;
        let raw = format!("\0{}\0{}", username, password.expose_secret());
        Some(BASE64.encode(raw.as_bytes()))
    }
}

/// One outbound message in provider-agnostic form.
#[derive(Debug, Clone)]
pub struct OutboundEmail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub text_body: String,
    pub html_body: Option<String>,
}

impl OutboundEmail {
    /// Serialize as an RFC-5322 message; multipart/alternative when an HTML
    /// body is present.
    pub fn to_rfc5322(&self) -> String {
        let date = Utc::now().to_rfc2822();
        let mut message = String::new();
        message.push_str(&format!("From: {}\r\n", self.from));
        message.push_str(&format!("To: {}\r\n", self.to));
        message.push_str(&format!("Subject: {}\r\n", self.subject));
        message.push_str(&format!("Date: {}\r\n", date));
        message.push_str("MIME-Version: 1.0\r\n");

        match &self.html_body {
            Some(html) => {
                let boundary = "=_trade_notify_boundary";
                message.push_str(&format!(
                    "Content-Type: multipart/alternative; boundary=\"{}\"\r\n\r\n",
                    boundary
                ));
                message.push_str(&format!("--{}\r\n", boundary));
                message.push_str("Content-Type: text/plain; charset=utf-8\r\n\r\n");
                message.push_str(&self.text_body);
                message.push_str(&format!("\r\n--{}\r\n", boundary));
                message.push_str("Content-Type: text/html; charset=utf-8\r\n\r\n");
                message.push_str(html);
                message.push_str(&format!("\r\n--{}--\r\n", boundary));
            }
            None => {
                message.push_str("Content-Type: text/plain; charset=utf-8\r\n\r\n");
                message.push_str(&self.text_body);
                message.push_str("\r\n");
            }
        }
        message
    }
}

/// Map an SMTP-style reply code from the provider onto the adapter taxonomy.
pub fn map_smtp_code(code: u16, message: &str) -> AdapterError {
    match code {
        250 | 251 => AdapterError::Provider {
            code,
            message: format!("unexpected success mapping: {}", message),
        },
        421 | 450 | 451 | 452 => AdapterError::Unavailable(format!("smtp {}: {}", code, message)),
        550 | 551 | 553 => AdapterError::RecipientRejected(format!("smtp {}: {}", code, message)),
        500..=599 => AdapterError::Provider {
            code: 400,
            message: format!("smtp {}: {}", code, message),
        },
        _ => AdapterError::Provider {
            code: 502,
            message: format!("smtp {}: {}", code, message),
        },
    }
}

/// Provider client seam; the HTTP implementation is used in production and
/// in-memory fakes in tests.
#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn submit(&self, message: &OutboundEmail) -> Result<String, AdapterError>;
}

/// Submits messages to the provider's HTTP message-submission API.
pub struct HttpEmailTransport {
    config: EmailProviderConfig,
    client: reqwest::Client,
}

impl HttpEmailTransport {
    pub fn new(config: EmailProviderConfig) -> NotifyResult<Self> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| NotifyError::internal_error(format!("HTTP client build failed: {}", e)))?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl EmailTransport for HttpEmailTransport {
    async fn submit(&self, message: &OutboundEmail) -> Result<String, AdapterError> {
        let mut request = self
            .client
            .post(&self.config.endpoint)
            .header("Content-Type", "message/rfc822")
            .body(message.to_rfc5322());
        if let Some(auth) = self.config.auth_plain() {
            request = request.header("Authorization", format!("Basic {}", auth));
        }

        let response = request
            .send()
            .await
            .map_err(|e| AdapterError::Unavailable(format!("email provider unreachable: {}", e)))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status.is_success() {
            // Providers return the accepted message id in the body.
            let id = body.trim();
            if id.is_empty() {
                Ok(format!("email-{}", uuid::Uuid::new_v4()))
            } else {
                Ok(id.to_string())
            }
        } else if let Ok(smtp_code) = body.trim().split_whitespace().next().unwrap_or("").parse() {
            Err(map_smtp_code(smtp_code, &body))
        } else {
            Err(AdapterError::Provider {
                code: status.as_u16(),
                message: body,
            })
        }
    }
}

/// EMAIL channel adapter.
pub struct EmailAdapter {
    transport: Arc<dyn EmailTransport>,
    from_address: String,
    logger: Logger,
}

impl EmailAdapter {
    pub fn new(transport: Arc<dyn EmailTransport>, from_address: String) -> Self {
        Self {
            transport,
            from_address,
            logger: Logger::new(LogLevel::Info),
        }
    }

    fn recipient_address(request: &DispatchRequest) -> Result<String, AdapterError> {
        let address = request
            .email_address
            .clone()
            .unwrap_or_else(|| request.recipient.clone());
        if address.trim().is_empty() {
            return Err(AdapterError::Validation("Recipient cannot be empty".into()));
        }
        if !address.contains('@') {
            return Err(AdapterError::RecipientRejected(format!(
                "Not an email address: {}",
                address
            )));
        }
        Ok(address)
    }
}

#[async_trait]
impl ChannelAdapter for EmailAdapter {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn send(
        &self,
        request: &DispatchRequest,
        message: &RenderedMessage,
    ) -> Result<String, AdapterError> {
        let to = Self::recipient_address(request)?;

        if message.content.len() > Channel::Email.max_content_length() {
            return Err(AdapterError::Validation(format!(
                "Email content too long: {} > {}",
                message.content.len(),
                Channel::Email.max_content_length()
            )));
        }

        let outbound = OutboundEmail {
            from: self.from_address.clone(),
            to,
            subject: message
                .subject
                .clone()
                .unwrap_or_else(|| "(no subject)".to_string()),
            text_body: message.content.clone(),
            html_body: message.html.clone(),
        };

        let external_id = self.transport.submit(&outbound).await?;
        self.logger.debug(&format!(
            "email accepted for {} external_id={}",
            request.notification_id, external_id
        ));
        Ok(external_id)
    }
}
