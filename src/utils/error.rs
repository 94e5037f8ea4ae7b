// src/utils/error.rs

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

pub type NotifyResult<T> = Result<T, NotifyError>;

/// Custom error details for additional context
pub type ErrorDetails = HashMap<String, serde_json::Value>;

/// Main error type for the notification service.
/// Optimized for size by boxing the details map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyError {
    pub message: String,
    pub details: Option<Box<ErrorDetails>>,
    pub status: Option<u16>,
    pub error_code: Option<String>,
    pub method: Option<String>,
    pub kind: ErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    ValidationError,
    NotFound,
    AlreadyExists,
    RateLimit,
    PreferenceBlocked,
    TemplateNotFound,
    TemplateInactive,
    InvalidTransition,
    AdapterTransient,
    AdapterPermanent,
    CircuitOpen,
    MissingConfig,
    ConfigError,
    ParseError,
    Serialization,
    Storage,
    AccessDenied,
    ServiceUnavailable,
    Internal,
}

impl fmt::Display for NotifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for NotifyError {}

impl NotifyError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
            status: None,
            error_code: None,
            method: None,
            kind,
        }
    }

    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = Some(Box::new(details));
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_code(mut self, error_code: impl Into<String>) -> Self {
        self.error_code = Some(error_code.into());
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    /// True for failures the retry scheduler may re-attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, ErrorKind::AdapterTransient | ErrorKind::CircuitOpen)
    }

    // Convenience constructors for common error types
    pub fn validation_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationError, message)
            .with_status(400)
            .with_code("VALIDATION_ERROR")
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
            .with_status(404)
            .with_code("NOT_FOUND")
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyExists, message)
            .with_status(409)
            .with_code("ALREADY_EXISTS")
    }

    pub fn rate_limit_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimit, message)
            .with_status(429)
            .with_code("RATE_LIMIT")
    }

    pub fn preference_blocked(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PreferenceBlocked, message)
            .with_status(403)
            .with_code("PREFERENCE_BLOCKED")
    }

    pub fn template_not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TemplateNotFound, message)
            .with_status(404)
            .with_code("TEMPLATE_NOT_FOUND")
    }

    pub fn template_inactive(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TemplateInactive, message)
            .with_status(409)
            .with_code("TEMPLATE_INACTIVE")
    }

    pub fn invalid_transition(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidTransition, message)
            .with_status(409)
            .with_code("INVALID_TRANSITION")
    }

    pub fn adapter_transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AdapterTransient, message)
            .with_status(503)
            .with_code("ADAPTER_TRANSIENT")
    }

    pub fn adapter_permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AdapterPermanent, message)
            .with_status(400)
            .with_code("ADAPTER_PERMANENT")
    }

    pub fn circuit_open(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CircuitOpen, message)
            .with_status(503)
            .with_code("CIRCUIT_OPEN")
    }

    pub fn missing_config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MissingConfig, message)
            .with_status(500)
            .with_code("MISSING_CONFIG")
    }

    pub fn config_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConfigError, message)
            .with_status(500)
            .with_code("CONFIG_ERROR")
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ParseError, message)
            .with_status(400)
            .with_code("PARSE_ERROR")
    }

    pub fn serialization_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Serialization, message)
            .with_status(400)
            .with_code("SERIALIZATION_ERROR")
    }

    pub fn storage_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Storage, message)
            .with_status(500)
            .with_code("STORAGE_ERROR")
    }

    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AccessDenied, message)
            .with_status(403)
            .with_code("ACCESS_DENIED")
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServiceUnavailable, message)
            .with_status(503)
            .with_code("SERVICE_UNAVAILABLE")
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
            .with_status(500)
            .with_code("INTERNAL_ERROR")
    }
}

// Implement From conversions for common error types
impl From<serde_json::Error> for NotifyError {
    fn from(err: serde_json::Error) -> Self {
        NotifyError::parse_error(format!("JSON parsing error: {}", err))
    }
}

impl From<&str> for NotifyError {
    fn from(err: &str) -> Self {
        Self::validation_error(err.to_string())
    }
}

impl From<url::ParseError> for NotifyError {
    fn from(err: url::ParseError) -> Self {
        NotifyError::validation_error(format!("URL parse error: {}", err))
    }
}

/// Helper macro for creating errors with context
#[macro_export]
macro_rules! notify_error {
    ($kind:expr, $msg:expr) => {
        NotifyError::new($kind, $msg)
    };
    ($kind:expr, $msg:expr, $($key:expr => $value:expr),+) => {{
        let mut details = std::collections::HashMap::new();
        $(
            details.insert($key.to_string(), serde_json::json!($value));
        )+
        NotifyError::new($kind, $msg).with_details(details)
    }};
}
