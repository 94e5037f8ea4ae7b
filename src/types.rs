// src/types.rs
// Core domain types shared across the notification pipeline.

use crate::utils::{NotifyError, NotifyResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Generate a new opaque notification id (lexicographic string form).
pub fn generate_notification_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Generate a correlation id for tracing a notification end-to-end.
pub fn generate_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ============= CHANNELS =============

/// Delivery channels supported by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Channel {
    Email,
    Sms,
    Push,
    InApp,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "EMAIL",
            Channel::Sms => "SMS",
            Channel::Push => "PUSH",
            Channel::InApp => "IN_APP",
        }
    }

    pub fn all() -> [Channel; 4] {
        [Channel::Email, Channel::Sms, Channel::Push, Channel::InApp]
    }

    /// Hourly dispatch cap applied per recipient unless overridden by config.
    pub fn default_rate_limit_per_hour(&self) -> u32 {
        match self {
            Channel::Email => 1000,
            Channel::Sms => 100,
            Channel::Push => 10000,
            Channel::InApp => 1000,
        }
    }

    /// Per-call adapter deadline unless overridden by config.
    pub fn default_timeout_ms(&self) -> u64 {
        match self {
            Channel::Email | Channel::Sms => 10_000,
            Channel::Push | Channel::InApp => 2_000,
        }
    }

    pub fn max_content_length(&self) -> usize {
        match self {
            Channel::Email => 10_000,
            Channel::Sms => 1_600,
            Channel::Push => 2_048,
            Channel::InApp => 10_000,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Channel {
    type Err = NotifyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "EMAIL" => Ok(Channel::Email),
            "SMS" => Ok(Channel::Sms),
            "PUSH" => Ok(Channel::Push),
            "IN_APP" | "INAPP" => Ok(Channel::InApp),
            other => Err(NotifyError::validation_error(format!(
                "Unknown channel: {}",
                other
            ))),
        }
    }
}

// ============= PRIORITY =============

/// Priority affects quiet-hours bypass, ordering tie-breaks and retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "LOW",
            Priority::Medium => "MEDIUM",
            Priority::High => "HIGH",
            Priority::Urgent => "URGENT",
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Priority::Low => 3,
            Priority::Medium => 5,
            Priority::High => 8,
            Priority::Urgent => 10,
        }
    }

    /// Default retry budget for adapter failures at this priority.
    pub fn retry_budget(&self) -> u32 {
        match self {
            Priority::Low => 2,
            Priority::Medium => 3,
            Priority::High => 4,
            Priority::Urgent => 5,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Priority {
    type Err = NotifyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "LOW" => Ok(Priority::Low),
            "MEDIUM" => Ok(Priority::Medium),
            "HIGH" => Ok(Priority::High),
            "URGENT" => Ok(Priority::Urgent),
            other => Err(NotifyError::validation_error(format!(
                "Unknown priority: {}",
                other
            ))),
        }
    }
}

// ============= STATUS =============

/// Lifecycle states of a notification's durable history record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationStatus {
    Queued,
    Processing,
    Sent,
    Delivered,
    Read,
    Failed,
    Cancelled,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Queued => "QUEUED",
            NotificationStatus::Processing => "PROCESSING",
            NotificationStatus::Sent => "SENT",
            NotificationStatus::Delivered => "DELIVERED",
            NotificationStatus::Read => "READ",
            NotificationStatus::Failed => "FAILED",
            NotificationStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn all() -> [NotificationStatus; 7] {
        [
            NotificationStatus::Queued,
            NotificationStatus::Processing,
            NotificationStatus::Sent,
            NotificationStatus::Delivered,
            NotificationStatus::Read,
            NotificationStatus::Failed,
            NotificationStatus::Cancelled,
        ]
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NotificationStatus::Read
                | NotificationStatus::Cancelled
                | NotificationStatus::Delivered
        )
    }

    pub fn is_successful(&self) -> bool {
        matches!(
            self,
            NotificationStatus::Sent | NotificationStatus::Delivered | NotificationStatus::Read
        )
    }

    /// Legal edges of the delivery state machine. FAILED -> QUEUED is the
    /// retry-scheduler edge and is additionally guarded by `can_retry()`.
    pub fn can_transition_to(&self, next: NotificationStatus) -> bool {
        use NotificationStatus::*;
        matches!(
            (self, next),
            (Queued, Processing)
                | (Queued, Cancelled)
                | (Processing, Sent)
                | (Processing, Failed)
                | (Sent, Delivered)
                | (Sent, Failed)
                | (Delivered, Read)
                | (Failed, Queued)
        )
    }
}

impl fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for NotificationStatus {
    type Err = NotifyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "QUEUED" => Ok(NotificationStatus::Queued),
            "PROCESSING" => Ok(NotificationStatus::Processing),
            "SENT" => Ok(NotificationStatus::Sent),
            "DELIVERED" => Ok(NotificationStatus::Delivered),
            "READ" => Ok(NotificationStatus::Read),
            "FAILED" => Ok(NotificationStatus::Failed),
            "CANCELLED" => Ok(NotificationStatus::Cancelled),
            other => Err(NotifyError::validation_error(format!(
                "Unknown status: {}",
                other
            ))),
        }
    }
}

// ============= TEMPLATE CATEGORY =============

/// Template categories for preference gating and organization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TemplateCategory {
    Trading,
    Account,
    Security,
    Marketing,
    System,
    Custom(String),
}

impl TemplateCategory {
    pub fn as_str(&self) -> &str {
        match self {
            TemplateCategory::Trading => "TRADING",
            TemplateCategory::Account => "ACCOUNT",
            TemplateCategory::Security => "SECURITY",
            TemplateCategory::Marketing => "MARKETING",
            TemplateCategory::System => "SYSTEM",
            TemplateCategory::Custom(name) => name,
        }
    }

    pub fn standard() -> Vec<TemplateCategory> {
        vec![
            TemplateCategory::Trading,
            TemplateCategory::Account,
            TemplateCategory::Security,
            TemplateCategory::Marketing,
            TemplateCategory::System,
        ]
    }
}

impl Default for TemplateCategory {
    fn default() -> Self {
        TemplateCategory::System
    }
}

impl fmt::Display for TemplateCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TemplateCategory {
    type Err = NotifyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "TRADING" => Ok(TemplateCategory::Trading),
            "ACCOUNT" => Ok(TemplateCategory::Account),
            "SECURITY" => Ok(TemplateCategory::Security),
            "MARKETING" => Ok(TemplateCategory::Marketing),
            "SYSTEM" => Ok(TemplateCategory::System),
            other if !other.is_empty() => Ok(TemplateCategory::Custom(other.to_string())),
            _ => Err(NotifyError::validation_error("Empty template category")),
        }
    }
}

// ============= DISPATCH REQUEST =============

/// Immutable work item describing one notification to send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub notification_id: String,
    pub channel: Channel,
    /// Recipient key: user id for IN_APP, address for external channels.
    pub recipient: String,
    pub email_address: Option<String>,
    pub phone_number: Option<String>,
    pub device_token: Option<String>,
    pub subject: Option<String>,
    pub content: Option<String>,
    pub template_name: Option<String>,
    pub template_variables: HashMap<String, String>,
    pub category: TemplateCategory,
    pub priority: Priority,
    pub correlation_id: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub reference_id: Option<String>,
    pub reference_type: Option<String>,
    pub max_retry_attempts: u32,
}

impl DispatchRequest {
    pub fn new(channel: Channel, recipient: impl Into<String>) -> Self {
        Self {
            notification_id: generate_notification_id(),
            channel,
            recipient: recipient.into(),
            email_address: None,
            phone_number: None,
            device_token: None,
            subject: None,
            content: None,
            template_name: None,
            template_variables: HashMap::new(),
            category: TemplateCategory::default(),
            priority: Priority::default(),
            correlation_id: None,
            scheduled_at: None,
            reference_id: None,
            reference_type: None,
            max_retry_attempts: 3,
        }
    }

    pub fn with_id(mut self, notification_id: impl Into<String>) -> Self {
        self.notification_id = notification_id.into();
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_template(
        mut self,
        template_name: impl Into<String>,
        variables: HashMap<String, String>,
    ) -> Self {
        self.template_name = Some(template_name.into());
        self.template_variables = variables;
        self
    }

    pub fn with_category(mut self, category: TemplateCategory) -> Self {
        self.category = category;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_email_address(mut self, address: impl Into<String>) -> Self {
        self.email_address = Some(address.into());
        self
    }

    pub fn with_phone_number(mut self, number: impl Into<String>) -> Self {
        self.phone_number = Some(number.into());
        self
    }

    pub fn with_device_token(mut self, token: impl Into<String>) -> Self {
        self.device_token = Some(token.into());
        self
    }

    pub fn with_scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn with_reference(
        mut self,
        reference_id: impl Into<String>,
        reference_type: impl Into<String>,
    ) -> Self {
        self.reference_id = Some(reference_id.into());
        self.reference_type = Some(reference_type.into());
        self
    }

    pub fn with_max_retry_attempts(mut self, attempts: u32) -> Self {
        self.max_retry_attempts = attempts;
        self
    }

    /// Ordering key: messages with the same key dispatch in enqueue order.
    pub fn partition_key(&self) -> String {
        format!("{}:{}", self.channel.as_str(), self.recipient)
    }

    pub fn validate(&self) -> NotifyResult<()> {
        if self.notification_id.is_empty() {
            return Err(NotifyError::validation_error(
                "notification_id cannot be empty",
            ));
        }
        if self.recipient.is_empty() {
            return Err(NotifyError::validation_error("Recipient cannot be empty"));
        }
        if self.template_name.is_none() && self.content.is_none() {
            return Err(NotifyError::validation_error(
                "Either template_name or inline content must be provided",
            ));
        }
        if let Some(content) = &self.content {
            let max = self.channel.max_content_length();
            if content.len() > max {
                return Err(NotifyError::validation_error(format!(
                    "Content too long for {}: {} > {} characters",
                    self.channel,
                    content.len(),
                    max
                )));
            }
        }
        Ok(())
    }
}

// ============= HISTORY RECORD =============

/// Durable record of a single notification's lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub notification_id: String,
    pub correlation_id: String,
    pub channel: Channel,
    pub recipient: String,
    pub subject: Option<String>,
    /// Rendered content as handed to the adapter.
    pub content: String,
    pub template_name: Option<String>,
    pub category: TemplateCategory,
    pub priority: Priority,
    pub status: NotificationStatus,
    pub cancellation_reason: Option<String>,
    pub warning: Option<String>,
    pub retry_count: u32,
    pub max_retry_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub external_message_id: Option<String>,
    pub reference_id: Option<String>,
    pub reference_type: Option<String>,
    pub updated_by: String,
    /// Bumped on every store mutation; the optimistic-concurrency token.
    pub version: u64,
}

impl HistoryRecord {
    pub fn from_request(request: &DispatchRequest, correlation_id: String) -> Self {
        Self {
            notification_id: request.notification_id.clone(),
            correlation_id,
            channel: request.channel,
            recipient: request.recipient.clone(),
            subject: request.subject.clone(),
            content: request.content.clone().unwrap_or_default(),
            template_name: request.template_name.clone(),
            category: request.category.clone(),
            priority: request.priority,
            status: NotificationStatus::Queued,
            cancellation_reason: None,
            warning: None,
            retry_count: 0,
            max_retry_attempts: request.max_retry_attempts,
            created_at: Utc::now(),
            last_attempt_at: None,
            delivered_at: None,
            read_at: None,
            error_message: None,
            external_message_id: None,
            reference_id: request.reference_id.clone(),
            reference_type: request.reference_type.clone(),
            updated_by: "dispatcher".to_string(),
            version: 0,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.status == NotificationStatus::Failed && self.retry_count < self.max_retry_attempts
    }
}

// ============= API-ADJACENT TYPES =============

/// Identity of a synchronous API caller, used for listing authorization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Caller {
    pub name: String,
    pub is_admin: bool,
}

impl Caller {
    pub fn user(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_admin: false,
        }
    }

    pub fn admin(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_admin: true,
        }
    }
}

/// Half-open time range [start, end) used by analytics and history queries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.start && instant < self.end
    }
}

/// Paging parameters for list operations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: usize,
    pub size: usize,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self { page: 0, size: 20 }
    }
}

impl PageRequest {
    pub fn new(page: usize, size: usize) -> Self {
        Self {
            page,
            size: size.clamp(1, 500),
        }
    }

    pub fn offset(&self) -> usize {
        self.page * self.size
    }
}

/// One page of results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub size: usize,
}

impl<T> Page<T> {
    pub fn from_slice(all: Vec<T>, request: PageRequest) -> Self {
        let total = all.len();
        let items = all
            .into_iter()
            .skip(request.offset())
            .take(request.size)
            .collect();
        Self {
            items,
            total,
            page: request.page,
            size: request.size,
        }
    }
}

// ============= SOCKET FRAME =============

/// Wire frame pushed to connected in-app clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketFrame {
    pub message_id: String,
    #[serde(rename = "type")]
    pub frame_type: String,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub priority: Priority,
    pub data: serde_json::Value,
    pub metadata: HashMap<String, String>,
}

impl SocketFrame {
    pub fn notification(
        message_id: impl Into<String>,
        user_id: impl Into<String>,
        priority: Priority,
        data: serde_json::Value,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            frame_type: "user.notifications".to_string(),
            user_id: user_id.into(),
            timestamp: Utc::now(),
            priority,
            data,
            metadata: HashMap::new(),
        }
    }

    pub fn with_type(mut self, frame_type: impl Into<String>) -> Self {
        self.frame_type = frame_type.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}
