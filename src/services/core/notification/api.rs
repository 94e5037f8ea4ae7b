// Protocol-agnostic service facade mirroring the synchronous API surface:
// send, bulk send, status lookup, per-user listings with authorization, and
// template/analytics passthrough. The HTTP layer itself lives outside this
// crate and maps NotifyError.status onto response codes.

use crate::services::core::infrastructure::rate_limiter::RateLimiter;
use crate::services::core::notification::analytics::{
    AnalyticsService, DeliveryRateReport, EngagementReport,
};
use crate::services::core::notification::dispatcher::Dispatcher;
use crate::services::core::notification::history_store::{HistoryFilters, HistoryStore};
use crate::services::core::notification::template_store::{
    NewTemplate, Template, TemplateFilters, TemplateStore, TemplateUpdate,
};
use crate::types::{
    Caller, Channel, DispatchRequest, HistoryRecord, NotificationStatus, Page, PageRequest,
    Priority, TemplateCategory, TimeRange,
};
use crate::utils::{logger::Logger, LogLevel, NotifyError, NotifyResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Response for a single send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendResponse {
    pub notification_id: String,
    pub status: NotificationStatus,
    pub correlation_id: String,
    pub estimated_delivery: Option<DateTime<Utc>>,
}

/// Bulk send request: one message fanned out to many recipients on one
/// channel, either templated or inline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkSendRequest {
    pub channel: Channel,
    pub recipients: Vec<String>,
    pub subject: Option<String>,
    pub content: Option<String>,
    pub template_name: Option<String>,
    #[serde(default)]
    pub template_variables: HashMap<String, String>,
    pub category: Option<TemplateCategory>,
    pub priority: Option<Priority>,
}

/// Per-recipient outcome of a bulk send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkOutcome {
    pub recipient: String,
    pub notification_id: String,
    pub status: NotificationStatus,
    pub reason: Option<String>,
}

/// Status projection returned by the status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub notification_id: String,
    pub correlation_id: String,
    pub channel: Channel,
    pub recipient: String,
    pub status: NotificationStatus,
    pub subject: Option<String>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub cancellation_reason: Option<String>,
}

impl From<HistoryRecord> for StatusResponse {
    fn from(record: HistoryRecord) -> Self {
        Self {
            notification_id: record.notification_id,
            correlation_id: record.correlation_id,
            channel: record.channel,
            recipient: record.recipient,
            status: record.status,
            subject: record.subject,
            retry_count: record.retry_count,
            created_at: record.created_at,
            delivered_at: record.delivered_at,
            error_message: record.error_message,
            cancellation_reason: record.cancellation_reason,
        }
    }
}

/// The synchronous API surface of the service.
pub struct NotificationApi {
    dispatcher: Arc<Dispatcher>,
    history: Arc<HistoryStore>,
    templates: Arc<TemplateStore>,
    analytics: Arc<AnalyticsService>,
    rate_limiter: Arc<RateLimiter>,
    logger: Logger,
}

impl NotificationApi {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        history: Arc<HistoryStore>,
        templates: Arc<TemplateStore>,
        analytics: Arc<AnalyticsService>,
        rate_limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            dispatcher,
            history,
            templates,
            analytics,
            rate_limiter,
            logger: Logger::new(LogLevel::Info),
        }
    }

    // ============= SEND =============

    /// `POST /notifications/send`
    pub async fn send(&self, request: DispatchRequest) -> NotifyResult<SendResponse> {
        let estimated_delivery = request.scheduled_at;
        let record = self.dispatcher.dispatch(request).await?;
        Ok(SendResponse {
            notification_id: record.notification_id.clone(),
            status: record.status,
            correlation_id: record.correlation_id,
            estimated_delivery,
        })
    }

    /// `POST /notifications/send/bulk`. The aggregate is checked against the
    /// channel-wide window first; recipients beyond the remaining quota are
    /// recorded as CANCELLED(rate-limit) without touching the adapter.
    pub async fn send_bulk(&self, bulk: BulkSendRequest) -> NotifyResult<Vec<BulkOutcome>> {
        if bulk.recipients.is_empty() {
            return Err(NotifyError::validation_error("Recipients cannot be empty"));
        }
        if bulk.template_name.is_none() && bulk.content.is_none() {
            return Err(NotifyError::validation_error(
                "Either template_name or inline content must be provided",
            ));
        }

        let global_key = RateLimiter::global_key(bulk.channel);
        let remaining = self.rate_limiter.status(&global_key).remaining as usize;
        let allowed = remaining.min(bulk.recipients.len());
        if allowed > 0 {
            self.rate_limiter.record(&global_key, allowed as u32);
        }
        if allowed < bulk.recipients.len() {
            self.logger.warn(&format!(
                "bulk send over aggregate limit on {}: {} of {} admitted",
                bulk.channel,
                allowed,
                bulk.recipients.len()
            ));
        }

        let correlation_id = crate::types::generate_correlation_id();
        let dispatches = bulk.recipients[..allowed].iter().map(|recipient| {
            let request = self.build_bulk_request(&bulk, recipient, &correlation_id);
            async {
                let recipient = request.recipient.clone();
                match self.dispatcher.dispatch(request).await {
                    Ok(record) => BulkOutcome {
                        recipient,
                        notification_id: record.notification_id,
                        status: record.status,
                        reason: record
                            .cancellation_reason
                            .or(record.error_message),
                    },
                    Err(err) => BulkOutcome {
                        recipient,
                        notification_id: String::new(),
                        status: NotificationStatus::Failed,
                        reason: Some(err.message),
                    },
                }
            }
        });
        let mut outcomes = futures::future::join_all(dispatches).await;

        // Over-limit remainder: record and cancel without dispatching.
        for recipient in &bulk.recipients[allowed..] {
            let request = self.build_bulk_request(&bulk, recipient, &correlation_id);
            let id = request.notification_id.clone();
            self.history.create(&request, correlation_id.clone()).await?;
            let record = self.history.cancel(&id, "rate-limit", "bulk-api").await?;
            outcomes.push(BulkOutcome {
                recipient: recipient.clone(),
                notification_id: record.notification_id,
                status: record.status,
                reason: record.cancellation_reason,
            });
        }

        Ok(outcomes)
    }

    fn build_bulk_request(
        &self,
        bulk: &BulkSendRequest,
        recipient: &str,
        correlation_id: &str,
    ) -> DispatchRequest {
        let mut request = DispatchRequest::new(bulk.channel, recipient)
            .with_priority(bulk.priority.unwrap_or_default())
            .with_category(bulk.category.clone().unwrap_or_default())
            .with_correlation_id(correlation_id);
        if let Some(subject) = &bulk.subject {
            request = request.with_subject(subject.clone());
        }
        if let Some(content) = &bulk.content {
            request = request.with_content(content.clone());
        }
        if let Some(template_name) = &bulk.template_name {
            request = request.with_template(template_name.clone(), bulk.template_variables.clone());
        }
        request
    }

    // ============= QUERIES =============

    /// `GET /notifications/status/{id}`
    pub async fn status(&self, notification_id: &str) -> NotifyResult<StatusResponse> {
        Ok(self.history.get(notification_id).await?.into())
    }

    /// `GET /users/{userId}/notifications`. Authorization: the caller must be
    /// the user or hold the admin role.
    pub async fn list_user_notifications(
        &self,
        caller: &Caller,
        user_id: &str,
        filters: HistoryFilters,
        page: PageRequest,
    ) -> NotifyResult<Page<StatusResponse>> {
        if caller.name != user_id && !caller.is_admin {
            return Err(NotifyError::access_denied(format!(
                "Caller {} may not list notifications of {}",
                caller.name, user_id
            )));
        }
        let records = self.history.list_by_recipient(user_id, filters, page).await;
        Ok(Page {
            items: records.items.into_iter().map(Into::into).collect(),
            total: records.total,
            page: records.page,
            size: records.size,
        })
    }

    pub async fn list_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> Vec<StatusResponse> {
        self.history
            .list_by_correlation_id(correlation_id)
            .await
            .into_iter()
            .map(Into::into)
            .collect()
    }

    // ============= TEMPLATE MANAGEMENT =============

    pub async fn create_template(&self, input: NewTemplate) -> NotifyResult<Template> {
        self.templates.create_template(input).await
    }

    pub async fn update_template(
        &self,
        template_id: &str,
        update: TemplateUpdate,
    ) -> NotifyResult<Template> {
        self.templates.update_template(template_id, update).await
    }

    pub async fn create_template_version(&self, template_id: &str) -> NotifyResult<Template> {
        self.templates.create_new_version(template_id).await
    }

    pub async fn set_template_active(
        &self,
        template_id: &str,
        active: bool,
    ) -> NotifyResult<Template> {
        self.templates.set_active(template_id, active).await
    }

    pub async fn delete_template(&self, template_id: &str) -> NotifyResult<()> {
        self.templates.soft_delete(template_id).await
    }

    pub async fn get_template(&self, name: &str) -> NotifyResult<Template> {
        self.templates
            .get_by_name(name)
            .await
            .ok_or_else(|| NotifyError::not_found(format!("Template not found: {}", name)))
    }

    pub async fn search_templates(
        &self,
        filters: TemplateFilters,
        page: PageRequest,
    ) -> Page<Template> {
        self.templates.search(filters, page).await
    }

    // ============= ANALYTICS =============

    /// `GET /notifications/analytics/delivery-rate`
    pub async fn delivery_rate(&self, channel: Channel, range: TimeRange) -> DeliveryRateReport {
        self.analytics.delivery_rate(channel, range).await
    }

    /// `GET /notifications/analytics/engagement`
    pub async fn engagement(&self, user_id: &str, range: TimeRange) -> EngagementReport {
        self.analytics.engagement(user_id, range).await
    }

    /// `GET /notifications/analytics/channel-performance`
    pub async fn channel_performance(&self, range: TimeRange) -> Vec<DeliveryRateReport> {
        self.analytics.channel_performance(range).await
    }
}
