// Dead-letter handling: messages that exhausted retries or failed terminal
// parsing land here for persistence, classification and operator alerting.

use crate::services::core::ingest::consumers::{TopicRecord, TopicSource};
use crate::services::core::ingest::events::EventKind;
use crate::services::core::notification::history_store::HistoryStore;
use crate::types::{generate_correlation_id, Channel, DispatchRequest, NotificationStatus, Priority, TemplateCategory};
use crate::utils::{logger::Logger, LogLevel, NotifyResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const MAX_PERSISTED_PAYLOAD: usize = 2_000;

/// Envelope of a dead-lettered message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEnvelope {
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub original_topic: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub user_email: Option<String>,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

/// An alert raised towards the operator endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorAlert {
    pub severity: AlertSeverity,
    pub title: String,
    pub detail: String,
    pub event_type: Option<String>,
    pub correlation_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertSeverity {
    Critical,
    Warning,
}

/// Operator alerting seam (pager, ops channel, ...).
#[async_trait]
pub trait OperatorAlerter: Send + Sync {
    async fn raise(&self, alert: OperatorAlert) -> NotifyResult<()>;
}

/// Default alerter: writes the alert to the error log.
pub struct LogAlerter {
    logger: Logger,
}

impl LogAlerter {
    pub fn new() -> Self {
        Self {
            logger: Logger::new(LogLevel::Info),
        }
    }
}

impl Default for LogAlerter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OperatorAlerter for LogAlerter {
    async fn raise(&self, alert: OperatorAlert) -> NotifyResult<()> {
        self.logger.error(&format!(
            "OPERATOR ALERT [{:?}] {} correlation={} detail={}",
            alert.severity, alert.title, alert.correlation_id, alert.detail
        ));
        Ok(())
    }
}

/// Counters for the dead-letter path.
#[derive(Debug, Default)]
pub struct DeadLetterMetrics {
    pub processed: AtomicU64,
    pub persisted: AtomicU64,
    pub alerts_raised: AtomicU64,
}

impl DeadLetterMetrics {
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.processed.load(Ordering::Relaxed),
            self.persisted.load(Ordering::Relaxed),
            self.alerts_raised.load(Ordering::Relaxed),
        )
    }
}

/// Consumes the DLQ topic: logs full detail, persists a FAILED history
/// record, and pages the operator for critical event kinds.
pub struct DeadLetterHandler {
    history: Arc<HistoryStore>,
    alerter: Arc<dyn OperatorAlerter>,
    metrics: Arc<DeadLetterMetrics>,
    logger: Logger,
}

impl DeadLetterHandler {
    pub fn new(history: Arc<HistoryStore>, alerter: Arc<dyn OperatorAlerter>) -> Self {
        Self {
            history,
            alerter,
            metrics: Arc::new(DeadLetterMetrics::default()),
            logger: Logger::new(LogLevel::Info),
        }
    }

    pub fn metrics(&self) -> Arc<DeadLetterMetrics> {
        Arc::clone(&self.metrics)
    }

    pub async fn process_record(&self, record: TopicRecord) {
        self.metrics.processed.fetch_add(1, Ordering::Relaxed);

        let envelope: DeadLetterEnvelope = serde_json::from_str(&record.payload)
            .unwrap_or(DeadLetterEnvelope {
                event_type: None,
                original_topic: None,
                error: None,
                correlation_id: None,
                user_email: None,
                payload: None,
            });

        let correlation_id = envelope
            .correlation_id
            .clone()
            .or_else(|| record.correlation_id().map(str::to_string))
            .unwrap_or_else(generate_correlation_id);
        let error = envelope
            .error
            .clone()
            .unwrap_or_else(|| "unknown failure".to_string());
        let event_type = envelope.event_type.clone();

        self.logger.error(&format!(
            "dead letter received topic={} eventType={} correlation={} error={} payload={}",
            envelope.original_topic.as_deref().unwrap_or("unknown"),
            event_type.as_deref().unwrap_or("unknown"),
            correlation_id,
            error,
            record.payload
        ));

        if let Err(persist_err) = self
            .persist_failed(&envelope, &record, &correlation_id, &error)
            .await
        {
            self.logger.error(&format!(
                "dead letter persistence failed correlation={} error={}",
                correlation_id, persist_err
            ));
        } else {
            self.metrics.persisted.fetch_add(1, Ordering::Relaxed);
        }

        let critical = event_type
            .as_deref()
            .and_then(|raw| EventKind::from_str(raw).ok())
            .map(|kind| kind.is_critical())
            .unwrap_or(false);
        if critical {
            let alert = OperatorAlert {
                severity: AlertSeverity::Critical,
                title: format!(
                    "Notification dead-lettered: {}",
                    event_type.as_deref().unwrap_or("unknown")
                ),
                detail: error,
                event_type,
                correlation_id: correlation_id.clone(),
            };
            match self.alerter.raise(alert).await {
                Ok(()) => {
                    self.metrics.alerts_raised.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => self.logger.error(&format!(
                    "operator alert failed correlation={} error={}",
                    correlation_id, err
                )),
            }
        }
    }

    async fn persist_failed(
        &self,
        envelope: &DeadLetterEnvelope,
        record: &TopicRecord,
        correlation_id: &str,
        error: &str,
    ) -> NotifyResult<()> {
        let recipient = envelope
            .user_email
            .clone()
            .unwrap_or_else(|| "dead-letter".to_string());
        let mut content = record.payload.clone();
        content.truncate(MAX_PERSISTED_PAYLOAD);

        let request = DispatchRequest::new(Channel::Email, recipient)
            .with_subject(format!(
                "Dead letter: {}",
                envelope.event_type.as_deref().unwrap_or("unknown")
            ))
            .with_content(content)
            .with_category(TemplateCategory::System)
            .with_priority(Priority::Low)
            .with_correlation_id(correlation_id)
            .with_reference(
                envelope.original_topic.clone().unwrap_or_else(|| "dlq".to_string()),
                "DEAD_LETTER",
            )
            .with_max_retry_attempts(0);

        let id = request.notification_id.clone();
        self.history.create(&request, correlation_id.to_string()).await?;
        self.history
            .update_status(&id, NotificationStatus::Processing, None, "dead-letter")
            .await?;
        self.history.mark_failed(&id, error, "dead-letter").await?;
        Ok(())
    }

    pub async fn run(self: Arc<Self>, mut source: Box<dyn TopicSource>) {
        self.logger
            .info(&format!("dead-letter handler started for {}", source.topic()));
        while let Some(record) = source.next().await {
            self.process_record(record).await;
        }
        self.logger.info("dead-letter handler stopped");
    }

    pub fn spawn(self: Arc<Self>, source: Box<dyn TopicSource>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(source))
    }
}
