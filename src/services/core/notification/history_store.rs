// Durable notification history: the state machine, retry bookkeeping and the
// query surface used by status endpoints and analytics.

use crate::types::{
    Channel, DispatchRequest, HistoryRecord, NotificationStatus, Page, PageRequest, TimeRange,
};
use crate::utils::{logger::Logger, LogLevel, NotifyError, NotifyResult};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Configuration for the history store.
#[derive(Debug, Clone)]
pub struct HistoryStoreConfig {
    /// Terminal records older than this are removed by the retention sweep.
    pub audit_retention_days: i64,
    pub sweep_interval_seconds: u64,
}

impl Default for HistoryStoreConfig {
    fn default() -> Self {
        Self {
            audit_retention_days: 90,
            sweep_interval_seconds: 3600,
        }
    }
}

impl HistoryStoreConfig {
    /// Read `AUDIT_RETENTION_DAYS`.
    pub fn from_env() -> NotifyResult<Self> {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var("AUDIT_RETENTION_DAYS") {
            config.audit_retention_days = raw.trim().parse().map_err(|_| {
                NotifyError::config_error(format!(
                    "AUDIT_RETENTION_DAYS must be an integer: {}",
                    raw
                ))
            })?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> NotifyResult<()> {
        if self.audit_retention_days <= 0 {
            return Err(NotifyError::config_error(
                "audit_retention_days must be greater than 0",
            ));
        }
        if self.sweep_interval_seconds == 0 {
            return Err(NotifyError::config_error(
                "sweep_interval_seconds must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Filters for recipient listings.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilters {
    pub channel: Option<Channel>,
    pub status: Option<NotificationStatus>,
}

/// Outcome of `create`: whether the record was inserted or already present.
#[derive(Debug, Clone)]
pub struct CreateOutcome {
    pub record: HistoryRecord,
    pub created: bool,
}

/// The single owner of HistoryRecord state. Every mutation funnels through
/// this store; updates on one id serialize under the write lock and bump the
/// record's version counter.
pub struct HistoryStore {
    config: HistoryStoreConfig,
    records: RwLock<HashMap<String, HistoryRecord>>,
    logger: Logger,
}

impl HistoryStore {
    pub fn new(config: HistoryStoreConfig) -> NotifyResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            records: RwLock::new(HashMap::new()),
            logger: Logger::new(LogLevel::Info),
        })
    }

    // ============= LIFECYCLE =============

    /// Create a QUEUED record for the request. Idempotent on notification id:
    /// an existing record is returned unchanged with `created = false`.
    pub async fn create(
        &self,
        request: &DispatchRequest,
        correlation_id: String,
    ) -> NotifyResult<CreateOutcome> {
        let mut records = self.records.write().await;
        if let Some(existing) = records.get(&request.notification_id) {
            return Ok(CreateOutcome {
                record: existing.clone(),
                created: false,
            });
        }

        let record = HistoryRecord::from_request(request, correlation_id);
        records.insert(record.notification_id.clone(), record.clone());
        Ok(CreateOutcome {
            record,
            created: true,
        })
    }

    /// Transition a record. Illegal transitions yield InvalidTransition;
    /// re-asserting the current status is a no-op (idempotent).
    pub async fn update_status(
        &self,
        notification_id: &str,
        new_status: NotificationStatus,
        external_message_id: Option<String>,
        updated_by: &str,
    ) -> NotifyResult<HistoryRecord> {
        let mut records = self.records.write().await;
        let record = Self::get_mut(&mut records, notification_id)?;

        if record.status == new_status {
            return Ok(record.clone());
        }
        if !record.status.can_transition_to(new_status) {
            return Err(NotifyError::invalid_transition(format!(
                "Illegal transition {} -> {} for {}",
                record.status, new_status, notification_id
            )));
        }

        record.status = new_status;
        match new_status {
            NotificationStatus::Sent => {
                record.last_attempt_at = Some(Utc::now());
                if external_message_id.is_some() {
                    record.external_message_id = external_message_id;
                }
            }
            NotificationStatus::Delivered => {
                record.delivered_at = Some(Utc::now());
            }
            NotificationStatus::Read => {
                record.read_at = Some(Utc::now());
            }
            _ => {}
        }
        record.updated_by = updated_by.to_string();
        record.version += 1;
        Ok(record.clone())
    }

    /// Record an attempt failure: PROCESSING/SENT -> FAILED with the error.
    pub async fn mark_failed(
        &self,
        notification_id: &str,
        error_message: &str,
        updated_by: &str,
    ) -> NotifyResult<HistoryRecord> {
        let mut records = self.records.write().await;
        let record = Self::get_mut(&mut records, notification_id)?;

        if record.status != NotificationStatus::Failed {
            if !record.status.can_transition_to(NotificationStatus::Failed) {
                return Err(NotifyError::invalid_transition(format!(
                    "Illegal transition {} -> FAILED for {}",
                    record.status, notification_id
                )));
            }
            record.status = NotificationStatus::Failed;
        }
        record.error_message = Some(error_message.to_string());
        record.last_attempt_at = Some(Utc::now());
        record.updated_by = updated_by.to_string();
        record.version += 1;
        Ok(record.clone())
    }

    /// FAILED -> QUEUED for the retry scheduler; guarded by `can_retry()`.
    pub async fn increment_retry(&self, notification_id: &str) -> NotifyResult<HistoryRecord> {
        let mut records = self.records.write().await;
        let record = Self::get_mut(&mut records, notification_id)?;

        if !record.can_retry() {
            return Err(NotifyError::invalid_transition(format!(
                "Record {} is not eligible for retry (status={}, retries={}/{})",
                notification_id, record.status, record.retry_count, record.max_retry_attempts
            )));
        }

        record.retry_count += 1;
        record.status = NotificationStatus::Queued;
        record.updated_by = "retry-scheduler".to_string();
        record.version += 1;
        Ok(record.clone())
    }

    /// QUEUED -> CANCELLED with a reason ("preferences", "quiet-hours",
    /// "rate-limit", "no-session" or caller-supplied).
    pub async fn cancel(
        &self,
        notification_id: &str,
        reason: &str,
        updated_by: &str,
    ) -> NotifyResult<HistoryRecord> {
        let mut records = self.records.write().await;
        let record = Self::get_mut(&mut records, notification_id)?;

        if record.status == NotificationStatus::Cancelled {
            return Ok(record.clone());
        }
        if !record.status.can_transition_to(NotificationStatus::Cancelled) {
            return Err(NotifyError::invalid_transition(format!(
                "Illegal transition {} -> CANCELLED for {}",
                record.status, notification_id
            )));
        }

        record.status = NotificationStatus::Cancelled;
        record.cancellation_reason = Some(reason.to_string());
        record.updated_by = updated_by.to_string();
        record.version += 1;
        self.logger.info(&format!(
            "cancelled notification {} reason={}",
            notification_id, reason
        ));
        Ok(record.clone())
    }

    /// Store the rendered payload (and optional warning) once the dispatcher
    /// has resolved templates.
    pub async fn record_rendered(
        &self,
        notification_id: &str,
        subject: Option<String>,
        content: String,
        warning: Option<String>,
    ) -> NotifyResult<HistoryRecord> {
        let mut records = self.records.write().await;
        let record = Self::get_mut(&mut records, notification_id)?;
        record.subject = subject;
        record.content = content;
        if warning.is_some() {
            record.warning = warning;
        }
        record.version += 1;
        Ok(record.clone())
    }

    /// In-app read receipt: DELIVERED -> READ.
    pub async fn mark_read(&self, notification_id: &str) -> NotifyResult<HistoryRecord> {
        self.update_status(notification_id, NotificationStatus::Read, None, "socket-hub")
            .await
    }

    // ============= QUERIES =============

    pub async fn get(&self, notification_id: &str) -> NotifyResult<HistoryRecord> {
        let records = self.records.read().await;
        records
            .get(notification_id)
            .cloned()
            .ok_or_else(|| {
                NotifyError::not_found(format!("Notification not found: {}", notification_id))
            })
    }

    /// Stable ordering: createdAt DESC, id DESC tiebreak.
    pub async fn list_by_recipient(
        &self,
        recipient: &str,
        filters: HistoryFilters,
        page: PageRequest,
    ) -> Page<HistoryRecord> {
        let records = self.records.read().await;
        let mut matched: Vec<HistoryRecord> = records
            .values()
            .filter(|r| r.recipient == recipient)
            .filter(|r| filters.channel.map(|ch| r.channel == ch).unwrap_or(true))
            .filter(|r| filters.status.map(|st| r.status == st).unwrap_or(true))
            .cloned()
            .collect();
        matched.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then(b.notification_id.cmp(&a.notification_id))
        });
        Page::from_slice(matched, page)
    }

    pub async fn list_by_correlation_id(&self, correlation_id: &str) -> Vec<HistoryRecord> {
        let records = self.records.read().await;
        let mut matched: Vec<HistoryRecord> = records
            .values()
            .filter(|r| r.correlation_id == correlation_id)
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        matched
    }

    /// FAILED records whose last attempt is at or before the cutoff and which
    /// still have retry budget.
    pub async fn list_eligible_for_retry(&self, cutoff: DateTime<Utc>) -> Vec<HistoryRecord> {
        let records = self.records.read().await;
        let mut matched: Vec<HistoryRecord> = records
            .values()
            .filter(|r| r.can_retry())
            .filter(|r| r.last_attempt_at.map(|at| at <= cutoff).unwrap_or(true))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.last_attempt_at.cmp(&b.last_attempt_at));
        matched
    }

    pub async fn delivery_statistics(
        &self,
        range: TimeRange,
    ) -> HashMap<NotificationStatus, u64> {
        let records = self.records.read().await;
        let mut stats: HashMap<NotificationStatus, u64> = HashMap::new();
        for record in records.values() {
            if range.contains(record.created_at) {
                *stats.entry(record.status).or_insert(0) += 1;
            }
        }
        stats
    }

    /// Records in a range, optionally narrowed by channel and recipient; the
    /// analytics aggregations are pure functions of this slice.
    pub async fn list_in_range(
        &self,
        range: TimeRange,
        channel: Option<Channel>,
        recipient: Option<&str>,
    ) -> Vec<HistoryRecord> {
        let records = self.records.read().await;
        records
            .values()
            .filter(|r| range.contains(r.created_at))
            .filter(|r| channel.map(|ch| r.channel == ch).unwrap_or(true))
            .filter(|r| recipient.map(|rc| r.recipient == rc).unwrap_or(true))
            .cloned()
            .collect()
    }

    // ============= RETENTION =============

    /// Remove terminal records older than the retention horizon.
    pub async fn sweep_expired(&self) -> usize {
        let horizon = Utc::now() - Duration::days(self.config.audit_retention_days);
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, r| !(r.status.is_terminal() && r.created_at < horizon));
        let removed = before - records.len();
        if removed > 0 {
            self.logger
                .info(&format!("retention sweep removed {} history records", removed));
        }
        removed
    }

    /// Periodic retention sweep task.
    pub fn spawn_retention_sweep(
        self: &std::sync::Arc<Self>,
    ) -> tokio::task::JoinHandle<()> {
        let store = std::sync::Arc::clone(self);
        let interval = std::time::Duration::from_secs(store.config.sweep_interval_seconds);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                store.sweep_expired().await;
            }
        })
    }

    fn get_mut<'a>(
        records: &'a mut HashMap<String, HistoryRecord>,
        notification_id: &str,
    ) -> NotifyResult<&'a mut HistoryRecord> {
        records.get_mut(notification_id).ok_or_else(|| {
            NotifyError::not_found(format!("Notification not found: {}", notification_id))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Channel, DispatchRequest};

    fn store() -> HistoryStore {
        HistoryStore::new(HistoryStoreConfig::default()).unwrap()
    }

    fn request(recipient: &str) -> DispatchRequest {
        DispatchRequest::new(Channel::Email, recipient).with_content("hello")
    }

    #[tokio::test]
    async fn test_create_is_idempotent_on_id() {
        let store = store();
        let req = request("a@x.io");

        let first = store.create(&req, "corr-1".to_string()).await.unwrap();
        assert!(first.created);
        assert_eq!(first.record.status, NotificationStatus::Queued);

        let second = store.create(&req, "corr-2".to_string()).await.unwrap();
        assert!(!second.created);
        // Original correlation id retained
        assert_eq!(second.record.correlation_id, "corr-1");
    }

    #[tokio::test]
    async fn test_happy_path_transitions() {
        let store = store();
        let req = request("a@x.io");
        let id = req.notification_id.clone();
        store.create(&req, "corr".to_string()).await.unwrap();

        store
            .update_status(&id, NotificationStatus::Processing, None, "dispatcher")
            .await
            .unwrap();
        let sent = store
            .update_status(&id, NotificationStatus::Sent, Some("ext-1".to_string()), "dispatcher")
            .await
            .unwrap();
        assert_eq!(sent.external_message_id.as_deref(), Some("ext-1"));
        assert!(sent.last_attempt_at.is_some());

        let delivered = store
            .update_status(&id, NotificationStatus::Delivered, None, "adapter")
            .await
            .unwrap();
        assert!(delivered.delivered_at.is_some());

        let read = store.mark_read(&id).await.unwrap();
        assert!(read.read_at.is_some());
    }

    #[tokio::test]
    async fn test_illegal_transition_rejected() {
        let store = store();
        let req = request("a@x.io");
        let id = req.notification_id.clone();
        store.create(&req, "corr".to_string()).await.unwrap();

        let err = store
            .update_status(&id, NotificationStatus::Sent, None, "dispatcher")
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::utils::ErrorKind::InvalidTransition);
    }

    #[tokio::test]
    async fn test_update_status_idempotent_on_same_status() {
        let store = store();
        let req = request("a@x.io");
        let id = req.notification_id.clone();
        store.create(&req, "corr".to_string()).await.unwrap();

        let first = store
            .update_status(&id, NotificationStatus::Processing, None, "dispatcher")
            .await
            .unwrap();
        let second = store
            .update_status(&id, NotificationStatus::Processing, None, "dispatcher")
            .await
            .unwrap();
        assert_eq!(first.version, second.version);
    }

    #[tokio::test]
    async fn test_retry_bookkeeping() {
        let store = store();
        let mut req = request("a@x.io");
        req.max_retry_attempts = 2;
        let id = req.notification_id.clone();
        store.create(&req, "corr".to_string()).await.unwrap();
        store
            .update_status(&id, NotificationStatus::Processing, None, "dispatcher")
            .await
            .unwrap();
        store.mark_failed(&id, "smtp 421", "dispatcher").await.unwrap();

        let requeued = store.increment_retry(&id).await.unwrap();
        assert_eq!(requeued.status, NotificationStatus::Queued);
        assert_eq!(requeued.retry_count, 1);

        store
            .update_status(&id, NotificationStatus::Processing, None, "dispatcher")
            .await
            .unwrap();
        store.mark_failed(&id, "smtp 421", "dispatcher").await.unwrap();
        store.increment_retry(&id).await.unwrap();

        store
            .update_status(&id, NotificationStatus::Processing, None, "dispatcher")
            .await
            .unwrap();
        let failed = store.mark_failed(&id, "smtp 421", "dispatcher").await.unwrap();
        assert_eq!(failed.retry_count, 2);
        assert!(!failed.can_retry());
        assert!(store.increment_retry(&id).await.is_err());
        assert!(failed.retry_count <= failed.max_retry_attempts);
    }

    #[tokio::test]
    async fn test_cancel_only_from_queued() {
        let store = store();
        let req = request("a@x.io");
        let id = req.notification_id.clone();
        store.create(&req, "corr".to_string()).await.unwrap();

        let cancelled = store.cancel(&id, "rate-limit", "dispatcher").await.unwrap();
        assert_eq!(cancelled.status, NotificationStatus::Cancelled);
        assert_eq!(cancelled.cancellation_reason.as_deref(), Some("rate-limit"));

        // A processed record cannot be cancelled.
        let req2 = request("b@x.io");
        let id2 = req2.notification_id.clone();
        store.create(&req2, "corr".to_string()).await.unwrap();
        store
            .update_status(&id2, NotificationStatus::Processing, None, "dispatcher")
            .await
            .unwrap();
        assert!(store.cancel(&id2, "late", "caller").await.is_err());
    }

    #[tokio::test]
    async fn test_list_by_recipient_ordering_and_filters() {
        let store = store();
        for _ in 0..3 {
            let req = request("a@x.io");
            store.create(&req, "corr".to_string()).await.unwrap();
        }
        let other = DispatchRequest::new(Channel::Sms, "a@x.io").with_content("sms");
        store.create(&other, "corr".to_string()).await.unwrap();

        let all = store
            .list_by_recipient("a@x.io", HistoryFilters::default(), PageRequest::new(0, 10))
            .await;
        assert_eq!(all.total, 4);
        for pair in all.items.windows(2) {
            assert!(
                pair[0].created_at > pair[1].created_at
                    || (pair[0].created_at == pair[1].created_at
                        && pair[0].notification_id > pair[1].notification_id)
            );
        }

        let email_only = store
            .list_by_recipient(
                "a@x.io",
                HistoryFilters {
                    channel: Some(Channel::Email),
                    ..Default::default()
                },
                PageRequest::new(0, 10),
            )
            .await;
        assert_eq!(email_only.total, 3);
    }

    #[tokio::test]
    async fn test_eligible_for_retry_respects_cutoff() {
        let store = store();
        let req = request("a@x.io");
        let id = req.notification_id.clone();
        store.create(&req, "corr".to_string()).await.unwrap();
        store
            .update_status(&id, NotificationStatus::Processing, None, "dispatcher")
            .await
            .unwrap();
        store.mark_failed(&id, "timeout", "dispatcher").await.unwrap();

        let eligible = store.list_eligible_for_retry(Utc::now()).await;
        assert_eq!(eligible.len(), 1);

        let past_cutoff = Utc::now() - Duration::hours(1);
        assert!(store.list_eligible_for_retry(past_cutoff).await.is_empty());
    }

    #[tokio::test]
    async fn test_delivery_statistics() {
        let store = store();
        let req = request("a@x.io");
        let id = req.notification_id.clone();
        store.create(&req, "corr".to_string()).await.unwrap();
        store
            .update_status(&id, NotificationStatus::Processing, None, "d")
            .await
            .unwrap();
        store
            .update_status(&id, NotificationStatus::Sent, None, "d")
            .await
            .unwrap();

        let req2 = request("b@x.io");
        store.create(&req2, "corr".to_string()).await.unwrap();
        store.cancel(&req2.notification_id, "rate-limit", "d").await.unwrap();

        let range = TimeRange::new(Utc::now() - Duration::hours(1), Utc::now() + Duration::hours(1));
        let stats = store.delivery_statistics(range).await;
        assert_eq!(stats.get(&NotificationStatus::Sent), Some(&1));
        assert_eq!(stats.get(&NotificationStatus::Cancelled), Some(&1));
    }

    #[tokio::test]
    async fn test_correlation_join() {
        let store = store();
        let req1 = request("a@x.io");
        let req2 = request("a@x.io");
        store.create(&req1, "corr-xyz".to_string()).await.unwrap();
        store.create(&req2, "corr-xyz".to_string()).await.unwrap();

        let joined = store.list_by_correlation_id("corr-xyz").await;
        assert_eq!(joined.len(), 2);
    }

    #[tokio::test]
    async fn test_retention_sweep_removes_only_old_terminal_records() {
        let store = store();
        let req = request("a@x.io");
        let id = req.notification_id.clone();
        store.create(&req, "corr".to_string()).await.unwrap();
        store.cancel(&id, "caller", "d").await.unwrap();

        // Fresh terminal record survives the sweep.
        assert_eq!(store.sweep_expired().await, 0);

        // Age the record past the horizon.
        {
            let mut records = store.records.write().await;
            let record = records.get_mut(&id).unwrap();
            record.created_at = Utc::now() - Duration::days(365);
        }
        assert_eq!(store.sweep_expired().await, 1);
    }
}
