// Analytics aggregations over the delivery history: delivery rate,
// per-user engagement and channel performance. Pure functions of the
// history slice they read.

use crate::services::core::notification::history_store::HistoryStore;
use crate::types::{Channel, NotificationStatus, TimeRange};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Delivery-rate aggregate for one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRateReport {
    pub channel: Channel,
    pub total_sent: u64,
    pub delivered: u64,
    pub failed: u64,
    /// delivered / total_sent x 100; 0 when the slice is empty.
    pub delivery_rate: f64,
}

/// Engagement aggregate for one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngagementReport {
    pub user_id: String,
    pub total_sent: u64,
    pub delivered: u64,
    pub read: u64,
    pub delivery_rate: f64,
    pub read_rate: f64,
    /// 0.3 x delivery rate + 0.7 x read rate.
    pub engagement_score: f64,
}

/// Read-side aggregator over the history store.
pub struct AnalyticsService {
    history: Arc<HistoryStore>,
    /// Queries never look back further than this horizon.
    retention_days: Option<i64>,
}

impl AnalyticsService {
    pub fn new(history: Arc<HistoryStore>) -> Self {
        Self {
            history,
            retention_days: None,
        }
    }

    /// Apply the `ANALYTICS_RETENTION_DAYS` horizon.
    pub fn with_retention_days(mut self, days: i64) -> Self {
        self.retention_days = Some(days);
        self
    }

    fn clamp(&self, range: TimeRange) -> TimeRange {
        match self.retention_days {
            Some(days) => {
                let horizon = chrono::Utc::now() - chrono::Duration::days(days);
                TimeRange::new(range.start.max(horizon), range.end)
            }
            None => range,
        }
    }

    pub async fn delivery_rate(&self, channel: Channel, range: TimeRange) -> DeliveryRateReport {
        let range = self.clamp(range);
        let slice = self.history.list_in_range(range, Some(channel), None).await;
        let mut total_sent = 0u64;
        let mut delivered = 0u64;
        let mut failed = 0u64;
        for record in &slice {
            match record.status {
                NotificationStatus::Sent => total_sent += 1,
                NotificationStatus::Delivered | NotificationStatus::Read => {
                    total_sent += 1;
                    delivered += 1;
                }
                NotificationStatus::Failed => {
                    total_sent += 1;
                    failed += 1;
                }
                _ => {}
            }
        }
        DeliveryRateReport {
            channel,
            total_sent,
            delivered,
            failed,
            delivery_rate: percentage(delivered, total_sent),
        }
    }

    pub async fn engagement(&self, user_id: &str, range: TimeRange) -> EngagementReport {
        let range = self.clamp(range);
        let slice = self.history.list_in_range(range, None, Some(user_id)).await;
        let mut total_sent = 0u64;
        let mut delivered = 0u64;
        let mut read = 0u64;
        for record in &slice {
            match record.status {
                NotificationStatus::Sent => total_sent += 1,
                NotificationStatus::Delivered => {
                    total_sent += 1;
                    delivered += 1;
                }
                NotificationStatus::Read => {
                    total_sent += 1;
                    delivered += 1;
                    read += 1;
                }
                NotificationStatus::Failed => total_sent += 1,
                _ => {}
            }
        }

        let delivery_rate = percentage(delivered, total_sent);
        let read_rate = percentage(read, total_sent);
        EngagementReport {
            user_id: user_id.to_string(),
            total_sent,
            delivered,
            read,
            delivery_rate,
            read_rate,
            engagement_score: 0.3 * delivery_rate + 0.7 * read_rate,
        }
    }

    /// Per-channel delivery rates, sorted by delivery rate descending.
    pub async fn channel_performance(&self, range: TimeRange) -> Vec<DeliveryRateReport> {
        let mut reports = Vec::with_capacity(4);
        for channel in Channel::all() {
            reports.push(self.delivery_rate(channel, range).await);
        }
        reports.sort_by(|a, b| {
            b.delivery_rate
                .partial_cmp(&a.delivery_rate)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        reports
    }

    /// Raw status counts over the range, for dashboards.
    pub async fn status_breakdown(
        &self,
        range: TimeRange,
    ) -> HashMap<NotificationStatus, u64> {
        self.history.delivery_statistics(range).await
    }
}

fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::core::notification::history_store::HistoryStoreConfig;
    use crate::types::DispatchRequest;
    use chrono::{Duration, Utc};

    async fn seed(history: &HistoryStore, recipient: &str, channel: Channel, final_status: NotificationStatus) {
        let request = DispatchRequest::new(channel, recipient).with_content("x");
        let id = request.notification_id.clone();
        history.create(&request, "corr".to_string()).await.unwrap();
        if final_status == NotificationStatus::Cancelled {
            history.cancel(&id, "rate-limit", "t").await.unwrap();
            return;
        }
        history
            .update_status(&id, NotificationStatus::Processing, None, "t")
            .await
            .unwrap();
        if final_status == NotificationStatus::Failed {
            history.mark_failed(&id, "boom", "t").await.unwrap();
            return;
        }
        history
            .update_status(&id, NotificationStatus::Sent, None, "t")
            .await
            .unwrap();
        if matches!(
            final_status,
            NotificationStatus::Delivered | NotificationStatus::Read
        ) {
            history
                .update_status(&id, NotificationStatus::Delivered, None, "t")
                .await
                .unwrap();
        }
        if final_status == NotificationStatus::Read {
            history.mark_read(&id).await.unwrap();
        }
    }

    fn range() -> TimeRange {
        TimeRange::new(Utc::now() - Duration::hours(1), Utc::now() + Duration::hours(1))
    }

    #[tokio::test]
    async fn test_delivery_rate_math() {
        let history = Arc::new(HistoryStore::new(HistoryStoreConfig::default()).unwrap());
        seed(&history, "a@x.io", Channel::Email, NotificationStatus::Delivered).await;
        seed(&history, "b@x.io", Channel::Email, NotificationStatus::Delivered).await;
        seed(&history, "c@x.io", Channel::Email, NotificationStatus::Failed).await;
        seed(&history, "d@x.io", Channel::Email, NotificationStatus::Sent).await;
        // Cancelled records never reached the adapter and are excluded.
        seed(&history, "e@x.io", Channel::Email, NotificationStatus::Cancelled).await;

        let analytics = AnalyticsService::new(history);
        let report = analytics.delivery_rate(Channel::Email, range()).await;
        assert_eq!(report.total_sent, 4);
        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, 1);
        assert!((report.delivery_rate - 50.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_empty_slice_has_zero_rate() {
        let history = Arc::new(HistoryStore::new(HistoryStoreConfig::default()).unwrap());
        let analytics = AnalyticsService::new(history);
        let report = analytics.delivery_rate(Channel::Sms, range()).await;
        assert_eq!(report.total_sent, 0);
        assert_eq!(report.delivery_rate, 0.0);
    }

    #[tokio::test]
    async fn test_engagement_score_weights() {
        let history = Arc::new(HistoryStore::new(HistoryStoreConfig::default()).unwrap());
        // 4 records for one user: 2 read, 1 delivered-not-read, 1 failed.
        seed(&history, "u-1", Channel::InApp, NotificationStatus::Read).await;
        seed(&history, "u-1", Channel::InApp, NotificationStatus::Read).await;
        seed(&history, "u-1", Channel::InApp, NotificationStatus::Delivered).await;
        seed(&history, "u-1", Channel::Email, NotificationStatus::Failed).await;

        let analytics = AnalyticsService::new(history);
        let report = analytics.engagement("u-1", range()).await;
        assert_eq!(report.total_sent, 4);
        assert_eq!(report.delivered, 3);
        assert_eq!(report.read, 2);
        assert!((report.delivery_rate - 75.0).abs() < f64::EPSILON);
        assert!((report.read_rate - 50.0).abs() < f64::EPSILON);
        assert!((report.engagement_score - (0.3 * 75.0 + 0.7 * 50.0)).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_channel_performance_sorted_desc() {
        let history = Arc::new(HistoryStore::new(HistoryStoreConfig::default()).unwrap());
        seed(&history, "a@x.io", Channel::Email, NotificationStatus::Delivered).await;
        seed(&history, "b@x.io", Channel::Email, NotificationStatus::Failed).await;
        seed(&history, "+1", Channel::Sms, NotificationStatus::Delivered).await;

        let analytics = AnalyticsService::new(history);
        let reports = analytics.channel_performance(range()).await;
        assert_eq!(reports.len(), 4);
        assert_eq!(reports[0].channel, Channel::Sms);
        for pair in reports.windows(2) {
            assert!(pair[0].delivery_rate >= pair[1].delivery_rate);
        }
    }

    #[tokio::test]
    async fn test_determinism_for_same_slice() {
        let history = Arc::new(HistoryStore::new(HistoryStoreConfig::default()).unwrap());
        seed(&history, "u-1", Channel::InApp, NotificationStatus::Read).await;
        let analytics = AnalyticsService::new(history);
        let r = range();
        let first = analytics.engagement("u-1", r).await;
        let second = analytics.engagement("u-1", r).await;
        assert_eq!(first.engagement_score, second.engagement_score);
    }
}
