// Preference and quiet-hours gating, including the URGENT bypass.

mod common;

use common::{ok_adapters, ScriptedAdapter};
use serde_json::json;
use std::time::Duration;
use trade_notify::services::core::ingest::consumers::{InMemoryTopic, TopicRecord};
use trade_notify::services::core::notification::preference_store::QuietHoursUpdate;
use trade_notify::types::{Channel, DispatchRequest, NotificationStatus, Priority};
use trade_notify::{ServiceConfig, ServiceContainer};

/// Quiet window wrapped around the current UTC time, emulating a user whose
/// local clock sits inside their configured quiet hours.
fn quiet_window_containing_now() -> QuietHoursUpdate {
    let now = chrono::Utc::now().time();
    QuietHoursUpdate {
        enabled: true,
        quiet_start: now - chrono::Duration::hours(1),
        quiet_end: now + chrono::Duration::hours(1),
        time_zone: "UTC".to_string(),
    }
}

#[tokio::test]
async fn disabled_user_never_reaches_adapter() {
    let email = ScriptedAdapter::ok(Channel::Email);
    let adapter = email.clone();
    let container = ServiceContainer::start_with(ServiceConfig::default(), ok_adapters(email))
        .await
        .unwrap();

    container.preferences().get_or_create("opted-out@x.io").await;
    container
        .preferences()
        .set_notifications_enabled("opted-out@x.io", false)
        .await
        .unwrap();

    let response = container
        .api()
        .send(
            DispatchRequest::new(Channel::Email, "opted-out@x.io")
                .with_subject("s")
                .with_content("c")
                .with_priority(Priority::Urgent),
        )
        .await
        .unwrap();

    assert_eq!(response.status, NotificationStatus::Cancelled);
    let record = container.history().get(&response.notification_id).await.unwrap();
    assert_eq!(record.cancellation_reason.as_deref(), Some("preferences"));
    assert_eq!(adapter.call_count(), 0);

    container.shutdown().await;
}

#[tokio::test]
async fn quiet_hours_cancel_medium_but_urgent_bypasses() {
    let email = ScriptedAdapter::ok(Channel::Email);
    let container = ServiceContainer::start_with(ServiceConfig::default(), ok_adapters(email))
        .await
        .unwrap();

    container.preferences().get_or_create("sleeper@x.io").await;
    container
        .preferences()
        .update_quiet_hours("sleeper@x.io", quiet_window_containing_now())
        .await
        .unwrap();

    let medium = container
        .api()
        .send(
            DispatchRequest::new(Channel::Email, "sleeper@x.io")
                .with_subject("s")
                .with_content("c")
                .with_priority(Priority::Medium),
        )
        .await
        .unwrap();
    assert_eq!(medium.status, NotificationStatus::Cancelled);
    let record = container.history().get(&medium.notification_id).await.unwrap();
    assert_eq!(record.cancellation_reason.as_deref(), Some("quiet-hours"));

    let urgent = container
        .api()
        .send(
            DispatchRequest::new(Channel::Email, "sleeper@x.io")
                .with_subject("s")
                .with_content("c")
                .with_priority(Priority::Urgent),
        )
        .await
        .unwrap();
    assert_eq!(urgent.status, NotificationStatus::Sent);

    container.shutdown().await;
}

#[tokio::test]
async fn urgent_does_not_bypass_when_flag_disabled() {
    let mut config = ServiceConfig::default();
    config.dispatcher.quiet_hours_urgent_bypass = false;
    let email = ScriptedAdapter::ok(Channel::Email);
    let container = ServiceContainer::start_with(config, ok_adapters(email))
        .await
        .unwrap();

    container.preferences().get_or_create("sleeper@x.io").await;
    container
        .preferences()
        .update_quiet_hours("sleeper@x.io", quiet_window_containing_now())
        .await
        .unwrap();

    let urgent = container
        .api()
        .send(
            DispatchRequest::new(Channel::Email, "sleeper@x.io")
                .with_subject("s")
                .with_content("c")
                .with_priority(Priority::Urgent),
        )
        .await
        .unwrap();
    assert_eq!(urgent.status, NotificationStatus::Cancelled);

    container.shutdown().await;
}

#[tokio::test]
async fn suspicious_login_event_bypasses_quiet_hours() {
    let email = ScriptedAdapter::ok(Channel::Email);
    let mut container =
        ServiceContainer::start_with(ServiceConfig::default(), ok_adapters(email))
            .await
            .unwrap();

    container.preferences().get_or_create("a@x.io").await;
    container
        .preferences()
        .update_quiet_hours("a@x.io", quiet_window_containing_now())
        .await
        .unwrap();

    let (producer, source) = InMemoryTopic::channel("security-events", 16);
    container.attach_ingestor(Box::new(source));

    producer
        .publish(
            TopicRecord::new(
                json!({
                    "eventType": "SUSPICIOUS_LOGIN",
                    "userEmail": "a@x.io",
                    "userName": "A",
                    "ipAddress": "203.0.113.9",
                    "location": "Reykjavik"
                })
                .to_string(),
            )
            .with_header("correlationId", "corr-night"),
        )
        .await;

    let mut records = Vec::new();
    for _ in 0..50 {
        records = container.history().list_by_correlation_id("corr-night").await;
        if records
            .iter()
            .any(|r| r.status != NotificationStatus::Queued)
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.priority, Priority::Urgent);
    assert_eq!(record.status, NotificationStatus::Sent);
    assert!(record.subject.as_deref().unwrap().starts_with("SECURITY ALERT"));

    container.shutdown().await;
}
