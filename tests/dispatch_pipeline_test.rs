// End-to-end dispatch pipeline: template rendering, rate-limited bursts,
// circuit breaker cycles and idempotent re-dispatch.

mod common;

use common::{ok_adapters, ScriptedAdapter};
use std::collections::HashMap;
use std::time::Duration;
use trade_notify::services::core::infrastructure::circuit_breaker::CircuitBreakerConfig;
use trade_notify::services::core::infrastructure::retry::RetryPolicy;
use trade_notify::types::{
    Channel, DispatchRequest, NotificationStatus, TemplateCategory, TimeRange,
};
use trade_notify::{ServiceConfig, ServiceContainer};

fn stats_range() -> TimeRange {
    TimeRange::new(
        chrono::Utc::now() - chrono::Duration::hours(1),
        chrono::Utc::now() + chrono::Duration::hours(1),
    )
}

#[tokio::test]
async fn templated_send_renders_subject_and_content() {
    let email = ScriptedAdapter::ok(Channel::Email);
    let container = ServiceContainer::start_with(ServiceConfig::default(), ok_adapters(email))
        .await
        .unwrap();
    let api = container.api();

    let mut variables = HashMap::new();
    variables.insert("user_name".to_string(), "A".to_string());
    variables.insert("order_id".to_string(), "O-1".to_string());
    variables.insert("symbol".to_string(), "AAPL".to_string());
    variables.insert("filled_quantity".to_string(), "10".to_string());
    variables.insert("avg_execution_price".to_string(), "150.25".to_string());

    let request = DispatchRequest::new(Channel::Email, "a@x.io")
        .with_template("order_execution_alert", variables)
        .with_category(TemplateCategory::Trading);
    let response = api.send(request).await.unwrap();
    assert_eq!(response.status, NotificationStatus::Sent);

    let status = api.status(&response.notification_id).await.unwrap();
    let subject = status.subject.unwrap();
    assert!(subject.contains("AAPL"));
    assert!(subject.contains("150.25"));

    let record = container.history().get(&response.notification_id).await.unwrap();
    assert!(record.content.contains("AAPL"));
    assert!(record.content.contains("150.25"));
    assert!(record.external_message_id.is_some());

    container.shutdown().await;
}

#[tokio::test]
async fn rate_limited_burst_cancels_fourth_send() {
    let mut config = ServiceConfig::default();
    config.rate_limiter.limits.insert(Channel::Email, 3);
    let email = ScriptedAdapter::ok(Channel::Email);
    let adapter = email.clone();
    let container = ServiceContainer::start_with(config, ok_adapters(email))
        .await
        .unwrap();
    let api = container.api();

    let mut statuses = Vec::new();
    for _ in 0..4 {
        let request = DispatchRequest::new(Channel::Email, "burst@x.io")
            .with_subject("s")
            .with_content("c");
        statuses.push(api.send(request).await.unwrap().status);
    }

    assert_eq!(
        statuses
            .iter()
            .filter(|s| **s == NotificationStatus::Sent)
            .count(),
        3
    );
    assert_eq!(statuses[3], NotificationStatus::Cancelled);
    assert_eq!(adapter.call_count(), 3);

    let stats = container.history().delivery_statistics(stats_range()).await;
    assert_eq!(stats.get(&NotificationStatus::Sent), Some(&3));
    assert_eq!(stats.get(&NotificationStatus::Cancelled), Some(&1));

    container.shutdown().await;
}

#[tokio::test]
async fn circuit_opens_fails_fast_and_recovers() {
    let mut config = ServiceConfig::default();
    config.retry = RetryPolicy {
        max_attempts: 1,
        initial_delay_ms: 1,
        max_delay_ms: 2,
        jitter: 0.0,
    };
    config.breakers.insert(
        Channel::Email,
        CircuitBreakerConfig {
            error_rate_threshold: 0.5,
            window_size: 4,
            min_calls: 3,
            wait_ms: 1_000,
            half_open_max_calls: 1,
            half_open_success_threshold: 1,
            ..Default::default()
        },
    );

    // Three transient failures, then the provider recovers.
    let email = ScriptedAdapter::failing_first(Channel::Email, 3);
    let adapter = email.clone();
    let container = ServiceContainer::start_with(config, ok_adapters(email))
        .await
        .unwrap();
    let api = container.api();

    let send = |n: u32| {
        let api = api.clone();
        async move {
            api.send(
                DispatchRequest::new(Channel::Email, format!("cb-{}@x.io", n))
                    .with_subject("s")
                    .with_content("c")
                    .with_max_retry_attempts(0),
            )
            .await
            .unwrap()
        }
    };

    for n in 0..3 {
        assert_eq!(send(n).await.status, NotificationStatus::Failed);
    }
    assert_eq!(adapter.call_count(), 3);

    // Circuit is open: the fourth call fails without touching the adapter.
    let response = send(3).await;
    assert_eq!(response.status, NotificationStatus::Failed);
    assert_eq!(adapter.call_count(), 3);
    let record = container.history().get(&response.notification_id).await.unwrap();
    assert!(record.error_message.unwrap().contains("circuit breaker is open"));

    // After the cooldown a half-open probe succeeds and the circuit closes.
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert_eq!(send(4).await.status, NotificationStatus::Sent);
    assert_eq!(send(5).await.status, NotificationStatus::Sent);

    container.shutdown().await;
}

#[tokio::test]
async fn dispatch_is_idempotent_on_resupplied_id() {
    let email = ScriptedAdapter::ok(Channel::Email);
    let adapter = email.clone();
    let container = ServiceContainer::start_with(ServiceConfig::default(), ok_adapters(email))
        .await
        .unwrap();
    let api = container.api();

    let request = DispatchRequest::new(Channel::Email, "a@x.io")
        .with_subject("s")
        .with_content("c");
    let first = api.send(request.clone()).await.unwrap();
    let second = api.send(request).await.unwrap();

    assert_eq!(first.notification_id, second.notification_id);
    assert_eq!(second.status, NotificationStatus::Sent);
    assert_eq!(adapter.call_count(), 1);

    container.shutdown().await;
}

#[tokio::test]
async fn transient_failure_is_retried_by_scheduler_until_sent() {
    let mut config = ServiceConfig::default();
    config.retry = RetryPolicy {
        max_attempts: 1,
        initial_delay_ms: 1,
        max_delay_ms: 2,
        jitter: 0.0,
    };
    config.dispatcher.retry_scan_interval_seconds = 1;

    // First attempt fails, the retry succeeds.
    let email = ScriptedAdapter::failing_first(Channel::Email, 1);
    let container = ServiceContainer::start_with(config, ok_adapters(email))
        .await
        .unwrap();
    let api = container.api();

    let response = api
        .send(
            DispatchRequest::new(Channel::Email, "retry@x.io")
                .with_subject("s")
                .with_content("c"),
        )
        .await
        .unwrap();
    assert_eq!(response.status, NotificationStatus::Failed);

    // The scheduler requeues FAILED records with remaining budget.
    let mut record = container.history().get(&response.notification_id).await.unwrap();
    for _ in 0..40 {
        if record.status == NotificationStatus::Sent {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        record = container.history().get(&response.notification_id).await.unwrap();
    }
    assert_eq!(record.status, NotificationStatus::Sent);
    assert_eq!(record.retry_count, 1);
    assert!(record.retry_count <= record.max_retry_attempts);

    container.shutdown().await;
}
