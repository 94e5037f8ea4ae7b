// Topic consumers: one ingestor per upstream topic group. Records are
// filtered on the eventType tag before typed deserialization; failures never
// block consumer progress.

use crate::services::core::ingest::events::{decode_event, EventKind, EventRouter};
use crate::services::core::notification::dispatcher::DispatchEngine;
use crate::types::generate_correlation_id;
use crate::utils::{logger::Logger, LogLevel};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// One record as presented by the message transport.
#[derive(Debug, Clone)]
pub struct TopicRecord {
    pub key: Option<String>,
    /// Raw JSON payload.
    pub payload: String,
    pub headers: HashMap<String, String>,
}

impl TopicRecord {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            key: None,
            payload: payload.into(),
            headers: HashMap::new(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.headers.get("correlationId").map(String::as_str)
    }
}

/// Transport seam: the broker client lives behind this trait. Pulling `None`
/// means the subscription ended.
#[async_trait]
pub trait TopicSource: Send {
    fn topic(&self) -> &str;
    async fn next(&mut self) -> Option<TopicRecord>;
}

/// Channel-backed source for tests and local runs.
pub struct InMemoryTopic {
    name: String,
    receiver: mpsc::Receiver<TopicRecord>,
}

/// Producer half of an in-memory topic.
#[derive(Clone)]
pub struct InMemoryTopicProducer {
    name: String,
    sender: mpsc::Sender<TopicRecord>,
}

impl InMemoryTopic {
    pub fn channel(name: impl Into<String>, capacity: usize) -> (InMemoryTopicProducer, Self) {
        let name = name.into();
        let (sender, receiver) = mpsc::channel(capacity);
        (
            InMemoryTopicProducer {
                name: name.clone(),
                sender,
            },
            Self { name, receiver },
        )
    }
}

impl InMemoryTopicProducer {
    pub fn topic(&self) -> &str {
        &self.name
    }

    pub async fn publish(&self, record: TopicRecord) -> bool {
        self.sender.send(record).await.is_ok()
    }

    pub async fn publish_json<T: Serialize>(&self, payload: &T) -> bool {
        match serde_json::to_string(payload) {
            Ok(json) => self.publish(TopicRecord::new(json)).await,
            Err(_) => false,
        }
    }
}

#[async_trait]
impl TopicSource for InMemoryTopic {
    fn topic(&self) -> &str {
        &self.name
    }

    async fn next(&mut self) -> Option<TopicRecord> {
        self.receiver.recv().await
    }
}

/// Event types each upstream topic group carries.
pub fn expected_kinds_for_topic(topic: &str) -> HashSet<String> {
    let kinds: &[EventKind] = match topic {
        "trading-events" => &[
            EventKind::OrderPlaced,
            EventKind::OrderFilled,
            EventKind::OrderCancelled,
            EventKind::OrderRejected,
        ],
        "payment-events" => &[
            EventKind::DepositCompleted,
            EventKind::WithdrawalCompleted,
            EventKind::PaymentFailed,
        ],
        "user-profile-events" => &[
            EventKind::ProfileUpdated,
            EventKind::EmailVerified,
            EventKind::KycSubmitted,
            EventKind::KycVerified,
        ],
        "security-events" => &[
            EventKind::SuspiciousLogin,
            EventKind::PasswordChanged,
            EventKind::TwoFaEnabled,
        ],
        "portfolio-events" => &[
            EventKind::BalanceUpdated,
            EventKind::PositionClosed,
            EventKind::PerformanceAlert,
        ],
        // The direct notification topic accepts every known event type.
        _ => EventKind::all(),
    };
    kinds.iter().map(|kind| kind.as_str().to_string()).collect()
}

/// Consumer-side counters.
#[derive(Debug, Default)]
pub struct IngestMetrics {
    pub records_seen: AtomicU64,
    pub filtered_out: AtomicU64,
    pub dispatched: AtomicU64,
    pub failed: AtomicU64,
}

impl IngestMetrics {
    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.records_seen.load(Ordering::Relaxed),
            self.filtered_out.load(Ordering::Relaxed),
            self.dispatched.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
        )
    }
}

/// One typed consumer bound to a topic group.
pub struct EventIngestor {
    topic: String,
    expected: HashSet<String>,
    router: Arc<EventRouter>,
    engine: Arc<DispatchEngine>,
    metrics: Arc<IngestMetrics>,
    logger: Logger,
}

impl EventIngestor {
    pub fn new(topic: impl Into<String>, router: Arc<EventRouter>, engine: Arc<DispatchEngine>) -> Self {
        let topic = topic.into();
        Self {
            expected: expected_kinds_for_topic(&topic),
            router,
            engine,
            metrics: Arc::new(IngestMetrics::default()),
            logger: Logger::new(LogLevel::Info),
            topic,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn metrics(&self) -> Arc<IngestMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Process one record. Never returns an error: parse, mapping and
    /// dispatch failures are logged with the correlation id and counted, and
    /// consumption moves on (at-least-once by topic, at-most-once per
    /// downstream delivery attempt).
    pub async fn process_record(&self, record: TopicRecord) {
        self.metrics.records_seen.fetch_add(1, Ordering::Relaxed);
        let correlation_id = record
            .correlation_id()
            .map(str::to_string)
            .unwrap_or_else(generate_correlation_id);

        let payload: serde_json::Value = match serde_json::from_str(&record.payload) {
            Ok(value) => value,
            Err(err) => {
                self.metrics.failed.fetch_add(1, Ordering::Relaxed);
                self.logger.warn(&format!(
                    "{}: unparseable record skipped correlation={} error={}",
                    self.topic, correlation_id, err
                ));
                return;
            }
        };

        // Tag filter runs before the typed decode.
        let Some(event_type) = payload.get("eventType").and_then(|v| v.as_str()) else {
            self.metrics.failed.fetch_add(1, Ordering::Relaxed);
            self.logger.warn(&format!(
                "{}: record without eventType skipped correlation={}",
                self.topic, correlation_id
            ));
            return;
        };
        if !self.expected.contains(event_type) {
            self.metrics.filtered_out.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let kind = match EventKind::from_str(event_type) {
            Ok(kind) => kind,
            Err(err) => {
                self.metrics.failed.fetch_add(1, Ordering::Relaxed);
                self.logger.warn(&format!(
                    "{}: {} correlation={}",
                    self.topic, err, correlation_id
                ));
                return;
            }
        };

        let event = match decode_event(kind, &payload) {
            Ok(event) => event,
            Err(err) => {
                self.metrics.failed.fetch_add(1, Ordering::Relaxed);
                self.logger.warn(&format!(
                    "{}: {} payload rejected correlation={} error={}",
                    self.topic, event_type, correlation_id, err
                ));
                return;
            }
        };

        let request = self.router.build_request(&event, correlation_id.clone()).await;
        match self.engine.submit(request).await {
            Ok(()) => {
                self.metrics.dispatched.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                self.metrics.failed.fetch_add(1, Ordering::Relaxed);
                self.logger.warn(&format!(
                    "{}: dispatch hand-off failed correlation={} error={}",
                    self.topic, correlation_id, err
                ));
            }
        }
    }

    /// Consume the source to exhaustion.
    pub async fn run(self: Arc<Self>, mut source: Box<dyn TopicSource>) {
        self.logger
            .info(&format!("ingestor started for topic {}", self.topic));
        while let Some(record) = source.next().await {
            self.process_record(record).await;
        }
        self.logger
            .info(&format!("ingestor stopped for topic {}", self.topic));
    }

    pub fn spawn(self: Arc<Self>, source: Box<dyn TopicSource>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(source))
    }
}
