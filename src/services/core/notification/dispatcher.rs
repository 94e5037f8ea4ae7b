// Dispatcher: the single entry point that gates, renders and delivers one
// notification, plus the partitioned queue that preserves per-recipient
// ordering and the scheduler that re-queues failed work.

use crate::services::core::infrastructure::rate_limiter::RateLimiter;
use crate::services::core::infrastructure::retry::RetryPolicy;
use crate::services::core::notification::channels::{ChannelAdapter, ChannelPolicies};
use crate::services::core::notification::history_store::HistoryStore;
use crate::services::core::notification::preference_store::PreferenceStore;
use crate::services::core::notification::socket_hub::SocketHub;
use crate::services::core::notification::template_store::{RenderedMessage, TemplateStore};
use crate::types::{
    Channel, DispatchRequest, HistoryRecord, NotificationStatus, Priority,
};
use crate::utils::{logger::Logger, LogLevel, NotifyError, NotifyResult, TimeService};
use chrono::Utc;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};

/// Configuration for the dispatcher and its work queues.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// URGENT notifications bypass quiet hours when true.
    pub quiet_hours_urgent_bypass: bool,
    /// Number of single-consumer partitions preserving per-key order.
    pub partitions: usize,
    /// Bounded depth of each partition queue (backpressure).
    pub queue_capacity: usize,
    /// Bounded drain period on shutdown.
    pub drain_timeout_seconds: u64,
    /// Retry scheduler scan cadence.
    pub retry_scan_interval_seconds: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            quiet_hours_urgent_bypass: true,
            partitions: 8,
            queue_capacity: 256,
            drain_timeout_seconds: 30,
            retry_scan_interval_seconds: 15,
        }
    }
}

impl DispatcherConfig {
    /// Read `QUIET_HOURS_URGENT_BYPASS` and `DISPATCH_PARTITIONS`.
    pub fn from_env() -> NotifyResult<Self> {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var("QUIET_HOURS_URGENT_BYPASS") {
            config.quiet_hours_urgent_bypass =
                !matches!(raw.trim(), "0" | "false" | "FALSE" | "no");
        }
        if let Ok(raw) = std::env::var("DISPATCH_PARTITIONS") {
            config.partitions = raw.trim().parse().map_err(|_| {
                NotifyError::config_error(format!(
                    "DISPATCH_PARTITIONS must be an integer: {}",
                    raw
                ))
            })?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> NotifyResult<()> {
        if self.partitions == 0 {
            return Err(NotifyError::config_error("partitions must be greater than 0"));
        }
        if self.queue_capacity == 0 {
            return Err(NotifyError::config_error(
                "queue_capacity must be greater than 0",
            ));
        }
        if self.retry_scan_interval_seconds == 0 {
            return Err(NotifyError::config_error(
                "retry_scan_interval_seconds must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Dispatch-side counters.
#[derive(Debug, Default, Clone)]
pub struct DispatchMetrics {
    pub total: u64,
    pub sent: u64,
    pub cancelled: u64,
    pub failed: u64,
    pub by_channel: HashMap<Channel, u64>,
    pub avg_processing_time_ms: f64,
}

/// Orchestrates one dispatch: preference gate -> quiet hours -> rate gate ->
/// template render -> adapter call -> history bookkeeping.
pub struct Dispatcher {
    config: DispatcherConfig,
    history: Arc<HistoryStore>,
    templates: Arc<TemplateStore>,
    preferences: Arc<PreferenceStore>,
    rate_limiter: Arc<RateLimiter>,
    adapters: HashMap<Channel, Arc<dyn ChannelAdapter>>,
    policies: HashMap<Channel, ChannelPolicies>,
    hub: Arc<SocketHub>,
    time: TimeService,
    metrics: std::sync::Mutex<DispatchMetrics>,
    logger: Logger,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: DispatcherConfig,
        history: Arc<HistoryStore>,
        templates: Arc<TemplateStore>,
        preferences: Arc<PreferenceStore>,
        rate_limiter: Arc<RateLimiter>,
        adapters: HashMap<Channel, Arc<dyn ChannelAdapter>>,
        policies: HashMap<Channel, ChannelPolicies>,
        hub: Arc<SocketHub>,
    ) -> NotifyResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            history,
            templates,
            preferences,
            rate_limiter,
            adapters,
            policies,
            hub,
            time: TimeService::new(),
            metrics: std::sync::Mutex::new(DispatchMetrics::default()),
            logger: Logger::new(LogLevel::Info),
        })
    }

    pub fn history(&self) -> Arc<HistoryStore> {
        Arc::clone(&self.history)
    }

    pub fn metrics(&self) -> DispatchMetrics {
        self.metrics
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    fn record_outcome(&self, channel: Channel, status: NotificationStatus, elapsed_ms: f64) {
        if let Ok(mut metrics) = self.metrics.lock() {
            metrics.total += 1;
            match status {
                NotificationStatus::Sent | NotificationStatus::Delivered => metrics.sent += 1,
                NotificationStatus::Cancelled => metrics.cancelled += 1,
                NotificationStatus::Failed => metrics.failed += 1,
                _ => {}
            }
            *metrics.by_channel.entry(channel).or_insert(0) += 1;
            metrics.avg_processing_time_ms = (metrics.avg_processing_time_ms
                * (metrics.total - 1) as f64
                + elapsed_ms)
                / metrics.total as f64;
        }
    }

    /// Remaining breaker cooldown for a channel, if its circuit is open.
    pub fn breaker_cooldown(&self, channel: Channel) -> Option<Duration> {
        self.policies
            .get(&channel)
            .and_then(|policies| policies.breaker_cooldown())
    }

    /// Single entry point. Early exits record their outcome in the history
    /// store and return the record; only request-level validation surfaces as
    /// an error. Idempotent on notification id: a record past QUEUED is
    /// returned unchanged.
    pub async fn dispatch(&self, request: DispatchRequest) -> NotifyResult<HistoryRecord> {
        let started = std::time::Instant::now();
        let channel = request.channel;
        let result = self.dispatch_inner(request).await;
        if let Ok(record) = &result {
            self.record_outcome(
                channel,
                record.status,
                started.elapsed().as_secs_f64() * 1000.0,
            );
        }
        result
    }

    async fn dispatch_inner(&self, request: DispatchRequest) -> NotifyResult<HistoryRecord> {
        request.validate()?;

        let correlation_id = request
            .correlation_id
            .clone()
            .unwrap_or_else(|| request.notification_id.clone());
        let outcome = self.history.create(&request, correlation_id.clone()).await?;
        if !outcome.created && outcome.record.status != NotificationStatus::Queued {
            return Ok(outcome.record);
        }
        let id = request.notification_id.clone();

        // Preference gate: absence of stored preferences means consent.
        if let Some(pref) = self.preferences.get(&request.recipient).await {
            if !pref.allows(request.channel, &request.category) {
                return self.history.cancel(&id, "preferences", "dispatcher").await;
            }

            let local = self.time.local_time_in_zone(&pref.time_zone);
            if pref.is_quiet_at(local) {
                let bypass = request.priority == Priority::Urgent
                    && self.config.quiet_hours_urgent_bypass;
                if !bypass {
                    return self.history.cancel(&id, "quiet-hours", "dispatcher").await;
                }
            }

            let hourly_key = format!("user:{}", request.recipient);
            if !self.rate_limiter.allow_with_limit(
                &hourly_key,
                1,
                pref.frequency_limit_per_hour,
            ) {
                return self.history.cancel(&id, "rate-limit", "dispatcher").await;
            }
            let daily_key = format!("user-day:{}", request.recipient);
            if !self.rate_limiter.allow_in_window(
                &daily_key,
                1,
                pref.frequency_limit_per_day,
                86_400,
            ) {
                return self.history.cancel(&id, "rate-limit", "dispatcher").await;
            }
        }

        // Channel rate gate.
        let rate_key = RateLimiter::recipient_key(request.channel, &request.recipient);
        if !self.rate_limiter.allow(&rate_key, 1) {
            return self.history.cancel(&id, "rate-limit", "dispatcher").await;
        }

        // IN_APP session requirement is decided before PROCESSING so the
        // outcome can still be a cancellation.
        if request.channel == Channel::InApp
            && self.hub.require_session()
            && !self.hub.is_connected(&request.recipient).await
        {
            return self.history.cancel(&id, "no-session", "dispatcher").await;
        }

        self.history
            .update_status(&id, NotificationStatus::Processing, None, "dispatcher")
            .await?;

        // Template resolution with inline fallback.
        let (message, warning) = match self.resolve_message(&request).await {
            Ok(resolved) => resolved,
            Err(err) => {
                let failed = self
                    .history
                    .mark_failed(&id, &err.message, "dispatcher")
                    .await?;
                self.logger.warn(&format!(
                    "dispatch {} failed during template resolution: {} correlation={}",
                    id, err.message, correlation_id
                ));
                return Ok(failed);
            }
        };
        self.history
            .record_rendered(&id, message.subject.clone(), message.content.clone(), warning)
            .await?;

        // Adapter invocation under timeout / retry / breaker.
        let adapter = self.adapters.get(&request.channel).ok_or_else(|| {
            NotifyError::internal_error(format!("No adapter wired for {}", request.channel))
        })?;
        let policies = self.policies.get(&request.channel).ok_or_else(|| {
            NotifyError::internal_error(format!("No policies wired for {}", request.channel))
        })?;

        match policies.execute(adapter.as_ref(), &request, &message).await {
            Ok(external_id) => {
                let record = self
                    .history
                    .update_status(&id, NotificationStatus::Sent, Some(external_id), "dispatcher")
                    .await?;
                self.logger.info(&format!(
                    "dispatched {} via {} correlation={}",
                    id, request.channel, correlation_id
                ));
                Ok(record)
            }
            Err(err) => {
                let failed = self
                    .history
                    .mark_failed(&id, &err.message, "dispatcher")
                    .await?;
                self.logger.warn(&format!(
                    "dispatch {} via {} failed ({:?}): {} correlation={}",
                    id, request.channel, err.kind, err.message, correlation_id
                ));
                Ok(failed)
            }
        }
    }

    /// Resolve template or inline content into the rendered message. A
    /// missing or inactive template downgrades to a warning when inline
    /// subject+content are present; otherwise it is a failure.
    async fn resolve_message(
        &self,
        request: &DispatchRequest,
    ) -> NotifyResult<(RenderedMessage, Option<String>)> {
        let Some(template_name) = &request.template_name else {
            return Ok((
                RenderedMessage {
                    subject: request.subject.clone(),
                    content: request.content.clone().unwrap_or_default(),
                    html: None,
                },
                None,
            ));
        };

        if let Some(template) = self.templates.get_by_name(template_name).await {
            let rendered = self
                .templates
                .render(&template, &request.template_variables)
                .await?;
            return Ok((rendered, None));
        }

        // Distinguish an inactive version from an unknown name.
        let reason = if self.templates.get_latest_version(template_name).await.is_some() {
            "TemplateInactive"
        } else {
            "TemplateNotFound"
        };

        let has_inline = request.subject.is_some() && request.content.is_some();
        if has_inline {
            self.logger.warn(&format!(
                "template {} unusable ({}); proceeding with inline content",
                template_name, reason
            ));
            Ok((
                RenderedMessage {
                    subject: request.subject.clone(),
                    content: request.content.clone().unwrap_or_default(),
                    html: None,
                },
                Some(reason.to_string()),
            ))
        } else if reason == "TemplateInactive" {
            Err(NotifyError::template_inactive(format!(
                "Template inactive: {}",
                template_name
            )))
        } else {
            Err(NotifyError::template_not_found(format!(
                "Template not found: {}",
                template_name
            )))
        }
    }
}

/// Hash-partitioned dispatch queue: one single-consumer worker per partition
/// so messages for the same (recipient, channel) dispatch in enqueue order.
pub struct DispatchEngine {
    dispatcher: Arc<Dispatcher>,
    senders: RwLock<Option<Vec<mpsc::Sender<DispatchRequest>>>>,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    drain_timeout: Duration,
    logger: Logger,
}

impl DispatchEngine {
    pub fn start(dispatcher: Arc<Dispatcher>) -> Arc<Self> {
        let partitions = dispatcher.config.partitions;
        let capacity = dispatcher.config.queue_capacity;
        let drain_timeout = Duration::from_secs(dispatcher.config.drain_timeout_seconds);

        let mut senders = Vec::with_capacity(partitions);
        let mut workers = Vec::with_capacity(partitions);
        for partition in 0..partitions {
            let (tx, mut rx) = mpsc::channel::<DispatchRequest>(capacity);
            let worker_dispatcher = Arc::clone(&dispatcher);
            workers.push(tokio::spawn(async move {
                while let Some(request) = rx.recv().await {
                    // Future-scheduled work is parked on a timer and
                    // dispatched when due; parked items leave the partition
                    // and carry no ordering guarantee.
                    if let Some(at) = request.scheduled_at {
                        let delay = (at - Utc::now()).to_std().unwrap_or_default();
                        if !delay.is_zero() {
                            let timer_dispatcher = Arc::clone(&worker_dispatcher);
                            tokio::spawn(async move {
                                tokio::time::sleep(delay).await;
                                let mut due = request;
                                due.scheduled_at = None;
                                if let Err(err) = timer_dispatcher.dispatch(due).await {
                                    timer_dispatcher
                                        .logger
                                        .warn(&format!("scheduled dispatch rejected: {}", err));
                                }
                            });
                            continue;
                        }
                    }

                    if let Err(err) = worker_dispatcher.dispatch(request).await {
                        worker_dispatcher.logger.warn(&format!(
                            "partition {} dispatch rejected: {}",
                            partition, err
                        ));
                    }
                }
            }));
            senders.push(tx);
        }

        Arc::new(Self {
            dispatcher,
            senders: RwLock::new(Some(senders)),
            workers: Mutex::new(workers),
            drain_timeout,
            logger: Logger::new(LogLevel::Info),
        })
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// Enqueue a request on its partition; awaits when the bounded queue is
    /// full (block policy).
    pub async fn submit(&self, request: DispatchRequest) -> NotifyResult<()> {
        request.validate()?;
        let senders = self.senders.read().await;
        let senders = senders
            .as_ref()
            .ok_or_else(|| NotifyError::service_unavailable("Dispatch engine is shut down"))?;
        let index = Self::partition_index(&request.partition_key(), senders.len());
        senders[index]
            .send(request)
            .await
            .map_err(|_| NotifyError::service_unavailable("Dispatch partition closed"))
    }

    /// Non-blocking enqueue (drop policy); returns false when the partition
    /// queue is full.
    pub async fn try_submit(&self, request: DispatchRequest) -> NotifyResult<bool> {
        request.validate()?;
        let senders = self.senders.read().await;
        let senders = senders
            .as_ref()
            .ok_or_else(|| NotifyError::service_unavailable("Dispatch engine is shut down"))?;
        let index = Self::partition_index(&request.partition_key(), senders.len());
        match senders[index].try_send(request) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(_)) => Ok(false),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(NotifyError::service_unavailable(
                "Dispatch partition closed",
            )),
        }
    }

    /// Drain in-flight work for the bounded period. Remaining QUEUED or
    /// PROCESSING records are left for the retry scheduler on next boot.
    pub async fn shutdown(&self) {
        {
            let mut senders = self.senders.write().await;
            senders.take();
        }
        let mut workers = self.workers.lock().await;
        for worker in workers.drain(..) {
            if tokio::time::timeout(self.drain_timeout, worker).await.is_err() {
                self.logger
                    .warn("dispatch worker did not drain in time; deferring remaining work");
            }
        }
    }

    fn partition_index(key: &str, partitions: usize) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % partitions
    }
}

/// Re-queues FAILED records with remaining retry budget: FAILED -> QUEUED via
/// the history store, then back onto the partitioned queue.
pub struct RetryScheduler {
    engine: Arc<DispatchEngine>,
    retry: RetryPolicy,
    logger: Logger,
}

impl RetryScheduler {
    pub fn new(engine: Arc<DispatchEngine>, retry: RetryPolicy) -> Self {
        Self {
            engine,
            retry,
            logger: Logger::new(LogLevel::Info),
        }
    }

    /// One scan: pick up eligible FAILED records whose backoff has elapsed.
    pub async fn scan_once(&self) -> usize {
        let dispatcher = self.engine.dispatcher();
        let history = dispatcher.history();

        let cutoff = Utc::now()
            - chrono::Duration::milliseconds(self.retry.initial_delay_ms as i64);
        let eligible = history.list_eligible_for_retry(cutoff).await;

        let mut requeued = 0;
        for record in eligible {
            // An open circuit dictates the floor of the re-queue backoff;
            // leave the record for a later scan.
            if let Some(cooldown) = dispatcher.breaker_cooldown(record.channel) {
                self.logger.debug(&format!(
                    "retry of {} deferred; {} circuit cooling for {:?}",
                    record.notification_id, record.channel, cooldown
                ));
                continue;
            }

            let backoff = self.retry.delay_for_attempt(record.retry_count + 1);
            let last = record.last_attempt_at.unwrap_or(record.created_at);
            if Utc::now() - last
                < chrono::Duration::from_std(backoff).unwrap_or_else(|_| chrono::Duration::zero())
            {
                continue;
            }

            match history.increment_retry(&record.notification_id).await {
                Ok(requeued_record) => {
                    let request = Self::rebuild_request(&requeued_record);
                    if let Err(err) = self.engine.submit(request).await {
                        self.logger.warn(&format!(
                            "retry submit failed for {}: {}",
                            requeued_record.notification_id, err
                        ));
                    } else {
                        requeued += 1;
                    }
                }
                Err(err) => {
                    self.logger.debug(&format!(
                        "retry skipped for {}: {}",
                        record.notification_id, err
                    ));
                }
            }
        }
        requeued
    }

    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = Duration::from_secs(
            self.engine.dispatcher().config.retry_scan_interval_seconds,
        );
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.scan_once().await;
            }
        })
    }

    /// Rebuild a dispatch request from a failed record. The rendered content
    /// is re-sent inline; the recipient key doubles as the channel address.
    fn rebuild_request(record: &HistoryRecord) -> DispatchRequest {
        let mut request = DispatchRequest::new(record.channel, record.recipient.clone())
            .with_id(record.notification_id.clone())
            .with_content(record.content.clone())
            .with_category(record.category.clone())
            .with_priority(record.priority)
            .with_correlation_id(record.correlation_id.clone())
            .with_max_retry_attempts(record.max_retry_attempts);
        if let Some(subject) = &record.subject {
            request = request.with_subject(subject.clone());
        }
        if let (Some(reference_id), Some(reference_type)) =
            (&record.reference_id, &record.reference_type)
        {
            request = request.with_reference(reference_id.clone(), reference_type.clone());
        }
        match record.channel {
            Channel::Email => request = request.with_email_address(record.recipient.clone()),
            Channel::Sms => request = request.with_phone_number(record.recipient.clone()),
            Channel::Push => request = request.with_device_token(record.recipient.clone()),
            Channel::InApp => {}
        }
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::core::infrastructure::circuit_breaker::{
        CircuitBreaker, CircuitBreakerConfig,
    };
    use crate::services::core::infrastructure::rate_limiter::RateLimiterConfig;
    use crate::services::core::notification::channels::AdapterError;
    use crate::services::core::notification::history_store::HistoryStoreConfig;
    use crate::services::core::notification::socket_hub::SocketHubConfig;
    use crate::services::core::notification::template_store::TemplateStoreConfig;
    use crate::types::TemplateCategory;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct StubAdapter {
        channel: Channel,
        calls: AtomicU32,
        fail_always: Option<AdapterError>,
    }

    #[async_trait]
    impl ChannelAdapter for StubAdapter {
        fn channel(&self) -> Channel {
            self.channel
        }

        async fn send(
            &self,
            request: &DispatchRequest,
            _message: &RenderedMessage,
        ) -> Result<String, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.fail_always {
                Some(err) => Err(err.clone()),
                None => Ok(format!("ext-{}", request.notification_id)),
            }
        }
    }

    struct Harness {
        dispatcher: Arc<Dispatcher>,
        history: Arc<HistoryStore>,
        preferences: Arc<PreferenceStore>,
        templates: Arc<TemplateStore>,
        email_adapter: Arc<StubAdapter>,
    }

    fn harness_with(email_limit: u32, fail_always: Option<AdapterError>) -> Harness {
        let history = Arc::new(HistoryStore::new(HistoryStoreConfig::default()).unwrap());
        let templates = Arc::new(TemplateStore::new(TemplateStoreConfig::default()).unwrap());
        let preferences = Arc::new(PreferenceStore::new());
        let mut rate_config = RateLimiterConfig::default();
        rate_config.limits.insert(Channel::Email, email_limit);
        let rate_limiter = Arc::new(RateLimiter::new(rate_config).unwrap());
        let hub = Arc::new(
            SocketHub::new(SocketHubConfig::default(), Arc::clone(&history)).unwrap(),
        );

        let email_adapter = Arc::new(StubAdapter {
            channel: Channel::Email,
            calls: AtomicU32::new(0),
            fail_always,
        });

        let mut adapters: HashMap<Channel, Arc<dyn ChannelAdapter>> = HashMap::new();
        adapters.insert(Channel::Email, email_adapter.clone());

        let mut policies = HashMap::new();
        policies.insert(
            Channel::Email,
            ChannelPolicies::new(
                Channel::Email,
                Duration::from_millis(500),
                RetryPolicy {
                    max_attempts: 1,
                    initial_delay_ms: 1,
                    max_delay_ms: 2,
                    jitter: 0.0,
                },
                Arc::new(std::sync::Mutex::new(
                    CircuitBreaker::new(
                        Channel::Email,
                        CircuitBreakerConfig {
                            min_calls: 1000,
                            ..Default::default()
                        },
                    )
                    .unwrap(),
                )),
            ),
        );

        let dispatcher = Dispatcher::new(
            DispatcherConfig::default(),
            Arc::clone(&history),
            Arc::clone(&templates),
            Arc::clone(&preferences),
            rate_limiter,
            adapters,
            policies,
            hub,
        )
        .unwrap();

        Harness {
            dispatcher: Arc::new(dispatcher),
            history,
            preferences,
            templates,
            email_adapter,
        }
    }

    fn email_request(recipient: &str) -> DispatchRequest {
        DispatchRequest::new(Channel::Email, recipient)
            .with_subject("hello")
            .with_content("body")
            .with_category(TemplateCategory::Trading)
    }

    #[tokio::test]
    async fn test_happy_path_ends_sent() {
        let h = harness_with(1000, None);
        let record = h.dispatcher.dispatch(email_request("a@x.io")).await.unwrap();
        assert_eq!(record.status, NotificationStatus::Sent);
        assert!(record.external_message_id.is_some());
        assert_eq!(h.email_adapter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_preference_opt_out_cancels_before_adapter() {
        let h = harness_with(1000, None);
        h.preferences.get_or_create("a@x.io").await;
        h.preferences
            .set_notifications_enabled("a@x.io", false)
            .await
            .unwrap();

        let record = h.dispatcher.dispatch(email_request("a@x.io")).await.unwrap();
        assert_eq!(record.status, NotificationStatus::Cancelled);
        assert_eq!(record.cancellation_reason.as_deref(), Some("preferences"));
        assert_eq!(h.email_adapter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rate_limit_burst_cancels_overflow() {
        let h = harness_with(3, None);
        let mut statuses = Vec::new();
        for _ in 0..4 {
            let record = h.dispatcher.dispatch(email_request("a@x.io")).await.unwrap();
            statuses.push(record.status);
        }
        assert_eq!(
            statuses
                .iter()
                .filter(|s| **s == NotificationStatus::Sent)
                .count(),
            3
        );
        assert_eq!(statuses[3], NotificationStatus::Cancelled);
        assert_eq!(h.email_adapter.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_adapter_permanent_failure_marks_failed() {
        let h = harness_with(
            1000,
            Some(AdapterError::RecipientRejected("bad address".into())),
        );
        let record = h.dispatcher.dispatch(email_request("a@x.io")).await.unwrap();
        assert_eq!(record.status, NotificationStatus::Failed);
        assert!(record.error_message.unwrap().contains("bad address"));
    }

    #[tokio::test]
    async fn test_missing_template_without_inline_fails() {
        let h = harness_with(1000, None);
        let request = DispatchRequest::new(Channel::Email, "a@x.io")
            .with_template("ghost_template", HashMap::new());
        let record = h.dispatcher.dispatch(request).await.unwrap();
        assert_eq!(record.status, NotificationStatus::Failed);
        assert!(record.error_message.unwrap().contains("Template not found"));
    }

    #[tokio::test]
    async fn test_inactive_template_with_inline_fallback_sends_with_warning() {
        let h = harness_with(1000, None);
        let created = h
            .templates
            .create_template(crate::services::core::notification::template_store::NewTemplate {
                template_name: "deposit_completed_alert".to_string(),
                display_name: "Deposit completed".to_string(),
                description: None,
                channel: Channel::Email,
                category: TemplateCategory::Account,
                subject_template: "Deposit {{amount}}".to_string(),
                content_template: "Deposit of {{amount}} arrived".to_string(),
                html_template: None,
                default_priority: Priority::Medium,
                rate_limit_per_hour: None,
                created_by: "tests".to_string(),
            })
            .await
            .unwrap();
        h.templates.set_active(&created.template_id, false).await.unwrap();

        let request = DispatchRequest::new(Channel::Email, "a@x.io")
            .with_template("deposit_completed_alert", HashMap::new())
            .with_subject("Deposit completed")
            .with_content("Your deposit arrived");
        let record = h.dispatcher.dispatch(request).await.unwrap();
        assert_eq!(record.status, NotificationStatus::Sent);
        assert_eq!(record.warning.as_deref(), Some("TemplateInactive"));
        assert_eq!(record.content, "Your deposit arrived");
    }

    #[tokio::test]
    async fn test_dispatch_idempotent_on_resupplied_id() {
        let h = harness_with(1000, None);
        let request = email_request("a@x.io");
        let first = h.dispatcher.dispatch(request.clone()).await.unwrap();
        assert_eq!(first.status, NotificationStatus::Sent);

        let second = h.dispatcher.dispatch(request).await.unwrap();
        assert_eq!(second.status, NotificationStatus::Sent);
        assert_eq!(second.version, first.version);
        assert_eq!(h.email_adapter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_scheduler_requeues_failed_record() {
        let h = harness_with(
            1000,
            Some(AdapterError::Unavailable("connection reset".into())),
        );
        let request = email_request("a@x.io");
        let id = request.notification_id.clone();
        let record = h.dispatcher.dispatch(request).await.unwrap();
        assert_eq!(record.status, NotificationStatus::Failed);

        let engine = DispatchEngine::start(Arc::clone(&h.dispatcher));
        let scheduler = RetryScheduler::new(
            Arc::clone(&engine),
            RetryPolicy {
                max_attempts: 3,
                initial_delay_ms: 1,
                max_delay_ms: 2,
                jitter: 0.0,
            },
        );

        // Let the 1ms backoff floor elapse before scanning.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let requeued = scheduler.scan_once().await;
        assert_eq!(requeued, 1);

        // Give the partition worker a moment to re-process.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let record = h.history.get(&id).await.unwrap();
        assert_eq!(record.retry_count, 1);
        assert_eq!(record.status, NotificationStatus::Failed); // adapter still failing
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_engine_preserves_per_key_order() {
        let h = harness_with(1000, None);
        let engine = DispatchEngine::start(Arc::clone(&h.dispatcher));

        let mut ids = Vec::new();
        for i in 0..10 {
            let request = email_request("ordered@x.io").with_correlation_id(format!("c-{}", i));
            ids.push(request.notification_id.clone());
            engine.submit(request).await.unwrap();
        }
        engine.shutdown().await;

        let records = h.history.list_by_correlation_id("c-0").await;
        assert_eq!(records.len(), 1);
        // All processed and sent in order: last_attempt_at must be
        // non-decreasing in submission order.
        let mut previous = None;
        for id in &ids {
            let record = h.history.get(id).await.unwrap();
            assert_eq!(record.status, NotificationStatus::Sent);
            if let Some(prev) = previous {
                assert!(record.last_attempt_at.unwrap() >= prev);
            }
            previous = record.last_attempt_at;
        }
    }

    #[tokio::test]
    async fn test_dispatch_metrics_track_outcomes() {
        let h = harness_with(3, None);
        for _ in 0..4 {
            h.dispatcher.dispatch(email_request("a@x.io")).await.unwrap();
        }
        let metrics = h.dispatcher.metrics();
        assert_eq!(metrics.total, 4);
        assert_eq!(metrics.sent, 3);
        assert_eq!(metrics.cancelled, 1);
        assert_eq!(metrics.by_channel.get(&Channel::Email), Some(&4));
        assert!(metrics.avg_processing_time_ms >= 0.0);
    }

    #[tokio::test]
    async fn test_user_frequency_cap_cancels() {
        let h = harness_with(1000, None);
        h.preferences.get_or_create("a@x.io").await;
        h.preferences.update_frequency("a@x.io", 3, 3).await.unwrap();

        let mut statuses = Vec::new();
        for _ in 0..4 {
            statuses.push(h.dispatcher.dispatch(email_request("a@x.io")).await.unwrap().status);
        }
        assert_eq!(
            statuses
                .iter()
                .filter(|s| **s == NotificationStatus::Sent)
                .count(),
            3
        );
        assert_eq!(statuses[3], NotificationStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_scheduled_request_parks_until_due() {
        let h = harness_with(1000, None);
        let engine = DispatchEngine::start(Arc::clone(&h.dispatcher));

        let request = email_request("later@x.io")
            .with_scheduled_at(Utc::now() + chrono::Duration::milliseconds(80));
        let id = request.notification_id.clone();
        engine.submit(request).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.history.get(&id).await.is_err()); // not yet created

        tokio::time::sleep(Duration::from_millis(150)).await;
        let record = h.history.get(&id).await.unwrap();
        assert_eq!(record.status, NotificationStatus::Sent);
        engine.shutdown().await;
    }
}
