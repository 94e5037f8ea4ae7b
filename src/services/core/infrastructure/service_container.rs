// Composition root: owns every process-scoped service, wires the dispatch
// pipeline, and manages background-task lifecycle (init / shutdown).

use crate::services::core::infrastructure::circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerManager,
};
use crate::services::core::infrastructure::rate_limiter::{RateLimiter, RateLimiterConfig};
use crate::services::core::infrastructure::retry::RetryPolicy;
use crate::services::core::ingest::consumers::{EventIngestor, TopicSource};
use crate::services::core::ingest::dead_letter::{DeadLetterHandler, LogAlerter, OperatorAlerter};
use crate::services::core::ingest::events::EventRouter;
use crate::services::core::notification::analytics::AnalyticsService;
use crate::services::core::notification::api::NotificationApi;
use crate::services::core::notification::channels::{
    ChannelAdapter, ChannelPolicies, EmailAdapter, EmailProviderConfig, HttpEmailTransport,
    HttpPushGateway, HttpSmsGateway, InAppAdapter, PushAdapter, PushProviderConfig, SmsAdapter,
    SmsProviderConfig,
};
use crate::services::core::notification::dispatcher::{
    DispatchEngine, Dispatcher, DispatcherConfig, RetryScheduler,
};
use crate::services::core::notification::history_store::{HistoryStore, HistoryStoreConfig};
use crate::services::core::notification::preference_store::PreferenceStore;
use crate::services::core::notification::socket_hub::{SocketHub, SocketHubConfig};
use crate::services::core::notification::template_store::{TemplateStore, TemplateStoreConfig};
use crate::types::Channel;
use crate::utils::{logger::Logger, LogLevel, NotifyError, NotifyResult};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Aggregated service configuration, sourced from the environment.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub rate_limiter: RateLimiterConfig,
    pub retry: RetryPolicy,
    pub breakers: HashMap<Channel, CircuitBreakerConfig>,
    /// Per-call adapter deadlines in milliseconds.
    pub timeouts_ms: HashMap<Channel, u64>,
    pub hub: SocketHubConfig,
    pub dispatcher: DispatcherConfig,
    pub history: HistoryStoreConfig,
    pub templates: TemplateStoreConfig,
    pub email_provider: EmailProviderConfig,
    pub sms_provider: SmsProviderConfig,
    pub push_provider: PushProviderConfig,
    pub analytics_retention_days: i64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let mut timeouts_ms = HashMap::new();
        for channel in Channel::all() {
            timeouts_ms.insert(channel, channel.default_timeout_ms());
        }
        let mut breakers = HashMap::new();
        for channel in Channel::all() {
            breakers.insert(channel, CircuitBreakerConfig::default());
        }
        Self {
            rate_limiter: RateLimiterConfig::default(),
            retry: RetryPolicy::default(),
            breakers,
            timeouts_ms,
            hub: SocketHubConfig::default(),
            dispatcher: DispatcherConfig::default(),
            history: HistoryStoreConfig::default(),
            templates: TemplateStoreConfig::default(),
            email_provider: EmailProviderConfig::default(),
            sms_provider: SmsProviderConfig::default(),
            push_provider: PushProviderConfig::default(),
            analytics_retention_days: 365,
        }
    }
}

impl ServiceConfig {
    /// Assemble the full configuration from environment variables.
    pub fn from_env() -> NotifyResult<Self> {
        let mut config = Self {
            rate_limiter: RateLimiterConfig::from_env()?,
            retry: RetryPolicy::from_env()?,
            hub: SocketHubConfig::from_env()?,
            dispatcher: DispatcherConfig::from_env()?,
            history: HistoryStoreConfig::from_env()?,
            email_provider: EmailProviderConfig::from_env()?,
            sms_provider: SmsProviderConfig::from_env()?,
            push_provider: PushProviderConfig::from_env()?,
            ..Default::default()
        };

        for channel in Channel::all() {
            config
                .breakers
                .insert(channel, CircuitBreakerConfig::from_env(channel)?);
            let var = format!("TIMEOUT_{}_MS", channel.as_str());
            if let Ok(raw) = std::env::var(&var) {
                let parsed: u64 = raw.trim().parse().map_err(|_| {
                    NotifyError::config_error(format!("{} must be an integer: {}", var, raw))
                })?;
                config.timeouts_ms.insert(channel, parsed);
            }
        }

        if let Ok(raw) = std::env::var("ANALYTICS_RETENTION_DAYS") {
            config.analytics_retention_days = raw.trim().parse().map_err(|_| {
                NotifyError::config_error(format!(
                    "ANALYTICS_RETENTION_DAYS must be an integer: {}",
                    raw
                ))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> NotifyResult<()> {
        self.rate_limiter.validate()?;
        self.retry.validate()?;
        for breaker in self.breakers.values() {
            breaker.validate()?;
        }
        self.hub.validate()?;
        self.dispatcher.validate()?;
        self.history.validate()?;
        self.templates.validate()?;
        if self.analytics_retention_days <= 0 {
            return Err(NotifyError::config_error(
                "analytics_retention_days must be greater than 0",
            ));
        }
        for (channel, timeout) in &self.timeouts_ms {
            if *timeout == 0 {
                return Err(NotifyError::config_error(format!(
                    "timeout for {} must be greater than 0",
                    channel
                )));
            }
        }
        Ok(())
    }
}

/// Owns the wired services and the background tasks keeping them alive.
pub struct ServiceContainer {
    config: ServiceConfig,
    history: Arc<HistoryStore>,
    templates: Arc<TemplateStore>,
    preferences: Arc<PreferenceStore>,
    rate_limiter: Arc<RateLimiter>,
    hub: Arc<SocketHub>,
    dispatcher: Arc<Dispatcher>,
    engine: Arc<DispatchEngine>,
    api: Arc<NotificationApi>,
    router: Arc<EventRouter>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    logger: Logger,
}

impl ServiceContainer {
    /// Build and start the container with the default HTTP provider clients.
    /// Must run inside a tokio runtime; background tasks are spawned here.
    pub async fn start(config: ServiceConfig) -> NotifyResult<Self> {
        let email_transport = Arc::new(HttpEmailTransport::new(config.email_provider.clone())?);
        let sms_gateway = Arc::new(HttpSmsGateway::new(config.sms_provider.clone())?);
        let push_gateway = Arc::new(HttpPushGateway::new(config.push_provider.clone())?);

        let from_address = config.email_provider.from_address.clone();
        let from_number = config.sms_provider.from_number.clone();
        Self::start_with(config, move |hub| {
            let mut adapters: HashMap<Channel, Arc<dyn ChannelAdapter>> = HashMap::new();
            adapters.insert(
                Channel::Email,
                Arc::new(EmailAdapter::new(email_transport, from_address)),
            );
            adapters.insert(
                Channel::Sms,
                Arc::new(SmsAdapter::new(sms_gateway, from_number)),
            );
            adapters.insert(Channel::Push, Arc::new(PushAdapter::new(push_gateway)));
            adapters.insert(Channel::InApp, Arc::new(InAppAdapter::new(hub)));
            adapters
        })
        .await
    }

    /// Build and start with caller-supplied adapters (used by tests and by
    /// deployments with custom provider clients).
    pub async fn start_with<F>(config: ServiceConfig, build_adapters: F) -> NotifyResult<Self>
    where
        F: FnOnce(Arc<SocketHub>) -> HashMap<Channel, Arc<dyn ChannelAdapter>>,
    {
        config.validate()?;
        let logger = Logger::new(LogLevel::Info);

        let history = Arc::new(HistoryStore::new(config.history.clone())?);
        let templates = Arc::new(TemplateStore::new(config.templates.clone())?);
        let preferences = Arc::new(PreferenceStore::new());
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limiter.clone())?);
        let hub = Arc::new(SocketHub::new(config.hub.clone(), Arc::clone(&history))?);
        let breakers = CircuitBreakerManager::new(config.breakers.clone())?;

        if !config.sms_provider.has_credentials() {
            logger.warn("SMS provider credentials missing; SMS dispatches will fail until set");
        }

        let adapters = build_adapters(Arc::clone(&hub));
        let mut policies = HashMap::new();
        for channel in Channel::all() {
            let timeout_ms = config
                .timeouts_ms
                .get(&channel)
                .copied()
                .unwrap_or_else(|| channel.default_timeout_ms());
            policies.insert(
                channel,
                ChannelPolicies::new(
                    channel,
                    Duration::from_millis(timeout_ms),
                    config.retry.clone(),
                    breakers.breaker(channel),
                ),
            );
        }

        let dispatcher = Arc::new(Dispatcher::new(
            config.dispatcher.clone(),
            Arc::clone(&history),
            Arc::clone(&templates),
            Arc::clone(&preferences),
            Arc::clone(&rate_limiter),
            adapters,
            policies,
            Arc::clone(&hub),
        )?);
        let engine = DispatchEngine::start(Arc::clone(&dispatcher));

        let analytics = Arc::new(
            AnalyticsService::new(Arc::clone(&history))
                .with_retention_days(config.analytics_retention_days),
        );
        let api = Arc::new(NotificationApi::new(
            Arc::clone(&dispatcher),
            Arc::clone(&history),
            Arc::clone(&templates),
            analytics,
            Arc::clone(&rate_limiter),
        ));
        let router = Arc::new(EventRouter::new(Arc::clone(&templates)));

        templates.seed_system_templates().await?;

        let mut tasks = Vec::new();
        tasks.push(rate_limiter.spawn_janitor());
        tasks.push(history.spawn_retention_sweep());
        tasks.push(hub.spawn_heartbeat_task());
        let scheduler = Arc::new(RetryScheduler::new(
            Arc::clone(&engine),
            config.retry.clone(),
        ));
        tasks.push(scheduler.spawn());

        logger.info("service container started");
        Ok(Self {
            config,
            history,
            templates,
            preferences,
            rate_limiter,
            hub,
            dispatcher,
            engine,
            api,
            router,
            tasks,
            logger,
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn api(&self) -> Arc<NotificationApi> {
        Arc::clone(&self.api)
    }

    pub fn history(&self) -> Arc<HistoryStore> {
        Arc::clone(&self.history)
    }

    pub fn templates(&self) -> Arc<TemplateStore> {
        Arc::clone(&self.templates)
    }

    pub fn preferences(&self) -> Arc<PreferenceStore> {
        Arc::clone(&self.preferences)
    }

    pub fn rate_limiter(&self) -> Arc<RateLimiter> {
        Arc::clone(&self.rate_limiter)
    }

    pub fn hub(&self) -> Arc<SocketHub> {
        Arc::clone(&self.hub)
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    pub fn engine(&self) -> Arc<DispatchEngine> {
        Arc::clone(&self.engine)
    }

    /// Attach a typed consumer for one upstream topic.
    pub fn attach_ingestor(&mut self, source: Box<dyn TopicSource>) -> Arc<EventIngestor> {
        let ingestor = Arc::new(EventIngestor::new(
            source.topic().to_string(),
            Arc::clone(&self.router),
            Arc::clone(&self.engine),
        ));
        self.tasks.push(Arc::clone(&ingestor).spawn(source));
        ingestor
    }

    /// Attach the shared dead-letter consumer.
    pub fn attach_dead_letter(
        &mut self,
        source: Box<dyn TopicSource>,
        alerter: Option<Arc<dyn OperatorAlerter>>,
    ) -> Arc<DeadLetterHandler> {
        let alerter = alerter.unwrap_or_else(|| Arc::new(LogAlerter::new()));
        let handler = Arc::new(DeadLetterHandler::new(Arc::clone(&self.history), alerter));
        self.tasks.push(Arc::clone(&handler).spawn(source));
        handler
    }

    /// Drain in-flight dispatches for the configured period, then stop the
    /// background tasks. Remaining QUEUED/PROCESSING records are left for the
    /// retry scheduler on next boot.
    pub async fn shutdown(mut self) {
        self.logger.info("service container shutting down");
        self.engine.shutdown().await;
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::core::notification::channels::AdapterError;
    use crate::services::core::notification::template_store::RenderedMessage;
    use crate::types::{DispatchRequest, NotificationStatus};
    use async_trait::async_trait;

    struct OkAdapter(Channel);

    #[async_trait]
    impl ChannelAdapter for OkAdapter {
        fn channel(&self) -> Channel {
            self.0
        }

        async fn send(
            &self,
            request: &DispatchRequest,
            _message: &RenderedMessage,
        ) -> Result<String, AdapterError> {
            Ok(format!("ext-{}", request.notification_id))
        }
    }

    fn fake_adapters(hub: Arc<SocketHub>) -> HashMap<Channel, Arc<dyn ChannelAdapter>> {
        let mut adapters: HashMap<Channel, Arc<dyn ChannelAdapter>> = HashMap::new();
        adapters.insert(Channel::Email, Arc::new(OkAdapter(Channel::Email)));
        adapters.insert(Channel::Sms, Arc::new(OkAdapter(Channel::Sms)));
        adapters.insert(Channel::Push, Arc::new(OkAdapter(Channel::Push)));
        adapters.insert(Channel::InApp, Arc::new(InAppAdapter::new(hub)));
        adapters
    }

    #[tokio::test]
    async fn test_container_starts_and_seeds_templates() {
        let container = ServiceContainer::start_with(ServiceConfig::default(), fake_adapters)
            .await
            .unwrap();
        assert!(container
            .templates()
            .get_by_name("order_execution_alert")
            .await
            .is_some());
        container.shutdown().await;
    }

    #[tokio::test]
    async fn test_container_end_to_end_send() {
        let container = ServiceContainer::start_with(ServiceConfig::default(), fake_adapters)
            .await
            .unwrap();
        let api = container.api();
        let response = api
            .send(
                DispatchRequest::new(Channel::Email, "a@x.io")
                    .with_subject("s")
                    .with_content("c"),
            )
            .await
            .unwrap();
        assert_eq!(response.status, NotificationStatus::Sent);
        container.shutdown().await;
    }

    #[test]
    fn test_service_config_validation() {
        let mut config = ServiceConfig::default();
        config.analytics_retention_days = 0;
        assert!(config.validate().is_err());

        let mut config = ServiceConfig::default();
        config.timeouts_ms.insert(Channel::Email, 0);
        assert!(config.validate().is_err());
    }
}
