// Notification module: stores, dispatch pipeline, channel adapters, the
// in-app socket hub and the analytics read side.

pub mod analytics;
pub mod api;
pub mod channels;
pub mod dispatcher;
pub mod history_store;
pub mod preference_store;
pub mod socket_hub;
pub mod template_store;

pub use analytics::{AnalyticsService, DeliveryRateReport, EngagementReport};
pub use api::{BulkOutcome, BulkSendRequest, NotificationApi, SendResponse, StatusResponse};
pub use channels::{
    AdapterError, ChannelAdapter, ChannelPolicies, EmailAdapter, InAppAdapter, PushAdapter,
    SmsAdapter,
};
pub use dispatcher::{
    DispatchEngine, DispatchMetrics, Dispatcher, DispatcherConfig, RetryScheduler,
};
pub use history_store::{HistoryFilters, HistoryStore, HistoryStoreConfig};
pub use preference_store::{PreferenceStore, QuietHoursUpdate, UserPreference};
pub use socket_hub::{PushOutcome, SocketHub, SocketHubConfig};
pub use template_store::{
    NewTemplate, RenderedMessage, Template, TemplateFilters, TemplateStore, TemplateStoreConfig,
    TemplateUpdate,
};
