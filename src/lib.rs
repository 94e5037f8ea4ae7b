//! Multi-channel notification delivery service core.
//!
//! Ingests notification intents from synchronous callers and asynchronous
//! event topics, gates them through user preferences and rate limits,
//! renders templates, and dispatches to email, SMS, mobile push and the
//! in-app socket channel with at-least-once semantics, circuit-breaker
//! protected retries and a durable delivery history.

pub mod services;
pub mod types;
pub mod utils;

pub use services::core::infrastructure::{ServiceConfig, ServiceContainer};
pub use services::core::ingest::{EventIngestor, EventRouter, InMemoryTopic, TopicRecord};
pub use services::core::notification::{
    DispatchEngine, Dispatcher, NotificationApi, SocketHub,
};
pub use types::{Channel, DispatchRequest, HistoryRecord, NotificationStatus, Priority};
pub use utils::{NotifyError, NotifyResult};
