// Shared test fixtures: scripted channel adapters and container wiring.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use trade_notify::services::core::notification::channels::{
    AdapterError, ChannelAdapter, InAppAdapter,
};
use trade_notify::services::core::notification::socket_hub::SocketHub;
use trade_notify::services::core::notification::template_store::RenderedMessage;
use trade_notify::types::{Channel, DispatchRequest};

/// Adapter that fails the first `fail_first` calls with a transient error,
/// then succeeds. `fail_first = 0` always succeeds.
pub struct ScriptedAdapter {
    channel: Channel,
    pub calls: AtomicU32,
    fail_first: u32,
}

impl ScriptedAdapter {
    pub fn ok(channel: Channel) -> Arc<Self> {
        Arc::new(Self {
            channel,
            calls: AtomicU32::new(0),
            fail_first: 0,
        })
    }

    pub fn failing_first(channel: Channel, fail_first: u32) -> Arc<Self> {
        Arc::new(Self {
            channel,
            calls: AtomicU32::new(0),
            fail_first,
        })
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelAdapter for ScriptedAdapter {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn send(
        &self,
        request: &DispatchRequest,
        _message: &RenderedMessage,
    ) -> Result<String, AdapterError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first {
            Err(AdapterError::Unavailable("connection reset".to_string()))
        } else {
            Ok(format!("ext-{}", request.notification_id))
        }
    }
}

/// Adapter map with always-succeeding external channels and the real in-app
/// adapter over the hub.
pub fn ok_adapters(
    email: Arc<ScriptedAdapter>,
) -> impl FnOnce(Arc<SocketHub>) -> HashMap<Channel, Arc<dyn ChannelAdapter>> {
    move |hub| {
        let mut adapters: HashMap<Channel, Arc<dyn ChannelAdapter>> = HashMap::new();
        adapters.insert(Channel::Email, email);
        adapters.insert(Channel::Sms, ScriptedAdapter::ok(Channel::Sms));
        adapters.insert(Channel::Push, ScriptedAdapter::ok(Channel::Push));
        adapters.insert(Channel::InApp, Arc::new(InAppAdapter::new(hub)));
        adapters
    }
}
