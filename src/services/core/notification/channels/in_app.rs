// In-app channel: stores the record and hands off to the socket hub.
// Success means "accepted for delivery"; DELIVERED requires a session ack or
// a pending-queue flush.

use super::{AdapterError, ChannelAdapter};
use crate::services::core::notification::socket_hub::SocketHub;
use crate::services::core::notification::template_store::RenderedMessage;
use crate::types::{Channel, DispatchRequest, SocketFrame};
use crate::utils::{logger::Logger, LogLevel};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

/// IN_APP channel adapter.
pub struct InAppAdapter {
    hub: Arc<SocketHub>,
    logger: Logger,
}

impl InAppAdapter {
    pub fn new(hub: Arc<SocketHub>) -> Self {
        Self {
            hub,
            logger: Logger::new(LogLevel::Info),
        }
    }
}

#[async_trait]
impl ChannelAdapter for InAppAdapter {
    fn channel(&self) -> Channel {
        Channel::InApp
    }

    async fn send(
        &self,
        request: &DispatchRequest,
        message: &RenderedMessage,
    ) -> Result<String, AdapterError> {
        if message.content.len() > Channel::InApp.max_content_length() {
            return Err(AdapterError::Validation(format!(
                "In-app content too long: {} > {}",
                message.content.len(),
                Channel::InApp.max_content_length()
            )));
        }

        let frame = SocketFrame::notification(
            request.notification_id.clone(),
            request.recipient.clone(),
            request.priority,
            json!({
                "subject": message.subject,
                "content": message.content,
                "referenceId": request.reference_id,
                "referenceType": request.reference_type,
            }),
        )
        .with_metadata("category", request.category.as_str());

        let outcome = self
            .hub
            .push(&request.recipient, frame)
            .await
            .map_err(|e| AdapterError::Unavailable(format!("socket hub push failed: {}", e)))?;

        if !outcome.delivered_live && !outcome.parked {
            // require_session mode and no connected device.
            return Err(AdapterError::RecipientRejected("no-session".into()));
        }

        self.logger.debug(&format!(
            "in-app frame accepted for {} live={} parked={}",
            request.notification_id, outcome.delivered_live, outcome.parked
        ));
        Ok(request.notification_id.clone())
    }
}
