use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

use crate::error::DeliveryError;
use crate::types::{DestinationId, Message, MessageId};
use super::NotificationSender;

/// Logs notifications instead of delivering them
pub struct LogSender {
    next_id: AtomicU64,
}

impl LogSender {
    pub fn new() -> Self {
        Self { next_id: AtomicU64::new(1) }
    }

    fn allocate(&self) -> MessageId {
        MessageId(self.next_id.fetch_add(1, Ordering::Relaxed).to_string())
    }
}

impl Default for LogSender {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationSender for LogSender {
    fn name(&self) -> &str { "dry-run" }

    async fn send_new(
        &self,
        destination: &DestinationId,
        message: &Message,
    ) -> Result<MessageId, DeliveryError> {
        let id = self.allocate();
        info!(destination = %destination, message_id = %id, text = %message.render(), "Would send");
        Ok(id)
    }

    async fn send_reply(
        &self,
        destination: &DestinationId,
        message: &Message,
        in_reply_to: &MessageId,
    ) -> Result<MessageId, DeliveryError> {
        let id = self.allocate();
        info!(
            destination = %destination,
            message_id = %id,
            reply_to = %in_reply_to,
            text = %message.render(),
            "Would reply"
        );
        Ok(id)
    }
}
