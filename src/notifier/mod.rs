pub mod dry_run;
pub mod telegram;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::Config;
use crate::error::DeliveryError;
use crate::types::{DestinationId, Message, MessageId};

/// Trait for outbound chat transports
#[async_trait]
pub trait NotificationSender: Send + Sync {
    /// Transport name
    fn name(&self) -> &str;

    /// Post a standalone message and return the id the transport assigned
    async fn send_new(
        &self,
        destination: &DestinationId,
        message: &Message,
    ) -> Result<MessageId, DeliveryError>;

    /// Post a message threaded under `in_reply_to`.
    ///
    /// A thread parent that no longer exists must not fail the delivery:
    /// implementations fall back to a standalone message.
    async fn send_reply(
        &self,
        destination: &DestinationId,
        message: &Message,
        in_reply_to: &MessageId,
    ) -> Result<MessageId, DeliveryError>;
}

/// Create the configured transport
pub fn create_sender(config: &Config, dry_run: bool) -> Result<Box<dyn NotificationSender>> {
    let sender: Box<dyn NotificationSender> = match (&config.telegram, dry_run) {
        (Some(tg), false) => Box::new(telegram::TelegramSender::new(tg)?),
        _ => Box::new(dry_run::LogSender::new()),
    };

    tracing::info!(transport = sender.name(), "Initialized notification sender");
    Ok(sender)
}
