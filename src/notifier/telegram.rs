use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::TelegramConfig;
use crate::error::DeliveryError;
use crate::types::{DestinationId, Message, MessageId};
use super::NotificationSender;

/// Telegram Bot API transport
pub struct TelegramSender {
    endpoint: String,
    parse_mode: Option<String>,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    result: Option<SentMessage>,
    error_code: Option<u16>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
}

impl TelegramSender {
    pub fn new(config: &TelegramConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        let parse_mode = Some(config.parse_mode.trim())
            .filter(|m| !m.is_empty())
            .map(str::to_string);

        Ok(Self {
            endpoint: format!(
                "{}/bot{}/sendMessage",
                config.api_url.trim_end_matches('/'),
                config.bot_token
            ),
            parse_mode,
            client,
        })
    }

    fn payload(
        &self,
        destination: &DestinationId,
        message: &Message,
        reply_to: Option<i64>,
    ) -> serde_json::Value {
        let mut payload = json!({
            "chat_id": destination.0,
            "text": message.render(),
        });

        if let Some(ref mode) = self.parse_mode {
            payload["parse_mode"] = json!(mode);
        }

        // no allow_sending_without_reply: a vanished parent must come back as
        // a 400 so send_reply can log it and re-post standalone
        if let Some(id) = reply_to {
            payload["reply_parameters"] = json!({ "message_id": id });
        }

        payload
    }

    async fn post(&self, payload: &serde_json::Value) -> Result<MessageId, DeliveryError> {
        let response = self.client.post(&self.endpoint).json(payload).send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        decode_response(status, &body)
    }
}

/// Map a `sendMessage` response to the id of the posted message
fn decode_response(status: u16, body: &str) -> Result<MessageId, DeliveryError> {
    let parsed: ApiResponse = match serde_json::from_str(body) {
        Ok(parsed) => parsed,
        Err(_) if !(200..300).contains(&status) => {
            return Err(DeliveryError::Api {
                status,
                message: body.chars().take(200).collect(),
            });
        }
        Err(e) => return Err(e.into()),
    };

    if !parsed.ok {
        return Err(DeliveryError::Api {
            status: parsed.error_code.unwrap_or(status),
            message: parsed.description.unwrap_or_else(|| "no description".into()),
        });
    }

    parsed
        .result
        .map(|m| MessageId(m.message_id.to_string()))
        .ok_or_else(|| DeliveryError::Parse("response has no result".into()))
}

fn is_missing_reply_target(err: &DeliveryError) -> bool {
    match err {
        DeliveryError::Api { status: 400, message } => {
            message.to_lowercase().contains("message to be replied not found")
        }
        _ => false,
    }
}

#[async_trait]
impl NotificationSender for TelegramSender {
    fn name(&self) -> &str { "telegram" }

    async fn send_new(
        &self,
        destination: &DestinationId,
        message: &Message,
    ) -> Result<MessageId, DeliveryError> {
        let id = self.post(&self.payload(destination, message, None)).await?;
        debug!(destination = %destination, message_id = %id, "Message sent");
        Ok(id)
    }

    async fn send_reply(
        &self,
        destination: &DestinationId,
        message: &Message,
        in_reply_to: &MessageId,
    ) -> Result<MessageId, DeliveryError> {
        let Ok(parent) = in_reply_to.0.parse::<i64>() else {
            warn!(destination = %destination, reply_to = %in_reply_to, "Unusable thread parent id, sending standalone");
            return self.send_new(destination, message).await;
        };

        match self.post(&self.payload(destination, message, Some(parent))).await {
            Ok(id) => {
                debug!(destination = %destination, message_id = %id, reply_to = parent, "Reply sent");
                Ok(id)
            }
            Err(e) if is_missing_reply_target(&e) => {
                warn!(destination = %destination, reply_to = parent, "Thread parent is gone, sending standalone");
                self.send_new(destination, message).await
            }
            Err(e) => Err(e),
        }
    }
}
