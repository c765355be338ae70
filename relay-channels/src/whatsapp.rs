//! WhatsApp channel.
//!
//! Uses the WhatsApp Business Cloud API. Messages arrive via webhook
//! (push-based); replies go out through the Graph API.

use crate::error::{ChannelError, ChannelResult};
use async_trait::async_trait;
use relay_common::config::WhatsAppConfig;
use relay_session::MessageSender;
use reqwest::Client;

const GRAPH_API_BASE: &str = "https://graph.facebook.com/v18.0";

/// A text message extracted from a webhook payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub id: String,
    /// Sender number in E.164 form (`+15551234567`).
    pub user_key: String,
    pub text: String,
    /// Platform timestamp, Unix millis.
    pub timestamp: i64,
}

/// WhatsApp channel using the Business Cloud API.
pub struct WhatsAppChannel {
    access_token: String,
    phone_number_id: String,
    verify_token: String,
    allowed_numbers: Vec<String>,
    api_base: String,
    client: Client,
}

impl WhatsAppChannel {
    /// Create a new WhatsApp channel.
    pub fn new(
        access_token: String,
        phone_number_id: String,
        verify_token: String,
        allowed_numbers: Vec<String>,
    ) -> Self {
        Self {
            access_token,
            phone_number_id,
            verify_token,
            allowed_numbers,
            api_base: GRAPH_API_BASE.to_string(),
            client: Client::new(),
        }
    }

    /// Build from config. Missing credentials become empty strings; validation
    /// rejects them before this is called in the server.
    pub fn from_config(config: &WhatsAppConfig) -> Self {
        Self::new(
            config.access_token.clone().unwrap_or_default(),
            config.phone_number_id.clone().unwrap_or_default(),
            config.verify_token.clone().unwrap_or_default(),
            config.allowed_numbers.clone(),
        )
    }

    /// Point the channel at a different Graph API base URL.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    /// Check if a phone number is allowed (E.164 format: +1234567890).
    pub fn is_number_allowed(&self, phone: &str) -> bool {
        self.allowed_numbers.iter().any(|n| n == "*" || n == phone)
    }

    /// Get the verify token for webhook verification.
    pub fn verify_token(&self) -> &str {
        &self.verify_token
    }

    /// Parse an incoming webhook payload and extract text messages.
    ///
    /// Status updates, media and messages from numbers outside the allow
    /// list are skipped.
    pub fn parse_webhook_payload(&self, payload: &serde_json::Value) -> Vec<InboundMessage> {
        let mut messages = Vec::new();

        let Some(entries) = payload.get("entry").and_then(|e| e.as_array()) else {
            return messages;
        };

        for entry in entries {
            let Some(changes) = entry.get("changes").and_then(|c| c.as_array()) else {
                continue;
            };

            for change in changes {
                let Some(msgs) = change
                    .get("value")
                    .and_then(|v| v.get("messages"))
                    .and_then(|m| m.as_array())
                else {
                    continue;
                };

                for msg in msgs {
                    let Some(from) = msg.get("from").and_then(|f| f.as_str()) else {
                        continue;
                    };

                    let user_key = if from.starts_with('+') {
                        from.to_string()
                    } else {
                        format!("+{from}")
                    };

                    if !self.is_number_allowed(&user_key) {
                        tracing::warn!(user = %user_key, "WhatsApp: ignoring message from unauthorized number");
                        continue;
                    }

                    let Some(text) = msg
                        .get("text")
                        .and_then(|t| t.get("body"))
                        .and_then(|b| b.as_str())
                    else {
                        tracing::debug!(user = %user_key, "WhatsApp: skipping non-text message");
                        continue;
                    };

                    if text.trim().is_empty() {
                        continue;
                    }

                    let timestamp = msg
                        .get("timestamp")
                        .and_then(|t| t.as_str())
                        .and_then(|t| t.parse::<i64>().ok())
                        .map(|ts| ts * 1000)
                        .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

                    let id = msg
                        .get("id")
                        .and_then(|i| i.as_str())
                        .unwrap_or("unknown")
                        .to_string();

                    messages.push(InboundMessage {
                        id,
                        user_key,
                        text: text.to_string(),
                        timestamp,
                    });
                }
            }
        }

        messages
    }

    /// Send a text message. Returns the platform message ID.
    pub async fn send_text(&self, recipient: &str, text: &str) -> ChannelResult<String> {
        let url = format!("{}/{}/messages", self.api_base, self.phone_number_id);

        // The API wants the number without the leading +
        let to = recipient.strip_prefix('+').unwrap_or(recipient);

        let body = serde_json::json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
            "type": "text",
            "text": {
                "preview_url": false,
                "body": text
            }
        });

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed(format!("WhatsApp send error: {e}")))?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            let error = resp.text().await.unwrap_or_default();
            return Err(ChannelError::Auth(format!("WhatsApp rejected token: {error}")));
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(60);
            return Err(ChannelError::RateLimited { retry_after_secs });
        }
        if !status.is_success() {
            let error = resp.text().await.unwrap_or_default();
            return Err(ChannelError::SendFailed(format!(
                "WhatsApp API error ({status}): {error}"
            )));
        }

        let result: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ChannelError::Internal(format!("Failed to parse response: {e}")))?;

        let message_id = result
            .get("messages")
            .and_then(|m| m.as_array())
            .and_then(|arr| arr.first())
            .and_then(|msg| msg.get("id"))
            .and_then(|id| id.as_str())
            .unwrap_or("unknown")
            .to_string();

        tracing::info!(user = %recipient, message_id = %message_id, "WhatsApp message sent");
        Ok(message_id)
    }
}

#[async_trait]
impl MessageSender for WhatsAppChannel {
    async fn send(&self, user_key: &str, text: &str) -> anyhow::Result<()> {
        self.send_text(user_key, text)
            .await
            .map_err(relay_common::Error::from)?;
        Ok(())
    }
}
