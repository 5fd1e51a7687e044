use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use crate::base::{split_message, CallbackButton, ChatChannel, InboundUpdate, OutboundNotification, MAX_MESSAGE_CHARS};
use crate::errors::{ChannelError, ChannelResult};

const API_BASE: &str = "https://api.telegram.org";
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub token: String,
    pub chat_id: String,
    pub allow_from: Vec<String>,
}

/// Telegram adapter over the bot HTTP API, grounded on the teacher's
/// `channels::telegram::TelegramChannel` send path and message-splitting,
/// but talking directly to the REST endpoint with `reqwest` instead of
/// running a `teloxide` long-poll dispatcher: the relay hub's inbound
/// transport is a webhook the gateway already decodes (spec §6), so there
/// is no dispatcher loop for this adapter to own.
pub struct TelegramChannel {
    config: TelegramConfig,
    client: Client,
}

impl TelegramChannel {
    pub fn new(config: TelegramConfig) -> Self {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .expect("building telegram http client");
        Self { config, client }
    }

    /// With no explicit allow-list configured, fall back to the single
    /// chat id the bot is configured to serve rather than trusting every
    /// sender (spec §6 "allow-list defaults to the configured chat").
    fn is_allowed(&self, sender_id: &str) -> bool {
        if self.config.allow_from.is_empty() {
            return self.config.chat_id.trim_start_matches('+') == sender_id;
        }
        self.config
            .allow_from
            .iter()
            .any(|allowed| allowed.trim_start_matches('+') == sender_id)
    }

    fn inline_keyboard(buttons: &[CallbackButton]) -> Option<Value> {
        if buttons.is_empty() {
            return None;
        }
        let row: Vec<Value> = buttons
            .iter()
            .map(|b| json!({"text": b.label, "callback_data": b.data}))
            .collect();
        Some(json!({ "inline_keyboard": [row] }))
    }

    async fn send_message(&self, chat_id: &str, text: &str, markup: Option<&Value>) -> ChannelResult<()> {
        let url = format!("{API_BASE}/bot{}/sendMessage", self.config.token);
        let mut body = json!({ "chat_id": chat_id, "text": text });
        if let Some(markup) = markup {
            body["reply_markup"] = markup.clone();
        }
        let response = self.client.post(&url).json(&body).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(ChannelError::Rejected(format!("telegram returned {status}: {detail}")));
        }
        Ok(())
    }
}

#[async_trait]
impl ChatChannel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send(&self, notification: &OutboundNotification) -> ChannelResult<()> {
        let chunks = split_message(&notification.text, MAX_MESSAGE_CHARS);
        let last = chunks.len().saturating_sub(1);
        let markup = Self::inline_keyboard(&notification.buttons);
        for (i, chunk) in chunks.iter().enumerate() {
            let markup = if i == last { markup.as_ref() } else { None };
            self.send_message(&notification.chat_id, chunk, markup).await?;
        }
        debug!(chat_id = %notification.chat_id, parts = chunks.len(), "dispatched telegram notification");
        Ok(())
    }

    fn parse_update(&self, raw: &Value) -> ChannelResult<Option<InboundUpdate>> {
        if let Some(message) = raw.get("message") {
            let Some(text) = message.get("text").and_then(Value::as_str) else {
                return Ok(None);
            };
            let sender_id = message["from"]["id"]
                .as_i64()
                .map(|id| id.to_string())
                .unwrap_or_default();
            let chat_id = message["chat"]["id"]
                .as_i64()
                .map(|id| id.to_string())
                .unwrap_or_default();
            if !self.is_allowed(&sender_id) {
                return Ok(None);
            }
            return Ok(Some(InboundUpdate::Text {
                sender_id,
                chat_id,
                text: text.to_string(),
            }));
        }

        if let Some(callback) = raw.get("callback_query") {
            let Some(data) = callback.get("data").and_then(Value::as_str) else {
                return Ok(None);
            };
            let sender_id = callback["from"]["id"]
                .as_i64()
                .map(|id| id.to_string())
                .unwrap_or_default();
            let chat_id = callback["message"]["chat"]["id"]
                .as_i64()
                .map(|id| id.to_string())
                .unwrap_or_default();
            if !self.is_allowed(&sender_id) {
                return Ok(None);
            }
            return Ok(Some(InboundUpdate::Callback {
                sender_id,
                chat_id,
                data: data.to_string(),
            }));
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn channel(chat_id: &str, allow_from: Vec<String>) -> TelegramChannel {
        TelegramChannel::new(TelegramConfig {
            token: "test-token".to_string(),
            chat_id: chat_id.to_string(),
            allow_from,
        })
    }

    #[test]
    fn parses_plain_text_message() {
        let channel = channel("42", vec![]);
        let raw = json!({
            "message": {
                "text": "/cmd kr4:1 ls",
                "from": {"id": 42},
                "chat": {"id": 42}
            }
        });
        let update = channel.parse_update(&raw).unwrap().unwrap();
        assert_eq!(
            update,
            InboundUpdate::Text {
                sender_id: "42".to_string(),
                chat_id: "42".to_string(),
                text: "/cmd kr4:1 ls".to_string(),
            }
        );
    }

    #[test]
    fn parses_callback_query() {
        let channel = channel("7", vec![]);
        let raw = json!({
            "callback_query": {
                "data": "personal:1",
                "from": {"id": 7},
                "message": {"chat": {"id": 99}}
            }
        });
        let update = channel.parse_update(&raw).unwrap().unwrap();
        assert_eq!(
            update,
            InboundUpdate::Callback {
                sender_id: "7".to_string(),
                chat_id: "99".to_string(),
                data: "personal:1".to_string(),
            }
        );
    }

    #[test]
    fn allow_list_filters_unknown_senders() {
        let channel = channel("999", vec!["42".to_string()]);
        let raw = json!({
            "message": {"text": "hi", "from": {"id": 999}, "chat": {"id": 999}}
        });
        assert_eq!(channel.parse_update(&raw).unwrap(), None);
    }

    #[test]
    fn allow_list_strips_leading_plus() {
        let channel = channel("0", vec!["+42".to_string()]);
        let raw = json!({
            "message": {"text": "hi", "from": {"id": 42}, "chat": {"id": 42}}
        });
        assert!(channel.parse_update(&raw).unwrap().is_some());
    }

    #[test]
    fn empty_allow_list_falls_back_to_configured_chat_id() {
        let channel = channel("+42", vec![]);
        let allowed = json!({
            "message": {"text": "hi", "from": {"id": 42}, "chat": {"id": 42}}
        });
        assert!(channel.parse_update(&allowed).unwrap().is_some());

        let other = json!({
            "message": {"text": "hi", "from": {"id": 7}, "chat": {"id": 7}}
        });
        assert_eq!(channel.parse_update(&other).unwrap(), None);
    }

    #[test]
    fn edited_message_updates_are_ignored() {
        let channel = channel("0", vec![]);
        let raw = json!({"edited_message": {"text": "edited"}});
        assert_eq!(channel.parse_update(&raw).unwrap(), None);
    }
}
