//! Green-API style WhatsApp gateway integration.
//!
//! Inbound traffic arrives as webhook notifications (parsed here,
//! handled by `server.rs`); outbound messages go through the gateway's
//! `SendMessage` endpoint. The gateway owns authentication and session
//! state, so this module is plain HTTP — no QR pairing, no session
//! persistence.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::channel::{ChatChannel, InboundMessage, InboundPayload};
use crate::config::BotConfig;

// ─── Webhook wire types ──────────────────────────────────────────────────────

/// The gateway batches notifications under a `body` array.
#[derive(Debug, Deserialize)]
pub struct WebhookEnvelope {
    #[serde(default)]
    pub body: Vec<WebhookEvent>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookEvent {
    #[serde(rename = "typeWebhook", default)]
    pub type_webhook: String,
    #[serde(rename = "senderData")]
    pub sender_data: Option<SenderData>,
    #[serde(rename = "messageData")]
    pub message_data: Option<MessageData>,
}

#[derive(Debug, Deserialize)]
pub struct SenderData {
    #[serde(rename = "chatId", default)]
    pub chat_id: String,
    #[serde(rename = "senderName")]
    pub sender_name: Option<String>,
    #[serde(rename = "chatName")]
    pub chat_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MessageData {
    #[serde(rename = "textMessageData")]
    pub text_message_data: Option<TextMessageData>,
    #[serde(rename = "fileMessageData")]
    pub file_message_data: Option<FileMessageData>,
}

#[derive(Debug, Deserialize)]
pub struct TextMessageData {
    #[serde(rename = "textMessage", default)]
    pub text_message: String,
}

#[derive(Debug, Deserialize)]
pub struct FileMessageData {
    #[serde(rename = "downloadUrl", default)]
    pub download_url: String,
    #[serde(rename = "mimeType", default)]
    pub mime_type: String,
    #[serde(rename = "fileName")]
    pub file_name: Option<String>,
}

/// Convert one notification into an orchestrator message.
/// Anything that is not an incoming message (state changes, receipts,
/// empty payloads) is dropped here.
pub fn inbound_from_event(event: WebhookEvent) -> Option<InboundMessage> {
    if event.type_webhook != "incomingMessageReceived" {
        return None;
    }

    let sender = event.sender_data?;
    if sender.chat_id.trim().is_empty() {
        return None;
    }
    let sender_name = sender.sender_name.or(sender.chat_name);

    let message = event.message_data?;

    if let Some(file) = message.file_message_data {
        if !file.download_url.trim().is_empty() {
            return Some(InboundMessage {
                chat_id: sender.chat_id,
                sender_name,
                payload: InboundPayload::Media {
                    download_url: file.download_url,
                    mime_type: file.mime_type,
                    file_name: file.file_name,
                },
            });
        }
    }

    let text = message.text_message_data?.text_message;
    if text.trim().is_empty() {
        return None;
    }

    Some(InboundMessage {
        chat_id: sender.chat_id,
        sender_name,
        payload: InboundPayload::Text(text),
    })
}

// ─── Outbound client ─────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct GreenApiClient {
    api_url: String,
    instance_id: String,
    api_token: String,
    client: reqwest::Client,
}

impl GreenApiClient {
    pub fn new(config: &BotConfig) -> Self {
        Self {
            api_url: config.gateway_api_url.trim_end_matches('/').to_string(),
            instance_id: config.gateway_instance_id.clone(),
            api_token: config.gateway_api_token.clone(),
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self, method: &str) -> String {
        format!(
            "{}/waInstance{}/{}/{}",
            self.api_url, self.instance_id, method, self.api_token
        )
    }
}

#[async_trait]
impl ChatChannel for GreenApiClient {
    async fn send_text(&self, chat_id: &str, text: &str) -> Result<()> {
        let payload = json!({
            "chatId": chat_id,
            "message": text,
        });

        let response = self
            .client
            .post(self.endpoint("SendMessage"))
            .json(&payload)
            .send()
            .await
            .context("Failed to reach the WhatsApp gateway")?;

        if !response.status().is_success() {
            anyhow::bail!("Gateway SendMessage failed: HTTP {}", response.status());
        }

        tracing::debug!("Sent {} char(s) to {}", text.chars().count(), chat_id);
        Ok(())
    }

    async fn download_media(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to download media from gateway")?;

        if !response.status().is_success() {
            anyhow::bail!("Media download failed: HTTP {}", response.status());
        }

        let bytes = response
            .bytes()
            .await
            .context("Failed to read media body")?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_incoming_text_notification() {
        let raw = r#"{
            "body": [{
                "typeWebhook": "incomingMessageReceived",
                "senderData": {
                    "chatId": "96770000001@c.us",
                    "senderName": "Ali"
                },
                "messageData": {
                    "typeMessage": "textMessage",
                    "textMessageData": { "textMessage": "مرحبا" }
                }
            }]
        }"#;
        let envelope: WebhookEnvelope = serde_json::from_str(raw).expect("parse");
        assert_eq!(envelope.body.len(), 1);

        let message = inbound_from_event(envelope.body.into_iter().next().expect("event"))
            .expect("inbound message");
        assert_eq!(message.chat_id, "96770000001@c.us");
        assert_eq!(message.sender_id(), "96770000001");
        assert_eq!(message.sender_name.as_deref(), Some("Ali"));
        match message.payload {
            InboundPayload::Text(text) => assert_eq!(text, "مرحبا"),
            other => panic!("expected text payload, got {:?}", other),
        }
    }

    #[test]
    fn parses_incoming_file_notification() {
        let raw = r#"{
            "typeWebhook": "incomingMessageReceived",
            "senderData": { "chatId": "96770000001@c.us", "chatName": "Ali" },
            "messageData": {
                "typeMessage": "imageMessage",
                "fileMessageData": {
                    "downloadUrl": "https://media.example/file/42",
                    "mimeType": "image/jpeg",
                    "fileName": "photo.jpg"
                }
            }
        }"#;
        let event: WebhookEvent = serde_json::from_str(raw).expect("parse");
        let message = inbound_from_event(event).expect("inbound message");
        match message.payload {
            InboundPayload::Media {
                download_url,
                mime_type,
                file_name,
            } => {
                assert_eq!(download_url, "https://media.example/file/42");
                assert_eq!(mime_type, "image/jpeg");
                assert_eq!(file_name.as_deref(), Some("photo.jpg"));
            }
            other => panic!("expected media payload, got {:?}", other),
        }
    }

    #[test]
    fn ignores_non_message_notifications() {
        let raw = r#"{
            "typeWebhook": "stateInstanceChanged",
            "stateInstance": "authorized"
        }"#;
        let event: WebhookEvent = serde_json::from_str(raw).expect("parse");
        assert!(inbound_from_event(event).is_none());
    }

    #[test]
    fn ignores_empty_text() {
        let raw = r#"{
            "typeWebhook": "incomingMessageReceived",
            "senderData": { "chatId": "96770000001@c.us" },
            "messageData": { "textMessageData": { "textMessage": "   " } }
        }"#;
        let event: WebhookEvent = serde_json::from_str(raw).expect("parse");
        assert!(inbound_from_event(event).is_none());
    }

    #[test]
    fn send_endpoint_embeds_instance_and_token() {
        let mut config = BotConfig::default();
        config.gateway_instance_id = "1101".to_string();
        config.gateway_api_token = "secret".to_string();
        let client = GreenApiClient::new(&config);
        assert_eq!(
            client.endpoint("SendMessage"),
            "https://api.green-api.com/waInstance1101/SendMessage/secret"
        );
    }
}
