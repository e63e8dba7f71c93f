//! Narrow contracts for the two messaging collaborators.
//!
//! The orchestrator depends only on these traits, never on transport or
//! session details. Concrete implementations live in `whatsapp.rs`
//! (end-user chat channel) and `telegram.rs` (operator channel).

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;

#[derive(Debug, Clone)]
pub enum InboundPayload {
    Text(String),
    Media {
        download_url: String,
        mime_type: String,
        file_name: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Full channel address, e.g. "96770000001@c.us"
    pub chat_id: String,
    pub sender_name: Option<String>,
    pub payload: InboundPayload,
}

impl InboundMessage {
    /// Stable sender identifier: the address up to the routing suffix.
    pub fn sender_id(&self) -> &str {
        self.chat_id.split('@').next().unwrap_or(&self.chat_id)
    }
}

/// The end-user chat channel: deliver text, fetch media payloads.
#[async_trait]
pub trait ChatChannel: Send + Sync {
    async fn send_text(&self, chat_id: &str, text: &str) -> Result<()>;
    async fn download_media(&self, url: &str) -> Result<Vec<u8>>;
}

/// The operator mirror: text notices and file transfers to one
/// authorized identity.
#[async_trait]
pub trait OperatorChannel: Send + Sync {
    async fn notify_text(&self, text: &str) -> Result<()>;
    async fn send_document(&self, path: &Path, caption: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_id_strips_routing_suffix() {
        let msg = InboundMessage {
            chat_id: "96770000001@c.us".to_string(),
            sender_name: None,
            payload: InboundPayload::Text("hi".to_string()),
        };
        assert_eq!(msg.sender_id(), "96770000001");
    }

    #[test]
    fn sender_id_without_suffix_is_identity() {
        let msg = InboundMessage {
            chat_id: "96770000001".to_string(),
            sender_name: None,
            payload: InboundPayload::Text("hi".to_string()),
        };
        assert_eq!(msg.sender_id(), "96770000001");
    }
}
