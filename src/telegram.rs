//! Telegram operator channel.
//!
//! Spawns a long-polling tokio task that:
//! - Receives operator commands (`/startbot`, `/stopbot`, `/status`,
//!   `/exportdb`) and applies them to the activation gate / store.
//! - Serves as the mirror surface the orchestrator sends traffic copies to.
//!
//! Messages from anyone but the configured owner are ignored silently —
//! they never reach the activation state machine.

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex_lite::Regex;
use serde::Deserialize;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use crate::activation::ActivationGate;
use crate::channel::OperatorChannel;
use crate::config::BotConfig;
use crate::store::ConversationStore;

// ─── Telegram API types ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
}

#[derive(Deserialize)]
struct Update {
    update_id: i64,
    message: Option<TelegramMessage>,
}

#[derive(Deserialize)]
struct TelegramMessage {
    from: Option<TelegramUser>,
    text: Option<String>,
}

#[derive(Deserialize)]
struct TelegramUser {
    id: i64,
}

// ─── Operator commands ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorCommand {
    Start,
    Stop,
    Status,
    ExportDb,
}

impl OperatorCommand {
    /// Match a command at the start of a message, tolerating the
    /// `@BotName` suffix Telegram appends in some clients.
    pub fn parse(text: &str) -> Option<Self> {
        static PATTERN: OnceLock<Regex> = OnceLock::new();
        let pattern = PATTERN.get_or_init(|| {
            Regex::new(r"^/(startbot|stopbot|status|exportdb)(@\w+)?\s*$")
                .expect("command pattern is valid")
        });

        let captures = pattern.captures(text.trim())?;
        match captures.get(1)?.as_str() {
            "startbot" => Some(Self::Start),
            "stopbot" => Some(Self::Stop),
            "status" => Some(Self::Status),
            "exportdb" => Some(Self::ExportDb),
            _ => None,
        }
    }
}

/// What the bot loop should do after a command was applied.
#[derive(Debug, PartialEq, Eq)]
pub enum CommandAction {
    Reply(String),
    /// Acknowledge, then send the snapshot file.
    ExportSnapshot { notice: String },
}

/// Apply one incoming operator-channel message to the activation gate.
///
/// Returns `None` both for non-owner senders and for unrecognized text:
/// neither is an error, both must be invisible to the state machine.
pub fn dispatch_command(
    text: &str,
    from_id: i64,
    owner_id: i64,
    gate: &ActivationGate,
) -> Option<CommandAction> {
    if from_id != owner_id {
        return None;
    }

    match OperatorCommand::parse(text)? {
        OperatorCommand::Start => {
            gate.set(true);
            Some(CommandAction::Reply(
                "✅ تم تفعيل البوت. الآن سيرد على الرسائل.".to_string(),
            ))
        }
        OperatorCommand::Stop => {
            gate.set(false);
            Some(CommandAction::Reply(
                "⛔ تم إيقاف البوت. لن يرد الآن.".to_string(),
            ))
        }
        OperatorCommand::Status => {
            let state = if gate.is_active() {
                "✅ مفعل"
            } else {
                "⛔ متوقف"
            };
            Some(CommandAction::Reply(format!("حالة البوت: {}", state)))
        }
        OperatorCommand::ExportDb => Some(CommandAction::ExportSnapshot {
            notice: "⏳ جارٍ تجهيز الملف...".to_string(),
        }),
    }
}

// ─── Operator channel implementation ─────────────────────────────────────────

#[derive(Clone)]
pub struct TelegramOperator {
    api_base: String,
    owner_chat_id: i64,
    client: reqwest::Client,
}

impl TelegramOperator {
    pub fn new(config: &BotConfig) -> Self {
        Self {
            api_base: format!(
                "https://api.telegram.org/bot{}",
                config.telegram_bot_token.trim()
            ),
            owner_chat_id: config.telegram_owner_id,
            client: reqwest::Client::new(),
        }
    }

    fn configured(&self) -> bool {
        !self.api_base.ends_with("/bot") && self.owner_chat_id != 0
    }

    async fn send_message(&self, text: &str) -> Result<()> {
        // Telegram enforces a 4096-character limit per message
        const MAX_LEN: usize = 4096;
        let text: String = text.chars().take(MAX_LEN).collect();

        let url = format!("{}/sendMessage", self.api_base);
        let payload = serde_json::json!({ "chat_id": self.owner_chat_id, "text": text });

        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .context("Failed to reach Telegram")?;

        if !response.status().is_success() {
            anyhow::bail!("Telegram sendMessage failed: HTTP {}", response.status());
        }
        Ok(())
    }

    async fn send_file(&self, path: &Path, caption: &str) -> Result<()> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {:?}", path))?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("export.bin")
            .to_string();

        let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name);
        let form = reqwest::multipart::Form::new()
            .text("chat_id", self.owner_chat_id.to_string())
            .text("caption", caption.to_string())
            .part("document", part);

        let url = format!("{}/sendDocument", self.api_base);
        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .context("Failed to reach Telegram")?;

        if !response.status().is_success() {
            anyhow::bail!("Telegram sendDocument failed: HTTP {}", response.status());
        }
        Ok(())
    }
}

#[async_trait]
impl OperatorChannel for TelegramOperator {
    async fn notify_text(&self, text: &str) -> Result<()> {
        if !self.configured() {
            tracing::debug!("Operator channel unconfigured; dropping notice");
            return Ok(());
        }
        self.send_message(text).await
    }

    async fn send_document(&self, path: &Path, caption: &str) -> Result<()> {
        if !self.configured() {
            tracing::debug!("Operator channel unconfigured; dropping document");
            return Ok(());
        }
        self.send_file(path, caption).await
    }
}

// ─── Bot loop ─────────────────────────────────────────────────────────────────

/// Spawn the operator command loop. Does nothing when the bot token is
/// unset, so local development without Telegram credentials still runs.
pub fn spawn_operator_bot(
    operator: Arc<TelegramOperator>,
    gate: Arc<ActivationGate>,
    store: Arc<ConversationStore>,
) {
    if !operator.configured() {
        tracing::warn!("Telegram operator bot disabled (missing token or owner id)");
        return;
    }

    tokio::spawn(async move {
        tracing::info!(
            "Telegram operator bot active (owner chat id: {})",
            operator.owner_chat_id
        );
        run_bot(operator, gate, store).await;
    });
}

async fn run_bot(
    operator: Arc<TelegramOperator>,
    gate: Arc<ActivationGate>,
    store: Arc<ConversationStore>,
) {
    let mut offset: i64 = 0;

    loop {
        let updates = match poll_updates(&operator, offset).await {
            Some(u) => u,
            None => continue,
        };

        for update in updates {
            offset = update.update_id + 1;

            let msg = match update.message {
                Some(m) => m,
                None => continue,
            };

            let from_id = match msg.from {
                Some(user) => user.id,
                None => continue,
            };

            let text = match msg.text {
                Some(t) if !t.trim().is_empty() => t,
                _ => continue,
            };

            let action =
                match dispatch_command(&text, from_id, operator.owner_chat_id, gate.as_ref()) {
                    Some(action) => action,
                    None => continue,
                };

            match action {
                CommandAction::Reply(reply) => {
                    if let Err(e) = operator.send_message(&reply).await {
                        tracing::warn!("Command acknowledgment failed: {:#}", e);
                    }
                }
                CommandAction::ExportSnapshot { notice } => {
                    if let Err(e) = operator.send_message(&notice).await {
                        tracing::warn!("Export notice failed: {:#}", e);
                    }
                    if let Err(e) = operator
                        .send_file(store.snapshot_path(), "users.json")
                        .await
                    {
                        tracing::error!("Snapshot export failed: {:#}", e);
                    }
                }
            }
        }
    }
}

async fn poll_updates(operator: &TelegramOperator, offset: i64) -> Option<Vec<Update>> {
    let url = format!("{}/getUpdates", operator.api_base);
    let params = serde_json::json!({
        "offset": offset,
        "timeout": 30,
        "allowed_updates": ["message"]
    });

    let resp = match operator.client.post(&url).json(&params).send().await {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!("Telegram getUpdates error: {}", e);
            tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
            return None;
        }
    };

    let body: TelegramResponse<Vec<Update>> = match resp.json().await {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!("Telegram getUpdates parse error: {}", e);
            tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
            return None;
        }
    };

    if !body.ok {
        tracing::warn!("Telegram API returned ok=false");
        tokio::time::sleep(tokio::time::Duration::from_secs(10)).await;
        return None;
    }

    Some(body.result.unwrap_or_default())
}
