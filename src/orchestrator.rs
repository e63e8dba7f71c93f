//! Per-message control flow.
//!
//! Every inbound message is recorded and mirrored to the operator before
//! any reply decision. The activation gate then selects the canned
//! identity sentence (INACTIVE) or the generate→sanitize pipeline
//! (ACTIVE, text only; media never reaches the model).
//!
//! Concurrent arrivals from the same sender are strictly serialized:
//! each sender id owns a mailbox drained by a single worker task, so
//! turns are recorded in arrival order even when handlers suspend at
//! I/O. Distinct senders interleave freely.

use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::activation::ActivationGate;
use crate::channel::{ChatChannel, InboundMessage, InboundPayload, OperatorChannel};
use crate::llm::ReplyGenerator;
use crate::persona::PersonaPolicy;
use crate::store::{ConversationStore, Direction};

pub struct Orchestrator {
    store: Arc<ConversationStore>,
    gate: Arc<ActivationGate>,
    persona: Arc<PersonaPolicy>,
    generator: Arc<dyn ReplyGenerator>,
    chat: Arc<dyn ChatChannel>,
    operator: Arc<dyn OperatorChannel>,
    media_dir: PathBuf,
    window_turns: usize,
    mailboxes: Mutex<HashMap<String, flume::Sender<InboundMessage>>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<ConversationStore>,
        gate: Arc<ActivationGate>,
        persona: Arc<PersonaPolicy>,
        generator: Arc<dyn ReplyGenerator>,
        chat: Arc<dyn ChatChannel>,
        operator: Arc<dyn OperatorChannel>,
        media_dir: PathBuf,
        window_turns: usize,
    ) -> Self {
        Self {
            store,
            gate,
            persona,
            generator,
            chat,
            operator,
            media_dir,
            window_turns,
            mailboxes: Mutex::new(HashMap::new()),
        }
    }

    /// Route a message into its sender's mailbox, spawning the worker on
    /// first contact. Returns immediately; processing happens in the
    /// worker so the webhook handler can acknowledge fast.
    pub fn dispatch(self: &Arc<Self>, message: InboundMessage) {
        let sender_id = message.sender_id().to_string();
        let mut mailboxes = match self.mailboxes.lock() {
            Ok(guard) => guard,
            Err(e) => {
                tracing::error!("Mailbox registry lock poisoned: {}", e);
                return;
            }
        };

        let tx = mailboxes.entry(sender_id.clone()).or_insert_with(|| {
            let (tx, rx) = flume::unbounded();
            let orchestrator = Arc::clone(self);
            let worker_sender = sender_id.clone();
            tokio::spawn(async move {
                orchestrator.run_mailbox(worker_sender, rx).await;
            });
            tx
        });

        if tx.send(message).is_err() {
            tracing::error!("Mailbox for {} is closed; message dropped", sender_id);
        }
    }

    async fn run_mailbox(self: Arc<Self>, sender_id: String, rx: flume::Receiver<InboundMessage>) {
        while let Ok(message) = rx.recv_async().await {
            // One message's failure must never block the next
            if let Err(e) = self.handle(&message).await {
                tracing::error!("Failed to process message from {}: {:#}", sender_id, e);
            }
        }
    }

    async fn handle(&self, message: &InboundMessage) -> Result<()> {
        let sender_id = message.sender_id().to_string();
        self.store
            .note_sender(&sender_id, message.sender_name.as_deref())?;
        let display_name = self.store.get(&sender_id)?.display_name(&sender_id);

        // Record + mirror before any reply decision
        let incoming_text = match &message.payload {
            InboundPayload::Text(text) => {
                self.store
                    .append_turn(&sender_id, Direction::Inbound, text)?;
                self.mirror(format!(
                    "📩 رسالة واردة من {} ({})\n\n{}",
                    display_name, sender_id, text
                ))
                .await;
                Some(text.clone())
            }
            InboundPayload::Media {
                download_url,
                mime_type,
                file_name,
            } => {
                let path = self
                    .stash_media(download_url, mime_type, file_name.as_deref())
                    .await?;
                self.store.append_turn(
                    &sender_id,
                    Direction::Inbound,
                    &format!("[media:{}]", path.display()),
                )?;
                if let Err(e) = self
                    .operator
                    .send_document(&path, &format!("📩 وسائط واردة من {}", sender_id))
                    .await
                {
                    tracing::warn!("Operator media mirror failed: {:#}", e);
                }
                None
            }
        };

        if !self.gate.is_active() {
            let canned = self.persona.canonical_identity().to_string();
            self.chat.send_text(&message.chat_id, &canned).await?;
            self.store
                .append_turn(&sender_id, Direction::Outbound, &canned)?;
            self.mirror(format!(
                "↩️ (تم إرسال رد تلقائي أثناء الإيقاف) إلى {}: {}",
                sender_id, canned
            ))
            .await;
            return Ok(());
        }

        // Media never reaches the model; recording and mirroring were enough
        let Some(text) = incoming_text else {
            return Ok(());
        };

        let window = self.store.window(&sender_id, self.window_turns)?;
        let request = self.persona.compose_request(&window, &text);

        let reply = match self.generator.generate(request).await {
            Some(generated) => self.persona.sanitize(&generated),
            None => self.persona.apology().to_string(),
        };

        self.chat.send_text(&message.chat_id, &reply).await?;
        self.store
            .append_turn(&sender_id, Direction::Outbound, &reply)?;
        self.mirror(format!(
            "✅ تم الرد على {} بالرسالة:\n\n{}",
            sender_id, reply
        ))
        .await;

        Ok(())
    }

    /// Download a media payload and persist it under the data directory.
    async fn stash_media(
        &self,
        download_url: &str,
        mime_type: &str,
        file_name: Option<&str>,
    ) -> Result<PathBuf> {
        let bytes = self
            .chat
            .download_media(download_url)
            .await
            .context("Failed to download media payload")?;

        let ext = media_extension(mime_type, file_name);
        let path = self.media_dir.join(format!(
            "media_{}_{}.{}",
            Utc::now().format("%Y%m%d%H%M%S"),
            Uuid::new_v4(),
            ext
        ));

        fs::write(&path, &bytes)
            .with_context(|| format!("Failed to store media at {:?}", path))?;
        tracing::info!("Stored {} byte(s) of media at {:?}", bytes.len(), path);
        Ok(path)
    }

    // Mirror failures are logged, never propagated: the operator channel
    // being down must not stop replies to the end user.
    async fn mirror(&self, text: String) {
        if let Err(e) = self.operator.notify_text(&text).await {
            tracing::warn!("Operator mirror failed: {:#}", e);
        }
    }
}

fn media_extension(mime_type: &str, file_name: Option<&str>) -> String {
    if let Some(ext) = mime_type.split('/').nth(1) {
        if !ext.is_empty() {
            return ext.to_string();
        }
    }
    file_name
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .unwrap_or("bin")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BotConfig;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use tempfile::TempDir;

    #[derive(Default)]
    struct MockChat {
        sent: Mutex<Vec<(String, String)>>,
        media: Vec<u8>,
    }

    #[async_trait]
    impl ChatChannel for MockChat {
        async fn send_text(&self, chat_id: &str, text: &str) -> Result<()> {
            self.sent
                .lock()
                .expect("sent mutex")
                .push((chat_id.to_string(), text.to_string()));
            Ok(())
        }

        async fn download_media(&self, _url: &str) -> Result<Vec<u8>> {
            Ok(self.media.clone())
        }
    }

    #[derive(Default)]
    struct MockOperator {
        notices: Mutex<Vec<String>>,
        documents: Mutex<Vec<PathBuf>>,
        fail_notify: bool,
    }

    #[async_trait]
    impl OperatorChannel for MockOperator {
        async fn notify_text(&self, text: &str) -> Result<()> {
            if self.fail_notify {
                return Err(anyhow!("operator unreachable"));
            }
            self.notices
                .lock()
                .expect("notices mutex")
                .push(text.to_string());
            Ok(())
        }

        async fn send_document(&self, path: &Path, _caption: &str) -> Result<()> {
            self.documents
                .lock()
                .expect("documents mutex")
                .push(path.to_path_buf());
            Ok(())
        }
    }

    struct MockGenerator {
        reply: Option<String>,
    }

    #[async_trait]
    impl ReplyGenerator for MockGenerator {
        async fn generate(&self, _messages: Vec<crate::llm::Message>) -> Option<String> {
            self.reply.clone()
        }
    }

    struct Fixture {
        _dir: TempDir,
        orchestrator: Arc<Orchestrator>,
        store: Arc<ConversationStore>,
        chat: Arc<MockChat>,
        operator: Arc<MockOperator>,
        config: BotConfig,
    }

    fn fixture(active: bool, reply: Option<&str>) -> Fixture {
        fixture_with(active, reply, MockChat::default(), MockOperator::default())
    }

    fn fixture_with(
        active: bool,
        reply: Option<&str>,
        chat: MockChat,
        operator: MockOperator,
    ) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = BotConfig::default();
        let store = Arc::new(
            ConversationStore::load(dir.path().join("users.json"), config.history_cap)
                .expect("store"),
        );
        let chat = Arc::new(chat);
        let operator = Arc::new(operator);
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            Arc::new(ActivationGate::new(active)),
            Arc::new(PersonaPolicy::from_config(&config)),
            Arc::new(MockGenerator {
                reply: reply.map(str::to_string),
            }),
            chat.clone(),
            operator.clone(),
            dir.path().to_path_buf(),
            config.window_turns,
        ));
        Fixture {
            _dir: dir,
            orchestrator,
            store,
            chat,
            operator,
            config,
        }
    }

    fn text_message(chat_id: &str, text: &str) -> InboundMessage {
        InboundMessage {
            chat_id: chat_id.to_string(),
            sender_name: Some("A".to_string()),
            payload: InboundPayload::Text(text.to_string()),
        }
    }

    #[tokio::test]
    async fn inactive_sends_canonical_identity() {
        let f = fixture(false, Some("should never be used"));
        f.orchestrator
            .handle(&text_message("a@c.us", "hello"))
            .await
            .expect("handle");

        let sent = f.chat.sent.lock().expect("sent");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "a@c.us");
        assert_eq!(sent[0].1, f.config.canonical_identity);

        let history = f.store.get("a").expect("get").history;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].direction, Direction::Inbound);
        assert_eq!(history[0].text, "hello");
        assert_eq!(history[1].direction, Direction::Outbound);
        assert_eq!(history[1].text, f.config.canonical_identity);

        // Incoming mirror + auto-reply notice
        let notices = f.operator.notices.lock().expect("notices");
        assert_eq!(notices.len(), 2);
        assert!(notices[0].contains("hello"));
        assert!(notices[1].contains(&f.config.canonical_identity));
    }

    #[tokio::test]
    async fn active_sends_clean_generated_reply_verbatim() {
        let f = fixture(true, Some("Hi there"));
        f.orchestrator
            .handle(&text_message("a@c.us", "hello"))
            .await
            .expect("handle");

        let sent = f.chat.sent.lock().expect("sent");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "Hi there");

        let history = f.store.get("a").expect("get").history;
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].text, "Hi there");

        let notices = f.operator.notices.lock().expect("notices");
        assert_eq!(notices.len(), 2);
        assert!(notices[1].contains("Hi there"));
    }

    #[tokio::test]
    async fn generator_failure_degrades_to_single_apology() {
        let f = fixture(true, None);
        f.orchestrator
            .handle(&text_message("a@c.us", "hello"))
            .await
            .expect("handle must not fail");

        // Exactly one reply and one outbound turn, no duplicates
        let sent = f.chat.sent.lock().expect("sent");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, f.config.apology_text);

        let history = f.store.get("a").expect("get").history;
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].text, f.config.apology_text);
    }

    #[tokio::test]
    async fn tainted_reply_is_fully_replaced() {
        let f = fixture(true, Some("أنا مجرد نموذج لغوي يساعدك"));
        f.orchestrator
            .handle(&text_message("a@c.us", "من أنت؟"))
            .await
            .expect("handle");

        let sent = f.chat.sent.lock().expect("sent");
        assert_eq!(sent[0].1, f.config.canonical_identity);
    }

    #[tokio::test]
    async fn active_media_is_recorded_but_never_answered() {
        let chat = MockChat {
            media: b"fake-jpeg-bytes".to_vec(),
            ..MockChat::default()
        };
        let f = fixture_with(true, Some("unused"), chat, MockOperator::default());
        let message = InboundMessage {
            chat_id: "a@c.us".to_string(),
            sender_name: None,
            payload: InboundPayload::Media {
                download_url: "https://gateway.example/file/1".to_string(),
                mime_type: "image/jpeg".to_string(),
                file_name: None,
            },
        };
        f.orchestrator.handle(&message).await.expect("handle");

        // No reply while active: model calls are text-only
        assert!(f.chat.sent.lock().expect("sent").is_empty());

        let history = f.store.get("a").expect("get").history;
        assert_eq!(history.len(), 1);
        assert!(history[0].text.starts_with("[media:"));
        assert!(history[0].text.ends_with(".jpeg]"));

        let documents = f.operator.documents.lock().expect("documents");
        assert_eq!(documents.len(), 1);
        assert!(documents[0].exists());
    }

    #[tokio::test]
    async fn operator_outage_does_not_block_replies() {
        let operator = MockOperator {
            fail_notify: true,
            ..MockOperator::default()
        };
        let f = fixture_with(true, Some("Hi there"), MockChat::default(), operator);
        f.orchestrator
            .handle(&text_message("a@c.us", "hello"))
            .await
            .expect("handle survives mirror failure");

        let sent = f.chat.sent.lock().expect("sent");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "Hi there");
    }

    #[tokio::test]
    async fn dispatch_serializes_same_sender_messages() {
        let f = fixture(false, None);
        f.orchestrator.dispatch(text_message("a@c.us", "first"));
        f.orchestrator.dispatch(text_message("a@c.us", "second"));

        // Wait for the mailbox worker to drain both messages
        for _ in 0..100 {
            if f.store.get("a").expect("get").history.len() == 4 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let history = f.store.get("a").expect("get").history;
        assert_eq!(history.len(), 4, "two inbound + two canned outbound");
        assert_eq!(history[0].text, "first");
        assert_eq!(history[2].text, "second");
    }

    #[test]
    fn media_extension_prefers_mime_subtype() {
        assert_eq!(media_extension("image/jpeg", None), "jpeg");
        assert_eq!(media_extension("application/pdf", Some("x.doc")), "pdf");
        assert_eq!(media_extension("", Some("voice.ogg")), "ogg");
        assert_eq!(media_extension("", None), "bin");
    }
}
