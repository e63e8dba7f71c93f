//! Persona prompt policy and reply sanitation.
//!
//! The persona is a hard behavioral contract, enforced twice: the system
//! prompt instructs the model never to self-identify as an automated
//! system, and `sanitize` drops any reply that slips a denylisted term,
//! replacing it wholesale with the canonical identity sentence. Partial
//! redaction is never attempted.

use crate::config::BotConfig;
use crate::llm::Message;
use crate::store::{Direction, Turn};

const CONTEXT_PREAMBLE: &str = "هذا سجل محادثة سابقة (اعتمد عليه لصياغة إجابة كحامد):";

pub struct PersonaPolicy {
    system_prompt: String,
    canonical_identity: String,
    apology: String,
    // Lowercased once at construction; matching is containment, not word-boundary
    forbidden_terms: Vec<String>,
}

impl PersonaPolicy {
    pub fn from_config(config: &BotConfig) -> Self {
        Self {
            system_prompt: config.persona_prompt.clone(),
            canonical_identity: config.canonical_identity.clone(),
            apology: config.apology_text.clone(),
            forbidden_terms: config
                .forbidden_terms
                .iter()
                .map(|t| t.to_lowercase())
                .filter(|t| !t.trim().is_empty())
                .collect(),
        }
    }

    pub fn canonical_identity(&self) -> &str {
        &self.canonical_identity
    }

    pub fn apology(&self) -> &str {
        &self.apology
    }

    /// Compose the ordered request blocks for the reply generator:
    /// system prompt, rendered history window, then the new message.
    /// Reordering the blocks changes model behavior; treat as a breaking change.
    pub fn compose_request(&self, window: &[Turn], new_message: &str) -> Vec<Message> {
        vec![
            Message::system(self.system_prompt.clone()),
            Message::user(format!(
                "{}\n{}",
                CONTEXT_PREAMBLE,
                render_window(window)
            )),
            Message::user(new_message),
        ]
    }

    /// All-or-nothing persona filter: any denylisted term, in any casing,
    /// discards the entire reply in favor of the canonical identity sentence.
    pub fn sanitize(&self, text: &str) -> String {
        let lower = text.to_lowercase();
        if self
            .forbidden_terms
            .iter()
            .any(|term| lower.contains(term.as_str()))
        {
            return self.canonical_identity.clone();
        }
        text.to_string()
    }
}

/// Alternating "User:"/"You:" transcript lines, oldest first.
fn render_window(window: &[Turn]) -> String {
    window
        .iter()
        .map(|turn| match turn.direction {
            Direction::Inbound => format!("User: {}", turn.text),
            Direction::Outbound => format!("You: {}", turn.text),
        })
        .collect::<Vec<_>>()
        .join("\n")
}
