mod activation;
mod channel;
mod config;
mod llm;
mod orchestrator;
mod persona;
mod server;
mod store;
mod telegram;
mod whatsapp;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use activation::ActivationGate;
use config::BotConfig;
use llm::LlmClient;
use orchestrator::Orchestrator;
use persona::PersonaPolicy;
use store::ConversationStore;
use telegram::TelegramOperator;
use whatsapp::GreenApiClient;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,doppel=debug")),
        )
        .init();

    let config = BotConfig::load();
    config.warn_missing_credentials();

    std::fs::create_dir_all(config.media_dir())
        .with_context(|| format!("Failed to create data directory {:?}", config.media_dir()))?;

    let store = Arc::new(
        ConversationStore::load(config.snapshot_path(), config.history_cap)
            .context("Failed to open conversation store")?,
    );
    let gate = Arc::new(ActivationGate::new(config.active_on_start));
    let persona = Arc::new(PersonaPolicy::from_config(&config));
    let generator = Arc::new(LlmClient::new(&config));
    let chat = Arc::new(GreenApiClient::new(&config));
    let operator = Arc::new(TelegramOperator::new(&config));

    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        gate.clone(),
        persona,
        generator,
        chat,
        operator.clone(),
        config.media_dir(),
        config.window_turns,
    ));

    telegram::spawn_operator_bot(operator, gate, store);

    tracing::info!("doppel starting (model: {})", config.llm_model);
    server::serve(&config.bind_addr, orchestrator).await
}
