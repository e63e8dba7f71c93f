use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

use crate::orchestrator::Orchestrator;
use crate::whatsapp::{inbound_from_event, WebhookEnvelope};

#[derive(Clone)]
pub struct ServerState {
    pub orchestrator: Arc<Orchestrator>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

pub async fn serve(bind_addr: &str, orchestrator: Arc<Orchestrator>) -> Result<()> {
    let bind_addr = bind_addr
        .parse::<SocketAddr>()
        .context("Invalid bind address (expected host:port)")?;

    let state = Arc::new(ServerState { orchestrator });

    let app = Router::new()
        .route("/", get(alive))
        .route("/health", get(health))
        .route("/webhook", post(receive_webhook))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind server to {}", bind_addr))?;
    tracing::info!("Listening on http://{}", bind_addr);
    axum::serve(listener, app).await.context("Server failed")?;
    Ok(())
}

// Plain-text banner for external uptime monitors
async fn alive() -> &'static str {
    "Digital Hamed Bot — alive"
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// Gateway notification intake. Parsing is lenient and the response is
/// always 200: a malformed event is logged and skipped, never bounced
/// back to the gateway for redelivery.
async fn receive_webhook(
    State(state): State<Arc<ServerState>>,
    body: Bytes,
) -> Json<serde_json::Value> {
    let envelope: WebhookEnvelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!("Ignoring malformed webhook payload: {}", e);
            return Json(serde_json::json!({ "status": "ok" }));
        }
    };

    for event in envelope.body {
        if let Some(message) = inbound_from_event(event) {
            state.orchestrator.dispatch(message);
        }
    }

    Json(serde_json::json!({ "status": "ok" }))
}
