//! Relay Channels - WhatsApp webhook server for the chat relay.
//!
//! Wires the session core to the outside world:
//! - [`WhatsAppChannel`]: webhook parsing and Graph API delivery
//! - [`CompatibleProvider`]: OpenAI-compatible chat completions
//! - [`build_router`]: axum routes for verification and inbound messages
//!
//! ## Architecture
//!
//! ```text
//! Meta → POST /webhook → Orchestrator::dispatch ──► 200 ACK
//!                              │ (detached)
//!                              ├── CompatibleProvider
//!                              └── WhatsAppChannel::send
//! ```

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod error;
pub mod provider;
pub mod routes;
pub mod whatsapp;

pub use error::{ChannelError, ChannelResult};
pub use provider::{CompatibleProvider, ProviderError};
pub use routes::{build_router, verify_signature, RelayState, WebhookResponse};
pub use whatsapp::{InboundMessage, WhatsAppChannel};

use anyhow::Context;
use relay_common::config::Config;
use relay_session::{
    ConversationStore, Orchestrator, RateLimiter, ReplyTexts, Summarizer, Sweeper,
};
use std::net::SocketAddr;
use std::sync::Arc;

/// Assemble the session core and HTTP state from config.
///
/// Returns the router state and the (not yet started) sweeper.
pub fn build_state(config: &Config) -> anyhow::Result<(Arc<RelayState>, Sweeper)> {
    if !config.whatsapp.enabled {
        anyhow::bail!("WhatsApp channel is disabled; set whatsapp.enabled in the config");
    }

    let provider = Arc::new(CompatibleProvider::from_config(&config.llm));
    let whatsapp = Arc::new(WhatsAppChannel::from_config(&config.whatsapp));

    let limiter = Arc::new(RateLimiter::new((&config.session).into()));
    let summarizer = Arc::new(Summarizer::new(provider.clone()));
    let store = Arc::new(ConversationStore::new((&config.session).into(), summarizer));

    let orchestrator = Arc::new(Orchestrator::new(
        limiter.clone(),
        store.clone(),
        provider,
        whatsapp.clone(),
        ReplyTexts::from(&config.session),
    ));

    let sweeper = Sweeper::from_config(limiter, store, &config.session);

    let state = Arc::new(RelayState {
        whatsapp,
        app_secret: config.whatsapp.app_secret.as_deref().map(Arc::<str>::from),
        orchestrator,
    });

    Ok((state, sweeper))
}

/// Start the relay server and run until Ctrl-C.
pub async fn start_server(config: &Config) -> anyhow::Result<()> {
    let addr = SocketAddr::from((
        config
            .server
            .host
            .parse::<std::net::IpAddr>()
            .with_context(|| format!("Invalid bind address: {}", config.server.host))?,
        config.server.port,
    ));

    let (state, sweeper) = build_state(config)?;
    if state.app_secret.is_none() {
        tracing::warn!("whatsapp.app_secret not set; webhook signatures are not checked");
    }

    let router = build_router(state);
    let sweeper_handle = sweeper.spawn();

    tracing::info!("Starting chat relay on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper_handle.abort();
    tracing::info!("Chat relay stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
