//! `serve`: run the HTTP gateway until interrupted.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;

use super::Components;
use crate::config::Config;
use crate::gateway::{GatewayState, start_server};

pub async fn run_serve_command(config: Config) -> anyhow::Result<()> {
    let components = Components::build(&config).await?;

    let addr: SocketAddr = format!("{}:{}", config.gateway.host, config.gateway.port)
        .parse()
        .with_context(|| {
            format!(
                "Invalid gateway address {}:{}",
                config.gateway.host, config.gateway.port
            )
        })?;

    let state = Arc::new(GatewayState::new(
        components.relay,
        components.engine,
        components.store,
    ));
    let bound = start_server(addr, Arc::clone(&state)).await?;

    tracing::info!(
        %bound,
        model = components.llm.model_name(),
        extraction_model = %config.llm.extraction_model,
        failure_policy = %config.relay.extraction_failure_policy,
        "Interview relay ready"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    state.shutdown().await;
    Ok(())
}
