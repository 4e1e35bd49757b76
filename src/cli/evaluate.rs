//! `evaluate`: run extraction for a stored session outside a turn.

use anyhow::Context;

use super::Components;
use crate::config::Config;
use crate::store::is_valid_session_id;

pub async fn run_evaluate_command(config: Config, session_id: &str) -> anyhow::Result<()> {
    if !is_valid_session_id(session_id) {
        anyhow::bail!("Invalid session id: {session_id}");
    }

    let components = Components::build(&config).await?;
    let outcome = components.engine.evaluate(session_id).await?;

    if let Some(err) = &outcome.degraded {
        eprintln!("Warning: extraction degraded, profile left unchanged: {err}");
    }

    let json = serde_json::to_string_pretty(&outcome.result)
        .context("Failed to serialize extraction result")?;
    println!("{json}");
    Ok(())
}
