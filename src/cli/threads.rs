//! `cleanup-threads`: expire idle hosted-assistant thread references.

use std::time::Duration;

use crate::config::Config;
use crate::store::connect_from_config;

pub async fn run_cleanup_threads_command(
    config: Config,
    max_age_hours: Option<u64>,
) -> anyhow::Result<()> {
    let max_age = max_age_hours
        .map(|h| Duration::from_secs(h * 3600))
        .unwrap_or(config.threads.max_age);

    let store = connect_from_config(&config.database).await?;
    let cleaned = store.cleanup_inactive_threads(max_age).await?;

    tracing::info!(cleaned, max_age_secs = max_age.as_secs(), "Thread cleanup finished");
    println!("Marked {cleaned} thread(s) inactive");
    Ok(())
}
