//! Command-line interface.

mod evaluate;
mod serve;
mod threads;

use std::sync::Arc;

use clap::{Parser, Subcommand};

pub use evaluate::run_evaluate_command;
pub use serve::run_serve_command;
pub use threads::run_cleanup_threads_command;

use crate::config::Config;
use crate::extraction::ExtractionEngine;
use crate::llm::{LlmProvider, create_extraction_provider, create_llm_provider};
use crate::relay::Relay;
use crate::store::{Store, connect_from_config};

#[derive(Parser, Debug)]
#[command(name = "interview-relay", version, about = "Streaming interview relay")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the HTTP gateway (default).
    Serve,
    /// Run extraction for a stored session and print the result as JSON.
    Evaluate {
        /// Session to evaluate.
        session_id: String,
    },
    /// Mark hosted-assistant threads idle longer than the horizon as inactive.
    CleanupThreads {
        /// Inactivity horizon in hours (default: THREAD_MAX_AGE_HOURS).
        #[arg(long)]
        max_age_hours: Option<u64>,
    },
}

/// Run the parsed command.
pub async fn run(cli: Cli, config: Config) -> anyhow::Result<()> {
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => run_serve_command(config).await,
        Command::Evaluate { session_id } => run_evaluate_command(config, &session_id).await,
        Command::CleanupThreads { max_age_hours } => {
            run_cleanup_threads_command(config, max_age_hours).await
        }
    }
}

/// The wired-up service components.
pub struct Components {
    pub store: Arc<dyn Store>,
    pub llm: Arc<dyn LlmProvider>,
    pub engine: Arc<ExtractionEngine>,
    pub relay: Arc<Relay>,
}

impl Components {
    pub async fn build(config: &Config) -> anyhow::Result<Self> {
        let store = connect_from_config(&config.database).await?;
        let llm = create_llm_provider(&config.llm)?;
        let extraction_llm = create_extraction_provider(&config.llm, &llm)?;
        let engine = Arc::new(ExtractionEngine::new(
            extraction_llm,
            Arc::clone(&store),
            config.extraction.clone(),
        ));
        let relay = Arc::new(Relay::new(
            Arc::clone(&llm),
            Arc::clone(&store),
            Arc::clone(&engine),
            config.relay.clone(),
        ));
        Ok(Self {
            store,
            llm,
            engine,
            relay,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_command_is_serve() {
        let cli = Cli::try_parse_from(["interview-relay"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_parse_evaluate() {
        let cli = Cli::try_parse_from(["interview-relay", "evaluate", "abc123"]).unwrap();
        match cli.command {
            Some(Command::Evaluate { session_id }) => assert_eq!(session_id, "abc123"),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_cleanup_threads() {
        let cli = Cli::try_parse_from([
            "interview-relay",
            "cleanup-threads",
            "--max-age-hours",
            "6",
        ])
        .unwrap();
        match cli.command {
            Some(Command::CleanupThreads { max_age_hours }) => assert_eq!(max_age_hours, Some(6)),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
