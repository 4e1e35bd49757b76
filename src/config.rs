//! Configuration for the interview relay.
//!
//! Everything is read from the environment; a `.env` file in the working
//! directory is loaded first when present.

mod database;
mod llm;

use std::time::Duration;

pub use database::{DatabaseBackend, DatabaseConfig, default_libsql_path};
pub use llm::LlmConfig;

use crate::error::ConfigError;

/// Main configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub llm: LlmConfig,
    pub database: DatabaseConfig,
    pub gateway: GatewayConfig,
    pub relay: RelayConfig,
    pub extraction: ExtractionConfig,
    pub threads: ThreadConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        Ok(Self {
            llm: LlmConfig::resolve()?,
            database: DatabaseConfig::resolve()?,
            gateway: GatewayConfig::from_env()?,
            relay: RelayConfig::from_env()?,
            extraction: ExtractionConfig::from_env()?,
            threads: ThreadConfig::from_env()?,
        })
    }
}

/// HTTP gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
}

impl GatewayConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            host: optional_env("GATEWAY_HOST")?.unwrap_or_else(|| "127.0.0.1".to_string()),
            port: optional_env("GATEWAY_PORT")?
                .map(|s| s.parse())
                .transpose()
                .map_err(|e| ConfigError::InvalidValue {
                    key: "GATEWAY_PORT".to_string(),
                    message: format!("must be a valid port number: {e}"),
                })?
                .unwrap_or(5000),
        })
    }
}

/// What the relay does when extraction degrades mid-turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExtractionFailurePolicy {
    /// Keep streaming with the unchanged profile (default).
    #[default]
    Continue,
    /// End the turn with an error event.
    Abort,
}

impl std::str::FromStr for ExtractionFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "continue" | "degrade" => Ok(Self::Continue),
            "abort" | "fail" => Ok(Self::Abort),
            _ => Err(format!(
                "invalid extraction failure policy '{}', expected 'continue' or 'abort'",
                s
            )),
        }
    }
}

impl std::fmt::Display for ExtractionFailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Continue => write!(f, "continue"),
            Self::Abort => write!(f, "abort"),
        }
    }
}

/// Streaming relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Longest wait for the next stream event before the turn errors out.
    pub chunk_timeout: Duration,
    /// Function-call rounds allowed within one turn.
    pub max_extraction_rounds: u32,
    pub extraction_failure_policy: ExtractionFailurePolicy,
}

impl RelayConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let extraction_failure_policy =
            if let Some(p) = optional_env("EXTRACTION_FAILURE_POLICY")? {
                p.parse().map_err(|e| ConfigError::InvalidValue {
                    key: "EXTRACTION_FAILURE_POLICY".to_string(),
                    message: e,
                })?
            } else {
                ExtractionFailurePolicy::default()
            };

        Ok(Self {
            chunk_timeout: Duration::from_secs(parse_optional_env(
                "RELAY_CHUNK_TIMEOUT_SECS",
                60,
            )?),
            max_extraction_rounds: parse_optional_env("RELAY_MAX_EXTRACTION_ROUNDS", 3)?,
            extraction_failure_policy,
        })
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            chunk_timeout: Duration::from_secs(60),
            max_extraction_rounds: 3,
            extraction_failure_policy: ExtractionFailurePolicy::Continue,
        }
    }
}

/// How follow-up questions are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FollowUpMode {
    /// Ask the hosted assistant, falling back to templates on failure (default).
    #[default]
    Model,
    /// Deterministic per-cluster templates only.
    Template,
}

impl std::str::FromStr for FollowUpMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "model" | "llm" => Ok(Self::Model),
            "template" | "templates" => Ok(Self::Template),
            _ => Err(format!(
                "invalid follow-up mode '{}', expected 'model' or 'template'",
                s
            )),
        }
    }
}

/// Extraction engine configuration.
#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    /// Timeout applied to each hosted call the engine makes.
    pub timeout: Duration,
    pub follow_up_mode: FollowUpMode,
}

impl ExtractionConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let follow_up_mode = if let Some(m) = optional_env("FOLLOW_UP_MODE")? {
            m.parse().map_err(|e| ConfigError::InvalidValue {
                key: "FOLLOW_UP_MODE".to_string(),
                message: e,
            })?
        } else {
            FollowUpMode::default()
        };

        Ok(Self {
            timeout: Duration::from_secs(parse_optional_env("EXTRACTION_TIMEOUT_SECS", 60)?),
            follow_up_mode,
        })
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            follow_up_mode: FollowUpMode::Model,
        }
    }
}

/// Hosted-assistant thread bookkeeping.
#[derive(Debug, Clone)]
pub struct ThreadConfig {
    /// Threads idle longer than this are marked inactive by cleanup.
    pub max_age: Duration,
}

impl ThreadConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let hours: u64 = parse_optional_env("THREAD_MAX_AGE_HOURS", 24)?;
        Ok(Self {
            max_age: Duration::from_secs(hours * 3600),
        })
    }
}

// Helper functions

pub(crate) fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(val) if val.is_empty() => Ok(None),
        Ok(val) => Ok(Some(val)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::ParseError(format!(
            "failed to read {key}: {e}"
        ))),
    }
}

pub(crate) fn parse_optional_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    optional_env(key)?
        .map(|s| {
            s.parse().map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{e}"),
            })
        })
        .transpose()
        .map(|opt| opt.unwrap_or(default))
}
