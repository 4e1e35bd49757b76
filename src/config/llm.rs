use std::time::Duration;

use secrecy::SecretString;

use super::{optional_env, parse_optional_env};
use crate::error::ConfigError;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Hosted assistant configuration.
///
/// Any endpoint that speaks the OpenAI Chat Completions API works here, with
/// or without an API key.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: Option<SecretString>,
    /// Model used for the interview conversation.
    pub model: String,
    /// Model used for profile extraction and follow-up questions.
    /// Falls back to `model` when `EXTRACTION_MODEL` is unset.
    pub extraction_model: String,
    /// Overall HTTP timeout for a single request.
    pub request_timeout: Duration,
}

impl LlmConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        // LLM_API_KEY wins; OPENAI_API_KEY is accepted for drop-in use.
        let api_key = optional_env("LLM_API_KEY")?
            .or(optional_env("OPENAI_API_KEY")?)
            .map(SecretString::from);

        let model = optional_env("LLM_MODEL")?.unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let extraction_model = optional_env("EXTRACTION_MODEL")?.unwrap_or_else(|| model.clone());

        Ok(Self {
            base_url: optional_env("LLM_BASE_URL")?
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key,
            model,
            extraction_model,
            request_timeout: Duration::from_secs(parse_optional_env(
                "LLM_REQUEST_TIMEOUT_SECS",
                120,
            )?),
        })
    }

    /// Same settings pointed at the extraction model.
    pub fn for_extraction(&self) -> Self {
        Self {
            model: self.extraction_model.clone(),
            ..self.clone()
        }
    }
}
