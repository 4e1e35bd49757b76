//! Hosted assistant integration.
//!
//! The relay and the extraction engine only see [`LlmProvider`]; the one
//! shipped backend talks to any OpenAI-compatible Chat Completions endpoint.

mod openai_compatible;
mod provider;

pub use openai_compatible::OpenAiCompatibleProvider;
pub use provider::{
    ChatMessage, CompletionRequest, CompletionResponse, CompletionStream, FinishReason,
    LlmProvider, Role, StreamEvent, ToolCall, ToolChoice, ToolCompletionRequest,
    ToolCompletionResponse, ToolDefinition,
};

use std::sync::Arc;

use crate::config::LlmConfig;
use crate::error::LlmError;

/// Create the provider used for the interview conversation.
pub fn create_llm_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    if config.api_key.is_none() {
        tracing::warn!(
            base_url = %config.base_url,
            "No LLM_API_KEY set; requests will be sent unauthenticated"
        );
    }
    tracing::info!("Using OpenAI-compatible endpoint (model: {})", config.model);
    Ok(Arc::new(OpenAiCompatibleProvider::new(config.clone())?))
}

/// Create the provider used for extraction and follow-up questions.
///
/// Shares the conversation provider when both use the same model.
pub fn create_extraction_provider(
    config: &LlmConfig,
    conversation: &Arc<dyn LlmProvider>,
) -> Result<Arc<dyn LlmProvider>, LlmError> {
    if config.extraction_model == config.model {
        return Ok(Arc::clone(conversation));
    }
    tracing::info!(
        "Using separate extraction model: {}",
        config.extraction_model
    );
    Ok(Arc::new(OpenAiCompatibleProvider::new(
        config.for_extraction(),
    )?))
}
