//! OpenAI-compatible hosted assistant provider.
//!
//! Connects to any endpoint that implements the OpenAI Chat Completions API,
//! including its server-sent-event streaming mode with function calling.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::LlmConfig;
use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, CompletionStream, FinishReason,
    LlmProvider, Role, StreamEvent, ToolCall, ToolChoice, ToolCompletionRequest,
    ToolCompletionResponse, ToolDefinition,
};

/// Provider name constant to avoid magic strings.
const PROVIDER_NAME: &str = "openai_compatible";

/// Buffered stream events between the HTTP reader task and the consumer.
const STREAM_BUFFER: usize = 64;

/// OpenAI-compatible Chat Completions API provider.
pub struct OpenAiCompatibleProvider {
    client: Client,
    config: LlmConfig,
}

impl OpenAiCompatibleProvider {
    pub fn new(config: LlmConfig) -> Result<Self, LlmError> {
        // No client-wide timeout: it would cap the whole body of a streamed
        // turn. Non-streaming requests set their own.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER_NAME.to_string(),
                reason: format!("Failed to build reqwest client: {}", e),
            })?;

        Ok(Self { client, config })
    }

    /// Construct API URL for a given path.
    /// Strips trailing `/v1` from base_url to avoid double `/v1` issues.
    fn api_url(&self, path: &str) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        let base = base.strip_suffix("/v1").unwrap_or(base);
        format!("{}/v1/{}", base, path.trim_start_matches('/'))
    }

    fn add_auth_header(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.config.api_key.as_ref().map(|k| k.expose_secret()) {
            Some(key) => request.header("Authorization", format!("Bearer {}", key)),
            None => request,
        }
    }

    fn build_request(&self, body: &ChatCompletionRequest) -> reqwest::RequestBuilder {
        let request = self
            .client
            .post(self.api_url("chat/completions"))
            .header("Content-Type", "application/json")
            .json(body);
        self.add_auth_header(request)
    }

    /// Send the request and map transport failures and HTTP error statuses.
    async fn dispatch(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, LlmError> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                return LlmError::Timeout {
                    provider: PROVIDER_NAME.to_string(),
                    after: self.config.request_timeout,
                };
            }
            tracing::error!("OpenAI-compatible request failed: {}", e);
            LlmError::RequestFailed {
                provider: PROVIDER_NAME.to_string(),
                reason: e.to_string(),
            }
        })?;

        let status = response.status();
        tracing::debug!("OpenAI-compatible response status: {}", status);
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await.unwrap_or_default();

        Err(match status.as_u16() {
            401 => LlmError::AuthFailed {
                provider: PROVIDER_NAME.to_string(),
            },
            429 => LlmError::RateLimited {
                provider: PROVIDER_NAME.to_string(),
                retry_after,
            },
            _ => LlmError::RequestFailed {
                provider: PROVIDER_NAME.to_string(),
                reason: format!("HTTP {}: {}", status, truncate(&body, 200)),
            },
        })
    }

    async fn send_request(
        &self,
        body: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, LlmError> {
        tracing::debug!(model = %body.model, "Sending chat completion request");

        let request = self.build_request(body).timeout(self.config.request_timeout);
        let response = self.dispatch(request).await?;

        let response_text = response.text().await.map_err(|e| LlmError::RequestFailed {
            provider: PROVIDER_NAME.to_string(),
            reason: format!("Response too large or failed to read: {}", e),
        })?;

        serde_json::from_str(&response_text).map_err(|e| LlmError::InvalidResponse {
            provider: PROVIDER_NAME.to_string(),
            reason: format!(
                "JSON parse error: {}. Raw: {}",
                e,
                truncate(&response_text, 200)
            ),
        })
    }

    fn chat_request(
        &self,
        messages: Vec<ChatMessage>,
        tools: Vec<ToolDefinition>,
        tool_choice: Option<ToolChoice>,
        temperature: Option<f32>,
        max_tokens: Option<u32>,
        stream: bool,
    ) -> ChatCompletionRequest {
        let tools: Vec<ChatCompletionTool> = tools
            .into_iter()
            .map(|t| ChatCompletionTool {
                tool_type: "function".to_string(),
                function: ChatCompletionFunction {
                    name: t.name,
                    description: Some(t.description),
                    parameters: Some(t.parameters),
                },
            })
            .collect();

        ChatCompletionRequest {
            model: self.config.model.clone(),
            messages: messages.into_iter().map(Into::into).collect(),
            temperature,
            max_tokens,
            tool_choice: if tools.is_empty() {
                None
            } else {
                tool_choice.map(tool_choice_json)
            },
            tools: if tools.is_empty() { None } else { Some(tools) },
            stream: stream.then_some(true),
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn tool_choice_json(choice: ToolChoice) -> serde_json::Value {
    match choice {
        ToolChoice::Auto => serde_json::json!("auto"),
        ToolChoice::Required => serde_json::json!("required"),
        ToolChoice::None => serde_json::json!("none"),
        ToolChoice::Function(name) => serde_json::json!({
            "type": "function",
            "function": { "name": name },
        }),
    }
}

/// Parse function arguments. An empty string means a call without arguments.
fn parse_arguments(function: &str, raw: &str) -> Result<serde_json::Value, LlmError> {
    if raw.trim().is_empty() {
        return Ok(serde_json::Value::Object(Default::default()));
    }
    serde_json::from_str(raw).map_err(|e| {
        tracing::warn!(
            function,
            error = %e,
            raw = %truncate(raw, 200),
            "Malformed function arguments"
        );
        LlmError::MalformedArguments {
            provider: PROVIDER_NAME.to_string(),
            function: function.to_string(),
            reason: e.to_string(),
            raw: raw.to_string(),
        }
    })
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    fn model_name(&self) -> &str {
        &self.config.model
    }

    async fn complete(&self, req: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let request = self.chat_request(
            req.messages,
            Vec::new(),
            None,
            req.temperature,
            req.max_tokens,
            false,
        );
        let response = self.send_request(&request).await?;

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse {
                provider: PROVIDER_NAME.to_string(),
                reason: "No choices in response".to_string(),
            })?;

        let usage = response.usage.unwrap_or_default();
        Ok(CompletionResponse {
            content: choice.message.content.unwrap_or_default(),
            finish_reason: FinishReason::from_wire(choice.finish_reason.as_deref()),
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        })
    }

    async fn complete_with_tools(
        &self,
        req: ToolCompletionRequest,
    ) -> Result<ToolCompletionResponse, LlmError> {
        let request = self.chat_request(
            req.messages,
            req.tools,
            req.tool_choice,
            req.temperature,
            req.max_tokens,
            false,
        );
        let response = self.send_request(&request).await?;

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse {
                provider: PROVIDER_NAME.to_string(),
                reason: "No choices in response".to_string(),
            })?;

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| -> Result<ToolCall, LlmError> {
                Ok(ToolCall {
                    arguments: parse_arguments(&tc.function.name, &tc.function.arguments)?,
                    id: tc.id,
                    name: tc.function.name,
                })
            })
            .collect::<Result<Vec<_>, LlmError>>()?;

        let finish_reason = match FinishReason::from_wire(choice.finish_reason.as_deref()) {
            FinishReason::Unknown if !tool_calls.is_empty() => FinishReason::ToolUse,
            other => other,
        };

        let usage = response.usage.unwrap_or_default();
        Ok(ToolCompletionResponse {
            content: choice.message.content,
            tool_calls,
            finish_reason,
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        })
    }

    async fn stream_with_tools(
        &self,
        req: ToolCompletionRequest,
    ) -> Result<CompletionStream, LlmError> {
        let request = self.chat_request(
            req.messages,
            req.tools,
            req.tool_choice,
            req.temperature,
            req.max_tokens,
            true,
        );
        tracing::debug!(model = %request.model, "Opening chat completion stream");

        let response = self
            .dispatch(self.build_request(&request).header("Accept", "text/event-stream"))
            .await?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            let mut events = std::pin::pin!(response.bytes_stream().eventsource());
            let mut decoder = SseDecoder::default();

            while let Some(event) = events.next().await {
                let decoded = match event {
                    Ok(event) => decoder.feed(&event.data),
                    Err(e) => Err(LlmError::RequestFailed {
                        provider: PROVIDER_NAME.to_string(),
                        reason: format!("Stream read failed: {}", e),
                    }),
                };
                let failed = decoded.is_err();
                for item in split_results(decoded) {
                    if tx.send(item).await.is_err() {
                        // Consumer went away; dropping the body closes the connection.
                        return;
                    }
                }
                if failed || decoder.is_finished() {
                    return;
                }
            }

            let _ = tx
                .send(Err(LlmError::InvalidResponse {
                    provider: PROVIDER_NAME.to_string(),
                    reason: "Stream ended before a finish reason was sent".to_string(),
                }))
                .await;
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

fn split_results(
    decoded: Result<Vec<StreamEvent>, LlmError>,
) -> Vec<Result<StreamEvent, LlmError>> {
    match decoded {
        Ok(events) => events.into_iter().map(Ok).collect(),
        Err(e) => vec![Err(e)],
    }
}

// ---------------------------------------------------------------------------
// SSE decoding
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct PartialToolCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Turns `data:` payloads of a chat completion stream into [`StreamEvent`]s.
///
/// Function-call fragments are accumulated by their `index` and only
/// emitted, fully assembled, once the choice reports a finish reason.
#[derive(Debug, Default)]
struct SseDecoder {
    pending: BTreeMap<usize, PartialToolCall>,
    finished: bool,
}

impl SseDecoder {
    fn is_finished(&self) -> bool {
        self.finished
    }

    fn feed(&mut self, data: &str) -> Result<Vec<StreamEvent>, LlmError> {
        let data = data.trim();
        if self.finished || data.is_empty() {
            return Ok(Vec::new());
        }
        if data == "[DONE]" {
            let reason = if self.pending.is_empty() {
                FinishReason::Stop
            } else {
                FinishReason::ToolUse
            };
            return self.finish(reason);
        }

        let chunk: ChatCompletionChunk =
            serde_json::from_str(data).map_err(|e| LlmError::InvalidResponse {
                provider: PROVIDER_NAME.to_string(),
                reason: format!("Bad stream chunk: {}. Raw: {}", e, truncate(data, 200)),
            })?;

        let mut events = Vec::new();
        for choice in chunk.choices.into_iter().filter(|c| c.index == 0) {
            if let Some(delta) = choice.delta {
                if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
                    events.push(StreamEvent::TextDelta(content));
                }
                for tc in delta.tool_calls.unwrap_or_default() {
                    let partial = self.pending.entry(tc.index).or_default();
                    if let Some(id) = tc.id {
                        partial.id = Some(id);
                    }
                    if let Some(function) = tc.function {
                        if let Some(name) = function.name {
                            partial.name = Some(name);
                        }
                        if let Some(args) = function.arguments {
                            partial.arguments.push_str(&args);
                        }
                    }
                }
            }

            if let Some(reason) = choice.finish_reason {
                let mut finish_reason = FinishReason::from_wire(Some(&reason));
                if finish_reason == FinishReason::Unknown && !self.pending.is_empty() {
                    finish_reason = FinishReason::ToolUse;
                }
                events.extend(self.finish(finish_reason)?);
                break;
            }
        }
        Ok(events)
    }

    fn finish(&mut self, finish_reason: FinishReason) -> Result<Vec<StreamEvent>, LlmError> {
        self.finished = true;
        let mut events = Vec::with_capacity(self.pending.len() + 1);
        for (index, partial) in std::mem::take(&mut self.pending) {
            let name = partial.name.ok_or_else(|| LlmError::InvalidResponse {
                provider: PROVIDER_NAME.to_string(),
                reason: format!("Function call at index {} has no name", index),
            })?;
            let arguments = parse_arguments(&name, &partial.arguments)?;
            events.push(StreamEvent::ToolCall(ToolCall {
                id: partial.id.unwrap_or_else(|| format!("call_{}", index)),
                name,
                arguments,
            }));
        }
        events.push(StreamEvent::Done { finish_reason });
        Ok(events)
    }
}

// OpenAI-compatible Chat Completions API types

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatCompletionMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ChatCompletionTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatCompletionMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ChatCompletionToolCall>>,
}

impl From<ChatMessage> for ChatCompletionMessage {
    fn from(msg: ChatMessage) -> Self {
        let role = match msg.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };

        let tool_calls = msg.tool_calls.map(|calls| {
            calls
                .into_iter()
                .map(|tc| ChatCompletionToolCall {
                    id: tc.id,
                    call_type: "function".to_string(),
                    function: ChatCompletionToolCallFunction {
                        name: tc.name,
                        arguments: tc.arguments.to_string(),
                    },
                })
                .collect()
        });

        let content = if msg.role == Role::Assistant && tool_calls.is_some() && msg.content.is_empty()
        {
            None
        } else {
            Some(msg.content)
        };

        Self {
            role: role.to_string(),
            content,
            tool_call_id: msg.tool_call_id,
            name: msg.name,
            tool_calls,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionTool {
    #[serde(rename = "type")]
    tool_type: String,
    function: ChatCompletionFunction,
}

#[derive(Debug, Serialize)]
struct ChatCompletionFunction {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatCompletionChoice>,
    #[serde(default)]
    usage: Option<ChatCompletionUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChoice {
    message: ChatCompletionResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ChatCompletionToolCall>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatCompletionToolCall {
    id: String,
    #[serde(rename = "type", default = "function_type")]
    call_type: String,
    function: ChatCompletionToolCallFunction,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatCompletionToolCallFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Default, Deserialize)]
struct ChatCompletionUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    delta: Option<ChunkDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ChunkToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ChunkToolCall {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<ChunkFunction>,
}

#[derive(Debug, Deserialize)]
struct ChunkFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}
