//! Shared fixtures for integration tests: a scripted hosted assistant and
//! helpers for wiring a relay against the in-memory store.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use serde_json::Value;
use tokio::sync::mpsc;

use interview_relay::config::{
    ExtractionConfig, ExtractionFailurePolicy, FollowUpMode, RelayConfig,
};
use interview_relay::error::LlmError;
use interview_relay::extraction::{EXTRACTION_FUNCTION, ExtractionEngine};
use interview_relay::llm::{
    CompletionRequest, CompletionResponse, CompletionStream, FinishReason, LlmProvider,
    StreamEvent, ToolCall, ToolCompletionRequest, ToolCompletionResponse,
};
use interview_relay::relay::{PROFILE_UPDATE_FUNCTION, Relay, RelayEvent, TurnReport, TurnRequest};
use interview_relay::store::{MemoryStore, Store};

/// One step of a scripted assistant stream.
pub enum Step {
    Text(&'static str),
    /// Function call to the profile-update function.
    UpdateProfile,
    /// Function call to a function the relay does not offer.
    Call(&'static str),
    Done,
    Fail(LlmError),
    /// Never yield another event.
    Stall,
}

/// Scripted extraction response.
pub enum Extraction {
    Payload(Value),
    Fail(LlmError),
    Delayed(Duration, Value),
}

#[derive(Default)]
struct Script {
    streams: VecDeque<Vec<Step>>,
    extractions: VecDeque<Extraction>,
    stream_requests: Vec<ToolCompletionRequest>,
}

/// Hosted assistant that replays scripted streams and extraction payloads.
#[derive(Clone, Default)]
pub struct ScriptedProvider {
    script: Arc<Mutex<Script>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_stream(&self, steps: Vec<Step>) -> &Self {
        self.script.lock().unwrap().streams.push_back(steps);
        self
    }

    pub fn push_extraction(&self, extraction: Extraction) -> &Self {
        self.script.lock().unwrap().extractions.push_back(extraction);
        self
    }

    /// Requests received by `stream_with_tools`, in order.
    pub fn stream_requests(&self) -> Vec<ToolCompletionRequest> {
        self.script.lock().unwrap().stream_requests.clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, _req: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        Err(LlmError::RequestFailed {
            provider: "scripted".to_string(),
            reason: "plain completions are not scripted".to_string(),
        })
    }

    async fn complete_with_tools(
        &self,
        _req: ToolCompletionRequest,
    ) -> Result<ToolCompletionResponse, LlmError> {
        let next = self.script.lock().unwrap().extractions.pop_front();
        let arguments = match next {
            Some(Extraction::Payload(v)) => v,
            Some(Extraction::Fail(e)) => return Err(e),
            Some(Extraction::Delayed(delay, v)) => {
                tokio::time::sleep(delay).await;
                v
            }
            None => {
                return Err(LlmError::InvalidResponse {
                    provider: "scripted".to_string(),
                    reason: "no extraction scripted".to_string(),
                });
            }
        };
        Ok(ToolCompletionResponse {
            content: None,
            tool_calls: vec![ToolCall {
                id: "call_extract".to_string(),
                name: EXTRACTION_FUNCTION.to_string(),
                arguments,
            }],
            input_tokens: 1,
            output_tokens: 1,
            finish_reason: FinishReason::ToolUse,
        })
    }

    async fn stream_with_tools(&self, req: ToolCompletionRequest) -> Result<CompletionStream, LlmError> {
        let steps = {
            let mut script = self.script.lock().unwrap();
            script.stream_requests.push(req);
            script.streams.pop_front()
        };
        let Some(steps) = steps else {
            return Err(LlmError::InvalidResponse {
                provider: "scripted".to_string(),
                reason: "no stream scripted".to_string(),
            });
        };

        let mut events = Vec::new();
        let mut stall = false;
        for (i, step) in steps.into_iter().enumerate() {
            match step {
                Step::Text(t) => events.push(Ok(StreamEvent::TextDelta(t.to_string()))),
                Step::UpdateProfile => events.push(Ok(StreamEvent::ToolCall(ToolCall {
                    id: format!("call_{i}"),
                    name: PROFILE_UPDATE_FUNCTION.to_string(),
                    arguments: serde_json::json!({"reason": "new detail"}),
                }))),
                Step::Call(name) => events.push(Ok(StreamEvent::ToolCall(ToolCall {
                    id: format!("call_{i}"),
                    name: name.to_string(),
                    arguments: serde_json::json!({}),
                }))),
                Step::Done => events.push(Ok(StreamEvent::Done {
                    finish_reason: FinishReason::Stop,
                })),
                Step::Fail(e) => events.push(Err(e)),
                Step::Stall => {
                    stall = true;
                    break;
                }
            }
        }

        let scripted = stream::iter(events);
        if stall {
            Ok(Box::pin(futures::StreamExt::chain(scripted, stream::pending())))
        } else {
            Ok(Box::pin(scripted))
        }
    }
}

/// A relay, its engine and store, all sharing one scripted provider.
pub struct Harness {
    pub provider: ScriptedProvider,
    pub store: Arc<MemoryStore>,
    pub engine: Arc<ExtractionEngine>,
    pub relay: Arc<Relay>,
}

pub fn relay_config(policy: ExtractionFailurePolicy) -> RelayConfig {
    RelayConfig {
        chunk_timeout: Duration::from_secs(5),
        max_extraction_rounds: 3,
        extraction_failure_policy: policy,
    }
}

pub fn harness(relay_config: RelayConfig, extraction_timeout: Duration) -> Harness {
    let provider = ScriptedProvider::new();
    let store = Arc::new(MemoryStore::new());
    let llm: Arc<dyn LlmProvider> = Arc::new(provider.clone());
    let dyn_store: Arc<dyn Store> = store.clone();
    let engine = Arc::new(ExtractionEngine::new(
        Arc::clone(&llm),
        Arc::clone(&dyn_store),
        ExtractionConfig {
            timeout: extraction_timeout,
            follow_up_mode: FollowUpMode::Template,
        },
    ));
    let relay = Arc::new(Relay::new(llm, dyn_store, Arc::clone(&engine), relay_config));
    Harness {
        provider,
        store,
        engine,
        relay,
    }
}

pub fn turn(session_id: &str, message: &str) -> TurnRequest {
    TurnRequest {
        session_id: session_id.to_string(),
        message: message.to_string(),
        is_voice: false,
    }
}

/// Run a turn to completion and collect every event it emitted.
pub async fn run_collect(relay: &Relay, request: TurnRequest) -> (TurnReport, Vec<RelayEvent>) {
    let (tx, mut rx) = mpsc::channel(64);
    let report = relay.run_turn(request, tx).await;
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    (report, events)
}

/// Extraction payload recording personal values.
pub fn values_payload() -> Value {
    serde_json::json!({
        "core_values_and_priorities": {
            "personal_values": ["honesty", "curiosity"]
        }
    })
}
