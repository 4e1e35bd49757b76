//! Streaming relay.
//!
//! One user turn is driven through an explicit state machine:
//!
//! ```text
//! Idle ──append──▶ Streaming ──function call──▶ Extracting
//!                   │   ▲                          │
//!                   │   └──────function result─────┘
//!                   ├──end of turn──▶ Done
//!                   └──any failure──▶ Error
//! ```
//!
//! Text fragments are forwarded to the client in arrival order, one event
//! per fragment. Every turn ends with exactly one terminal event: `done` or
//! `error`. The assistant reply is only appended to the transcript on Done,
//! so a failed turn leaves history as it was (plus the user message).

mod prompt;

pub use prompt::interview_system_prompt;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::{ExtractionFailurePolicy, RelayConfig};
use crate::error::{LlmError, RelayError};
use crate::extraction::ExtractionEngine;
use crate::llm::{
    ChatMessage, LlmProvider, StreamEvent, ToolCall, ToolChoice, ToolCompletionRequest,
    ToolDefinition,
};
use crate::store::{MessageRole, Store};

/// Function the assistant calls mid-turn to trigger extraction.
pub const PROFILE_UPDATE_FUNCTION: &str = "update_interview_profile";

/// How the client presents fragments. Does not affect extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresentationMode {
    Text,
    Voice,
}

impl PresentationMode {
    pub fn from_voice_flag(is_voice: bool) -> Self {
        if is_voice { Self::Voice } else { Self::Text }
    }
}

/// One server-pushed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<PresentationMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done: Option<bool>,
}

impl RelayEvent {
    pub fn chunk(text: impl Into<String>, mode: PresentationMode) -> Self {
        Self {
            chunk: Some(text.into()),
            mode: Some(mode),
            error: None,
            done: Some(false),
        }
    }

    pub fn done(mode: PresentationMode) -> Self {
        Self {
            chunk: None,
            mode: Some(mode),
            error: None,
            done: Some(true),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            chunk: None,
            mode: None,
            error: Some(message.into()),
            done: None,
        }
    }

    /// Whether this event ends the turn.
    pub fn is_terminal(&self) -> bool {
        self.done == Some(true) || self.error.is_some()
    }
}

/// Inbound turn request.
#[derive(Debug, Clone, Deserialize)]
pub struct TurnRequest {
    pub session_id: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub is_voice: bool,
}

/// States of a single turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Streaming,
    Extracting,
    Done,
    Error,
}

impl TurnState {
    pub fn can_transition_to(self, next: TurnState) -> bool {
        use TurnState::*;
        matches!(
            (self, next),
            (Idle, Streaming)
                | (Idle, Error)
                | (Streaming, Extracting)
                | (Streaming, Done)
                | (Streaming, Error)
                | (Extracting, Streaming)
                | (Extracting, Error)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TurnState::Done | TurnState::Error)
    }
}

/// Summary of a finished turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnReport {
    pub state: TurnState,
    pub chunks: usize,
    pub extraction_rounds: u32,
}

struct Turn<'a> {
    session_id: &'a str,
    state: TurnState,
    chunks: usize,
    rounds: u32,
}

impl<'a> Turn<'a> {
    fn new(session_id: &'a str) -> Self {
        Self {
            session_id,
            state: TurnState::Idle,
            chunks: 0,
            rounds: 0,
        }
    }

    fn advance(&mut self, next: TurnState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid turn transition {:?} -> {:?}",
            self.state,
            next
        );
        tracing::debug!(session_id = self.session_id, from = ?self.state, to = ?next, "Turn transition");
        self.state = next;
    }

    fn report(&self) -> TurnReport {
        TurnReport {
            state: self.state,
            chunks: self.chunks,
            extraction_rounds: self.rounds,
        }
    }
}

/// Marks a session busy until dropped.
pub struct SessionGuard {
    session_id: String,
    active: Arc<Mutex<HashSet<String>>>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.remove(&self.session_id);
    }
}

/// Output of one streamed completion.
#[derive(Default)]
struct Round {
    text: String,
    calls: Vec<ToolCall>,
}

fn profile_update_tool() -> ToolDefinition {
    ToolDefinition {
        name: PROFILE_UPDATE_FUNCTION.to_string(),
        description: "Update the interviewee's profile from the conversation so far. \
                      Returns the fields that are still missing and suggested follow-up questions."
            .to_string(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "reason": {
                    "type": "string",
                    "description": "What the person just revealed"
                }
            }
        }),
    }
}

/// Drives user turns between a client and the hosted assistant.
pub struct Relay {
    llm: Arc<dyn LlmProvider>,
    store: Arc<dyn Store>,
    engine: Arc<ExtractionEngine>,
    config: RelayConfig,
    active: Arc<Mutex<HashSet<String>>>,
}

impl Relay {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        store: Arc<dyn Store>,
        engine: Arc<ExtractionEngine>,
        config: RelayConfig,
    ) -> Self {
        Self {
            llm,
            store,
            engine,
            config,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Run one turn, pushing events into `events` until a terminal event.
    ///
    /// A closed `events` channel is treated as client disconnect: the turn
    /// stops and nothing else is sent.
    pub async fn run_turn(
        &self,
        request: TurnRequest,
        events: mpsc::Sender<RelayEvent>,
    ) -> TurnReport {
        let mode = PresentationMode::from_voice_flag(request.is_voice);
        let mut turn = Turn::new(&request.session_id);

        match self.drive(&request, mode, &events, &mut turn).await {
            Ok(()) => {
                turn.advance(TurnState::Done);
                if events.send(RelayEvent::done(mode)).await.is_err() {
                    tracing::debug!(session_id = %request.session_id, "Client left before done");
                }
                tracing::info!(
                    session_id = %request.session_id,
                    chunks = turn.chunks,
                    extraction_rounds = turn.rounds,
                    "Turn complete"
                );
            }
            Err(err) => {
                turn.advance(TurnState::Error);
                if let RelayError::Transport { reason } = &err {
                    tracing::info!(session_id = %request.session_id, %reason, "Turn ended by client");
                } else {
                    tracing::warn!(session_id = %request.session_id, error = %err, "Turn failed");
                    let _ = events.send(RelayEvent::error(err.to_string())).await;
                }
            }
        }
        turn.report()
    }

    /// Claim a session for exclusive work. Fails while a turn or another
    /// claim holds it.
    pub fn reserve_session(&self, session_id: &str) -> Result<SessionGuard, RelayError> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if !active.insert(session_id.to_string()) {
            return Err(RelayError::TurnInProgress {
                session_id: session_id.to_string(),
            });
        }
        Ok(SessionGuard {
            session_id: session_id.to_string(),
            active: Arc::clone(&self.active),
        })
    }

    async fn drive(
        &self,
        request: &TurnRequest,
        mode: PresentationMode,
        events: &mpsc::Sender<RelayEvent>,
        turn: &mut Turn<'_>,
    ) -> Result<(), RelayError> {
        let session_id = request.session_id.as_str();
        let message = request.message.trim();
        if message.is_empty() {
            return Err(RelayError::EmptyMessage);
        }
        let _guard = self.reserve_session(session_id)?;

        self.store
            .append(session_id, MessageRole::User, message)
            .await?;
        let thread = self.store.get_thread_ref(session_id).await?;
        tracing::debug!(session_id, thread_id = %thread.thread_id, "Turn started");

        let mut messages = self.conversation(session_id).await?;
        turn.advance(TurnState::Streaming);

        let mut reply = String::new();
        loop {
            let round = self
                .stream_round(messages.clone(), mode, events, turn, &mut reply)
                .await?;
            if round.calls.is_empty() {
                break;
            }

            turn.rounds += 1;
            if turn.rounds > self.config.max_extraction_rounds {
                return Err(RelayError::TooManyExtractionRounds {
                    max: self.config.max_extraction_rounds,
                });
            }
            turn.advance(TurnState::Extracting);
            let results = self.handle_calls(session_id, &round.calls).await?;

            messages.push(ChatMessage::assistant_with_tool_calls(
                Some(round.text),
                round.calls,
            ));
            messages.extend(results);
            turn.advance(TurnState::Streaming);
        }

        if !reply.is_empty() {
            self.store
                .append(session_id, MessageRole::Assistant, &reply)
                .await?;
        }
        Ok(())
    }

    /// System prompt plus the stored transcript.
    async fn conversation(&self, session_id: &str) -> Result<Vec<ChatMessage>, RelayError> {
        let pass_complete = self.store.is_pass_complete(session_id).await?;
        let follow_ups = if pass_complete {
            self.store
                .get_result(session_id)
                .await?
                .map(|r| r.follow_up_questions)
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        let transcript = self.store.get_transcript(session_id).await?;
        let mut messages = Vec::with_capacity(transcript.len() + 1);
        messages.push(ChatMessage::system(interview_system_prompt(
            pass_complete,
            &follow_ups,
        )));
        messages.extend(transcript.into_iter().map(|m| match m.role {
            MessageRole::User => ChatMessage::user(m.content),
            MessageRole::Assistant => ChatMessage::assistant(m.content),
        }));
        Ok(messages)
    }

    /// Stream one completion, forwarding text and collecting function calls.
    async fn stream_round(
        &self,
        messages: Vec<ChatMessage>,
        mode: PresentationMode,
        events: &mpsc::Sender<RelayEvent>,
        turn: &mut Turn<'_>,
        reply: &mut String,
    ) -> Result<Round, RelayError> {
        let timeout = self.config.chunk_timeout;
        let request = ToolCompletionRequest::new(messages, vec![profile_update_tool()])
            .with_tool_choice(ToolChoice::Auto);

        let mut stream = tokio::time::timeout(timeout, self.llm.stream_with_tools(request))
            .await
            .map_err(|_| RelayError::StreamTimeout { after: timeout })??;

        let mut round = Round::default();
        loop {
            let next = tokio::select! {
                _ = events.closed() => {
                    return Err(RelayError::Transport {
                        reason: "event stream closed".to_string(),
                    });
                }
                next = tokio::time::timeout(timeout, stream.next()) => {
                    next.map_err(|_| RelayError::StreamTimeout { after: timeout })?
                }
            };

            match next {
                Some(Ok(StreamEvent::TextDelta(text))) => {
                    reply.push_str(&text);
                    round.text.push_str(&text);
                    turn.chunks += 1;
                    events
                        .send(RelayEvent::chunk(text, mode))
                        .await
                        .map_err(|_| RelayError::Transport {
                            reason: "event stream closed".to_string(),
                        })?;
                }
                Some(Ok(StreamEvent::ToolCall(call))) => round.calls.push(call),
                Some(Ok(StreamEvent::Done { .. })) => return Ok(round),
                Some(Err(e)) => return Err(e.into()),
                None => {
                    return Err(LlmError::InvalidResponse {
                        provider: self.llm.model_name().to_string(),
                        reason: "stream closed before the turn finished".to_string(),
                    }
                    .into());
                }
            }
        }
    }

    /// Run extraction for the profile-update calls and build function results.
    async fn handle_calls(
        &self,
        session_id: &str,
        calls: &[ToolCall],
    ) -> Result<Vec<ChatMessage>, RelayError> {
        let mut update_result = None;
        if calls.iter().any(|c| c.name == PROFILE_UPDATE_FUNCTION) {
            let transcript = self.store.get_transcript(session_id).await?;
            let mut outcome = self.engine.extract(session_id, &transcript).await?;
            let result = outcome.function_result();
            if let Some(err) = outcome.degraded.take()
                && self.config.extraction_failure_policy == ExtractionFailurePolicy::Abort
            {
                return Err(RelayError::Extraction(err));
            }
            update_result = Some(result.to_string());
        }

        Ok(calls
            .iter()
            .map(|call| {
                let content = match &update_result {
                    Some(result) if call.name == PROFILE_UPDATE_FUNCTION => result.clone(),
                    _ => {
                        tracing::warn!(session_id, function = %call.name, "Assistant called an unknown function");
                        serde_json::json!({ "error": format!("unknown function '{}'", call.name) })
                            .to_string()
                    }
                };
                ChatMessage::tool_result(&call.id, &call.name, content)
            })
            .collect())
    }
}
