//! Extraction engine.
//!
//! Turns a transcript into profile updates with one forced function call,
//! merges them into the session's stored profile, recomputes the missing
//! fields and plans follow-up questions for them. Hosted-call failures never
//! discard the stored profile: the engine records the failure, falls back to
//! template questions and still persists a result.

mod follow_ups;
pub mod prompts;

pub use follow_ups::{
    ClusterGap, FollowUpQuestion, ProposedQuestion, assemble, cluster_gaps,
    parse_proposed_questions, template_question,
};

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{ExtractionConfig, FollowUpMode};
use crate::error::{DatabaseError, ExtractionError, LlmError};
use crate::llm::{
    ChatMessage, CompletionRequest, LlmProvider, ToolChoice, ToolCompletionRequest,
    ToolDefinition,
};
use crate::profile::{FieldPath, Profile, SchemaIssue, function_parameters};
use crate::store::{ExtractionResult, Store, StoredMessage};

/// Function the extraction call is forced to use.
pub const EXTRACTION_FUNCTION: &str = "record_interview_responses";

const EXTRACTION_MAX_TOKENS: u32 = 4096;
const FOLLOW_UP_MAX_TOKENS: u32 = 1024;

/// Diagnostics recorded with every extraction result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DebugInfo {
    pub system_prompt: String,
    pub conversation_history: String,
    pub raw_response: Option<String>,
    pub model_used: String,
    pub conversation_length: usize,
    pub missing_fields_count: usize,
    pub generated_questions_count: usize,
    #[serde(default)]
    pub schema_issues: Vec<SchemaIssue>,
    /// Why extraction degraded, if it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Why model-written follow-ups were replaced by templates, if they were.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follow_up_error: Option<String>,
}

/// What one extraction produced.
#[derive(Debug)]
pub struct ExtractionOutcome {
    /// The persisted result.
    pub result: ExtractionResult,
    /// Paths whose value changed in this pass.
    pub changed_fields: Vec<FieldPath>,
    /// Set when the hosted call failed; the profile is then unchanged.
    pub degraded: Option<ExtractionError>,
}

impl ExtractionOutcome {
    /// Compact JSON handed back to the conversation as the function result.
    pub fn function_result(&self) -> Value {
        serde_json::json!({
            "status": if self.degraded.is_some() { "degraded" } else { "ok" },
            "updated_fields": self.changed_fields,
            "missing_fields": self.result.missing_fields,
            "follow_up_questions": self
                .result
                .follow_up_questions
                .iter()
                .map(|q| q.question.as_str())
                .collect::<Vec<_>>(),
        })
    }
}

/// Extracts profile data from transcripts and keeps the results store current.
pub struct ExtractionEngine {
    llm: Arc<dyn LlmProvider>,
    store: Arc<dyn Store>,
    config: ExtractionConfig,
}

impl ExtractionEngine {
    pub fn new(llm: Arc<dyn LlmProvider>, store: Arc<dyn Store>, config: ExtractionConfig) -> Self {
        Self { llm, store, config }
    }

    fn extraction_tool() -> ToolDefinition {
        ToolDefinition {
            name: EXTRACTION_FUNCTION.to_string(),
            description: "Record what the interviewee has revealed, section by section. \
                          Leave fields null when nothing was said about them."
                .to_string(),
            parameters: function_parameters(),
        }
    }

    fn timeout_error(&self) -> LlmError {
        LlmError::Timeout {
            provider: self.llm.model_name().to_string(),
            after: self.config.timeout,
        }
    }

    /// Run extraction for a session outside a turn, using its stored transcript.
    pub async fn evaluate(&self, session_id: &str) -> Result<ExtractionOutcome, ExtractionError> {
        let transcript = self.store.get_transcript(session_id).await?;
        if transcript.is_empty() {
            return Err(ExtractionError::EmptyTranscript {
                session_id: session_id.to_string(),
            });
        }
        Ok(self.extract(session_id, &transcript).await?)
    }

    /// Extract from `transcript`, merge into the session's profile and persist.
    ///
    /// Only a store failure is returned as an error; hosted failures are
    /// reported through [`ExtractionOutcome::degraded`].
    pub async fn extract(
        &self,
        session_id: &str,
        transcript: &[StoredMessage],
    ) -> Result<ExtractionOutcome, DatabaseError> {
        let previous = self.store.get_result(session_id).await?;
        let (mut profile, mut attempts, previous_questions) = match previous {
            Some(r) => (r.profile, r.follow_up_attempts, r.follow_up_questions),
            None => (Profile::empty(), Default::default(), Vec::new()),
        };

        let history = prompts::format_transcript(transcript);
        let mut debug = DebugInfo {
            system_prompt: prompts::EXTRACTION_SYSTEM_PROMPT.to_string(),
            conversation_history: history.clone(),
            model_used: self.llm.model_name().to_string(),
            conversation_length: transcript.len(),
            ..DebugInfo::default()
        };

        let mut changed_fields = Vec::new();
        let degraded = match self.call_extraction(&history).await {
            Ok(payload) => {
                debug.raw_response = Some(payload.to_string());
                tracing::debug!(session_id, payload = %payload, "Extraction payload");
                let (incoming, issues) = Profile::from_json(&payload);
                if !issues.is_empty() {
                    tracing::debug!(session_id, count = issues.len(), "Coerced extraction payload");
                }
                debug.schema_issues = issues;
                if payload.is_object() {
                    changed_fields = profile.merge(&incoming);
                    None
                } else {
                    Some(ExtractionError::SchemaMismatch {
                        reason: "function arguments are not a JSON object".to_string(),
                    })
                }
            }
            Err(e) => Some(e),
        };

        if let Some(err) = &degraded {
            tracing::warn!(session_id, error = %err, "Extraction degraded; profile left unchanged");
            debug.error = Some(err.to_string());
            if let Some(raw) = err.raw_payload() {
                debug.raw_response = Some(raw.to_string());
            }
        }

        let missing_fields = profile.missing_fields();
        let gaps = cluster_gaps(&missing_fields);

        let proposed = if degraded.is_none()
            && !gaps.is_empty()
            && self.config.follow_up_mode == FollowUpMode::Model
        {
            match self.propose_questions(&gaps, &previous_questions).await {
                Ok(proposed) => Some(proposed),
                Err(reason) => {
                    tracing::warn!(session_id, %reason, "Falling back to template follow-ups");
                    debug.follow_up_error = Some(reason);
                    None
                }
            }
        } else {
            None
        };

        let follow_up_questions = assemble(&gaps, proposed, &previous_questions, &mut attempts);
        debug.missing_fields_count = missing_fields.len();
        debug.generated_questions_count = follow_up_questions.len();

        let result = ExtractionResult {
            profile,
            missing_fields,
            follow_up_questions,
            follow_up_attempts: attempts,
            debug_info: debug,
            updated_at: Utc::now(),
        };
        self.store.put_result(session_id, &result).await?;

        tracing::info!(
            session_id,
            changed = changed_fields.len(),
            missing = result.missing_fields.len(),
            questions = result.follow_up_questions.len(),
            degraded = degraded.is_some(),
            "Extraction complete"
        );

        Ok(ExtractionOutcome {
            result,
            changed_fields,
            degraded,
        })
    }

    /// Forced function call returning the raw arguments payload.
    async fn call_extraction(&self, history: &str) -> Result<Value, ExtractionError> {
        let request = ToolCompletionRequest::new(
            vec![
                ChatMessage::system(prompts::EXTRACTION_SYSTEM_PROMPT),
                ChatMessage::user(prompts::extraction_user_prompt(history)),
            ],
            vec![Self::extraction_tool()],
        )
        .with_tool_choice(ToolChoice::Function(EXTRACTION_FUNCTION.to_string()))
        .with_temperature(0.0)
        .with_max_tokens(EXTRACTION_MAX_TOKENS);

        let response = tokio::time::timeout(self.config.timeout, self.llm.complete_with_tools(request))
            .await
            .map_err(|_| self.timeout_error())??;

        if let Some(call) = response
            .tool_calls
            .iter()
            .find(|c| c.name == EXTRACTION_FUNCTION)
            .or_else(|| response.tool_calls.first())
        {
            return Ok(call.arguments.clone());
        }

        // Some endpoints ignore tool_choice and answer in text.
        let content = response.content.unwrap_or_default();
        serde_json::from_str::<Value>(content.trim())
            .ok()
            .filter(Value::is_object)
            .ok_or_else(|| ExtractionError::SchemaMismatch {
                reason: "response contained no function call".to_string(),
            })
    }

    async fn propose_questions(
        &self,
        gaps: &[ClusterGap],
        previous: &[FollowUpQuestion],
    ) -> Result<Vec<ProposedQuestion>, String> {
        let previous: Vec<String> = previous.iter().map(|q| q.question.clone()).collect();
        let request = CompletionRequest::new(vec![
            ChatMessage::system(prompts::FOLLOW_UP_SYSTEM_PROMPT),
            ChatMessage::user(prompts::follow_up_user_prompt(gaps, &previous)),
        ])
        .with_temperature(0.7)
        .with_max_tokens(FOLLOW_UP_MAX_TOKENS);

        let response = tokio::time::timeout(self.config.timeout, self.llm.complete(request))
            .await
            .map_err(|_| self.timeout_error().to_string())?
            .map_err(|e| e.to_string())?;

        parse_proposed_questions(&response.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::{
        CompletionResponse, CompletionStream, FinishReason, ToolCall, ToolCompletionResponse,
    };
    use crate::profile::FieldValue;
    use crate::store::{MemoryStore, MessageRole, ResultStore};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;
    use tracing_test::traced_test;

    /// Provider with one canned function-call payload and one canned text reply.
    struct CannedProvider {
        arguments: Mutex<Option<Result<Value, LlmError>>>,
        follow_ups: Option<String>,
        delay: Duration,
    }

    impl CannedProvider {
        fn new(arguments: Result<Value, LlmError>, follow_ups: Option<&str>) -> Self {
            Self {
                arguments: Mutex::new(Some(arguments)),
                follow_ups: follow_ups.map(str::to_string),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl LlmProvider for CannedProvider {
        fn model_name(&self) -> &str {
            "canned"
        }

        async fn complete(&self, _req: CompletionRequest) -> Result<crate::llm::CompletionResponse, LlmError> {
            match &self.follow_ups {
                Some(content) => Ok(CompletionResponse {
                    content: content.clone(),
                    input_tokens: 0,
                    output_tokens: 0,
                    finish_reason: FinishReason::Stop,
                }),
                None => Err(LlmError::RequestFailed {
                    provider: "canned".into(),
                    reason: "no follow-ups scripted".into(),
                }),
            }
        }

        async fn complete_with_tools(
            &self,
            _req: ToolCompletionRequest,
        ) -> Result<ToolCompletionResponse, LlmError> {
            tokio::time::sleep(self.delay).await;
            let arguments = self
                .arguments
                .lock()
                .unwrap()
                .take()
                .expect("extraction called more than once")?;
            Ok(ToolCompletionResponse {
                content: None,
                tool_calls: vec![ToolCall {
                    id: "call_1".into(),
                    name: EXTRACTION_FUNCTION.into(),
                    arguments,
                }],
                input_tokens: 0,
                output_tokens: 0,
                finish_reason: FinishReason::ToolUse,
            })
        }

        async fn stream_with_tools(
            &self,
            _req: ToolCompletionRequest,
        ) -> Result<CompletionStream, LlmError> {
            unimplemented!("not used by the engine")
        }
    }

    fn transcript(text: &str) -> Vec<StoredMessage> {
        vec![StoredMessage {
            role: MessageRole::User,
            content: text.to_string(),
            created_at: Utc::now(),
        }]
    }

    fn engine(provider: CannedProvider, mode: FollowUpMode) -> (ExtractionEngine, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let engine = ExtractionEngine::new(
            Arc::new(provider),
            store.clone(),
            ExtractionConfig {
                timeout: Duration::from_millis(200),
                follow_up_mode: mode,
            },
        );
        (engine, store)
    }

    #[tokio::test]
    async fn test_values_scenario_populates_and_plans_follow_ups() {
        let provider = CannedProvider::new(
            Ok(json!({
                "core_values_and_priorities": {"personal_values": ["honesty", "curiosity"]}
            })),
            None,
        );
        let (engine, store) = engine(provider, FollowUpMode::Template);

        let outcome = engine
            .extract(
                "s1",
                &transcript("My core personal values are honesty and curiosity"),
            )
            .await
            .unwrap();

        assert!(outcome.degraded.is_none());
        let values_path: FieldPath = "core_values_and_priorities.personal_values".parse().unwrap();
        assert_eq!(outcome.changed_fields, vec![values_path.clone()]);
        assert_eq!(
            outcome
                .result
                .profile
                .get("core_values_and_priorities", "personal_values"),
            Some(&FieldValue::List(vec!["honesty".into(), "curiosity".into()]))
        );
        assert!(!outcome.result.missing_fields.contains(&values_path));
        let emotions: FieldPath = "personality_and_emotional_profile.emotional_regulation"
            .parse()
            .unwrap();
        assert!(
            outcome
                .result
                .follow_up_questions
                .iter()
                .any(|q| q.fields.contains(&emotions))
        );

        let stored = store.get_result("s1").await.unwrap().unwrap();
        assert_eq!(stored, outcome.result);
        assert_eq!(stored.debug_info.conversation_length, 1);
        assert_eq!(stored.debug_info.model_used, "canned");
    }

    #[tokio::test]
    #[traced_test]
    async fn test_hosted_failure_keeps_profile_and_uses_templates() {
        let (engine, store) = engine(
            CannedProvider::new(
                Err(LlmError::RateLimited {
                    provider: "canned".into(),
                    retry_after: None,
                }),
                Some(r#"{"questions": []}"#),
            ),
            FollowUpMode::Model,
        );

        let outcome = engine.extract("s1", &transcript("hi")).await.unwrap();
        assert!(matches!(
            outcome.degraded,
            Some(ExtractionError::Hosted(LlmError::RateLimited { .. }))
        ));
        assert_eq!(outcome.result.profile, Profile::empty());
        assert_eq!(outcome.result.follow_up_questions.len(), 15);
        assert!(outcome.result.debug_info.error.is_some());
        assert!(store.get_result("s1").await.unwrap().is_some());
        assert!(logs_contain("Extraction degraded"));
    }

    #[tokio::test]
    async fn test_timeout_degrades_instead_of_hanging() {
        let mut provider = CannedProvider::new(Ok(json!({})), None);
        provider.delay = Duration::from_secs(5);
        let (engine, _store) = engine(provider, FollowUpMode::Template);

        let outcome = engine.extract("s1", &transcript("hi")).await.unwrap();
        assert!(matches!(
            outcome.degraded,
            Some(ExtractionError::Hosted(LlmError::Timeout { .. }))
        ));
    }

    #[tokio::test]
    async fn test_non_object_payload_is_schema_mismatch() {
        let (engine, _store) = engine(
            CannedProvider::new(Ok(json!("nonsense")), None),
            FollowUpMode::Template,
        );
        let outcome = engine.extract("s1", &transcript("hi")).await.unwrap();
        assert!(matches!(
            outcome.degraded,
            Some(ExtractionError::SchemaMismatch { .. })
        ));
        assert_eq!(outcome.result.debug_info.schema_issues.len(), 1);
    }

    #[tokio::test]
    async fn test_model_follow_ups_are_used() {
        let (engine, _store) = engine(
            CannedProvider::new(
                Ok(json!({})),
                Some(r#"{"questions": [{"cluster": "values", "question": "What do you stand for?"}]}"#),
            ),
            FollowUpMode::Model,
        );
        let outcome = engine.extract("s1", &transcript("hi")).await.unwrap();
        assert_eq!(
            outcome.result.follow_up_questions[0].question,
            "What do you stand for?"
        );
        assert!(outcome.result.debug_info.follow_up_error.is_none());
    }

    #[tokio::test]
    async fn test_evaluate_rejects_empty_transcript() {
        let (engine, _store) = engine(
            CannedProvider::new(Ok(json!({})), None),
            FollowUpMode::Template,
        );
        let err = engine.evaluate("nobody").await.unwrap_err();
        assert!(matches!(err, ExtractionError::EmptyTranscript { .. }));
        assert!(err.to_string().contains("No messages found in conversation"));
    }

    #[test]
    fn test_function_result_shape() {
        let outcome = ExtractionOutcome {
            result: ExtractionResult {
                profile: Profile::empty(),
                missing_fields: vec![],
                follow_up_questions: vec![],
                follow_up_attempts: Default::default(),
                debug_info: DebugInfo::default(),
                updated_at: Utc::now(),
            },
            changed_fields: vec![],
            degraded: Some(ExtractionError::SchemaMismatch {
                reason: "x".into(),
            }),
        };
        let value = outcome.function_result();
        assert_eq!(value["status"], "degraded");
        assert!(value["missing_fields"].as_array().unwrap().is_empty());
    }
}
