//! Extraction against a local OpenAI-compatible endpoint, so the real
//! provider's response parsing sits between the engine and the wire.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{Json, Router, extract::State, routing::post};
use chrono::Utc;
use serde_json::{Value, json};

use interview_relay::config::{ExtractionConfig, FollowUpMode, LlmConfig};
use interview_relay::error::{ExtractionError, LlmError};
use interview_relay::extraction::{EXTRACTION_FUNCTION, ExtractionEngine};
use interview_relay::llm::OpenAiCompatibleProvider;
use interview_relay::profile::FieldValue;
use interview_relay::store::{MemoryStore, MessageRole, ResultStore, StoredMessage};

type Replies = Arc<Mutex<VecDeque<String>>>;

/// Answers each chat completion with the next queued function-call arguments.
async fn chat_completions(State(replies): State<Replies>, Json(_body): Json<Value>) -> Json<Value> {
    let arguments = replies
        .lock()
        .unwrap()
        .pop_front()
        .expect("unexpected extra completion request");
    Json(json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "message": {
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": {"name": EXTRACTION_FUNCTION, "arguments": arguments}
                }]
            },
            "finish_reason": "tool_calls"
        }],
        "usage": {"prompt_tokens": 10, "completion_tokens": 5}
    }))
}

async fn start_endpoint(arguments: &[&str]) -> SocketAddr {
    let replies: Replies = Arc::new(Mutex::new(
        arguments.iter().map(|a| a.to_string()).collect(),
    ));
    let app = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .with_state(replies);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn engine_for(addr: SocketAddr) -> (ExtractionEngine, Arc<MemoryStore>) {
    let provider = OpenAiCompatibleProvider::new(LlmConfig {
        base_url: format!("http://{addr}"),
        api_key: None,
        model: "local-model".to_string(),
        extraction_model: "local-model".to_string(),
        request_timeout: Duration::from_secs(5),
    })
    .unwrap();
    let store = Arc::new(MemoryStore::new());
    let engine = ExtractionEngine::new(
        Arc::new(provider),
        store.clone(),
        ExtractionConfig {
            timeout: Duration::from_secs(5),
            follow_up_mode: FollowUpMode::Template,
        },
    );
    (engine, store)
}

fn transcript() -> Vec<StoredMessage> {
    vec![StoredMessage {
        role: MessageRole::User,
        content: "My core personal values are honesty and curiosity".to_string(),
        created_at: Utc::now(),
    }]
}

const TRUNCATED: &str = r#"{"core_values_and_priorities": {"personal_values": ["hon"#;

#[tokio::test]
async fn truncated_arguments_degrade_and_keep_the_stored_profile() {
    let addr = start_endpoint(&[
        r#"{"core_values_and_priorities": {"personal_values": ["honesty"]}}"#,
        TRUNCATED,
    ])
    .await;
    let (engine, store) = engine_for(addr);

    let first = engine.extract("s1", &transcript()).await.unwrap();
    assert!(first.degraded.is_none());
    assert_eq!(first.function_result()["status"], "ok");

    let second = engine.extract("s1", &transcript()).await.unwrap();
    assert!(matches!(
        second.degraded,
        Some(ExtractionError::Hosted(LlmError::MalformedArguments { .. }))
    ));
    assert_eq!(second.function_result()["status"], "degraded");
    assert!(second.changed_fields.is_empty());
    assert_eq!(second.result.profile, first.result.profile);
    assert_eq!(second.result.missing_fields, first.result.missing_fields);

    let debug = &second.result.debug_info;
    assert_eq!(debug.raw_response.as_deref(), Some(TRUNCATED));
    assert!(debug.error.as_deref().unwrap().contains(EXTRACTION_FUNCTION));

    let stored = store.get_result("s1").await.unwrap().unwrap();
    assert_eq!(
        stored
            .profile
            .get("core_values_and_priorities", "personal_values"),
        Some(&FieldValue::List(vec!["honesty".to_string()]))
    );
    assert_eq!(stored.debug_info.raw_response.as_deref(), Some(TRUNCATED));
}

#[tokio::test]
async fn well_formed_arguments_merge_through_the_provider() {
    let addr = start_endpoint(&[
        r#"{"decision_making_framework": {"risk_tolerance": "High", "analytical_intuitive_balance": 0.4}}"#,
    ])
    .await;
    let (engine, _store) = engine_for(addr);

    let outcome = engine.extract("s1", &transcript()).await.unwrap();
    assert!(outcome.degraded.is_none());
    assert_eq!(outcome.changed_fields.len(), 2);
    assert_eq!(
        outcome
            .result
            .profile
            .get("decision_making_framework", "risk_tolerance"),
        Some(&FieldValue::Choice(Some("high".to_string())))
    );
}
