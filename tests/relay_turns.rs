//! End-to-end turns through the relay against a scripted hosted assistant.

mod support;

use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::sync::mpsc;

use interview_relay::config::ExtractionFailurePolicy;
use interview_relay::error::LlmError;
use interview_relay::llm::Role;
use interview_relay::profile::FieldValue;
use interview_relay::relay::{PresentationMode, RelayEvent, TurnState};
use interview_relay::store::{ConversationStore, MessageRole, ResultStore};

use support::{Extraction, Step, harness, relay_config, run_collect, turn, values_payload};

const SESSION: &str = "session_a";

fn personal_values() -> FieldValue {
    FieldValue::List(vec!["honesty".to_string(), "curiosity".to_string()])
}

#[tokio::test]
async fn plain_turn_streams_chunks_in_order_then_done() {
    let h = harness(relay_config(ExtractionFailurePolicy::Continue), Duration::from_secs(1));
    h.provider
        .push_stream(vec![Step::Text("Hello"), Step::Text(", "), Step::Text("there."), Step::Done]);

    let (report, events) = run_collect(&h.relay, turn(SESSION, "Hi")).await;

    assert_eq!(
        events,
        vec![
            RelayEvent::chunk("Hello", PresentationMode::Text),
            RelayEvent::chunk(", ", PresentationMode::Text),
            RelayEvent::chunk("there.", PresentationMode::Text),
            RelayEvent::done(PresentationMode::Text),
        ]
    );
    assert_eq!(report.state, TurnState::Done);
    assert_eq!(report.chunks, 3);
    assert_eq!(report.extraction_rounds, 0);

    let transcript = h.store.get_transcript(SESSION).await.unwrap();
    assert_eq!(transcript.len(), 2);
    assert_eq!(transcript[0].role, MessageRole::User);
    assert_eq!(transcript[1].role, MessageRole::Assistant);
    assert_eq!(transcript[1].content, "Hello, there.");
}

#[tokio::test]
async fn voice_turns_tag_chunks_as_voice() {
    let h = harness(relay_config(ExtractionFailurePolicy::Continue), Duration::from_secs(1));
    h.provider.push_stream(vec![Step::Text("Sure."), Step::Done]);

    let mut request = turn(SESSION, "Talk to me");
    request.is_voice = true;
    let (_, events) = run_collect(&h.relay, request).await;

    assert_eq!(
        events,
        vec![
            RelayEvent::chunk("Sure.", PresentationMode::Voice),
            RelayEvent::done(PresentationMode::Voice),
        ]
    );
}

#[tokio::test]
async fn function_call_mid_turn_extracts_then_resumes() {
    let h = harness(relay_config(ExtractionFailurePolicy::Continue), Duration::from_secs(1));
    h.provider
        .push_stream(vec![Step::Text("That says a lot. "), Step::UpdateProfile, Step::Done])
        .push_stream(vec![Step::Text("What keeps you calm?"), Step::Done])
        .push_extraction(Extraction::Payload(values_payload()));

    let (report, events) = run_collect(
        &h.relay,
        turn(SESSION, "My core personal values are honesty and curiosity"),
    )
    .await;

    assert_eq!(
        events,
        vec![
            RelayEvent::chunk("That says a lot. ", PresentationMode::Text),
            RelayEvent::chunk("What keeps you calm?", PresentationMode::Text),
            RelayEvent::done(PresentationMode::Text),
        ]
    );
    assert_eq!(report.extraction_rounds, 1);

    let result = h.store.get_result(SESSION).await.unwrap().unwrap();
    assert_eq!(
        result.profile.get("core_values_and_priorities", "personal_values"),
        Some(&personal_values())
    );
    assert!(
        result
            .missing_fields
            .iter()
            .all(|p| p.to_string() != "core_values_and_priorities.personal_values")
    );

    // The resumed stream sees the function result.
    let requests = h.provider.stream_requests();
    assert_eq!(requests.len(), 2);
    let tool_result = requests[1]
        .messages
        .iter()
        .find(|m| m.role == Role::Tool)
        .expect("function result in resumed conversation");
    let body: serde_json::Value = serde_json::from_str(&tool_result.content).unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(
        body["updated_fields"],
        serde_json::json!(["core_values_and_priorities.personal_values"])
    );

    let transcript = h.store.get_transcript(SESSION).await.unwrap();
    assert_eq!(transcript[1].content, "That says a lot. What keeps you calm?");
}

#[tokio::test]
async fn profile_persists_even_when_the_turn_later_fails() {
    let h = harness(relay_config(ExtractionFailurePolicy::Continue), Duration::from_secs(1));
    h.provider
        .push_stream(vec![Step::UpdateProfile, Step::Done])
        .push_stream(vec![Step::Fail(LlmError::RateLimited {
            provider: "scripted".to_string(),
            retry_after: None,
        })])
        .push_extraction(Extraction::Payload(values_payload()));

    let (report, events) = run_collect(&h.relay, turn(SESSION, "Honesty matters to me")).await;

    assert_eq!(report.state, TurnState::Error);
    assert_eq!(events.len(), 1);
    assert!(events[0].error.is_some());

    let result = h.store.get_result(SESSION).await.unwrap().unwrap();
    assert_eq!(
        result.profile.get("core_values_and_priorities", "personal_values"),
        Some(&personal_values())
    );
    // A failed turn never records an assistant reply.
    let transcript = h.store.get_transcript(SESSION).await.unwrap();
    assert_eq!(transcript.len(), 1);
}

#[tokio::test]
async fn extraction_timeout_keeps_profile_and_continues() {
    let h = harness(
        relay_config(ExtractionFailurePolicy::Continue),
        Duration::from_millis(50),
    );
    h.provider
        .push_stream(vec![Step::UpdateProfile, Step::Done])
        .push_stream(vec![Step::Text("Noted."), Step::Done])
        .push_extraction(Extraction::Payload(values_payload()));
    run_collect(&h.relay, turn(SESSION, "Honesty and curiosity")).await;
    let before = h.store.get_result(SESSION).await.unwrap().unwrap().profile;

    h.provider
        .push_stream(vec![Step::UpdateProfile, Step::Done])
        .push_stream(vec![Step::Text("Go on."), Step::Done])
        .push_extraction(Extraction::Delayed(
            Duration::from_secs(2),
            serde_json::json!({"behavioral_patterns": {"stress_response": "I go quiet"}}),
        ));
    let (report, events) = run_collect(&h.relay, turn(SESSION, "Under stress I go quiet")).await;

    assert_eq!(report.state, TurnState::Done);
    assert_eq!(events.last(), Some(&RelayEvent::done(PresentationMode::Text)));

    let after = h.store.get_result(SESSION).await.unwrap().unwrap();
    assert_eq!(after.profile, before);
    assert!(after.debug_info.error.is_some());

    let requests = h.provider.stream_requests();
    let tool_result = requests[3]
        .messages
        .iter()
        .find(|m| m.role == Role::Tool)
        .unwrap();
    assert!(tool_result.content.contains("degraded"));
}

#[tokio::test]
async fn extraction_timeout_aborts_under_abort_policy() {
    let h = harness(
        relay_config(ExtractionFailurePolicy::Abort),
        Duration::from_millis(50),
    );
    h.provider
        .push_stream(vec![Step::Text("Let me note that. "), Step::UpdateProfile, Step::Done])
        .push_extraction(Extraction::Delayed(Duration::from_secs(2), values_payload()));

    let (report, events) = run_collect(&h.relay, turn(SESSION, "Honesty and curiosity")).await;

    assert_eq!(report.state, TurnState::Error);
    assert_eq!(events.len(), 2);
    assert!(!events[0].is_terminal());
    assert!(events[1].error.as_deref().unwrap().contains("timed out"));

    let result = h.store.get_result(SESSION).await.unwrap();
    assert!(result.is_none_or(|r| !r.profile.is_populated()));
}

#[tokio::test]
async fn stalled_stream_ends_in_error() {
    let mut config = relay_config(ExtractionFailurePolicy::Continue);
    config.chunk_timeout = Duration::from_millis(100);
    let h = harness(config, Duration::from_secs(1));
    h.provider.push_stream(vec![Step::Text("Hmm"), Step::Stall]);

    let (report, events) = run_collect(&h.relay, turn(SESSION, "Hello?")).await;

    assert_eq!(report.state, TurnState::Error);
    assert_eq!(events.len(), 2);
    assert_eq!(events[0], RelayEvent::chunk("Hmm", PresentationMode::Text));
    assert!(events[1].error.as_deref().unwrap().contains("stalled"));
}

#[tokio::test]
async fn client_disconnect_stops_the_turn_silently() {
    let h = harness(relay_config(ExtractionFailurePolicy::Continue), Duration::from_secs(1));
    h.provider.push_stream(vec![Step::Text("Once upon"), Step::Stall]);

    let (tx, mut rx) = mpsc::channel(8);
    let relay = h.relay.clone();
    let task = tokio::spawn(async move { relay.run_turn(turn(SESSION, "Tell me a story"), tx).await });

    let first = rx.recv().await.unwrap();
    assert_eq!(first.chunk.as_deref(), Some("Once upon"));
    drop(rx);

    let report = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("turn should stop after disconnect")
        .unwrap();
    assert_eq!(report.state, TurnState::Error);

    let transcript = h.store.get_transcript(SESSION).await.unwrap();
    assert_eq!(transcript.len(), 1);
}

#[tokio::test]
async fn concurrent_turn_on_same_session_is_rejected() {
    let h = harness(relay_config(ExtractionFailurePolicy::Continue), Duration::from_secs(1));
    h.provider.push_stream(vec![Step::Text("Thinking"), Step::Stall]);

    let (tx, mut rx) = mpsc::channel(8);
    let relay = h.relay.clone();
    let first = tokio::spawn(async move { relay.run_turn(turn(SESSION, "First"), tx).await });
    rx.recv().await.unwrap();

    let (report, events) = run_collect(&h.relay, turn(SESSION, "Second")).await;
    assert_eq!(report.state, TurnState::Error);
    assert_eq!(events.len(), 1);
    assert!(events[0].error.as_deref().unwrap().contains("already in progress"));

    drop(rx);
    first.await.unwrap();

    // The guard is released once the first turn ends.
    h.provider.push_stream(vec![Step::Text("Ok"), Step::Done]);
    let (report, _) = run_collect(&h.relay, turn(SESSION, "Third")).await;
    assert_eq!(report.state, TurnState::Done);
}

#[tokio::test]
async fn empty_message_is_rejected_without_touching_history() {
    let h = harness(relay_config(ExtractionFailurePolicy::Continue), Duration::from_secs(1));

    let (report, events) = run_collect(&h.relay, turn(SESSION, "   ")).await;

    assert_eq!(report.state, TurnState::Error);
    assert_eq!(events, vec![RelayEvent::error("Message field is required")]);
    assert!(h.store.get_transcript(SESSION).await.unwrap().is_empty());
    assert!(h.provider.stream_requests().is_empty());
}

#[tokio::test]
async fn too_many_function_rounds_end_the_turn() {
    let mut config = relay_config(ExtractionFailurePolicy::Continue);
    config.max_extraction_rounds = 1;
    let h = harness(config, Duration::from_secs(1));
    h.provider
        .push_stream(vec![Step::UpdateProfile, Step::Done])
        .push_stream(vec![Step::UpdateProfile, Step::Done])
        .push_extraction(Extraction::Payload(values_payload()));

    let (report, events) = run_collect(&h.relay, turn(SESSION, "Honesty")).await;

    assert_eq!(report.state, TurnState::Error);
    assert_eq!(events.len(), 1);
    assert!(events[0].error.as_deref().unwrap().contains("extraction rounds"));
}

#[tokio::test]
async fn unknown_function_gets_an_error_result() {
    let h = harness(relay_config(ExtractionFailurePolicy::Continue), Duration::from_secs(1));
    h.provider
        .push_stream(vec![Step::Call("lookup_weather"), Step::Done])
        .push_stream(vec![Step::Text("Anyway."), Step::Done]);

    let (report, _) = run_collect(&h.relay, turn(SESSION, "Nice day")).await;

    assert_eq!(report.state, TurnState::Done);
    assert!(h.store.get_result(SESSION).await.unwrap().is_none());
    let requests = h.provider.stream_requests();
    let tool_result = requests[1]
        .messages
        .iter()
        .find(|m| m.role == Role::Tool)
        .unwrap();
    assert!(tool_result.content.contains("unknown function"));
}

#[tokio::test]
async fn second_pass_prompt_lists_stored_follow_ups() {
    let h = harness(relay_config(ExtractionFailurePolicy::Continue), Duration::from_secs(1));
    h.provider
        .push_stream(vec![Step::UpdateProfile, Step::Done])
        .push_stream(vec![Step::Text("Thanks."), Step::Done])
        .push_extraction(Extraction::Payload(values_payload()));
    run_collect(&h.relay, turn(SESSION, "Honesty and curiosity")).await;

    let stored = h.store.get_result(SESSION).await.unwrap().unwrap();
    assert!(!stored.follow_up_questions.is_empty());

    h.store.mark_pass_complete(SESSION).await.unwrap();
    h.provider.push_stream(vec![Step::Text("Welcome back."), Step::Done]);
    run_collect(&h.relay, turn(SESSION, "I'm back")).await;

    let requests = h.provider.stream_requests();
    let first_pass = &requests[0].messages[0];
    let second_pass = &requests[2].messages[0];
    assert_eq!(first_pass.role, Role::System);
    assert!(!first_pass.content.contains("follow-up session"));
    assert!(second_pass.content.contains("follow-up session"));
    assert!(
        second_pass
            .content
            .contains(&format!("1. {}", stored.follow_up_questions[0].question))
    );
}
