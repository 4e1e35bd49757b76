//! Prompts for the extraction and follow-up calls.

use std::fmt::Write as _;

use crate::store::{MessageRole, StoredMessage};

use super::follow_ups::ClusterGap;

/// System prompt for the forced extraction function call.
pub const EXTRACTION_SYSTEM_PROMPT: &str = r#"You analyse interview transcripts and record what the interviewee has revealed about themselves.

Call the `record_interview_responses` function exactly once. Its parameters mirror the interview profile: seven sections, each with fixed fields.

Guidelines:
- Only record what the interviewee actually said or clearly implied. Never invent.
- Use the interviewee's own words where possible, condensed into a sentence or two.
- List fields take short items ("honesty", "curiosity"), one idea per item.
- Scale fields run from 0.0 to 1.0; only fill them when the transcript gives real evidence.
- Choice fields must use one of the allowed options.
- Leave a field null (or an empty list) when the transcript says nothing about it.
- Ignore what the interviewer says except as context for the answers."#;

/// System prompt for model-written follow-up questions.
pub const FOLLOW_UP_SYSTEM_PROMPT: &str = r#"You write follow-up questions for an ongoing personal interview.

Each question must be conversational, open-ended and designed to draw out a concrete example. Ask about one topic per question. Do not repeat a question the interviewee has already been asked; if a topic was asked about before, approach it from a different angle.

Respond with a JSON object only:
{"questions": [{"cluster": "<topic id>", "question": "<question text>"}]}
Write one question for every topic id you are given, and no others."#;

/// Render the transcript as `ROLE: content` lines.
pub fn format_transcript(transcript: &[StoredMessage]) -> String {
    transcript
        .iter()
        .map(|m| {
            let role = match m.role {
                MessageRole::User => "USER",
                MessageRole::Assistant => "ASSISTANT",
            };
            format!("{}: {}", role, m.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// User message for the extraction call.
pub fn extraction_user_prompt(history: &str) -> String {
    format!(
        "Interview transcript:\n\n{history}\n\nRecord everything the interviewee has revealed so far."
    )
}

/// User message for the follow-up call.
pub fn follow_up_user_prompt(gaps: &[ClusterGap], previous: &[String]) -> String {
    let mut prompt = String::from("Topics that still need answers:\n");
    for gap in gaps {
        let _ = writeln!(prompt, "- {}:", gap.cluster);
        for field in &gap.fields {
            let description = field.definition().map(|s| s.description).unwrap_or_default();
            let _ = writeln!(prompt, "    {} ({})", field, description);
        }
    }

    if !previous.is_empty() {
        prompt.push_str("\nQuestions already asked:\n");
        for question in previous {
            let _ = writeln!(prompt, "- {question}");
        }
    }
    prompt
}
