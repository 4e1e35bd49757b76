//! System prompt for the interview conversation.

use crate::extraction::FollowUpQuestion;

use super::PROFILE_UPDATE_FUNCTION;

const INTERVIEWER_PREAMBLE: &str = r#"You are a warm, curious interviewer getting to know the person you are talking with. Over the conversation you want to understand their values and priorities, their emotional habits and leadership style, how they make decisions, how they behave under pressure, how they relate to others, how they learn, and where they depart from convention.

Ask one question at a time and follow up on what they actually say. Keep your replies short and conversational. Never lecture and never diagnose."#;

/// Build the system prompt for a turn.
///
/// Once the first pass is complete the prompt switches to working through
/// the stored follow-up questions.
pub fn interview_system_prompt(pass_complete: bool, follow_ups: &[FollowUpQuestion]) -> String {
    let mut prompt = String::from(INTERVIEWER_PREAMBLE);
    prompt.push_str(&format!(
        "\n\nWhenever the person reveals something new about themselves, call `{}` before you reply so their profile stays current. Then continue the conversation naturally.",
        PROFILE_UPDATE_FUNCTION
    ));

    if pass_complete {
        if follow_ups.is_empty() {
            prompt.push_str(
                "\n\nThis is a follow-up session and their profile is already complete. \
                 Thank them for their time and answer any questions they have.",
            );
        } else {
            prompt.push_str(
                "\n\nThis is a follow-up session. Some parts of their profile are still open. \
                 Work through these questions one at a time, in your own words:\n",
            );
            for (i, q) in follow_ups.iter().enumerate() {
                prompt.push_str(&format!("{}. {}\n", i + 1, q.question));
            }
        }
    }
    prompt
}
