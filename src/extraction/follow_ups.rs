//! Follow-up question planning.
//!
//! Missing fields are grouped into clusters of related fields so each
//! cluster gets at most one question per pass. Every cluster has several
//! template phrasings; the attempt counter picks the next one so a field
//! that stays missing is not asked about in the same words twice in a row.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::profile::FieldPath;

/// A natural-language question aimed at one cluster of missing fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowUpQuestion {
    pub question: String,
    pub cluster: String,
    pub fields: Vec<FieldPath>,
}

/// Missing fields that share a cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterGap {
    pub cluster: String,
    pub fields: Vec<FieldPath>,
}

/// A question proposed by the hosted assistant.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedQuestion {
    pub cluster: Option<String>,
    pub question: String,
}

/// Group missing fields by cluster, keeping first-seen order.
///
/// `missing` is expected in schema order, so the result is too.
pub fn cluster_gaps(missing: &[FieldPath]) -> Vec<ClusterGap> {
    let mut gaps: Vec<ClusterGap> = Vec::new();
    for path in missing {
        let Some(def) = path.definition() else {
            continue;
        };
        match gaps.iter_mut().find(|g| g.cluster == def.cluster) {
            Some(gap) => gap.fields.push(path.clone()),
            None => gaps.push(ClusterGap {
                cluster: def.cluster.to_string(),
                fields: vec![path.clone()],
            }),
        }
    }
    gaps
}

fn templates(cluster: &str) -> &'static [&'static str] {
    match cluster {
        "values" => &[
            "What values guide you most, both in your personal life and at work?",
            "Can you think of a time you stood by a principle even though it cost you something?",
            "Which values would the people who know you best say you live by?",
        ],
        "priorities" => &[
            "When several things compete for your time, how do you decide what comes first?",
            "What rule of thumb do you fall back on when two priorities clash?",
        ],
        "emotions" => &[
            "How do you usually notice and handle strong emotions when they come up?",
            "Tell me about a recent moment when you had to keep your feelings in check. What did you do?",
        ],
        "leadership" => &[
            "How would you describe the way you lead or influence the people around you?",
            "Think of a decision you made for a group. How did you go about it?",
        ],
        "decision_style" => &[
            "When you make an important decision, do you lean more on analysis or on gut feeling?",
            "Walk me through a big decision you made recently. What did you rely on most?",
        ],
        "risk_and_time" => &[
            "How comfortable are you with risk, and do you tend to optimise for the short or the long term?",
            "Tell me about a risk you took or avoided. How far ahead were you thinking?",
        ],
        "stress" => &[
            "What do you tend to do when you are under a lot of pressure?",
            "Describe a stressful period you went through. How did you get through it?",
        ],
        "conflict" => &[
            "How do you handle disagreements, whether at work or with people close to you?",
            "Tell me about a conflict you had to resolve. What did you do?",
        ],
        "balance" => &[
            "How do you divide your time and energy between work and the rest of your life?",
            "What does a good balance between work and life look like for you?",
        ],
        "collaboration" => &[
            "How do you like to work with other people, and how do you come to trust them?",
            "What does someone have to do to earn your trust when you work together?",
        ],
        "learning" => &[
            "How do you prefer to learn something new, and how do you reflect on what happened afterwards?",
            "Think of a skill you picked up recently. How did you go about learning it?",
        ],
        "change" => &[
            "How do you usually react when your plans or circumstances change unexpectedly?",
            "Do you tend to seek out change or prefer stability? Can you give an example?",
        ],
        "creativity" => &[
            "Where do your most unusual ideas come from?",
            "Tell me about a time you solved a problem in an unconventional way.",
        ],
        "contrarian" => &[
            "When do you find yourself pushing back against what everyone else thinks?",
            "Can you describe a time you disagreed with the consensus? What happened?",
        ],
        "ambiguity" => &[
            "How do you deal with situations that are contradictory or ambiguous, and when would you break your own rules?",
            "Tell me about a time you had to act without a clear answer. What guided you?",
        ],
        _ => &[],
    }
}

fn generic_question(gap: &ClusterGap) -> String {
    let topic = gap
        .fields
        .first()
        .and_then(|f| f.definition())
        .map(|s| s.description.to_lowercase())
        .unwrap_or_else(|| gap.cluster.replace('_', " "));
    format!("Could you tell me more about {topic}?")
}

/// Template question for a cluster on its `attempt`-th ask (0-based).
pub fn template_question(gap: &ClusterGap, attempt: u32) -> FollowUpQuestion {
    let variants = templates(&gap.cluster);
    let question = if variants.is_empty() {
        generic_question(gap)
    } else {
        variants[attempt as usize % variants.len()].to_string()
    };
    FollowUpQuestion {
        question,
        cluster: gap.cluster.clone(),
        fields: gap.fields.clone(),
    }
}

/// Parse the follow-up call's reply.
///
/// Accepts `{"questions": [...]}` or a bare array, with items either plain
/// strings or `{cluster, question}` objects. Code fences and chatter around
/// the JSON are tolerated.
pub fn parse_proposed_questions(text: &str) -> Result<Vec<ProposedQuestion>, String> {
    let value = parse_json_loose(text)?;
    let items = match &value {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(map) => map
            .get("questions")
            .and_then(|q| q.as_array())
            .ok_or("Reply has no \"questions\" array")?,
        _ => return Err("Reply is not a JSON object or array".to_string()),
    };

    Ok(items
        .iter()
        .filter_map(|item| match item {
            serde_json::Value::String(q) => Some(ProposedQuestion {
                cluster: None,
                question: q.trim().to_string(),
            }),
            serde_json::Value::Object(obj) => Some(ProposedQuestion {
                cluster: obj
                    .get("cluster")
                    .and_then(|c| c.as_str())
                    .map(str::to_string),
                question: obj.get("question")?.as_str()?.trim().to_string(),
            }),
            _ => None,
        })
        .filter(|q| !q.question.is_empty())
        .collect())
}

fn parse_json_loose(text: &str) -> Result<serde_json::Value, String> {
    let cleaned = text.trim();

    let json_str = if let Some(start) = cleaned.find("```") {
        let after_fence = &cleaned[start + 3..];
        let after_fence = after_fence.strip_prefix("json").unwrap_or(after_fence);
        match after_fence.find("```") {
            Some(end) => after_fence[..end].trim(),
            None => after_fence.trim(),
        }
    } else if cleaned.starts_with('{') || cleaned.starts_with('[') {
        cleaned
    } else {
        let start = cleaned.find('{').ok_or("No JSON object found")?;
        let end = cleaned.rfind('}').ok_or("No closing brace found")?;
        if end < start {
            return Err("No JSON object found".to_string());
        }
        &cleaned[start..=end]
    };

    serde_json::from_str(json_str).map_err(|e| format!("JSON parse error: {}", e))
}

fn same_question(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

/// Build the final question list: at most one per gap, in gap order.
///
/// Proposed questions are matched to gaps by cluster id; unlabeled ones fill
/// the remaining gaps in order. A gap with no usable proposal, or whose
/// proposal repeats last pass's question for that cluster, gets a template.
/// `attempts` is advanced for every cluster asked about and cleared for
/// clusters that are no longer missing.
pub fn assemble(
    gaps: &[ClusterGap],
    proposed: Option<Vec<ProposedQuestion>>,
    previous: &[FollowUpQuestion],
    attempts: &mut BTreeMap<String, u32>,
) -> Vec<FollowUpQuestion> {
    let proposed = proposed.unwrap_or_default();
    let (labeled, mut unlabeled): (Vec<_>, Vec<_>) =
        proposed.into_iter().partition(|p| p.cluster.is_some());
    unlabeled.reverse();

    attempts.retain(|cluster, _| gaps.iter().any(|g| &g.cluster == cluster));

    let mut questions = Vec::with_capacity(gaps.len());
    for gap in gaps {
        let attempt = attempts.get(&gap.cluster).copied().unwrap_or(0);
        let last = previous
            .iter()
            .find(|q| q.cluster == gap.cluster)
            .map(|q| q.question.as_str());

        let candidate = labeled
            .iter()
            .find(|p| p.cluster.as_deref() == Some(gap.cluster.as_str()))
            .map(|p| p.question.clone())
            .or_else(|| unlabeled.pop().map(|p| p.question));

        let question = match candidate {
            Some(q) if !last.is_some_and(|l| same_question(l, &q)) => FollowUpQuestion {
                question: q,
                cluster: gap.cluster.clone(),
                fields: gap.fields.clone(),
            },
            _ => {
                let mut templated = template_question(gap, attempt);
                if last.is_some_and(|l| same_question(l, &templated.question)) {
                    templated = template_question(gap, attempt + 1);
                }
                templated
            }
        };

        *attempts.entry(gap.cluster.clone()).or_insert(0) += 1;
        questions.push(question);
    }
    questions
}
