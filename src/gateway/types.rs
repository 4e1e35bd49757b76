//! Request and response DTOs for the HTTP gateway.

use serde::Serialize;

use crate::profile::FieldPath;
use crate::store::{ExtractionResult, StoredMessage};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct SessionCreatedResponse {
    pub session_id: String,
}

#[derive(Debug, Serialize)]
pub struct TranscriptResponse {
    pub session_id: String,
    pub pass_complete: bool,
    pub messages: Vec<StoredMessage>,
}

#[derive(Debug, Serialize)]
pub struct PassCompleteResponse {
    pub session_id: String,
    pub pass_complete: bool,
}

/// Result of an on-demand evaluation.
#[derive(Debug, Serialize)]
pub struct EvaluateResponse {
    pub session_id: String,
    #[serde(flatten)]
    pub result: ExtractionResult,
    pub changed_fields: Vec<FieldPath>,
    /// Why the hosted call degraded, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded: Option<String>,
}
