//! Error types for the interview relay.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// Session and results store errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[cfg(feature = "libsql")]
    #[error("LibSQL error: {0}")]
    LibSql(#[from] libsql::Error),
}

/// Hosted assistant errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Provider {provider} timed out after {after:?}")]
    Timeout { provider: String, after: Duration },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Provider {provider} sent malformed arguments for {function}: {reason}")]
    MalformedArguments {
        provider: String,
        function: String,
        reason: String,
        raw: String,
    },
}

/// Extraction engine errors.
///
/// These are reported to callers of the engine but never discard the stored
/// profile.
#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("Hosted extraction call failed: {0}")]
    Hosted(#[from] LlmError),

    #[error("Extraction payload did not match the profile schema: {reason}")]
    SchemaMismatch { reason: String },

    #[error("No messages found in conversation for session {session_id}")]
    EmptyTranscript { session_id: String },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl ExtractionError {
    /// Payload text the hosted assistant sent when it could not be used.
    pub fn raw_payload(&self) -> Option<&str> {
        match self {
            Self::Hosted(LlmError::MalformedArguments { raw, .. }) => Some(raw),
            _ => None,
        }
    }
}

/// Streaming relay errors. Each one ends the turn with a single error event.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Client disconnected: {reason}")]
    Transport { reason: String },

    #[error("A turn is already in progress for session {session_id}")]
    TurnInProgress { session_id: String },

    #[error("Message field is required")]
    EmptyMessage,

    #[error("Assistant stream stalled for {after:?}")]
    StreamTimeout { after: Duration },

    #[error("Assistant requested more than {max} extraction rounds in one turn")]
    TooManyExtractionRounds { max: u32 },

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),
}

/// HTTP gateway errors.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Gateway failed to start: {reason}")]
    StartupFailed { reason: String },
}
