//! Session and results persistence.
//!
//! Two collaborator traits keep the relay and the extraction engine
//! independent of the storage backend:
//!
//! - [`ConversationStore`]: per-session transcript, pass-1 completion flag
//!   and hosted-assistant thread reference.
//! - [`ResultStore`]: the last extraction result per session.
//!
//! Everything is keyed by an explicit session id; there is no process-wide
//! "current session".

#[cfg(feature = "libsql")]
mod libsql;
mod memory;

#[cfg(feature = "libsql")]
pub use self::libsql::LibSqlStore;
pub use memory::MemoryStore;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{DatabaseBackend, DatabaseConfig};
use crate::error::DatabaseError;
use crate::extraction::{DebugInfo, FollowUpQuestion};
use crate::profile::{FieldPath, Profile};

/// Longest accepted session id.
const MAX_SESSION_ID_LEN: usize = 128;

/// Who wrote a transcript message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl std::str::FromStr for MessageRole {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            other => Err(DatabaseError::Serialization(format!(
                "unknown message role '{other}'"
            ))),
        }
    }
}

/// One transcript entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Opaque reference to the hosted-assistant conversation thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadRef {
    pub thread_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl ThreadRef {
    pub(crate) fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            thread_id: format!("thread_{}", uuid::Uuid::new_v4().simple()),
            created_at: now,
            last_activity: now,
        }
    }
}

/// Last computed extraction state for a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub profile: Profile,
    pub missing_fields: Vec<FieldPath>,
    pub follow_up_questions: Vec<FollowUpQuestion>,
    /// Questions issued so far per follow-up cluster.
    #[serde(default)]
    pub follow_up_attempts: BTreeMap<String, u32>,
    pub debug_info: DebugInfo,
    pub updated_at: DateTime<Utc>,
}

/// New 32-character hex session id.
pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Session ids are opaque but must be short and URL-safe.
pub fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

pub(crate) fn cutoff(max_age: Duration) -> Result<DateTime<Utc>, DatabaseError> {
    let age = chrono::Duration::from_std(max_age)
        .map_err(|e| DatabaseError::Query(format!("invalid max age: {e}")))?;
    Ok(Utc::now() - age)
}

/// Transcript and session bookkeeping.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Create an empty session and return its id.
    async fn create_session(&self) -> Result<String, DatabaseError>;

    /// Whether a session with this id exists.
    async fn session_exists(&self, session_id: &str) -> Result<bool, DatabaseError>;

    /// Append a message, creating the session on first use.
    async fn append(
        &self,
        session_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<(), DatabaseError>;

    /// Full transcript in insertion order. Unknown sessions yield an empty list.
    async fn get_transcript(&self, session_id: &str) -> Result<Vec<StoredMessage>, DatabaseError>;

    async fn mark_pass_complete(&self, session_id: &str) -> Result<(), DatabaseError>;

    async fn is_pass_complete(&self, session_id: &str) -> Result<bool, DatabaseError>;

    /// Thread reference for the session, created lazily. Touches its activity time.
    async fn get_thread_ref(&self, session_id: &str) -> Result<ThreadRef, DatabaseError>;

    /// Retire thread references idle longer than `max_age`. Returns how many.
    async fn cleanup_inactive_threads(&self, max_age: Duration) -> Result<usize, DatabaseError>;
}

/// Per-session extraction results.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn put_result(
        &self,
        session_id: &str,
        result: &ExtractionResult,
    ) -> Result<(), DatabaseError>;

    async fn get_result(&self, session_id: &str)
    -> Result<Option<ExtractionResult>, DatabaseError>;
}

/// Both stores behind one handle.
pub trait Store: ConversationStore + ResultStore {}

impl<T: ConversationStore + ResultStore> Store for T {}

/// Open the configured backend.
pub async fn connect_from_config(config: &DatabaseConfig) -> Result<Arc<dyn Store>, DatabaseError> {
    match config.backend {
        #[cfg(feature = "libsql")]
        DatabaseBackend::LibSql => {
            let store = LibSqlStore::new_local(&config.libsql_path).await?;
            tracing::info!(path = %config.libsql_path.display(), "Using libSQL store");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "libsql"))]
        DatabaseBackend::LibSql => Err(DatabaseError::Connection(
            "libSQL backend requested but the `libsql` feature is disabled".to_string(),
        )),
        DatabaseBackend::Memory => {
            tracing::warn!("Using in-memory store; sessions are lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}
