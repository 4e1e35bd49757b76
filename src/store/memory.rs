//! Process-local store backed by maps.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{
    ConversationStore, ExtractionResult, MessageRole, ResultStore, StoredMessage, ThreadRef,
    cutoff, new_session_id,
};
use crate::error::DatabaseError;

#[derive(Debug)]
struct SessionRecord {
    messages: Vec<StoredMessage>,
    pass_complete: bool,
    /// `None` until first requested or after cleanup retired it.
    thread: Option<ThreadRef>,
}

impl SessionRecord {
    fn new() -> Self {
        Self {
            messages: Vec::new(),
            pass_complete: false,
            thread: None,
        }
    }
}

/// In-memory [`ConversationStore`] + [`ResultStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    sessions: RwLock<HashMap<String, SessionRecord>>,
    results: RwLock<HashMap<String, ExtractionResult>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn create_session(&self) -> Result<String, DatabaseError> {
        let id = new_session_id();
        self.sessions
            .write()
            .await
            .insert(id.clone(), SessionRecord::new());
        Ok(id)
    }

    async fn session_exists(&self, session_id: &str) -> Result<bool, DatabaseError> {
        Ok(self.sessions.read().await.contains_key(session_id))
    }

    async fn append(
        &self,
        session_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<(), DatabaseError> {
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(session_id.to_string())
            .or_insert_with(SessionRecord::new)
            .messages
            .push(StoredMessage {
                role,
                content: content.to_string(),
                created_at: Utc::now(),
            });
        Ok(())
    }

    async fn get_transcript(&self, session_id: &str) -> Result<Vec<StoredMessage>, DatabaseError> {
        Ok(self
            .sessions
            .read()
            .await
            .get(session_id)
            .map(|s| s.messages.clone())
            .unwrap_or_default())
    }

    async fn mark_pass_complete(&self, session_id: &str) -> Result<(), DatabaseError> {
        let mut sessions = self.sessions.write().await;
        let record = sessions
            .get_mut(session_id)
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "session".to_string(),
                id: session_id.to_string(),
            })?;
        record.pass_complete = true;
        Ok(())
    }

    async fn is_pass_complete(&self, session_id: &str) -> Result<bool, DatabaseError> {
        Ok(self
            .sessions
            .read()
            .await
            .get(session_id)
            .is_some_and(|s| s.pass_complete))
    }

    async fn get_thread_ref(&self, session_id: &str) -> Result<ThreadRef, DatabaseError> {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let record = sessions
            .entry(session_id.to_string())
            .or_insert_with(SessionRecord::new);

        let thread = record.thread.get_or_insert_with(|| {
            tracing::debug!(session_id, "Creating hosted-assistant thread reference");
            ThreadRef::fresh(now)
        });
        thread.last_activity = now;
        Ok(thread.clone())
    }

    async fn cleanup_inactive_threads(&self, max_age: Duration) -> Result<usize, DatabaseError> {
        let cutoff = cutoff(max_age)?;
        let mut retired = 0;
        for record in self.sessions.write().await.values_mut() {
            if record
                .thread
                .as_ref()
                .is_some_and(|t| t.last_activity < cutoff)
            {
                record.thread = None;
                retired += 1;
            }
        }
        Ok(retired)
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn put_result(
        &self,
        session_id: &str,
        result: &ExtractionResult,
    ) -> Result<(), DatabaseError> {
        self.results
            .write()
            .await
            .insert(session_id.to_string(), result.clone());
        Ok(())
    }

    async fn get_result(
        &self,
        session_id: &str,
    ) -> Result<Option<ExtractionResult>, DatabaseError> {
        Ok(self.results.read().await.get(session_id).cloned())
    }
}
