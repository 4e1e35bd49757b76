//! libSQL (embedded SQLite) store.
//!
//! Timestamps are stored as RFC 3339 text in UTC with a fixed precision so
//! that lexical comparison matches chronological order. Extraction results
//! are stored as one JSON document per session.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database, params};

use super::{
    ConversationStore, ExtractionResult, MessageRole, ResultStore, StoredMessage, ThreadRef,
    cutoff, new_session_id,
};
use crate::error::DatabaseError;

/// Schema, idempotent via `IF NOT EXISTS`.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    pass_complete INTEGER NOT NULL DEFAULT 0,
    thread_id TEXT,
    thread_created_at TEXT,
    thread_last_activity TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_thread_activity
    ON sessions(thread_last_activity);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id);

CREATE TABLE IF NOT EXISTS extraction_results (
    session_id TEXT PRIMARY KEY,
    result TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Serialization(format!("invalid timestamp '{raw}': {e}")))
}

fn get_text(row: &libsql::Row, idx: i32) -> String {
    row.get::<String>(idx).unwrap_or_default()
}

fn get_opt_text(row: &libsql::Row, idx: i32) -> Option<String> {
    match row.get_value(idx) {
        Ok(libsql::Value::Text(s)) => Some(s),
        _ => None,
    }
}

/// [`ConversationStore`] + [`ResultStore`] on a local libSQL file.
pub struct LibSqlStore {
    db: Database,
}

impl LibSqlStore {
    /// Open (or create) a database file and apply the schema.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Connection(format!(
                    "Failed to create database directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Connection(format!("Failed to open libSQL: {}", e)))?;

        let store = Self { db };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn connect(&self) -> Result<Connection, DatabaseError> {
        self.db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to connect: {}", e)))
    }

    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.execute_batch(SCHEMA)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        Ok(())
    }

    async fn ensure_session(&self, conn: &Connection, session_id: &str) -> Result<(), DatabaseError> {
        conn.execute(
            "INSERT INTO sessions (id, created_at) VALUES (?1, ?2) \
             ON CONFLICT(id) DO NOTHING",
            params![session_id, fmt_ts(&Utc::now())],
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for LibSqlStore {
    async fn create_session(&self) -> Result<String, DatabaseError> {
        let conn = self.connect().await?;
        let id = new_session_id();
        self.ensure_session(&conn, &id).await?;
        Ok(id)
    }

    async fn session_exists(&self, session_id: &str) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query("SELECT 1 FROM sessions WHERE id = ?1", params![session_id])
            .await?;
        Ok(rows.next().await?.is_some())
    }

    async fn append(
        &self,
        session_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        self.ensure_session(&conn, session_id).await?;
        conn.execute(
            "INSERT INTO messages (session_id, role, content, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![session_id, role.as_str(), content, fmt_ts(&Utc::now())],
        )
        .await?;
        Ok(())
    }

    async fn get_transcript(&self, session_id: &str) -> Result<Vec<StoredMessage>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT role, content, created_at FROM messages \
                 WHERE session_id = ?1 ORDER BY id ASC",
                params![session_id],
            )
            .await?;

        let mut messages = Vec::new();
        while let Some(row) = rows.next().await? {
            messages.push(StoredMessage {
                role: get_text(&row, 0).parse()?,
                content: get_text(&row, 1),
                created_at: parse_ts(&get_text(&row, 2))?,
            });
        }
        Ok(messages)
    }

    async fn mark_pass_complete(&self, session_id: &str) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        let affected = conn
            .execute(
                "UPDATE sessions SET pass_complete = 1 WHERE id = ?1",
                params![session_id],
            )
            .await?;
        if affected == 0 {
            return Err(DatabaseError::NotFound {
                entity: "session".to_string(),
                id: session_id.to_string(),
            });
        }
        Ok(())
    }

    async fn is_pass_complete(&self, session_id: &str) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT pass_complete FROM sessions WHERE id = ?1",
                params![session_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(row.get::<i64>(0).unwrap_or(0) != 0),
            None => Ok(false),
        }
    }

    async fn get_thread_ref(&self, session_id: &str) -> Result<ThreadRef, DatabaseError> {
        let conn = self.connect().await?;
        self.ensure_session(&conn, session_id).await?;

        let now = Utc::now();
        let mut rows = conn
            .query(
                "SELECT thread_id, thread_created_at FROM sessions WHERE id = ?1",
                params![session_id],
            )
            .await?;
        let existing = match rows.next().await? {
            Some(row) => get_opt_text(&row, 0).zip(get_opt_text(&row, 1)),
            None => None,
        };

        let thread = match existing {
            Some((thread_id, created_at)) => ThreadRef {
                thread_id,
                created_at: parse_ts(&created_at)?,
                last_activity: now,
            },
            None => {
                tracing::debug!(session_id, "Creating hosted-assistant thread reference");
                ThreadRef::fresh(now)
            }
        };

        conn.execute(
            "UPDATE sessions SET thread_id = ?2, thread_created_at = ?3, \
             thread_last_activity = ?4 WHERE id = ?1",
            params![
                session_id,
                thread.thread_id.as_str(),
                fmt_ts(&thread.created_at),
                fmt_ts(&thread.last_activity)
            ],
        )
        .await?;

        Ok(thread)
    }

    async fn cleanup_inactive_threads(&self, max_age: Duration) -> Result<usize, DatabaseError> {
        let conn = self.connect().await?;
        let cutoff = fmt_ts(&cutoff(max_age)?);
        let affected = conn
            .execute(
                "UPDATE sessions SET thread_id = NULL, thread_created_at = NULL, \
                 thread_last_activity = NULL \
                 WHERE thread_id IS NOT NULL AND thread_last_activity < ?1",
                params![cutoff],
            )
            .await?;
        Ok(affected as usize)
    }
}

#[async_trait]
impl ResultStore for LibSqlStore {
    async fn put_result(
        &self,
        session_id: &str,
        result: &ExtractionResult,
    ) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        let payload = serde_json::to_string(result)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        conn.execute(
            "INSERT INTO extraction_results (session_id, result, updated_at) \
             VALUES (?1, ?2, ?3) \
             ON CONFLICT(session_id) DO UPDATE SET \
             result = excluded.result, updated_at = excluded.updated_at",
            params![session_id, payload, fmt_ts(&result.updated_at)],
        )
        .await?;
        Ok(())
    }

    async fn get_result(
        &self,
        session_id: &str,
    ) -> Result<Option<ExtractionResult>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT result FROM extraction_results WHERE session_id = ?1",
                params![session_id],
            )
            .await?;
        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        let result = serde_json::from_str(&get_text(&row, 0))
            .map_err(|e| DatabaseError::Serialization(format!("invalid stored result: {e}")))?;
        Ok(Some(result))
    }
}
