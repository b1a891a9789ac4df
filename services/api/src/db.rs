//! Data Access Layer
//!
//! This module contains all the functions for interacting with the PostgreSQL database.
//! Queries are checked at runtime so the crate builds without a live database.

use anyhow::{Context, Result};
use async_trait::async_trait;
use qflow_core::transcript::{TranscriptEntry, TranscriptSink};
use sqlx::PgPool;
use tokio::sync::Mutex;
use tracing::{error, info};
use uuid::Uuid;

use crate::models::{Message, MessageRole, Session, SessionStatus, TranscriptRecord};

const SESSION_COLUMNS: &str =
    "id, user_id, status, used_indices, current_index, created_at, updated_at";

/// The persisted effect of one conversational turn.
///
/// `read_used_indices` and `read_current_index` are the position the turn was
/// computed from; the turn is only stored while the session is still there.
pub struct TurnRecord<'a> {
    pub user_message: &'a str,
    pub ai_message: &'a str,
    pub read_used_indices: &'a [i32],
    pub read_current_index: Option<i32>,
    pub used_indices: Vec<i32>,
    pub current_index: Option<i32>,
    pub status: SessionStatus,
}

/// A wrapper around the `PgPool` to provide a clear data access interface.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Creates a new `Db` instance.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs all pending `sqlx` migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Creates a new session with nothing answered and stores its greeting.
    pub async fn create_session(&self, user_id: &str, greeting: &str) -> Result<Session> {
        let mut tx = self.pool.begin().await?;

        let session = sqlx::query_as::<_, Session>(&format!(
            "INSERT INTO sessions (user_id) VALUES ($1) RETURNING {SESSION_COLUMNS}"
        ))
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO messages (session_id, role, content) VALUES ($1, $2, $3)")
            .bind(session.id)
            .bind(MessageRole::Ai)
            .bind(greeting)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(session)
    }

    /// Retrieves a single session by its ID, scoped to a specific user.
    pub async fn get_session(&self, session_id: Uuid, user_id: &str) -> Result<Option<Session>> {
        let session = sqlx::query_as::<_, Session>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = $1 AND user_id = $2"
        ))
        .bind(session_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(session)
    }

    /// Lists all sessions for a given user, ordered by most recent.
    pub async fn list_sessions(&self, user_id: &str) -> Result<Vec<Session>> {
        let sessions = sqlx::query_as::<_, Session>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE user_id = $1 ORDER BY created_at DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(sessions)
    }

    /// Retrieves the full message history for a session, ordered chronologically.
    pub async fn get_session_messages(&self, session_id: Uuid) -> Result<Vec<Message>> {
        let messages = sqlx::query_as::<_, Message>(
            r#"
            SELECT id, session_id, role, content, created_at
            FROM messages
            WHERE session_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(messages)
    }

    /// Stores the new flow position and both messages of a turn in one
    /// transaction.
    ///
    /// Returns `None` without writing anything when the session has moved on
    /// from the position the turn was computed from, or is no longer active.
    pub async fn record_turn(
        &self,
        session_id: Uuid,
        turn: TurnRecord<'_>,
    ) -> Result<Option<Session>> {
        let mut tx = self.pool.begin().await?;

        let session = sqlx::query_as::<_, Session>(&format!(
            r#"
            UPDATE sessions
            SET used_indices = $1, current_index = $2, status = $3, updated_at = now()
            WHERE id = $4
              AND status = 'active'
              AND used_indices = $5
              AND current_index IS NOT DISTINCT FROM $6
            RETURNING {SESSION_COLUMNS}
            "#
        ))
        .bind(&turn.used_indices)
        .bind(turn.current_index)
        .bind(turn.status)
        .bind(session_id)
        .bind(turn.read_used_indices)
        .bind(turn.read_current_index)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(session) = session else {
            tx.rollback().await?;
            return Ok(None);
        };

        for (role, content) in [
            (MessageRole::User, turn.user_message),
            (MessageRole::Ai, turn.ai_message),
        ] {
            sqlx::query("INSERT INTO messages (session_id, role, content) VALUES ($1, $2, $3)")
                .bind(session_id)
                .bind(role)
                .bind(content)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(Some(session))
    }

    /// Retrieves the transcript of a session in answer order.
    pub async fn get_transcript(&self, session_id: Uuid) -> Result<Vec<TranscriptRecord>> {
        let records = sqlx::query_as::<_, TranscriptRecord>(
            r#"
            SELECT id, session_id, question_index, question_text, user_response,
                   transition_text, created_at
            FROM transcript_entries
            WHERE session_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// Appends transcript entries for a session in one transaction.
    pub async fn add_transcript_entries(
        &self,
        session_id: Uuid,
        entries: &[TranscriptEntry],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for entry in entries {
            let question_index = i32::try_from(entry.index)
                .with_context(|| format!("Question index {} does not fit i32", entry.index))?;
            sqlx::query(
                r#"
                INSERT INTO transcript_entries
                    (session_id, question_index, question_text, user_response, transition_text, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(session_id)
            .bind(question_index)
            .bind(&entry.question_text)
            .bind(&entry.user_response)
            .bind(&entry.transition_text)
            .bind(entry.timestamp)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Updates the status of a session (e.g., from 'active' to 'ended').
    pub async fn update_session_status(
        &self,
        session_id: Uuid,
        status: SessionStatus,
    ) -> Result<Session> {
        let session = sqlx::query_as::<_, Session>(&format!(
            "UPDATE sessions SET status = $1, updated_at = now() WHERE id = $2 RETURNING {SESSION_COLUMNS}"
        ))
        .bind(status)
        .bind(session_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(session)
    }
}

/// A `TranscriptSink` that buffers entries and writes them to
/// `transcript_entries` on flush. The flush destination is the session id.
pub struct DbTranscriptSink {
    db: Db,
    pending: Mutex<Vec<TranscriptEntry>>,
}

impl DbTranscriptSink {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            pending: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl TranscriptSink for DbTranscriptSink {
    async fn append(&self, entry: TranscriptEntry) -> Result<()> {
        self.pending.lock().await.push(entry);
        Ok(())
    }

    async fn flush(&self, destination: &str) -> bool {
        let session_id = match Uuid::parse_str(destination) {
            Ok(id) => id,
            Err(e) => {
                error!(destination, error = %e, "Transcript destination is not a session id");
                return false;
            }
        };

        let mut pending = self.pending.lock().await;
        if pending.is_empty() {
            return false;
        }
        match self.db.add_transcript_entries(session_id, &pending).await {
            Ok(()) => {
                info!(%session_id, entries = pending.len(), "Transcript entries stored");
                pending.clear();
                true
            }
            Err(e) => {
                error!(%session_id, error = ?e, "Failed to store transcript entries");
                false
            }
        }
    }
}
