//! API and Database Models
//!
//! This module defines the core data structures used for both database mapping
//! with `sqlx` and for generating OpenAPI documentation with `utoipa`.

use chrono::{DateTime, Utc};
use qflow_core::{TurnOutput, TurnRequest};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(sqlx::Type, Debug, Serialize, Deserialize, ToSchema, Clone, Copy, PartialEq)]
#[sqlx(type_name = "session_status", rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Ended,
}

#[derive(sqlx::Type, Debug, Serialize, Deserialize, ToSchema, Clone, Copy, PartialEq)]
#[sqlx(type_name = "message_role", rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Ai,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Ai => write!(f, "ai"),
        }
    }
}

/// A persisted assessment session.
///
/// `used_indices` and `current_index` are the whole of the flow state; a
/// controller is rehydrated from them on every request.
#[derive(Serialize, Deserialize, ToSchema, FromRow, Debug, Clone)]
pub struct Session {
    #[schema(value_type = String, format = Uuid)]
    pub id: Uuid,
    pub user_id: String,
    #[schema(value_type = String, example = "active")]
    pub status: SessionStatus,
    pub used_indices: Vec<i32>,
    pub current_index: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// The stored flow position as bank indices.
    ///
    /// Fails on negative values, which no turn ever writes.
    pub fn flow_position(&self) -> Result<(Vec<usize>, Option<usize>), String> {
        let to_index =
            |i: i32| usize::try_from(i).map_err(|_| format!("Stored index {i} is negative"));
        let used = self
            .used_indices
            .iter()
            .map(|&i| to_index(i))
            .collect::<Result<Vec<_>, _>>()?;
        let current = self.current_index.map(to_index).transpose()?;
        Ok((used, current))
    }
}

#[derive(Serialize, Deserialize, ToSchema, FromRow, Debug, Clone)]
pub struct Message {
    pub id: i64,
    #[schema(value_type = String, format = Uuid)]
    pub session_id: Uuid,
    #[schema(value_type = String, example = "user")]
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// One answered question as stored in `transcript_entries`.
#[derive(Serialize, Deserialize, ToSchema, FromRow, Debug, Clone)]
pub struct TranscriptRecord {
    pub id: i64,
    #[schema(value_type = String, format = Uuid)]
    pub session_id: Uuid,
    pub question_index: i32,
    pub question_text: String,
    pub user_response: String,
    pub transition_text: String,
    pub created_at: DateTime<Utc>,
}

/// Returned by `POST /sessions`.
#[derive(Serialize, Deserialize, ToSchema, Debug)]
pub struct SessionCreated {
    pub session: Session,
    #[schema(example = "Hello! I'd like to ask you some questions to better understand your personality and work style. Are you ready to begin (yes/no)?")]
    pub greeting: String,
}

#[derive(Deserialize, ToSchema)]
pub struct RespondPayload {
    #[schema(example = "yes")]
    pub response: String,
}

#[derive(Deserialize, ToSchema)]
pub struct UpdateSessionStatusPayload {
    #[schema(example = "ended")]
    pub status: SessionStatus,
}

/// Body of the stateless `POST /turn` endpoint.
#[derive(Deserialize, ToSchema, Debug)]
#[serde(rename_all = "camelCase")]
pub struct TurnPayload {
    #[schema(example = "yes")]
    pub response: String,
    #[serde(default)]
    pub used_indices: Vec<usize>,
    #[serde(default)]
    pub current_index: Option<usize>,
}

impl From<TurnPayload> for TurnRequest {
    fn from(payload: TurnPayload) -> Self {
        Self {
            response: payload.response,
            used_indices: payload.used_indices,
            current_index: payload.current_index,
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TurnProgressBody {
    pub used: usize,
    pub total: usize,
    pub used_indices: Vec<usize>,
}

/// The outcome of one conversational turn.
#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TurnResponse {
    pub message: String,
    pub progress: TurnProgressBody,
    pub cluster_id: Option<i64>,
    pub question_index: Option<usize>,
    pub finished: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_answer_cluster_id: Option<i64>,
}

impl From<TurnOutput> for TurnResponse {
    fn from(out: TurnOutput) -> Self {
        Self {
            message: out.message,
            progress: TurnProgressBody {
                used: out.progress.used,
                total: out.progress.total,
                used_indices: out.progress.used_indices,
            },
            cluster_id: out.cluster_id,
            question_index: out.question_index,
            finished: out.finished,
            last_answer_cluster_id: out.last_answer_cluster_id,
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub message: String,
}
