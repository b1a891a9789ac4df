//! Axum Handlers for the REST API
//!
//! This module contains the logic for handling HTTP requests for session management
//! and conversational turns. It uses `utoipa` doc comments to generate OpenAPI
//! documentation.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use qflow_core::{FlowController, FlowError, TurnRequest, run_turn};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    db::{DbTranscriptSink, TurnRecord},
    models::{
        ErrorResponse, Message, RespondPayload, Session, SessionCreated, SessionStatus,
        TranscriptRecord, TurnPayload, TurnResponse, UpdateSessionStatusPayload,
    },
    state::AppState,
};

pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    InternalServerError(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(ErrorResponse { message })).into_response()
            }
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(ErrorResponse { message })).into_response()
            }
            ApiError::Conflict(message) => {
                (StatusCode::CONFLICT, Json(ErrorResponse { message })).into_response()
            }
            ApiError::InternalServerError(err) => {
                error!("Internal Server Error: {:?}", err);
                let message = "An internal server error occurred.".to_string();
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse { message }),
                )
                    .into_response()
            }
        }
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::InternalServerError(err.into())
    }
}

/// Maps structural flow errors onto HTTP. A rejected position comes from the
/// caller's input; the other variants mean the turn does not fit the session.
fn flow_error(err: FlowError) -> ApiError {
    match err {
        FlowError::InvalidState(message) => ApiError::BadRequest(message),
        other => ApiError::Conflict(other.to_string()),
    }
}

/// The session's stored position changed under a concurrent turn.
fn stale_turn(id: Uuid) -> ApiError {
    ApiError::Conflict(format!(
        "Session '{id}' was updated by another response; fetch it and retry"
    ))
}

fn user_id(headers: &HeaderMap) -> Result<&str, ApiError> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("x-user-id header is required".to_string()))
}

async fn owned_session(state: &AppState, id: Uuid, user_id: &str) -> Result<Session, ApiError> {
    state
        .db
        .get_session(id, user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Session with id '{}' not found", id)))
}

/// Create a new assessment session and return its greeting.
#[utoipa::path(
    post,
    path = "/sessions",
    responses(
        (status = 201, description = "Session created successfully", body = SessionCreated),
        (status = 400, description = "Bad request", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("x-user-id" = String, Header, description = "The ID of the user creating the session")
    )
)]
#[instrument(skip_all)]
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = user_id(&headers)?;

    let mut flow = FlowController::new(state.bank.clone(), state.services.clone());
    let greeting = flow.greet().map_err(flow_error)?;

    let session = state.db.create_session(user_id, greeting).await?;
    info!(session_id = %session.id, "Session created");

    Ok((
        StatusCode::CREATED,
        Json(SessionCreated {
            session,
            greeting: greeting.to_string(),
        }),
    ))
}

/// List all sessions for a user.
#[utoipa::path(
    get,
    path = "/sessions",
    responses(
        (status = 200, description = "List of sessions", body = [Session]),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("x-user-id" = String, Header, description = "The ID of the user")
    )
)]
pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<Session>>, ApiError> {
    let user_id = user_id(&headers)?;
    let sessions = state.db.list_sessions(user_id).await?;
    Ok(Json(sessions))
}

/// Get a specific session by its ID.
#[utoipa::path(
    get,
    path = "/sessions/{id}",
    responses(
        (status = 200, description = "Session details", body = Session),
        (status = 404, description = "Session not found"),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Session ID"),
        ("x-user-id" = String, Header, description = "The ID of the user")
    )
)]
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = user_id(&headers)?;
    let session = owned_session(&state, id, user_id).await?;
    Ok((StatusCode::OK, Json(session)))
}

/// Answer the greeting or the current question of a session.
#[utoipa::path(
    post,
    path = "/sessions/{id}/respond",
    request_body = RespondPayload,
    responses(
        (status = 200, description = "The turn was processed", body = TurnResponse),
        (status = 400, description = "Session has ended or its state is invalid", body = ErrorResponse),
        (status = 404, description = "Session not found"),
        (status = 409, description = "The response does not fit the session's phase, or another response was recorded first", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Session ID"),
        ("x-user-id" = String, Header, description = "The ID of the user")
    )
)]
#[instrument(skip_all, fields(session_id = %id))]
pub async fn respond(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(payload): Json<RespondPayload>,
) -> Result<Json<TurnResponse>, ApiError> {
    let user_id = user_id(&headers)?;
    let session = owned_session(&state, id, user_id).await?;
    if session.status == SessionStatus::Ended {
        return Err(ApiError::BadRequest("Session has already ended".to_string()));
    }

    let (used, current) = session
        .flow_position()
        .map_err(|message| ApiError::InternalServerError(anyhow::anyhow!(message)))?;
    let mut flow =
        FlowController::rehydrate(state.bank.clone(), state.services.clone(), used, current)
            .map_err(flow_error)?;
    let out = flow.respond(&payload.response).await.map_err(flow_error)?;

    let used_indices = out
        .progress
        .used_indices
        .iter()
        .map(|&i| i32::try_from(i))
        .collect::<Result<Vec<_>, _>>()?;
    let current_index = out.question_index.map(i32::try_from).transpose()?;
    let status = if out.finished {
        SessionStatus::Ended
    } else {
        SessionStatus::Active
    };

    let recorded = state
        .db
        .record_turn(
            id,
            TurnRecord {
                user_message: &payload.response,
                ai_message: &out.message,
                read_used_indices: &session.used_indices,
                read_current_index: session.current_index,
                used_indices,
                current_index,
                status,
            },
        )
        .await?;
    if recorded.is_none() {
        warn!("Session moved on while the turn was processed");
        return Err(stale_turn(id));
    }

    if !flow.transcript().is_empty() {
        let sink = DbTranscriptSink::new((*state.db).clone());
        if !flow.flush_transcript(&sink, &id.to_string()).await {
            warn!("Transcript entries for this turn were not stored");
        }
    }

    info!(
        used = out.progress.used,
        total = out.progress.total,
        finished = out.finished,
        "Turn processed"
    );
    Ok(Json(out.into()))
}

/// Get the message history of a session.
#[utoipa::path(
    get,
    path = "/sessions/{id}/messages",
    responses(
        (status = 200, description = "Messages in chronological order", body = [Message]),
        (status = 404, description = "Session not found"),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Session ID"),
        ("x-user-id" = String, Header, description = "The ID of the user")
    )
)]
pub async fn get_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Message>>, ApiError> {
    let user_id = user_id(&headers)?;
    owned_session(&state, id, user_id).await?;
    Ok(Json(state.db.get_session_messages(id).await?))
}

/// Get the answered questions of a session.
#[utoipa::path(
    get,
    path = "/sessions/{id}/transcript",
    responses(
        (status = 200, description = "Transcript entries in answer order", body = [TranscriptRecord]),
        (status = 404, description = "Session not found"),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Session ID"),
        ("x-user-id" = String, Header, description = "The ID of the user")
    )
)]
pub async fn get_transcript(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<TranscriptRecord>>, ApiError> {
    let user_id = user_id(&headers)?;
    owned_session(&state, id, user_id).await?;
    Ok(Json(state.db.get_transcript(id).await?))
}

/// Update the status of a session.
#[utoipa::path(
    patch,
    path = "/sessions/{id}/status",
    request_body = UpdateSessionStatusPayload,
    responses(
        (status = 200, description = "Session status updated successfully", body = Session),
        (status = 404, description = "Session not found"),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Session ID"),
        ("x-user-id" = String, Header, description = "The ID of the user")
    )
)]
pub async fn update_session_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateSessionStatusPayload>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = user_id(&headers)?;

    // First, ensure the session exists and belongs to the user.
    owned_session(&state, id, user_id).await?;

    let updated_session = state.db.update_session_status(id, payload.status).await?;

    Ok((StatusCode::OK, Json(updated_session)))
}

/// Run one stateless turn from a caller-held flow position.
#[utoipa::path(
    post,
    path = "/turn",
    request_body = TurnPayload,
    responses(
        (status = 200, description = "The turn was processed", body = TurnResponse),
        (status = 400, description = "The flow position is invalid", body = ErrorResponse),
        (status = 409, description = "The response does not fit the flow position", body = ErrorResponse)
    )
)]
#[instrument(skip_all)]
pub async fn turn(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<TurnPayload>,
) -> Result<Json<TurnResponse>, ApiError> {
    let request = TurnRequest::from(payload);
    let out = run_turn(state.bank.clone(), state.services.clone(), &request)
        .await
        .map_err(flow_error)?;
    Ok(Json(out.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use qflow_core::FlowPhase;

    #[test]
    fn test_stale_turn_is_a_conflict() {
        let response = stale_turn(Uuid::nil()).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_flow_error_mapping() {
        let bad_position = flow_error(FlowError::InvalidState("index 9".into())).into_response();
        assert_eq!(bad_position.status(), StatusCode::BAD_REQUEST);

        let wrong_phase = flow_error(FlowError::InvalidPhase {
            operation: "respond",
            phase: FlowPhase::Finished,
        })
        .into_response();
        assert_eq!(wrong_phase.status(), StatusCode::CONFLICT);
    }
}
