//! Session handlers

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use uuid::Uuid;

use crate::AppState;
use nutrisage_common::{errors::Result, models::Turn};

/// Session state response
#[derive(Serialize)]
pub struct SessionResponse {
    pub session_id: Uuid,
    pub user_id: String,
    pub created_at: String,
    pub turns: Vec<Turn>,
}

/// Get session history
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<SessionResponse>> {
    let session = state.assistant.sessions().get(session_id).await?;

    tracing::debug!(session_id = %session_id, turns = session.turns.len(), "Session fetched");

    Ok(Json(SessionResponse {
        session_id: session.id,
        user_id: session.user_id,
        created_at: session.created_at.to_rfc3339(),
        turns: session.turns,
    }))
}
