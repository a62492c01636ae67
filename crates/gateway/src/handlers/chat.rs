//! Chat handler

use axum::{extract::State, Json};
use chrono::Utc;
use serde::Deserialize;
use tracing::instrument;
use uuid::Uuid;
use validator::Validate;

use crate::middleware::identity::ClientIdentity;
use crate::AppState;
use nutrisage_common::{
    errors::{AppError, Result},
    ChatRequest, Reply,
};

/// Chat request body
#[derive(Debug, Deserialize, Validate)]
pub struct ChatBody {
    /// Display name; also keys long-term memory
    #[serde(alias = "user_id")]
    #[validate(length(min = 1, max = 64, message = "display_name must be 1-64 characters"))]
    pub display_name: String,

    #[validate(length(min = 1, max = 4000, message = "message must be 1-4000 characters"))]
    pub message: String,

    /// Resume an existing session
    pub session_id: Option<Uuid>,
}

/// Answer one nutrition question
#[instrument(skip(state, body), fields(identity = %identity.0))]
pub async fn chat(
    State(state): State<AppState>,
    identity: ClientIdentity,
    Json(body): Json<ChatBody>,
) -> Result<Json<Reply>> {
    body.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: None,
    })?;

    let reply = state
        .assistant
        .handle(
            ChatRequest {
                identity: identity.0,
                user_id: body.display_name,
                message: body.message,
                session_id: body.session_id,
            },
            Utc::now(),
        )
        .await?;

    Ok(Json(reply))
}
