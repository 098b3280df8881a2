//! Conversation and response intake.
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use validator::Validate;

use crate::analysis_db::{Conversation, NewResponse};
use crate::api::{analysis_error, invalid_request, ApiError};
use crate::shared_state::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct CreateConversationRequest {
    #[validate(length(min = 1, max = 200))]
    pub title: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct AddResponsesRequest {
    #[validate(length(min = 1, max = 1000))]
    pub responses: Vec<NewResponse>,
}

#[derive(Debug, Serialize)]
pub struct AddResponsesResponse {
    pub conversation_id: String,
    pub response_ids: Vec<String>,
    pub response_count: u64,
}

pub async fn create_conversation(
    State(state): State<AppState>,
    Json(req): Json<CreateConversationRequest>,
) -> Result<(StatusCode, Json<Conversation>), ApiError> {
    req.validate().map_err(invalid_request)?;
    let conversation = state
        .database()
        .conversations
        .create_conversation(req.title.trim())
        .map_err(analysis_error)?;
    info!("Created conversation {}", conversation.id);
    Ok((StatusCode::CREATED, Json(conversation)))
}

/// Append responses. Texts are immutable once stored; new ones make a ready
/// analysis stale until the next run.
pub async fn add_responses(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Json(req): Json<AddResponsesRequest>,
) -> Result<(StatusCode, Json<AddResponsesResponse>), ApiError> {
    req.validate().map_err(invalid_request)?;
    let conversations = &state.database().conversations;
    let response_ids = conversations
        .add_responses(&conversation_id, &req.responses)
        .map_err(analysis_error)?;
    let response_count = conversations.count_responses(&conversation_id).map_err(analysis_error)?;
    state.counters.add_responses_ingested(response_ids.len());

    info!("Added {} responses to conversation {}", response_ids.len(), conversation_id);
    Ok((
        StatusCode::CREATED,
        Json(AddResponsesResponse {
            conversation_id,
            response_ids,
            response_count,
        }),
    ))
}
