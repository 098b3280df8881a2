//! Analysis requests and status polling.
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use tracing::info;

use crate::analysis_db::Strategy;
use crate::api::{analysis_error, ApiError};
use crate::pipeline::{AnalysisRequestOutcome, AnalysisStatusView};
use crate::shared_state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct RequestAnalysisParams {
    /// `full` or `incremental`; omitted lets the staleness policy decide.
    pub strategy: Option<Strategy>,
}

pub async fn get_analysis(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Result<Json<AnalysisStatusView>, ApiError> {
    state
        .orchestrator
        .get_analysis_status(&conversation_id)
        .map(Json)
        .map_err(analysis_error)
}

/// Queue an analysis run. Answers 202 for a new job and 200 when a job was
/// already queued or running for the conversation.
pub async fn request_analysis(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Query(params): Query<RequestAnalysisParams>,
) -> Result<(StatusCode, Json<AnalysisRequestOutcome>), ApiError> {
    state.counters.inc_analysis_requests();
    let outcome = state
        .orchestrator
        .request_analysis(&conversation_id, params.strategy)
        .map_err(analysis_error)?;

    info!(
        "Analysis for conversation {}: job {} ({}, created: {})",
        conversation_id,
        outcome.job_id,
        outcome.strategy.as_str(),
        outcome.created
    );
    let status = if outcome.created { StatusCode::ACCEPTED } else { StatusCode::OK };
    Ok((status, Json(outcome)))
}
