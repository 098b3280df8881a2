//! HTTP handlers for intake, analysis requests and the read views.

pub mod admin_api;
pub mod analysis_api;
pub mod conversation_api;
pub mod understand_api;

use axum::{http::StatusCode, Json};
use serde::Serialize;
use tracing::{error, warn};
use validator::ValidationErrors;

use crate::error::AnalysisError;

pub use admin_api::{metrics, stats, StatsResponse};
pub use analysis_api::{get_analysis, request_analysis, RequestAnalysisParams};
pub use conversation_api::{
    add_responses, create_conversation, AddResponsesRequest, AddResponsesResponse, CreateConversationRequest,
};
pub use understand_api::{get_group_members, get_understand_view, MemberPageParams};

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);

fn error_body(status: StatusCode, error: String) -> ApiError {
    (status, Json(ErrorResponse { error }))
}

/// Map a pipeline error onto an HTTP status. Lookups of unknown ids are 404s,
/// every other validation failure is the caller's fault.
pub(crate) fn analysis_error(e: AnalysisError) -> ApiError {
    let status = match &e {
        AnalysisError::NotFound(_) => StatusCode::NOT_FOUND,
        AnalysisError::Validation(_) => StatusCode::BAD_REQUEST,
        AnalysisError::Concurrency(_) => StatusCode::CONFLICT,
        AnalysisError::Provider(_) => StatusCode::BAD_GATEWAY,
        AnalysisError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!("Request failed: {}", e);
    } else {
        warn!("Request rejected: {}", e);
    }
    error_body(status, e.to_string())
}

pub(crate) fn invalid_request(errors: ValidationErrors) -> ApiError {
    error_body(StatusCode::BAD_REQUEST, format!("Invalid request: {}", errors))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_map_to_statuses() {
        let status = |e: AnalysisError| analysis_error(e).0;
        assert_eq!(status(AnalysisError::not_found("Unknown conversation x")), StatusCode::NOT_FOUND);
        assert_eq!(status(AnalysisError::validation("Response #0 has empty text")), StatusCode::BAD_REQUEST);
        assert_eq!(status(AnalysisError::concurrency("lost")), StatusCode::CONFLICT);
        assert_eq!(status(AnalysisError::provider("down")), StatusCode::BAD_GATEWAY);
        assert_eq!(status(AnalysisError::persistence("disk")), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn error_body_carries_the_message() {
        let (_, Json(body)) = analysis_error(AnalysisError::not_found("Unknown similarity group g"));
        assert!(body.error.contains("Unknown similarity group g"));
    }

    #[test]
    fn status_follows_the_variant_not_the_wording() {
        let status = |e: AnalysisError| analysis_error(e).0;
        assert_eq!(status(AnalysisError::not_found("no conversation named x")), StatusCode::NOT_FOUND);
        assert_eq!(status(AnalysisError::validation("Unknown strategy 'partial'")), StatusCode::BAD_REQUEST);
    }
}
