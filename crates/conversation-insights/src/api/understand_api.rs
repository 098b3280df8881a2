use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;

use crate::analysis_db::GroupMemberPage;
use crate::api::{analysis_error, ApiError};
use crate::pipeline::UnderstandView;
use crate::shared_state::AppState;

const DEFAULT_PAGE_LIMIT: u64 = 20;

#[derive(Debug, Deserialize)]
pub struct MemberPageParams {
    #[serde(default)]
    pub offset: u64,
    #[serde(default = "default_limit")]
    pub limit: u64,
}

fn default_limit() -> u64 {
    DEFAULT_PAGE_LIMIT
}

/// Responses with placements, themes and similarity groups in one payload.
pub async fn get_understand_view(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Result<Json<UnderstandView>, ApiError> {
    state
        .orchestrator
        .get_understand_view(&conversation_id)
        .map(Json)
        .map_err(analysis_error)
}

pub async fn get_group_members(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    Query(params): Query<MemberPageParams>,
) -> Result<Json<GroupMemberPage>, ApiError> {
    state
        .orchestrator
        .get_group_members(&group_id, params.offset, params.limit)
        .map(Json)
        .map_err(analysis_error)
}
