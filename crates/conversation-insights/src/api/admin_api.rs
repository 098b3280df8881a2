//! Operational endpoints: Prometheus scrape and a database summary.
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Serialize;

use crate::analysis_db::DatabaseStats;
use crate::api::{analysis_error, ApiError, ErrorResponse};
use crate::shared_state::{AppState, CounterSnapshot};

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub database: DatabaseStats,
    pub requests: CounterSnapshot,
    pub workers: usize,
}

pub async fn metrics() -> Result<impl IntoResponse, ApiError> {
    let body = crate::metrics::render().map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: format!("Failed to render metrics: {}", e),
            }),
        )
    })?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}

pub async fn stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let database = state.database().get_stats().map_err(analysis_error)?;
    Ok(Json(StatsResponse {
        database,
        requests: state.counters.snapshot(),
        workers: state.config.workers,
    }))
}
