//! Service startup: database, provider client, worker pool and HTTP router.
//!
//! Handlers and workers share one `AnalysisOrchestrator`; workers coordinate
//! with each other only through the job table.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::{Request, State},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::info;

use crate::{
    analysis_db::AnalysisDatabase,
    api,
    config::Config,
    pipeline::AnalysisOrchestrator,
    providers::LlmClient,
    shared_state::AppState,
    worker_pool::{WorkerPool, WorkerPoolConfig},
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub async fn run_server(cfg: Config) -> anyhow::Result<()> {
    crate::telemetry::init_tracing();
    crate::metrics::init_metrics().context("Failed to register metrics")?;
    cfg.print_config();

    let database = Arc::new(
        AnalysisDatabase::new(Path::new(&cfg.database_path))
            .with_context(|| format!("Failed to open database at {}", cfg.database_path))?,
    );
    let client = Arc::new(LlmClient::from_config(&cfg)?);
    let orchestrator = Arc::new(AnalysisOrchestrator::new(
        database,
        client.clone(),
        client,
        cfg.analysis.clone(),
    ));

    let pool = WorkerPool::start(WorkerPoolConfig::new(&cfg), Arc::clone(&orchestrator))?;

    let addr = cfg.api_addr()?;
    let state = AppState::new(orchestrator, cfg);
    let app = build_router(state);

    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Joining waits for in-flight jobs; keep it off the async workers.
    tokio::task::spawn_blocking(move || drop(pool)).await?;
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutdown signal received");
    }
}

async fn count_requests(State(state): State<AppState>, request: Request, next: Next) -> Response {
    state.counters.inc_total_requests();
    next.run(request).await
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/conversations", post(api::create_conversation))
        .route("/conversations/:id/responses", post(api::add_responses))
        .route(
            "/conversations/:id/analysis",
            get(api::get_analysis).post(api::request_analysis),
        )
        .route("/conversations/:id/understand", get(api::get_understand_view))
        .route("/similarity-groups/:id/members", get(api::get_group_members))
        .route("/stats", get(api::stats))
        .route("/metrics", get(api::metrics))
        .route("/healthz", get(|| async { "OK" }))
        .layer(middleware::from_fn_with_state(state.clone(), count_requests))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnalysisConfig;
    use crate::test_support::{FakeEmbedder, FakeGenerator};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn test_config() -> Config {
        Config {
            database_path: ":memory:".to_string(),
            api_host: "127.0.0.1".to_string(),
            api_port: 0,
            provider_base_url: "http://127.0.0.1:1".to_string(),
            provider_api_key: None,
            embedding_model: "fake".to_string(),
            generation_model: "fake".to_string(),
            provider_timeout_seconds: 5,
            workers: 1,
            analysis: AnalysisConfig {
                cluster_count: 2,
                projection_epochs: 20,
                ..AnalysisConfig::default()
            },
        }
    }

    fn test_state() -> AppState {
        let config = test_config();
        let db = Arc::new(AnalysisDatabase::new_in_memory().unwrap());
        let orchestrator = AnalysisOrchestrator::new(
            db,
            Arc::new(FakeEmbedder::by_length()),
            Arc::new(FakeGenerator::replying("{\"name\": \"Lengths\", \"description\": \"Similar lengths.\"}")),
            config.analysis.clone(),
        )
        .with_seed(3);
        AppState::new(Arc::new(orchestrator), config)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn intake_request_and_read_back() {
        let state = test_state();
        let app = build_router(state.clone());

        let (status, conversation) = send(&app, "POST", "/conversations", Some(json!({"title": "Parks"}))).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = conversation["id"].as_str().unwrap().to_string();

        let (status, added) = send(
            &app,
            "POST",
            &format!("/conversations/{}/responses", id),
            Some(json!({"responses": [{"text": "more trees"}, {"text": "more benches", "tag": "seating"}]})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(added["response_count"], 2);

        let (status, queued) = send(&app, "POST", &format!("/conversations/{}/analysis", id), None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(queued["strategy"], "full");
        let (status, again) = send(&app, "POST", &format!("/conversations/{}/analysis?strategy=incremental", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(again["job_id"], queued["job_id"]);

        let (_, polled) = send(&app, "GET", &format!("/conversations/{}/analysis", id), None).await;
        assert_eq!(polled["status"], "embedding");
        assert_eq!(polled["response_count"], 2);

        state.orchestrator.run_until_idle("test").await.unwrap();

        let (status, view) = send(&app, "GET", &format!("/conversations/{}/understand", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(view["status"], "ready");
        assert_eq!(view["responses"].as_array().unwrap().len(), 2);
        assert!(!view["themes"].as_array().unwrap().is_empty());

        let (_, stats) = send(&app, "GET", "/stats", None).await;
        assert_eq!(stats["database"]["total_responses"], 2);
        assert_eq!(stats["requests"]["responses_ingested"], 2);
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let app = build_router(test_state());
        let (status, body) = send(&app, "GET", "/conversations/missing/analysis", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("missing"));

        let (status, _) = send(&app, "GET", "/conversations/missing/understand", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, "GET", "/similarity-groups/missing/members?limit=5", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_bodies_are_rejected() {
        let app = build_router(test_state());
        let (status, body) = send(&app, "POST", "/conversations", Some(json!({"title": ""}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().starts_with("Invalid request"));

        let (_, conversation) = send(&app, "POST", "/conversations", Some(json!({"title": "t"}))).await;
        let id = conversation["id"].as_str().unwrap();
        let uri = format!("/conversations/{}/responses", id);
        let (status, _) = send(&app, "POST", &uri, Some(json!({"responses": []}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = send(&app, "POST", &uri, Some(json!({"responses": [{"text": "  "}]}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_and_metrics_respond() {
        crate::metrics::init_metrics().unwrap();
        let app = build_router(test_state());
        let response = app
            .clone()
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let text = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&text).contains("analysis_jobs_in_flight"));
    }
}
