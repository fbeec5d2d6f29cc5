//! HTTP API endpoints

use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use flowprobe_core::query::{planner, Args, QueryResult, QueryRunner};
use flowprobe_core::{CancelToken, ProbeError};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared by all handlers
pub struct ApiState {
    pub db_path: PathBuf,
}

pub type AppState = Arc<ApiState>;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/ifaces", get(ifaces))
        .route("/query", post(query))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: flowprobe_core::VERSION.to_string(),
    })
}

async fn ifaces(
    State(state): State<AppState>,
) -> Result<Json<Vec<String>>, (StatusCode, Json<ErrorResponse>)> {
    planner::list_ifaces(&state.db_path)
        .map(Json)
        .map_err(internal_error)
}

async fn query(
    State(state): State<AppState>,
    Json(args): Json<Args>,
) -> Result<Json<QueryResult>, (StatusCode, Json<ErrorResponse>)> {
    let db_path = state.db_path.clone();

    // the query engine performs blocking file IO
    let result = tokio::task::spawn_blocking(move || {
        QueryRunner::new(db_path).run(&CancelToken::new(), &args)
    })
    .await
    .map_err(|e| internal_error(ProbeError::Query(e.to_string())))?;

    match result {
        Ok(result) => Ok(Json(result)),
        Err(e @ (ProbeError::Query(_) | ProbeError::MalformedCondition(_))) => Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )),
        Err(e) => Err(internal_error(e)),
    }
}

fn internal_error(e: ProbeError) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
}
