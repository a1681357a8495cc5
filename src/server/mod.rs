//! HTTP facade for the orchestrator.
//!
//! Translates the externally visible operations - claim, transition,
//! execute, snapshot, plus audit diagnostics - onto the core facade and
//! maps the error taxonomy to status codes: 403 for authentication and
//! authorization denials, 400 for bad requests and backend failures, 200
//! with `allowed: false` for blocked-but-well-formed transitions.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use crate::audit::AuditQuery;
use crate::errors::BrokerError;
use crate::orchestrator::{
    Orchestrator, SnapshotError, TransitionError, TransitionRequest,
};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub orchestrator: Orchestrator,
}

pub type SharedState = Arc<AppState>;

/// Configuration for the orchestrator server.
pub struct ServerConfig {
    pub port: u16,
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            dev_mode: false,
        }
    }
}

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ClaimRequest {
    pub agent_id: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

#[derive(Deserialize)]
pub struct ExecuteRequest {
    pub task_id: String,
    pub phase_token: String,
    pub tool_name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Deserialize)]
pub struct SnapshotQuery {
    pub phase_token: String,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    Forbidden(String),
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({"detail": message}))).into_response()
    }
}

impl From<TransitionError> for ApiError {
    fn from(err: TransitionError) -> Self {
        match err {
            TransitionError::TokenInvalid => ApiError::Forbidden(err.to_string()),
            TransitionError::UnknownTransition { .. } | TransitionError::UnknownPhase(_) => {
                ApiError::BadRequest(err.to_string())
            }
            TransitionError::Engine(e) => ApiError::BadRequest(e.to_string()),
            TransitionError::Token(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<BrokerError> for ApiError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::InvalidToken | BrokerError::ToolForbidden { .. } => {
                ApiError::Forbidden(err.to_string())
            }
            BrokerError::ToolNotRegistered { .. }
            | BrokerError::Backend { .. }
            | BrokerError::BackendTimeout { .. } => ApiError::BadRequest(err.to_string()),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/v1/tasks/claim", post(claim_task))
        .route("/api/v1/tasks/transition", post(transition))
        .route("/api/v1/tools/execute", post(execute_tool))
        .route("/api/v1/state/snapshot", get(snapshot))
        .route("/api/v1/audit/query", get(audit_query))
        .route("/api/v1/audit/stats", get(audit_stats))
        .route("/health", get(health))
        .route("/", get(root))
}

pub fn build_router(state: SharedState) -> Router {
    api_router().with_state(state)
}

/// Start the orchestrator server.
pub async fn start_server(state: SharedState, config: ServerConfig) -> Result<()> {
    let mut app = build_router(state);
    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!(%addr, "orchestrator listening");
    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn root() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "workflow-orchestrator-api",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn health(State(state): State<SharedState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "workflow_loaded": true,
        "enforcement_mode": state.orchestrator.definition().enforcement.mode.to_string(),
    }))
}

async fn claim_task(
    State(state): State<SharedState>,
    Json(req): Json<ClaimRequest>,
) -> Result<Json<Value>, ApiError> {
    let claim = state
        .orchestrator
        .claim_task(&req.agent_id, req.capabilities, req.dependencies)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(serde_json::to_value(claim).map_err(|e| {
        ApiError::Internal(e.to_string())
    })?))
}

async fn transition(
    State(state): State<SharedState>,
    Json(req): Json<TransitionRequest>,
) -> Result<Json<Value>, ApiError> {
    let response = state.orchestrator.transition(&req)?;
    Ok(Json(json!({
        "allowed": response.allowed,
        "new_token": response.new_token,
        "blockers": response.blockers,
    })))
}

async fn execute_tool(
    State(state): State<SharedState>,
    Json(req): Json<ExecuteRequest>,
) -> Result<Json<Value>, ApiError> {
    let result = state
        .orchestrator
        .execute_tool(&req.task_id, &req.phase_token, &req.tool_name, req.args)
        .await?;
    Ok(Json(json!({"result": result, "logged": true})))
}

async fn snapshot(
    State(state): State<SharedState>,
    Query(query): Query<SnapshotQuery>,
) -> Result<Json<Value>, ApiError> {
    let snapshot = state
        .orchestrator
        .snapshot(&query.phase_token)
        .map_err(|e| match e {
            SnapshotError::TokenInvalid => ApiError::Forbidden(e.to_string()),
        })?;
    Ok(Json(
        serde_json::to_value(snapshot).map_err(|e| ApiError::Internal(e.to_string()))?,
    ))
}

async fn audit_query(
    State(state): State<SharedState>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Value>, ApiError> {
    let entries = state
        .orchestrator
        .audit_query(&query)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let count = entries.len();
    Ok(Json(json!({"entries": entries, "count": count})))
}

async fn audit_stats(State(state): State<SharedState>) -> Result<Json<Value>, ApiError> {
    let stats = state
        .orchestrator
        .audit_stats()
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(
        serde_json::to_value(stats).map_err(|e| ApiError::Internal(e.to_string()))?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::defaults::default_workflow;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const SECRET: &str = "server_test_secret_0123456789abcdef";

    fn app(dir: &TempDir) -> Router {
        let orchestrator =
            Orchestrator::new(dir.path(), default_workflow(), SECRET).unwrap();
        build_router(Arc::new(AppState { orchestrator }))
    }

    async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn root_reports_service_identity() {
        let dir = TempDir::new().unwrap();
        let (status, body) = get_json(&app(&dir), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "workflow-orchestrator-api");
    }

    #[tokio::test]
    async fn health_reports_enforcement_mode() {
        let dir = TempDir::new().unwrap();
        let (status, body) = get_json(&app(&dir), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["workflow_loaded"], true);
        assert_eq!(body["enforcement_mode"], "strict");
    }

    #[tokio::test]
    async fn snapshot_without_valid_token_is_403() {
        let dir = TempDir::new().unwrap();
        let (status, body) =
            get_json(&app(&dir), "/api/v1/state/snapshot?phase_token=bogus").await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(body["detail"].as_str().unwrap().contains("Invalid or expired"));
    }

    #[tokio::test]
    async fn audit_stats_start_empty() {
        let dir = TempDir::new().unwrap();
        let (status, body) = get_json(&app(&dir), "/api/v1/audit/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_entries"], 0);
    }
}
