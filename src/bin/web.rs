//! RedAgent HTTP 前端
//!
//! 启动: cargo run --bin redagent-web --features web
//! 监听地址取 [web].bind（默认 127.0.0.1:8090）
//!
//! - POST /query          提交问题
//! - POST /approve        审批决定（approve / modify / abort）
//! - POST /session/reset  丢弃会话，返回新的 session_id
//! - GET  /sessions       列出某 tenant/project 下的会话
//! - GET  /health

#![cfg(feature = "web")]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use redagent::config::load_config;
use redagent::core::{ApprovalDecision, Orchestrator, OrchestratorBuilder, OrchestratorError};
use redagent::observability;
use redagent::session::SessionKey;

type AppState = Arc<Orchestrator>;

#[derive(Debug, Deserialize)]
struct QueryRequest {
    tenant_id: String,
    project_id: String,
    session_id: String,
    question: String,
}

#[derive(Debug, Deserialize)]
struct ApproveRequest {
    tenant_id: String,
    project_id: String,
    session_id: String,
    decision: String,
    #[serde(default)]
    modification: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SessionRequest {
    tenant_id: String,
    project_id: String,
    session_id: String,
}

#[derive(Debug, Serialize)]
struct ResetResponse {
    tenant_id: String,
    project_id: String,
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct SessionsQuery {
    tenant_id: String,
    project_id: String,
}

#[derive(Debug, Serialize)]
struct SessionsResponse {
    sessions: Vec<String>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    session_count: usize,
}

/// 错误统一为 {"error": "..."}：协议违例 409，请求无效 400，存储失败 500
struct ApiError(StatusCode, String);

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        let status = match &e {
            e if e.is_protocol_violation() => StatusCode::CONFLICT,
            OrchestratorError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.0.is_server_error() {
            tracing::error!(status = %self.0, "{}", self.1);
        }
        (self.0, Json(serde_json::json!({ "error": self.1 }))).into_response()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let cfg = load_config(std::env::args().nth(1).map(PathBuf::from)).context("Failed to load config")?;
    let bind = cfg.web.bind.clone();
    let orchestrator: AppState = Arc::new(OrchestratorBuilder::new(cfg).build().context("Failed to build orchestrator")?);

    let app = router(orchestrator);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    tracing::info!("RedAgent HTTP: http://{}", bind);
    axum::serve(listener, app).await?;
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/query", post(api_query))
        .route("/approve", post(api_approve))
        .route("/session/reset", post(api_reset))
        .route("/sessions", get(api_sessions))
        .route("/health", get(api_health))
        .with_state(state)
}

async fn api_query(
    State(orch): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<redagent::Response>, ApiError> {
    let key = SessionKey::new(req.tenant_id, req.project_id, req.session_id);
    Ok(Json(orch.submit(&key, &req.question).await?))
}

async fn api_approve(
    State(orch): State<AppState>,
    Json(req): Json<ApproveRequest>,
) -> Result<Json<redagent::Response>, ApiError> {
    let decision: ApprovalDecision = req
        .decision
        .parse()
        .map_err(|e: String| ApiError(StatusCode::BAD_REQUEST, e))?;
    let key = SessionKey::new(req.tenant_id, req.project_id, req.session_id);
    let resp = orch
        .resolve_approval(&key, decision, req.modification.as_deref())
        .await?;
    Ok(Json(resp))
}

async fn api_reset(
    State(orch): State<AppState>,
    Json(req): Json<SessionRequest>,
) -> Result<Json<ResetResponse>, ApiError> {
    let key = SessionKey::new(req.tenant_id, req.project_id, req.session_id);
    let fresh = orch.reset(&key).await?;
    Ok(Json(ResetResponse {
        tenant_id: fresh.tenant_id,
        project_id: fresh.project_id,
        session_id: fresh.session_id,
    }))
}

async fn api_sessions(
    State(orch): State<AppState>,
    Query(q): Query<SessionsQuery>,
) -> Result<Json<SessionsResponse>, ApiError> {
    if q.tenant_id.trim().is_empty() || q.project_id.trim().is_empty() {
        return Err(ApiError(
            StatusCode::BAD_REQUEST,
            "tenant_id and project_id are required".to_string(),
        ));
    }
    let sessions = orch.list_sessions(&q.tenant_id, &q.project_id).await?;
    Ok(Json(SessionsResponse { sessions }))
}

async fn api_health(State(orch): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    let session_count = orch.session_count().await?;
    Ok(Json(HealthResponse {
        status: "ok",
        session_count,
    }))
}
