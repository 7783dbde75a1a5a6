use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use vigil_analysis::CodeIssue;
use vigil_core::{Alert, Language, SessionState, Snapshot, now_millis};

use crate::coordinator::{CoordinatorError, FileChange, SessionContext, SessionCoordinator};

type ApiResult<T> = Result<Json<T>, ApiError>;
type AppState = Arc<SessionCoordinator>;

pub fn build_router(coordinator: Arc<SessionCoordinator>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/sessions", get(list_sessions))
        .route("/sessions/init", post(init_session))
        .route("/sessions/{id}/snapshot", post(record_snapshot))
        .route("/sessions/{id}/reconstruct", post(reconstruct))
        .route("/sessions/{id}/close", post(close_session))
        .route("/sessions/{id}/context", get(session_context))
        .route("/sessions/{id}/alerts", get(session_alerts))
        .route("/sessions/{id}/history", get(file_history))
        .route("/analyze/ai-request", post(ai_request))
        .route("/analyze/ai-response", post(ai_response))
        .route("/validate/code", post(validate_code))
        .layer(TraceLayer::new_for_http())
        .with_state(coordinator)
}

/// Serves the session API until ctrl-c, sweeping idle sessions on an interval.
pub async fn serve(
    coordinator: Arc<SessionCoordinator>,
    bind: SocketAddr,
    sweep_interval: Duration,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    tracing::info!(addr = %listener.local_addr()?, "vigil session API listening");

    let sweeper = tokio::spawn(sweep_sessions(Arc::clone(&coordinator), sweep_interval));

    axum::serve(listener, build_router(coordinator))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to listen for shutdown signal");
            }
            tracing::info!("shutting down");
        })
        .await?;

    sweeper.abort();
    Ok(())
}

async fn sweep_sessions(coordinator: Arc<SessionCoordinator>, every: Duration) {
    let mut ticker = tokio::time::interval(every.max(Duration::from_secs(1)));
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match coordinator.collect_garbage(now_millis()) {
            Ok(abandoned) if !abandoned.is_empty() => {
                tracing::info!(count = abandoned.len(), "abandoned idle sessions");
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "session sweep failed"),
        }
    }
}

#[derive(Debug)]
pub enum ApiError {
    Coordinator(CoordinatorError),
    BadRequest(String),
}

impl From<CoordinatorError> for ApiError {
    fn from(err: CoordinatorError) -> Self {
        Self::Coordinator(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, "invalid_request", message),
            Self::Coordinator(err) => {
                let (status, code) = error_status(&err);
                (status, code, err.to_string())
            }
        };

        (status, Json(json!({ "error": message, "code": code }))).into_response()
    }
}

fn error_status(err: &CoordinatorError) -> (StatusCode, &'static str) {
    match err {
        CoordinatorError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        CoordinatorError::SessionClosed { .. } => (StatusCode::CONFLICT, "session_closed"),
        CoordinatorError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
        CoordinatorError::Store(_) | CoordinatorError::Extract(_) | CoordinatorError::Join(_) => {
            tracing::error!(error = %err, "request failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal")
        }
    }
}

#[derive(Debug, Deserialize)]
struct InitRequest {
    project_path: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Serialize)]
struct InitResponse {
    session_id: String,
    state: SessionState,
    baseline_snapshots: usize,
}

#[derive(Debug, Deserialize)]
struct SnapshotRequest {
    file_path: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct SnapshotResponse {
    snapshot_id: String,
    sequence: u64,
    step: u64,
    drift_percentage: u8,
    alerts: Vec<Alert>,
}

#[derive(Debug, Deserialize)]
struct AiRequest {
    session_id: String,
    request_id: String,
    prompt: String,
}

#[derive(Debug, Serialize)]
struct AiRequestResponse {
    request_id: String,
    recorded: bool,
}

#[derive(Debug, Deserialize)]
struct AiResponse {
    session_id: String,
    request_id: String,
    code_changes: Vec<FileChange>,
}

#[derive(Debug, Serialize)]
struct AiResponseResponse {
    request_id: String,
    alerts: Vec<Alert>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    errors: Vec<ChangeError>,
}

#[derive(Debug, Serialize)]
struct ChangeError {
    file_path: String,
    error: String,
    code: &'static str,
}

#[derive(Debug, Deserialize)]
struct ValidateRequest {
    file_path: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ValidateResponse {
    issues: Vec<CodeIssue>,
}

#[derive(Debug, Deserialize)]
struct ReconstructRequest {
    file_path: String,
    target_step: u64,
}

#[derive(Debug, Serialize)]
struct ReconstructResponse {
    content: String,
    sequence: u64,
    snapshot_id: String,
}

#[derive(Debug, Serialize)]
struct CloseResponse {
    session_id: String,
    state: SessionState,
}

#[derive(Debug, Serialize)]
struct SessionSummary {
    session_id: String,
    state: SessionState,
    intent: String,
    project_root: String,
    snapshot_count: u64,
    created_at: i64,
    last_activity_at: i64,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    file_path: String,
}

#[derive(Debug, Serialize)]
struct HistoryEntry {
    snapshot_id: String,
    sequence: u64,
    step: u64,
    created_at: i64,
    symbols: usize,
    degraded: bool,
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn list_sessions(State(coordinator): State<AppState>) -> ApiResult<Vec<SessionSummary>> {
    let sessions = coordinator
        .list_sessions()?
        .into_iter()
        .map(|session| SessionSummary {
            session_id: session.id,
            state: session.state,
            intent: session.intent,
            project_root: session.project_root,
            snapshot_count: session.snapshot_count,
            created_at: session.created_at,
            last_activity_at: session.last_activity_at,
        })
        .collect();
    Ok(Json(sessions))
}

async fn init_session(
    State(coordinator): State<AppState>,
    payload: Result<Json<InitRequest>, JsonRejection>,
) -> ApiResult<InitResponse> {
    let Json(request) = payload?;
    let language = match request.language.as_deref() {
        None => Language::Python,
        Some(value) => value.parse::<Language>().map_err(ApiError::BadRequest)?,
    };

    let outcome = coordinator
        .init_session(&request.project_path, language, &request.description)
        .await?;
    Ok(Json(InitResponse {
        session_id: outcome.session.id,
        state: outcome.session.state,
        baseline_snapshots: outcome.baseline_snapshots,
    }))
}

async fn record_snapshot(
    State(coordinator): State<AppState>,
    Path(session_id): Path<String>,
    payload: Result<Json<SnapshotRequest>, JsonRejection>,
) -> ApiResult<SnapshotResponse> {
    let Json(request) = payload?;
    let outcome = coordinator
        .record_change(&session_id, &request.file_path, &request.content)
        .await?;
    Ok(Json(SnapshotResponse {
        snapshot_id: outcome.snapshot.id,
        sequence: outcome.snapshot.sequence,
        step: outcome.snapshot.step,
        drift_percentage: outcome.drift_percentage,
        alerts: outcome.alerts,
    }))
}

async fn ai_request(
    State(coordinator): State<AppState>,
    payload: Result<Json<AiRequest>, JsonRejection>,
) -> ApiResult<AiRequestResponse> {
    let Json(request) = payload?;
    let recorded = coordinator
        .note_request(&request.session_id, &request.request_id, &request.prompt)
        .await?;
    Ok(Json(AiRequestResponse {
        request_id: request.request_id,
        recorded,
    }))
}

async fn ai_response(
    State(coordinator): State<AppState>,
    payload: Result<Json<AiResponse>, JsonRejection>,
) -> ApiResult<AiResponseResponse> {
    let Json(request) = payload?;
    let results = coordinator
        .record_changes(&request.session_id, &request.code_changes)
        .await?;

    let mut recorded = 0;
    let mut alerts = Vec::new();
    let mut failures = Vec::new();
    for (change, result) in request.code_changes.iter().zip(results) {
        match result {
            Ok(outcome) => {
                recorded += 1;
                alerts.extend(outcome.alerts);
            }
            Err(err) => failures.push((change.file_path.clone(), err)),
        }
    }
    // Nothing was recorded: report the first failure as the response status.
    if recorded == 0 && !failures.is_empty() {
        let (_, err) = failures.swap_remove(0);
        return Err(err.into());
    }

    let errors = failures
        .into_iter()
        .map(|(file_path, err)| ChangeError {
            file_path,
            code: error_status(&err).1,
            error: err.to_string(),
        })
        .collect();
    Ok(Json(AiResponseResponse {
        request_id: request.request_id,
        alerts,
        errors,
    }))
}

async fn validate_code(
    State(coordinator): State<AppState>,
    payload: Result<Json<ValidateRequest>, JsonRejection>,
) -> ApiResult<ValidateResponse> {
    let Json(request) = payload?;
    let issues = coordinator
        .validate_code(&request.file_path, &request.content)
        .await?;
    Ok(Json(ValidateResponse { issues }))
}

async fn reconstruct(
    State(coordinator): State<AppState>,
    Path(session_id): Path<String>,
    payload: Result<Json<ReconstructRequest>, JsonRejection>,
) -> ApiResult<ReconstructResponse> {
    let Json(request) = payload?;
    let snapshot = coordinator.reconstruct(&session_id, &request.file_path, request.target_step)?;
    Ok(Json(ReconstructResponse {
        content: snapshot.content,
        sequence: snapshot.sequence,
        snapshot_id: snapshot.id,
    }))
}

async fn close_session(
    State(coordinator): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<CloseResponse> {
    let session = coordinator.close(&session_id)?;
    Ok(Json(CloseResponse {
        session_id: session.id,
        state: session.state,
    }))
}

async fn session_context(
    State(coordinator): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<SessionContext> {
    Ok(Json(coordinator.session_context(&session_id).await?))
}

async fn session_alerts(
    State(coordinator): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Vec<Alert>> {
    Ok(Json(coordinator.alerts(&session_id)?))
}

async fn file_history(
    State(coordinator): State<AppState>,
    Path(session_id): Path<String>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> ApiResult<Vec<HistoryEntry>> {
    let Query(query) = query?;
    let entries = coordinator
        .history(&session_id, &query.file_path)?
        .into_iter()
        .map(history_entry)
        .collect();
    Ok(Json(entries))
}

fn history_entry(snapshot: Snapshot) -> HistoryEntry {
    HistoryEntry {
        degraded: snapshot.table.is_degraded(),
        symbols: snapshot.table.len(),
        snapshot_id: snapshot.id,
        sequence: snapshot.sequence,
        step: snapshot.step,
        created_at: snapshot.created_at,
    }
}
