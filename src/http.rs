//! HTTP surface.
//!
//! Every route lives under `/api`. Responses use one envelope:
//! `{success, data}` on success and `{success: false, error, kind, details}`
//! on failure. Health responses are flat (`{success, status,
//! dockerAvailable, details}`) since existing clients read them that way.

use std::sync::Arc;

use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::backend::{ExecutionBackend, ExecutionRequest, ExecutionResult};
use crate::error::ExecError;
use crate::health::{HealthReport, LanguageStatus};
use crate::lesson::{grade, LessonStore, Submission};

/// Header carrying the caller's user id, used only for lesson outcomes.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Response envelope shared by the server and [`crate::backend::RemoteBackend`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl<T> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            kind: None,
            details: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthBody {
    pub success: bool,
    #[serde(flatten)]
    pub report: HealthReport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendInputBody {
    pub execution_id: String,
    pub input: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopBody {
    pub execution_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitBody {
    pub code: String,
    pub language: String,
}

/// Shared state of the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub backend: Arc<dyn ExecutionBackend>,
    pub lessons: Arc<dyn LessonStore>,
    /// Bearer token required on mutating routes, when set.
    pub api_token: Option<String>,
}

/// Failures a handler can return.
#[derive(Debug)]
pub enum ApiError {
    Exec(ExecError),
    LessonNotFound(String),
    Unauthorized,
}

impl From<ExecError> for ApiError {
    fn from(e: ExecError) -> Self {
        Self::Exec(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, kind, details) = match self {
            Self::Exec(e) => {
                let status = match &e {
                    ExecError::UnsupportedLanguage(_) | ExecError::CompileTargetMismatch { .. } => {
                        StatusCode::BAD_REQUEST
                    }
                    ExecError::SessionNotFound(_) => StatusCode::NOT_FOUND,
                    ExecError::RuntimeUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                    ExecError::ExecutionTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                    ExecError::Remote { .. } => StatusCode::BAD_GATEWAY,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                if status.is_server_error() {
                    warn!(kind = e.kind(), detail = ?e.detail(), "Request failed: {e}");
                }
                (status, e.to_string(), e.kind(), e.detail())
            }
            Self::LessonNotFound(id) => (
                StatusCode::NOT_FOUND,
                format!("Lesson '{id}' was not found"),
                "lesson_not_found",
                None,
            ),
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "Authorization header with a valid Bearer token is required".to_string(),
                "unauthorized",
                None,
            ),
        };
        let body = Envelope::<()> {
            success: false,
            data: None,
            error: Some(message),
            kind: Some(kind.to_string()),
            details,
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<Envelope<T>>, ApiError>;

/// Build the router.
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/execute", post(execute))
        .route("/execute/send-input", post(send_input))
        .route("/execute/stop", post(stop_execution))
        .route("/lessons/{lesson_id}/submit", post(submit_lesson))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    let open = Router::new()
        .route("/health", get(health))
        .route("/docker-status", get(docker_status))
        .route("/docker-status/start", post(docker_start))
        .route("/languages", get(languages));

    Router::new()
        .nest("/api", protected.merge(open))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn require_token(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(expected) = state.api_token.as_deref() {
        let presented = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if presented != Some(expected) {
            return ApiError::Unauthorized.into_response();
        }
    }
    next.run(request).await
}

async fn execute(
    State(state): State<AppState>,
    Json(request): Json<ExecutionRequest>,
) -> ApiResult<ExecutionResult> {
    let result = state.backend.execute(request).await?;
    Ok(Json(Envelope::ok(result)))
}

async fn send_input(
    State(state): State<AppState>,
    Json(body): Json<SendInputBody>,
) -> ApiResult<ExecutionResult> {
    let result = state
        .backend
        .send_input(&body.execution_id, &body.input)
        .await?;
    Ok(Json(Envelope::ok(result)))
}

async fn stop_execution(
    State(state): State<AppState>,
    Json(body): Json<StopBody>,
) -> ApiResult<ExecutionResult> {
    let result = state.backend.stop(&body.execution_id).await?;
    Ok(Json(Envelope::ok(result)))
}

fn health_body(report: HealthReport) -> Json<HealthBody> {
    Json(HealthBody {
        success: true,
        report,
    })
}

async fn health(State(state): State<AppState>) -> Json<HealthBody> {
    health_body(state.backend.health(false).await)
}

async fn docker_status(State(state): State<AppState>) -> Json<HealthBody> {
    health_body(state.backend.health(true).await)
}

/// The daemon cannot launch the container engine itself; this re-probes it.
async fn docker_start(State(state): State<AppState>) -> Json<HealthBody> {
    info!("Container runtime start requested, re-probing");
    health_body(state.backend.health(true).await)
}

async fn languages(State(state): State<AppState>) -> Json<Envelope<Vec<LanguageStatus>>> {
    Json(Envelope::ok(state.backend.languages().await))
}

async fn submit_lesson(
    State(state): State<AppState>,
    Path(lesson_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<SubmitBody>,
) -> ApiResult<Submission> {
    let cases = state
        .lessons
        .test_cases(&lesson_id)
        .await
        .ok_or_else(|| ApiError::LessonNotFound(lesson_id.clone()))?;

    let submission = grade(
        state.backend.as_ref(),
        &lesson_id,
        &cases,
        &body.code,
        &body.language,
    )
    .await?;

    if let Some(user_id) = headers.get(USER_ID_HEADER).and_then(|v| v.to_str().ok()) {
        state
            .lessons
            .record_outcome(user_id, &lesson_id, submission.passed)
            .await;
    }
    info!(lesson = %lesson_id, passed = submission.passed, "Lesson submission graded");
    Ok(Json(Envelope::ok(submission)))
}
