// HTTP route handlers for the Codo API

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use codo_common::error::{QueueError, StoreError, UnsupportedLanguage};
use codo_common::types::{Submission, SubmissionStatus, TestSummary, MAX_SOURCE_CODE_BYTES};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::metrics;
use crate::AppState;

/// Header the upstream auth layer sets to the authenticated user id
pub const USER_HEADER: &str = "x-user-id";

/// Error body: `{"error": "...", "code": "..."}`
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BadRequest", message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NotFound", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({
                "error": self.message,
                "code": self.code,
            })),
        )
            .into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) | StoreError::ProblemNotFound(_) => {
                Self::not_found(err.to_string())
            }
            StoreError::AlreadyTerminal(_) => {
                Self::new(StatusCode::CONFLICT, "AlreadyTerminal", err.to_string())
            }
            StoreError::NotPending(_) | StoreError::LeaseMismatch(_) => {
                Self::new(StatusCode::CONFLICT, "NotPending", err.to_string())
            }
            StoreError::Corrupt { .. } | StoreError::Backend(_) => {
                error!(error = %err, "Store failure");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal", "storage failure")
            }
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::QueueFull { .. } => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "QueueFull", err.to_string())
            }
            QueueError::LeaseLost(_) | QueueError::Backend(_) => {
                error!(error = %err, "Queue failure");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal", "queue failure")
            }
        }
    }
}

impl From<UnsupportedLanguage> for ApiError {
    fn from(err: UnsupportedLanguage) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "UnsupportedLanguage", err.to_string())
    }
}

fn caller(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(USER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|user| !user.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::UNAUTHORIZED,
                "Unauthenticated",
                format!("missing {} header", USER_HEADER),
            )
        })
}

fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::bad_request("Invalid submission ID format"))
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    #[serde(alias = "sourceCode")]
    pub code: String,
    pub language: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub submission_id: Uuid,
    pub status: SubmissionStatus,
}

/// Entry of `GET /my-submissions`, shaped for the legacy polling client
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionSummary {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub problem_id: String,
    pub language: String,
    pub status: SubmissionStatus,
    pub score: u32,
    pub max_score: u32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&Submission> for SubmissionSummary {
    fn from(submission: &Submission) -> Self {
        // The legacy client stops polling on anything but "pending"
        let status = match submission.status {
            SubmissionStatus::Running => SubmissionStatus::Pending,
            other => other,
        };
        Self {
            id: submission.id,
            problem_id: submission.problem_id.clone(),
            language: submission.language.to_string(),
            status,
            score: submission.score,
            max_score: submission.max_score,
            error: submission.error.clone(),
            created_at: submission.created_at,
            finished_at: submission.finished_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MySubmissionsResponse {
    pub submissions: Vec<SubmissionSummary>,
}

/// Full record for its owner; the lease token stays internal
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionDetail {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub user_id: String,
    pub problem_id: String,
    pub language: String,
    pub source_code: String,
    pub status: SubmissionStatus,
    pub score: u32,
    pub max_score: u32,
    pub error: Option<String>,
    pub tests: Vec<TestSummary>,
    pub test_count: usize,
    pub testset_digest: Option<String>,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<Submission> for SubmissionDetail {
    fn from(s: Submission) -> Self {
        Self {
            id: s.id,
            user_id: s.user_id,
            problem_id: s.problem_id,
            language: s.language.to_string(),
            source_code: s.source_code,
            status: s.status,
            score: s.score,
            max_score: s.max_score,
            error: s.error,
            tests: s.tests,
            test_count: s.test_count,
            testset_digest: s.testset_digest,
            attempts: s.attempts,
            created_at: s.created_at,
            started_at: s.started_at,
            finished_at: s.finished_at,
        }
    }
}

/// POST /problems/:id/submit - Create a pending submission and queue it
pub async fn submit(
    State(state): State<Arc<AppState>>,
    Path(problem_id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let user_id = caller(&headers)?;

    let language = state.languages.resolve(&payload.language).map_err(|e| {
        metrics::SUBMISSIONS.with_label_values(&["rejected"]).inc();
        ApiError::from(e)
    })?;
    if payload.code.trim().is_empty() {
        metrics::SUBMISSIONS.with_label_values(&["rejected"]).inc();
        return Err(ApiError::bad_request("code must not be empty"));
    }
    if payload.code.len() > MAX_SOURCE_CODE_BYTES {
        metrics::SUBMISSIONS.with_label_values(&["rejected"]).inc();
        return Err(ApiError::bad_request(format!(
            "code exceeds maximum size of {} bytes",
            MAX_SOURCE_CODE_BYTES
        )));
    }
    if state.problems.get(&problem_id).await?.is_none() {
        return Err(ApiError::not_found(format!("problem {} not found", problem_id)));
    }

    let submission = Submission::new(user_id, problem_id, language, payload.code);
    let id = state.store.create(&submission).await?;

    match state.queue.enqueue(id).await {
        Ok(depth) => {
            metrics::SUBMISSIONS.with_label_values(&["queued"]).inc();
            info!(
                submission_id = %id,
                user_id = %submission.user_id,
                problem_id = %submission.problem_id,
                language = %language,
                queue_depth = depth,
                "Submission queued"
            );
            Ok((
                StatusCode::CREATED,
                Json(SubmitResponse {
                    submission_id: id,
                    status: SubmissionStatus::Pending,
                }),
            ))
        }
        Err(e) => {
            // Never leave a record pending that no worker will see
            if let Err(discard_err) = state.store.discard(id).await {
                error!(submission_id = %id, error = %discard_err, "Failed to discard unqueued submission");
            }
            if matches!(e, QueueError::QueueFull { .. }) {
                metrics::SUBMISSIONS.with_label_values(&["refused"]).inc();
                warn!(submission_id = %id, error = %e, "Submission refused");
            }
            Err(e.into())
        }
    }
}

/// GET /my-submissions - The caller's submissions, newest first
pub async fn my_submissions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<MySubmissionsResponse>, ApiError> {
    let user_id = caller(&headers)?;
    let submissions = state.store.list_by_user(&user_id).await?;
    Ok(Json(MySubmissionsResponse {
        submissions: submissions.iter().map(SubmissionSummary::from).collect(),
    }))
}

async fn owned_submission(
    state: &AppState,
    headers: &HeaderMap,
    raw_id: &str,
) -> Result<Submission, ApiError> {
    let user_id = caller(headers)?;
    let id = parse_id(raw_id)?;
    let submission = state.store.get(id).await?;
    // Other users' submissions are indistinguishable from missing ones
    if submission.user_id != user_id {
        return Err(StoreError::NotFound(id).into());
    }
    Ok(submission)
}

/// GET /submissions/:id - Full submission record, including `running`
pub async fn get_submission(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<SubmissionDetail>, ApiError> {
    let submission = owned_submission(&state, &headers, &id).await?;
    Ok(Json(submission.into()))
}

/// DELETE /submissions/:id - Cancel a submission that has not started
pub async fn cancel_submission(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<SubmissionDetail>, ApiError> {
    let submission = owned_submission(&state, &headers, &id).await?;

    // The store transition decides; a worker that dequeues the id afterwards
    // sees a terminal record and skips it.
    let cancelled = match state.store.cancel(submission.id).await {
        Ok(record) => record,
        Err(e) => {
            metrics::CANCELLATIONS.with_label_values(&["refused"]).inc();
            return Err(e.into());
        }
    };
    if let Err(e) = state.queue.cancel(submission.id).await {
        warn!(submission_id = %submission.id, error = %e, "Failed to drop cancelled id from queue");
    }

    metrics::CANCELLATIONS.with_label_values(&["cancelled"]).inc();
    info!(submission_id = %submission.id, "Submission cancelled");
    Ok(Json(cancelled.into()))
}

/// GET /status - Health check endpoint
pub async fn health_check(State(state): State<Arc<AppState>>) -> Response {
    match state.queue.pending_len().await {
        Ok(pending) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ok",
                "pendingSubmissions": pending,
                "languages": state.languages.enabled_languages(),
            })),
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "status": "degraded" })),
            )
                .into_response()
        }
    }
}

/// GET /metrics - Prometheus text exposition
pub async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
}
