//! Job submission and result proxies.
//!
//! Thin pass-throughs over the backend's REST API. The result proxy is the
//! polling channel: clients that cannot stream (or whose streaming budget ran
//! out) fetch current status here instead. Backend error bodies are replaced
//! with generic messages so internal details never reach browsers.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::backend::BackendError;
use crate::state::AppState;
use crate::util;

/// Body of `POST /api/jobs`.
#[derive(Deserialize)]
pub struct SubmitRequest {
    pub code: String,
    pub language: String,
    pub filename: String,
}

/// `POST /api/jobs` — submit code for execution, returning `{job_id}`.
pub async fn submit(
    State(state): State<AppState>,
    Json(req): Json<SubmitRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if req.code.is_empty() || req.language.is_empty() || req.filename.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Missing required fields"})),
        ));
    }

    match state
        .backend
        .submit(&req.code, &req.language, &req.filename)
        .await
    {
        Ok(body) => Ok(Json(body)),
        Err(e) => {
            warn!(error = %e, "Submit proxy failed");
            Err(submit_rejection(&e))
        }
    }
}

/// `GET /api/jobs/{job_id}` — current status/result for a job.
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if !util::is_valid_job_id(&job_id) {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Invalid job ID"})),
        ));
    }

    match state.backend.get_result(&job_id).await {
        Ok(body) => Ok(Json(body)),
        Err(e) if e.is_not_found() => Err((
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Job not found"})),
        )),
        Err(e) => {
            warn!(job_id = %job_id, error = %e, "Result proxy failed");
            Err((
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": "Failed to fetch job result"})),
            ))
        }
    }
}

/// Map a backend submission failure to a browser-safe rejection.
fn submit_rejection(e: &BackendError) -> (StatusCode, Json<Value>) {
    match e {
        BackendError::Status { status: 400, .. } => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Invalid code submission"})),
        ),
        BackendError::Status {
            status: 401 | 403, ..
        } => (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "Authentication failed"})),
        ),
        BackendError::Status { status: 429, .. } => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"error": "Rate limit exceeded. Please try again later."})),
        ),
        _ => (
            StatusCode::BAD_GATEWAY,
            Json(json!({"error": "Service temporarily unavailable"})),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_rejection_maps_statuses() {
        let reject = |status| {
            submit_rejection(&BackendError::Status {
                status,
                message: String::new(),
            })
            .0
        };
        assert_eq!(reject(400), StatusCode::BAD_REQUEST);
        assert_eq!(reject(401), StatusCode::FORBIDDEN);
        assert_eq!(reject(403), StatusCode::FORBIDDEN);
        assert_eq!(reject(429), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(reject(500), StatusCode::BAD_GATEWAY);
    }
}
