//! Token issuance proxy.
//!
//! Browsers never hold the service credential; they ask the gateway for a
//! short-lived, job-scoped token and the gateway delegates to the backend's
//! issuance endpoint. Nothing is cached — a token exists only in the response.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};
use tracing::warn;

use crate::auth::AuthError;
use crate::state::AppState;
use crate::util;

/// `GET /api/ws_token/{job_id}` — issue a streaming token for one job.
pub async fn ws_token(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if !util::is_valid_job_id(&job_id) {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Invalid job ID"})),
        ));
    }

    match state.authenticator.issue(&job_id).await {
        Ok(token) => Ok(Json(json!({"token": token}))),
        Err(AuthError::Invalid) => Err((
            StatusCode::FORBIDDEN,
            Json(json!({"error": "Token issuance rejected"})),
        )),
        Err(AuthError::BackendUnavailable(detail)) => {
            warn!(job_id = %job_id, error = %detail, "Token issuance failed");
            Err((
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": "Token service unavailable"})),
            ))
        }
    }
}
