//! REST route handlers and the shared rate-limit layer.

pub mod health;
pub mod jobs;
pub mod token;

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::warn;

use crate::state::AppState;
use crate::util;

/// Axum middleware applying the fixed-window rate limiter to every inbound
/// connection and upgrade attempt, before any other work. Layered over all
/// routes except `/api/health`.
pub async fn rate_limit(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let addr = util::client_addr(request.headers(), peer);
    if !state.rate_limiter.check_and_record(&addr).await {
        warn!(
            addr = %addr,
            path = %util::redact_query(&request.uri().to_string()),
            "Request rejected: rate limited"
        );
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"error": "Rate limit exceeded"})),
        )
            .into_response();
    }
    next.run(request).await
}
